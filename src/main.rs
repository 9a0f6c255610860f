//! Trade Scanner CLI
//!
//! One scan over the enabled exchanges, written to a JSON or CSV file.
//!
//! # Usage
//!
//! ```bash
//! trade-scanner --exchanges binance,kraken --min-volume 5000 --mode full \
//!   --output out/results.json
//!
//! # Top 50 coins by market cap, full history, logs mirrored to a file
//! trade-scanner --discovery market-cap --market-cap-top 50 --log-file logs/scan.log
//! ```
//!
//! # Exit Codes
//!
//! - 0: Success (possibly with zero records)
//! - 2: Configuration or validation error
//! - 3: Fatal scan error (no exchange reachable) or output write failure

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trade_scanner::config::{parse_time_of_day, Discovery, ScanConfig, SessionRange};
use trade_scanner::models::{Exchange, ScanMode, ScanReport};
use trade_scanner::output::{write_report, OutputFormat};
use trade_scanner::scanner::Scanner;
use trade_scanner::scrapers::{build_coin_universe, build_sources};

// =============================================================================
// CLI ARGUMENTS
// =============================================================================

#[derive(Parser, Debug)]
#[command(name = "trade-scanner")]
#[command(about = "Scan exchanges for Friday Asian-session midline and fib50 touches")]
struct Args {
    /// TOML or JSON configuration file
    #[arg(short, long, env = "SCANNER_CONFIG")]
    config: Option<PathBuf>,

    /// Exchanges to scan (comma separated)
    #[arg(long, env = "SCANNER_EXCHANGES", value_enum, value_delimiter = ',')]
    exchanges: Vec<Exchange>,

    /// Symbols to scan on every selected exchange; empty = discover by volume
    #[arg(long, env = "SCANNER_SYMBOLS", value_delimiter = ',')]
    symbols: Vec<String>,

    /// Minimum 24h volume
    #[arg(long, env = "SCANNER_MIN_VOLUME")]
    min_volume: Option<f64>,

    /// Minimum last price
    #[arg(long, env = "SCANNER_MIN_PRICE")]
    min_price: Option<f64>,

    /// signals = only symbols with a touched level, full = every evaluated symbol
    #[arg(long, env = "SCANNER_MODE", value_enum)]
    mode: Option<ScanMode>,

    /// Asian session start, UTC HH:MM
    #[arg(long, env = "SCANNER_SESSION_START")]
    session_start: Option<String>,

    /// Asian session end, UTC HH:MM
    #[arg(long, env = "SCANNER_SESSION_END")]
    session_end: Option<String>,

    /// Overall scan timeout in seconds
    #[arg(long, env = "SCANNER_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// Maximum symbols evaluated concurrently
    #[arg(long, env = "SCANNER_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Days of daily history for the all-time range; omit for full history
    #[arg(long, env = "SCANNER_HISTORY_DAYS")]
    history_days: Option<u32>,

    /// Symbol discovery: volume (per exchange) or market-cap (CoinGecko ranking)
    #[arg(long, env = "SCANNER_DISCOVERY", value_enum)]
    discovery: Option<Discovery>,

    /// Coins taken from the market-cap ranking
    #[arg(long, env = "SCANNER_MARKET_CAP_TOP")]
    market_cap_top: Option<usize>,

    /// Extend exchange daily history with older CoinGecko prices
    #[arg(long, env = "SCANNER_COINGECKO_HISTORY")]
    coingecko_history: bool,

    /// Output file
    #[arg(short, long, env = "SCANNER_OUTPUT", default_value = "out/results.json")]
    output: PathBuf,

    /// Output format; defaults to the output file extension
    #[arg(long, env = "SCANNER_FORMAT", value_enum)]
    format: Option<OutputFormat>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, env = "SCANNER_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Also append logs (without colors) to this file
    #[arg(long, env = "SCANNER_LOG_FILE")]
    log_file: Option<PathBuf>,
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() {
    load_env();
    let args = Args::parse();
    if let Err(e) = init_tracing(&args.log_level, args.log_file.as_deref()) {
        eprintln!("❌ Failed to set up logging: {:#}", e);
        std::process::exit(2);
    }

    let code = run(args).await;
    std::process::exit(code);
}

async fn run(args: Args) -> i32 {
    let config = match build_config(&args) {
        Ok(c) => c,
        Err(e) => {
            error!("❌ Configuration error: {:#}", e);
            return 2;
        }
    };

    let sources = match build_sources(&config) {
        Ok(s) => s,
        Err(e) => {
            error!("❌ Failed to build exchange clients: {}", e);
            return 2;
        }
    };

    let coins = match build_coin_universe(&config) {
        Ok(c) => c,
        Err(e) => {
            error!("❌ Failed to build CoinGecko client: {}", e);
            return 2;
        }
    };

    let scanner = match Scanner::new(config, sources) {
        Ok(s) => match coins {
            Some(coins) => s.with_coin_universe(coins),
            None => s,
        },
        Err(e) => {
            error!("❌ Configuration error: {}", e);
            return 2;
        }
    };

    info!("🚀 Trade scanner starting");
    let report = match scanner.run().await {
        Ok(r) => r,
        Err(e) => {
            error!("❌ Scan failed: {}", e);
            return 3;
        }
    };

    let format = args
        .format
        .unwrap_or_else(|| OutputFormat::from_path(&args.output));
    if let Err(e) = write_report(&report, &args.output, format) {
        error!("❌ Failed to write output: {:#}", e);
        return 3;
    }

    print_summary(&report, &args.output);
    0
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Defaults, then the config file, then environment / CLI overrides.
fn build_config(args: &Args) -> Result<ScanConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading config from {}", path.display());
            ScanConfig::from_file(path)?
        }
        None => ScanConfig::default(),
    };

    if !args.exchanges.is_empty() {
        config.enabled_exchanges = args.exchanges.iter().copied().collect();
    }
    if !args.symbols.is_empty() {
        let symbols: Vec<String> = args
            .symbols
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        for exchange in &config.enabled_exchanges {
            config.symbols.insert(*exchange, symbols.clone());
        }
    }
    if let Some(v) = args.min_volume {
        config.min_volume = v;
    }
    if let Some(v) = args.min_price {
        config.min_price = v;
    }
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if args.session_start.is_some() || args.session_end.is_some() {
        let start = match &args.session_start {
            Some(raw) => parse_time_of_day(raw)?,
            None => config.asian_session.start,
        };
        let end = match &args.session_end {
            Some(raw) => parse_time_of_day(raw)?,
            None => config.asian_session.end,
        };
        config.asian_session = SessionRange::new(start, end)?;
    }
    if let Some(secs) = args.timeout_secs {
        config.scan_timeout_secs = secs;
    }
    if let Some(n) = args.concurrency {
        config.max_concurrency = n;
    }
    if args.history_days.is_some() {
        config.history_days = args.history_days;
    }
    if let Some(discovery) = args.discovery {
        config.discovery = discovery;
    }
    if let Some(n) = args.market_cap_top {
        config.market_cap_top = n;
    }
    if args.coingecko_history {
        config.coingecko_history = true;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the crate root
    let _ = dotenv::dotenv();

    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}

fn init_tracing(log_level: &str, log_file: Option<&Path>) -> Result<()> {
    let fallback = format!("trade_scanner={}", log_level.to_lowercase());
    let file_layer = match log_file {
        Some(path) => Some(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(open_log_file(path)?))
                .with_ansi(false),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    if let Some(path) = log_file {
        info!("Logging to file: {}", path.display());
    }
    Ok(())
}

/// Append-mode log file; parent directories are created.
fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

fn print_summary(report: &ScanReport, output: &Path) {
    eprintln!("\n{}", "=".repeat(70));
    eprintln!("SCAN SUMMARY");
    eprintln!("{}", "=".repeat(70));
    eprintln!("Timestamp:          {}", report.timestamp.to_rfc3339());
    eprintln!("Mode:               {}", report.mode.as_str());
    for block in &report.exchanges {
        let status = match &block.error {
            None => "ok".to_string(),
            Some(e) => format!("failed ({})", e),
        };
        eprintln!(
            "{:<20}{} records, {} evaluated, {} skipped, {:.1}s, {}",
            format!("{}:", block.exchange),
            block.records.len(),
            block.symbols_evaluated,
            block.symbols_skipped,
            block.duration_secs,
            status
        );
    }
    eprintln!("Total Records:      {}", report.total_records());
    eprintln!("Output:             {}", output.display());
    eprintln!("{}", "=".repeat(70));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        let mut full = vec!["trade-scanner"];
        full.extend_from_slice(argv);
        Args::try_parse_from(full).unwrap()
    }

    #[test]
    fn test_cli_overrides_defaults() {
        let args = parse(&[
            "--exchanges",
            "binance,kraken",
            "--symbols",
            "BTCUSDT, ETHUSDT",
            "--min-volume",
            "5000",
            "--mode",
            "full",
            "--session-start",
            "01:00",
            "--concurrency",
            "2",
        ]);
        let config = build_config(&args).unwrap();

        assert_eq!(config.enabled_exchanges.len(), 2);
        assert!(!config.enabled_exchanges.contains(&Exchange::Coinbase));
        assert_eq!(config.symbols_for(Exchange::Kraken), ["BTCUSDT", "ETHUSDT"]);
        assert_eq!(config.min_volume, 5000.0);
        assert_eq!(config.mode, ScanMode::Full);
        assert_eq!(config.asian_session.start.to_string(), "01:00:00");
        assert_eq!(config.asian_session.end.to_string(), "08:00:00");
        assert_eq!(config.max_concurrency, 2);
    }

    #[test]
    fn test_signals_mode_name() {
        let args = parse(&["--mode", "signals"]);
        assert_eq!(args.mode, Some(ScanMode::SignalsOnly));
    }

    #[test]
    fn test_inverted_session_rejected() {
        let args = parse(&["--session-start", "09:00", "--session-end", "08:00"]);
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn test_history_and_discovery_flags() {
        let args = parse(&[
            "--history-days",
            "365",
            "--discovery",
            "market-cap",
            "--market-cap-top",
            "25",
            "--coingecko-history",
        ]);
        let config = build_config(&args).unwrap();

        assert_eq!(config.history_days, Some(365));
        assert_eq!(config.discovery, Discovery::MarketCap);
        assert_eq!(config.market_cap_top, 25);
        assert!(config.coingecko_history);

        let defaults = build_config(&parse(&[])).unwrap();
        assert_eq!(defaults.history_days, None);
        assert_eq!(defaults.discovery, Discovery::Volume);
    }

    #[test]
    fn test_log_file_created_with_parents_and_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/nested/scan.log");
        assert_eq!(parse(&["--log-file", path.to_str().unwrap()]).log_file, Some(path.clone()));

        {
            use std::io::Write;
            let mut file = open_log_file(&path).unwrap();
            writeln!(file, "first").unwrap();
            let mut again = open_log_file(&path).unwrap();
            writeln!(again, "second").unwrap();
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let args = parse(&["--concurrency", "0"]);
        assert!(build_config(&args).is_err());
    }
}
