//! Result writer: JSON report or flat CSV, written atomically.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use crate::models::{Exchange, ScanMode, ScanRecord, ScanReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Csv,
}

impl OutputFormat {
    /// Guess from the file extension; anything but `.csv` is JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => OutputFormat::Csv,
            _ => OutputFormat::Json,
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            other => Err(format!("unsupported output format '{}'", other)),
        }
    }
}

/// One record flattened for the output files. Column order is the CSV header order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRow {
    pub exchange: Exchange,
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub session_date: NaiveDate,
    pub session_high: f64,
    pub session_low: f64,
    pub midline: f64,
    pub midline_touched: bool,
    pub midline_touch_time: Option<DateTime<Utc>>,
    pub all_time_high: f64,
    pub all_time_low: f64,
    pub fib50: f64,
    pub fib50_touched: bool,
    pub fib50_touch_time: Option<DateTime<Utc>>,
}

impl From<&ScanRecord> for RecordRow {
    fn from(r: &ScanRecord) -> Self {
        Self {
            exchange: r.exchange,
            symbol: r.symbol.clone(),
            price: r.price,
            volume: r.volume,
            session_date: r.session.date,
            session_high: r.session.high,
            session_low: r.session.low,
            midline: r.midline_touch.level_price,
            midline_touched: r.midline_touch.touched,
            midline_touch_time: r.midline_touch.touch_time,
            all_time_high: r.range.all_time_high,
            all_time_low: r.range.all_time_low,
            fib50: r.fib50_touch.level_price,
            fib50_touched: r.fib50_touch.touched,
            fib50_touch_time: r.fib50_touch.touch_time,
        }
    }
}

#[derive(Debug, Serialize)]
struct ExchangeBlock<'a> {
    exchange: Exchange,
    success: bool,
    error: Option<&'a str>,
    duration_secs: f64,
    symbols_evaluated: usize,
    symbols_skipped: usize,
    records: Vec<RecordRow>,
}

#[derive(Debug, Serialize)]
struct ReportDocument<'a> {
    timestamp: DateTime<Utc>,
    mode: ScanMode,
    results: Vec<ExchangeBlock<'a>>,
}

impl<'a> From<&'a ScanReport> for ReportDocument<'a> {
    fn from(report: &'a ScanReport) -> Self {
        Self {
            timestamp: report.timestamp,
            mode: report.mode,
            results: report
                .exchanges
                .iter()
                .map(|e| ExchangeBlock {
                    exchange: e.exchange,
                    success: e.success,
                    error: e.error.as_deref(),
                    duration_secs: e.duration_secs,
                    symbols_evaluated: e.symbols_evaluated,
                    symbols_skipped: e.symbols_skipped,
                    records: e.records.iter().map(RecordRow::from).collect(),
                })
                .collect(),
        }
    }
}

pub fn render_json(report: &ScanReport) -> Result<String> {
    serde_json::to_string_pretty(&ReportDocument::from(report)).context("Failed to serialize report")
}

pub fn render_csv(report: &ScanReport) -> Result<String> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());

    // Header is written by hand so an empty report still has one.
    writer.write_record(CSV_COLUMNS)?;
    for record in report.records() {
        writer.serialize(RecordRow::from(record))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush CSV: {}", e))?;
    String::from_utf8(bytes).context("CSV output is not UTF-8")
}

const CSV_COLUMNS: [&str; 15] = [
    "exchange",
    "symbol",
    "price",
    "volume",
    "session_date",
    "session_high",
    "session_low",
    "midline",
    "midline_touched",
    "midline_touch_time",
    "all_time_high",
    "all_time_low",
    "fib50",
    "fib50_touched",
    "fib50_touch_time",
];

/// Write the report in `format`. Parent directories are created.
pub fn write_report(report: &ScanReport, path: impl AsRef<Path>, format: OutputFormat) -> Result<()> {
    let path = path.as_ref();
    let content = match format {
        OutputFormat::Json => render_json(report)?,
        OutputFormat::Csv => render_csv(report)?,
    };
    write_output_atomic(path, &content)?;

    info!(
        "💾 Wrote {} record(s) to {}",
        report.total_records(),
        path.display()
    );
    Ok(())
}

/// JSON report for loose records, grouped by exchange. Records are written as given.
pub fn write_records(records: &[ScanRecord], path: impl AsRef<Path>, timestamp: DateTime<Utc>) -> Result<()> {
    let report = ScanReport::from_records(timestamp, ScanMode::Full, records.to_vec());
    write_report(&report, path, OutputFormat::Json)
}

fn write_output_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    // Temp file then rename (atomic on POSIX)
    let temp_path = path.with_extension("tmp");
    let file = File::create(&temp_path)
        .with_context(|| format!("Failed to create temp file {}", temp_path.display()))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(content.as_bytes())
        .context("Failed to write output")?;
    writer.flush().context("Failed to flush output")?;
    drop(writer);

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename into {}", path.display()))?;
    Ok(())
}
