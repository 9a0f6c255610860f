//! Scan Aggregator
//!
//! Fans the per-symbol pipeline (ticker -> filter -> candles -> session /
//! extremum -> touches) out over every enabled exchange with bounded
//! concurrency, then merges the outcomes sequentially. A symbol either
//! completes fully or is omitted; only "no exchange reachable" is fatal.
//!
//! With market-cap discovery the symbol universe follows a coin ranking
//! instead of exchange volume; the same ranking resolves coin ids for the
//! optional long-history fallback.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::{Discovery, ScanConfig};
use crate::error::{ScanError, ScanResult};
use crate::models::{
    Candle, Exchange, ExchangeScanResult, ExtremumRange, Granularity, LevelName, ScanMode,
    ScanRecord, ScanReport, Ticker,
};
use crate::scrapers::{map_coin_to_symbols, CandleSource, CoinMarket, CoinUniverse};
use crate::signals::{candles_after, evaluate_touch, extract_session, most_recent_friday, session_bounds};

/// One symbol picked for an exchange, before it is bound to its source.
struct Candidate {
    symbol: String,
    /// Known when the symbol came from ticker discovery.
    ticker: Option<Ticker>,
    /// Ranking id, when a coin ranking was loaded and the symbol maps to it.
    coin_id: Option<String>,
}

struct SymbolJob {
    source: Arc<dyn CandleSource>,
    candidate: Candidate,
}

enum SymbolOutcome {
    Evaluated(ScanRecord),
    Filtered,
    Failed(ScanError),
}

/// Per-exchange bookkeeping while jobs complete.
struct ExchangeTally {
    result: ExchangeScanResult,
    planned: usize,
    completed: usize,
    network_failures: usize,
    explicit_symbols: bool,
    last_error: Option<String>,
    /// When the last planned symbol (or discovery, for empty plans) completed.
    finished_at: Option<Instant>,
}

impl ExchangeTally {
    fn new(exchange: Exchange, explicit_symbols: bool) -> Self {
        Self {
            result: ExchangeScanResult::new(exchange),
            planned: 0,
            completed: 0,
            network_failures: 0,
            explicit_symbols,
            last_error: None,
            finished_at: None,
        }
    }

    fn failed(exchange: Exchange, error: String, at: Instant) -> Self {
        Self {
            result: ExchangeScanResult::failed(exchange, error),
            finished_at: Some(at),
            ..Self::new(exchange, false)
        }
    }

    /// Exchanges cut off by the deadline end with the scan.
    fn finish(mut self, started: Instant, scan_end: Instant) -> ExchangeScanResult {
        let abandoned = self.planned.saturating_sub(self.completed);
        self.result.symbols_skipped += abandoned;
        let end = self.finished_at.unwrap_or(scan_end);
        self.result.duration_secs = end.saturating_duration_since(started).as_secs_f64();
        self.result.records.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        // Explicit symbol lists: the exchange counts as unreachable only when
        // every completed symbol failed at the transport level.
        if self.result.success
            && self.explicit_symbols
            && self.completed > 0
            && self.network_failures == self.completed
        {
            self.result.success = false;
            self.result.error = Some(format!(
                "all {} symbol request(s) failed: {}",
                self.completed,
                self.last_error.unwrap_or_default()
            ));
        }
        self.result
    }
}

pub struct Scanner {
    config: ScanConfig,
    sources: Vec<Arc<dyn CandleSource>>,
    coins: Option<Arc<dyn CoinUniverse>>,
}

/// Id of the first ranked coin that `symbol` quotes.
fn coin_for_symbol(ranking: &[CoinMarket], symbol: &str) -> Option<String> {
    let listed = [symbol.to_string()];
    ranking
        .iter()
        .find(|coin| !map_coin_to_symbols(&coin.symbol, &listed).is_empty())
        .map(|coin| coin.id.clone())
}

impl Scanner {
    /// `sources` are filtered to the enabled exchanges; the config is validated here.
    pub fn new(config: ScanConfig, sources: Vec<Arc<dyn CandleSource>>) -> ScanResult<Self> {
        config.validate()?;
        let sources = sources
            .into_iter()
            .filter(|s| config.enabled_exchanges.contains(&s.exchange()))
            .collect();
        Ok(Self {
            config,
            sources,
            coins: None,
        })
    }

    /// Coin ranking for market-cap discovery and the CoinGecko history fallback.
    pub fn with_coin_universe(mut self, coins: Arc<dyn CoinUniverse>) -> Self {
        self.coins = Some(coins);
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub async fn run(&self) -> ScanResult<ScanReport> {
        self.run_at(Utc::now()).await
    }

    /// Run one scan as of `now`.
    pub async fn run_at(&self, now: DateTime<Utc>) -> ScanResult<ScanReport> {
        let started = Instant::now();
        let deadline = started + self.config.scan_timeout();
        let friday = most_recent_friday(now, &self.config.asian_session);

        info!(
            exchanges = self.sources.len(),
            mode = self.config.mode.as_str(),
            session_date = %friday,
            "🔍 Starting scan"
        );

        let mut tallies: BTreeMap<Exchange, ExchangeTally> = BTreeMap::new();
        for exchange in &self.config.enabled_exchanges {
            if !self.sources.iter().any(|s| s.exchange() == *exchange) {
                tallies.insert(
                    *exchange,
                    ExchangeTally::failed(*exchange, "no client available".to_string(), started),
                );
            }
        }

        let ranking = self.ranking(deadline).await;
        let ranking = ranking.as_deref();

        // Symbol universe per exchange, discovered concurrently.
        let universes = join_all(self.sources.iter().map(|source| {
            let source = Arc::clone(source);
            async move {
                let res = timeout_at(deadline, self.universe(source.as_ref(), ranking)).await;
                (source, res, Instant::now())
            }
        }))
        .await;

        let mut jobs: Vec<SymbolJob> = Vec::new();
        for (source, res, at) in universes {
            let exchange = source.exchange();
            let explicit = !self.config.symbols_for(exchange).is_empty();
            match res {
                Ok(Ok(candidates)) => {
                    let mut tally = ExchangeTally::new(exchange, explicit);
                    tally.planned = candidates.len();
                    if candidates.is_empty() {
                        tally.finished_at = Some(at);
                    }
                    info!(%exchange, symbols = candidates.len(), "Symbol universe ready");
                    jobs.extend(candidates.into_iter().map(|candidate| SymbolJob {
                        source: Arc::clone(&source),
                        candidate,
                    }));
                    tallies.insert(exchange, tally);
                }
                Ok(Err(e)) => {
                    warn!(%exchange, error = %e, "Symbol discovery failed");
                    tallies.insert(exchange, ExchangeTally::failed(exchange, e.to_string(), at));
                }
                Err(_) => {
                    warn!(%exchange, "Symbol discovery timed out");
                    tallies.insert(
                        exchange,
                        ExchangeTally::failed(exchange, "symbol discovery timed out".to_string(), at),
                    );
                }
            }
        }

        let total_jobs = jobs.len();
        let mut pending = stream::iter(jobs)
            .map(|job| async move {
                let outcome = self.evaluate_symbol(&job, now).await;
                (job, outcome)
            })
            .buffer_unordered(self.config.max_concurrency);

        let mut finished = 0usize;
        loop {
            match timeout_at(deadline, pending.next()).await {
                Ok(Some((job, outcome))) => {
                    finished += 1;
                    let exchange = job.source.exchange();
                    if let Some(tally) = tallies.get_mut(&exchange) {
                        self.merge(tally, &job.candidate.symbol, outcome);
                        if tally.completed == tally.planned {
                            tally.finished_at = Some(Instant::now());
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        abandoned = total_jobs - finished,
                        timeout_secs = self.config.scan_timeout_secs,
                        "⏱️ Scan timeout reached, dropping unfinished symbols"
                    );
                    break;
                }
            }
        }
        // Cancels whatever is still in flight.
        drop(pending);

        let scan_end = Instant::now();
        let elapsed = scan_end.duration_since(started).as_secs_f64();
        let exchanges: Vec<ExchangeScanResult> = tallies
            .into_values()
            .map(|tally| tally.finish(started, scan_end))
            .collect();

        for block in &exchanges {
            let status = if block.success { "✓" } else { "✗" };
            info!(
                "{} {:10} | {:4} records | {:4} evaluated | {:4} skipped",
                status,
                block.exchange.as_str(),
                block.records.len(),
                block.symbols_evaluated,
                block.symbols_skipped
            );
        }

        if !exchanges.is_empty() && exchanges.iter().all(|e| !e.success) {
            let errors = exchanges
                .iter()
                .map(|e| format!("{}: {}", e.exchange, e.error.clone().unwrap_or_default()))
                .collect();
            return Err(ScanError::AllExchangesFailed(errors));
        }

        let report = ScanReport {
            timestamp: now,
            mode: self.config.mode,
            exchanges,
        };
        info!(records = report.total_records(), "✅ Scan finished in {:.2}s", elapsed);
        Ok(report)
    }

    /// Coin ranking, loaded once per scan when market-cap discovery or the
    /// CoinGecko history needs it. Without one, discovery is by volume and
    /// no history is extended.
    async fn ranking(&self, deadline: Instant) -> Option<Vec<CoinMarket>> {
        let wanted = self.config.discovery == Discovery::MarketCap || self.config.coingecko_history;
        if !wanted {
            return None;
        }
        let Some(coins) = &self.coins else {
            warn!("No coin ranking client configured, continuing without ranking");
            return None;
        };

        match timeout_at(deadline, coins.top_coins(self.config.market_cap_top)).await {
            Ok(Ok(ranking)) => {
                info!(coins = ranking.len(), "Coin ranking loaded");
                Some(ranking)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Coin ranking unavailable, continuing without ranking");
                None
            }
            Err(_) => {
                warn!("Coin ranking timed out, continuing without ranking");
                None
            }
        }
    }

    /// Configured symbols (ticker fetched later), else discovered tickers
    /// ordered by market-cap rank or by volume.
    async fn universe(
        &self,
        source: &dyn CandleSource,
        ranking: Option<&[CoinMarket]>,
    ) -> ScanResult<Vec<Candidate>> {
        let configured = self.config.symbols_for(source.exchange());
        if !configured.is_empty() {
            return Ok(configured
                .iter()
                .map(|symbol| Candidate {
                    symbol: symbol.clone(),
                    ticker: None,
                    coin_id: ranking.and_then(|r| coin_for_symbol(r, symbol)),
                })
                .collect());
        }

        let mut tickers: Vec<Ticker> = source
            .fetch_tickers()
            .await?
            .into_iter()
            .filter(|t| self.config.passes_filters(t.price, t.volume))
            .collect();
        tickers.sort_by(|a, b| b.volume.total_cmp(&a.volume));

        match (self.config.discovery, ranking) {
            (Discovery::MarketCap, Some(ranking)) => Ok(self.by_market_cap(ranking, tickers)),
            _ => {
                tickers.truncate(self.config.max_symbols_per_exchange);
                Ok(tickers
                    .into_iter()
                    .map(|t| Candidate {
                        coin_id: ranking.and_then(|r| coin_for_symbol(r, &t.symbol)),
                        symbol: t.symbol.clone(),
                        ticker: Some(t),
                    })
                    .collect())
            }
        }
    }

    /// One symbol per ranked coin that the exchange lists, in ranking order.
    fn by_market_cap(&self, ranking: &[CoinMarket], tickers: Vec<Ticker>) -> Vec<Candidate> {
        let listed: Vec<String> = tickers.iter().map(|t| t.symbol.clone()).collect();
        let mut picked: Vec<Candidate> = Vec::new();

        for coin in ranking {
            if picked.len() >= self.config.max_symbols_per_exchange {
                break;
            }
            let Some(symbol) = map_coin_to_symbols(&coin.symbol, &listed).into_iter().next() else {
                continue;
            };
            if picked.iter().any(|c| c.symbol == symbol) {
                continue;
            }
            picked.push(Candidate {
                ticker: tickers.iter().find(|t| t.symbol == symbol).cloned(),
                symbol,
                coin_id: Some(coin.id.clone()),
            });
        }
        picked
    }

    async fn evaluate_symbol(&self, job: &SymbolJob, now: DateTime<Utc>) -> SymbolOutcome {
        match self.pipeline(job, now).await {
            Ok(Some(record)) => SymbolOutcome::Evaluated(record),
            Ok(None) => SymbolOutcome::Filtered,
            Err(e) => SymbolOutcome::Failed(e),
        }
    }

    /// `Ok(None)` when the symbol fails the volume / price filters.
    async fn pipeline(&self, job: &SymbolJob, now: DateTime<Utc>) -> ScanResult<Option<ScanRecord>> {
        let source = job.source.as_ref();
        let symbol = job.candidate.symbol.as_str();

        let ticker = match &job.candidate.ticker {
            Some(t) => t.clone(),
            None => source.fetch_ticker(symbol).await?,
        };
        if !self.config.passes_filters(ticker.price, ticker.volume) {
            debug!(exchange = %source.exchange(), symbol, "Filtered out by volume/price");
            return Ok(None);
        }

        let range = &self.config.asian_session;
        let friday = most_recent_friday(now, range);
        let (session_start, _) = session_bounds(friday, range);
        let configured_start = self
            .config
            .history_days
            .map(|days| now - ChronoDuration::days(i64::from(days)));
        let history_start = configured_start.unwrap_or_else(|| source.history_floor());

        let (intraday, daily) = tokio::try_join!(
            source.fetch_candles(symbol, self.config.intraday_granularity, session_start, now),
            source.fetch_candles(symbol, Granularity::OneDay, history_start, now),
        )?;
        let daily = match &job.candidate.coin_id {
            Some(coin_id) if self.config.coingecko_history => {
                let start = configured_start.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
                self.extend_history(coin_id, daily, start, now).await
            }
            _ => daily,
        };

        let session = extract_session(&intraday, range, now)?;
        let extremes = ExtremumRange::from_daily(&daily)?;
        let after_session = candles_after(&intraday, session.end_time);

        Ok(Some(ScanRecord {
            exchange: source.exchange(),
            symbol: symbol.to_string(),
            price: ticker.price,
            volume: ticker.volume,
            session,
            range: extremes,
            midline_touch: evaluate_touch(LevelName::Midline, session.midline(), after_session),
            fib50_touch: evaluate_touch(LevelName::Fib50, extremes.fib50, after_session),
        }))
    }

    /// Prepend ranking-provider daily candles older than the exchange's first
    /// one. A failed lookup keeps the exchange history as is.
    async fn extend_history(
        &self,
        coin_id: &str,
        daily: Vec<Candle>,
        start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<Candle> {
        let Some(coins) = &self.coins else {
            return daily;
        };
        let first = daily.first().map_or(now, |c| c.open_time);
        if first <= start {
            return daily;
        }

        match coins.daily_history(coin_id, start, first).await {
            Ok(mut older) => {
                older.retain(|c| c.open_time >= start && c.open_time < first);
                debug!(coin_id, days = older.len(), "Daily history extended");
                older.extend(daily);
                older
            }
            Err(e) => {
                warn!(coin_id, error = %e, "Long history unavailable");
                daily
            }
        }
    }

    fn merge(&self, tally: &mut ExchangeTally, symbol: &str, outcome: SymbolOutcome) {
        tally.completed += 1;
        let exchange = tally.result.exchange;
        match outcome {
            SymbolOutcome::Evaluated(record) => {
                tally.result.symbols_evaluated += 1;
                let emit = match self.config.mode {
                    ScanMode::Full => true,
                    ScanMode::SignalsOnly => record.has_signal(),
                };
                if emit {
                    if record.has_signal() {
                        info!(
                            %exchange,
                            symbol,
                            midline = record.midline_touch.touched,
                            fib50 = record.fib50_touch.touched,
                            "🎯 Level touched"
                        );
                    }
                    tally.result.records.push(record);
                }
            }
            SymbolOutcome::Filtered => {
                tally.result.symbols_skipped += 1;
            }
            SymbolOutcome::Failed(e) => {
                tally.result.symbols_skipped += 1;
                if e.is_network() {
                    tally.network_failures += 1;
                }
                warn!(%exchange, symbol, kind = e.kind(), error = %e, "Symbol skipped");
                tally.last_error = Some(e.to_string());
            }
        }
    }
}
