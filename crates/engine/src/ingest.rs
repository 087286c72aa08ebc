//! Incremental market-history ingestion.
//!
//! Each run catches the history store up from its most recent reading to
//! now: candles for every tradable pair are converted to USD against a
//! reference BTC/USD series, sentinel readings are dropped, and the reference
//! series itself is written under a synthetic pair.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use common::{
    Candle, CandleSource, ChartPoint, Config, Error, Fields, HistoryStore, PriceHistory,
    ReferenceSource, Result, FIELD_MARKET_CAP, FIELD_PRICE_BTC, FIELD_PRICE_USD, FIELD_VOLUME,
    FIELD_VOLUME_USD, FIELD_WEIGHTED_AVERAGE,
};

/// Synthetic pair under which the reference asset's own USD history is stored.
pub const REFERENCE_PAIR: &str = "USD_BTC";

const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Candle period in seconds.
    pub period_secs: u32,
    /// Asset id understood by the reference source, e.g. `bitcoin`.
    pub reference_asset: String,
    pub reference_pair: String,
    /// Window to fill when the store is empty.
    pub cold_start_lookback: chrono::Duration,
    /// Upper bound on any single upstream call.
    pub request_timeout: Duration,
    /// Extra attempts for a retryable upstream failure.
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// Pairs fetched at once. 1 means strictly sequential.
    pub concurrency: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            period_secs: 900,
            reference_asset: "bitcoin".to_string(),
            reference_pair: REFERENCE_PAIR.to_string(),
            cold_start_lookback: chrono::Duration::days(365),
            request_timeout: Duration::from_secs(30),
            max_retries: 2,
            retry_backoff: Duration::from_secs(1),
            concurrency: 1,
        }
    }
}

impl IngestConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            period_secs: cfg.scrape_period_secs,
            reference_asset: cfg.reference_asset.clone(),
            request_timeout: cfg.request_timeout,
            max_retries: cfg.scrape_max_retries,
            concurrency: cfg.scrape_concurrency.max(1),
            ..Self::default()
        }
    }
}

// ─── Run summary ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum PairResult {
    Scraped {
        /// Candles inside the catch-up window.
        fetched: usize,
        /// All-zero "nothing traded" readings that were dropped.
        sentinels: usize,
        /// Candles older than the first reference sample, which cannot be priced.
        unpriced: usize,
        /// Points the store did not already have.
        written: usize,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairOutcome {
    pub pair: String,
    pub result: PairResult,
}

#[derive(Debug, Clone)]
pub struct ScrapeSummary {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    /// One entry per tradable pair, ordered by pair.
    pub outcomes: Vec<PairOutcome>,
    /// Newly written reference-series points.
    pub reference_points: usize,
    pub elapsed: Duration,
}

impl ScrapeSummary {
    pub fn scraped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.result, PairResult::Scraped { .. }))
            .count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &PairOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.result, PairResult::Failed { .. }))
    }

    /// Points newly written across all pairs, reference series included.
    pub fn written(&self) -> usize {
        let pairs: usize = self
            .outcomes
            .iter()
            .map(|o| match o.result {
                PairResult::Scraped { written, .. } => written,
                PairResult::Failed { .. } => 0,
            })
            .sum();
        pairs + self.reference_points
    }

    pub fn log_summary(&self) {
        info!(
            since = %self.since,
            until = %self.until,
            pairs = self.outcomes.len(),
            scraped = self.scraped(),
            failed = self.failed().count(),
            written = self.written(),
            elapsed = format!("{:.1}s", self.elapsed.as_secs_f64()),
            "Market scrape complete"
        );
    }
}

// ─── Reconciliation ───────────────────────────────────────────────────────────

/// Candles of one pair turned into chart points.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PricedCandles {
    pub points: Vec<ChartPoint>,
    pub fetched: usize,
    pub sentinels: usize,
    pub unpriced: usize,
}

/// Convert candles in `[since, until)` to chart points with a `price_usd`
/// field: the candle's weighted average times the reference USD price carried
/// forward to the candle's time. Sentinel candles are dropped.
pub fn price_candles(
    pair: &str,
    candles: &[Candle],
    reference: &PriceHistory,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> PricedCandles {
    let mut priced = PricedCandles::default();
    for candle in candles.iter().filter(|c| c.time >= since && c.time < until) {
        priced.fetched += 1;
        if candle.is_sentinel() {
            priced.sentinels += 1;
            continue;
        }
        let Some(reference_usd) = reference.asof(FIELD_PRICE_USD, candle.time) else {
            priced.unpriced += 1;
            continue;
        };
        let mut fields = candle.fields();
        fields.insert(
            FIELD_PRICE_USD.to_string(),
            candle.weighted_average * reference_usd,
        );
        priced.points.push(ChartPoint::new(pair, candle.time, fields));
    }
    priced
}

/// Reshape the reference asset's market-cap history into chart points.
///
/// For every `price_usd` sample: `weightedAverage` is the USD price, `volume`
/// is re-denominated from USD into the reference asset as
/// `volume_usd / (price_usd / price_btc)`, and the market-cap and USD volume
/// fields are dropped. Every other field present at that instant is kept.
pub fn reconcile_reference(pair: &str, history: &PriceHistory) -> Result<Vec<ChartPoint>> {
    let prices = history.series(FIELD_PRICE_USD);
    if prices.is_empty() {
        return Err(Error::MalformedResponse(
            "reference history has no price_usd samples".into(),
        ));
    }

    let mut points = Vec::with_capacity(prices.len());
    for &(time, price_usd) in prices {
        let price_btc = history.at(FIELD_PRICE_BTC, time).ok_or_else(|| {
            Error::MalformedResponse(format!("reference history has no price_btc at {time}"))
        })?;
        let volume_usd = history.at(FIELD_VOLUME_USD, time).ok_or_else(|| {
            Error::MalformedResponse(format!("reference history has no volume_usd at {time}"))
        })?;

        let btc_to_usd = price_usd / price_btc;
        let volume = volume_usd / btc_to_usd;
        if !volume.is_finite() {
            warn!(
                time = %time,
                price_usd,
                price_btc,
                "Skipping reference sample with degenerate prices"
            );
            continue;
        }

        let mut fields: Fields = history
            .fields()
            .filter(|f| *f != FIELD_MARKET_CAP && *f != FIELD_VOLUME_USD)
            .filter_map(|f| history.at(f, time).map(|v| (f.to_string(), v)))
            .collect();
        fields.insert(FIELD_WEIGHTED_AVERAGE.to_string(), price_usd);
        fields.insert(FIELD_VOLUME.to_string(), volume);

        let point = ChartPoint::new(pair, time, fields);
        if point.is_sentinel() {
            continue;
        }
        points.push(point);
    }
    Ok(points)
}

// ─── Scraper ──────────────────────────────────────────────────────────────────

/// Brings the history store up to date with every tradable pair.
///
/// Upstream clients and the store are injected, so the scraper runs against
/// fakes in tests exactly as it does against the real services.
pub struct MarketScraper {
    candles: Arc<dyn CandleSource>,
    reference: Arc<dyn ReferenceSource>,
    store: Arc<dyn HistoryStore>,
    config: IngestConfig,
}

impl MarketScraper {
    pub fn new(
        candles: Arc<dyn CandleSource>,
        reference: Arc<dyn ReferenceSource>,
        store: Arc<dyn HistoryStore>,
        config: IngestConfig,
    ) -> Self {
        Self {
            candles,
            reference,
            store,
            config,
        }
    }

    pub async fn scrape_latest(&self) -> Result<ScrapeSummary> {
        self.scrape_until(Utc::now()).await
    }

    /// Fill `[since, until)` where `since` is the store's most recent reading.
    ///
    /// A reference-series failure aborts the run before anything is written.
    /// Per-pair failures are recorded in the summary and never stop the run.
    pub async fn scrape_until(&self, until: DateTime<Utc>) -> Result<ScrapeSummary> {
        let started = Instant::now();
        let since = self.since_time(until).await?;
        info!(since = %since, until = %until, "Scraping market history");

        let reference = self
            .with_retries(&self.config.reference_asset, || {
                self.reference.history(&self.config.reference_asset)
            })
            .await?;
        let reference_points = reconcile_reference(&self.config.reference_pair, &reference)?;

        let pairs = self
            .with_retries("tradable pairs", || self.candles.tradable_pairs())
            .await?;

        let mut outcomes: Vec<PairOutcome> = stream::iter(pairs)
            .map(|pair| self.scrape_pair(pair, &reference, since, until))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        outcomes.sort_by(|a, b| a.pair.cmp(&b.pair));

        let written = self.store.append(&reference_points).await?;
        info!(pair = %self.config.reference_pair, written, "Scraped reference series");

        Ok(ScrapeSummary {
            since,
            until,
            outcomes,
            reference_points: written,
            elapsed: started.elapsed(),
        })
    }

    /// Start of the catch-up window: the latest stored reading, or the
    /// cold-start lookback when the store is empty.
    pub async fn since_time(&self, until: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self.store.most_recent_reading().await {
            Ok(point) => Ok(point.timestamp),
            Err(Error::EmptyStore) => {
                info!(
                    lookback_days = self.config.cold_start_lookback.num_days(),
                    "History store is empty, starting from the cold-start lookback"
                );
                Ok(until - self.config.cold_start_lookback)
            }
            Err(e) => Err(e),
        }
    }

    async fn scrape_pair(
        &self,
        pair: String,
        reference: &PriceHistory,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> PairOutcome {
        let fetched = self
            .with_retries(&pair, || {
                self.candles
                    .candles(&pair, self.config.period_secs, since, until)
            })
            .await;

        let result = match fetched {
            Ok(candles) => {
                let priced = price_candles(&pair, &candles, reference, since, until);
                match self.store.append(&priced.points).await {
                    Ok(written) => {
                        info!(
                            pair = %pair,
                            fetched = priced.fetched,
                            sentinels = priced.sentinels,
                            written,
                            "Scraped pair"
                        );
                        if priced.unpriced > 0 {
                            debug!(
                                pair = %pair,
                                unpriced = priced.unpriced,
                                "Candles predate the reference series"
                            );
                        }
                        PairResult::Scraped {
                            fetched: priced.fetched,
                            sentinels: priced.sentinels,
                            unpriced: priced.unpriced,
                            written,
                        }
                    }
                    Err(e) => {
                        error!(pair = %pair, error = %e, "Failed to store scraped points");
                        PairResult::Failed {
                            error: e.to_string(),
                        }
                    }
                }
            }
            Err(e) => {
                warn!(pair = %pair, error = %e, "Skipping pair after failed fetch");
                PairResult::Failed {
                    error: e.to_string(),
                }
            }
        };

        PairOutcome { pair, result }
    }

    /// Run an upstream call under the request timeout, retrying retryable
    /// failures with exponential backoff.
    async fn with_retries<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.config.retry_backoff;
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.config.request_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(self.config.request_timeout)),
            };
            match result {
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        what,
                        attempt,
                        error = %e,
                        backoff = ?backoff,
                        "Upstream call failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                other => return other,
            }
        }
    }
}
