use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use common::{
    Candle, CandleSource, Error, HistoryReader, HistoryStore, PriceHistory, ReferenceSource,
    Result, FIELD_PRICE_BTC, FIELD_PRICE_USD, FIELD_VOLUME_USD, FIELD_WEIGHTED_AVERAGE,
};
use engine::{IngestConfig, MarketScraper, PairResult, REFERENCE_PAIR};
use history::{MemoryHistoryStore, SqliteHistoryStore};

const PERIOD: i64 = 900;

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_500_000_000 + secs, 0).unwrap()
}

fn candle(secs: i64, weighted_average: f64) -> Candle {
    Candle {
        time: ts(secs),
        open: weighted_average,
        high: weighted_average,
        low: weighted_average,
        close: weighted_average,
        volume: 2.0,
        quote_volume: 20.0,
        weighted_average,
    }
}

fn sentinel(secs: i64) -> Candle {
    Candle {
        volume: 0.0,
        weighted_average: 0.0,
        ..candle(secs, 0.0)
    }
}

enum Behaviour {
    Serve,
    Fail,
    Hang,
}

/// Exchange fake: serves fixed candles per pair, honouring the requested window.
struct FakeExchange {
    pairs: HashMap<String, (Behaviour, Vec<Candle>)>,
    requests: AtomicUsize,
}

impl FakeExchange {
    fn new(pairs: Vec<(&str, Behaviour, Vec<Candle>)>) -> Self {
        Self {
            pairs: pairs
                .into_iter()
                .map(|(pair, b, candles)| (pair.to_string(), (b, candles)))
                .collect(),
            requests: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CandleSource for FakeExchange {
    async fn tradable_pairs(&self) -> Result<Vec<String>> {
        let mut pairs: Vec<String> = self.pairs.keys().cloned().collect();
        pairs.sort();
        Ok(pairs)
    }

    async fn candles(
        &self,
        pair: &str,
        _period_secs: u32,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        match self.pairs.get(pair) {
            Some((Behaviour::Serve, candles)) => Ok(candles
                .iter()
                .filter(|c| c.time >= start && c.time <= end)
                .copied()
                .collect()),
            Some((Behaviour::Fail, _)) => Err(Error::Upstream("HTTP 502".into())),
            Some((Behaviour::Hang, _)) => {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Ok(Vec::new())
            }
            None => Err(Error::MalformedResponse("Invalid currency pair.".into())),
        }
    }
}

struct FakeReference(Option<PriceHistory>);

impl FakeReference {
    fn btc_at(samples: &[(i64, f64)]) -> Self {
        let mut history = PriceHistory::new();
        history.insert(FIELD_PRICE_USD, samples.iter().map(|s| (ts(s.0), s.1)).collect());
        history.insert(FIELD_PRICE_BTC, samples.iter().map(|s| (ts(s.0), 1.0)).collect());
        history.insert(FIELD_VOLUME_USD, samples.iter().map(|s| (ts(s.0), 1.0e9)).collect());
        Self(Some(history))
    }
}

#[async_trait]
impl ReferenceSource for FakeReference {
    async fn history(&self, _asset_id: &str) -> Result<PriceHistory> {
        self.0
            .clone()
            .ok_or_else(|| Error::MalformedResponse("empty body".into()))
    }
}

fn config() -> IngestConfig {
    IngestConfig {
        period_secs: PERIOD as u32,
        cold_start_lookback: chrono::Duration::days(1),
        request_timeout: Duration::from_secs(5),
        max_retries: 1,
        retry_backoff: Duration::from_millis(10),
        ..IngestConfig::default()
    }
}

fn scraper(
    exchange: Arc<FakeExchange>,
    reference: FakeReference,
    store: Arc<dyn HistoryStore>,
) -> MarketScraper {
    MarketScraper::new(exchange, Arc::new(reference), store, config())
}

#[tokio::test]
async fn cold_start_fills_the_lookback_and_drops_sentinels() {
    let store = Arc::new(MemoryHistoryStore::new());
    let exchange = Arc::new(FakeExchange::new(vec![(
        "BTC_ETH",
        Behaviour::Serve,
        vec![candle(0, 0.1), sentinel(PERIOD), candle(2 * PERIOD, 0.2)],
    )]));
    let reference =
        FakeReference::btc_at(&[(0, 2_000.0), (2 * PERIOD, 3_000.0), (2 * PERIOD + 600, 3_100.0)]);
    let scraper = scraper(exchange, reference, store.clone());

    let summary = scraper.scrape_until(ts(3 * PERIOD)).await.unwrap();

    assert_eq!(summary.since, ts(3 * PERIOD) - chrono::Duration::days(1));
    assert_eq!(
        summary.outcomes[0].result,
        PairResult::Scraped {
            fetched: 3,
            sentinels: 1,
            unpriced: 0,
            written: 2
        }
    );
    assert_eq!(summary.reference_points, 3);
    assert_eq!(summary.written(), 5);

    let prices = store
        .history("BTC_ETH", ts(3 * PERIOD), 1, FIELD_PRICE_USD)
        .await
        .unwrap();
    assert_eq!(prices, vec![(ts(2 * PERIOD), 600.0), (ts(0), 200.0)]);

    let reference = store.most_recent_reading().await.unwrap();
    assert_eq!(reference.pair, REFERENCE_PAIR);
    assert_eq!(reference.field(FIELD_WEIGHTED_AVERAGE), Some(3_100.0));
}

#[tokio::test]
async fn one_failing_pair_does_not_stop_the_others() {
    let store = Arc::new(MemoryHistoryStore::new());
    let exchange = Arc::new(FakeExchange::new(vec![
        ("BTC_ETH", Behaviour::Serve, vec![candle(0, 0.1)]),
        ("BTC_LTC", Behaviour::Fail, Vec::new()),
        ("BTC_XMR", Behaviour::Serve, vec![candle(0, 0.01)]),
    ]));
    let reference = FakeReference::btc_at(&[(0, 2_000.0)]);
    let scraper = scraper(exchange.clone(), reference, store.clone());

    let summary = scraper.scrape_until(ts(PERIOD)).await.unwrap();

    assert_eq!(summary.scraped(), 2);
    let failed: Vec<&str> = summary.failed().map(|o| o.pair.as_str()).collect();
    assert_eq!(failed, vec!["BTC_LTC"]);
    // The failing pair was retried once.
    assert_eq!(exchange.requests.load(Ordering::SeqCst), 4);

    let latest = store.latest_per_pair(ts(PERIOD)).await.unwrap();
    assert!(latest.contains_key("BTC_ETH"));
    assert!(latest.contains_key("BTC_XMR"));
    assert!(!latest.contains_key("BTC_LTC"));
}

#[tokio::test]
async fn reference_failure_writes_nothing() {
    let store = Arc::new(MemoryHistoryStore::new());
    let exchange = Arc::new(FakeExchange::new(vec![(
        "BTC_ETH",
        Behaviour::Serve,
        vec![candle(0, 0.1)],
    )]));
    let scraper = scraper(exchange.clone(), FakeReference(None), store.clone());

    let err = scraper.scrape_until(ts(PERIOD)).await.unwrap_err();

    assert!(matches!(err, Error::MalformedResponse(_)));
    assert!(store.is_empty().await);
    assert_eq!(exchange.requests.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn hung_pair_times_out_as_a_pair_failure() {
    let store = Arc::new(MemoryHistoryStore::new());
    let exchange = Arc::new(FakeExchange::new(vec![
        ("BTC_ETH", Behaviour::Hang, Vec::new()),
        ("BTC_LTC", Behaviour::Serve, vec![candle(0, 0.01)]),
    ]));
    let reference = FakeReference::btc_at(&[(0, 2_000.0)]);
    let scraper = scraper(exchange, reference, store.clone());

    let summary = scraper.scrape_until(ts(PERIOD)).await.unwrap();

    let failed: Vec<_> = summary.failed().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].pair, "BTC_ETH");
    assert!(matches!(
        &failed[0].result,
        PairResult::Failed { error } if error.contains("timed out")
    ));
    assert_eq!(summary.scraped(), 1);
}

#[tokio::test]
async fn immediate_rerun_is_idempotent() {
    let store = Arc::new(SqliteHistoryStore::in_memory().await.unwrap());
    let exchange = Arc::new(FakeExchange::new(vec![(
        "BTC_ETH",
        Behaviour::Serve,
        vec![candle(0, 0.1), candle(PERIOD, 0.1), candle(2 * PERIOD, 0.1)],
    )]));
    let reference = FakeReference::btc_at(&[(0, 2_000.0), (PERIOD, 2_100.0)]);
    let scraper = scraper(exchange, reference, store.clone());

    scraper.scrape_until(ts(3 * PERIOD)).await.unwrap();
    let first = store.most_recent_reading().await.unwrap();

    let summary = scraper.scrape_until(ts(3 * PERIOD)).await.unwrap();
    let second = store.most_recent_reading().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(summary.since, ts(2 * PERIOD));
    assert_eq!(summary.written(), 0);
}

fn busy_exchange() -> Arc<FakeExchange> {
    Arc::new(FakeExchange::new(vec![
        ("BTC_XMR", Behaviour::Serve, vec![candle(0, 0.01), candle(PERIOD, 0.02)]),
        ("BTC_LTC", Behaviour::Fail, Vec::new()),
        ("BTC_ETH", Behaviour::Serve, vec![candle(0, 0.1), sentinel(PERIOD)]),
        ("BTC_DOGE", Behaviour::Hang, Vec::new()),
        ("BTC_ZEC", Behaviour::Serve, vec![candle(PERIOD, 0.05)]),
    ]))
}

#[tokio::test(start_paused = true)]
async fn concurrent_scrape_matches_a_sequential_one() {
    let reference = || FakeReference::btc_at(&[(0, 2_000.0), (PERIOD, 2_200.0)]);

    let sequential_store = Arc::new(MemoryHistoryStore::new());
    let sequential = MarketScraper::new(
        busy_exchange(),
        Arc::new(reference()),
        sequential_store.clone(),
        IngestConfig {
            concurrency: 1,
            ..config()
        },
    );
    let concurrent_store = Arc::new(MemoryHistoryStore::new());
    let concurrent = MarketScraper::new(
        busy_exchange(),
        Arc::new(reference()),
        concurrent_store.clone(),
        IngestConfig {
            concurrency: 3,
            ..config()
        },
    );

    let expected = sequential.scrape_until(ts(2 * PERIOD)).await.unwrap();
    let summary = concurrent.scrape_until(ts(2 * PERIOD)).await.unwrap();

    let pairs: Vec<&str> = summary.outcomes.iter().map(|o| o.pair.as_str()).collect();
    assert_eq!(pairs, vec!["BTC_DOGE", "BTC_ETH", "BTC_LTC", "BTC_XMR", "BTC_ZEC"]);
    let failed: Vec<&str> = summary.failed().map(|o| o.pair.as_str()).collect();
    assert_eq!(failed, vec!["BTC_DOGE", "BTC_LTC"]);
    for (got, want) in summary.outcomes.iter().zip(&expected.outcomes) {
        assert_eq!(got.pair, want.pair);
        assert_eq!(got.result, want.result);
    }
    assert_eq!(summary.written(), expected.written());

    let latest = concurrent_store.latest_per_pair(ts(2 * PERIOD)).await.unwrap();
    assert_eq!(latest, sequential_store.latest_per_pair(ts(2 * PERIOD)).await.unwrap());
    for pair in ["BTC_ETH", "BTC_XMR", "BTC_ZEC", REFERENCE_PAIR] {
        assert_eq!(
            concurrent_store
                .history(pair, ts(2 * PERIOD), 1, FIELD_PRICE_USD)
                .await
                .unwrap(),
            sequential_store
                .history(pair, ts(2 * PERIOD), 1, FIELD_PRICE_USD)
                .await
                .unwrap()
        );
    }
}
