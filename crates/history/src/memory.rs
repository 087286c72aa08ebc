use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use common::{days_floor, window_floor, ChartPoint, Error, HistoryReader, HistoryStore, Result};

/// In-process chart history with the same semantics as the SQLite store,
/// including second-resolution timestamps and first-write-wins appends.
#[derive(Default)]
pub struct MemoryHistoryStore {
    /// pair -> time -> point
    points: RwLock<BTreeMap<String, BTreeMap<DateTime<Utc>, ChartPoint>>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.points.read().await.values().map(BTreeMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn to_second(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(t.timestamp(), 0).unwrap_or(t)
}

#[async_trait]
impl HistoryReader for MemoryHistoryStore {
    async fn most_recent_reading(&self) -> Result<ChartPoint> {
        let points = self.points.read().await;
        let mut best: Option<&ChartPoint> = None;
        for point in points.values().filter_map(|series| series.values().next_back()) {
            if best.map_or(true, |b| point.timestamp > b.timestamp) {
                best = Some(point);
            }
        }
        best.cloned().ok_or(Error::EmptyStore)
    }

    async fn latest_per_pair_within(
        &self,
        as_of: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<BTreeMap<String, ChartPoint>> {
        let (as_of, floor) = (to_second(as_of), to_second(window_floor(as_of, lookback)));
        let points = self.points.read().await;
        Ok(points
            .iter()
            .filter_map(|(pair, series)| {
                series
                    .range(..=as_of)
                    .next_back()
                    .filter(|(t, _)| **t > floor)
                    .map(|(_, point)| (pair.clone(), point.clone()))
            })
            .collect())
    }

    async fn history(
        &self,
        pair: &str,
        as_of: DateTime<Utc>,
        lookback_days: u32,
        field: &str,
    ) -> Result<Vec<(DateTime<Utc>, f64)>> {
        let as_of = to_second(as_of);
        let floor = days_floor(as_of, lookback_days);
        let points = self.points.read().await;
        let Some(series) = points.get(pair) else {
            return Ok(Vec::new());
        };
        Ok(series
            .range(..=as_of)
            .rev()
            .take_while(|(t, _)| **t > floor)
            .filter_map(|(t, point)| point.field(field).map(|v| (*t, v)))
            .collect())
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, points: &[ChartPoint]) -> Result<usize> {
        let mut stored = self.points.write().await;
        let mut written = 0;
        for point in points {
            let timestamp = to_second(point.timestamp);
            let series = stored.entry(point.pair.clone()).or_default();
            if !series.contains_key(&timestamp) {
                series.insert(
                    timestamp,
                    ChartPoint {
                        timestamp,
                        ..point.clone()
                    },
                );
                written += 1;
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common::{Fields, FIELD_PRICE_USD};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn point(pair: &str, secs: i64, price_usd: f64) -> ChartPoint {
        ChartPoint::new(
            pair,
            ts(secs),
            Fields::from([(FIELD_PRICE_USD.to_string(), price_usd)]),
        )
    }

    #[tokio::test]
    async fn empty_store_reports_empty() {
        let store = MemoryHistoryStore::new();
        assert!(matches!(
            store.most_recent_reading().await,
            Err(Error::EmptyStore)
        ));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn appends_are_first_write_wins() {
        let store = MemoryHistoryStore::new();
        assert_eq!(store.append(&[point("BTC_ETH", 900, 1.0)]).await.unwrap(), 1);
        assert_eq!(
            store
                .append(&[point("BTC_ETH", 900, 2.0), point("BTC_ETH", 1_800, 3.0)])
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.len().await, 2);
        assert_eq!(
            store.history("BTC_ETH", ts(1_800), 1, FIELD_PRICE_USD).await.unwrap(),
            vec![(ts(1_800), 3.0), (ts(900), 1.0)]
        );
    }

    #[tokio::test]
    async fn latest_per_pair_skips_pairs_outside_the_window() {
        let store = MemoryHistoryStore::new();
        store
            .append(&[
                point("BTC_ETH", 100_000, 1.0),
                point("BTC_ETH", 100_900, 2.0),
                point("BTC_LTC", 100_000 - 86_400, 3.0),
            ])
            .await
            .unwrap();

        let latest = store.latest_per_pair(ts(100_000)).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest["BTC_ETH"], point("BTC_ETH", 100_000, 1.0));
    }

    #[tokio::test]
    async fn most_recent_reading_prefers_first_pair_on_ties() {
        let store = MemoryHistoryStore::new();
        store
            .append(&[point("BTC_LTC", 500, 1.0), point("BTC_ETH", 500, 2.0)])
            .await
            .unwrap();
        assert_eq!(store.most_recent_reading().await.unwrap().pair, "BTC_ETH");
    }

    #[tokio::test]
    async fn maximal_lookback_returns_all_history() {
        let store = MemoryHistoryStore::new();
        store
            .append(&[point("BTC_ETH", 0, 1.0), point("BTC_ETH", 900, 2.0)])
            .await
            .unwrap();

        let values = store
            .history("BTC_ETH", ts(900), u32::MAX, FIELD_PRICE_USD)
            .await
            .unwrap();
        assert_eq!(values, vec![(ts(900), 2.0), (ts(0), 1.0)]);

        let latest = store
            .latest_per_pair_within(ts(900), Duration::days(i64::from(u32::MAX)))
            .await
            .unwrap();
        assert_eq!(latest.len(), 1);
    }
}
