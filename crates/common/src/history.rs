use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::{ChartPoint, Result};

/// Default lookback, in days, for `latest_per_pair`.
pub const LATEST_LOOKBACK_DAYS: i64 = 1;

/// Exclusive lower bound of a `(as_of - lookback, as_of]` window. Saturates at
/// the earliest representable time instead of overflowing.
pub fn window_floor(as_of: DateTime<Utc>, lookback: Duration) -> DateTime<Utc> {
    as_of
        .checked_sub_signed(lookback)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `window_floor` for a lookback in whole days.
pub fn days_floor(as_of: DateTime<Utc>, lookback_days: u32) -> DateTime<Utc> {
    window_floor(as_of, Duration::days(i64::from(lookback_days)))
}

/// Read side of the scraped chart history. This is all a strategy gets.
#[async_trait]
pub trait HistoryReader: Send + Sync {
    /// The single latest point across all pairs.
    /// Fails with `Error::EmptyStore` when nothing has been written yet.
    async fn most_recent_reading(&self) -> Result<ChartPoint>;

    /// For every pair, the latest point in `(as_of - lookback, as_of]`.
    /// Pairs without a reading in that window are absent.
    async fn latest_per_pair_within(
        &self,
        as_of: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<BTreeMap<String, ChartPoint>>;

    /// `field` values for `pair` in `(as_of - lookback_days, as_of]`,
    /// most recent first. Points without `field` are skipped.
    async fn history(
        &self,
        pair: &str,
        as_of: DateTime<Utc>,
        lookback_days: u32,
        field: &str,
    ) -> Result<Vec<(DateTime<Utc>, f64)>>;

    async fn latest_per_pair(&self, as_of: DateTime<Utc>) -> Result<BTreeMap<String, ChartPoint>> {
        self.latest_per_pair_within(as_of, Duration::days(LATEST_LOOKBACK_DAYS))
            .await
    }

    /// `history` for the pair `{base}_{quote}`.
    async fn asset_history(
        &self,
        as_of: DateTime<Utc>,
        base: &str,
        quote: &str,
        lookback_days: u32,
        field: &str,
    ) -> Result<Vec<(DateTime<Utc>, f64)>> {
        let pair = format!("{base}_{quote}");
        self.history(&pair, as_of, lookback_days, field).await
    }
}

/// Append-only write side. Only the ingestion engine writes.
#[async_trait]
pub trait HistoryStore: HistoryReader {
    /// Append points. Points whose `(pair, timestamp)` is already stored are
    /// ignored, so overlapping ranges are safe. Returns how many were new.
    async fn append(&self, points: &[ChartPoint]) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn huge_lookbacks_saturate_instead_of_overflowing() {
        let as_of = Utc.with_ymd_and_hms(2017, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(days_floor(as_of, u32::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(window_floor(as_of, Duration::weeks(1_000_000_000)), DateTime::<Utc>::MIN_UTC);
        assert_eq!(days_floor(as_of, 1), as_of - Duration::days(1));
    }
}
