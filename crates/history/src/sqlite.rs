use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use common::{
    days_floor, window_floor, ChartPoint, Error, Fields, HistoryReader, HistoryStore, Result,
};

/// SQLite-backed chart history.
///
/// Each row is one `(currency_pair, time)` reading with its fields stored as a
/// JSON object. The primary key makes appends idempotent: re-scraping an
/// overlapping window never duplicates or overwrites a reading.
#[derive(Clone)]
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    /// Open (creating if missing) the database at `url` and apply migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::migrated(pool).await
    }

    /// Private in-memory database. The pool is pinned to one connection that
    /// never expires, since every SQLite memory connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("../../migrations").run(&pool).await?;
        info!("History store ready");
        Ok(Self { pool })
    }
}

#[async_trait]
impl HistoryReader for SqliteHistoryStore {
    async fn most_recent_reading(&self) -> Result<ChartPoint> {
        let row = sqlx::query(
            r#"
            SELECT currency_pair, time, fields FROM scraped_chart
            ORDER BY time DESC, currency_pair ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => decode_point(&row),
            None => Err(Error::EmptyStore),
        }
    }

    async fn latest_per_pair_within(
        &self,
        as_of: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<BTreeMap<String, ChartPoint>> {
        let rows = sqlx::query(
            r#"
            SELECT currency_pair, time, fields FROM scraped_chart
            WHERE time <= ?1 AND time > ?2
            ORDER BY currency_pair ASC, time DESC
            "#,
        )
        .bind(as_of.timestamp())
        .bind(window_floor(as_of, lookback).timestamp())
        .fetch_all(&self.pool)
        .await?;

        let mut latest = BTreeMap::new();
        for row in &rows {
            let point = decode_point(row)?;
            // Rows arrive newest first within a pair; keep the first one.
            latest.entry(point.pair.clone()).or_insert(point);
        }
        Ok(latest)
    }

    async fn history(
        &self,
        pair: &str,
        as_of: DateTime<Utc>,
        lookback_days: u32,
        field: &str,
    ) -> Result<Vec<(DateTime<Utc>, f64)>> {
        let since = days_floor(as_of, lookback_days);
        let rows = sqlx::query(
            r#"
            SELECT currency_pair, time, fields FROM scraped_chart
            WHERE currency_pair = ?1 AND time <= ?2 AND time > ?3
            ORDER BY time DESC
            "#,
        )
        .bind(pair)
        .bind(as_of.timestamp())
        .bind(since.timestamp())
        .fetch_all(&self.pool)
        .await?;

        let mut values = Vec::with_capacity(rows.len());
        for row in &rows {
            let point = decode_point(row)?;
            if let Some(value) = point.field(field) {
                values.push((point.timestamp, value));
            }
        }
        Ok(values)
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn append(&self, points: &[ChartPoint]) -> Result<usize> {
        if points.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for point in points {
            let fields = serde_json::to_string(&point.fields)?;
            let result = sqlx::query(
                r#"
                INSERT INTO scraped_chart (currency_pair, time, fields)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(currency_pair, time) DO NOTHING
                "#,
            )
            .bind(&point.pair)
            .bind(point.timestamp.timestamp())
            .bind(fields)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }
        tx.commit().await?;

        debug!(offered = points.len(), written, "Appended chart points");
        Ok(written as usize)
    }
}

fn decode_point(row: &SqliteRow) -> Result<ChartPoint> {
    let pair: String = row.try_get("currency_pair")?;
    let time: i64 = row.try_get("time")?;
    let fields: String = row.try_get("fields")?;

    let timestamp = DateTime::from_timestamp(time, 0).ok_or_else(|| {
        Error::Database(sqlx::Error::Decode(
            format!("stored time {time} for {pair} is out of range").into(),
        ))
    })?;
    let fields: Fields = serde_json::from_str(&fields)?;

    Ok(ChartPoint::new(pair, timestamp, fields))
}
