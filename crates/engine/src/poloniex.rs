use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use common::{Candle, CandleSource, Error, Result};

/// Public market-data client for Poloniex. Only unauthenticated endpoints are
/// used; nothing here can place orders.
pub struct PoloniexClient {
    base_url: String,
    timeout: Duration,
    http: Client,
}

impl PoloniexClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            http,
        })
    }

    async fn public_get(&self, params: &[(&str, String)]) -> Result<String> {
        let url = format!("{}/public", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| self.request_error(e))?;

        if !status.is_success() {
            return Err(Error::Upstream(format!("HTTP {status}: {body}")));
        }
        Ok(body)
    }

    fn request_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout(self.timeout)
        } else {
            Error::Http(e.to_string())
        }
    }
}

#[async_trait]
impl CandleSource for PoloniexClient {
    async fn tradable_pairs(&self) -> Result<Vec<String>> {
        let body = self
            .public_get(&[("command", "returnTicker".to_string())])
            .await?;
        parse_ticker(&body)
    }

    async fn candles(
        &self,
        pair: &str,
        period_secs: u32,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        debug!(pair, period_secs, start = %start, end = %end, "Requesting chart data");
        let body = self
            .public_get(&[
                ("command", "returnChartData".to_string()),
                ("currencyPair", pair.to_string()),
                ("period", period_secs.to_string()),
                ("start", start.timestamp().to_string()),
                ("end", end.timestamp().to_string()),
            ])
            .await?;
        parse_chart_data(&body)
    }
}

// ─── Response parsing ─────────────────────────────────────────────────────────

/// Poloniex reports failures as `{"error": "..."}` with a 200 status.
fn reject_error_body(value: &serde_json::Value) -> Result<()> {
    match value.get("error").and_then(|v| v.as_str()) {
        Some(msg) => Err(Error::MalformedResponse(format!("Poloniex error: {msg}"))),
        None => Ok(()),
    }
}

fn parse_ticker(body: &str) -> Result<Vec<String>> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| Error::MalformedResponse(e.to_string()))?;
    reject_error_body(&value)?;
    let tickers = value
        .as_object()
        .ok_or_else(|| Error::MalformedResponse("ticker response is not an object".into()))?;
    // serde_json maps are ordered by key unless `preserve_order` is enabled.
    Ok(tickers.keys().cloned().collect())
}

fn parse_chart_data(body: &str) -> Result<Vec<Candle>> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| Error::MalformedResponse(e.to_string()))?;
    reject_error_body(&value)?;
    let rows: Vec<ChartDataRow> =
        serde_json::from_value(value).map_err(|e| Error::MalformedResponse(e.to_string()))?;

    rows.into_iter()
        .map(|row| {
            let time = DateTime::from_timestamp(row.date, 0).ok_or_else(|| {
                Error::MalformedResponse(format!("candle date {} out of range", row.date))
            })?;
            Ok(Candle {
                time,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
                quote_volume: row.quote_volume,
                weighted_average: row.weighted_average,
            })
        })
        .collect()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartDataRow {
    date: i64,
    high: f64,
    low: f64,
    open: f64,
    close: f64,
    volume: f64,
    quote_volume: f64,
    weighted_average: f64,
}
