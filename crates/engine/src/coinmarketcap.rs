use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::Client;

use common::{Error, PriceHistory, ReferenceSource, Result, FIELD_PRICE_USD};

/// Client for the CoinMarketCap graphs endpoint, which serves the full
/// market-cap history of a currency as `{field: [[unix_ms, value], ...]}`.
pub struct CoinMarketCapClient {
    base_url: String,
    timeout: Duration,
    http: Client,
}

impl CoinMarketCapClient {
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
}

#[async_trait]
impl ReferenceSource for CoinMarketCapClient {
    async fn history(&self, asset_id: &str) -> Result<PriceHistory> {
        let url = format!("{}/currencies/{asset_id}/", self.base_url);
        let resp = self.http.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(self.timeout)
            } else {
                Error::Http(e.to_string())
            }
        })?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Upstream(format!("HTTP {status}: {body}")));
        }
        parse_graph(&body)
    }
}

fn parse_graph(body: &str) -> Result<PriceHistory> {
    let raw: BTreeMap<String, Vec<(i64, f64)>> =
        serde_json::from_str(body).map_err(|e| Error::MalformedResponse(e.to_string()))?;

    let mut history = PriceHistory::new();
    for (field, samples) in raw {
        let samples = samples
            .into_iter()
            .map(|(ms, value)| {
                DateTime::from_timestamp_millis(ms)
                    .map(|t| (t, value))
                    .ok_or_else(|| {
                        Error::MalformedResponse(format!("{field}: time {ms} out of range"))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        history.insert(field, samples);
    }

    if history.series(FIELD_PRICE_USD).is_empty() {
        return Err(Error::MalformedResponse(
            "reference history has no price_usd samples".into(),
        ));
    }
    Ok(history)
}
