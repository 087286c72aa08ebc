use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const FIELD_OPEN: &str = "open";
pub const FIELD_HIGH: &str = "high";
pub const FIELD_LOW: &str = "low";
pub const FIELD_CLOSE: &str = "close";
pub const FIELD_VOLUME: &str = "volume";
pub const FIELD_QUOTE_VOLUME: &str = "quoteVolume";
pub const FIELD_WEIGHTED_AVERAGE: &str = "weightedAverage";
pub const FIELD_PRICE_USD: &str = "price_usd";
pub const FIELD_PRICE_BTC: &str = "price_btc";
pub const FIELD_MARKET_CAP: &str = "market_cap_by_available_supply";
pub const FIELD_VOLUME_USD: &str = "volume_usd";

/// Named numeric measurements of one chart point.
pub type Fields = BTreeMap<String, f64>;

/// Split a `QUOTE_BASE` pair identifier, e.g. `BTC_ETH` -> (`BTC`, `ETH`).
pub fn split_pair(pair: &str) -> Option<(&str, &str)> {
    let (quote, base) = pair.split_once('_')?;
    if quote.is_empty() || base.is_empty() {
        return None;
    }
    Some((quote, base))
}

/// One scraped observation for a pair at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub pair: String,
    pub timestamp: DateTime<Utc>,
    pub fields: Fields,
}

impl ChartPoint {
    pub fn new(pair: impl Into<String>, timestamp: DateTime<Utc>, fields: Fields) -> Self {
        Self {
            pair: pair.into(),
            timestamp,
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied()
    }

    /// The exchange reports an all-zero reading when nothing traded in a period.
    /// Such points must never be persisted.
    pub fn is_sentinel(&self) -> bool {
        self.field(FIELD_VOLUME) == Some(0.0) && self.field(FIELD_WEIGHTED_AVERAGE) == Some(0.0)
    }
}

/// One fixed-period candlestick as reported by the exchange, priced in the
/// pair's quote asset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub weighted_average: f64,
}

impl Candle {
    pub fn is_sentinel(&self) -> bool {
        self.volume == 0.0 && self.weighted_average == 0.0
    }

    /// Chart fields for this candle, without any USD conversion.
    pub fn fields(&self) -> Fields {
        Fields::from([
            (FIELD_OPEN.to_string(), self.open),
            (FIELD_HIGH.to_string(), self.high),
            (FIELD_LOW.to_string(), self.low),
            (FIELD_CLOSE.to_string(), self.close),
            (FIELD_VOLUME.to_string(), self.volume),
            (FIELD_QUOTE_VOLUME.to_string(), self.quote_volume),
            (FIELD_WEIGHTED_AVERAGE.to_string(), self.weighted_average),
        ])
    }
}

/// Time-indexed history of an asset, one ascending series per field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceHistory {
    series: BTreeMap<String, Vec<(DateTime<Utc>, f64)>>,
}

impl PriceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a field's series. Samples are sorted by time.
    pub fn insert(&mut self, field: impl Into<String>, mut samples: Vec<(DateTime<Utc>, f64)>) {
        samples.sort_by_key(|(t, _)| *t);
        self.series.insert(field.into(), samples);
    }

    pub fn series(&self, field: &str) -> &[(DateTime<Utc>, f64)] {
        self.series.get(field).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    /// Value of `field` at the latest sample taken at or before `at`.
    /// Never interpolates and never looks into the future.
    pub fn asof(&self, field: &str, at: DateTime<Utc>) -> Option<f64> {
        let samples = self.series(field);
        let idx = samples.partition_point(|(t, _)| *t <= at);
        idx.checked_sub(1).map(|i| samples[i].1)
    }

    /// Exact-time lookup.
    pub fn at(&self, field: &str, at: DateTime<Utc>) -> Option<f64> {
        let samples = self.series(field);
        samples
            .binary_search_by_key(&at, |(t, _)| *t)
            .ok()
            .map(|i| samples[i].1)
    }
}

/// Point-in-time view of the fund handed to a strategy.
///
/// Built fresh by the market adapter for every step. Strategies only ever see
/// a shared borrow of it, so nothing a strategy does reaches the adapter except
/// the trades it proposes.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketState {
    time: DateTime<Utc>,
    fiat: String,
    balances: BTreeMap<String, f64>,
    chart_data: BTreeMap<String, ChartPoint>,
}

impl MarketState {
    pub fn new(
        time: DateTime<Utc>,
        fiat: impl Into<String>,
        balances: BTreeMap<String, f64>,
        chart_data: BTreeMap<String, ChartPoint>,
    ) -> Self {
        Self {
            time,
            fiat: fiat.into(),
            balances,
            chart_data,
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Asset the fund measures itself against and trades out of.
    pub fn fiat(&self) -> &str {
        &self.fiat
    }

    pub fn balances(&self) -> &BTreeMap<String, f64> {
        &self.balances
    }

    pub fn balance(&self, asset: &str) -> f64 {
        self.balances.get(asset).copied().unwrap_or(0.0)
    }

    pub fn chart_data(&self) -> &BTreeMap<String, ChartPoint> {
        &self.chart_data
    }

    /// Assets with a strictly positive balance.
    pub fn held_assets(&self) -> impl Iterator<Item = &str> {
        self.balances
            .iter()
            .filter(|(_, amount)| **amount > 0.0)
            .map(|(asset, _)| asset.as_str())
    }

    /// Assets that have a chart point in this snapshot, deduplicated.
    pub fn available_assets(&self) -> Vec<&str> {
        let mut assets: Vec<&str> = self
            .chart_data
            .keys()
            .filter_map(|pair| split_pair(pair).map(|(_, base)| base))
            .collect();
        assets.sort_unstable();
        assets.dedup();
        assets
    }

    /// USD price of `asset`. A direct `USD_{asset}` pair wins; otherwise the
    /// first pair (in pair order) whose base is `asset`.
    pub fn price_usd(&self, asset: &str) -> Option<f64> {
        if let Some(price) = self
            .chart_data
            .get(&format!("USD_{asset}"))
            .and_then(|point| point.field(FIELD_PRICE_USD))
        {
            return Some(price);
        }
        self.chart_data
            .iter()
            .filter(|(pair, _)| split_pair(pair).is_some_and(|(_, base)| base == asset))
            .find_map(|(_, point)| point.field(FIELD_PRICE_USD))
    }

    pub fn estimate_value_usd(&self, asset: &str, amount: f64) -> Option<f64> {
        self.price_usd(asset).map(|price| price * amount)
    }

    /// Total USD value of all balances. Assets without a price count as zero.
    pub fn estimate_total_value_usd(&self) -> f64 {
        self.balances
            .iter()
            .filter_map(|(asset, amount)| self.estimate_value_usd(asset, *amount))
            .sum()
    }
}

/// A trade a strategy would like to make. The fund engine forwards it to the
/// market adapter without looking inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedTrade {
    pub id: String,
    pub sell_asset: String,
    pub buy_asset: String,
    /// Amount of `sell_asset` to give up.
    pub sell_amount: f64,
}

impl ProposedTrade {
    pub fn new(
        sell_asset: impl Into<String>,
        buy_asset: impl Into<String>,
        sell_amount: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sell_asset: sell_asset.into(),
            buy_asset: buy_asset.into(),
            sell_amount,
        }
    }
}

/// Which driver supplies step timestamps to the fund.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Live,
    Backtest,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Live => write!(f, "live"),
            RunMode::Backtest => write!(f, "backtest"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "live" => Ok(RunMode::Live),
            "backtest" => Ok(RunMode::Backtest),
            other => Err(format!("expected 'live' or 'backtest', got '{other}'")),
        }
    }
}
