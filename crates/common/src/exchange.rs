use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Candle, MarketState, PriceHistory, ProposedTrade, Result};

/// Public candlestick data from the exchange.
///
/// `PoloniexClient` implements this against the public REST API; tests use
/// in-memory fakes.
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Every pair the exchange currently lists, e.g. `BTC_ETH`.
    async fn tradable_pairs(&self) -> Result<Vec<String>>;

    /// Candles for `pair` covering `[start, end)` at `period_secs` granularity,
    /// oldest first, priced in the pair's quote asset.
    async fn candles(
        &self,
        pair: &str,
        period_secs: u32,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>>;
}

/// USD market-cap history for a reference asset (e.g. `bitcoin`).
#[async_trait]
pub trait ReferenceSource: Send + Sync {
    /// Field -> ascending `(time, value)` series, covering at least the last year.
    async fn history(&self, asset_id: &str) -> Result<PriceHistory>;
}

/// Executes trades and owns the fund's balances.
///
/// Only the fund engine holds a `dyn MarketAdapter`. Strategies never see one;
/// they receive a `MarketState` value and can only influence balances through
/// the trades they propose.
#[async_trait]
pub trait MarketAdapter: Send + Sync {
    /// Build a fresh snapshot of balances and prices as of `time`.
    async fn snapshot(&self, time: DateTime<Utc>) -> Result<MarketState>;

    /// Drop infeasible trades, then perform (or simulate) the rest, updating
    /// the adapter's balances.
    async fn execute_filtered(&self, trades: Vec<ProposedTrade>) -> Result<()>;

    /// Current value of all balances in USD.
    async fn total_value_usd(&self) -> Result<f64>;
}
