pub mod config;
pub mod indicators;
pub mod registry;

pub use config::{StrategyConfig, StrategyFileConfig};
pub use registry::{build_strategy, BuyHoldStrategy, RsiStrategy};

use std::time::Duration;

use async_trait::async_trait;

use common::{HistoryReader, MarketState, ProposedTrade, Result};

/// Decision logic driven by the fund engine, one call per step.
///
/// A strategy sees a borrowed snapshot and a read-only view of the chart
/// history. It has no handle on the market adapter; proposing trades is its
/// only way to change the fund.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Human-readable name of this strategy instance.
    fn name(&self) -> &str;

    /// Spacing between consecutive fund steps.
    fn trade_interval(&self) -> Duration;

    /// Propose zero or more trades for the snapshot's time.
    async fn propose_trades(
        &self,
        state: &MarketState,
        history: &dyn HistoryReader,
    ) -> Result<Vec<ProposedTrade>>;
}
