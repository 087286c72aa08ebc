use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use common::{ChartPoint, Config, HistoryReader, MarketAdapter, MarketState, ProposedTrade, Result};

struct Quotes {
    time: DateTime<Utc>,
    chart: BTreeMap<String, ChartPoint>,
}

/// Simulated market adapter for backtests and paper trading.
///
/// Prices come from the history store as of each snapshot's time; trades fill
/// at those prices less a fee. Nothing is ever sent to an exchange.
pub struct PaperAdapter {
    history: Arc<dyn HistoryReader>,
    fiat: String,
    balances: RwLock<BTreeMap<String, f64>>,
    /// Time and chart data of the latest snapshot; fills and valuation use
    /// these prices.
    quotes: RwLock<Quotes>,
    /// Fee in basis points taken from the bought amount.
    fee_bps: f64,
    min_order_usd: f64,
}

impl PaperAdapter {
    pub fn new(
        history: Arc<dyn HistoryReader>,
        fiat: impl Into<String>,
        initial_balances: BTreeMap<String, f64>,
        fee_bps: f64,
        min_order_usd: f64,
    ) -> Self {
        let fiat = fiat.into();
        info!(
            fiat = %fiat,
            balances = ?initial_balances,
            fee_bps,
            min_order_usd,
            "PaperAdapter initialized"
        );
        Self {
            history,
            fiat,
            balances: RwLock::new(initial_balances),
            quotes: RwLock::new(Quotes {
                time: DateTime::<Utc>::MIN_UTC,
                chart: BTreeMap::new(),
            }),
            fee_bps,
            min_order_usd,
        }
    }

    pub fn from_config(history: Arc<dyn HistoryReader>, cfg: &Config) -> Self {
        Self::new(
            history,
            cfg.fiat_asset.clone(),
            cfg.initial_balances.clone(),
            cfg.paper_fee_bps,
            cfg.min_order_usd,
        )
    }

    pub async fn balances(&self) -> BTreeMap<String, f64> {
        self.balances.read().await.clone()
    }

    /// Balances priced at the latest snapshot, stamped with that snapshot's
    /// time. Never reads the wall clock, so replays are reproducible.
    pub async fn current_state(&self) -> MarketState {
        let quotes = self.quotes.read().await;
        MarketState::new(
            quotes.time,
            self.fiat.clone(),
            self.balances.read().await.clone(),
            quotes.chart.clone(),
        )
    }

    /// Why `trade` cannot be filled against `state`, if it can't.
    fn rejection(&self, trade: &ProposedTrade, state: &MarketState) -> Option<String> {
        if trade.sell_asset == trade.buy_asset {
            return Some("sell and buy asset are the same".into());
        }
        if trade.sell_amount <= 0.0 || !trade.sell_amount.is_finite() {
            return Some(format!("sell amount {} is not positive", trade.sell_amount));
        }
        let held = state.balance(&trade.sell_asset);
        if trade.sell_amount > held {
            return Some(format!(
                "insufficient {}: have {held}, need {}",
                trade.sell_asset, trade.sell_amount
            ));
        }
        let Some(sell_price) = state.price_usd(&trade.sell_asset) else {
            return Some(format!("no USD price for {}", trade.sell_asset));
        };
        if state.price_usd(&trade.buy_asset).map_or(true, |p| p <= 0.0) {
            return Some(format!("no USD price for {}", trade.buy_asset));
        }
        let value_usd = trade.sell_amount * sell_price;
        if value_usd < self.min_order_usd {
            return Some(format!(
                "order value ${value_usd:.2} below minimum ${:.2}",
                self.min_order_usd
            ));
        }
        None
    }
}

#[async_trait]
impl MarketAdapter for PaperAdapter {
    async fn snapshot(&self, time: DateTime<Utc>) -> Result<MarketState> {
        let chart = self.history.latest_per_pair(time).await?;
        debug!(time = %time, pairs = chart.len(), "Paper snapshot");
        *self.quotes.write().await = Quotes { time, chart };
        Ok(self.current_state().await)
    }

    async fn execute_filtered(&self, trades: Vec<ProposedTrade>) -> Result<()> {
        for trade in trades {
            // Re-priced per trade so earlier fills count against later ones.
            let state = self.current_state().await;
            if let Some(reason) = self.rejection(&trade, &state) {
                warn!(
                    id = %trade.id,
                    sell = %trade.sell_asset,
                    buy = %trade.buy_asset,
                    amount = trade.sell_amount,
                    reason = %reason,
                    "Rejected proposed trade"
                );
                continue;
            }

            let (Some(sell_price), Some(buy_price)) = (
                state.price_usd(&trade.sell_asset),
                state.price_usd(&trade.buy_asset),
            ) else {
                continue;
            };
            let bought =
                trade.sell_amount * sell_price / buy_price * (1.0 - self.fee_bps / 10_000.0);

            let mut balances = self.balances.write().await;
            *balances.entry(trade.sell_asset.clone()).or_insert(0.0) -= trade.sell_amount;
            *balances.entry(trade.buy_asset.clone()).or_insert(0.0) += bought;
            drop(balances);

            info!(
                id = %trade.id,
                sell = %trade.sell_asset,
                sold = trade.sell_amount,
                buy = %trade.buy_asset,
                bought,
                "Paper trade filled"
            );
        }
        Ok(())
    }

    async fn total_value_usd(&self) -> Result<f64> {
        Ok(self.current_state().await.estimate_total_value_usd())
    }
}
