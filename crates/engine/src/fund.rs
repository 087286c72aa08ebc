use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use common::{HistoryReader, MarketAdapter, Result};
use strategy::Strategy;

use crate::ingest::MarketScraper;
use crate::schedule::{sleep_duration, BacktestSchedule};

/// Fund value after one backtest step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BacktestPoint {
    pub time: DateTime<Utc>,
    pub usd_value: f64,
}

/// A strategy trading through a market adapter.
///
/// Live trading and backtesting share `step`; they differ only in where the
/// step times come from.
pub struct Fund {
    strategy: Arc<dyn Strategy>,
    adapter: Arc<dyn MarketAdapter>,
    history: Arc<dyn HistoryReader>,
}

impl Fund {
    pub fn new(
        strategy: Arc<dyn Strategy>,
        adapter: Arc<dyn MarketAdapter>,
        history: Arc<dyn HistoryReader>,
    ) -> Self {
        Self {
            strategy,
            adapter,
            history,
        }
    }

    /// Snapshot, decide, execute, valuate.
    ///
    /// The strategy gets a borrow of a snapshot built for this step and a
    /// read-only history view. Its only effect on the adapter is through the
    /// trades it returns.
    pub async fn step(&self, time: DateTime<Utc>) -> Result<f64> {
        let state = self.adapter.snapshot(time).await?;
        let trades = self
            .strategy
            .propose_trades(&state, self.history.as_ref())
            .await?;

        if !trades.is_empty() {
            debug!(time = %time, count = trades.len(), "Executing proposed trades");
            self.adapter.execute_filtered(trades).await?;
        }

        self.adapter.total_value_usd().await
    }

    /// Trade in real time until `shutdown` turns true or its sender is dropped.
    ///
    /// Every tick refreshes the history store, steps at the current time and
    /// logs the fund's value. Ticks stay on the strategy's interval grid
    /// anchored at the loop start. A failed scrape or step is logged and the
    /// loop carries on at the next tick.
    pub async fn run_live(&self, scraper: &MarketScraper, mut shutdown: watch::Receiver<bool>) {
        let interval = self.strategy.trade_interval();
        let loop_start = Instant::now();
        info!(strategy = %self.strategy.name(), interval = ?interval, "Fund running live");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = Utc::now();
            match scraper.scrape_latest().await {
                Ok(summary) => summary.log_summary(),
                Err(e) => warn!(error = %e, "Market scrape failed; stepping on stored history"),
            }

            info!(time = %now, "Fund step");
            match self.step(now).await {
                Ok(usd_value) => info!(usd_value, "Estimated fund value"),
                Err(e) => {
                    error!(time = %now, error = %e, "Fund step failed; waiting for next tick")
                }
            }

            let wake_at = Instant::now() + sleep_duration(loop_start.elapsed(), interval);
            if !sleep_until_or_shutdown(wake_at, &mut shutdown).await {
                break;
            }
        }

        info!("Live fund stopped");
    }

    /// Replay the strategy from `start` to `end` (inclusive) at its trade
    /// interval.
    ///
    /// The returned stream is lazy: each item runs one step. The first failed
    /// step is yielded as an error and ends the stream, so a replay never
    /// silently skips a time.
    pub fn begin_backtest(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<impl Stream<Item = Result<BacktestPoint>> + '_> {
        let schedule = BacktestSchedule::new(start, end, self.strategy.trade_interval())?;
        info!(
            strategy = %self.strategy.name(),
            start = %start,
            end = %end,
            steps = schedule.step_count(),
            "Starting backtest"
        );
        Ok(self.replay(schedule))
    }

    /// Step through every time in `schedule`, stopping after the first error.
    pub fn replay(
        &self,
        schedule: BacktestSchedule,
    ) -> impl Stream<Item = Result<BacktestPoint>> + '_ {
        stream::unfold(Some(0usize), move |next| async move {
            let n = next?;
            let time = schedule.nth(n)?;
            match self.step(time).await {
                Ok(usd_value) => Some((Ok(BacktestPoint { time, usd_value }), Some(n + 1))),
                Err(e) => {
                    error!(time = %time, error = %e, "Backtest step failed; aborting replay");
                    Some((Err(e), None))
                }
            }
        })
    }
}

/// Sleep until `deadline`. Returns false if shutdown was requested first.
async fn sleep_until_or_shutdown(deadline: Instant, shutdown: &mut watch::Receiver<bool>) -> bool {
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return true,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return false;
                }
            }
        }
    }
}
