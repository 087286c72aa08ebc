use std::time::Duration;

use chrono::{DateTime, Utc};

use common::{Error, Result};

/// Fixed arithmetic progression of backtest step times:
/// `start, start + interval, ...` up to and including `end`.
///
/// Every timestamp is a pure function of its index, so a replay can be
/// recomputed, resumed, or split without stepping through earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacktestSchedule {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    interval: chrono::Duration,
}

impl BacktestSchedule {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::Config("backtest interval must be positive".into()));
        }
        if start > end {
            return Err(Error::Config(format!(
                "backtest start {start} is after end {end}"
            )));
        }
        let interval = chrono::Duration::from_std(interval)
            .map_err(|e| Error::Config(format!("backtest interval out of range: {e}")))?;
        Ok(Self {
            start,
            end,
            interval,
        })
    }

    /// Number of step times in the schedule. Always at least one.
    pub fn step_count(&self) -> usize {
        let span = (self.end - self.start).num_milliseconds();
        let step = self.interval.num_milliseconds().max(1);
        (span / step) as usize + 1
    }

    /// The `n`th step time, or `None` past the end.
    pub fn nth(&self, n: usize) -> Option<DateTime<Utc>> {
        if n >= self.step_count() {
            return None;
        }
        let offset = self.interval.num_milliseconds().checked_mul(n as i64)?;
        self.start
            .checked_add_signed(chrono::Duration::milliseconds(offset))
    }

    pub fn iter(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        (0..self.step_count()).map_while(|n| self.nth(n))
    }
}

/// Time to sleep so the next live step lands on the `interval` grid anchored
/// at the loop start, however long the current step took.
pub fn sleep_duration(elapsed: Duration, interval: Duration) -> Duration {
    let interval_ns = interval.as_nanos();
    if interval_ns == 0 {
        return Duration::ZERO;
    }
    let into_period = elapsed.as_nanos() % interval_ns;
    Duration::from_nanos((interval_ns - into_period) as u64)
}
