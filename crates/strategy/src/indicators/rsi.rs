use common::{Error, Result};

/// Where an RSI reading sits relative to the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsiZone {
    Oversold,
    Neutral,
    Overbought,
}

/// RSI (Relative Strength Index) with Wilder smoothing.
///
/// Needs at least `period + 1` prices (oldest first) before it yields a value.
#[derive(Debug, Clone)]
pub struct RsiIndicator {
    pub period: usize,
    pub overbought: f64,
    pub oversold: f64,
}

impl RsiIndicator {
    pub fn new(period: usize, overbought: f64, oversold: f64) -> Result<Self> {
        if period < 2 {
            return Err(Error::Config(format!("RSI period must be >= 2, got {period}")));
        }
        if !(0.0..=100.0).contains(&oversold) || !(oversold..=100.0).contains(&overbought) {
            return Err(Error::Config(format!(
                "RSI thresholds must satisfy 0 <= oversold <= overbought <= 100, \
                 got {oversold}/{overbought}"
            )));
        }
        Ok(Self {
            period,
            overbought,
            oversold,
        })
    }

    /// RSI over `prices` (oldest first), or `None` with too little data.
    pub fn compute(&self, prices: &[f64]) -> Option<f64> {
        if prices.len() <= self.period {
            return None;
        }

        let n = self.period as f64;
        let mut changes = prices.windows(2).map(|w| w[1] - w[0]);

        let (seed_gain, seed_loss) = changes
            .by_ref()
            .take(self.period)
            .fold((0.0, 0.0), |(g, l), c| (g + c.max(0.0), l + (-c).max(0.0)));

        let (avg_gain, avg_loss) = changes.fold((seed_gain / n, seed_loss / n), |(g, l), c| {
            (
                (g * (n - 1.0) + c.max(0.0)) / n,
                (l * (n - 1.0) + (-c).max(0.0)) / n,
            )
        });

        if avg_loss == 0.0 {
            // No movement at all is neutral, not overbought.
            return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
        }
        Some(100.0 - 100.0 / (1.0 + avg_gain / avg_loss))
    }

    pub fn zone(&self, rsi: f64) -> RsiZone {
        if rsi <= self.oversold {
            RsiZone::Oversold
        } else if rsi >= self.overbought {
            RsiZone::Overbought
        } else {
            RsiZone::Neutral
        }
    }
}
