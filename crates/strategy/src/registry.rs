use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use common::{Error, HistoryReader, MarketState, ProposedTrade, Result, FIELD_PRICE_USD};

use crate::config::StrategyConfig;
use crate::indicators::{RsiIndicator, RsiZone};
use crate::Strategy;

/// Build the strategy named by `cfg.strategy_type`.
pub fn build_strategy(cfg: &StrategyConfig) -> Result<Box<dyn Strategy>> {
    let strategy: Box<dyn Strategy> = match cfg.strategy_type.as_str() {
        "buy_hold" => {
            let asset = param_str(&cfg.params, "asset")?;
            Box::new(BuyHoldStrategy::new(cfg.clone(), asset))
        }
        "rsi" => {
            let asset = param_str(&cfg.params, "asset")?;
            let indicator = RsiIndicator::new(
                param_usize(&cfg.params, "period", 14)?,
                param_f64(&cfg.params, "overbought", 70.0),
                param_f64(&cfg.params, "oversold", 30.0),
            )?;
            let lookback_days = param_u32(&cfg.params, "lookback_days", 30)?;
            let pair = cfg.params.get("pair").and_then(|v| v.as_str()).map(str::to_string);
            Box::new(RsiStrategy::new(cfg.clone(), asset, pair, indicator, lookback_days))
        }
        other => {
            return Err(Error::Config(format!("unknown strategy type '{other}'")));
        }
    };
    info!(
        name = %strategy.name(),
        interval = ?strategy.trade_interval(),
        "Built strategy"
    );
    Ok(strategy)
}

fn param_str(params: &HashMap<String, toml::Value>, key: &str) -> Result<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_uppercase)
        .ok_or_else(|| Error::Config(format!("strategy param '{key}' is required")))
}

fn param_f64(params: &HashMap<String, toml::Value>, key: &str, default: f64) -> f64 {
    params
        .get(key)
        .and_then(|v| v.as_float().or_else(|| v.as_integer().map(|i| i as f64)))
        .unwrap_or(default)
}

fn param_int(params: &HashMap<String, toml::Value>, key: &str) -> Result<Option<i64>> {
    match params.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_integer()
            .map(Some)
            .ok_or_else(|| Error::Config(format!("strategy param '{key}' must be an integer"))),
    }
}

fn param_usize(params: &HashMap<String, toml::Value>, key: &str, default: usize) -> Result<usize> {
    match param_int(params, key)? {
        None => Ok(default),
        Some(v) => usize::try_from(v)
            .map_err(|_| Error::Config(format!("strategy param '{key}' out of range: {v}"))),
    }
}

fn param_u32(params: &HashMap<String, toml::Value>, key: &str, default: u32) -> Result<u32> {
    match param_int(params, key)? {
        None => Ok(default),
        Some(v) => u32::try_from(v)
            .map_err(|_| Error::Config(format!("strategy param '{key}' out of range: {v}"))),
    }
}

// ─── Concrete strategy types ──────────────────────────────────────────────────

/// Moves the whole fiat balance into one asset and keeps it there.
pub struct BuyHoldStrategy {
    cfg: StrategyConfig,
    asset: String,
}

impl BuyHoldStrategy {
    pub fn new(cfg: StrategyConfig, asset: impl Into<String>) -> Self {
        Self {
            cfg,
            asset: asset.into(),
        }
    }
}

#[async_trait]
impl Strategy for BuyHoldStrategy {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn trade_interval(&self) -> Duration {
        Duration::from_secs(self.cfg.interval_secs)
    }

    async fn propose_trades(
        &self,
        state: &MarketState,
        _history: &dyn HistoryReader,
    ) -> Result<Vec<ProposedTrade>> {
        let fiat = state.fiat();
        let available = state.balance(fiat);
        if self.asset == fiat || available <= 0.0 || state.price_usd(&self.asset).is_none() {
            return Ok(Vec::new());
        }
        Ok(vec![ProposedTrade::new(fiat, &self.asset, available)])
    }
}

/// Buys `asset` with all fiat when RSI is oversold and sells all of it back
/// when overbought. Prices come from `price_usd` of `pair` (default
/// `{fiat}_{asset}`).
pub struct RsiStrategy {
    cfg: StrategyConfig,
    asset: String,
    pair: Option<String>,
    indicator: RsiIndicator,
    lookback_days: u32,
}

impl RsiStrategy {
    pub fn new(
        cfg: StrategyConfig,
        asset: impl Into<String>,
        pair: Option<String>,
        indicator: RsiIndicator,
        lookback_days: u32,
    ) -> Self {
        Self {
            cfg,
            asset: asset.into(),
            pair,
            indicator,
            lookback_days,
        }
    }
}

#[async_trait]
impl Strategy for RsiStrategy {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn trade_interval(&self) -> Duration {
        Duration::from_secs(self.cfg.interval_secs)
    }

    async fn propose_trades(
        &self,
        state: &MarketState,
        history: &dyn HistoryReader,
    ) -> Result<Vec<ProposedTrade>> {
        let fiat = state.fiat();
        if self.asset == fiat {
            return Ok(Vec::new());
        }

        let pair = self
            .pair
            .clone()
            .unwrap_or_else(|| format!("{fiat}_{}", self.asset));
        let mut prices: Vec<f64> = history
            .history(&pair, state.time(), self.lookback_days, FIELD_PRICE_USD)
            .await?
            .into_iter()
            .map(|(_, price)| price)
            .collect();
        // Most recent first from the store; the indicator wants oldest first.
        prices.reverse();

        let Some(rsi) = self.indicator.compute(&prices) else {
            debug!(pair = %pair, samples = prices.len(), "Not enough history for RSI");
            return Ok(Vec::new());
        };

        let trade = match self.indicator.zone(rsi) {
            RsiZone::Oversold if state.balance(fiat) > 0.0 => {
                Some(ProposedTrade::new(fiat, &self.asset, state.balance(fiat)))
            }
            RsiZone::Overbought if state.balance(&self.asset) > 0.0 => {
                Some(ProposedTrade::new(&self.asset, fiat, state.balance(&self.asset)))
            }
            _ => None,
        };
        debug!(pair = %pair, rsi, proposed = trade.is_some(), "RSI evaluated");
        Ok(trade.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use common::{ChartPoint, Fields};

    /// Reader serving a fixed most-recent-first price series for one pair.
    struct FixedHistory {
        pair: String,
        prices: Vec<(DateTime<Utc>, f64)>,
    }

    #[async_trait]
    impl HistoryReader for FixedHistory {
        async fn most_recent_reading(&self) -> Result<ChartPoint> {
            Err(Error::EmptyStore)
        }

        async fn latest_per_pair_within(
            &self,
            _as_of: DateTime<Utc>,
            _lookback: ChronoDuration,
        ) -> Result<BTreeMap<String, ChartPoint>> {
            Ok(BTreeMap::new())
        }

        async fn history(
            &self,
            pair: &str,
            _as_of: DateTime<Utc>,
            _lookback_days: u32,
            _field: &str,
        ) -> Result<Vec<(DateTime<Utc>, f64)>> {
            if pair == self.pair {
                Ok(self.prices.clone())
            } else {
                Ok(Vec::new())
            }
        }
    }

    fn config(strategy_type: &str, params: &[(&str, toml::Value)]) -> StrategyConfig {
        StrategyConfig {
            strategy_type: strategy_type.into(),
            name: format!("test {strategy_type}"),
            interval_secs: 900,
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    fn state(balances: &[(&str, f64)]) -> MarketState {
        let t = Utc.timestamp_opt(1_500_000_000, 0).unwrap();
        let chart = BTreeMap::from([(
            "BTC_ETH".to_string(),
            ChartPoint::new(
                "BTC_ETH",
                t,
                Fields::from([(FIELD_PRICE_USD.to_string(), 300.0)]),
            ),
        )]);
        let balances = balances.iter().map(|(a, v)| (a.to_string(), *v)).collect();
        MarketState::new(t, "BTC", balances, chart)
    }

    fn series(prices: &[f64]) -> FixedHistory {
        // Store order: most recent first.
        let prices = prices
            .iter()
            .rev()
            .enumerate()
            .map(|(i, p)| (Utc.timestamp_opt(1_500_000_000 - 900 * i as i64, 0).unwrap(), *p))
            .collect();
        FixedHistory {
            pair: "BTC_ETH".into(),
            prices,
        }
    }

    #[tokio::test]
    async fn buy_hold_spends_all_fiat_once() {
        let strategy =
            build_strategy(&config("buy_hold", &[("asset", toml::Value::String("eth".into()))]))
                .unwrap();
        let empty = series(&[]);

        let trades = strategy
            .propose_trades(&state(&[("BTC", 2.0)]), &empty)
            .await
            .unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].sell_asset, "BTC");
        assert_eq!(trades[0].buy_asset, "ETH");
        assert_eq!(trades[0].sell_amount, 2.0);

        let after = strategy
            .propose_trades(&state(&[("BTC", 0.0), ("ETH", 10.0)]), &empty)
            .await
            .unwrap();
        assert!(after.is_empty());
    }

    #[tokio::test]
    async fn rsi_buys_when_oversold_and_sells_when_overbought() {
        let strategy = build_strategy(&config(
            "rsi",
            &[
                ("asset", toml::Value::String("ETH".into())),
                ("period", toml::Value::Integer(3)),
            ],
        ))
        .unwrap();

        let falling = series(&[14.0, 13.0, 12.0, 11.0, 10.0]);
        let buys = strategy
            .propose_trades(&state(&[("BTC", 1.0)]), &falling)
            .await
            .unwrap();
        assert_eq!(buys.len(), 1);
        assert_eq!((buys[0].sell_asset.as_str(), buys[0].buy_asset.as_str()), ("BTC", "ETH"));

        let rising = series(&[10.0, 11.0, 12.0, 13.0, 14.0]);
        let sells = strategy
            .propose_trades(&state(&[("ETH", 5.0)]), &rising)
            .await
            .unwrap();
        assert_eq!(sells.len(), 1);
        assert_eq!((sells[0].sell_asset.as_str(), sells[0].buy_asset.as_str()), ("ETH", "BTC"));
        assert_eq!(sells[0].sell_amount, 5.0);
    }

    #[tokio::test]
    async fn rsi_waits_for_enough_history() {
        let strategy = build_strategy(&config(
            "rsi",
            &[("asset", toml::Value::String("ETH".into()))],
        ))
        .unwrap();
        let trades = strategy
            .propose_trades(&state(&[("BTC", 1.0)]), &series(&[1.0, 2.0, 3.0]))
            .await
            .unwrap();
        assert!(trades.is_empty());
    }

    #[test]
    fn negative_or_non_integer_counts_are_config_errors() {
        for (key, value) in [
            ("period", toml::Value::Integer(-1)),
            ("lookback_days", toml::Value::Integer(-1)),
            ("lookback_days", toml::Value::Integer(i64::from(u32::MAX) + 1)),
            ("period", toml::Value::String("fourteen".into())),
        ] {
            let result = build_strategy(&config(
                "rsi",
                &[("asset", toml::Value::String("ETH".into())), (key, value.clone())],
            ));
            assert!(
                matches!(result, Err(Error::Config(_))),
                "{key} = {value} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn maximal_period_waits_instead_of_overflowing() {
        let strategy = build_strategy(&config(
            "rsi",
            &[
                ("asset", toml::Value::String("ETH".into())),
                ("period", toml::Value::Integer(i64::MAX)),
                ("lookback_days", toml::Value::Integer(i64::from(u32::MAX))),
            ],
        ))
        .unwrap();
        let trades = strategy
            .propose_trades(&state(&[("BTC", 1.0)]), &series(&[1.0, 2.0, 3.0]))
            .await
            .unwrap();
        assert!(trades.is_empty());
    }

    #[test]
    fn unknown_type_and_missing_asset_are_config_errors() {
        assert!(matches!(
            build_strategy(&config("macd", &[])),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            build_strategy(&config("rsi", &[])),
            Err(Error::Config(_))
        ));
    }
}
