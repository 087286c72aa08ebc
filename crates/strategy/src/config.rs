use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use common::{Error, Result};

/// Strategy config file (TOML).
///
/// Example `config/strategy.toml`:
/// ```toml
/// [strategy]
/// type = "rsi"
/// name = "ETH RSI 14"
/// interval_secs = 86400
///
/// [strategy.params]
/// asset = "ETH"
/// period = 14
/// overbought = 70.0
/// oversold = 30.0
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StrategyFileConfig {
    pub strategy: StrategyConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StrategyConfig {
    /// Strategy type identifier: "buy_hold" or "rsi".
    #[serde(rename = "type")]
    pub strategy_type: String,
    /// Human-readable name shown in logs.
    pub name: String,
    /// Seconds between fund steps.
    pub interval_secs: u64,
    /// Strategy-specific parameters.
    #[serde(default)]
    pub params: HashMap<String, toml::Value>,
}

impl StrategyFileConfig {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read strategy config at '{path}': {e}"))
        })?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("Failed to parse strategy config at '{path}': {e}")))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        if cfg.strategy.interval_secs == 0 {
            return Err(Error::Config("strategy interval_secs must be positive".into()));
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_type_interval_and_params() {
        let cfg = StrategyFileConfig::parse(
            r#"
            [strategy]
            type = "rsi"
            name = "ETH RSI"
            interval_secs = 3600

            [strategy.params]
            asset = "ETH"
            period = 10
            "#,
        )
        .unwrap();

        assert_eq!(cfg.strategy.strategy_type, "rsi");
        assert_eq!(cfg.strategy.interval_secs, 3600);
        assert_eq!(cfg.strategy.params["period"].as_integer(), Some(10));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = StrategyFileConfig::parse(
            r#"
            [strategy]
            type = "buy_hold"
            name = "hold"
            interval_secs = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
