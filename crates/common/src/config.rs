use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{Error, Result, RunMode};

pub const DEFAULT_POLONIEX_BASE_URL: &str = "https://poloniex.com";
pub const DEFAULT_COINMARKETCAP_BASE_URL: &str = "https://graphs.coinmarketcap.com";

/// All configuration loaded from environment variables at startup.
#[derive(Debug, Clone)]
pub struct Config {
    // Run mode
    pub run_mode: RunMode,
    /// Required when `run_mode` is `Backtest`.
    pub backtest_window: Option<(DateTime<Utc>, DateTime<Utc>)>,

    // Database
    pub database_url: String,

    // Strategy config file path
    pub strategy_config_path: String,

    // Ingestion
    pub scrape_period_secs: u32,
    pub request_timeout: Duration,
    pub scrape_max_retries: u32,
    pub scrape_concurrency: usize,
    pub reference_asset: String,

    // Paper adapter
    pub fiat_asset: String,
    pub initial_balances: BTreeMap<String, f64>,
    pub paper_fee_bps: f64,
    pub min_order_usd: f64,

    // Upstream endpoints
    pub poloniex_base_url: String,
    pub coinmarketcap_base_url: String,
}

impl Config {
    /// Load all configuration from environment variables.
    /// Loads `.env` if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv(); // ignore error if .env not present

        let run_mode: RunMode = required_env("RUN_MODE")?
            .parse()
            .map_err(|e| Error::Config(format!("RUN_MODE: {e}")))?;

        let backtest_window = match run_mode {
            RunMode::Backtest => {
                let start = parse_time("BACKTEST_START", &required_env("BACKTEST_START")?)?;
                let end = parse_time("BACKTEST_END", &required_env("BACKTEST_END")?)?;
                Some((start, end))
            }
            RunMode::Live => None,
        };

        let initial_balances = match optional_env("INITIAL_BALANCES") {
            Some(raw) => parse_balances(&raw)?,
            None => BTreeMap::from([("BTC".to_string(), 1.0)]),
        };

        Ok(Config {
            run_mode,
            backtest_window,
            database_url: required_env("DATABASE_URL")?,
            strategy_config_path: optional_env("STRATEGY_CONFIG_PATH")
                .unwrap_or_else(|| "config/strategy.toml".to_string()),
            scrape_period_secs: parsed_env("SCRAPE_PERIOD_SECS", 900)?,
            request_timeout: Duration::from_secs(parsed_env("REQUEST_TIMEOUT_SECS", 30)?),
            scrape_max_retries: parsed_env("SCRAPE_MAX_RETRIES", 2)?,
            scrape_concurrency: parsed_env("SCRAPE_CONCURRENCY", 1)?,
            reference_asset: optional_env("REFERENCE_ASSET")
                .unwrap_or_else(|| "bitcoin".to_string()),
            fiat_asset: optional_env("FIAT_ASSET").unwrap_or_else(|| "BTC".to_string()),
            initial_balances,
            paper_fee_bps: parsed_env("PAPER_FEE_BPS", 25.0)?,
            min_order_usd: parsed_env("MIN_ORDER_USD", 1.0)?,
            poloniex_base_url: optional_env("POLONIEX_BASE_URL")
                .unwrap_or_else(|| DEFAULT_POLONIEX_BASE_URL.to_string()),
            coinmarketcap_base_url: optional_env("COINMARKETCAP_BASE_URL")
                .unwrap_or_else(|| DEFAULT_COINMARKETCAP_BASE_URL.to_string()),
        })
    }
}

/// Parse `BTC=1.0,ETH=2.5` into a balance map.
pub fn parse_balances(raw: &str) -> Result<BTreeMap<String, f64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (asset, amount) = entry.split_once('=').ok_or_else(|| {
                Error::Config(format!("INITIAL_BALANCES entry '{entry}' is not ASSET=AMOUNT"))
            })?;
            let asset = asset.trim();
            let amount = amount.trim().parse::<f64>().map_err(|_| {
                Error::Config(format!("INITIAL_BALANCES amount for '{asset}' is not a number"))
            })?;
            Ok((asset.to_uppercase(), amount))
        })
        .collect()
}

fn parse_time(key: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Config(format!("{key} must be an RFC 3339 timestamp: {e}")))
}

fn required_env(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| {
        Error::Config(format!(
            "Required environment variable '{key}' is not set. Check your .env file."
        ))
    })
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match optional_env(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{key} has an invalid value: '{raw}'"))),
        None => Ok(default),
    }
}
