use std::sync::Arc;

use anyhow::Context;
use futures_util::{pin_mut, StreamExt};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use common::{Config, RunMode};
use engine::{CoinMarketCapClient, Fund, IngestConfig, MarketScraper, PoloniexClient};
use history::SqliteHistoryStore;
use paper::PaperAdapter;
use strategy::{build_strategy, Strategy, StrategyFileConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ────────────────────────────────────────────────────────────────
    let cfg = Config::from_env().context("Failed to load configuration")?;
    info!(mode = %cfg.run_mode, "MoneyBot starting");

    // ── History store ─────────────────────────────────────────────────────────
    let store = Arc::new(
        SqliteHistoryStore::connect(&cfg.database_url)
            .await
            .context("Failed to open history store")?,
    );

    // ── Strategy ──────────────────────────────────────────────────────────────
    let strategy_file = StrategyFileConfig::load(&cfg.strategy_config_path)
        .with_context(|| format!("Failed to load {}", cfg.strategy_config_path))?;
    let strategy: Arc<dyn Strategy> = Arc::from(build_strategy(&strategy_file.strategy)?);

    // ── Fund ──────────────────────────────────────────────────────────────────
    let adapter = Arc::new(PaperAdapter::from_config(store.clone(), &cfg));
    let fund = Fund::new(strategy, adapter, store.clone());

    match cfg.run_mode {
        RunMode::Live => {
            let candles = Arc::new(PoloniexClient::new(
                cfg.poloniex_base_url.clone(),
                cfg.request_timeout,
            )?);
            let reference = Arc::new(CoinMarketCapClient::new(
                cfg.coinmarketcap_base_url.clone(),
                cfg.request_timeout,
            )?);
            let scraper =
                MarketScraper::new(candles, reference, store, IngestConfig::from_config(&cfg));

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("Shutdown signal received"),
                    Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
                }
                let _ = shutdown_tx.send(true);
            });

            fund.run_live(&scraper, shutdown_rx).await;
        }
        RunMode::Backtest => {
            let (start, end) = cfg
                .backtest_window
                .context("Backtest mode needs BACKTEST_START and BACKTEST_END")?;
            let points = fund.begin_backtest(start, end)?;
            pin_mut!(points);

            let mut steps = 0usize;
            let mut last_value = None;
            while let Some(point) = points.next().await {
                let point = point?;
                info!(time = %point.time, usd_value = point.usd_value, "Backtest step");
                steps += 1;
                last_value = Some(point.usd_value);
            }
            info!(steps, final_usd_value = ?last_value, "Backtest complete");
        }
    }

    info!("MoneyBot exiting");
    Ok(())
}
