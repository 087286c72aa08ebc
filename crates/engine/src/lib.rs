pub mod coinmarketcap;
pub mod fund;
pub mod ingest;
pub mod poloniex;
pub mod schedule;

pub use coinmarketcap::CoinMarketCapClient;
pub use fund::{BacktestPoint, Fund};
pub use ingest::{
    IngestConfig, MarketScraper, PairOutcome, PairResult, ScrapeSummary, REFERENCE_PAIR,
};
pub use poloniex::PoloniexClient;
pub use schedule::{sleep_duration, BacktestSchedule};
