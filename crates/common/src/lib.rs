pub mod config;
pub mod error;
pub mod exchange;
pub mod history;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use exchange::{CandleSource, MarketAdapter, ReferenceSource};
pub use history::{days_floor, window_floor, HistoryReader, HistoryStore};
pub use types::*;
