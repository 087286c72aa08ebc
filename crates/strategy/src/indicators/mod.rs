pub mod rsi;

pub use rsi::{RsiIndicator, RsiZone};
