//! Perp Trend Trader
//!
//! A semi-automated trend/pullback trading controller for a single perpetual
//! swap: higher-timeframe EMA direction arms an entry, a lower-timeframe
//! pullback into a zone plus a MACD cross fires it, and the position is
//! managed with stepped trailing stops, take-profit and reversal handling.

pub mod bar_cache;
pub mod common;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod gateway;
pub mod indicators;
pub mod lifecycle;
pub mod notify;
pub mod planner;
pub mod risk;
pub mod session;
pub mod state_manager;
pub mod stats;
pub mod trend;
pub mod types;
pub mod zones;

pub use config::Config;
pub use error::{ErrorKind, GatewayError, GatewayResult};
pub use types::*;
