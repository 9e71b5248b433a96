//! Core data types used across the trading system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// OHLCV candlestick data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// Splits a fetched window into its closed bars and the in-progress bar.
///
/// Exchanges return the live bar as the newest element, so only `closed`
/// may drive signal decisions.
pub fn split_closed(candles: &[Candle]) -> (&[Candle], Option<&Candle>) {
    match candles.split_last() {
        Some((live, closed)) => (closed, Some(live)),
        None => (candles, None),
    }
}

/// Exchange instrument identifier (e.g. `BTC-USDT-SWAP`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Symbol(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Directional bias of a trend, a plan or a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    /// +1 for long, -1 for short. Multiplies a price move into signed profit.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    /// Order side that opens (or adds to) a position in this direction
    pub fn entry_side(self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces a position in this direction
    pub fn exit_side(self) -> OrderSide {
        self.opposite().entry_side()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order side as sent to the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

/// Margin mode for the swap account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    #[default]
    Isolated,
    Cross,
}

impl MarginMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MarginMode::Isolated => "isolated",
            MarginMode::Cross => "cross",
        }
    }
}

/// Latest traded price
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub last: f64,
}

/// Open position as reported by the exchange (source of truth for fills)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub side: Direction,
    /// Contracts, always positive
    pub size: f64,
    pub entry_price: f64,
}

/// Contract specification used for sizing and rounding
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    /// Base-currency amount represented by one contract
    pub contract_size: f64,
    pub lot_step: f64,
    pub min_lot: f64,
    pub tick_size: f64,
}

impl Default for InstrumentSpec {
    fn default() -> Self {
        // BTC-USDT-SWAP
        Self {
            contract_size: 0.01,
            lot_step: 0.01,
            min_lot: 0.01,
            tick_size: 0.1,
        }
    }
}

impl InstrumentSpec {
    /// Quote-currency value of `contracts` at `price`
    pub fn notional(&self, contracts: f64, price: f64) -> f64 {
        contracts * price * self.contract_size
    }

    /// Rounds a price to the instrument tick
    pub fn round_price(&self, price: f64) -> f64 {
        if self.tick_size <= 0.0 {
            return (price * 100.0).round() / 100.0;
        }
        (price / self.tick_size).round() * self.tick_size
    }
}

/// Extra parameters for a market order
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OrderParams {
    pub reduce_only: bool,
    pub margin_mode: MarginMode,
}

impl OrderParams {
    pub fn open(margin_mode: MarginMode) -> Self {
        Self {
            reduce_only: false,
            margin_mode,
        }
    }

    pub fn close(margin_mode: MarginMode) -> Self {
        Self {
            reduce_only: true,
            margin_mode,
        }
    }
}

/// Completed trade record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub side: Direction,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    /// Number of trailing steps applied when the position closed
    pub close_step: usize,
    pub pnl: f64,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(minute: u32, close: f64) -> Candle {
        Candle {
            open_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn test_split_closed_excludes_live_bar() {
        let candles = vec![candle(0, 10.0), candle(5, 11.0), candle(10, 12.0)];
        let (closed, live) = split_closed(&candles);
        assert_eq!(closed.len(), 2);
        assert_eq!(live.map(|c| c.close), Some(12.0));
    }

    #[test]
    fn test_split_closed_empty() {
        let (closed, live) = split_closed(&[]);
        assert!(closed.is_empty());
        assert!(live.is_none());
    }

    #[test]
    fn test_direction_sides() {
        assert_eq!(Direction::Long.entry_side(), OrderSide::Buy);
        assert_eq!(Direction::Long.exit_side(), OrderSide::Sell);
        assert_eq!(Direction::Short.entry_side(), OrderSide::Sell);
        assert_eq!(Direction::Short.opposite(), Direction::Long);
        assert_eq!(Direction::Short.sign(), -1.0);
    }

    #[test]
    fn test_instrument_notional_and_rounding() {
        let spec = InstrumentSpec::default();
        assert!((spec.notional(2.0, 100_000.0) - 2_000.0).abs() < 1e-9);
        assert!((spec.round_price(100_000.04) - 100_000.0).abs() < 1e-6);
    }
}
