//! Shared fixtures for session-level tests: a scripted exchange, a
//! recording notifier and candle builders.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use perp_trend_trader::config::{RuntimeConfig, ZoneMode};
use perp_trend_trader::gateway::ExecutionGateway;
use perp_trend_trader::notify::Notifier;
use perp_trend_trader::{
    Candle, Config, Direction, ExchangePosition, GatewayResult, InstrumentSpec, OrderParams, OrderSide, Ticker,
};

// =============================================================================
// Scripted exchange
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct PlacedOrder {
    pub side: OrderSide,
    pub size: f64,
    pub reduce_only: bool,
    pub position_side: Direction,
}

/// Everything the scripted exchange reports. Tests mutate it between ticks.
#[derive(Debug, Clone)]
pub struct Market {
    pub price: f64,
    /// Higher-timeframe window, live bar last
    pub htf: Vec<Candle>,
    /// Lower-timeframe window, live bar last
    pub ltf: Vec<Candle>,
    pub position: Option<ExchangePosition>,
    pub collateral: f64,
    /// When false, orders are accepted but never show up as positions
    pub fill_orders: bool,
    pub orders: Vec<PlacedOrder>,
    pub cancels: usize,
}

impl Default for Market {
    fn default() -> Self {
        Self {
            price: 60_000.0,
            htf: Vec::new(),
            ltf: Vec::new(),
            position: None,
            collateral: 1_000.0,
            fill_orders: true,
            orders: Vec::new(),
            cancels: 0,
        }
    }
}

#[derive(Debug)]
pub struct ScriptedGateway {
    market: Mutex<Market>,
    htf_timeframe: String,
    /// `(timeframe, limit)` of every candle request, oldest first
    candle_requests: Mutex<Vec<(String, usize)>>,
}

impl ScriptedGateway {
    pub fn new(market: Market) -> Self {
        Self {
            market: Mutex::new(market),
            htf_timeframe: "1h".to_string(),
            candle_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut Market)) {
        let mut market = self.market.lock().unwrap();
        f(&mut market);
    }

    pub fn market(&self) -> Market {
        self.market.lock().unwrap().clone()
    }

    pub fn orders(&self) -> Vec<PlacedOrder> {
        self.market.lock().unwrap().orders.clone()
    }

    /// Limits requested for `timeframe`, oldest first
    pub fn candle_requests(&self, timeframe: &str) -> Vec<usize> {
        self.candle_requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(tf, _)| tf == timeframe)
            .map(|(_, limit)| *limit)
            .collect()
    }
}

#[async_trait]
impl ExecutionGateway for ScriptedGateway {
    async fn fetch_ohlcv(&self, timeframe: &str, limit: usize) -> GatewayResult<Vec<Candle>> {
        self.candle_requests
            .lock()
            .unwrap()
            .push((timeframe.to_string(), limit));
        let market = self.market.lock().unwrap();
        let candles = if timeframe == self.htf_timeframe {
            &market.htf
        } else {
            &market.ltf
        };
        let start = candles.len().saturating_sub(limit);
        Ok(candles[start..].to_vec())
    }

    async fn fetch_ticker(&self) -> GatewayResult<Ticker> {
        Ok(Ticker {
            last: self.market.lock().unwrap().price,
        })
    }

    async fn fetch_position(&self) -> GatewayResult<Option<ExchangePosition>> {
        Ok(self.market.lock().unwrap().position)
    }

    async fn fetch_available_collateral(&self) -> GatewayResult<f64> {
        Ok(self.market.lock().unwrap().collateral)
    }

    async fn open_market(
        &self,
        side: OrderSide,
        size: f64,
        params: OrderParams,
        position_side: Direction,
    ) -> GatewayResult<()> {
        let mut market = self.market.lock().unwrap();
        market.orders.push(PlacedOrder {
            side,
            size,
            reduce_only: params.reduce_only,
            position_side,
        });
        if !market.fill_orders {
            return Ok(());
        }
        let price = market.price;
        market.position = if params.reduce_only {
            None
        } else {
            match market.position {
                Some(p) if p.side == position_side => {
                    let total = p.size + size;
                    Some(ExchangePosition {
                        side: p.side,
                        size: total,
                        entry_price: (p.entry_price * p.size + price * size) / total,
                    })
                }
                _ => Some(ExchangePosition {
                    side: position_side,
                    size,
                    entry_price: price,
                }),
            }
        };
        Ok(())
    }

    async fn cancel_all_open_orders(&self) -> GatewayResult<usize> {
        self.market.lock().unwrap().cancels += 1;
        Ok(0)
    }

    async fn set_leverage(&self, _leverage: f64) -> GatewayResult<()> {
        Ok(())
    }

    async fn instrument(&self) -> GatewayResult<InstrumentSpec> {
        Ok(InstrumentSpec::default())
    }
}

// =============================================================================
// Notifications
// =============================================================================

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.contains(needle))
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &str) -> Result<()> {
        self.messages.lock().unwrap().push(message.to_string());
        Ok(())
    }
}

pub fn recording_notifier() -> Arc<RecordingNotifier> {
    Arc::new(RecordingNotifier::default())
}

// =============================================================================
// Candles
// =============================================================================

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

/// Closed bars for `closes` plus a flat live bar. Each bar opens at the
/// previous close and spans 10 points beyond its body.
pub fn window(start: DateTime<Utc>, step: Duration, closes: &[f64]) -> Vec<Candle> {
    let mut candles = Vec::with_capacity(closes.len() + 1);
    let mut prev = closes.first().copied().unwrap_or_default();
    for (i, &close) in closes.iter().enumerate() {
        candles.push(Candle {
            open_time: start + step * i as i32,
            open: prev,
            high: prev.max(close) + 10.0,
            low: prev.min(close) - 10.0,
            close,
            volume: 1.0,
        });
        prev = close;
    }
    candles.push(Candle {
        open_time: start + step * closes.len() as i32,
        open: prev,
        high: prev,
        low: prev,
        close: prev,
        volume: 0.0,
    });
    candles
}

pub fn hourly(closes: &[f64]) -> Vec<Candle> {
    window(t0(), Duration::hours(1), closes)
}

pub fn five_minute(closes: &[f64]) -> Vec<Candle> {
    window(t0(), Duration::minutes(5), closes)
}

/// Open time of the `index`-th hourly bar
pub fn hour_bar(index: i64) -> DateTime<Utc> {
    t0() + Duration::hours(index)
}

// =============================================================================
// Config
// =============================================================================

/// Default strategy with short EMAs, an EMA-20 zone, no scale-in and zero
/// confirmation delays; state lives in `dir`
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.trend.ema_fast = 3;
    config.trend.ema_slow = 6;
    config.entry.zone = ZoneMode::Ema { period: 20 };
    config.scale_in.enabled = false;
    config.runtime = RuntimeConfig {
        state_file: dir.path().join("session_state.json").to_string_lossy().into_owned(),
        ..RuntimeConfig::immediate()
    };
    config.stats.file = dir.path().join("trading_stats.json").to_string_lossy().into_owned();
    config
}
