//! Exchange access
//!
//! [`ExecutionGateway`] is everything the trading session needs from an
//! exchange. Implementations:
//! - [`okx::OkxGateway`]: OKX v5 REST for one perpetual swap
//! - [`paper::PaperGateway`]: live market data, simulated account and fills
//!
//! Reads are retried on transient errors; order placement never is, because
//! a timed-out order may still have been filled.

pub mod auth;
pub mod okx;
pub mod paper;

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::error::GatewayResult;
use crate::{Candle, Direction, ExchangePosition, InstrumentSpec, OrderParams, OrderSide, Ticker};

pub use okx::OkxGateway;
pub use paper::PaperGateway;

#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    /// Up to `limit` candles, oldest first. The last one is the live bar.
    async fn fetch_ohlcv(&self, timeframe: &str, limit: usize) -> GatewayResult<Vec<Candle>>;

    async fn fetch_ticker(&self) -> GatewayResult<Ticker>;

    /// Open position on the traded instrument, `None` when flat
    async fn fetch_position(&self) -> GatewayResult<Option<ExchangePosition>>;

    /// Quote currency that can back new margin
    async fn fetch_available_collateral(&self) -> GatewayResult<f64>;

    /// Market order for `size` contracts.
    ///
    /// `position_side` is the hedge-mode leg the order belongs to: the new
    /// position's side when opening, the held side when reducing.
    async fn open_market(
        &self,
        side: OrderSide,
        size: f64,
        params: OrderParams,
        position_side: Direction,
    ) -> GatewayResult<()>;

    /// Cancels every pending order on the instrument; returns how many
    async fn cancel_all_open_orders(&self) -> GatewayResult<usize>;

    async fn set_leverage(&self, leverage: f64) -> GatewayResult<()>;

    async fn instrument(&self) -> GatewayResult<InstrumentSpec>;
}

/// Bounded retries with a fixed backoff for transient errors
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self { max_retries, backoff }
    }

    /// No retries, used for order placement
    pub fn once() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or the retry budget is spent
    pub async fn run<F, Fut, T>(&self, what: &str, operation: F) -> GatewayResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        what,
                        attempt,
                        max = self.max_retries,
                        error = %e,
                        "Transient exchange error, retrying"
                    );
                    sleep(self.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Exchange name for a timeframe string (`1h` → `1H`, `5m` → `5m`)
pub fn okx_bar(timeframe: &str) -> String {
    match timeframe.chars().last() {
        Some('h') | Some('d') | Some('w') => timeframe.to_ascii_uppercase(),
        _ => timeframe.to_string(),
    }
}
