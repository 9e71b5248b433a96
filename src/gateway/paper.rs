//! Paper trading gateway
//!
//! Market data and the instrument spec come from a wrapped gateway; the
//! account is simulated. Market orders fill in full at the last traded
//! price, margin is `notional / leverage` and a taker fee is charged on
//! every fill. Only one leg (long or short) can be open at a time.

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::ExecutionGateway;
use crate::error::{GatewayError, GatewayResult};
use crate::{Candle, Direction, ExchangePosition, InstrumentSpec, OrderParams, OrderSide, Ticker};

#[derive(Debug, Clone)]
struct PaperAccount {
    /// Wallet balance including realized PnL and fees
    cash: f64,
    margin_used: f64,
    leverage: f64,
    position: Option<ExchangePosition>,
    fills: usize,
}

pub struct PaperGateway<G> {
    inner: G,
    account: Mutex<PaperAccount>,
    fee_rate: f64,
}

impl<G: ExecutionGateway> PaperGateway<G> {
    pub fn new(inner: G, starting_balance: f64, leverage: f64) -> Self {
        Self {
            inner,
            account: Mutex::new(PaperAccount {
                cash: starting_balance,
                margin_used: 0.0,
                leverage: leverage.max(1.0),
                position: None,
                fills: 0,
            }),
            fee_rate: 0.0005,
        }
    }

    pub fn with_fee_rate(mut self, fee_rate: f64) -> Self {
        self.fee_rate = fee_rate.max(0.0);
        self
    }

    /// Market data source
    pub fn inner(&self) -> &G {
        &self.inner
    }

    /// Wallet balance (realized PnL and fees included)
    pub async fn balance(&self) -> f64 {
        self.account.lock().await.cash
    }

    pub async fn fill_count(&self) -> usize {
        self.account.lock().await.fills
    }
}

#[async_trait]
impl<G: ExecutionGateway> ExecutionGateway for PaperGateway<G> {
    async fn fetch_ohlcv(&self, timeframe: &str, limit: usize) -> GatewayResult<Vec<Candle>> {
        self.inner.fetch_ohlcv(timeframe, limit).await
    }

    async fn fetch_ticker(&self) -> GatewayResult<Ticker> {
        self.inner.fetch_ticker().await
    }

    async fn fetch_position(&self) -> GatewayResult<Option<ExchangePosition>> {
        Ok(self.account.lock().await.position)
    }

    async fn fetch_available_collateral(&self) -> GatewayResult<f64> {
        let account = self.account.lock().await;
        Ok((account.cash - account.margin_used).max(0.0))
    }

    async fn open_market(
        &self,
        side: OrderSide,
        size: f64,
        params: OrderParams,
        position_side: Direction,
    ) -> GatewayResult<()> {
        if !(size.is_finite() && size > 0.0) {
            return Err(GatewayError::rejected(format!("invalid order size {}", size)));
        }
        let price = self.inner.fetch_ticker().await?.last;
        let spec = self.inner.instrument().await?;
        let notional = spec.notional(size, price);
        let fee = notional * self.fee_rate;

        let mut account = self.account.lock().await;

        if params.reduce_only {
            let Some(mut held) = account.position else {
                return Err(GatewayError::rejected("reduce-only order with no position"));
            };
            if held.side != position_side || side != held.side.exit_side() {
                return Err(GatewayError::rejected("reduce-only order on the wrong side"));
            }
            let closed = size.min(held.size);
            let pnl = held.side.sign() * (price - held.entry_price) * closed * spec.contract_size;
            let released = account.margin_used * closed / held.size;
            account.margin_used -= released;
            account.cash += pnl - fee;
            held.size -= closed;
            account.position = if held.size > 1e-12 { Some(held) } else { None };
            if account.position.is_none() {
                account.margin_used = 0.0;
            }
            account.fills += 1;
            tracing::info!(price, closed, pnl, fee, "Paper close filled");
            return Ok(());
        }

        if side != position_side.entry_side() {
            return Err(GatewayError::rejected("order side does not match position side"));
        }
        if let Some(held) = account.position {
            if held.side != position_side {
                return Err(GatewayError::rejected("opposite position already open"));
            }
        }

        let margin = notional / account.leverage;
        let available = account.cash - account.margin_used;
        if margin + fee > available {
            return Err(GatewayError::insufficient_funds(format!(
                "margin {:.2} + fee {:.2} exceeds available {:.2}",
                margin, fee, available
            )));
        }

        account.cash -= fee;
        account.margin_used += margin;
        account.position = Some(match account.position {
            Some(held) => {
                let total = held.size + size;
                ExchangePosition {
                    side: held.side,
                    size: total,
                    entry_price: (held.entry_price * held.size + price * size) / total,
                }
            }
            None => ExchangePosition {
                side: position_side,
                size,
                entry_price: price,
            },
        });
        account.fills += 1;
        tracing::info!(side = side.as_str(), price, size, margin, fee, "Paper order filled");
        Ok(())
    }

    async fn cancel_all_open_orders(&self) -> GatewayResult<usize> {
        Ok(0)
    }

    async fn set_leverage(&self, leverage: f64) -> GatewayResult<()> {
        if !(leverage.is_finite() && leverage >= 1.0) {
            return Err(GatewayError::rejected(format!("invalid leverage {}", leverage)));
        }
        self.account.lock().await.leverage = leverage;
        Ok(())
    }

    async fn instrument(&self) -> GatewayResult<InstrumentSpec> {
        self.inner.instrument().await
    }
}
