//! OKX v5 REST gateway for a single perpetual swap
//!
//! Every request goes through the circuit breaker and the rate limiter.
//! Reads are retried on transient errors with a fixed backoff; orders are
//! sent once.
//!
//! Orders are first sent in hedge (long/short) mode with `posSide`; an
//! account in one-way (net) mode rejects that, so the order is re-sent
//! without it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, Method};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::auth::Credentials;
use super::{okx_bar, ExecutionGateway, RetryPolicy};
use crate::common::{CircuitBreaker, CircuitBreakerConfig, RateLimiter};
use crate::config::Config;
use crate::error::{classify_http_status, classify_okx_code, ErrorKind, GatewayError, GatewayResult};
use crate::{Candle, Direction, ExchangePosition, InstrumentSpec, MarginMode, OrderParams, OrderSide, Ticker};

/// Page size of `/market/candles`
const RECENT_PAGE: usize = 300;
/// Page size of `/market/history-candles`
const HISTORY_PAGE: usize = 100;
const QUOTE_CCY: &str = "USDT";

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct Envelope {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct RawTicker {
    last: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawPosition {
    #[serde(default)]
    pos_side: String,
    #[serde(default)]
    pos: String,
    #[serde(default)]
    avg_px: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawBalance {
    #[serde(default)]
    details: Vec<RawBalanceDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawBalanceDetail {
    ccy: String,
    #[serde(default)]
    avail_bal: String,
    #[serde(default)]
    ord_frozen: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInstrument {
    ct_val: String,
    lot_sz: String,
    min_sz: String,
    tick_sz: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrderAck {
    #[serde(default)]
    ord_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPendingOrder {
    ord_id: String,
}

// ============================================================================
// Parsing helpers
// ============================================================================

fn num(value: &str) -> f64 {
    value.trim().parse().unwrap_or(0.0)
}

fn required_num(value: &str, field: &str) -> GatewayResult<f64> {
    value
        .trim()
        .parse()
        .map_err(|_| GatewayError::unknown(format!("bad {} value: {:?}", field, value)))
}

/// One `[ts, o, h, l, c, vol, ...]` row
pub(crate) fn parse_candle_row(row: &[String]) -> GatewayResult<Candle> {
    if row.len() < 6 {
        return Err(GatewayError::unknown(format!("short candle row: {:?}", row)));
    }
    let ms = row[0]
        .parse::<i64>()
        .map_err(|_| GatewayError::unknown(format!("bad candle ts: {}", row[0])))?;
    let open_time: DateTime<Utc> = Utc
        .timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| GatewayError::unknown(format!("bad candle ts: {}", ms)))?;
    Ok(Candle {
        open_time,
        open: required_num(&row[1], "open")?,
        high: required_num(&row[2], "high")?,
        low: required_num(&row[3], "low")?,
        close: required_num(&row[4], "close")?,
        volume: num(&row[5]),
    })
}

/// First non-zero position; `posSide` decides the side, or the sign of
/// `pos` in net mode
pub(crate) fn parse_position(rows: &[RawPosition]) -> Option<ExchangePosition> {
    rows.iter().find_map(|row| {
        let pos = num(&row.pos);
        if pos == 0.0 {
            return None;
        }
        let side = match row.pos_side.as_str() {
            "long" => Direction::Long,
            "short" => Direction::Short,
            _ if pos > 0.0 => Direction::Long,
            _ => Direction::Short,
        };
        Some(ExchangePosition {
            side,
            size: pos.abs(),
            entry_price: num(&row.avg_px),
        })
    })
}

/// `availBal - ordFrozen` of the quote currency, never negative
pub(crate) fn parse_available(rows: &[RawBalance], ccy: &str) -> f64 {
    rows.iter()
        .flat_map(|b| b.details.iter())
        .find(|d| d.ccy == ccy)
        .map(|d| (num(&d.avail_bal) - num(&d.ord_frozen)).max(0.0))
        .unwrap_or(0.0)
}

/// Error for a non-zero envelope, preferring the per-item `sCode`
fn envelope_error(code: &str, msg: &str, data: &Value) -> GatewayError {
    let item = data.as_array().and_then(|items| items.first());
    let s_code = item.and_then(|i| i.get("sCode")).and_then(Value::as_str);
    let s_msg = item.and_then(|i| i.get("sMsg")).and_then(Value::as_str);
    match s_code {
        Some(sc) if sc != "0" => GatewayError::new(
            classify_okx_code(sc),
            format!("OKX {}: {}", sc, s_msg.unwrap_or(msg)),
        ),
        _ => GatewayError::new(classify_okx_code(code), format!("OKX {}: {}", code, msg)),
    }
}

/// Contract count as OKX expects it (`sz`)
fn format_size(size: f64) -> String {
    Decimal::from_f64(size)
        .map(|d| d.round_dp(8).normalize().to_string())
        .unwrap_or_else(|| size.to_string())
}

// ============================================================================
// Gateway
// ============================================================================

#[derive(Clone)]
pub struct OkxGateway {
    http_client: Client,
    credentials: Option<Credentials>,
    base_url: String,
    inst_id: String,
    margin_mode: MarginMode,
    demo: bool,
    circuit_breaker: Arc<Mutex<CircuitBreaker>>,
    rate_limiter: RateLimiter,
    retry: RetryPolicy,
    instrument: Arc<Mutex<Option<InstrumentSpec>>>,
}

impl OkxGateway {
    pub fn from_config(config: &Config) -> Result<Self> {
        let ex = &config.exchange;
        let http_client = Client::builder()
            .timeout(Duration::from_secs(ex.timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("Failed to build HTTP client")?;

        let credentials = match (&ex.api_key, &ex.api_secret, &ex.passphrase) {
            (Some(key), Some(secret), Some(pass)) => Some(Credentials::new(key, secret, pass)),
            _ => None,
        };

        Ok(Self {
            http_client,
            credentials,
            base_url: ex.base_url.trim_end_matches('/').to_string(),
            inst_id: config.instrument.symbol.clone(),
            margin_mode: config.instrument.margin_mode,
            demo: ex.demo,
            circuit_breaker: Arc::new(Mutex::new(CircuitBreaker::new(
                CircuitBreakerConfig::default(),
            ))),
            rate_limiter: RateLimiter::per_second(ex.rate_limit),
            retry: RetryPolicy::new(ex.max_retries, Duration::from_millis(ex.retry_backoff_ms)),
            instrument: Arc::new(Mutex::new(None)),
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// One HTTP round trip with breaker and limiter; `data` deserialized
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        signed: bool,
    ) -> GatewayResult<Vec<T>> {
        {
            let mut cb = self.circuit_breaker.lock().await;
            if !cb.allow(Instant::now()) {
                return Err(GatewayError::transient(format!(
                    "circuit breaker open, retry in {:?}",
                    cb.remaining_cool_down(Instant::now())
                )));
            }
        }
        self.rate_limiter.acquire().await;

        let result = self.send::<T>(method, path, body, signed).await;

        let mut cb = self.circuit_breaker.lock().await;
        match &result {
            Err(e) if e.kind == ErrorKind::Transient => cb.record_failure(Instant::now()),
            _ => cb.record_success(),
        }
        result
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        signed: bool,
    ) -> GatewayResult<Vec<T>> {
        let body_text = match body {
            Some(b) => serde_json::to_string(b)?,
            None => String::new(),
        };
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http_client
            .request(method.clone(), &url)
            .header("Content-Type", "application/json");

        if signed {
            let creds = self
                .credentials
                .as_ref()
                .ok_or_else(|| GatewayError::rejected("OKX credentials not configured"))?;
            let headers = creds.headers(Utc::now(), method.as_str(), path, &body_text);
            request = request
                .header("OK-ACCESS-KEY", creds.api_key())
                .header("OK-ACCESS-SIGN", headers.signature)
                .header("OK-ACCESS-TIMESTAMP", headers.timestamp)
                .header("OK-ACCESS-PASSPHRASE", creds.passphrase());
        }
        if self.demo {
            request = request.header("x-simulated-trading", "1");
        }
        if body.is_some() {
            request = request.body(body_text);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        tracing::trace!(%path, status = status.as_u16(), body = %text, "OKX response");

        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(env) => env,
            Err(_) if !status.is_success() => {
                return Err(GatewayError::new(
                    classify_http_status(status.as_u16()),
                    format!("HTTP {}: {}", status, text),
                ))
            }
            Err(e) => return Err(e.into()),
        };
        if envelope.code != "0" {
            return Err(envelope_error(&envelope.code, &envelope.msg, &envelope.data));
        }
        if envelope.data.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(envelope.data)?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, signed: bool) -> GatewayResult<Vec<T>> {
        self.retry
            .run(path, || self.request::<T>(Method::GET, path, None, signed))
            .await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> GatewayResult<Vec<T>> {
        self.request::<T>(Method::POST, path, Some(body), true).await
    }

    async fn place_order(&self, body: Value) -> GatewayResult<String> {
        let acks: Vec<RawOrderAck> = self.post("/api/v5/trade/order", &body).await?;
        Ok(acks.into_iter().next().map(|a| a.ord_id).unwrap_or_default())
    }
}

#[async_trait]
impl ExecutionGateway for OkxGateway {
    async fn fetch_ohlcv(&self, timeframe: &str, limit: usize) -> GatewayResult<Vec<Candle>> {
        let bar = okx_bar(timeframe);
        let mut newest_first: Vec<Candle> = Vec::with_capacity(limit);
        let mut after: Option<i64> = None;

        while newest_first.len() < limit {
            let remaining = limit - newest_first.len();
            let path = match after {
                None => format!(
                    "/api/v5/market/candles?instId={}&bar={}&limit={}",
                    self.inst_id,
                    bar,
                    remaining.min(RECENT_PAGE)
                ),
                Some(ts) => format!(
                    "/api/v5/market/history-candles?instId={}&bar={}&after={}&limit={}",
                    self.inst_id,
                    bar,
                    ts,
                    remaining.min(HISTORY_PAGE)
                ),
            };
            let rows: Vec<Vec<String>> = self.get(&path, false).await?;
            if rows.is_empty() {
                break;
            }
            let mut added = 0;
            for row in &rows {
                let candle = parse_candle_row(row)?;
                let older = newest_first
                    .last()
                    .map_or(true, |last| candle.open_time < last.open_time);
                if older {
                    newest_first.push(candle);
                    added += 1;
                }
            }
            if added == 0 {
                break;
            }
            after = newest_first.last().map(|c| c.open_time.timestamp_millis());
        }

        newest_first.truncate(limit);
        newest_first.reverse();
        tracing::trace!(timeframe, bars = newest_first.len(), "Fetched candles");
        Ok(newest_first)
    }

    async fn fetch_ticker(&self) -> GatewayResult<Ticker> {
        let path = format!("/api/v5/market/ticker?instId={}", self.inst_id);
        let rows: Vec<RawTicker> = self.get(&path, false).await?;
        let raw = rows
            .first()
            .ok_or_else(|| GatewayError::unknown("empty ticker response"))?;
        Ok(Ticker {
            last: required_num(&raw.last, "last")?,
        })
    }

    async fn fetch_position(&self) -> GatewayResult<Option<ExchangePosition>> {
        let path = format!("/api/v5/account/positions?instType=SWAP&instId={}", self.inst_id);
        let rows: Vec<RawPosition> = self.get(&path, true).await?;
        Ok(parse_position(&rows))
    }

    async fn fetch_available_collateral(&self) -> GatewayResult<f64> {
        let path = format!("/api/v5/account/balance?ccy={}", QUOTE_CCY);
        let rows: Vec<RawBalance> = self.get(&path, true).await?;
        Ok(parse_available(&rows, QUOTE_CCY))
    }

    async fn open_market(
        &self,
        side: OrderSide,
        size: f64,
        params: OrderParams,
        position_side: Direction,
    ) -> GatewayResult<()> {
        let sz = format_size(size);
        let hedge = json!({
            "instId": self.inst_id,
            "tdMode": params.margin_mode.as_str(),
            "side": side.as_str(),
            "ordType": "market",
            "sz": sz,
            "posSide": position_side.as_str(),
        });
        tracing::info!(side = side.as_str(), sz = %sz, reduce_only = params.reduce_only, "Placing market order");

        match self.place_order(hedge).await {
            Ok(ord_id) => {
                tracing::info!(%ord_id, "Order accepted (hedge mode)");
                Ok(())
            }
            Err(e) if e.kind == ErrorKind::Rejected => {
                tracing::debug!(error = %e, "Hedge-mode order rejected, retrying in one-way mode");
                let mut net = json!({
                    "instId": self.inst_id,
                    "tdMode": params.margin_mode.as_str(),
                    "side": side.as_str(),
                    "ordType": "market",
                    "sz": sz,
                });
                if params.reduce_only {
                    net["reduceOnly"] = Value::Bool(true);
                }
                let ord_id = self.place_order(net).await?;
                tracing::info!(%ord_id, "Order accepted (one-way mode)");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn cancel_all_open_orders(&self) -> GatewayResult<usize> {
        let path = format!("/api/v5/trade/orders-pending?instType=SWAP&instId={}", self.inst_id);
        let pending: Vec<RawPendingOrder> = self.get(&path, true).await?;
        let mut cancelled = 0;
        for order in &pending {
            let body = json!({ "instId": self.inst_id, "ordId": order.ord_id });
            match self.post::<Value>("/api/v5/trade/cancel-order", &body).await {
                Ok(_) => cancelled += 1,
                Err(e) => tracing::warn!(ord_id = %order.ord_id, error = %e, "Cancel failed"),
            }
        }
        if cancelled < pending.len() {
            return Err(GatewayError::transient(format!(
                "cancelled {} of {} pending orders",
                cancelled,
                pending.len()
            )));
        }
        Ok(cancelled)
    }

    async fn set_leverage(&self, leverage: f64) -> GatewayResult<()> {
        let lever = format_size(leverage);
        let body = json!({
            "instId": self.inst_id,
            "lever": lever,
            "mgnMode": self.margin_mode.as_str(),
        });
        match self.post::<Value>("/api/v5/account/set-leverage", &body).await {
            Ok(_) => Ok(()),
            // isolated margin in hedge mode needs one call per leg
            Err(e) if e.kind == ErrorKind::Rejected && self.margin_mode == MarginMode::Isolated => {
                for leg in [Direction::Long, Direction::Short] {
                    let mut per_leg = body.clone();
                    per_leg["posSide"] = Value::String(leg.as_str().to_string());
                    self.post::<Value>("/api/v5/account/set-leverage", &per_leg).await?;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn instrument(&self) -> GatewayResult<InstrumentSpec> {
        let mut cached = self.instrument.lock().await;
        if let Some(spec) = *cached {
            return Ok(spec);
        }
        let path = format!("/api/v5/public/instruments?instType=SWAP&instId={}", self.inst_id);
        let rows: Vec<RawInstrument> = self.get(&path, false).await?;
        let raw = rows
            .first()
            .ok_or_else(|| GatewayError::rejected(format!("unknown instrument {}", self.inst_id)))?;
        let spec = InstrumentSpec {
            contract_size: required_num(&raw.ct_val, "ctVal")?,
            lot_step: required_num(&raw.lot_sz, "lotSz")?,
            min_lot: required_num(&raw.min_sz, "minSz")?,
            tick_size: required_num(&raw.tick_sz, "tickSz")?,
        };
        *cached = Some(spec);
        Ok(spec)
    }
}
