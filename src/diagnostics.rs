//! Indicator snapshots and EMA warm-up diagnostics
//!
//! Read-only views over the same closed bars the session trades on. The live
//! loop logs them periodically; the `snapshot` command prints one and exits.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::Config;
use crate::indicators::{ema, macd, market_structure, recent_swing_levels, MacdPair};
use crate::trend::HtfObservation;
use crate::zones::{entry_zone, PriceZone};
use crate::{Candle, Direction};

/// Everything the entry logic looks at, for one point in time
#[derive(Debug, Clone, Serialize)]
pub struct IndicatorSnapshot {
    pub price: Option<f64>,
    pub htf: Option<HtfObservation>,
    pub ltf_bar_time: Option<DateTime<Utc>>,
    pub ltf_close: Option<f64>,
    /// Zone for the current higher-timeframe direction
    pub zone: Option<PriceZone>,
    pub macd: Option<MacdPair>,
    pub structure_trend: Option<Direction>,
    pub swing_low: Option<f64>,
    pub swing_high: Option<f64>,
}

impl IndicatorSnapshot {
    pub fn compute(config: &Config, htf_closed: &[Candle], ltf_closed: &[Candle], price: Option<f64>) -> Self {
        let htf = HtfObservation::from_closed(htf_closed, config.trend.ema_fast, config.trend.ema_slow);
        let zone = htf
            .and_then(|obs| obs.direction)
            .and_then(|direction| entry_zone(ltf_closed, direction, &config.entry.zone));
        let closes: Vec<f64> = ltf_closed.iter().map(|c| c.close).collect();
        let entry = &config.entry;
        let swings = recent_swing_levels(
            ltf_closed,
            config.initial_stop.swing_lookback,
            config.initial_stop.swing_strength,
        );

        Self {
            price,
            htf,
            ltf_bar_time: ltf_closed.last().map(|c| c.open_time),
            ltf_close: ltf_closed.last().map(|c| c.close),
            zone,
            macd: macd(&closes, entry.macd_fast, entry.macd_slow, entry.macd_signal),
            structure_trend: market_structure(ltf_closed, entry.structure_left, entry.structure_right).trend,
            swing_low: swings.map(|(low, _)| low),
            swing_high: swings.map(|(_, high)| high),
        }
    }

    pub fn log(&self, stage: &str) {
        tracing::info!(
            stage,
            price = ?self.price,
            htf_direction = ?self.htf.and_then(|o| o.direction),
            htf_bar = ?self.htf.map(|o| o.bar_time),
            ema_fast = ?self.htf.and_then(|o| o.ema_fast),
            ema_slow = ?self.htf.and_then(|o| o.ema_slow),
            ltf_bar = ?self.ltf_bar_time,
            zone_low = ?self.zone.map(|z| z.low),
            zone_high = ?self.zone.map(|z| z.high),
            dif = ?self.macd.map(|m| m.dif_now),
            dea = ?self.macd.map(|m| m.dea_now),
            structure = ?self.structure_trend,
            "snapshot"
        );
    }
}

/// How far an EMA is from being defined on a window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarmupStatus {
    pub timeframe: String,
    pub period: usize,
    pub bars: usize,
    pub value: Option<f64>,
}

impl WarmupStatus {
    pub fn ready(&self) -> bool {
        self.value.is_some()
    }

    /// Closed bars still missing before the EMA has a value
    pub fn missing(&self) -> usize {
        self.period.saturating_sub(self.bars)
    }
}

pub fn ema_warmup(timeframe: &str, closed: &[Candle], periods: &[usize]) -> Vec<WarmupStatus> {
    let closes: Vec<f64> = closed.iter().map(|c| c.close).collect();
    periods
        .iter()
        .map(|&period| WarmupStatus {
            timeframe: timeframe.to_string(),
            period,
            bars: closes.len(),
            value: ema(&closes, period),
        })
        .collect()
}

pub fn log_warmup(statuses: &[WarmupStatus]) {
    for s in statuses {
        if s.ready() {
            tracing::info!(timeframe = %s.timeframe, period = s.period, bars = s.bars, value = ?s.value, "EMA ready");
        } else {
            tracing::warn!(
                timeframe = %s.timeframe,
                period = s.period,
                bars = s.bars,
                missing = s.missing(),
                "EMA warming up, not enough closed bars"
            );
        }
    }
}

/// Fires at most once per `interval`
#[derive(Debug, Clone)]
pub struct Every {
    interval: Duration,
    last: Option<DateTime<Utc>>,
}

impl Every {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    pub fn secs(secs: u64) -> Self {
        Self::new(Duration::seconds(secs as i64))
    }

    /// `true` on the first call and whenever `interval` has passed since the
    /// last `true`
    pub fn due(&mut self, now: DateTime<Utc>) -> bool {
        match self.last {
            Some(last) if now - last < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
