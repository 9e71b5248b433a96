//! Entry zones and volume-weighted reference levels
//!
//! A zone is the price band a pullback must reach before the entry planner
//! starts waiting for confirmation. Zones are either a retracement of the
//! window's swing range or the lower-timeframe EMA (a degenerate band).

use ordered_float::OrderedFloat;
use serde::Serialize;

use crate::config::{PocConfig, ZoneMode};
use crate::indicators::ema;
use crate::{Candle, Direction};

/// Closed price band `[low, high]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceZone {
    pub low: f64,
    pub high: f64,
}

impl PriceZone {
    /// Builds a zone from two bounds in any order
    pub fn new(a: f64, b: f64) -> Self {
        Self {
            low: a.min(b),
            high: a.max(b),
        }
    }

    pub fn at(level: f64) -> Self {
        Self {
            low: level,
            high: level,
        }
    }

    pub fn mid(&self) -> f64 {
        (self.low + self.high) / 2.0
    }

    fn tolerance(&self, tolerance_pct: f64) -> f64 {
        self.mid().abs() * tolerance_pct
    }

    /// Containment with a symmetric tolerance around both bounds
    pub fn contains(&self, price: f64, tolerance_pct: f64) -> bool {
        let tol = self.tolerance(tolerance_pct);
        price >= self.low - tol && price <= self.high + tol
    }

    /// Whether a bar reached the zone from the side a pullback comes from.
    ///
    /// A long setup waits for price to dip into the zone (`low <= high + tol`);
    /// a short setup waits for a rally into it (`high >= low - tol`).
    pub fn touched_by(&self, bar: &Candle, direction: Direction, tolerance_pct: f64) -> bool {
        let tol = self.tolerance(tolerance_pct);
        match direction {
            Direction::Long => bar.low <= self.high + tol,
            Direction::Short => bar.high >= self.low - tol,
        }
    }
}

/// `(min low, max high)` over the window
pub fn swing_range(candles: &[Candle]) -> Option<(f64, f64)> {
    if candles.is_empty() {
        return None;
    }
    let low = candles.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let high = candles
        .iter()
        .map(|c| c.high)
        .fold(f64::NEG_INFINITY, f64::max);
    Some((low, high))
}

/// Retracement band of the window's swing range.
///
/// Long: `[high - max_f * R, high - min_f * R]`; short mirrors from the low:
/// `[low + min_f * R, low + max_f * R]`.
pub fn retracement_zone(
    candles: &[Candle],
    direction: Direction,
    min_fraction: f64,
    max_fraction: f64,
) -> Option<PriceZone> {
    let (low, high) = swing_range(candles)?;
    let range = high - low;
    if range <= 0.0 {
        return None;
    }
    Some(match direction {
        Direction::Long => PriceZone::new(high - max_fraction * range, high - min_fraction * range),
        Direction::Short => PriceZone::new(low + min_fraction * range, low + max_fraction * range),
    })
}

/// Degenerate zone at the EMA of closes
pub fn ema_zone(candles: &[Candle], period: usize) -> Option<PriceZone> {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    ema(&closes, period).map(PriceZone::at)
}

/// Entry zone for a setup in `direction`, built from closed bars only
pub fn entry_zone(closed: &[Candle], direction: Direction, mode: &ZoneMode) -> Option<PriceZone> {
    match *mode {
        ZoneMode::Ema { period } => ema_zone(closed, period),
        ZoneMode::Retracement {
            min_fraction,
            max_fraction,
            lookback,
        } => {
            let start = closed.len().saturating_sub(lookback);
            retracement_zone(&closed[start..], direction, min_fraction, max_fraction)
        }
    }
}

/// Point of control of a simple volume profile.
///
/// Typical price × volume of every bar is accumulated into `bins` equal-width
/// bins across the window's range; the midpoint of the heaviest bin is
/// returned. The first bin wins ties.
pub fn volume_profile_poc(candles: &[Candle], bins: usize) -> Option<f64> {
    let (low, high) = swing_range(candles)?;
    if bins == 0 || high <= low {
        return None;
    }
    let width = (high - low) / bins as f64;
    let mut profile = vec![0.0_f64; bins];
    for bar in candles {
        let tp = bar.typical_price();
        let idx = (((tp - low) / width) as usize).min(bins - 1);
        profile[idx] += tp * bar.volume;
    }

    let (best, weight) = profile
        .iter()
        .enumerate()
        .rev()
        .max_by_key(|(_, w)| OrderedFloat(**w))?;
    if *weight <= 0.0 {
        return None;
    }
    Some(low + width * (best as f64 + 0.5))
}

/// Stop anchor for a new position: the swing level, unless the window's POC
/// sits inside the configured sub-zone, in which case the POC is used.
///
/// The sub-zone is measured from the favourable extreme of the range (the
/// high for longs, the low for shorts), like the retracement zone.
pub fn stop_anchor(candles: &[Candle], direction: Direction, swing_level: f64, poc: Option<&PocConfig>) -> f64 {
    let Some(cfg) = poc else {
        return swing_level;
    };
    let Some(level) = volume_profile_poc(candles, cfg.bins) else {
        return swing_level;
    };
    match retracement_zone(candles, direction, cfg.min_fraction, cfg.max_fraction) {
        Some(zone) if zone.contains(level, 0.0) => {
            tracing::debug!(poc = level, swing = swing_level, "POC inside sub-zone, using it as stop anchor");
            level
        }
        _ => swing_level,
    }
}
