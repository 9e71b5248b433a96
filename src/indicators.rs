//! Technical indicators
//!
//! Pure functions over price series. All moving averages are SMA-seeded:
//! the first defined value is the simple mean of the first `period` inputs,
//! after which `ema = x * k + ema_prev * (1 - k)` with `k = 2 / (period + 1)`.
//!
//! Available indicators:
//! - Moving averages: EMA (series and last value)
//! - Momentum: MACD (DIF/DEA) with cross detection
//! - Structure: swing highs/lows, BOS/CHOCH classification

use serde::Serialize;

use crate::{Candle, Direction};

// =============================================================================
// Moving Averages
// =============================================================================

/// Calculate Exponential Moving Average, aligned with the input.
///
/// Elements before the seed are `None`. The whole series is `None` when there
/// are fewer than `period` values.
pub fn ema_series(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }

    let k = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = Some(seed);

    let mut prev = seed;
    for (i, v) in values.iter().enumerate().skip(period) {
        prev = v * k + prev * (1.0 - k);
        out[i] = Some(prev);
    }
    out
}

/// Last value of [`ema_series`], `None` if `values.len() < period`
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    ema_series(values, period).last().copied().flatten()
}

// =============================================================================
// MACD
// =============================================================================

/// The last two DIF/DEA samples, enough to detect a cross on the newest bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MacdPair {
    pub dif_prev: f64,
    pub dif_now: f64,
    pub dea_prev: f64,
    pub dea_now: f64,
}

impl MacdPair {
    pub fn crossed_up(&self) -> bool {
        cross_up(self.dif_prev, self.dif_now, self.dea_prev, self.dea_now)
    }

    pub fn crossed_down(&self) -> bool {
        cross_down(self.dif_prev, self.dif_now, self.dea_prev, self.dea_now)
    }

    /// DIF crossed DEA in the given direction on the newest sample
    pub fn crossed(&self, direction: Direction) -> bool {
        match direction {
            Direction::Long => self.crossed_up(),
            Direction::Short => self.crossed_down(),
        }
    }

    /// Pre-cross bias: DIF below DEA for a long setup, above for a short one
    pub fn has_setup_bias(&self, direction: Direction) -> bool {
        match direction {
            Direction::Long => self.dif_now < self.dea_now,
            Direction::Short => self.dif_now > self.dea_now,
        }
    }
}

/// MACD over closes.
///
/// DIF is `ema(fast) - ema(slow)` from the first bar where both are defined;
/// DEA is the SMA-seeded EMA of DIF. Returns `None` when
/// `closes.len() < slow + signal + 2`.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<MacdPair> {
    if fast == 0 || slow == 0 || signal == 0 || closes.len() < slow + signal + 2 {
        return None;
    }

    let fast_ema = ema_series(closes, fast);
    let slow_ema = ema_series(closes, slow);
    let dif: Vec<f64> = fast_ema
        .iter()
        .zip(slow_ema.iter())
        .filter_map(|(f, s)| Some((*f)? - (*s)?))
        .collect();

    let dea = ema_series(&dif, signal);
    let n = dif.len();
    if n < 2 {
        return None;
    }

    Some(MacdPair {
        dif_prev: dif[n - 2],
        dif_now: dif[n - 1],
        dea_prev: dea[n - 2]?,
        dea_now: dea[n - 1]?,
    })
}

/// DIF crosses above DEA: tie allowed on the prior sample, strict now
pub fn cross_up(prev_dif: f64, now_dif: f64, prev_dea: f64, now_dea: f64) -> bool {
    prev_dif <= prev_dea && now_dif > now_dea
}

/// DIF crosses below DEA: tie allowed on the prior sample, strict now
pub fn cross_down(prev_dif: f64, now_dif: f64, prev_dea: f64, now_dea: f64) -> bool {
    prev_dif >= prev_dea && now_dif < now_dea
}

// =============================================================================
// Swing Points & Market Structure
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SwingKind {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SwingPoint {
    pub index: usize,
    pub kind: SwingKind,
    pub price: f64,
}

/// Finds swing highs and lows.
///
/// Bar `i` is a swing high when its high is the maximum of the window
/// `[i - left, i + right]` (ties allowed), and a swing low when its low is
/// the minimum. Bars without a full window on both sides are skipped. A bar
/// can be both. Output is ordered by index, highs before lows on the same bar.
pub fn swing_points(candles: &[Candle], left: usize, right: usize) -> Vec<SwingPoint> {
    let mut points = Vec::new();
    if candles.len() < left + right + 1 {
        return points;
    }

    for i in left..candles.len() - right {
        let window = &candles[i - left..=i + right];
        let bar = &candles[i];
        if window.iter().all(|c| bar.high >= c.high) {
            points.push(SwingPoint {
                index: i,
                kind: SwingKind::High,
                price: bar.high,
            });
        }
        if window.iter().all(|c| bar.low <= c.low) {
            points.push(SwingPoint {
                index: i,
                kind: SwingKind::Low,
                price: bar.low,
            });
        }
    }
    points
}

/// Most recent swing low and swing high within the last `lookback` bars.
///
/// Uses a symmetric strength of `k` bars. When no swing of a kind exists the
/// window minimum low / maximum high is used instead. Returns `(low, high)`.
pub fn recent_swing_levels(candles: &[Candle], lookback: usize, k: usize) -> Option<(f64, f64)> {
    if candles.is_empty() {
        return None;
    }
    let window = if candles.len() < lookback + 2 * k + 1 {
        candles
    } else {
        &candles[candles.len() - lookback..]
    };

    let swings = swing_points(window, k, k);
    let last_of = |kind: SwingKind| {
        swings
            .iter()
            .rev()
            .find(|p| p.kind == kind)
            .map(|p| p.price)
    };

    let low = last_of(SwingKind::Low)
        .unwrap_or_else(|| window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min));
    let high = last_of(SwingKind::High).unwrap_or_else(|| {
        window
            .iter()
            .map(|c| c.high)
            .fold(f64::NEG_INFINITY, f64::max)
    });
    Some((low, high))
}

/// Structure break classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakKind {
    /// Break of structure: continuation of the current trend
    Bos,
    /// Change of character: break against the current trend
    Choch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StructureEvent {
    pub index: usize,
    pub kind: BreakKind,
    pub direction: Direction,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MarketStructure {
    pub trend: Option<Direction>,
    pub events: Vec<StructureEvent>,
}

impl MarketStructure {
    /// CHOCH direction produced by the newest bar, if any
    pub fn choch_on(&self, index: usize) -> Option<Direction> {
        self.events
            .iter()
            .rev()
            .take_while(|e| e.index == index)
            .find(|e| e.kind == BreakKind::Choch)
            .map(|e| e.direction)
    }
}

/// Walks closed bars and classifies closes beyond swing levels.
///
/// A swing at index `j` becomes usable once bar `j + right` has closed. A
/// close above the last unbroken swing high is a bullish break, below the
/// last unbroken swing low a bearish one. Each level breaks once. A break
/// against the running trend is a CHOCH and flips it; any other break is a
/// BOS and confirms it.
pub fn market_structure(candles: &[Candle], left: usize, right: usize) -> MarketStructure {
    let swings = swing_points(candles, left, right);
    let mut structure = MarketStructure::default();
    let mut next_swing = 0;
    let mut last_high: Option<f64> = None;
    let mut last_low: Option<f64> = None;

    for (i, bar) in candles.iter().enumerate() {
        while next_swing < swings.len() && swings[next_swing].index + right <= i {
            let p = swings[next_swing];
            match p.kind {
                SwingKind::High => last_high = Some(p.price),
                SwingKind::Low => last_low = Some(p.price),
            }
            next_swing += 1;
        }

        if let Some(level) = last_high {
            if bar.close > level {
                structure.push_break(i, Direction::Long);
                last_high = None;
            }
        }
        if let Some(level) = last_low {
            if bar.close < level {
                structure.push_break(i, Direction::Short);
                last_low = None;
            }
        }
    }
    structure
}

impl MarketStructure {
    fn push_break(&mut self, index: usize, direction: Direction) {
        let kind = match self.trend {
            Some(t) if t != direction => BreakKind::Choch,
            _ => BreakKind::Bos,
        };
        self.trend = Some(direction);
        self.events.push(StructureEvent {
            index,
            kind,
            direction,
        });
    }
}
