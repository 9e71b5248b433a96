//! Higher-timeframe direction tracking
//!
//! [`TrendBaseline`] remembers the last confirmed direction and emits a
//! [`CrossEvent`] when a different, determinate direction shows up on a new
//! closed bar. [`OppositeCounter`] counts how many consecutive new bars have
//! pointed against a held position.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::indicators::ema;
use crate::{Candle, Direction};

/// Direction read from the newest closed higher-timeframe bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HtfObservation {
    pub bar_time: DateTime<Utc>,
    /// `None` when the EMAs are equal or not yet defined
    pub direction: Option<Direction>,
    pub ema_fast: Option<f64>,
    pub ema_slow: Option<f64>,
    pub close: f64,
}

impl HtfObservation {
    /// Classifies closed bars by EMA-fast vs EMA-slow
    pub fn from_closed(closed: &[Candle], fast: usize, slow: usize) -> Option<Self> {
        let last = closed.last()?;
        let closes: Vec<f64> = closed.iter().map(|c| c.close).collect();
        let ema_fast = ema(&closes, fast);
        let ema_slow = ema(&closes, slow);
        let direction = match (ema_fast, ema_slow) {
            (Some(f), Some(s)) if f > s => Some(Direction::Long),
            (Some(f), Some(s)) if f < s => Some(Direction::Short),
            _ => None,
        };
        Some(Self {
            bar_time: last.open_time,
            direction,
            ema_fast,
            ema_slow,
            close: last.close,
        })
    }
}

/// A determinate direction differing from the baseline, first seen on `bar_time`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CrossEvent {
    pub direction: Direction,
    pub bar_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct TrendBaseline {
    direction: Option<Direction>,
    bar_time: Option<DateTime<Utc>>,
    last_event_bar: Option<DateTime<Utc>>,
}

impl TrendBaseline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    pub fn bar_time(&self) -> Option<DateTime<Utc>> {
        self.bar_time
    }

    /// Adopts the observed direction as the new baseline and forgets
    /// which bar last produced an event.
    pub fn reset(&mut self, obs: &HtfObservation) {
        self.direction = obs.direction;
        self.bar_time = Some(obs.bar_time);
        self.last_event_bar = None;
        tracing::debug!(
            baseline = ?obs.direction,
            bar_time = %obs.bar_time,
            ema_fast = ?obs.ema_fast,
            ema_slow = ?obs.ema_slow,
            "HTF baseline set"
        );
    }

    /// Feeds the latest closed-bar observation.
    ///
    /// An indeterminate baseline is re-seeded from the observation without
    /// an event. Otherwise a determinate direction different from the
    /// baseline yields a cross event at most once per bar timestamp.
    pub fn observe(&mut self, obs: &HtfObservation) -> Option<CrossEvent> {
        if self.direction.is_none() {
            self.reset(obs);
            return None;
        }
        let current = obs.direction?;
        if Some(current) == self.direction || self.last_event_bar == Some(obs.bar_time) {
            return None;
        }
        self.last_event_bar = Some(obs.bar_time);
        Some(CrossEvent {
            direction: current,
            bar_time: obs.bar_time,
        })
    }
}

/// Consecutive new closed bars showing the same direction against a position
#[derive(Debug, Clone, Default)]
pub struct OppositeCounter {
    direction: Option<Direction>,
    count: u32,
    last_bar: Option<DateTime<Utc>>,
}

impl OppositeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Updates the counter for a position held in `held` and returns it.
    ///
    /// Repeated observations of the same bar do not count twice. Any bar
    /// that is not opposite (same side or indeterminate) resets to zero.
    pub fn observe(&mut self, held: Direction, obs: &HtfObservation) -> u32 {
        let opposite = held.opposite();
        if obs.direction != Some(opposite) {
            self.reset();
            return 0;
        }
        if self.last_bar != Some(obs.bar_time) {
            if self.direction == Some(opposite) {
                self.count += 1;
            } else {
                self.direction = Some(opposite);
                self.count = 1;
            }
            self.last_bar = Some(obs.bar_time);
        }
        self.count
    }
}
