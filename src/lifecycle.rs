//! Position lifecycle
//!
//! Tracks the single open position and decides, once per tick, what should
//! happen to it. Evaluation order:
//!
//! 1. adverse higher-timeframe reversal (close now, or tighten the stop)
//! 2. the next un-applied trailing step, if its trigger is reached
//! 3. soft stop
//! 4. auto close at the take-profit distance
//! 5. manual-close alert (rate limited)
//! 6. single scale-in inside the entry band
//!
//! Nothing here talks to the exchange: [`PositionLifecycle::evaluate`] only
//! returns [`LifecycleAction`]s for the session to carry out. The stop only
//! ever moves in the protective direction.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::{Config, ReversalAction, ReversalConfig, ScaleInConfig, StepRule};
use crate::risk;
use crate::{Direction, ExchangePosition, InstrumentSpec};

// ============================================================================
// Tracked state
// ============================================================================

/// What placed the current stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopSource {
    Initial,
    /// 1-based step number
    Step(usize),
    Reversal,
}

/// The position as the controller tracks it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedPosition {
    pub side: Direction,
    pub entry_price: f64,
    /// Contracts, refreshed from the exchange every tick
    pub size: f64,
    pub stop_price: Option<f64>,
    pub stop_source: Option<StopSource>,
    /// Number of trailing steps applied so far
    pub step_index: usize,
    pub opened_at: DateTime<Utc>,
}

impl TrackedPosition {
    pub fn new(side: Direction, entry_price: f64, size: f64, opened_at: DateTime<Utc>) -> Self {
        Self {
            side,
            entry_price,
            size,
            stop_price: None,
            stop_source: None,
            step_index: 0,
            opened_at,
        }
    }

    /// Signed distance from entry in the position's favour
    pub fn profit_points(&self, price: f64) -> f64 {
        self.side.sign() * (price - self.entry_price)
    }

    /// `true` if `candidate` is strictly tighter than the current stop
    pub fn is_more_protective(&self, candidate: f64) -> bool {
        match (self.stop_price, self.side) {
            (None, _) => true,
            (Some(stop), Direction::Long) => candidate > stop,
            (Some(stop), Direction::Short) => candidate < stop,
        }
    }

    fn stop_hit(&self, price: f64) -> bool {
        match (self.stop_price, self.side) {
            (Some(stop), Direction::Long) => price <= stop,
            (Some(stop), Direction::Short) => price >= stop,
            (None, _) => false,
        }
    }

    /// Tag suffix identifying this position in notification keys
    pub fn key(&self) -> String {
        self.opened_at.format("%Y%m%d%H%M%S").to_string()
    }
}

/// One-shot top-up toward the sized notional while price stays near entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleInPlan {
    pub target_notional: f64,
    pub reference_price: f64,
    pub band_low: f64,
    pub band_high: f64,
    pub add_disabled: bool,
    /// Loss-at-stop the whole position may carry after the add, in quote currency
    #[serde(default)]
    pub risk_budget: Option<f64>,
}

impl ScaleInPlan {
    pub fn new(target_notional: f64, reference_price: f64, band_points: f64) -> Self {
        Self {
            target_notional,
            reference_price,
            band_low: reference_price - band_points,
            band_high: reference_price + band_points,
            add_disabled: false,
            risk_budget: None,
        }
    }

    pub fn with_risk_budget(mut self, budget: Option<f64>) -> Self {
        self.risk_budget = budget;
        self
    }

    /// Price beyond which adds are abandoned for good
    pub fn band_stop(&self, side: Direction, extra_points: f64) -> f64 {
        let half_band = (self.band_high - self.band_low) / 2.0;
        self.reference_price - side.sign() * (half_band + extra_points)
    }
}

// ============================================================================
// Decisions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitReason {
    InitialStop,
    StepStop { step: usize },
    ReversalStop,
    AutoClose { points: f64 },
    AdverseReversal,
    /// Position could not be protected after the fill
    Emergency,
    /// Exchange reported flat without an order from us
    External,
}

impl ExitReason {
    fn from_stop(source: Option<StopSource>) -> Self {
        match source {
            Some(StopSource::Step(step)) => ExitReason::StepStop { step },
            Some(StopSource::Reversal) => ExitReason::ReversalStop,
            Some(StopSource::Initial) | None => ExitReason::InitialStop,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::InitialStop => write!(f, "initial stop"),
            ExitReason::StepStop { step } => write!(f, "step-{} stop", step),
            ExitReason::ReversalStop => write!(f, "reversal stop"),
            ExitReason::AutoClose { points } => write!(f, "auto-close {:.0} pts", points),
            ExitReason::AdverseReversal => write!(f, "adverse reversal"),
            ExitReason::Emergency => write!(f, "emergency"),
            ExitReason::External => write!(f, "closed on exchange"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleAction {
    StopMoved {
        from: Option<f64>,
        to: f64,
        source: StopSource,
    },
    /// A profit-locking step was applied (counted as "TP reached")
    TpStepReached { step: usize, stop: f64 },
    Close { reason: ExitReason },
    ManualAlert { profit_points: f64 },
    /// Add up to `remaining_notional` at market
    ScaleIn { remaining_notional: f64 },
    ScaleInDisabled { band_stop: f64 },
}

/// Exit policy parameters
#[derive(Debug, Clone)]
pub struct LifecycleRules {
    pub steps: Vec<StepRule>,
    pub manual_alert_points: f64,
    pub manual_alert_interval: Duration,
    pub auto_close_points: f64,
    pub reversal: ReversalConfig,
    pub scale_in: ScaleInConfig,
}

impl LifecycleRules {
    pub fn from_config(config: &Config) -> Self {
        Self {
            steps: config.exits.steps.clone(),
            manual_alert_points: config.exits.manual_alert_points,
            manual_alert_interval: Duration::seconds(config.exits.manual_alert_interval_secs as i64),
            auto_close_points: config.exits.auto_close_points,
            reversal: config.reversal.clone(),
            scale_in: config.scale_in.clone(),
        }
    }
}

/// Initial soft stop: anchor ∓ extra, never further than `max_points` from entry
pub fn initial_stop(side: Direction, entry: f64, anchor: f64, extra_points: f64, max_points: f64) -> f64 {
    match side {
        Direction::Long => (anchor - extra_points).max(entry - max_points),
        Direction::Short => (anchor + extra_points).min(entry + max_points),
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

#[derive(Debug, Clone)]
pub struct PositionLifecycle {
    position: TrackedPosition,
    scale_in: Option<ScaleInPlan>,
    rules: LifecycleRules,
    spec: InstrumentSpec,
    last_manual_alert: Option<DateTime<Utc>>,
}

impl PositionLifecycle {
    pub fn new(
        position: TrackedPosition,
        scale_in: Option<ScaleInPlan>,
        rules: LifecycleRules,
        spec: InstrumentSpec,
    ) -> Self {
        Self {
            position,
            scale_in,
            rules,
            spec,
            last_manual_alert: None,
        }
    }

    pub fn position(&self) -> &TrackedPosition {
        &self.position
    }

    pub fn scale_in(&self) -> Option<&ScaleInPlan> {
        self.scale_in.as_ref()
    }

    /// Exchange size and average entry overwrite the tracked ones
    pub fn sync_from_exchange(&mut self, live: &ExchangePosition) {
        if (live.size - self.position.size).abs() > f64::EPSILON
            || (live.entry_price - self.position.entry_price).abs() > f64::EPSILON
        {
            tracing::debug!(
                size = live.size,
                entry = live.entry_price,
                prev_size = self.position.size,
                prev_entry = self.position.entry_price,
                "Position synced from exchange"
            );
        }
        self.position.size = live.size;
        self.position.entry_price = live.entry_price;
    }

    /// Sets the stop if it tightens the current one; returns whether it moved
    pub fn tighten_stop(&mut self, candidate: f64, source: StopSource) -> Option<LifecycleAction> {
        if !candidate.is_finite() || !self.position.is_more_protective(candidate) {
            return None;
        }
        let from = self.position.stop_price;
        let to = self.spec.round_price(candidate);
        self.position.stop_price = Some(to);
        self.position.stop_source = Some(source);
        Some(LifecycleAction::StopMoved { from, to, source })
    }

    pub fn disable_scale_in(&mut self) {
        if let Some(plan) = self.scale_in.as_mut() {
            plan.add_disabled = true;
        }
    }

    /// Quote-currency PnL of closing everything at `exit_price`
    pub fn realized_pnl(&self, exit_price: f64) -> f64 {
        self.position.profit_points(exit_price) * self.position.size * self.spec.contract_size
    }

    /// Decides what to do at `price`.
    ///
    /// `opposite_bars` is the number of consecutive new higher-timeframe bars
    /// pointing against the position. A `Close` action is always last.
    pub fn evaluate(&mut self, price: f64, opposite_bars: u32, now: DateTime<Utc>) -> Vec<LifecycleAction> {
        let mut actions = Vec::new();
        let side = self.position.side;

        if opposite_bars >= self.rules.reversal.confirm_bars {
            match self.rules.reversal.action {
                ReversalAction::CloseNow => {
                    actions.push(LifecycleAction::Close {
                        reason: ExitReason::AdverseReversal,
                    });
                    return actions;
                }
                ReversalAction::TightenStop => {
                    let candidate = price - side.sign() * self.rules.reversal.tighten_offset;
                    actions.extend(self.tighten_stop(candidate, StopSource::Reversal));
                }
            }
        }

        let profit = self.position.profit_points(price);

        if let Some(rule) = self.rules.steps.get(self.position.step_index).copied() {
            if profit >= rule.trigger {
                self.position.step_index += 1;
                let step = self.position.step_index;
                let candidate = self.position.entry_price + side.sign() * rule.offset;
                match self.tighten_stop(candidate, StopSource::Step(step)) {
                    Some(moved) => {
                        actions.push(moved);
                        if rule.locks_profit() {
                            actions.push(LifecycleAction::TpStepReached {
                                step,
                                stop: self.position.stop_price.unwrap_or(candidate),
                            });
                        }
                    }
                    None => tracing::debug!(step, candidate, "Step reached, stop already tighter"),
                }
            }
        }

        if self.position.stop_hit(price) {
            actions.push(LifecycleAction::Close {
                reason: ExitReason::from_stop(self.position.stop_source),
            });
            return actions;
        }

        if profit >= self.rules.auto_close_points {
            actions.push(LifecycleAction::Close {
                reason: ExitReason::AutoClose {
                    points: self.rules.auto_close_points,
                },
            });
            return actions;
        }

        if profit >= self.rules.manual_alert_points {
            let due = self
                .last_manual_alert
                .map_or(true, |last| now - last >= self.rules.manual_alert_interval);
            if due {
                self.last_manual_alert = Some(now);
                actions.push(LifecycleAction::ManualAlert { profit_points: profit });
            }
        }

        actions.extend(self.evaluate_scale_in(price));
        actions
    }

    fn evaluate_scale_in(&mut self, price: f64) -> Option<LifecycleAction> {
        if !self.rules.scale_in.enabled {
            return None;
        }
        let side = self.position.side;
        let extra = self.rules.scale_in.stop_extra_points;
        let plan = self.scale_in.as_mut()?;
        if plan.add_disabled || plan.target_notional <= 0.0 {
            return None;
        }

        let band_stop = plan.band_stop(side, extra);
        let breached = match side {
            Direction::Long => price < band_stop,
            Direction::Short => price > band_stop,
        };
        if breached {
            plan.add_disabled = true;
            return Some(LifecycleAction::ScaleInDisabled { band_stop });
        }
        if price < plan.band_low || price > plan.band_high {
            return None;
        }

        let current = self.spec.notional(self.position.size, price);
        let mut remaining = (plan.target_notional - current).max(0.0);
        if let Some(budget) = plan.risk_budget {
            // A budgeted add needs a stop to measure against
            let stop = self.position.stop_price?;
            let room = risk::add_within_budget(
                budget,
                side,
                self.position.size,
                self.position.entry_price,
                price,
                stop,
                &self.spec,
            );
            remaining = remaining.min(self.spec.notional(room, price));
        }
        if remaining <= 1e-6 {
            return None;
        }
        Some(LifecycleAction::ScaleIn {
            remaining_notional: remaining,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn rules() -> LifecycleRules {
        LifecycleRules::from_config(&Config::default())
    }

    fn lifecycle(side: Direction, entry: f64, stop: Option<f64>) -> PositionLifecycle {
        let mut position = TrackedPosition::new(side, entry, 1.0, t0());
        position.stop_price = stop;
        position.stop_source = stop.map(|_| StopSource::Initial);
        PositionLifecycle::new(position, None, rules(), InstrumentSpec::default())
    }

    #[test]
    fn test_initial_stop_clamp() {
        // swing far away: clamped to 1234 pts
        assert_relative_eq!(initial_stop(Direction::Long, 100_000.0, 98_000.0, 200.0, 1234.0), 98_766.0);
        assert_relative_eq!(initial_stop(Direction::Long, 100_000.0, 99_500.0, 200.0, 1234.0), 99_300.0);
        assert_relative_eq!(initial_stop(Direction::Short, 100_000.0, 100_400.0, 200.0, 1234.0), 100_600.0);
        assert_relative_eq!(initial_stop(Direction::Short, 100_000.0, 103_000.0, 200.0, 1234.0), 101_234.0);
    }

    #[test]
    fn test_step_trailing_long() {
        let mut lc = lifecycle(Direction::Long, 100_000.0, Some(99_000.0));

        let actions = lc.evaluate(100_450.0, 0, t0());
        assert_eq!(
            actions,
            vec![LifecycleAction::StopMoved {
                from: Some(99_000.0),
                to: 99_800.0,
                source: StopSource::Step(1)
            }]
        );

        let actions = lc.evaluate(100_700.0, 0, t0());
        assert!(actions.contains(&LifecycleAction::TpStepReached {
            step: 2,
            stop: 100_300.0
        }));

        let actions = lc.evaluate(100_300.0, 0, t0());
        assert_eq!(
            actions,
            vec![LifecycleAction::Close {
                reason: ExitReason::StepStop { step: 2 }
            }]
        );
        assert_eq!(ExitReason::StepStop { step: 2 }.to_string(), "step-2 stop");
    }

    #[test]
    fn test_one_step_per_tick() {
        let mut lc = lifecycle(Direction::Short, 100_000.0, None);
        // jumps past both steps at once
        lc.evaluate(99_000.0, 0, t0());
        assert_eq!(lc.position().step_index, 1);
        assert_eq!(lc.position().stop_price, Some(100_200.0));
        lc.evaluate(99_000.0, 0, t0());
        assert_eq!(lc.position().step_index, 2);
        assert_eq!(lc.position().stop_price, Some(99_700.0));
    }

    #[test]
    fn test_step_never_loosens_stop() {
        let mut lc = lifecycle(Direction::Long, 100_000.0, Some(99_900.0));
        // step 1 would place 99 800, below the existing stop
        let actions = lc.evaluate(100_450.0, 0, t0());
        assert!(actions.is_empty());
        assert_eq!(lc.position().stop_price, Some(99_900.0));
        assert_eq!(lc.position().step_index, 1);
    }

    #[test]
    fn test_soft_stop_reasons() {
        let mut lc = lifecycle(Direction::Long, 100_000.0, Some(99_300.0));
        let actions = lc.evaluate(99_299.0, 0, t0());
        assert_eq!(
            actions,
            vec![LifecycleAction::Close {
                reason: ExitReason::InitialStop
            }]
        );
        assert_eq!(ExitReason::InitialStop.to_string(), "initial stop");
    }

    #[test]
    fn test_auto_close_and_manual_alert() {
        let mut lc = lifecycle(Direction::Long, 100_000.0, Some(99_000.0));
        // walk through the steps first
        lc.evaluate(100_450.0, 0, t0());
        lc.evaluate(100_700.0, 0, t0());
        lc.evaluate(100_950.0, 0, t0());

        let actions = lc.evaluate(101_300.0, 0, t0());
        assert!(matches!(actions[0], LifecycleAction::ManualAlert { .. }));
        // rate limited
        let actions = lc.evaluate(101_310.0, 0, t0() + Duration::seconds(10));
        assert!(actions.is_empty());
        let actions = lc.evaluate(101_310.0, 0, t0() + Duration::seconds(31));
        assert!(matches!(actions[0], LifecycleAction::ManualAlert { .. }));

        let actions = lc.evaluate(101_400.0, 0, t0() + Duration::seconds(32));
        assert_eq!(
            actions,
            vec![LifecycleAction::Close {
                reason: ExitReason::AutoClose { points: 1400.0 }
            }]
        );
    }

    #[test]
    fn test_reversal_close_now() {
        let mut lc = lifecycle(Direction::Long, 100_000.0, Some(99_000.0));
        assert!(lc.evaluate(100_100.0, 1, t0()).is_empty());
        let actions = lc.evaluate(100_100.0, 2, t0());
        assert_eq!(
            actions,
            vec![LifecycleAction::Close {
                reason: ExitReason::AdverseReversal
            }]
        );
    }

    #[test]
    fn test_reversal_tighten() {
        let mut r = rules();
        r.reversal.action = ReversalAction::TightenStop;
        let position = TrackedPosition::new(Direction::Short, 100_000.0, 1.0, t0());
        let mut lc = PositionLifecycle::new(position, None, r, InstrumentSpec::default());

        let actions = lc.evaluate(99_900.0, 2, t0());
        assert_eq!(lc.position().stop_price, Some(100_000.0));
        assert_eq!(lc.position().stop_source, Some(StopSource::Reversal));
        assert!(matches!(actions[0], LifecycleAction::StopMoved { .. }));

        // price moves back up: a looser stop is never applied
        lc.evaluate(99_950.0, 3, t0());
        assert_eq!(lc.position().stop_price, Some(100_000.0));
        let actions = lc.evaluate(100_000.0, 3, t0());
        assert_eq!(
            actions.last(),
            Some(&LifecycleAction::Close {
                reason: ExitReason::ReversalStop
            })
        );
    }

    #[test]
    fn test_scale_in_inside_band_then_disabled() {
        let position = TrackedPosition::new(Direction::Long, 100_000.0, 10.0, t0());
        let plan = ScaleInPlan::new(20_000.0, 100_000.0, 200.0);
        let mut lc = PositionLifecycle::new(position, Some(plan), rules(), InstrumentSpec::default());

        // outside band, above
        assert!(lc.evaluate(100_250.0, 0, t0()).is_empty());
        let actions = lc.evaluate(100_000.0, 0, t0());
        match actions.as_slice() {
            [LifecycleAction::ScaleIn { remaining_notional }] => assert_relative_eq!(*remaining_notional, 10_000.0),
            other => panic!("unexpected actions {:?}", other),
        }
        lc.disable_scale_in();
        assert!(lc.evaluate(100_000.0, 0, t0()).is_empty());
    }

    #[test]
    fn test_scale_in_band_stop_disables_forever() {
        let position = TrackedPosition::new(Direction::Short, 100_000.0, 10.0, t0());
        let plan = ScaleInPlan::new(20_000.0, 100_000.0, 200.0);
        let mut lc = PositionLifecycle::new(position, Some(plan), rules(), InstrumentSpec::default());

        let actions = lc.evaluate(100_301.0, 0, t0());
        assert_eq!(actions, vec![LifecycleAction::ScaleInDisabled { band_stop: 100_300.0 }]);
        assert!(lc.scale_in().is_some_and(|p| p.add_disabled));
        assert!(lc.evaluate(100_000.0, 0, t0()).is_empty());
    }

    #[test]
    fn test_scale_in_stays_inside_risk_budget() {
        // 2.51 held @ 100000 with the stop 400 pts away already uses 10.04 of 10.05
        let mut position = TrackedPosition::new(Direction::Long, 100_000.0, 2.51, t0());
        position.stop_price = Some(99_600.0);
        position.stop_source = Some(StopSource::Initial);
        let plan = ScaleInPlan::new(2_510.0, 100_000.0, 200.0).with_risk_budget(Some(10.05));
        let mut lc = PositionLifecycle::new(position.clone(), Some(plan), rules(), InstrumentSpec::default());
        assert!(lc.evaluate(100_000.0, 0, t0()).is_empty());

        // Even a stale pre-clamp target cannot push loss-at-stop past the budget
        let plan = ScaleInPlan::new(32_000.0, 100_000.0, 200.0).with_risk_budget(Some(10.05));
        let mut lc = PositionLifecycle::new(position.clone(), Some(plan), rules(), InstrumentSpec::default());
        assert!(lc.evaluate(100_000.0, 0, t0()).is_empty());

        // Half the size held leaves room for the other half only
        position.size = 1.25;
        let plan = ScaleInPlan::new(32_000.0, 100_000.0, 200.0).with_risk_budget(Some(10.05));
        let mut lc = PositionLifecycle::new(position, Some(plan), rules(), InstrumentSpec::default());
        match lc.evaluate(100_100.0, 0, t0()).as_slice() {
            [LifecycleAction::ScaleIn { remaining_notional }] => {
                // 10.05 - 5.0 = 5.05 left at 5.0 per contract -> 1.01 contracts
                assert_relative_eq!(*remaining_notional, 1.01 * 0.01 * 100_100.0, epsilon = 1e-6);
            }
            other => panic!("unexpected actions {:?}", other),
        }
    }

    #[test]
    fn test_budgeted_scale_in_waits_for_stop() {
        let position = TrackedPosition::new(Direction::Long, 100_000.0, 1.0, t0());
        let plan = ScaleInPlan::new(20_000.0, 100_000.0, 200.0).with_risk_budget(Some(50.0));
        let mut lc = PositionLifecycle::new(position, Some(plan), rules(), InstrumentSpec::default());
        assert!(lc.evaluate(100_000.0, 0, t0()).is_empty());
        assert!(lc.scale_in().is_some_and(|p| !p.add_disabled));
    }

    #[test]
    fn test_realized_pnl() {
        let mut lc = lifecycle(Direction::Short, 100_000.0, None);
        lc.sync_from_exchange(&ExchangePosition {
            side: Direction::Short,
            size: 5.0,
            entry_price: 100_100.0,
        });
        // (100100 - 99100) * 5 * 0.01
        assert_relative_eq!(lc.realized_pnl(99_100.0), 50.0);
    }

    proptest! {
        #[test]
        fn prop_stop_is_monotonic(
            long in any::<bool>(),
            prices in proptest::collection::vec(98_000.0f64..102_000.0, 1..60),
            opposite in proptest::collection::vec(0u32..4, 60),
        ) {
            let side = if long { Direction::Long } else { Direction::Short };
            let mut r = rules();
            r.reversal.action = ReversalAction::TightenStop;
            let mut position = TrackedPosition::new(side, 100_000.0, 1.0, t0());
            position.stop_price = Some(100_000.0 - side.sign() * 1_234.0);
            let mut lc = PositionLifecycle::new(position, None, r, InstrumentSpec::default());

            let mut previous = lc.position().stop_price;
            for (price, opp) in prices.iter().zip(opposite.iter()) {
                let actions = lc.evaluate(*price, *opp, t0());
                let now = lc.position().stop_price;
                if let (Some(before), Some(after)) = (previous, now) {
                    prop_assert!(side.sign() * (after - before) >= -1e-9);
                }
                previous = now;
                if actions.iter().any(|a| matches!(a, LifecycleAction::Close { .. })) {
                    break;
                }
            }
        }
    }
}
