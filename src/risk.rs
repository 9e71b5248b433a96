//! Position sizing
//!
//! Sizes a new position against available collateral:
//!
//! ```text
//! usable    = max(0, equity - margin_buffer) * portfolio_fraction
//! notional  = min(usable * leverage, max_notional)
//! contracts = floor(notional / (price * contract_size)) to the lot step
//! ```
//!
//! When a stop distance is known and `max_risk_fraction` is set, contracts are
//! further clamped so that `contracts * contract_size * stop_distance` stays
//! within `equity * max_risk_fraction`.
//!
//! Every function here is total: non-finite or non-positive inputs size to zero.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::{Direction, InstrumentSpec};

/// Sizing parameters, built with the `with_*` methods
#[derive(Debug, Clone, PartialEq)]
pub struct RiskParameters {
    pub leverage: f64,
    /// Share of (equity - buffer) committed as margin
    pub portfolio_fraction: f64,
    /// Collateral kept aside before anything is committed
    pub margin_buffer: f64,
    /// Hard cap on position value, in quote currency
    pub max_notional: f64,
    /// Optional cap on loss-at-stop as a fraction of equity
    pub max_risk_fraction: Option<f64>,
}

impl Default for RiskParameters {
    fn default() -> Self {
        Self {
            leverage: 40.0,
            portfolio_fraction: 0.8,
            margin_buffer: 5.0,
            max_notional: 100_000.0,
            max_risk_fraction: None,
        }
    }
}

impl RiskParameters {
    pub fn with_leverage(mut self, leverage: f64) -> Self {
        self.leverage = leverage;
        self
    }

    /// Set the committed share as a fraction (e.g., 0.8 = 80%)
    pub fn with_portfolio_fraction(mut self, fraction: f64) -> Self {
        self.portfolio_fraction = fraction;
        self
    }

    pub fn with_margin_buffer(mut self, buffer: f64) -> Self {
        self.margin_buffer = buffer;
        self
    }

    pub fn with_max_notional(mut self, max_notional: f64) -> Self {
        self.max_notional = max_notional;
        self
    }

    /// Limit loss at the stop to a fraction of equity
    pub fn with_max_risk_fraction(mut self, fraction: f64) -> Self {
        self.max_risk_fraction = Some(fraction);
        self
    }
}

/// Result of a sizing call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeDecision {
    /// Contracts to order, a multiple of the lot step (0 = do not trade)
    pub contracts: f64,
    /// Value of `contracts` at the sizing price
    pub notional: f64,
    /// Notional the account could carry before lot rounding and risk clamp.
    /// Scale-in tops a position up to this value.
    pub target_notional: f64,
    /// `contracts` was cut down by the loss-at-stop budget
    pub risk_clamped: bool,
}

impl SizeDecision {
    pub fn zero() -> Self {
        Self {
            contracts: 0.0,
            notional: 0.0,
            target_notional: 0.0,
            risk_clamped: false,
        }
    }

    pub fn is_tradeable(&self) -> bool {
        self.contracts > 0.0
    }
}

fn usable_input(x: f64) -> bool {
    x.is_finite() && x > 0.0
}

/// Position value the account may carry: `min(usable * leverage, max_notional)`
pub fn target_notional(equity: f64, params: &RiskParameters) -> f64 {
    if !equity.is_finite() || !usable_input(params.leverage) || !params.portfolio_fraction.is_finite() {
        return 0.0;
    }
    let usable = (equity - params.margin_buffer).max(0.0) * params.portfolio_fraction.max(0.0);
    let levered = usable * params.leverage;
    if params.max_notional.is_finite() {
        levered.min(params.max_notional.max(0.0))
    } else {
        levered
    }
}

/// Contracts worth `notional` at `price`, floored to the lot step.
///
/// Returns 0 when the result is below the instrument minimum.
pub fn contracts_for_notional(notional: f64, price: f64, spec: &InstrumentSpec) -> f64 {
    if !usable_input(notional) || !usable_input(price) || !usable_input(spec.contract_size) {
        return 0.0;
    }
    floor_to_lot(notional / (price * spec.contract_size), spec)
}

/// Floors `raw` contracts to a whole number of lot steps using decimal math
pub fn floor_to_lot(raw: f64, spec: &InstrumentSpec) -> f64 {
    if !usable_input(raw) {
        return 0.0;
    }
    let (Some(raw_d), Some(step)) = (Decimal::from_f64(raw), Decimal::from_f64(spec.lot_step)) else {
        return 0.0;
    };
    let floored = if step > Decimal::ZERO {
        (raw_d / step).floor() * step
    } else {
        raw_d
    };
    let contracts = floored.normalize().to_f64().unwrap_or(0.0);
    if contracts <= 0.0 || contracts + f64::EPSILON < spec.min_lot {
        0.0
    } else {
        contracts
    }
}

/// Sizes a new position.
///
/// `stop_distance` is the absolute price distance from entry to the stop, if
/// known at sizing time.
pub fn size(
    equity: f64,
    price: f64,
    stop_distance: Option<f64>,
    params: &RiskParameters,
    spec: &InstrumentSpec,
) -> SizeDecision {
    if !usable_input(price) || !usable_input(spec.contract_size) || !usable_input(params.leverage) {
        return SizeDecision::zero();
    }
    let target = target_notional(equity, params);
    let mut contracts = contracts_for_notional(target, price, spec);
    let mut risk_clamped = false;

    if let (Some(distance), Some(fraction)) = (stop_distance, params.max_risk_fraction) {
        if usable_input(distance) && fraction.is_finite() {
            let budget = equity.max(0.0) * fraction.max(0.0);
            let risk_cap = floor_to_lot(budget / (spec.contract_size * distance), spec);
            if risk_cap < contracts {
                tracing::debug!(
                    contracts,
                    risk_cap,
                    stop_distance = distance,
                    "Clamping size to risk budget"
                );
                contracts = risk_cap;
                risk_clamped = true;
            }
        }
    }

    SizeDecision {
        contracts,
        notional: spec.notional(contracts, price),
        target_notional: target,
        risk_clamped,
    }
}

/// Contracts that can be added at `price` while the whole position still
/// loses at most `budget` at `stop`.
///
/// The held leg contributes `held * contract_size * (entry - stop)` (signed by
/// side), the add contributes the same at `price`. An add priced at or beyond
/// the stop gets no room.
pub fn add_within_budget(
    budget: f64,
    side: Direction,
    held: f64,
    entry: f64,
    price: f64,
    stop: f64,
    spec: &InstrumentSpec,
) -> f64 {
    if !budget.is_finite() || !usable_input(price) || !usable_input(spec.contract_size) || !stop.is_finite() {
        return 0.0;
    }
    let per_contract = side.sign() * (price - stop) * spec.contract_size;
    if per_contract <= 0.0 {
        return 0.0;
    }
    let held_risk = if held.is_finite() && entry.is_finite() {
        held.max(0.0) * side.sign() * (entry - stop) * spec.contract_size
    } else {
        return 0.0;
    };
    floor_to_lot((budget.max(0.0) - held_risk) / per_contract, spec)
}
