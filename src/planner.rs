//! Entry state machine
//!
//! ```text
//! Idle --cross event--> Armed --zone touch + MACD bias--> AwaitingConfirmation
//!   ^                     |                                   |
//!   +---- HTF indeterminate / fire (MACD cross or CHOCH) -----+
//! ```
//!
//! The planner is fed one lower-timeframe closed bar at a time and processes
//! each bar timestamp at most once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::indicators::MacdPair;
use crate::trend::CrossEvent;
use crate::zones::PriceZone;
use crate::{Candle, Direction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum EntryPlan {
    #[default]
    Idle,
    Armed {
        direction: Direction,
        armed_bar_time: DateTime<Utc>,
    },
    AwaitingConfirmation {
        direction: Direction,
        armed_bar_time: DateTime<Utc>,
        touch_bar_time: DateTime<Utc>,
    },
}

impl EntryPlan {
    pub fn direction(&self) -> Option<Direction> {
        match *self {
            EntryPlan::Idle => None,
            EntryPlan::Armed { direction, .. } | EntryPlan::AwaitingConfirmation { direction, .. } => {
                Some(direction)
            }
        }
    }

    pub fn armed_bar_time(&self) -> Option<DateTime<Utc>> {
        match *self {
            EntryPlan::Idle => None,
            EntryPlan::Armed { armed_bar_time, .. }
            | EntryPlan::AwaitingConfirmation { armed_bar_time, .. } => Some(armed_bar_time),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, EntryPlan::Idle)
    }

    pub fn stage(&self) -> &'static str {
        match self {
            EntryPlan::Idle => "idle",
            EntryPlan::Armed { .. } => "armed",
            EntryPlan::AwaitingConfirmation { .. } => "awaiting_confirmation",
        }
    }
}

/// What confirmed a fired entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Confirmation {
    MacdCross,
    Choch,
}

/// One lower-timeframe closed bar with everything the planner looks at
#[derive(Debug, Clone)]
pub struct BarContext {
    pub bar_time: DateTime<Utc>,
    /// Bar used for the touch test (the closed bar, or the live bar when
    /// intrabar touch is enabled)
    pub touch_bar: Candle,
    /// Entry zone for the direction being evaluated
    pub zone: PriceZone,
    pub macd: MacdPair,
    /// CHOCH produced by the newest closed bar
    pub choch: Option<Direction>,
    /// Higher-timeframe direction on its newest closed bar
    pub htf_direction: Option<Direction>,
    pub htf_bar_time: DateTime<Utc>,
    pub cross: Option<CrossEvent>,
}

/// State changes reported back to the session for logging and alerts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlannerEvent {
    Armed {
        direction: Direction,
        bar_time: DateTime<Utc>,
    },
    Rearmed {
        direction: Direction,
        bar_time: DateTime<Utc>,
    },
    Cancelled,
    Touched {
        direction: Direction,
        armed_bar_time: DateTime<Utc>,
    },
    Fire {
        direction: Direction,
        confirmation: Confirmation,
    },
}

#[derive(Debug, Clone, Default)]
pub struct EntryPlanner {
    plan: EntryPlan,
    last_bar: Option<DateTime<Utc>>,
    tolerance_pct: f64,
    structure_confirmation: bool,
}

impl EntryPlanner {
    pub fn new(tolerance_pct: f64, structure_confirmation: bool) -> Self {
        Self {
            plan: EntryPlan::Idle,
            last_bar: None,
            tolerance_pct,
            structure_confirmation,
        }
    }

    pub fn plan(&self) -> EntryPlan {
        self.plan
    }

    pub fn last_bar(&self) -> Option<DateTime<Utc>> {
        self.last_bar
    }

    /// Back to Idle, forgetting the processed-bar key
    pub fn reset(&mut self) {
        self.plan = EntryPlan::Idle;
        self.last_bar = None;
    }

    /// Arms directly, used after a forced close so the new direction is
    /// pursued without waiting for a baseline reset.
    pub fn seed_armed(&mut self, direction: Option<Direction>, htf_bar_time: DateTime<Utc>) {
        self.plan = match direction {
            Some(direction) => EntryPlan::Armed {
                direction,
                armed_bar_time: htf_bar_time,
            },
            None => EntryPlan::Idle,
        };
        self.last_bar = None;
    }

    /// Processes one closed lower-timeframe bar.
    ///
    /// Returns the transitions taken; an empty vector means no-op (including
    /// a bar that was already processed). A `Fire` event always leaves the
    /// plan Idle.
    pub fn on_closed_bar(&mut self, ctx: &BarContext) -> Vec<PlannerEvent> {
        let mut events = Vec::new();
        if self.last_bar == Some(ctx.bar_time) {
            return events;
        }
        self.last_bar = Some(ctx.bar_time);

        match self.plan.direction() {
            None => {
                let Some(cross) = ctx.cross else {
                    return events;
                };
                self.plan = EntryPlan::Armed {
                    direction: cross.direction,
                    armed_bar_time: cross.bar_time,
                };
                events.push(PlannerEvent::Armed {
                    direction: cross.direction,
                    bar_time: cross.bar_time,
                });
            }
            Some(armed) => match ctx.htf_direction {
                None => {
                    self.plan = EntryPlan::Idle;
                    events.push(PlannerEvent::Cancelled);
                    return events;
                }
                Some(current) if current != armed => {
                    self.plan = EntryPlan::Armed {
                        direction: current,
                        armed_bar_time: ctx.htf_bar_time,
                    };
                    events.push(PlannerEvent::Rearmed {
                        direction: current,
                        bar_time: ctx.htf_bar_time,
                    });
                }
                Some(_) => {}
            },
        }

        match self.plan {
            EntryPlan::Idle => {}
            EntryPlan::Armed {
                direction,
                armed_bar_time,
            } => {
                let touched = ctx.zone.touched_by(&ctx.touch_bar, direction, self.tolerance_pct);
                let bias = ctx.macd.has_setup_bias(direction);
                tracing::debug!(
                    %direction,
                    zone_low = ctx.zone.low,
                    zone_high = ctx.zone.high,
                    bar_low = ctx.touch_bar.low,
                    bar_high = ctx.touch_bar.high,
                    dif = ctx.macd.dif_now,
                    dea = ctx.macd.dea_now,
                    touched,
                    bias,
                    "armed check"
                );
                if touched && bias {
                    self.plan = EntryPlan::AwaitingConfirmation {
                        direction,
                        armed_bar_time,
                        touch_bar_time: ctx.bar_time,
                    };
                    events.push(PlannerEvent::Touched {
                        direction,
                        armed_bar_time,
                    });
                }
            }
            EntryPlan::AwaitingConfirmation { direction, .. } => {
                let confirmation = if ctx.macd.crossed(direction) {
                    Some(Confirmation::MacdCross)
                } else if self.structure_confirmation && ctx.choch == Some(direction) {
                    Some(Confirmation::Choch)
                } else {
                    None
                };
                tracing::debug!(
                    %direction,
                    dif_prev = ctx.macd.dif_prev,
                    dif_now = ctx.macd.dif_now,
                    dea_prev = ctx.macd.dea_prev,
                    dea_now = ctx.macd.dea_now,
                    choch = ?ctx.choch,
                    confirmed = ?confirmation,
                    "awaiting confirmation"
                );
                if let Some(confirmation) = confirmation {
                    self.plan = EntryPlan::Idle;
                    events.push(PlannerEvent::Fire {
                        direction,
                        confirmation,
                    });
                }
            }
        }
        events
    }
}
