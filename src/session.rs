//! Trading session
//!
//! Owns every piece of mutable trading state and advances it one
//! [`TradingSession::tick`] at a time:
//!
//! 1. fetch the last price and the exchange position
//! 2. reconcile the tracked state with the exchange (the source of truth)
//! 3. flat: feed closed bars through the trend baseline and the entry planner,
//!    opening a position when it fires
//! 4. holding: let the position lifecycle trail, scale in or close
//!
//! The entry plan and the tracked position are mutually exclusive by
//! construction: both live inside [`Phase`].

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use itertools::Itertools;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::bar_cache::{BarCache, Window};
use crate::config::Config;
use crate::diagnostics::{ema_warmup, log_warmup, Every, IndicatorSnapshot};
use crate::error::ErrorKind;
use crate::gateway::ExecutionGateway;
use crate::indicators::{macd, market_structure, recent_swing_levels};
use crate::lifecycle::{
    initial_stop, ExitReason, LifecycleAction, LifecycleRules, PositionLifecycle, ScaleInPlan, StopSource,
    TrackedPosition,
};
use crate::notify::{fmt_usd, Alerts, Notifier};
use crate::planner::{BarContext, EntryPlan, EntryPlanner, PlannerEvent};
use crate::risk::{self, RiskParameters};
use crate::state_manager::{JsonStateStore, SessionSnapshot};
use crate::stats::StatsRecorder;
use crate::trend::{CrossEvent, HtfObservation, OppositeCounter, TrendBaseline};
use crate::zones::{entry_zone, stop_anchor, PriceZone};
use crate::{Candle, Direction, ExchangePosition, InstrumentSpec, OrderParams, TradeRecord};

/// What the session is doing; exactly one of these at any time
#[derive(Debug, Clone)]
pub enum Phase {
    /// No position: looking for an entry
    Flat(EntryPlanner),
    Holding(PositionLifecycle),
    /// An order went out but its fill could not be confirmed. No new entries
    /// until the exchange shows a position (adopted) or the process restarts.
    NeedsAttention { reason: String, since: DateTime<Utc> },
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Flat(_) => "flat",
            Phase::Holding(_) => "holding",
            Phase::NeedsAttention { .. } => "needs_attention",
        }
    }
}

pub struct TradingSession<G> {
    gateway: G,
    config: Config,
    params: RiskParameters,
    rules: LifecycleRules,
    spec: InstrumentSpec,
    phase: Phase,
    baseline: TrendBaseline,
    opposite: OppositeCounter,
    alerts: Alerts,
    stats: Arc<Mutex<StatsRecorder>>,
    store: JsonStateStore,
    /// Set by an adverse-reversal close; re-arms the planner once flat
    rearm_after_close: bool,
    initial_balance: Option<f64>,
    last_htf: Option<HtfObservation>,
    /// Exit whose reduce-only order went out but was not yet seen flat
    pending_close: Option<ExitReason>,
    bars: BarCache,
    collateral: watch::Sender<f64>,
    snapshot_every: Every,
    diagnostics_every: Every,
}

impl<G: ExecutionGateway> TradingSession<G> {
    pub fn new(gateway: G, config: Config, notifier: Arc<dyn Notifier>, stats: Arc<Mutex<StatsRecorder>>) -> Self {
        let (collateral, _) = watch::channel(0.0);
        Self {
            params: config.risk_parameters(),
            rules: LifecycleRules::from_config(&config),
            spec: InstrumentSpec::default(),
            phase: Phase::Flat(Self::planner_for(&config)),
            baseline: TrendBaseline::new(),
            opposite: OppositeCounter::new(),
            alerts: Alerts::new(notifier),
            store: JsonStateStore::new(&config.runtime.state_file),
            rearm_after_close: false,
            initial_balance: None,
            last_htf: None,
            pending_close: None,
            bars: BarCache::new(),
            collateral,
            snapshot_every: Every::secs(config.runtime.snapshot_interval_secs),
            diagnostics_every: Every::secs(config.runtime.diagnostics_interval_secs),
            stats,
            gateway,
            config,
        }
    }

    fn planner_for(config: &Config) -> EntryPlanner {
        EntryPlanner::new(config.entry.tolerance_pct, config.entry.structure_confirmation)
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Entry plan while flat
    pub fn plan(&self) -> Option<EntryPlan> {
        match &self.phase {
            Phase::Flat(planner) => Some(planner.plan()),
            _ => None,
        }
    }

    pub fn position(&self) -> Option<&TrackedPosition> {
        match &self.phase {
            Phase::Holding(lifecycle) => Some(lifecycle.position()),
            _ => None,
        }
    }

    pub fn scale_in(&self) -> Option<&ScaleInPlan> {
        match &self.phase {
            Phase::Holding(lifecycle) => lifecycle.scale_in(),
            _ => None,
        }
    }

    pub fn baseline(&self) -> &TrendBaseline {
        &self.baseline
    }

    pub fn rearm_pending(&self) -> bool {
        self.rearm_after_close
    }

    pub fn initial_balance(&self) -> Option<f64> {
        self.initial_balance
    }

    pub fn alerts(&self) -> &Alerts {
        &self.alerts
    }

    /// Latest known available collateral, for the monthly report task
    pub fn subscribe_collateral(&self) -> watch::Receiver<f64> {
        self.collateral.subscribe()
    }

    // ------------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------------

    /// Prepares the account and recovers state: instrument spec, leverage,
    /// initial balance, trend baseline and any position already open.
    pub async fn start(&mut self, mode: &str, now: DateTime<Utc>) -> Result<()> {
        match self.gateway.instrument().await {
            Ok(spec) => self.spec = spec,
            Err(e) => warn!(error = %e, "Instrument lookup failed, using default contract spec"),
        }
        if let Err(e) = self.gateway.set_leverage(self.params.leverage).await {
            warn!(error = %e, leverage = self.params.leverage, "Failed to set leverage");
        }

        let snapshot = match self.store.load() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable session state");
                None
            }
        };

        let balance = self
            .gateway
            .fetch_available_collateral()
            .await
            .context("Failed to fetch available collateral")?;
        self.collateral.send_replace(balance);
        self.initial_balance = Some(snapshot.as_ref().and_then(|s| s.initial_balance).unwrap_or(balance));
        self.rearm_after_close = snapshot.as_ref().is_some_and(|s| s.rearm_after_close);

        match self.refresh_htf().await {
            Ok(Some(obs)) => self.baseline.reset(&obs),
            Ok(None) => warn!("Not enough higher-timeframe bars for a baseline yet"),
            Err(e) => warn!(error = %e, "Failed to fetch higher-timeframe bars"),
        }

        if let Some(live) = self.gateway.fetch_position().await.context("Failed to fetch position")? {
            let restored = snapshot.as_ref().and_then(|s| s.position_matching(&live).cloned());
            let scale_in = match (&restored, &snapshot) {
                (Some(_), Some(s)) => s.scale_in.clone(),
                _ => None,
            };
            self.adopt(live, restored, scale_in, now).await;
        }

        info!(
            mode,
            symbol = %self.config.instrument.symbol,
            balance,
            initial_balance = ?self.initial_balance,
            phase = self.phase.name(),
            "Session started"
        );
        let banner = self.banner(mode, balance);
        self.alerts.notify(&banner).await;
        self.persist(now);
        Ok(())
    }

    fn banner(&self, mode: &str, balance: f64) -> String {
        let steps = self
            .rules
            .steps
            .iter()
            .map(|s| format!("{:.0}→{:+.0}", s.trigger, s.offset))
            .join(", ");
        let mut out = format!("🚀 <b>Bot started</b> ({})\n", mode);
        out.push_str(&format!("<b>Symbol:</b> <code>{}</code>\n", self.config.instrument.symbol));
        out.push_str(&format!(
            "<b>Timeframes:</b> <code>{} / {}</code>\n",
            self.config.instrument.htf, self.config.instrument.ltf
        ));
        out.push_str(&format!(
            "<b>Leverage:</b> <code>{}x {}</code>\n",
            self.params.leverage,
            self.config.instrument.margin_mode.as_str()
        ));
        out.push_str(&format!("<b>Steps:</b> <code>{}</code>\n", steps));
        out.push_str(&format!(
            "<b>Auto close:</b> <code>{:.0} pts</code>\n",
            self.rules.auto_close_points
        ));
        out.push_str(&format!("<b>Balance:</b> <code>{} USDT</code>", fmt_usd(balance)));
        if let Some(p) = self.position() {
            out.push_str(&format!(
                "\n<b>Adopted:</b> <code>{} {} @ {}</code>",
                p.side,
                p.size,
                fmt_usd(p.entry_price)
            ));
        }
        out
    }

    // ------------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------------

    /// One poll of the exchange. Errors are transient from the caller's point
    /// of view: the loop logs them and tries again on the next tick.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        let price = self.gateway.fetch_ticker().await.context("Failed to fetch ticker")?.last;
        let live = self.gateway.fetch_position().await.context("Failed to fetch position")?;
        self.reconcile(live, price, now).await;

        if matches!(self.phase, Phase::Flat(_)) {
            return self.tick_flat(price, now).await;
        }
        if matches!(self.phase, Phase::Holding(_)) {
            return self.tick_holding(price, now).await;
        }
        if self.snapshot_every.due(now) {
            if let Phase::NeedsAttention { reason, since } = &self.phase {
                warn!(%reason, %since, "Waiting for operator: position state unknown");
            }
        }
        Ok(())
    }

    /// Makes the tracked state agree with what the exchange reports
    async fn reconcile(&mut self, live: Option<ExchangePosition>, price: f64, now: DateTime<Utc>) {
        let tracked = self.position().map(|p| p.side);
        match (tracked, live) {
            (Some(side), Some(live)) if live.side == side => {
                if let Phase::Holding(lifecycle) = &mut self.phase {
                    lifecycle.sync_from_exchange(&live);
                }
            }
            (Some(side), Some(live)) => {
                warn!(tracked = %side, exchange = %live.side, "Exchange holds the opposite side, re-adopting");
                self.finish_close(ExitReason::External, price, now).await;
                self.adopt(live, None, None, now).await;
            }
            (Some(_), None) => {
                let reason = self.pending_close.take().unwrap_or(ExitReason::External);
                info!(price, %reason, "Exchange reports flat");
                self.finish_close(reason, price, now).await;
            }
            (None, Some(live)) => {
                warn!(side = %live.side, size = live.size, entry = live.entry_price, "Untracked position found, adopting");
                self.adopt(live, None, None, now).await;
            }
            (None, None) => {}
        }
    }

    async fn tick_flat(&mut self, price: f64, now: DateTime<Utc>) -> Result<()> {
        let htf_tf = self.config.instrument.htf.clone();
        let ltf_tf = self.config.instrument.ltf.clone();
        let (htf_closed, _) = self.fetch_window(&htf_tf, self.config.trend.lookback).await?;
        let (ltf_closed, ltf_live) = self.fetch_window(&ltf_tf, self.config.entry.lookback).await?;
        self.log_diagnostics(&htf_closed, &ltf_closed, price, now);

        let Some(obs) = HtfObservation::from_closed(&htf_closed, self.config.trend.ema_fast, self.config.trend.ema_slow)
        else {
            debug!("No closed higher-timeframe bars");
            return Ok(());
        };
        self.last_htf = Some(obs);
        let cross = self.baseline.observe(&obs);
        if let Some(cross) = cross {
            info!(direction = %cross.direction, bar_time = %cross.bar_time, "HTF cross");
        }

        let Some(ctx) = self.bar_context(&ltf_closed, ltf_live.as_ref(), &obs, cross) else {
            return Ok(());
        };
        let events = match &mut self.phase {
            Phase::Flat(planner) => planner.on_closed_bar(&ctx),
            _ => return Ok(()),
        };

        for event in events {
            match event {
                PlannerEvent::Armed { direction, bar_time } => {
                    let msg = format!(
                        "🔔 <b>HTF cross {}</b>\nArmed, waiting for a pullback into <code>{} - {}</code>",
                        direction,
                        fmt_usd(ctx.zone.low),
                        fmt_usd(ctx.zone.high)
                    );
                    self.alerts.send_once(&format!("cross:{}:{}", direction, bar_time), &msg).await;
                }
                PlannerEvent::Rearmed { direction, bar_time } => {
                    info!(%direction, %bar_time, "Plan re-armed to the current HTF direction");
                    let msg = format!("🔁 <b>Re-armed {}</b> (HTF direction changed)", direction);
                    self.alerts.send_once(&format!("cross:{}:{}", direction, bar_time), &msg).await;
                }
                PlannerEvent::Cancelled => info!("HTF direction indeterminate, plan cancelled"),
                PlannerEvent::Touched {
                    direction,
                    armed_bar_time,
                } => {
                    let msg = format!(
                        "👀 <b>{} zone touched</b> at <code>{}</code>, waiting for MACD confirmation",
                        direction,
                        fmt_usd(price)
                    );
                    self.alerts.send_once(&format!("touch:{}", armed_bar_time), &msg).await;
                }
                PlannerEvent::Fire {
                    direction,
                    confirmation,
                } => {
                    info!(%direction, ?confirmation, price, "Entry confirmed");
                    self.open_position(direction, price, &ltf_closed, now).await;
                }
            }
        }
        Ok(())
    }

    /// Everything the planner needs about the newest closed lower-timeframe
    /// bar, or `None` while indicators are still undefined
    fn bar_context(
        &self,
        closed: &[Candle],
        live: Option<&Candle>,
        obs: &HtfObservation,
        cross: Option<CrossEvent>,
    ) -> Option<BarContext> {
        let last = closed.last()?;
        let entry = &self.config.entry;

        // Direction the planner will evaluate the touch for on this bar
        let idle = self.plan().is_some_and(|p| p.is_idle());
        let direction = if idle {
            cross.map(|c| c.direction)
        } else {
            obs.direction
        };
        let zone = match direction {
            Some(direction) => match entry_zone(closed, direction, &entry.zone) {
                Some(zone) => zone,
                None => {
                    debug!(?direction, bars = closed.len(), "Entry zone undefined");
                    return None;
                }
            },
            None => PriceZone::at(last.close),
        };

        let closes: Vec<f64> = closed.iter().map(|c| c.close).collect();
        let Some(macd) = macd(&closes, entry.macd_fast, entry.macd_slow, entry.macd_signal) else {
            debug!(bars = closed.len(), "MACD undefined");
            return None;
        };
        let choch = if entry.structure_confirmation {
            market_structure(closed, entry.structure_left, entry.structure_right).choch_on(closed.len() - 1)
        } else {
            None
        };
        let touch_bar = match live {
            Some(bar) if entry.intrabar_touch => bar.clone(),
            _ => last.clone(),
        };

        Some(BarContext {
            bar_time: last.open_time,
            touch_bar,
            zone,
            macd,
            choch,
            htf_direction: obs.direction,
            htf_bar_time: obs.bar_time,
            cross,
        })
    }

    async fn tick_holding(&mut self, price: f64, now: DateTime<Utc>) -> Result<()> {
        let Phase::Holding(lifecycle) = &self.phase else {
            return Ok(());
        };
        let side = lifecycle.position().side;

        let opposite = match self.refresh_htf().await {
            Ok(Some(obs)) => self.opposite.observe(side, &obs),
            Ok(None) => self.opposite.count(),
            Err(e) => {
                warn!(error = %e, "HTF refresh failed, reusing the opposite-bar count");
                self.opposite.count()
            }
        };

        let actions = match &mut self.phase {
            Phase::Holding(lifecycle) => {
                if self.snapshot_every.due(now) {
                    let p = lifecycle.position();
                    info!(
                        side = %p.side,
                        entry = p.entry_price,
                        size = p.size,
                        stop = ?p.stop_price,
                        step = p.step_index,
                        price,
                        profit_points = p.profit_points(price),
                        opposite,
                        "position"
                    );
                }
                lifecycle.evaluate(price, opposite, now)
            }
            _ => return Ok(()),
        };
        if actions.is_empty() {
            return Ok(());
        }

        for action in actions {
            self.apply(action, price, now).await;
        }
        self.persist(now);
        Ok(())
    }

    async fn apply(&mut self, action: LifecycleAction, price: f64, now: DateTime<Utc>) {
        let Some(position) = self.position().cloned() else {
            return;
        };
        let key = position.key();

        match action {
            LifecycleAction::StopMoved { from, to, source } => {
                info!(?from, to, ?source, price, "Stop moved");
                match source {
                    StopSource::Step(step) => {
                        let msg = format!(
                            "🪜 <b>Step {} reached</b>\nStop moved to <code>{}</code> (entry {})",
                            step,
                            fmt_usd(to),
                            fmt_usd(position.entry_price)
                        );
                        self.alerts.send_once(&format!("step:{}:{}", key, step), &msg).await;
                    }
                    StopSource::Reversal => {
                        let msg = format!(
                            "⚠️ <b>HTF turned against the {}</b>\nStop tightened to <code>{}</code>",
                            position.side,
                            fmt_usd(to)
                        );
                        self.alerts.send_once(&format!("revtight:{}", key), &msg).await;
                    }
                    StopSource::Initial => {}
                }
            }
            LifecycleAction::TpStepReached { step, stop } => {
                self.stats
                    .lock()
                    .await
                    .record_tp_reached(step, position.entry_price, stop, local(now), now);
            }
            LifecycleAction::ManualAlert { profit_points } => {
                let msg = format!(
                    "💰 <b>+{:.0} pts</b> on the {} at <code>{}</code>\nConsider closing manually",
                    profit_points,
                    position.side,
                    fmt_usd(price)
                );
                self.alerts.notify(&msg).await;
            }
            LifecycleAction::ScaleIn { remaining_notional } => {
                self.scale_in_now(remaining_notional, price).await;
            }
            LifecycleAction::ScaleInDisabled { band_stop } => {
                info!(band_stop, price, "Price left the scale-in band, adds disabled");
            }
            LifecycleAction::Close { reason } => {
                match reason {
                    ExitReason::AdverseReversal => {
                        self.rearm_after_close = true;
                        let msg = format!(
                            "🔄 <b>HTF reversed against the {}</b>\nClosing and re-arming {}",
                            position.side,
                            position.side.opposite()
                        );
                        self.alerts.send_once(&format!("revopp:{}", key), &msg).await;
                    }
                    ExitReason::AutoClose { points } => {
                        let msg = format!("🎯 <b>+{:.0} pts reached</b>, closing the {}", points, position.side);
                        self.alerts.send_once(&format!("autoclose:{}", key), &msg).await;
                    }
                    _ => {}
                }
                if let Err(e) = self.close_position(reason, price, now).await {
                    error!(error = %e, %reason, "Close failed, will retry next tick");
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Order flows
    // ------------------------------------------------------------------------

    /// Sizes and opens a position, confirms it on the exchange and sets the
    /// initial stop. The planner is already Idle when this runs.
    async fn open_position(&mut self, direction: Direction, price: f64, ltf_closed: &[Candle], now: DateTime<Utc>) {
        let collateral = match self.gateway.fetch_available_collateral().await {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "Cannot size entry: collateral unavailable");
                self.alerts
                    .notify(&format!("❌ <b>{} entry skipped</b>: balance unavailable ({})", direction, e))
                    .await;
                return;
            }
        };
        self.collateral.send_replace(collateral);

        let stop_distance = self
            .initial_stop_for(direction, price, ltf_closed)
            .map(|stop| (price - stop).abs());
        let decision = risk::size(collateral, price, stop_distance, &self.params, &self.spec);
        info!(
            %direction,
            collateral,
            price,
            contracts = decision.contracts,
            notional = decision.notional,
            target = decision.target_notional,
            "Entry sized"
        );
        if !decision.is_tradeable() {
            warn!(collateral, "Position size below the minimum lot, entry skipped");
            self.alerts
                .notify(&format!(
                    "❌ <b>{} entry skipped</b>: insufficient collateral ({} USDT)",
                    direction,
                    fmt_usd(collateral)
                ))
                .await;
            return;
        }

        let params = OrderParams::open(self.config.instrument.margin_mode);
        if let Err(e) = self
            .gateway
            .open_market(direction.entry_side(), decision.contracts, params, direction)
            .await
        {
            error!(error = %e, kind = ?e.kind, "Entry order failed");
            let why = match e.kind {
                ErrorKind::InsufficientFunds => "insufficient margin".to_string(),
                _ => e.to_string(),
            };
            self.alerts
                .notify(&format!("❌ <b>{} entry failed</b>: {}", direction, why))
                .await;
            return;
        }

        let confirmed = self
            .wait_for_position(
                direction,
                self.config.runtime.open_poll_attempts,
                Duration::from_millis(self.config.runtime.open_confirm_delay_ms),
            )
            .await;
        let Some(live) = confirmed else {
            let reason = format!("{} order sent, fill not confirmed", direction);
            error!(%reason, "Entry needs attention");
            self.alerts
                .notify(&format!(
                    "🚨 <b>ATTENTION</b>: {}\nCheck the exchange. No new entries until a position shows up or the bot restarts.",
                    reason
                ))
                .await;
            self.phase = Phase::NeedsAttention { reason, since: now };
            self.persist(now);
            return;
        };

        // A risk-clamped entry only tops up to its clamped size
        let target = if decision.risk_clamped {
            decision.notional
        } else {
            decision.target_notional
        };
        let budget = self.params.max_risk_fraction.map(|f| collateral.max(0.0) * f.max(0.0));
        let scale_in = self.config.scale_in.enabled.then(|| {
            ScaleInPlan::new(target, live.entry_price, self.config.scale_in.band_points).with_risk_budget(budget)
        });
        let position = TrackedPosition::new(direction, live.entry_price, live.size, now);
        let mut lifecycle = PositionLifecycle::new(position, scale_in, self.rules.clone(), self.spec);
        lifecycle.sync_from_exchange(&live);
        let stop = self
            .initial_stop_for(direction, live.entry_price, ltf_closed)
            .and_then(|stop| lifecycle.tighten_stop(stop, StopSource::Initial));
        self.opposite.reset();
        self.phase = Phase::Holding(lifecycle);

        let Some(LifecycleAction::StopMoved { to: stop, .. }) = stop else {
            error!("Initial stop could not be computed, closing");
            self.alerts
                .notify(&format!("🚨 <b>{} opened without a stop</b>, emergency close", direction))
                .await;
            if let Err(e) = self.close_position(ExitReason::Emergency, price, now).await {
                error!(error = %e, "Emergency close failed");
            }
            self.persist(now);
            return;
        };

        info!(%direction, entry = live.entry_price, size = live.size, stop, "Position opened");
        let msg = format!(
            "✅ <b>{} opened</b>\n<b>Entry:</b> <code>{}</code>\n<b>Size:</b> <code>{}</code>\n<b>Stop:</b> <code>{}</code>",
            direction,
            fmt_usd(live.entry_price),
            live.size,
            fmt_usd(stop)
        );
        self.alerts.notify(&msg).await;
        self.persist(now);
    }

    /// Closes the tracked position with a reduce-only market order. Returns
    /// whether the exchange confirmed the position gone.
    pub async fn close_position(&mut self, reason: ExitReason, price: f64, now: DateTime<Utc>) -> Result<bool> {
        let Some(position) = self.position().cloned() else {
            return Ok(false);
        };
        self.cancel_orders(1).await;

        let params = OrderParams::close(self.config.instrument.margin_mode);
        self.gateway
            .open_market(position.side.exit_side(), position.size, params, position.side)
            .await
            .with_context(|| format!("Reduce-only {} order failed", position.side.exit_side().as_str()))?;

        sleep(Duration::from_millis(self.config.runtime.close_confirm_delay_ms)).await;
        let interval = Duration::from_millis(self.config.runtime.close_poll_interval_ms);
        for attempt in 1..=self.config.runtime.close_poll_attempts {
            match self.gateway.fetch_position().await {
                Ok(Some(live)) if live.side == position.side => {
                    debug!(attempt, size = live.size, "Close not reflected yet");
                }
                Ok(_) => {
                    let exit = match self.gateway.fetch_ticker().await {
                        Ok(t) => t.last,
                        Err(_) => price,
                    };
                    self.finish_close(reason, exit, now).await;
                    return Ok(true);
                }
                Err(e) => warn!(attempt, error = %e, "Position poll failed"),
            }
            sleep(interval).await;
        }
        warn!(%reason, "Close not confirmed, retrying next tick");
        self.pending_close = Some(reason);
        Ok(false)
    }

    /// Bookkeeping once the exchange no longer holds the position
    async fn finish_close(&mut self, reason: ExitReason, exit_price: f64, now: DateTime<Utc>) {
        let previous = std::mem::replace(&mut self.phase, Phase::Flat(Self::planner_for(&self.config)));
        let lifecycle = match previous {
            Phase::Holding(lifecycle) => lifecycle,
            other => {
                self.phase = other;
                return;
            }
        };
        self.pending_close = None;
        self.cancel_orders(self.config.runtime.cancel_retries).await;

        let position = lifecycle.position();
        let pnl = lifecycle.realized_pnl(exit_price);
        let trade = TradeRecord {
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            size: position.size,
            opened_at: position.opened_at,
            closed_at: now,
            close_step: position.step_index,
            pnl,
            reason: reason.to_string(),
        };
        let took_profit = pnl >= 0.0
            && self
                .rules
                .steps
                .iter()
                .take(position.step_index)
                .any(|s| s.locks_profit());
        self.stats.lock().await.record_close(&trade, took_profit, local(now));

        info!(
            side = %trade.side,
            entry = trade.entry_price,
            exit = exit_price,
            size = trade.size,
            pnl,
            step = trade.close_step,
            %reason,
            "Position closed"
        );
        let msg = format!(
            "{} <b>Position closed</b> ({})\n<b>Side:</b> <code>{}</code>\n<b>Entry:</b> <code>{}</code>\n<b>Exit:</b> <code>{}</code>\n<b>Size:</b> <code>{}</code>\n<b>PnL:</b> <code>{}{} USDT</code>",
            if pnl >= 0.0 { "✅" } else { "❌" },
            reason,
            trade.side,
            fmt_usd(trade.entry_price),
            fmt_usd(exit_price),
            trade.size,
            if pnl >= 0.0 { "+" } else { "" },
            fmt_usd(pnl)
        );
        self.alerts.notify(&msg).await;
        for prefix in ["step:", "touch:", "cross:", "autoclose:", "revopp:", "revtight:"] {
            self.alerts.clear_prefix(prefix);
        }
        self.opposite.reset();

        match self.gateway.fetch_available_collateral().await {
            Ok(balance) => {
                self.collateral.send_replace(balance);
            }
            Err(e) => debug!(error = %e, "Collateral refresh after close failed"),
        }

        let obs = match self.refresh_htf().await {
            Ok(obs) => obs,
            Err(e) => {
                warn!(error = %e, "HTF refresh after close failed, using last observation");
                self.last_htf
            }
        };
        if std::mem::take(&mut self.rearm_after_close) {
            let direction = obs.and_then(|o| o.direction);
            if let (Phase::Flat(planner), Some(obs)) = (&mut self.phase, obs) {
                planner.seed_armed(direction, obs.bar_time);
            }
            match direction {
                Some(direction) => {
                    info!(%direction, "Re-armed after reversal close");
                    self.alerts
                        .notify(&format!("🎯 <b>Re-armed {}</b> after the reversal close", direction))
                        .await;
                }
                None => info!("HTF indeterminate after reversal close, staying idle"),
            }
        } else if let Some(obs) = obs {
            self.baseline.reset(&obs);
        }
        self.persist(now);
    }

    /// Single add toward the target notional, limited by free collateral.
    /// Any order attempt disables further adds.
    async fn scale_in_now(&mut self, remaining_notional: f64, price: f64) {
        let Some(side) = self.position().map(|p| p.side) else {
            return;
        };
        let collateral = match self.gateway.fetch_available_collateral().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Scale-in skipped: collateral unavailable");
                return;
            }
        };
        let take = remaining_notional.min(risk::target_notional(collateral, &self.params));
        let contracts = risk::contracts_for_notional(take, price, &self.spec);
        if contracts <= 0.0 {
            debug!(remaining_notional, collateral, "Scale-in below the minimum lot");
            return;
        }

        let params = OrderParams::open(self.config.instrument.margin_mode);
        let result = self.gateway.open_market(side.entry_side(), contracts, params, side).await;
        if let Phase::Holding(lifecycle) = &mut self.phase {
            lifecycle.disable_scale_in();
        }
        match result {
            Ok(()) => {
                info!(%side, contracts, price, "Scale-in filled");
                self.alerts
                    .notify(&format!(
                        "➕ <b>Scale-in</b> {} <code>{}</code> @ <code>{}</code>",
                        side,
                        contracts,
                        fmt_usd(price)
                    ))
                    .await;
            }
            Err(e) => {
                warn!(error = %e, "Scale-in order failed, adds disabled");
                self.alerts
                    .notify(&format!("⚠️ <b>Scale-in failed</b>: {}", e))
                    .await;
            }
        }
    }

    /// Tracks a position the exchange holds. Restored state keeps its stop
    /// and steps; anything else gets a fresh initial stop.
    async fn adopt(
        &mut self,
        live: ExchangePosition,
        restored: Option<TrackedPosition>,
        scale_in: Option<ScaleInPlan>,
        now: DateTime<Utc>,
    ) {
        let from_state = restored.is_some();
        let position =
            restored.unwrap_or_else(|| TrackedPosition::new(live.side, live.entry_price, live.size, now));
        let mut lifecycle = PositionLifecycle::new(position, scale_in, self.rules.clone(), self.spec);
        lifecycle.sync_from_exchange(&live);

        if lifecycle.position().stop_price.is_none() {
            let ltf_tf = self.config.instrument.ltf.clone();
            let stop = match self.fetch_window(&ltf_tf, self.config.entry.lookback).await {
                Ok((closed, _)) => self.initial_stop_for(live.side, live.entry_price, &closed),
                Err(e) => {
                    warn!(error = %e, "No bars for the adopted position's stop");
                    None
                }
            };
            let stop = stop.unwrap_or(live.entry_price - live.side.sign() * self.config.initial_stop.max_points);
            lifecycle.tighten_stop(stop, StopSource::Initial);
        }

        let p = lifecycle.position();
        info!(
            side = %p.side,
            entry = p.entry_price,
            size = p.size,
            stop = ?p.stop_price,
            step = p.step_index,
            from_state,
            "Position adopted"
        );
        let msg = format!(
            "📥 <b>Tracking {} position</b>\n<b>Entry:</b> <code>{}</code>\n<b>Size:</b> <code>{}</code>\n<b>Stop:</b> <code>{}</code>",
            p.side,
            fmt_usd(p.entry_price),
            p.size,
            p.stop_price.map(fmt_usd).unwrap_or_else(|| "-".to_string())
        );
        self.opposite.reset();
        self.phase = Phase::Holding(lifecycle);
        self.alerts.notify(&msg).await;
        self.persist(now);
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Swing level ∓ extra, clamped to the maximum distance from `entry`.
    /// A level on the wrong side of entry falls back to the maximum distance.
    fn initial_stop_for(&self, direction: Direction, entry: f64, ltf_closed: &[Candle]) -> Option<f64> {
        let cfg = &self.config.initial_stop;
        let (low, high) = recent_swing_levels(ltf_closed, cfg.swing_lookback, cfg.swing_strength)?;
        let swing = match direction {
            Direction::Long => low,
            Direction::Short => high,
        };
        let window = &ltf_closed[ltf_closed.len().saturating_sub(cfg.swing_lookback)..];
        let anchor = stop_anchor(window, direction, swing, cfg.poc.as_ref());
        let stop = initial_stop(direction, entry, anchor, cfg.extra_points, cfg.max_points);
        if !stop.is_finite() {
            return None;
        }
        if direction.sign() * (entry - stop) <= 0.0 {
            warn!(%direction, entry, stop, "Swing stop on the wrong side of entry, using the maximum distance");
            return Some(entry - direction.sign() * cfg.max_points);
        }
        Some(stop)
    }

    /// Closed bars and the live bar for `timeframe`. A cached timeframe only
    /// pulls the newest page; a page that misses the cache reloads `limit`.
    async fn fetch_window(&mut self, timeframe: &str, limit: usize) -> Result<Window> {
        let request = self.bars.request_size(timeframe, limit);
        let candles = self
            .gateway
            .fetch_ohlcv(timeframe, request)
            .await
            .with_context(|| format!("Failed to fetch {} candles", timeframe))?;
        if request < limit {
            if let Some(window) = self.bars.merge(timeframe, &candles, limit) {
                return Ok(window);
            }
            debug!(timeframe, request, "Newest page does not overlap cached bars, reloading");
            let candles = self
                .gateway
                .fetch_ohlcv(timeframe, limit)
                .await
                .with_context(|| format!("Failed to fetch {} candles", timeframe))?;
            return Ok(self.bars.replace(timeframe, &candles, limit));
        }
        Ok(self.bars.replace(timeframe, &candles, limit))
    }

    async fn refresh_htf(&mut self) -> Result<Option<HtfObservation>> {
        let htf_tf = self.config.instrument.htf.clone();
        let (closed, _) = self.fetch_window(&htf_tf, self.config.trend.lookback).await?;
        let obs = HtfObservation::from_closed(&closed, self.config.trend.ema_fast, self.config.trend.ema_slow);
        if obs.is_some() {
            self.last_htf = obs;
        }
        Ok(obs)
    }

    async fn wait_for_position(&self, side: Direction, attempts: u32, delay: Duration) -> Option<ExchangePosition> {
        for attempt in 1..=attempts.max(1) {
            sleep(delay).await;
            match self.gateway.fetch_position().await {
                Ok(Some(live)) if live.side == side => return Some(live),
                Ok(other) => debug!(attempt, ?other, "Fill not visible yet"),
                Err(e) => warn!(attempt, error = %e, "Position poll failed"),
            }
        }
        None
    }

    async fn cancel_orders(&self, attempts: u32) {
        for attempt in 1..=attempts.max(1) {
            match self.gateway.cancel_all_open_orders().await {
                Ok(0) => return,
                Ok(cancelled) => {
                    info!(cancelled, "Cancelled open orders");
                    return;
                }
                Err(e) => warn!(attempt, error = %e, "Cancel all failed"),
            }
        }
    }

    fn log_diagnostics(&mut self, htf_closed: &[Candle], ltf_closed: &[Candle], price: f64, now: DateTime<Utc>) {
        if self.snapshot_every.due(now) {
            let stage = self.plan().map(|p| p.stage()).unwrap_or("-");
            IndicatorSnapshot::compute(&self.config, htf_closed, ltf_closed, Some(price)).log(stage);
        }
        if self.diagnostics_every.due(now) {
            let trend = &self.config.trend;
            let entry = &self.config.entry;
            log_warmup(&ema_warmup(&self.config.instrument.htf, htf_closed, &[trend.ema_fast, trend.ema_slow]));
            log_warmup(&ema_warmup(&self.config.instrument.ltf, ltf_closed, &[entry.macd_fast, entry.macd_slow]));
        }
    }

    /// Writes the session state file
    pub fn persist(&self, now: DateTime<Utc>) {
        let (position, scale_in) = match &self.phase {
            Phase::Holding(lifecycle) => (Some(lifecycle.position().clone()), lifecycle.scale_in().cloned()),
            _ => (None, None),
        };
        self.store.save_or_warn(&SessionSnapshot {
            saved_at: now,
            position,
            scale_in,
            rearm_after_close: self.rearm_after_close,
            initial_balance: self.initial_balance,
        });
    }
}

fn local(now: DateTime<Utc>) -> NaiveDateTime {
    now.with_timezone(&Local).naive_local()
}
