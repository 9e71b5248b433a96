//! End-to-end scenarios for the trading session against a scripted exchange.
//!
//! Price series are built so that each stage is deterministic:
//! - HTF: a slow decline (EMA3 < EMA6, short) followed by a four-bar rally
//!   (long), then sharp drops (short again)
//! - LTF: a steady climb, a four-bar pullback under the EMA-20 with DIF below
//!   DEA, then a strong bar that crosses DIF above DEA

mod common;

use approx::assert_relative_eq;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;

use common::*;
use perp_trend_trader::bar_cache::REFRESH_PAGE;
use perp_trend_trader::config::ReversalAction;
use perp_trend_trader::gateway::{ExecutionGateway, PaperGateway};
use perp_trend_trader::planner::EntryPlan;
use perp_trend_trader::session::{Phase, TradingSession};
use perp_trend_trader::state_manager::JsonStateStore;
use perp_trend_trader::stats::{StatsEntry, StatsRecorder};
use perp_trend_trader::{Config, Direction, ExchangePosition, OrderSide};

const CONFIRM_PRICE: f64 = 61_060.0;

// =============================================================================
// Series
// =============================================================================

fn htf_down() -> Vec<f64> {
    (0..30).map(|i| 60_000.0 - 20.0 * i as f64).collect()
}

/// 34 closed bars, the last (index 33) reads long
fn htf_up() -> Vec<f64> {
    let mut closes = htf_down();
    let last = closes[closes.len() - 1];
    closes.extend((1..=4).map(|i| last + 300.0 * i as f64));
    closes
}

/// `htf_up` followed by `drops` falling bars; each reads short
fn htf_turned(drops: usize) -> Vec<f64> {
    let mut closes = htf_up();
    for i in 0..drops {
        let last = closes[closes.len() - 1];
        closes.push(last - if i == 0 { 1_500.0 } else { 300.0 });
    }
    closes
}

fn ltf_pullback() -> Vec<f64> {
    let mut closes: Vec<f64> = (0..60).map(|i| 59_000.0 + 20.0 * i as f64).collect();
    let top = closes[closes.len() - 1];
    closes.extend((1..=4).map(|i| top - 80.0 * i as f64));
    closes
}

fn ltf_confirmed() -> Vec<f64> {
    let mut closes = ltf_pullback();
    closes.push(CONFIRM_PRICE);
    closes
}

fn htf_rising_from(base: f64) -> Vec<f64> {
    (0..30).map(|i| base + 20.0 * i as f64).collect()
}

fn ltf_rising_from(base: f64) -> Vec<f64> {
    (0..60).map(|i| base + 10.0 * i as f64).collect()
}

fn at(seconds: i64) -> DateTime<Utc> {
    t0() + Duration::days(2) + Duration::seconds(seconds)
}

// =============================================================================
// Harness
// =============================================================================

struct Harness<G> {
    session: TradingSession<G>,
    notifier: Arc<RecordingNotifier>,
    stats: Arc<Mutex<StatsRecorder>>,
}

async fn start_with<G: ExecutionGateway>(gateway: G, config: Config) -> Harness<G> {
    let notifier = recording_notifier();
    let stats = Arc::new(Mutex::new(StatsRecorder::load(&config.stats.file)));
    let mut session = TradingSession::new(gateway, config, notifier.clone(), stats.clone());
    session.start("test", at(0)).await.unwrap();
    Harness {
        session,
        notifier,
        stats,
    }
}

async fn start(dir: &TempDir, market: Market) -> Harness<ScriptedGateway> {
    start_with(ScriptedGateway::new(market), test_config(dir)).await
}

fn flat_market() -> Market {
    Market {
        price: 59_860.0,
        htf: hourly(&htf_down()),
        ltf: five_minute(&ltf_pullback()),
        ..Market::default()
    }
}

fn holding_market(entry: f64) -> Market {
    Market {
        price: entry,
        htf: hourly(&htf_rising_from(entry - 1_000.0)),
        ltf: five_minute(&ltf_rising_from(entry - 1_000.0)),
        position: Some(ExchangePosition {
            side: Direction::Long,
            size: 10.0,
            entry_price: entry,
        }),
        ..Market::default()
    }
}

fn scale_in_config(dir: &TempDir) -> Config {
    let mut config = test_config(dir);
    config.scale_in.enabled = true;
    config
}

/// The exchange reports only `size` contracts of the entry
fn partial_fill(session: &TradingSession<ScriptedGateway>, size: f64) {
    session.gateway().update(|m| {
        if let Some(p) = m.position.as_mut() {
            p.size = size;
        }
    });
}

fn assert_exclusive<G: ExecutionGateway>(session: &TradingSession<G>) {
    assert!(
        !(session.plan().is_some() && session.position().is_some()),
        "plan and position must never coexist"
    );
}

/// HTF turns long and the pullback touches the zone with a bearish MACD
async fn arm(session: &mut TradingSession<ScriptedGateway>) {
    session.gateway().update(|m| {
        m.htf = hourly(&htf_up());
        m.ltf = five_minute(&ltf_pullback());
    });
    session.tick(at(10)).await.unwrap();
    assert_exclusive(session);
}

/// The next LTF bar crosses DIF above DEA
async fn confirm(session: &mut TradingSession<ScriptedGateway>) {
    session.gateway().update(|m| {
        m.ltf = five_minute(&ltf_confirmed());
        m.price = CONFIRM_PRICE;
    });
    session.tick(at(20)).await.unwrap();
    assert_exclusive(session);
}

// =============================================================================
// Entry
// =============================================================================

#[tokio::test]
async fn test_cross_arms_then_pullback_awaits_confirmation() {
    let dir = TempDir::new().unwrap();
    let mut h = start(&dir, flat_market()).await;
    assert_eq!(h.session.baseline().direction(), Some(Direction::Short));
    assert_eq!(h.session.plan(), Some(EntryPlan::Idle));

    arm(&mut h.session).await;

    match h.session.plan() {
        Some(EntryPlan::AwaitingConfirmation {
            direction,
            armed_bar_time,
            ..
        }) => {
            assert_eq!(direction, Direction::Long);
            assert_eq!(armed_bar_time, hour_bar(33));
        }
        other => panic!("expected awaiting confirmation, got {:?}", other),
    }
    assert_eq!(h.notifier.count_containing("HTF cross long"), 1);
    assert_eq!(h.notifier.count_containing("zone touched"), 1);
    assert!(h.session.gateway().orders().is_empty());
}

#[tokio::test]
async fn test_repeated_ticks_on_same_bars_do_not_realert() {
    let dir = TempDir::new().unwrap();
    let mut h = start(&dir, flat_market()).await;
    arm(&mut h.session).await;
    let plan = h.session.plan();

    for i in 0..3 {
        h.session.tick(at(11 + i)).await.unwrap();
    }

    assert_eq!(h.session.plan(), plan);
    assert_eq!(h.notifier.count_containing("HTF cross"), 1);
    assert_eq!(h.notifier.count_containing("zone touched"), 1);
}

#[tokio::test]
async fn test_macd_cross_opens_long_with_initial_stop() {
    let dir = TempDir::new().unwrap();
    let mut h = start(&dir, flat_market()).await;
    arm(&mut h.session).await;
    confirm(&mut h.session).await;

    let orders = h.session.gateway().orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].side, OrderSide::Buy);
    assert!(!orders[0].reduce_only);
    // (1000 - 5) * 0.8 * 40 = 31840 notional at 61060 with 0.01 contracts
    assert_relative_eq!(orders[0].size, 52.14, epsilon = 1e-9);

    assert!(h.session.plan().is_none());
    let position = h.session.position().expect("holding after the fill");
    assert_eq!(position.side, Direction::Long);
    assert_relative_eq!(position.entry_price, CONFIRM_PRICE);
    // No confirmed swing low inside the window reaches the maximum distance
    assert_relative_eq!(position.stop_price.unwrap(), CONFIRM_PRICE - 1_234.0, epsilon = 1e-6);
    assert_eq!(h.notifier.count_containing("long opened"), 1);

    let saved = JsonStateStore::new(dir.path().join("session_state.json"))
        .load()
        .unwrap()
        .unwrap();
    assert_eq!(saved.position.as_ref(), h.session.position());
}

#[tokio::test]
async fn test_unconfirmed_fill_needs_attention_until_position_appears() {
    let dir = TempDir::new().unwrap();
    let mut h = start(
        &dir,
        Market {
            fill_orders: false,
            ..flat_market()
        },
    )
    .await;
    arm(&mut h.session).await;
    confirm(&mut h.session).await;

    assert!(matches!(h.session.phase(), Phase::NeedsAttention { .. }));
    assert!(h.session.plan().is_none());
    assert!(h.session.position().is_none());
    assert_eq!(h.notifier.count_containing("ATTENTION"), 1);

    // Nothing new is attempted while the state is unknown
    h.session.tick(at(30)).await.unwrap();
    assert_eq!(h.session.gateway().orders().len(), 1);

    h.session.gateway().update(|m| {
        m.position = Some(ExchangePosition {
            side: Direction::Long,
            size: 52.14,
            entry_price: CONFIRM_PRICE,
        })
    });
    h.session.tick(at(40)).await.unwrap();
    let position = h.session.position().expect("late fill adopted");
    assert_eq!(position.side, Direction::Long);
    assert!(position.stop_price.is_some());
}

#[tokio::test]
async fn test_insufficient_collateral_skips_entry() {
    let dir = TempDir::new().unwrap();
    let mut h = start(
        &dir,
        Market {
            collateral: 3.0,
            ..flat_market()
        },
    )
    .await;
    arm(&mut h.session).await;
    confirm(&mut h.session).await;

    assert!(h.session.gateway().orders().is_empty());
    assert_eq!(h.session.plan(), Some(EntryPlan::Idle));
    assert_eq!(h.notifier.count_containing("insufficient collateral"), 1);
}

// =============================================================================
// Scale-in
// =============================================================================

#[tokio::test]
async fn test_partial_fill_is_topped_up_once() {
    let dir = TempDir::new().unwrap();
    let mut h = start_with(ScriptedGateway::new(flat_market()), scale_in_config(&dir)).await;
    arm(&mut h.session).await;
    confirm(&mut h.session).await;
    assert_eq!(h.session.gateway().orders().len(), 1);
    let plan = h.session.scale_in().expect("plan set at entry").clone();
    assert_relative_eq!(plan.target_notional, 31_840.0, epsilon = 1e-6);
    assert_eq!(plan.risk_budget, None);

    partial_fill(&h.session, 30.0);
    h.session.tick(at(30)).await.unwrap();

    let orders = h.session.gateway().orders();
    assert_eq!(orders.len(), 2);
    let add = &orders[1];
    assert_eq!(add.side, OrderSide::Buy);
    assert!(!add.reduce_only);
    // (31840 - 30 * 610.6) / 610.6 = 22.145..., floored to the lot step
    assert_relative_eq!(add.size, 22.14, epsilon = 1e-9);
    assert!(h.session.scale_in().is_some_and(|p| p.add_disabled));

    // Still inside the band: no second add
    for i in 0..3 {
        h.session.tick(at(40 + 10 * i)).await.unwrap();
    }
    assert_eq!(h.session.gateway().orders().len(), 2);
    assert_eq!(h.notifier.count_containing("Scale-in"), 1);
    assert_relative_eq!(h.session.position().unwrap().size, 52.14, epsilon = 1e-9);
}

#[tokio::test]
async fn test_scale_in_is_limited_by_committed_share_of_collateral() {
    let dir = TempDir::new().unwrap();
    let mut h = start_with(ScriptedGateway::new(flat_market()), scale_in_config(&dir)).await;
    arm(&mut h.session).await;
    confirm(&mut h.session).await;

    partial_fill(&h.session, 30.0);
    h.session.gateway().update(|m| m.collateral = 300.0);
    h.session.tick(at(30)).await.unwrap();

    let orders = h.session.gateway().orders();
    assert_eq!(orders.len(), 2);
    // (300 - 5) * 0.8 * 40 = 9440 of the 13522 still missing
    assert_relative_eq!(orders[1].size, 15.46, epsilon = 1e-9);
}

#[tokio::test]
async fn test_risk_clamped_entry_is_not_topped_up() {
    let dir = TempDir::new().unwrap();
    let mut config = scale_in_config(&dir);
    config.risk.max_risk_fraction = Some(0.01);
    let mut h = start_with(ScriptedGateway::new(flat_market()), config).await;
    arm(&mut h.session).await;
    confirm(&mut h.session).await;

    let orders = h.session.gateway().orders();
    assert_eq!(orders.len(), 1);
    // 1000 * 0.01 = 10 USDT at a 1234 pt stop: 10 / 12.34 = 0.81 contracts
    assert_relative_eq!(orders[0].size, 0.81, epsilon = 1e-9);
    let plan = h.session.scale_in().expect("plan set at entry").clone();
    assert_relative_eq!(plan.target_notional, 0.81 * 0.01 * CONFIRM_PRICE, epsilon = 1e-6);
    assert_relative_eq!(plan.risk_budget.unwrap(), 10.0, epsilon = 1e-9);

    for i in 0..3 {
        h.session.tick(at(30 + 10 * i)).await.unwrap();
    }
    assert_eq!(h.session.gateway().orders().len(), 1);
    assert_eq!(h.notifier.count_containing("Scale-in"), 0);
    let p = h.session.position().unwrap();
    let loss_at_stop = p.size * 0.01 * (p.entry_price - p.stop_price.unwrap());
    assert!(loss_at_stop <= 10.0 + 1e-9);
}

// =============================================================================
// Reversal
// =============================================================================

#[tokio::test]
async fn test_adverse_reversal_closes_and_rearms_opposite() {
    let dir = TempDir::new().unwrap();
    let mut h = start(&dir, flat_market()).await;
    arm(&mut h.session).await;
    confirm(&mut h.session).await;
    assert!(h.session.position().is_some());

    h.session.gateway().update(|m| m.htf = hourly(&htf_turned(1)));
    h.session.tick(at(30)).await.unwrap();
    assert!(h.session.position().is_some(), "one opposite bar is not enough");

    h.session.gateway().update(|m| m.htf = hourly(&htf_turned(2)));
    h.session.tick(at(40)).await.unwrap();
    assert_exclusive(&h.session);

    let orders = h.session.gateway().orders();
    let exit = orders.last().unwrap();
    assert!(exit.reduce_only);
    assert_eq!(exit.side, OrderSide::Sell);
    assert_relative_eq!(exit.size, 52.14, epsilon = 1e-9);

    assert_eq!(
        h.session.plan(),
        Some(EntryPlan::Armed {
            direction: Direction::Short,
            armed_bar_time: hour_bar(35),
        })
    );
    assert!(!h.session.rearm_pending());
    assert_eq!(h.notifier.count_containing("Re-armed short"), 1);

    let stats = h.stats.lock().await;
    assert_eq!(stats.stats().closes(), 1);
    match stats.stats().trades.last() {
        Some(StatsEntry::Close { reason, close_step, .. }) => {
            assert_eq!(reason, "adverse reversal");
            assert_eq!(*close_step, 0);
        }
        other => panic!("expected a close entry, got {:?}", other),
    }
}

#[tokio::test]
async fn test_tighten_reversal_moves_stop_instead_of_closing() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.reversal.action = ReversalAction::TightenStop;
    let mut h = start_with(ScriptedGateway::new(flat_market()), config).await;
    arm(&mut h.session).await;
    confirm(&mut h.session).await;

    h.session.gateway().update(|m| m.htf = hourly(&htf_turned(1)));
    h.session.tick(at(30)).await.unwrap();
    h.session.gateway().update(|m| m.htf = hourly(&htf_turned(2)));
    h.session.tick(at(40)).await.unwrap();

    let position = h.session.position().expect("still holding");
    assert_relative_eq!(position.stop_price.unwrap(), CONFIRM_PRICE - 100.0, epsilon = 1e-6);
    assert_eq!(h.session.gateway().orders().len(), 1);
    assert_eq!(h.notifier.count_containing("Stop tightened"), 1);

    // Price falls through the tightened stop
    h.session.gateway().update(|m| m.price = CONFIRM_PRICE - 150.0);
    h.session.tick(at(50)).await.unwrap();
    assert!(h.session.position().is_none());
    match h.stats.lock().await.stats().trades.last() {
        Some(StatsEntry::Close { reason, pnl, .. }) => {
            assert_eq!(reason, "reversal stop");
            assert!(*pnl < 0.0);
        }
        other => panic!("expected a close entry, got {:?}", other),
    };
}

// =============================================================================
// Trailing steps
// =============================================================================

#[tokio::test]
async fn test_steps_trail_stop_and_close_on_step_two() {
    let dir = TempDir::new().unwrap();
    let entry = 100_000.0;
    let mut h = start(&dir, holding_market(entry)).await;
    let adopted = h.session.position().expect("adopted at startup").clone();
    assert!(adopted.stop_price.unwrap() < entry - 200.0);

    h.session.gateway().update(|m| m.price = entry + 450.0);
    h.session.tick(at(10)).await.unwrap();
    let p = h.session.position().unwrap();
    assert_eq!(p.step_index, 1);
    assert_relative_eq!(p.stop_price.unwrap(), entry - 200.0, epsilon = 1e-6);

    h.session.gateway().update(|m| m.price = entry + 700.0);
    h.session.tick(at(20)).await.unwrap();
    let p = h.session.position().unwrap();
    assert_eq!(p.step_index, 2);
    assert_relative_eq!(p.stop_price.unwrap(), entry + 300.0, epsilon = 1e-6);
    assert_eq!(h.stats.lock().await.stats().tp_reached, 1);
    assert_eq!(h.notifier.count_containing("Step 2 reached"), 1);

    h.session.gateway().update(|m| m.price = entry + 250.0);
    h.session.tick(at(30)).await.unwrap();
    assert!(h.session.position().is_none());
    assert_eq!(h.session.plan(), Some(EntryPlan::Idle));

    let stats = h.stats.lock().await;
    let s = stats.stats();
    assert_eq!(s.closes_by_step.get(&2), Some(&1));
    assert_eq!(s.tp_close, 1);
    // 250 points * 10 contracts * 0.01
    assert_relative_eq!(s.pnl_plus, 25.0, epsilon = 1e-9);
    match s.trades.last() {
        Some(StatsEntry::Close { reason, .. }) => assert_eq!(reason, "step-2 stop"),
        other => panic!("expected a close entry, got {:?}", other),
    }
}

#[tokio::test]
async fn test_restart_restores_stop_and_steps() {
    let dir = TempDir::new().unwrap();
    let entry = 100_000.0;
    let market = {
        let mut h = start(&dir, holding_market(entry)).await;
        for (i, move_up) in [450.0, 700.0].into_iter().enumerate() {
            h.session.gateway().update(|m| m.price = entry + move_up);
            h.session.tick(at(10 * (i as i64 + 1))).await.unwrap();
        }
        assert_eq!(h.session.position().unwrap().step_index, 2);
        h.session.gateway().market()
    };

    let h = start(&dir, market).await;
    let p = h.session.position().expect("restored");
    assert_eq!(p.step_index, 2);
    assert_relative_eq!(p.stop_price.unwrap(), entry + 300.0, epsilon = 1e-6);
    assert_eq!(h.session.initial_balance(), Some(1_000.0));
}

#[tokio::test]
async fn test_auto_close_notifies_once() {
    let dir = TempDir::new().unwrap();
    let entry = 100_000.0;
    let mut h = start(&dir, holding_market(entry)).await;

    h.session.gateway().update(|m| m.price = entry + 1_450.0);
    h.session.tick(at(10)).await.unwrap();

    assert!(h.session.position().is_none());
    assert_eq!(h.notifier.count_containing("+1400 pts reached"), 1);
    match h.stats.lock().await.stats().trades.last() {
        Some(StatsEntry::Close { reason, .. }) => assert_eq!(reason, "auto-close 1400 pts"),
        other => panic!("expected a close entry, got {:?}", other),
    };
}

#[tokio::test]
async fn test_unconfirmed_close_keeps_its_reason() {
    let dir = TempDir::new().unwrap();
    let entry = 100_000.0;
    let mut h = start(
        &dir,
        Market {
            fill_orders: false,
            ..holding_market(entry)
        },
    )
    .await;

    h.session.gateway().update(|m| m.price = entry + 1_450.0);
    h.session.tick(at(10)).await.unwrap();
    let orders = h.session.gateway().orders();
    assert_eq!(orders.len(), 1);
    assert!(orders[0].reduce_only);
    assert!(h.session.position().is_some(), "exchange still holds the position");

    // The reduce-only order lands between ticks
    h.session.gateway().update(|m| m.position = None);
    h.session.tick(at(20)).await.unwrap();

    assert!(h.session.position().is_none());
    assert_eq!(h.session.gateway().orders().len(), 1);
    match h.stats.lock().await.stats().trades.last() {
        Some(StatsEntry::Close { reason, .. }) => assert_eq!(reason, "auto-close 1400 pts"),
        other => panic!("expected a close entry, got {:?}", other),
    };
}

// =============================================================================
// Reconciliation
// =============================================================================

#[tokio::test]
async fn test_exchange_flat_records_external_close() {
    let dir = TempDir::new().unwrap();
    let entry = 100_000.0;
    let mut h = start(&dir, holding_market(entry)).await;
    assert!(h.session.position().is_some());

    h.session.gateway().update(|m| {
        m.position = None;
        m.price = entry - 100.0;
    });
    h.session.tick(at(10)).await.unwrap();

    assert!(h.session.position().is_none());
    assert_eq!(h.session.plan(), Some(EntryPlan::Idle));
    assert!(h.session.gateway().orders().is_empty());
    let stats = h.stats.lock().await;
    assert_eq!(stats.stats().closes(), 1);
    assert_relative_eq!(stats.stats().pnl_minus, -10.0, epsilon = 1e-9);
    match stats.stats().trades.last() {
        Some(StatsEntry::Close { reason, .. }) => assert_eq!(reason, "closed on exchange"),
        other => panic!("expected a close entry, got {:?}", other),
    }
}

#[tokio::test]
async fn test_untracked_position_is_adopted_on_tick() {
    let dir = TempDir::new().unwrap();
    let mut h = start(&dir, flat_market()).await;
    assert!(h.session.position().is_none());

    h.session.gateway().update(|m| {
        m.position = Some(ExchangePosition {
            side: Direction::Short,
            size: 3.0,
            entry_price: 59_860.0,
        })
    });
    h.session.tick(at(10)).await.unwrap();

    let p = h.session.position().expect("adopted");
    assert_eq!(p.side, Direction::Short);
    assert!(p.stop_price.unwrap() > 59_860.0);
    assert_eq!(h.notifier.count_containing("Tracking short position"), 1);
}

// =============================================================================
// Candle fetching
// =============================================================================

#[tokio::test]
async fn test_warm_session_fetches_only_the_newest_page() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let mut h = start(&dir, flat_market()).await;
    arm(&mut h.session).await;
    confirm(&mut h.session).await;
    assert!(h.session.position().is_some(), "entry fires off cached windows");
    h.session.tick(at(30)).await.unwrap();

    let htf = h.session.gateway().candle_requests("1h");
    assert!(htf.len() >= 3);
    assert_eq!(htf[0], config.trend.lookback);
    assert!(htf[1..].iter().all(|&n| n == REFRESH_PAGE.min(config.trend.lookback)));

    let ltf = h.session.gateway().candle_requests("5m");
    assert_eq!(ltf.len(), 2);
    assert_eq!(ltf[0], config.entry.lookback);
    assert_eq!(ltf[1], REFRESH_PAGE.min(config.entry.lookback));
}

#[tokio::test]
async fn test_gap_past_cached_bars_reloads_full_window() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let long_decline: Vec<f64> = (0..150).map(|i| 60_000.0 - 5.0 * i as f64).collect();
    let mut h = start(
        &dir,
        Market {
            htf: hourly(&long_decline),
            ..flat_market()
        },
    )
    .await;

    // The process slept through 200 hours: the newest page cannot reach the cache
    h.session.gateway().update(|m| {
        m.htf = window(t0() + Duration::hours(200), Duration::hours(1), &long_decline);
    });
    h.session.tick(at(10)).await.unwrap();

    let htf = h.session.gateway().candle_requests("1h");
    assert_eq!(
        htf,
        vec![config.trend.lookback, REFRESH_PAGE, config.trend.lookback]
    );
    assert_eq!(h.session.baseline().direction(), Some(Direction::Short));
}

// =============================================================================
// Paper account
// =============================================================================

#[tokio::test]
async fn test_paper_round_trip_pays_fees() {
    let dir = TempDir::new().unwrap();
    let paper = PaperGateway::new(ScriptedGateway::new(flat_market()), 1_000.0, 40.0);
    let mut h = start_with(paper, test_config(&dir)).await;

    h.session.gateway().inner().update(|m| {
        m.htf = hourly(&htf_up());
        m.ltf = five_minute(&ltf_pullback());
    });
    h.session.tick(at(10)).await.unwrap();
    h.session.gateway().inner().update(|m| {
        m.ltf = five_minute(&ltf_confirmed());
        m.price = CONFIRM_PRICE;
    });
    h.session.tick(at(20)).await.unwrap();
    assert_relative_eq!(h.session.position().unwrap().size, 52.14, epsilon = 1e-9);

    for (i, drops) in [1, 2].into_iter().enumerate() {
        h.session.gateway().inner().update(|m| m.htf = hourly(&htf_turned(drops)));
        h.session.tick(at(30 + 10 * i as i64)).await.unwrap();
    }

    assert!(h.session.position().is_none());
    assert_eq!(h.session.gateway().fill_count().await, 2);
    // Flat exit: only the two taker fees are lost
    let fee = 52.14 * 0.01 * CONFIRM_PRICE * 0.0005;
    assert_relative_eq!(h.session.gateway().balance().await, 1_000.0 - 2.0 * fee, epsilon = 1e-6);
    // The scripted exchange never saw an order
    assert!(h.session.gateway().inner().orders().is_empty());
}
