//! Live Trading Command
//!
//! Runs the trading session on a fixed tick with:
//! - graceful shutdown on Ctrl+C (the current tick finishes, state is saved,
//!   open positions are left alone)
//! - a background task sending the monthly report
//! - paper mode: live OKX market data, simulated account

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{error, info, warn};

use perp_trend_trader::config::{RuntimeConfig, StatsConfig};
use perp_trend_trader::gateway::{ExecutionGateway, OkxGateway, PaperGateway};
use perp_trend_trader::notify::{self, Notifier};
use perp_trend_trader::session::TradingSession;
use perp_trend_trader::stats::StatsRecorder;
use perp_trend_trader::Config;

pub fn run(config_path: String, paper: bool, live: bool, interval: Option<u64>, paper_balance: f64) -> Result<()> {
    if !paper && !live {
        anyhow::bail!("Must specify either --paper or --live mode");
    }

    if live && paper {
        anyhow::bail!("Cannot specify both --paper and --live modes");
    }

    dotenv::dotenv().ok();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(config_path, paper, interval, paper_balance))
}

async fn run_async(config_path: String, paper_mode: bool, interval: Option<u64>, paper_balance: f64) -> Result<()> {
    let mut config = Config::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    if let Some(secs) = interval {
        config.runtime.tick_secs = secs.max(1);
    }

    let mode = if paper_mode { "PAPER" } else { "LIVE" };

    info!("╔══════════════════════════════════════════════════════════════╗");
    info!("║          PERP TREND TRADER - {:<5} MODE                       ║", mode);
    info!("╠══════════════════════════════════════════════════════════════╣");
    info!("║ Symbol: {:<52} ║", config.instrument.symbol);
    info!(
        "║ Timeframes: {:<48} ║",
        format!("{} / {}", config.instrument.htf, config.instrument.ltf)
    );
    info!(
        "║ Leverage: {:<50} ║",
        format!("{}x {}", config.instrument.leverage, config.instrument.margin_mode.as_str())
    );
    info!("║ Tick: {:<54} ║", format!("{} seconds", config.runtime.tick_secs));
    if paper_mode {
        info!("║ Paper balance: {:<45} ║", format!("{:.2} USDT", paper_balance));
    }
    info!("╚══════════════════════════════════════════════════════════════╝");

    if !paper_mode {
        warn!("⚠️  LIVE TRADING MODE - REAL MONEY AT RISK!");
        warn!("⚠️  Press Ctrl+C within 10 seconds to abort...");

        for i in (1..=10).rev() {
            info!("Starting in {} seconds...", i);
            sleep(Duration::from_secs(1)).await;
        }
    }

    let notifier = notify::from_config(&config.notifier)?;
    let stats = Arc::new(Mutex::new(StatsRecorder::load(&config.stats.file)));
    let okx = OkxGateway::from_config(&config)?;

    if paper_mode {
        let gateway = PaperGateway::new(okx, paper_balance, config.instrument.leverage);
        drive(gateway, config, notifier, stats, mode).await
    } else {
        if !okx.has_credentials() {
            anyhow::bail!("OKX credentials missing: set OKX_API_KEY, OKX_SECRET and OKX_PASSWORD");
        }
        drive(okx, config, notifier, stats, mode).await
    }
}

async fn drive<G: ExecutionGateway>(
    gateway: G,
    config: Config,
    notifier: Arc<dyn Notifier>,
    stats: Arc<Mutex<StatsRecorder>>,
    mode: &str,
) -> Result<()> {
    let runtime_cfg: RuntimeConfig = config.runtime.clone();
    let stats_cfg: StatsConfig = config.stats.clone();

    let mut session = TradingSession::new(gateway, config, notifier.clone(), stats.clone());
    session.start(mode, Utc::now()).await.context("Session startup failed")?;

    let (report_stop, report_stop_rx) = watch::channel(false);
    let report_task = spawn_monthly_report(
        stats,
        notifier,
        stats_cfg,
        session.subscribe_collateral(),
        session.initial_balance().unwrap_or(0.0),
        report_stop_rx,
    );

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, initiating shutdown...");
                let _ = shutdown_tx.send(()).await;
            }
            Err(e) => {
                error!("Error setting up signal handler: {}", e);
            }
        }
    });

    let mut tick_interval = interval(runtime_cfg.tick_interval());
    tick_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let backoff = Duration::from_secs(runtime_cfg.error_backoff_secs);

    info!("Starting trading loop...");

    loop {
        tokio::select! {
            _ = tick_interval.tick() => {
                if let Err(e) = session.tick(Utc::now()).await {
                    error!("Tick failed: {:#}", e);
                    sleep(backoff).await;
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    session.persist(Utc::now());
    let _ = report_stop.send(true);
    if let Err(e) = report_task.await {
        warn!("Report task ended abnormally: {}", e);
    }
    if let Some(p) = session.position() {
        warn!(side = %p.side, size = p.size, stop = ?p.stop_price, "Position left open on exit");
    }
    info!("Live trading session ended.");
    Ok(())
}

/// Checks every `check_interval_secs` whether the monthly report is due and
/// sends it once per month
fn spawn_monthly_report(
    stats: Arc<Mutex<StatsRecorder>>,
    notifier: Arc<dyn Notifier>,
    cfg: StatsConfig,
    collateral: watch::Receiver<f64>,
    initial_balance: f64,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut check = interval(Duration::from_secs(cfg.check_interval_secs.max(1)));
        check.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = check.tick() => {
                    let now = Local::now().naive_local();
                    let report = {
                        let mut recorder = stats.lock().await;
                        if !recorder.report_due(now, &cfg) {
                            continue;
                        }
                        let balance = *collateral.borrow();
                        recorder.render_report(now, balance, initial_balance)
                    };
                    match notifier.send(&report).await {
                        Ok(()) => {
                            stats.lock().await.mark_reported(now);
                            info!("Monthly report sent");
                        }
                        Err(e) => warn!("Monthly report not delivered, retrying: {}", e),
                    }
                }
                _ = stop.changed() => break,
            }
        }
    })
}
