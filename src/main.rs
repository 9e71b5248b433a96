//! Perp trend trader - main entry point
//!
//! This binary provides three subcommands:
//! - live: Run the trading session (paper or real money)
//! - snapshot: Print the current indicator state once
//! - report: Print this month's statistics, optionally exporting trades

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "perp-trend-trader")]
#[command(about = "Trend/pullback trader for a single perpetual swap with stepped trailing stops", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run live trading
    Live {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/okx_btc_swap.json")]
        config: String,

        /// Paper trading mode (live market data, simulated account)
        #[arg(long)]
        paper: bool,

        /// Live trading mode (CAUTION - REAL MONEY!)
        #[arg(long)]
        live: bool,

        /// Tick interval in seconds (overrides runtime.tick_secs)
        #[arg(long)]
        interval: Option<u64>,

        /// Starting balance of the simulated account in paper mode
        #[arg(long, default_value = "1000")]
        paper_balance: f64,
    },

    /// Print the current indicator snapshot and EMA warm-up state
    Snapshot {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/okx_btc_swap.json")]
        config: String,
    },

    /// Print this month's trading statistics
    Report {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/okx_btc_swap.json")]
        config: String,

        /// Export closed trades to this CSV file
        #[arg(long)]
        export: Option<String>,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // Filter out noisy HTTP crates
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    // Same format without ANSI colors
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Live { .. } => "live",
        Commands::Snapshot { .. } => "snapshot",
        Commands::Report { .. } => "report",
    };

    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Live {
            config,
            paper,
            live,
            interval,
            paper_balance,
        } => commands::live::run(config, paper, live, interval, paper_balance),

        Commands::Snapshot { config } => commands::snapshot::run(config),

        Commands::Report { config, export } => commands::report::run(config, export),
    }
}
