//! Monthly statistics report

use anyhow::{Context, Result};
use tracing::info;

use perp_trend_trader::notify::fmt_usd;
use perp_trend_trader::stats::StatsRecorder;
use perp_trend_trader::Config;

pub fn run(config_path: String, export: Option<String>) -> Result<()> {
    let config = Config::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    let recorder = StatsRecorder::load(&config.stats.file);
    let stats = recorder.stats();

    let month = stats
        .month
        .map(|m| m.name())
        .unwrap_or_else(|| "no data".to_string());

    println!("\n{}", "=".repeat(60));
    println!("MONTHLY STATS - {}", month);
    println!("{}", "=".repeat(60));
    for (step, count) in &stats.closes_by_step {
        println!("Closed at SL{}:       {}", step, count);
    }
    println!("Total Closes:       {}", stats.closes());
    println!("TP Closes:          {}", stats.tp_close);
    println!("TP Reached:         {}", stats.tp_reached);
    println!("{}", "-".repeat(60));
    println!("Positive PnL:       {} USDT", fmt_usd(stats.pnl_plus));
    println!("Negative PnL:       {} USDT", fmt_usd(stats.pnl_minus));
    println!("Net PnL:            {} USDT", fmt_usd(stats.net_pnl()));
    if let Some(reported) = stats.last_report_month {
        println!("Last Report:        {}", reported);
    }
    println!("{}", "=".repeat(60));

    if let Some(path) = export {
        let rows = recorder.export_trades_csv(&path)?;
        info!("Exported {} trades to {}", rows, path);
        println!("Exported {} trades to {}", rows, path);
    }

    Ok(())
}
