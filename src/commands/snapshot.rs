//! One-shot indicator dump
//!
//! Fetches both timeframes from OKX (public endpoints, no credentials
//! needed), prints the indicator snapshot as JSON and the EMA warm-up state.

use anyhow::{Context, Result};
use tracing::info;

use perp_trend_trader::diagnostics::{ema_warmup, IndicatorSnapshot};
use perp_trend_trader::gateway::{ExecutionGateway, OkxGateway};
use perp_trend_trader::{split_closed, Config};

pub fn run(config_path: String) -> Result<()> {
    dotenv::dotenv().ok();
    let config = Config::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async {
        let gateway = OkxGateway::from_config(&config)?;
        info!("Fetching {} / {} candles for {}", config.instrument.htf, config.instrument.ltf, config.instrument.symbol);

        let htf = gateway.fetch_ohlcv(&config.instrument.htf, config.trend.lookback).await?;
        let ltf = gateway.fetch_ohlcv(&config.instrument.ltf, config.entry.lookback).await?;
        let price = gateway.fetch_ticker().await?.last;
        let (htf_closed, _) = split_closed(&htf);
        let (ltf_closed, _) = split_closed(&ltf);

        let snapshot = IndicatorSnapshot::compute(&config, htf_closed, ltf_closed, Some(price));
        println!("{}", serde_json::to_string_pretty(&snapshot)?);

        println!("\n{}", "=".repeat(60));
        println!("EMA WARM-UP");
        println!("{}", "=".repeat(60));
        let trend = &config.trend;
        let entry = &config.entry;
        let statuses = ema_warmup(&config.instrument.htf, htf_closed, &[trend.ema_fast, trend.ema_slow])
            .into_iter()
            .chain(ema_warmup(&config.instrument.ltf, ltf_closed, &[entry.macd_fast, entry.macd_slow]));
        for s in statuses {
            let state = if s.ready() {
                format!("ready ({:.2})", s.value.unwrap_or_default())
            } else {
                format!("missing {} bars", s.missing())
            };
            println!("{:<4} EMA{:<5} bars={:<6} {}", s.timeframe, s.period, s.bars, state);
        }
        println!("{}", "=".repeat(60));
        Ok::<(), anyhow::Error>(())
    })
}
