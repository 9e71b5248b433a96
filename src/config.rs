//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files with environment
//! variable support for API credentials. Every section has defaults, so a
//! config file only needs the values it wants to change.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::risk::RiskParameters;
use crate::{MarginMode, Symbol};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub exchange: ExchangeConfig,
    pub instrument: InstrumentConfig,
    pub trend: TrendConfig,
    pub entry: EntryConfig,
    pub initial_stop: InitialStopConfig,
    pub exits: ExitConfig,
    pub reversal: ReversalConfig,
    pub risk: RiskConfig,
    pub scale_in: ScaleInConfig,
    pub runtime: RuntimeConfig,
    pub notifier: NotifierConfig,
    pub stats: StatsConfig,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        config.apply_env();
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    /// Overrides secrets from the environment (`OKX_*`, `TELEGRAM_*`)
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("OKX_API_KEY") {
            self.exchange.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("OKX_SECRET") {
            self.exchange.api_secret = Some(v);
        }
        if let Ok(v) = std::env::var("OKX_PASSWORD") {
            self.exchange.passphrase = Some(v);
        }
        if let Ok(v) = std::env::var("TELEGRAM_TOKEN") {
            self.notifier.telegram_token = Some(v);
        }
        if let Ok(v) = std::env::var("TELEGRAM_CHAT_ID") {
            self.notifier.telegram_chat_id = Some(v);
        }
    }

    /// Rejects values the trading engine cannot operate with
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("instrument.leverage", self.instrument.leverage)?;
        in_range("risk.portfolio_fraction", self.risk.portfolio_fraction, 0.0, 1.0)?;
        if self.risk.portfolio_fraction == 0.0 {
            return Err(ConfigError::NotPositive {
                field: "risk.portfolio_fraction",
                value: 0.0,
            });
        }
        positive("risk.max_notional", self.risk.max_notional)?;
        if self.risk.margin_buffer < 0.0 {
            return Err(ConfigError::NotPositive {
                field: "risk.margin_buffer",
                value: self.risk.margin_buffer,
            });
        }
        if let Some(f) = self.risk.max_risk_fraction {
            in_range("risk.max_risk_fraction", f, 0.0, 1.0)?;
        }

        if self.trend.ema_fast >= self.trend.ema_slow {
            return Err(ConfigError::EmaPeriods {
                fast: self.trend.ema_fast,
                slow: self.trend.ema_slow,
            });
        }
        if self.entry.macd_fast >= self.entry.macd_slow {
            return Err(ConfigError::EmaPeriods {
                fast: self.entry.macd_fast,
                slow: self.entry.macd_slow,
            });
        }
        if let ZoneMode::Retracement {
            min_fraction,
            max_fraction,
            ..
        } = self.entry.zone
        {
            in_range("entry.zone.min_fraction", min_fraction, 0.0, 1.0)?;
            in_range("entry.zone.max_fraction", max_fraction, min_fraction, 1.0)?;
        }
        in_range("entry.tolerance_pct", self.entry.tolerance_pct, 0.0, 0.05)?;

        let mut previous_trigger = 0.0;
        for (index, step) in self.exits.steps.iter().enumerate() {
            if step.trigger <= previous_trigger || step.offset >= step.trigger {
                return Err(ConfigError::InvalidStep {
                    index: index + 1,
                    trigger: step.trigger,
                    offset: step.offset,
                });
            }
            previous_trigger = step.trigger;
        }
        if self.exits.manual_alert_points >= self.exits.auto_close_points {
            return Err(ConfigError::AlertAboveAutoClose {
                manual: self.exits.manual_alert_points,
                auto: self.exits.auto_close_points,
            });
        }
        if self.reversal.confirm_bars == 0 {
            return Err(ConfigError::NotPositive {
                field: "reversal.confirm_bars",
                value: 0.0,
            });
        }
        positive("runtime.tick_secs", self.runtime.tick_secs as f64)?;
        Ok(())
    }

    pub fn symbol(&self) -> Symbol {
        Symbol::new(self.instrument.symbol.clone())
    }

    pub fn risk_parameters(&self) -> RiskParameters {
        let params = RiskParameters::default()
            .with_leverage(self.instrument.leverage)
            .with_portfolio_fraction(self.risk.portfolio_fraction)
            .with_margin_buffer(self.risk.margin_buffer)
            .with_max_notional(self.risk.max_notional);
        match self.risk.max_risk_fraction {
            Some(f) => params.with_max_risk_fraction(f),
            None => params,
        }
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::NotPositive { field, value })
    }
}

fn in_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value >= min && value <= max {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

/// Exchange connection settings. Secrets are normally supplied through env.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    pub base_url: String,
    /// Sends `x-simulated-trading: 1` (OKX demo account)
    pub demo: bool,
    /// Requests per second
    pub rate_limit: u32,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            api_key: None,
            api_secret: None,
            passphrase: None,
            base_url: "https://www.okx.com".to_string(),
            demo: false,
            rate_limit: 10,
            timeout_secs: 10,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

/// Traded instrument and account mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    pub symbol: String,
    /// Higher timeframe driving direction (EMA fast/slow)
    pub htf: String,
    /// Lower timeframe driving zone touch and MACD confirmation
    pub ltf: String,
    pub leverage: f64,
    pub margin_mode: MarginMode,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        InstrumentConfig {
            symbol: "BTC-USDT-SWAP".to_string(),
            htf: "1h".to_string(),
            ltf: "5m".to_string(),
            leverage: 40.0,
            margin_mode: MarginMode::Isolated,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendConfig {
    pub ema_fast: usize,
    pub ema_slow: usize,
    /// Higher-timeframe bars fetched per observation
    pub lookback: usize,
}

impl Default for TrendConfig {
    fn default() -> Self {
        TrendConfig {
            ema_fast: 10,
            ema_slow: 50,
            lookback: 1000,
        }
    }
}

/// Which price band a pullback must touch before confirmation is awaited
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ZoneMode {
    /// Touch of the lower-timeframe EMA
    Ema { period: usize },
    /// Fibonacci-style retracement of the window's swing range
    Retracement {
        min_fraction: f64,
        max_fraction: f64,
        lookback: usize,
    },
}

impl Default for ZoneMode {
    fn default() -> Self {
        ZoneMode::Ema { period: 200 }
    }
}

/// Volume-profile stop anchor override
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PocConfig {
    pub bins: usize,
    /// Sub-zone of the swing range (fractions from the favourable extreme)
    /// where a POC replaces the swing level as the stop anchor
    pub min_fraction: f64,
    pub max_fraction: f64,
}

impl Default for PocConfig {
    fn default() -> Self {
        PocConfig {
            bins: 24,
            min_fraction: 0.5,
            max_fraction: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryConfig {
    /// Lower-timeframe bars fetched per observation
    pub lookback: usize,
    pub zone: ZoneMode,
    /// Symmetric tolerance around zone bounds, as a fraction of price
    pub tolerance_pct: f64,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    /// Also fire on a lower-timeframe CHOCH in the armed direction
    pub structure_confirmation: bool,
    pub structure_left: usize,
    pub structure_right: usize,
    /// Use the in-progress bar's high/low for the zone touch test
    pub intrabar_touch: bool,
}

impl Default for EntryConfig {
    fn default() -> Self {
        EntryConfig {
            lookback: 1500,
            zone: ZoneMode::default(),
            tolerance_pct: 0.0,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            structure_confirmation: false,
            structure_left: 2,
            structure_right: 2,
            intrabar_touch: false,
        }
    }
}

/// Initial (soft) stop placed right after the fill
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialStopConfig {
    pub swing_lookback: usize,
    pub swing_strength: usize,
    pub extra_points: f64,
    pub max_points: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poc: Option<PocConfig>,
}

impl Default for InitialStopConfig {
    fn default() -> Self {
        InitialStopConfig {
            swing_lookback: 50,
            swing_strength: 2,
            extra_points: 200.0,
            max_points: 1234.0,
            poc: None,
        }
    }
}

/// One trailing step: once profit reaches `trigger` points the stop moves to
/// `entry + offset` (long) / `entry - offset` (short)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepRule {
    pub trigger: f64,
    pub offset: f64,
}

impl StepRule {
    pub fn new(trigger: f64, offset: f64) -> Self {
        Self { trigger, offset }
    }

    /// Steps with a positive offset lock in profit
    pub fn locks_profit(&self) -> bool {
        self.offset > 0.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    pub steps: Vec<StepRule>,
    pub manual_alert_points: f64,
    pub manual_alert_interval_secs: u64,
    pub auto_close_points: f64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        ExitConfig {
            steps: vec![
                StepRule::new(450.0, -200.0),
                StepRule::new(700.0, 300.0),
                StepRule::new(950.0, 750.0),
            ],
            manual_alert_points: 1300.0,
            manual_alert_interval_secs: 30,
            auto_close_points: 1400.0,
        }
    }
}

/// What to do when the higher timeframe turns against the held position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReversalAction {
    #[default]
    CloseNow,
    TightenStop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReversalConfig {
    pub action: ReversalAction,
    pub tighten_offset: f64,
    /// Consecutive new closed bars the opposite direction must persist
    pub confirm_bars: u32,
}

impl Default for ReversalConfig {
    fn default() -> Self {
        ReversalConfig {
            action: ReversalAction::CloseNow,
            tighten_offset: 100.0,
            confirm_bars: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub portfolio_fraction: f64,
    pub margin_buffer: f64,
    pub max_notional: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_risk_fraction: Option<f64>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        RiskConfig {
            portfolio_fraction: 0.8,
            margin_buffer: 5.0,
            max_notional: 100_000.0,
            max_risk_fraction: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleInConfig {
    pub enabled: bool,
    pub band_points: f64,
    pub stop_extra_points: f64,
}

impl Default for ScaleInConfig {
    fn default() -> Self {
        ScaleInConfig {
            enabled: true,
            band_points: 200.0,
            stop_extra_points: 100.0,
        }
    }
}

/// Loop timing, confirmation polling and state file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub tick_secs: u64,
    pub error_backoff_secs: u64,
    pub open_confirm_delay_ms: u64,
    pub open_poll_attempts: u32,
    pub close_confirm_delay_ms: u64,
    pub close_poll_attempts: u32,
    pub close_poll_interval_ms: u64,
    pub cancel_retries: u32,
    pub snapshot_interval_secs: u64,
    pub diagnostics_interval_secs: u64,
    pub state_file: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            tick_secs: 3,
            error_backoff_secs: 2,
            open_confirm_delay_ms: 600,
            open_poll_attempts: 3,
            close_confirm_delay_ms: 1000,
            close_poll_attempts: 10,
            close_poll_interval_ms: 500,
            cancel_retries: 3,
            snapshot_interval_secs: 30,
            diagnostics_interval_secs: 180,
            state_file: "session_state.json".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    /// Zero delays everywhere; used by tests driving the session directly
    pub fn immediate() -> Self {
        RuntimeConfig {
            open_confirm_delay_ms: 0,
            close_confirm_delay_ms: 0,
            close_poll_interval_ms: 0,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_chat_id: Option<String>,
}

/// Monthly statistics file and report schedule (server local time)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub file: String,
    pub report_day: u32,
    pub report_hour: u32,
    pub report_minute: u32,
    pub check_interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        StatsConfig {
            file: "trading_stats.json".to_string(),
            report_day: 25,
            report_hour: 0,
            report_minute: 5,
            check_interval_secs: 60,
        }
    }
}
