//! Monthly trading statistics
//!
//! Counts closes per trailing step, take-profit events and realized PnL for
//! the current calendar month, persisted as a human-readable JSON file. The
//! month rolls over lazily on the first event of a new month. A report is
//! rendered once per month on the configured day and time.
//!
//! Persistence failures are logged and never interrupt trading.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::StatsConfig;
use crate::notify::fmt_usd;
use crate::{Direction, TradeRecord};

/// Year-Month key, serialized as `YYYY-MM`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    pub fn of<D: Datelike>(date: &D) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn days(&self) -> u32 {
        let (next_year, next_month) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        NaiveDate::from_ymd_opt(next_year, next_month, 1)
            .and_then(|d| d.pred_opt())
            .map(|d| d.day())
            .unwrap_or(28)
    }

    pub fn name(&self) -> String {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .map(|d| d.format("%B %Y").to_string())
            .unwrap_or_else(|| self.to_string())
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (y, m) = s.split_once('-').ok_or_else(|| format!("bad month key: {}", s))?;
        let year = y.parse().map_err(|_| format!("bad year in {}", s))?;
        let month: u32 = m.parse().map_err(|_| format!("bad month in {}", s))?;
        if !(1..=12).contains(&month) {
            return Err(format!("month out of range in {}", s));
        }
        Ok(Self { year, month })
    }
}

impl From<YearMonth> for String {
    fn from(ym: YearMonth) -> String {
        ym.to_string()
    }
}

impl TryFrom<String> for YearMonth {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatsEntry {
    Close {
        time: DateTime<Utc>,
        side: Direction,
        entry: f64,
        exit: f64,
        size: f64,
        close_step: usize,
        pnl: f64,
        reason: String,
    },
    TpReached {
        time: DateTime<Utc>,
        step: usize,
        entry: f64,
        stop: f64,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonthlyStats {
    pub month: Option<YearMonth>,
    /// Closes keyed by the number of steps applied at close
    pub closes_by_step: BTreeMap<usize, u32>,
    /// Profitable closes on a profit-locking stop
    pub tp_close: u32,
    /// Profit-locking steps applied while holding
    pub tp_reached: u32,
    pub pnl_plus: f64,
    pub pnl_minus: f64,
    pub trades: Vec<StatsEntry>,
    pub last_report_month: Option<YearMonth>,
}

impl MonthlyStats {
    pub fn net_pnl(&self) -> f64 {
        self.pnl_plus + self.pnl_minus
    }

    pub fn closes(&self) -> u32 {
        self.closes_by_step.values().sum()
    }
}

/// Owns the statistics and their file
#[derive(Debug)]
pub struct StatsRecorder {
    path: PathBuf,
    stats: MonthlyStats,
}

impl StatsRecorder {
    /// Loads `path` if present; a missing or unreadable file starts empty
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let stats = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::error!(path = %path.display(), error = %e, "Stats file unreadable, starting fresh");
                MonthlyStats::default()
            }),
            Err(_) => MonthlyStats::default(),
        };
        Self { path, stats }
    }

    pub fn stats(&self) -> &MonthlyStats {
        &self.stats
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self) {
        if let Err(e) = self.try_save() {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to save stats");
        }
    }

    fn try_save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.stats)?;
        fs::write(&self.path, json).context("Failed to write stats file")?;
        Ok(())
    }

    /// Starts a fresh month if `now` is in a different one; keeps the
    /// last-reported marker
    pub fn ensure_month(&mut self, now: NaiveDateTime) {
        let current = YearMonth::of(&now);
        if self.stats.month != Some(current) {
            tracing::info!(month = %current, "Starting monthly stats");
            let last_report_month = self.stats.last_report_month;
            self.stats = MonthlyStats {
                month: Some(current),
                last_report_month,
                ..MonthlyStats::default()
            };
            self.save();
        }
    }

    /// Records a completed trade. `took_profit` marks a profitable close on
    /// a profit-locking stop.
    pub fn record_close(&mut self, trade: &TradeRecord, took_profit: bool, now: NaiveDateTime) {
        self.ensure_month(now);
        *self.stats.closes_by_step.entry(trade.close_step).or_insert(0) += 1;
        if trade.pnl >= 0.0 {
            self.stats.pnl_plus += trade.pnl;
        } else {
            self.stats.pnl_minus += trade.pnl;
        }
        if took_profit {
            self.stats.tp_close += 1;
        }
        self.stats.trades.push(StatsEntry::Close {
            time: trade.closed_at,
            side: trade.side,
            entry: trade.entry_price,
            exit: trade.exit_price,
            size: trade.size,
            close_step: trade.close_step,
            pnl: trade.pnl,
            reason: trade.reason.clone(),
        });
        self.save();
    }

    pub fn record_tp_reached(&mut self, step: usize, entry: f64, stop: f64, now: NaiveDateTime, at: DateTime<Utc>) {
        self.ensure_month(now);
        self.stats.tp_reached += 1;
        self.stats.trades.push(StatsEntry::TpReached {
            time: at,
            step,
            entry,
            stop,
        });
        self.save();
    }

    /// `true` at the configured minute of the report day (clamped to the
    /// month's length) unless this month was already reported
    pub fn report_due(&self, now: NaiveDateTime, cfg: &StatsConfig) -> bool {
        let current = YearMonth::of(&now);
        if self.stats.last_report_month == Some(current) {
            return false;
        }
        let day = cfg.report_day.clamp(1, current.days());
        now.day() == day && now.hour() == cfg.report_hour && now.minute() == cfg.report_minute
    }

    pub fn render_report(&mut self, now: NaiveDateTime, balance: f64, initial_balance: f64) -> String {
        self.ensure_month(now);
        let ms = &self.stats;
        let net = ms.net_pnl();
        let from_start = if initial_balance > 0.0 {
            balance - initial_balance
        } else {
            net
        };

        let mut out = format!("📊 <b>Monthly report - {}</b>\n", YearMonth::of(&now).name());
        let max_step = ms.closes_by_step.keys().copied().max().unwrap_or(0).max(3);
        for step in 0..=max_step {
            let count = ms.closes_by_step.get(&step).copied().unwrap_or(0);
            out.push_str(&format!("<b>Closed at SL{}:</b> <code>{}</code>\n", step, count));
        }
        out.push_str(&format!("<b>TP closes:</b> <code>{}</code>\n", ms.tp_close));
        out.push_str(&format!("<b>TP reached while holding:</b> <code>{}</code>\n", ms.tp_reached));
        out.push_str(&format!("<b>Positive PnL:</b> <code>{} USDT</code>\n", fmt_usd(ms.pnl_plus)));
        out.push_str(&format!("<b>Negative PnL:</b> <code>{} USDT</code>\n", fmt_usd(ms.pnl_minus)));
        out.push_str(&format!("<b>Net this month:</b> <code>{}{} USDT</code>\n", sign(net), fmt_usd(net)));
        out.push_str(&format!("<b>Balance:</b> <code>{} USDT</code>\n", fmt_usd(balance)));
        out.push_str(&format!(
            "<b>Since start:</b> <code>{}{} USDT</code>\n",
            sign(from_start),
            fmt_usd(from_start)
        ));
        out.push_str(&format!("<b>Time:</b> <code>{}</code>", now.format("%H:%M")));
        out
    }

    pub fn mark_reported(&mut self, now: NaiveDateTime) {
        self.stats.last_report_month = Some(YearMonth::of(&now));
        self.save();
    }

    /// Writes the month's closed trades as CSV; returns the row count
    pub fn export_trades_csv(&self, path: impl AsRef<Path>) -> Result<usize> {
        let mut writer = csv::Writer::from_path(path.as_ref())
            .with_context(|| format!("Failed to create {}", path.as_ref().display()))?;
        let mut rows = 0;
        for entry in &self.stats.trades {
            if let StatsEntry::Close {
                time,
                side,
                entry,
                exit,
                size,
                close_step,
                pnl,
                reason,
            } = entry
            {
                writer.serialize(TradeRow {
                    time: time.to_rfc3339(),
                    side: side.as_str(),
                    entry: *entry,
                    exit: *exit,
                    size: *size,
                    close_step: *close_step,
                    pnl: *pnl,
                    reason,
                })?;
                rows += 1;
            }
        }
        writer.flush()?;
        Ok(rows)
    }
}

#[derive(Serialize)]
struct TradeRow<'a> {
    time: String,
    side: &'static str,
    entry: f64,
    exit: f64,
    size: f64,
    close_step: usize,
    pnl: f64,
    reason: &'a str,
}

fn sign(value: f64) -> &'static str {
    if value >= 0.0 {
        "+"
    } else {
        ""
    }
}
