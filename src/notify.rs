//! Operator notifications
//!
//! A [`Notifier`] delivers free-form HTML-ish text. The session talks to it
//! through [`Alerts`], which adds tag-based de-duplication so an event that
//! is re-detected every tick is only announced once.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::NotifierConfig;

pub const TELEGRAM_API_URL: &str = "https://api.telegram.org";

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str) -> Result<()>;
}

/// Writes messages to the log only (no chat configured)
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &str) -> Result<()> {
        tracing::info!(target: "notify", "{}", message);
        Ok(())
    }
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

/// Telegram Bot API `sendMessage` with HTML parse mode
#[derive(Clone)]
pub struct TelegramNotifier {
    http_client: Client,
    token: String,
    chat_id: String,
    base_url: String,
}

impl TelegramNotifier {
    pub fn new(token: impl Into<String>, chat_id: impl Into<String>) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http_client,
            token: token.into(),
            chat_id: chat_id.into(),
            base_url: TELEGRAM_API_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, message: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.token);
        let body = SendMessage {
            chat_id: &self.chat_id,
            text: message,
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };
        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Telegram request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Telegram returned {}: {}", status, text));
        }
        Ok(())
    }
}

/// Telegram when both token and chat id are configured, the log otherwise
pub fn from_config(config: &NotifierConfig) -> Result<Arc<dyn Notifier>> {
    match (&config.telegram_token, &config.telegram_chat_id) {
        (Some(token), Some(chat_id)) if !token.is_empty() && !chat_id.is_empty() => {
            Ok(Arc::new(TelegramNotifier::new(token.clone(), chat_id.clone())?))
        }
        _ => {
            tracing::warn!("Telegram not configured, notifications go to the log only");
            Ok(Arc::new(LogNotifier))
        }
    }
}

/// Best-effort notifications with once-per-tag de-duplication
pub struct Alerts {
    notifier: Arc<dyn Notifier>,
    sent: HashSet<String>,
}

impl Alerts {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            sent: HashSet::new(),
        }
    }

    /// Sends a message; delivery failures are logged, never propagated
    pub async fn notify(&self, message: &str) {
        if let Err(e) = self.notifier.send(message).await {
            tracing::warn!(error = %e, "Notification failed");
        }
    }

    /// Sends `message` only if `tag` has not been used since it was cleared.
    /// Returns whether the message went out.
    pub async fn send_once(&mut self, tag: &str, message: &str) -> bool {
        if !self.sent.insert(tag.to_string()) {
            return false;
        }
        self.notify(message).await;
        true
    }

    pub fn was_sent(&self, tag: &str) -> bool {
        self.sent.contains(tag)
    }

    /// Forgets every tag starting with `prefix`
    pub fn clear_prefix(&mut self, prefix: &str) {
        self.sent.retain(|tag| !tag.starts_with(prefix));
    }
}

/// `12,345.67` style formatting for quote amounts and prices
pub fn fmt_usd(value: f64) -> String {
    let negative = value < 0.0;
    let fixed = format!("{:.2}", value.abs());
    let (int_part, frac) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));
    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    format!("{}{}.{}", if negative { "-" } else { "" }, grouped, frac)
}
