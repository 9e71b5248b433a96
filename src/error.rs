//! Error types for exchange access and configuration
//!
//! Every gateway failure carries an [`ErrorKind`] so the retry policy is a
//! pure function of the kind rather than of message text.

use thiserror::Error;

/// Classification of an exchange failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network trouble, rate limit or exchange busy. Safe to retry.
    Transient,
    /// Not enough collateral for the requested order
    InsufficientFunds,
    /// The exchange refused the request (bad params, position mode, ...)
    Rejected,
    Unknown,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

/// Failure returned by an [`ExecutionGateway`](crate::gateway::ExecutionGateway)
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn insufficient_funds(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InsufficientFunds, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Rejected, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() || err.is_connect() || err.is_request() {
            ErrorKind::Transient
        } else if let Some(status) = err.status() {
            classify_http_status(status.as_u16())
        } else if err.is_decode() {
            ErrorKind::Unknown
        } else {
            ErrorKind::Transient
        };
        Self::new(kind, err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::unknown(format!("malformed response: {}", err))
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Maps an HTTP status to an error kind
pub fn classify_http_status(status: u16) -> ErrorKind {
    match status {
        429 | 408 => ErrorKind::Transient,
        500..=599 => ErrorKind::Transient,
        400..=499 => ErrorKind::Rejected,
        _ => ErrorKind::Unknown,
    }
}

/// Maps an OKX v5 `code`/`sCode` to an error kind
pub fn classify_okx_code(code: &str) -> ErrorKind {
    match code {
        // rate limit, system busy, service temporarily unavailable, timeout
        "50011" | "50061" | "50001" | "50004" | "50013" | "50026" => ErrorKind::Transient,
        // insufficient margin / balance
        "51008" | "51020" | "51127" | "51131" => ErrorKind::InsufficientFunds,
        c if c.starts_with("51") || c.starts_with("50") => ErrorKind::Rejected,
        _ => ErrorKind::Unknown,
    }
}

/// Validation failure for a loaded configuration
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be positive, got {value}")]
    NotPositive { field: &'static str, value: f64 },

    #[error("{field} must be within {min}..={max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("exit step {index} trigger {trigger} must exceed the previous trigger and its own stop offset {offset}")]
    InvalidStep {
        index: usize,
        trigger: f64,
        offset: f64,
    },

    #[error("manual alert threshold {manual} must be below auto close threshold {auto}")]
    AlertAboveAutoClose { manual: f64, auto: f64 },

    #[error("EMA fast period {fast} must be shorter than slow period {slow}")]
    EmaPeriods { fast: usize, slow: usize },
}
