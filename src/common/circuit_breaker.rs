//! Circuit breaker in front of the exchange
//!
//! States:
//! - Closed: requests pass through
//! - Open: the exchange keeps failing, requests are rejected without I/O
//! - HalfOpen: cool-down elapsed, probe requests decide whether to close
//!
//! Only transient failures (network, rate limit, exchange busy) should be
//! recorded; a rejected order says nothing about exchange health.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures that open the circuit
    pub failure_threshold: u32,
    /// Consecutive probe successes that close it again
    pub success_threshold: u32,
    pub cool_down: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            cool_down: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    pub fn with_cool_down(mut self, cool_down: Duration) -> Self {
        self.cool_down = cool_down;
        self
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            opened_at: None,
            config,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a request may go out at `now`. An open circuit whose cool-down
    /// has elapsed moves to HalfOpen and lets the probe through.
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = self
                    .opened_at
                    .map_or(true, |at| now.saturating_duration_since(at) >= self.config.cool_down);
                if cooled {
                    tracing::info!("Circuit breaker half-open, probing exchange");
                    self.state = CircuitState::HalfOpen;
                    self.successes = 0;
                }
                cooled
            }
        }
    }

    /// Time left before an open circuit admits a probe
    pub fn remaining_cool_down(&self, now: Instant) -> Duration {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(at)) => self
                .config
                .cool_down
                .saturating_sub(now.saturating_duration_since(at)),
            _ => Duration::ZERO,
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => self.failures = 0,
            CircuitState::HalfOpen => {
                self.successes += 1;
                if self.successes >= self.config.success_threshold {
                    tracing::info!("Circuit breaker closed, exchange recovered");
                    self.state = CircuitState::Closed;
                    self.failures = 0;
                    self.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        match self.state {
            CircuitState::Closed => {
                self.failures += 1;
                if self.failures >= self.config.failure_threshold {
                    tracing::warn!(failures = self.failures, "Circuit breaker opened");
                    self.trip(now);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!("Probe failed, circuit breaker re-opened");
                self.trip(now);
            }
            CircuitState::Open => self.opened_at = Some(now),
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.successes = 0;
    }
}
