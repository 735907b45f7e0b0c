//! Circuit breaker guarding the cap service.
//!
//! While open, cap checks skip the network entirely and fail open, so a dead
//! cap service costs the application nothing after the first few timeouts.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    #[serde(with = "crate::config::duration_ms", rename = "recovery_timeout_ms")]
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes needed to close again.
    pub success_threshold: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 1,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    /// Asks to send one request. In half-open state one trial at a time is
    /// let through. The returned permit reports the outcome; a permit
    /// dropped without an outcome (the request was cancelled) frees the
    /// trial slot so the next request can trial instead.
    pub fn try_acquire(&self) -> Option<CircuitPermit<'_>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed < self.config.recovery_timeout {
                    return None;
                }
                inner.state = CircuitState::HalfOpen;
                inner.successes = 0;
                inner.trial_in_flight = true;
                tracing::info!("cap service circuit half-open");
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return None;
                }
                inner.trial_in_flight = true;
                true
            }
        };
        Some(CircuitPermit {
            breaker: self,
            trial,
            resolved: false,
        })
    }

    fn release_trial(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state == CircuitState::HalfOpen && inner.trial_in_flight {
            inner.trial_in_flight = false;
            tracing::debug!("cap service trial abandoned; slot released");
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.opened_at = None;
                    tracing::info!("cap service circuit closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let trip = match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                inner.failures >= self.config.failure_threshold
            }
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if trip {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.trial_in_flight = false;
            inner.successes = 0;
            tracing::warn!(
                failures = inner.failures,
                retry_after_ms = self.config.recovery_timeout.as_millis() as u64,
                "cap service circuit opened"
            );
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.successes = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).failures
    }
}

/// Permission for one request through a [`CircuitBreaker`].
#[derive(Debug)]
#[must_use = "report the outcome with success() or failure()"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl CircuitPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.record_failure();
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.release_trial();
        }
    }
}
