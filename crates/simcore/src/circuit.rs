use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    pub threshold: u32,
    /// How long the breaker stays open before allowing a trial call.
    #[serde(with = "duration_secs")]
    pub reset_after: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            reset_after: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub config: CircuitBreakerConfig,
    pub failure_count: u32,
    pub state: CircuitState,
    pub opened_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            failure_count: 0,
            state: CircuitState::Closed,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    /// Moves an expired open breaker to half-open.
    fn refresh(&mut self, now: DateTime<Utc>) {
        if self.state != CircuitState::Open {
            return;
        }
        let Some(opened_at) = self.opened_at else {
            return;
        };
        let reset = chrono::Duration::from_std(self.config.reset_after)
            .unwrap_or(chrono::Duration::MAX);
        if now - opened_at >= reset {
            tracing::debug!("circuit breaker cooling period elapsed, entering half-open");
            self.state = CircuitState::HalfOpen;
            self.trial_in_flight = false;
        }
    }

    /// Current state, accounting for an elapsed reset timer.
    pub fn state_at(&mut self, now: DateTime<Utc>) -> CircuitState {
        self.refresh(now);
        self.state
    }

    /// Whether a call may go through right now. Half-open admits exactly one
    /// trial until its outcome is recorded.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        self.refresh(now);
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    false
                } else {
                    self.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            tracing::info!("circuit breaker closed after successful trial");
        }
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
        self.trial_in_flight = false;
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.refresh(now);
        self.failure_count += 1;
        match self.state {
            CircuitState::HalfOpen => self.open(now),
            CircuitState::Closed if self.failure_count >= self.config.threshold => self.open(now),
            CircuitState::Open => self.opened_at = Some(now),
            CircuitState::Closed => {}
        }
    }

    fn open(&mut self, now: DateTime<Utc>) {
        tracing::warn!(
            failures = self.failure_count,
            threshold = self.config.threshold,
            "circuit breaker opened"
        );
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// Breakers keyed by step name, shared across workflow instances.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_breaker<R>(
        &self,
        step: &str,
        config: CircuitBreakerConfig,
        f: impl FnOnce(&mut CircuitBreaker) -> R,
    ) -> R {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let breaker = breakers
            .entry(step.to_string())
            .or_insert_with(|| CircuitBreaker::new(config));
        breaker.config = config;
        f(breaker)
    }

    pub fn try_acquire(&self, step: &str, config: CircuitBreakerConfig, now: DateTime<Utc>) -> bool {
        self.with_breaker(step, config, |b| b.try_acquire(now))
    }

    /// Record a terminal outcome and return the resulting breaker.
    pub fn record(
        &self,
        step: &str,
        config: CircuitBreakerConfig,
        success: bool,
        now: DateTime<Utc>,
    ) -> CircuitBreaker {
        self.with_breaker(step, config, |b| {
            if success {
                b.record_success();
            } else {
                b.record_failure(now);
            }
            b.clone()
        })
    }

    pub fn state(&self, step: &str, now: DateTime<Utc>) -> Option<CircuitState> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers.get_mut(step).map(|b| b.state_at(now))
    }

    pub fn get(&self, step: &str) -> Option<CircuitBreaker> {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers.get(step).cloned()
    }
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
