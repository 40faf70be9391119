//! Circuit breaker guarding a remote storage provider.
//!
//! Tracks a rolling window of call outcomes; once at least
//! `minimum_throughput` samples have been observed and the failure
//! ratio over that window exceeds `failure_ratio`, the breaker opens and
//! short-circuits further calls for `break_duration`. While open, reads
//! degrade to warmer tiers only and writes enqueue a retry (if async
//! writes are enabled) instead of attempting the provider directly.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Configuration for a circuit breaker instance.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Fraction of failures (0.0-1.0) within the rolling window that
    /// trips the breaker open.
    pub failure_ratio: f64,
    /// Minimum number of samples in the window before `failure_ratio`
    /// is evaluated at all, avoiding a trip on a tiny, noisy sample.
    pub minimum_throughput: usize,
    /// How long the breaker stays open before allowing a probe call
    /// through (half-open).
    pub break_duration: Duration,
    /// Size of the rolling outcome window.
    pub window_size: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio: 0.5,
            minimum_throughput: 10,
            break_duration: Duration::from_secs(30),
            window_size: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: State,
    opened_at: Option<Instant>,
    outcomes: VecDeque<bool>,
}

/// A circuit breaker over provider calls.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

/// Whether a call may currently proceed against the guarded provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The circuit is closed (or half-open for a probe); proceed.
    Allowed,
    /// The circuit is open; short-circuit without calling the provider.
    Blocked,
}

impl CircuitBreaker {
    /// Construct a breaker in the closed state.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                opened_at: None,
                outcomes: VecDeque::with_capacity(config.window_size),
            }),
        }
    }

    /// Whether a call is currently admitted. A half-open breaker admits
    /// exactly one probe call at a time; callers that receive `Allowed`
    /// while half-open are expected to call [`Self::record`] promptly so
    /// the breaker can transition on the probe's outcome.
    pub fn admit(&self) -> Admission {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => Admission::Allowed,
            State::HalfOpen => Admission::Allowed,
            State::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.break_duration {
                    inner.state = State::HalfOpen;
                    Admission::Allowed
                } else {
                    Admission::Blocked
                }
            }
        }
    }

    /// Record the outcome of an admitted call.
    pub fn record(&self, success: bool) {
        let mut inner = self.inner.lock();

        if inner.state == State::HalfOpen {
            if success {
                inner.state = State::Closed;
                inner.outcomes.clear();
            } else {
                inner.state = State::Open;
                inner.opened_at = Some(Instant::now());
                inner.outcomes.clear();
            }
            return;
        }

        if inner.outcomes.len() == self.config.window_size {
            inner.outcomes.pop_front();
        }
        inner.outcomes.push_back(success);

        if inner.outcomes.len() >= self.config.minimum_throughput {
            let failures = inner.outcomes.iter().filter(|s| !**s).count();
            let ratio = failures as f64 / inner.outcomes.len() as f64;
            if ratio > self.config.failure_ratio {
                inner.state = State::Open;
                inner.opened_at = Some(Instant::now());
            }
        }
    }

    /// Whether the breaker is currently open (blocking calls outright,
    /// ignoring the half-open probe allowance).
    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == State::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_closed_below_minimum_throughput() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_ratio: 0.1,
            minimum_throughput: 10,
            ..Default::default()
        });
        for _ in 0..5 {
            breaker.record(false);
        }
        assert_eq!(breaker.admit(), Admission::Allowed);
    }

    #[test]
    fn opens_after_failure_ratio_exceeded() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_ratio: 0.5,
            minimum_throughput: 4,
            ..Default::default()
        });
        for _ in 0..4 {
            breaker.record(false);
        }
        assert_eq!(breaker.admit(), Admission::Blocked);
    }

    #[test]
    fn reopens_on_failed_half_open_probe() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_ratio: 0.1,
            minimum_throughput: 2,
            break_duration: Duration::from_millis(0),
            ..Default::default()
        });
        breaker.record(false);
        breaker.record(false);
        assert_eq!(breaker.admit(), Admission::Allowed); // half-open probe admitted
        breaker.record(false);
        assert_eq!(breaker.admit(), Admission::Blocked);
    }

    #[test]
    fn closes_on_successful_half_open_probe() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_ratio: 0.1,
            minimum_throughput: 2,
            break_duration: Duration::from_millis(0),
            ..Default::default()
        });
        breaker.record(false);
        breaker.record(false);
        assert_eq!(breaker.admit(), Admission::Allowed);
        breaker.record(true);
        assert!(!breaker.is_open());
    }
}
