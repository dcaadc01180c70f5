//! Circuit breaker for unreliable dependencies
//!
//! Trips open on consecutive failures or on a sliding-window failure rate,
//! probes through a half-open state after a recovery timeout, and backs the
//! timeout off exponentially when half-open probes keep failing.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Successes in half-open state required to close
    pub success_threshold: u32,

    /// Initial timeout before probing through half-open
    pub recovery_timeout: Duration,

    /// Multiplier applied to the recovery timeout on a half-open failure
    pub backoff_multiplier: f64,

    /// Number of recent calls tracked for the failure-rate window
    pub window_size: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            window_size: 20,
        }
    }
}

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are rejected
    Open,
    /// A limited number of probe calls pass through
    HalfOpen,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    /// true = failure, bounded by window_size
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    current_timeout: Duration,
}

/// Circuit breaker guarding calls to an external collaborator.
///
/// Counters live behind a synchronous mutex; the critical sections are a
/// handful of integer updates and never await.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let current_timeout = config.recovery_timeout;
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                window: VecDeque::new(),
                opened_at: None,
                current_timeout,
            }),
        }
    }

    /// Current state, advancing open -> half-open when the recovery
    /// timeout has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        inner.state
    }

    /// Whether a call may proceed right now.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        !matches!(inner.state, CircuitState::Open)
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        self.push_sample(&mut inner, false);
        inner.consecutive_failures = 0;

        if inner.state == CircuitState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.success_threshold {
                log::info!("Circuit closed after {} half-open successes", inner.half_open_successes);
                inner.state = CircuitState::Closed;
                inner.half_open_successes = 0;
                inner.current_timeout = self.config.recovery_timeout;
                inner.opened_at = None;
                inner.window.clear();
            }
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        self.push_sample(&mut inner, true);
        inner.consecutive_failures += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                // Probe failed: reopen with a longer timeout.
                let next = inner.current_timeout.as_secs_f64() * self.config.backoff_multiplier;
                inner.current_timeout = Duration::from_secs_f64(next);
                self.open(&mut inner);
            }
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold
                    || self.window_tripped(&inner)
                {
                    log::warn!(
                        "Circuit opened: {} consecutive failures",
                        inner.consecutive_failures
                    );
                    self.open(&mut inner);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn open(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.half_open_successes = 0;
    }

    fn advance(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= inner.current_timeout {
                    log::info!("Circuit half-open after {:?}", inner.current_timeout);
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                }
            }
        }
    }

    fn push_sample(&self, inner: &mut BreakerInner, failed: bool) {
        inner.window.push_back(failed);
        while inner.window.len() > self.config.window_size {
            inner.window.pop_front();
        }
    }

    /// Failure rate >= 50% over at least half a window of samples.
    fn window_tripped(&self, inner: &BreakerInner) -> bool {
        let samples = inner.window.len();
        if samples < self.config.window_size / 2 {
            return false;
        }
        let failures = inner.window.iter().filter(|&&f| f).count();
        failures * 2 >= samples
    }
}
