//! Per-route circuit breaker.
//!
//! Stops admitting traffic for a destination shard that keeps failing, so the
//! shard is not hammered and queues do not grow toward a known-bad route.
//!
//! # Circuit Breaker States
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                    CIRCUIT BREAKER STATE MACHINE                    │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │      ┌──────────┐ threshold ┌──────────┐ cooldown ┌──────────┐      │
//! │      │  CLOSED  │ ────────► │   OPEN   │ ───────► │HALF-OPEN │      │
//! │      │ (normal) │ failures  │ (reject) │ elapsed  │  (trial) │      │
//! │      └──────────┘ in window └──────────┘          └──────────┘      │
//! │            ▲                      ▲       failure       │           │
//! │            │                      └─────────────────────┤           │
//! │            └────────────────────────────────────────────┘           │
//! │                           success                                   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The breaker is owned by its route and mutated only under the route lock.
//! Every method takes `now` so timer behaviour is testable without sleeping.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::domain::{CircuitState, ShardId};

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within `failure_window` that open the circuit
    pub failure_threshold: u32,
    /// Successes in half-open before closing
    pub success_threshold: u32,
    /// Time spent open before probing
    pub cooldown: Duration,
    /// Rolling window for counting failures
    pub failure_window: Duration,
    /// Disable to always allow traffic
    pub enabled: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            cooldown: Duration::from_secs(15),
            failure_window: Duration::from_secs(10),
            enabled: true,
        }
    }
}

/// Breaker statistics for monitoring
#[derive(Debug, Clone)]
pub struct CircuitStats {
    /// Current state
    pub state: CircuitState,
    /// Failures inside the rolling window
    pub window_failures: u32,
    /// Time since last state change
    pub time_in_state: Duration,
    /// Times the circuit has opened
    pub trips: u64,
    /// All failures ever recorded
    pub total_failures: u64,
}

/// Per-route circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    route: ShardId,
    config: CircuitBreakerConfig,
    state: CircuitState,
    failures: VecDeque<Instant>,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    last_transition: Instant,
    trips: u64,
    total_failures: u64,
}

impl CircuitBreaker {
    /// Closed breaker for `route`.
    pub fn new(route: ShardId, config: CircuitBreakerConfig) -> Self {
        Self {
            route,
            config,
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            half_open_successes: 0,
            opened_at: None,
            last_transition: Instant::now(),
            trips: 0,
            total_failures: 0,
        }
    }

    /// Whether traffic may pass; moves OPEN to HALF_OPEN once cooled down.
    pub fn should_allow(&mut self, now: Instant) -> bool {
        if !self.config.enabled {
            return true;
        }
        match self.poll(now) {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                debug!(
                    route = self.route,
                    remaining_ms = self.remaining_cooldown(now).as_millis() as u64,
                    "Circuit open, rejecting"
                );
                false
            }
        }
    }

    /// Advance timers without recording an outcome.
    pub fn poll(&mut self, now: Instant) -> CircuitState {
        if self.state == CircuitState::Open && self.remaining_cooldown(now).is_zero() {
            info!(route = self.route, "Circuit breaker transitioning to half-open");
            self.transition(CircuitState::HalfOpen, now);
        }
        self.state
    }

    /// Record a delivered batch.
    pub fn record_success(&mut self, now: Instant) {
        if !self.config.enabled {
            return;
        }
        match self.poll(now) {
            CircuitState::Closed => {
                // Consecutive-failure semantics: any success clears the window
                self.failures.clear();
            }
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.success_threshold {
                    info!(
                        route = self.route,
                        successes = self.half_open_successes,
                        "Circuit breaker closing after successful trial delivery"
                    );
                    self.transition(CircuitState::Closed, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed delivery.
    pub fn record_failure(&mut self, now: Instant) {
        self.total_failures += 1;
        if !self.config.enabled {
            return;
        }
        match self.poll(now) {
            CircuitState::Closed => {
                self.failures.push_back(now);
                self.prune(now);
                let count = self.failures.len() as u32;
                if count >= self.config.failure_threshold {
                    warn!(
                        route = self.route,
                        failures = count,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker opening due to failures"
                    );
                    self.open(now);
                } else {
                    debug!(
                        route = self.route,
                        failures = count,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker recorded failure"
                    );
                }
            }
            CircuitState::HalfOpen => {
                warn!(route = self.route, "Trial delivery failed, circuit re-opening");
                self.open(now);
            }
            CircuitState::Open => {
                // Late result of an attempt started before the circuit opened
                self.opened_at = Some(now);
            }
        }
    }

    /// Current state without advancing timers.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Statistics snapshot.
    pub fn stats(&self, now: Instant) -> CircuitStats {
        CircuitStats {
            state: self.state,
            window_failures: self
                .failures
                .iter()
                .filter(|&&t| now.saturating_duration_since(t) <= self.config.failure_window)
                .count() as u32,
            time_in_state: now.saturating_duration_since(self.last_transition),
            trips: self.trips,
            total_failures: self.total_failures,
        }
    }

    /// When the state last changed.
    pub fn last_transition(&self) -> Instant {
        self.last_transition
    }

    /// Force the breaker closed.
    pub fn reset(&mut self, now: Instant) {
        info!(route = self.route, "Circuit breaker manually reset");
        self.transition(CircuitState::Closed, now);
    }

    fn open(&mut self, now: Instant) {
        self.trips += 1;
        self.opened_at = Some(now);
        self.transition(CircuitState::Open, now);
    }

    fn transition(&mut self, to: CircuitState, now: Instant) {
        self.state = to;
        self.last_transition = now;
        self.half_open_successes = 0;
        if to != CircuitState::Open {
            self.opened_at = None;
        }
        if to == CircuitState::Closed {
            self.failures.clear();
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) > self.config.failure_window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn remaining_cooldown(&self, now: Instant) -> Duration {
        self.opened_at
            .map(|at| self.config.cooldown.saturating_sub(now.saturating_duration_since(at)))
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            1,
            CircuitBreakerConfig {
                failure_threshold: 3,
                success_threshold: 1,
                cooldown: Duration::from_millis(100),
                failure_window: Duration::from_secs(1),
                enabled: true,
            },
        )
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let mut cb = breaker();
        let t0 = Instant::now();
        cb.record_failure(t0);
        cb.record_failure(t0);
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(t0);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.should_allow(t0 + Duration::from_millis(99)));
        assert_eq!(cb.stats(t0).trips, 1);
    }

    #[test]
    fn test_failures_outside_window_do_not_count() {
        let mut cb = breaker();
        let t0 = Instant::now();
        cb.record_failure(t0);
        cb.record_failure(t0);
        cb.record_failure(t0 + Duration::from_millis(1_500));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let mut cb = breaker();
        let t0 = Instant::now();
        cb.record_failure(t0);
        cb.record_failure(t0);
        cb.record_success(t0);
        cb.record_failure(t0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_cooldown_then_closes_on_success() {
        let mut cb = breaker();
        let t0 = Instant::now();
        for _ in 0..3 {
            cb.record_failure(t0);
        }
        let t1 = t0 + Duration::from_millis(100);
        assert!(cb.should_allow(t1));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success(t1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens_with_fresh_cooldown() {
        let mut cb = breaker();
        let t0 = Instant::now();
        for _ in 0..3 {
            cb.record_failure(t0);
        }
        let t1 = t0 + Duration::from_millis(150);
        assert_eq!(cb.poll(t1), CircuitState::HalfOpen);
        cb.record_failure(t1);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.should_allow(t1 + Duration::from_millis(99)));
        assert!(cb.should_allow(t1 + Duration::from_millis(100)));
        assert_eq!(cb.stats(t1).trips, 2);
    }

    #[test]
    fn test_disabled_always_allows() {
        let mut cb = CircuitBreaker::new(
            0,
            CircuitBreakerConfig {
                enabled: false,
                ..Default::default()
            },
        );
        let t0 = Instant::now();
        for _ in 0..100 {
            cb.record_failure(t0);
        }
        assert!(cb.should_allow(t0));
        assert_eq!(cb.stats(t0).total_failures, 100);
    }

    #[test]
    fn test_reset() {
        let mut cb = breaker();
        let t0 = Instant::now();
        for _ in 0..3 {
            cb.record_failure(t0);
        }
        cb.reset(t0);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.should_allow(t0));
    }
}
