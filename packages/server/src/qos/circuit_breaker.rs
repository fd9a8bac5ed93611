//! Per-service circuit breakers.
//!
//! A [`CircuitBreaker`] isolates a failing backend: after `failure_threshold`
//! failures it opens and callers fail fast, after `reset_timeout_ms` it lets
//! probes through (half-open), and after enough consecutive probe successes it
//! closes again. The open -> half-open decay is evaluated lazily whenever the
//! state is read, so no timer task is needed.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use relaybus_core::ClockSource;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::service::registry::{ManagedService, ServiceContext};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Thresholds for a circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures in the closed state before the circuit opens.
    pub failure_threshold: u32,
    /// Time the circuit stays open before allowing probes (ms).
    pub reset_timeout_ms: u64,
    /// Consecutive successful probes needed to close a half-open circuit.
    pub consecutive_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            consecutive_success_threshold: 2,
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Requests pass through; failures are counted.
    Closed,
    /// Requests fail fast until the reset timeout elapses.
    Open,
    /// Probe requests pass through; one failure reopens.
    HalfOpen,
}

impl CircuitState {
    /// Lowercase label used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time snapshot of a breaker, for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerStats {
    pub service_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub consecutive_success_count: u32,
    pub last_state_change_ms: u64,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    consecutive_success_count: u32,
    last_state_change_ms: u64,
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

/// Three-state failure isolation guard for one service.
///
/// All reads and writes go through a single mutex so that a transition and
/// its counter updates are atomic with respect to concurrent callers.
pub struct CircuitBreaker {
    service_id: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn ClockSource>,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed breaker for `service_id`.
    #[must_use]
    pub fn new(
        service_id: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        let now = clock.now();
        Self {
            service_id: service_id.into(),
            config,
            clock,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                consecutive_success_count: 0,
                last_state_change_ms: now,
            }),
        }
    }

    #[must_use]
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, applying the open -> half-open decay if it is due.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.decay(&mut inner);
        inner.state
    }

    /// Whether callers must fail fast.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.decay(&mut inner);
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.consecutive_success_count += 1;
                let threshold = self.config.consecutive_success_threshold.max(1);
                if inner.consecutive_success_count >= threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                debug!(service = %self.service_id, "success recorded while open, ignored");
            }
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        self.decay(&mut inner);
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold.max(1) {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open),
            CircuitState::Open => {}
        }
    }

    /// Forces the breaker back to closed with cleared counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed);
        }
        inner.failure_count = 0;
        inner.consecutive_success_count = 0;
    }

    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    #[must_use]
    pub fn consecutive_success_count(&self) -> u32 {
        self.inner.lock().consecutive_success_count
    }

    /// Snapshot of the breaker (decay applied).
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        self.decay(&mut inner);
        CircuitBreakerStats {
            service_id: self.service_id.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            consecutive_success_count: inner.consecutive_success_count,
            last_state_change_ms: inner.last_state_change_ms,
        }
    }

    fn decay(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open
            && self.clock.now().saturating_sub(inner.last_state_change_ms)
                >= self.config.reset_timeout_ms
        {
            self.transition(inner, CircuitState::HalfOpen);
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.last_state_change_ms = self.clock.now();
        match to {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => inner.consecutive_success_count = 0,
            CircuitState::Open => {}
        }

        if to == CircuitState::Open {
            warn!(service = %self.service_id, %from, %to, "circuit opened");
        } else {
            info!(service = %self.service_id, %from, %to, "circuit state changed");
        }
        metrics::counter!(
            "relaybus_circuit_transitions_total",
            "service" => self.service_id.clone(),
            "to" => to.as_str()
        )
        .increment(1);
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("service_id", &self.service_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// CircuitBreakerModule
// ---------------------------------------------------------------------------

/// Registry of per-service breakers, created lazily on first use.
pub struct CircuitBreakerModule {
    default_config: ArcSwap<CircuitBreakerConfig>,
    overrides: DashMap<String, CircuitBreakerConfig>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    clock: Arc<dyn ClockSource>,
}

impl CircuitBreakerModule {
    #[must_use]
    pub fn new(default_config: CircuitBreakerConfig, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            default_config: ArcSwap::from_pointee(default_config),
            overrides: DashMap::new(),
            breakers: DashMap::new(),
            clock,
        }
    }

    /// Returns the breaker for `service_id`, creating a closed one if needed.
    pub fn breaker(&self, service_id: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(service_id) {
            return existing.clone();
        }
        self.breakers
            .entry(service_id.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(service_id)
                    .map_or_else(
                        || CircuitBreakerConfig::clone(&self.default_config.load()),
                        |c| c.clone(),
                    );
                Arc::new(CircuitBreaker::new(service_id, config, self.clock.clone()))
            })
            .clone()
    }

    /// Thresholds used for services without an override. Existing breakers
    /// keep the thresholds they were created with.
    pub fn set_default_config(&self, config: CircuitBreakerConfig) {
        self.default_config.store(Arc::new(config));
    }

    /// Sets thresholds for one service, replacing any existing breaker.
    pub fn configure_service(&self, service_id: &str, config: CircuitBreakerConfig) {
        self.overrides.insert(service_id.to_string(), config);
        self.breakers.remove(service_id);
    }

    pub fn is_open(&self, service_id: &str) -> bool {
        self.breaker(service_id).is_open()
    }

    pub fn state(&self, service_id: &str) -> CircuitState {
        self.breaker(service_id).state()
    }

    pub fn record_success(&self, service_id: &str) {
        self.breaker(service_id).record_success();
    }

    pub fn record_failure(&self, service_id: &str) {
        self.breaker(service_id).record_failure();
    }

    /// Removes a service's breaker; the next use starts closed.
    pub fn remove(&self, service_id: &str) -> bool {
        self.breakers.remove(service_id).is_some()
    }

    /// Snapshots of all breakers, sorted by service id.
    #[must_use]
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.breakers.iter().map(|b| b.value().stats()).collect();
        stats.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        stats
    }
}

#[async_trait]
impl ManagedService for CircuitBreakerModule {
    fn name(&self) -> &'static str {
        "circuit-breaker"
    }

    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let defaults = self.default_config.load_full();
        info!(
            node_id = %ctx.config.node_id,
            config = ?defaults,
            overrides = self.overrides.len(),
            "circuit breaker module initialized"
        );
        Ok(())
    }

    async fn reset(&self) -> anyhow::Result<()> {
        self.breakers.clear();
        Ok(())
    }

    async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
        self.breakers.clear();
        self.overrides.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;
    use relaybus_core::ManualClock;

    use super::*;

    fn breaker(
        failure_threshold: u32,
        reset_timeout_ms: u64,
        consecutive_success_threshold: u32,
    ) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let config = CircuitBreakerConfig {
            failure_threshold,
            reset_timeout_ms,
            consecutive_success_threshold,
        };
        (CircuitBreaker::new("orders", config, clock.clone()), clock)
    }

    #[test]
    fn opens_after_failure_threshold() {
        let (cb, _clock) = breaker(3, 1_000, 2);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.is_open());
    }

    #[test]
    fn success_in_closed_resets_failures() {
        let (cb, _clock) = breaker(3, 1_000, 2);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn scenario_open_half_open_closed() {
        let (cb, clock) = breaker(3, 1_000, 2);
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_millis(999));
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_millis(2));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.is_open());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn single_failure_in_half_open_reopens() {
        let (cb, clock) = breaker(1, 500, 3);
        cb.record_failure();
        clock.advance(Duration::from_millis(500));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // Re-entering half-open starts the success count from zero.
        clock.advance(Duration::from_millis(500));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.consecutive_success_count(), 0);
    }

    #[test]
    fn reopened_circuit_waits_full_timeout_again() {
        let (cb, clock) = breaker(1, 1_000, 1);
        cb.record_failure();
        clock.advance(Duration::from_millis(1_000));
        cb.record_failure(); // half-open probe fails
        clock.advance(Duration::from_millis(500));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn reset_closes_and_clears() {
        let (cb, _clock) = breaker(1, 1_000, 1);
        cb.record_failure();
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn module_creates_breakers_lazily_with_overrides() {
        let clock = Arc::new(ManualClock::new(0));
        let module = CircuitBreakerModule::new(CircuitBreakerConfig::default(), clock);
        module.configure_service(
            "payments",
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            },
        );

        module.record_failure("payments");
        module.record_failure("inventory");

        assert!(module.is_open("payments"));
        assert!(!module.is_open("inventory"));

        let stats = module.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].service_id, "inventory");
        assert_eq!(stats[1].state, CircuitState::Open);
    }

    #[test]
    fn concurrent_failures_open_exactly_once() {
        let clock = Arc::new(ManualClock::new(0));
        let cb = Arc::new(CircuitBreaker::new(
            "shared",
            CircuitBreakerConfig {
                failure_threshold: 50,
                reset_timeout_ms: 60_000,
                consecutive_success_threshold: 1,
            },
            clock,
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cb = cb.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        cb.record_failure();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(cb.state(), CircuitState::Open);
        // Failures after opening are not counted further.
        assert_eq!(cb.failure_count(), 50);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Success,
        Failure,
        Advance(u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Success),
            Just(Op::Failure),
            (0_u64..2_000).prop_map(Op::Advance),
        ]
    }

    proptest! {
        #[test]
        fn counters_stay_within_thresholds(ops in proptest::collection::vec(op_strategy(), 0..64)) {
            let (cb, clock) = breaker(3, 1_000, 2);
            for op in ops {
                match op {
                    Op::Success => cb.record_success(),
                    Op::Failure => cb.record_failure(),
                    Op::Advance(ms) => clock.advance(Duration::from_millis(ms)),
                }
                let stats = cb.stats();
                match stats.state {
                    CircuitState::Closed => prop_assert!(stats.failure_count < 3),
                    CircuitState::HalfOpen => prop_assert!(stats.consecutive_success_count < 2),
                    CircuitState::Open => {}
                }
            }
        }
    }
}
