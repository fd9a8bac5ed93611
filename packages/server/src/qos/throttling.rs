//! Per-policy, per-client request throttling.
//!
//! Each [`ThrottlingPolicy`] owns a set of counters (one per client, or a
//! single shared counter for global policies). Every check increments the
//! counter and compares it against the policy limit. All counters are cleared
//! on a fixed cadence (`reset_interval_ms`, one minute by default), which
//! approximates a per-policy window without tracking individual timestamps.
//!
//! Rejected requests of queuing policies are pushed into a [`DelayQueue`] with
//! an exponential backoff; a consumer task releases them to subscribers once
//! the backoff has elapsed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use relaybus_core::ClockSource;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::delay_queue::{DelayQueue, ThrottledRequest};
use crate::service::registry::{ManagedService, ServiceContext};
use crate::service::worker::{BackgroundRunnable, BackgroundWorker, SweepTask};

/// Counter key shared by every client of a global policy.
const GLOBAL_COUNTER_KEY: &str = "*";
/// Largest exponent applied to the backoff base.
const MAX_BACKOFF_EXPONENT: u64 = 10;

// ---------------------------------------------------------------------------
// Policy and configuration
// ---------------------------------------------------------------------------

/// How a policy partitions its counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThrottlingType {
    /// One counter shared by all clients.
    Global,
    /// One counter per client.
    ClientBased,
    /// One counter per client; the limit is halved during peak hours.
    TimeBased,
}

/// A named rate limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottlingPolicy {
    pub id: String,
    #[serde(rename = "type")]
    pub policy_type: ThrottlingType,
    /// Requests allowed per counter window.
    pub limit: u64,
    /// Base of the exponential backoff for queued requests (ms).
    pub retry_after_ms: u64,
    /// Whether rejected requests are placed in the delay queue.
    #[serde(default)]
    pub queue_throttled_requests: bool,
}

impl ThrottlingPolicy {
    #[must_use]
    pub fn new(id: impl Into<String>, policy_type: ThrottlingType, limit: u64) -> Self {
        Self {
            id: id.into(),
            policy_type,
            limit,
            retry_after_ms: 1_000,
            queue_throttled_requests: false,
        }
    }

    /// Enables queuing of rejected requests with the given backoff base.
    #[must_use]
    pub fn queued(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = retry_after_ms;
        self.queue_throttled_requests = true;
        self
    }
}

/// Throttling module settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlingConfig {
    /// Cadence at which all counters are cleared (ms).
    pub reset_interval_ms: u64,
    /// Upper bound of the backoff delay (ms).
    pub max_backoff_ms: u64,
    /// First hour (inclusive) of the peak window for time-based policies.
    pub peak_start_hour: u32,
    /// Last hour (exclusive) of the peak window.
    pub peak_end_hour: u32,
    /// Offset applied to UTC when computing the hour of day.
    pub utc_offset_minutes: i32,
    /// Capacity of the released-request broadcast channel.
    pub release_channel_capacity: usize,
    /// Policies registered at construction.
    pub policies: Vec<ThrottlingPolicy>,
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            reset_interval_ms: 60_000,
            max_backoff_ms: 60_000,
            peak_start_hour: 9,
            peak_end_hour: 17,
            utc_offset_minutes: 0,
            release_channel_capacity: 1024,
            policies: Vec::new(),
        }
    }
}

/// Outcome of a throttling check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    Allowed,
    /// Over the limit. `retry_after_ms` is set when the request was queued.
    Throttled { retry_after_ms: Option<u64> },
}

impl ThrottleDecision {
    #[must_use]
    pub fn is_throttled(self) -> bool {
        matches!(self, Self::Throttled { .. })
    }
}

/// Backoff for a request `over_limit` requests past the limit.
#[must_use]
pub fn backoff_delay_ms(retry_after_ms: u64, over_limit: u64, max_backoff_ms: u64) -> u64 {
    let factor = 1_u64 << over_limit.min(MAX_BACKOFF_EXPONENT);
    retry_after_ms.saturating_mul(factor).min(max_backoff_ms)
}

// ---------------------------------------------------------------------------
// Policy state
// ---------------------------------------------------------------------------

/// Counters of one policy. Checks share the read lock; only inserting a new
/// client key or a bulk reset takes the write lock.
struct PolicyState {
    policy: ThrottlingPolicy,
    counters: RwLock<HashMap<String, AtomicU64>>,
}

impl PolicyState {
    fn new(policy: ThrottlingPolicy) -> Self {
        Self {
            policy,
            counters: RwLock::new(HashMap::new()),
        }
    }

    fn counter_key<'a>(&self, client_id: &'a str) -> &'a str {
        match self.policy.policy_type {
            ThrottlingType::Global => GLOBAL_COUNTER_KEY,
            ThrottlingType::ClientBased | ThrottlingType::TimeBased => client_id,
        }
    }

    /// Increments the counter for `key` and returns the new value.
    fn increment(&self, key: &str) -> u64 {
        {
            let counters = self.counters.read();
            if let Some(counter) = counters.get(key) {
                return counter.fetch_add(1, Ordering::AcqRel) + 1;
            }
        }
        let mut counters = self.counters.write();
        counters
            .entry(key.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::AcqRel)
            + 1
    }

    fn count(&self, key: &str) -> u64 {
        self.counters
            .read()
            .get(key)
            .map_or(0, |c| c.load(Ordering::Acquire))
    }

    fn reset(&self) {
        self.counters.write().clear();
    }
}

type PolicyMap = DashMap<String, Arc<PolicyState>>;

fn reset_all(policies: &PolicyMap) {
    for entry in policies.iter() {
        entry.value().reset();
    }
}

// ---------------------------------------------------------------------------
// Background work
// ---------------------------------------------------------------------------

/// Clears every counter on each tick.
struct CounterReset {
    policies: Arc<PolicyMap>,
}

#[async_trait]
impl BackgroundRunnable for CounterReset {
    type Task = SweepTask;

    async fn run(&mut self, _task: SweepTask) {
        reset_all(&self.policies);
    }

    async fn on_tick(&mut self) {
        debug!(policies = self.policies.len(), "resetting throttling counters");
        reset_all(&self.policies);
    }
}

/// Handle of the delay-queue consumer task.
struct ReleaseConsumer {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// ThrottlingModule
// ---------------------------------------------------------------------------

/// Rate limiting with backoff queuing.
pub struct ThrottlingModule {
    config: ThrottlingConfig,
    policies: Arc<PolicyMap>,
    queue: Arc<DelayQueue>,
    released_tx: broadcast::Sender<ThrottledRequest>,
    clock: Arc<dyn ClockSource>,
    reset_worker: Mutex<Option<BackgroundWorker<CounterReset>>>,
    consumer: Mutex<Option<ReleaseConsumer>>,
    shutdown_timeout: Mutex<Duration>,
}

impl ThrottlingModule {
    /// Creates the module and registers the configured policies.
    /// Background work starts in [`ManagedService::init`].
    #[must_use]
    pub fn new(config: ThrottlingConfig, clock: Arc<dyn ClockSource>) -> Self {
        let (released_tx, _) = broadcast::channel(config.release_channel_capacity.max(1));
        let module = Self {
            policies: Arc::new(DashMap::new()),
            queue: Arc::new(DelayQueue::new(clock.clone())),
            released_tx,
            clock,
            reset_worker: Mutex::new(None),
            consumer: Mutex::new(None),
            shutdown_timeout: Mutex::new(Duration::from_secs(5)),
            config,
        };
        for policy in module.config.policies.clone() {
            module.register_policy(policy);
        }
        module
    }

    /// Adds or replaces a policy. Replacing a policy drops its counters.
    pub fn register_policy(&self, policy: ThrottlingPolicy) {
        debug!(
            policy_id = %policy.id,
            ?policy.policy_type,
            limit = policy.limit,
            "registering throttling policy"
        );
        self.policies
            .insert(policy.id.clone(), Arc::new(PolicyState::new(policy)));
    }

    pub fn remove_policy(&self, policy_id: &str) -> Option<ThrottlingPolicy> {
        self.policies
            .remove(policy_id)
            .map(|(_, state)| state.policy.clone())
    }

    #[must_use]
    pub fn policy(&self, policy_id: &str) -> Option<ThrottlingPolicy> {
        self.policies.get(policy_id).map(|s| s.policy.clone())
    }

    /// Counts the request against the policy and reports whether it must be rejected.
    ///
    /// Unknown policies never throttle.
    pub fn should_throttle(&self, policy_id: &str, client_id: &str) -> bool {
        self.check(policy_id, client_id).is_throttled()
    }

    /// Like [`should_throttle`](Self::should_throttle), also reporting the
    /// backoff of queued rejections.
    pub fn check(&self, policy_id: &str, client_id: &str) -> ThrottleDecision {
        let Some(state) = self.policies.get(policy_id).map(|s| s.value().clone()) else {
            warn!(policy_id, "unknown throttling policy, request allowed");
            return ThrottleDecision::Allowed;
        };

        let count = state.increment(state.counter_key(client_id));
        let limit = self.effective_limit(&state.policy);
        if count <= limit {
            return ThrottleDecision::Allowed;
        }

        let over_limit = count - limit;
        metrics::counter!("relaybus_throttled_requests_total", "policy" => policy_id.to_string())
            .increment(1);

        if !state.policy.queue_throttled_requests {
            debug!(policy_id, client_id, count, limit, "request throttled");
            return ThrottleDecision::Throttled { retry_after_ms: None };
        }

        let delay = backoff_delay_ms(
            state.policy.retry_after_ms,
            over_limit,
            self.config.max_backoff_ms,
        );
        self.queue.push(policy_id, client_id, delay);
        debug!(
            policy_id,
            client_id,
            count,
            limit,
            delay_ms = delay,
            "request throttled and queued"
        );
        ThrottleDecision::Throttled {
            retry_after_ms: Some(delay),
        }
    }

    /// Limit in force right now, after the peak-hour adjustment.
    #[must_use]
    pub fn effective_limit(&self, policy: &ThrottlingPolicy) -> u64 {
        if policy.policy_type == ThrottlingType::TimeBased && self.is_peak_hour() {
            policy.limit / 2
        } else {
            policy.limit
        }
    }

    fn is_peak_hour(&self) -> bool {
        let hour = self.clock.hour_of_day(self.config.utc_offset_minutes);
        (self.config.peak_start_hour..self.config.peak_end_hour).contains(&hour)
    }

    /// Current counter value for a client under a policy.
    #[must_use]
    pub fn current_count(&self, policy_id: &str, client_id: &str) -> u64 {
        self.policies
            .get(policy_id)
            .map_or(0, |s| s.count(s.counter_key(client_id)))
    }

    /// Clears every counter of every policy.
    pub fn reset_counters(&self) {
        reset_all(&self.policies);
    }

    /// Number of rejected requests still waiting out their backoff.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Pops a queued request whose backoff has elapsed, without waiting.
    pub fn poll_released(&self) -> Option<ThrottledRequest> {
        self.queue.poll_expired()
    }

    /// Subscribes to requests released by the consumer task.
    #[must_use]
    pub fn subscribe_released(&self) -> broadcast::Receiver<ThrottledRequest> {
        self.released_tx.subscribe()
    }

    fn start_background(&self) {
        let mut reset_worker = self.reset_worker.lock();
        if reset_worker.is_none() {
            *reset_worker = Some(BackgroundWorker::start(
                "throttling-reset",
                CounterReset {
                    policies: self.policies.clone(),
                },
                self.config.reset_interval_ms,
            ));
        }

        let mut consumer = self.consumer.lock();
        if consumer.is_none() {
            let (stop_tx, mut stop_rx) = watch::channel(false);
            let queue = self.queue.clone();
            let released_tx = self.released_tx.clone();
            let handle = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        request = queue.take() => {
                            debug!(
                                policy_id = %request.policy_id,
                                client_id = %request.client_id,
                                "throttled request released"
                            );
                            // No subscribers is fine: release is advisory.
                            let _ = released_tx.send(request);
                        }
                        _ = stop_rx.changed() => break,
                    }
                }
            });
            *consumer = Some(ReleaseConsumer { stop_tx, handle });
        }
    }

    async fn stop_background(&self, terminate: bool) {
        let timeout = *self.shutdown_timeout.lock();

        let worker = self.reset_worker.lock().take();
        if let Some(mut worker) = worker {
            if terminate {
                worker.abort();
            } else {
                worker.stop_within(timeout).await;
            }
        }

        let consumer = self.consumer.lock().take();
        if let Some(ReleaseConsumer { stop_tx, mut handle }) = consumer {
            let _ = stop_tx.send(true);
            if terminate || tokio::time::timeout(timeout, &mut handle).await.is_err() {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl ManagedService for ThrottlingModule {
    fn name(&self) -> &'static str {
        "throttling"
    }

    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        *self.shutdown_timeout.lock() = Duration::from_millis(ctx.config.shutdown_timeout_ms);
        self.start_background();
        info!(
            policies = self.policies.len(),
            reset_interval_ms = self.config.reset_interval_ms,
            "throttling module started"
        );
        Ok(())
    }

    async fn reset(&self) -> anyhow::Result<()> {
        self.reset_counters();
        self.queue.clear();
        Ok(())
    }

    async fn shutdown(&self, terminate: bool) -> anyhow::Result<()> {
        self.stop_background(terminate).await;
        self.queue.clear();
        self.policies.clear();
        info!("throttling module stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use relaybus_core::{ManualClock, SystemClock};

    use super::*;
    use crate::service::config::BusConfig;

    const HOUR_MS: u64 = 3_600_000;

    /// Clock at 03:00 UTC, outside the peak window.
    fn off_peak_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(3 * HOUR_MS))
    }

    fn module_with(
        policies: Vec<ThrottlingPolicy>,
        clock: Arc<dyn ClockSource>,
    ) -> ThrottlingModule {
        ThrottlingModule::new(
            ThrottlingConfig {
                policies,
                ..ThrottlingConfig::default()
            },
            clock,
        )
    }

    #[test]
    fn allows_up_to_limit_then_throttles() {
        let module = module_with(
            vec![ThrottlingPolicy::new("api", ThrottlingType::ClientBased, 3)],
            off_peak_clock(),
        );
        for _ in 0..3 {
            assert!(!module.should_throttle("api", "alice"));
        }
        assert!(module.should_throttle("api", "alice"));
        assert_eq!(module.current_count("api", "alice"), 4);

        // Other clients have their own counters.
        assert!(!module.should_throttle("api", "bob"));
    }

    #[test]
    fn global_policy_shares_one_counter() {
        let module = module_with(
            vec![ThrottlingPolicy::new("all", ThrottlingType::Global, 2)],
            off_peak_clock(),
        );
        assert!(!module.should_throttle("all", "a"));
        assert!(!module.should_throttle("all", "b"));
        assert!(module.should_throttle("all", "c"));
        assert_eq!(module.current_count("all", "anyone"), 3);
    }

    #[test]
    fn time_based_limit_halved_during_peak_hours() {
        let clock = Arc::new(ManualClock::new(10 * HOUR_MS));
        let module = module_with(
            vec![ThrottlingPolicy::new("tb", ThrottlingType::TimeBased, 4)],
            clock.clone(),
        );
        assert!(!module.should_throttle("tb", "c"));
        assert!(!module.should_throttle("tb", "c"));
        assert!(module.should_throttle("tb", "c"));

        // 17:00 is outside the window again.
        module.reset_counters();
        clock.set(17 * HOUR_MS);
        for _ in 0..4 {
            assert!(!module.should_throttle("tb", "c"));
        }
        assert!(module.should_throttle("tb", "c"));
    }

    #[test]
    fn unknown_policy_never_throttles() {
        let module = module_with(Vec::new(), off_peak_clock());
        for _ in 0..100 {
            assert!(!module.should_throttle("missing", "c"));
        }
    }

    #[test]
    fn reset_clears_counters() {
        let module = module_with(
            vec![ThrottlingPolicy::new("api", ThrottlingType::ClientBased, 1)],
            off_peak_clock(),
        );
        assert!(!module.should_throttle("api", "c"));
        assert!(module.should_throttle("api", "c"));
        module.reset_counters();
        assert_eq!(module.current_count("api", "c"), 0);
        assert!(!module.should_throttle("api", "c"));
    }

    #[test]
    fn backoff_grows_exponentially_and_is_capped() {
        assert_eq!(backoff_delay_ms(100, 1, 60_000), 200);
        assert_eq!(backoff_delay_ms(100, 2, 60_000), 400);
        assert_eq!(backoff_delay_ms(100, 10, 60_000), 60_000);
        assert_eq!(backoff_delay_ms(10, 50, 60_000), 10_240);
        assert_eq!(backoff_delay_ms(u64::MAX, 3, 60_000), 60_000);
    }

    #[test]
    fn queued_policy_pushes_backoff_into_delay_queue() {
        let clock = off_peak_clock();
        let module = module_with(
            vec![ThrottlingPolicy::new("q", ThrottlingType::ClientBased, 1).queued(100)],
            clock.clone(),
        );
        assert_eq!(module.check("q", "c"), ThrottleDecision::Allowed);
        assert_eq!(
            module.check("q", "c"),
            ThrottleDecision::Throttled { retry_after_ms: Some(200) }
        );
        assert_eq!(
            module.check("q", "c"),
            ThrottleDecision::Throttled { retry_after_ms: Some(400) }
        );
        assert_eq!(module.queued_len(), 2);

        assert!(module.poll_released().is_none());
        clock.advance(Duration::from_millis(200));
        let first = module.poll_released().unwrap();
        assert_eq!(first.client_id, "c");
        assert_eq!(module.queued_len(), 1);
    }

    #[test]
    fn unqueued_policy_does_not_enqueue() {
        let module = module_with(
            vec![ThrottlingPolicy::new("p", ThrottlingType::ClientBased, 0)],
            off_peak_clock(),
        );
        assert_eq!(
            module.check("p", "c"),
            ThrottleDecision::Throttled { retry_after_ms: None }
        );
        assert_eq!(module.queued_len(), 0);
    }

    #[test]
    fn concurrent_checks_count_every_request() {
        let module = Arc::new(module_with(
            vec![ThrottlingPolicy::new("api", ThrottlingType::ClientBased, 1_000)],
            off_peak_clock(),
        ));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let module = module.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        module.should_throttle("api", "shared");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(module.current_count("api", "shared"), 800);
    }

    #[tokio::test]
    async fn consumer_releases_queued_requests_to_subscribers() {
        let module = ThrottlingModule::new(
            ThrottlingConfig {
                policies: vec![ThrottlingPolicy::new("q", ThrottlingType::Global, 0).queued(5)],
                peak_start_hour: 0,
                peak_end_hour: 0,
                ..ThrottlingConfig::default()
            },
            Arc::new(SystemClock),
        );
        let ctx = ServiceContext {
            config: Arc::new(BusConfig::default()),
        };
        module.init(&ctx).await.unwrap();
        let mut released = module.subscribe_released();

        assert!(module.should_throttle("q", "c1"));
        assert!(module.should_throttle("q", "c2"));

        let first = tokio::time::timeout(Duration::from_secs(2), released.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), released.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(first.expiration_ms <= second.expiration_ms);
        assert_eq!(first.client_id, "c1");

        module.shutdown(false).await.unwrap();
        assert!(module.policy("q").is_none());
    }

    #[tokio::test]
    async fn reset_worker_clears_counters_on_tick() {
        let module = ThrottlingModule::new(
            ThrottlingConfig {
                reset_interval_ms: 20,
                policies: vec![ThrottlingPolicy::new("api", ThrottlingType::ClientBased, 1)],
                ..ThrottlingConfig::default()
            },
            off_peak_clock(),
        );
        let ctx = ServiceContext {
            config: Arc::new(BusConfig::default()),
        };
        module.init(&ctx).await.unwrap();

        assert!(!module.should_throttle("api", "c"));
        assert!(module.should_throttle("api", "c"));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(module.current_count("api", "c"), 0);

        module.shutdown(false).await.unwrap();
    }
}
