//! Facade composing the QoS modules for the mediation layer.

use std::sync::Arc;

use relaybus_core::{ClockSource, Message};

use super::cache::{Cache, CacheManager};
use super::circuit_breaker::{CircuitBreakerModule, CircuitState};
use super::reliable::ReliableMessagingModule;
use super::throttling::{ThrottleDecision, ThrottlingModule};
use crate::service::config::BusConfig;
use crate::service::registry::{ServiceContext, ServiceRegistry};
use crate::traits::MessagePersistenceProvider;

/// Response caches store whole reply messages.
pub type ResponseCache = Cache<Message>;

/// Entry point to circuit breaking, throttling, reliable delivery and
/// response caching.
///
/// The modules are registered with a [`ServiceRegistry`] in that order, so
/// they start in that order and stop in reverse.
pub struct QosManager {
    circuit_breakers: Arc<CircuitBreakerModule>,
    throttling: Arc<ThrottlingModule>,
    reliable: Arc<ReliableMessagingModule>,
    caches: Arc<CacheManager<Message>>,
    registry: ServiceRegistry,
}

impl QosManager {
    /// Builds every module from `config`. Nothing runs until [`init`](Self::init).
    #[must_use]
    pub fn new(
        config: &BusConfig,
        clock: Arc<dyn ClockSource>,
        persistence: Option<Arc<dyn MessagePersistenceProvider>>,
    ) -> Self {
        let circuit_breakers = Arc::new(CircuitBreakerModule::new(
            config.circuit_breaker.clone(),
            clock.clone(),
        ));
        let throttling = Arc::new(ThrottlingModule::new(config.throttling.clone(), clock.clone()));
        let reliable =
            ReliableMessagingModule::new(config.reliable.clone(), clock.clone(), persistence);
        let caches = CacheManager::new(config.cache.clone(), clock);

        let registry = ServiceRegistry::new();
        registry.register(circuit_breakers.clone());
        registry.register(throttling.clone());
        registry.register(reliable.clone());
        registry.register(caches.clone());

        Self {
            circuit_breakers,
            throttling,
            reliable,
            caches,
            registry,
        }
    }

    /// Starts every module in registration order.
    ///
    /// # Errors
    ///
    /// Returns the first module initialization error.
    pub async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        self.registry.init_all(ctx).await
    }

    /// Stops every module in reverse registration order.
    ///
    /// # Errors
    ///
    /// Returns the first module shutdown error.
    pub async fn shutdown(&self, terminate: bool) -> anyhow::Result<()> {
        self.registry.shutdown_all(terminate).await
    }

    #[must_use]
    pub fn is_circuit_open(&self, service_id: &str) -> bool {
        self.circuit_breakers.is_open(service_id)
    }

    #[must_use]
    pub fn circuit_state(&self, service_id: &str) -> CircuitState {
        self.circuit_breakers.state(service_id)
    }

    pub fn record_success(&self, service_id: &str) {
        self.circuit_breakers.record_success(service_id);
    }

    pub fn record_failure(&self, service_id: &str) {
        self.circuit_breakers.record_failure(service_id);
    }

    pub fn should_throttle(&self, policy_id: &str, client_id: &str) -> bool {
        self.throttling.should_throttle(policy_id, client_id)
    }

    pub fn check_throttle(&self, policy_id: &str, client_id: &str) -> ThrottleDecision {
        self.throttling.check(policy_id, client_id)
    }

    /// Hands a payload to reliable delivery and returns its message id.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be persisted.
    pub async fn send_reliable(
        &self,
        payload: Vec<u8>,
        sequence_id: Option<&str>,
    ) -> anyhow::Result<String> {
        self.reliable.send_message(payload, sequence_id).await
    }

    pub async fn acknowledge(&self, message_id: &str) -> bool {
        self.reliable.acknowledge_message(message_id).await
    }

    /// The named response cache, created with default settings if needed.
    #[must_use]
    pub fn response_cache(&self, name: &str) -> Arc<ResponseCache> {
        self.caches.get_or_create_cache(name)
    }

    #[must_use]
    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerModule> {
        &self.circuit_breakers
    }

    #[must_use]
    pub fn throttling(&self) -> &Arc<ThrottlingModule> {
        &self.throttling
    }

    #[must_use]
    pub fn reliable(&self) -> &Arc<ReliableMessagingModule> {
        &self.reliable
    }

    #[must_use]
    pub fn caches(&self) -> &Arc<CacheManager<Message>> {
        &self.caches
    }

    #[must_use]
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use relaybus_core::ManualClock;

    use super::*;
    use crate::qos::circuit_breaker::CircuitBreakerConfig;
    use crate::qos::throttling::{ThrottlingPolicy, ThrottlingType};

    fn manager() -> (QosManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let mut config = BusConfig::default();
        config.circuit_breaker = CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout_ms: 100,
            consecutive_success_threshold: 1,
        };
        config
            .throttling
            .policies
            .push(ThrottlingPolicy::new("p", ThrottlingType::ClientBased, 1));
        (QosManager::new(&config, clock.clone(), None), clock)
    }

    #[test]
    fn modules_register_in_startup_order() {
        let (qos, _) = manager();
        assert_eq!(
            qos.registry().names(),
            vec!["circuit-breaker", "throttling", "reliable-messaging", "cache"]
        );
        assert!(qos.registry().get_by_name("throttling").is_some());
    }

    #[test]
    fn circuit_and_throttle_delegate_to_modules() {
        let (qos, clock) = manager();
        qos.record_failure("svc");
        qos.record_failure("svc");
        assert!(qos.is_circuit_open("svc"));
        clock.advance(Duration::from_millis(100));
        assert_eq!(qos.circuit_state("svc"), CircuitState::HalfOpen);
        qos.record_success("svc");
        assert_eq!(qos.circuit_state("svc"), CircuitState::Closed);

        assert!(!qos.should_throttle("p", "c"));
        assert!(qos.should_throttle("p", "c"));
    }

    #[tokio::test]
    async fn reliable_and_cache_round_trip() {
        let (qos, _) = manager();
        let id = qos.send_reliable(b"x".to_vec(), None).await.unwrap();
        assert!(qos.acknowledge(&id).await);
        assert!(!qos.acknowledge(&id).await);

        let cache = qos.response_cache("responses");
        cache.put("k", Message::new("cached"));
        assert_eq!(
            qos.response_cache("responses").get("k").unwrap().payload,
            b"cached".to_vec()
        );
    }
}
