//! Quality-of-service control plane.
//!
//! - `circuit_breaker`: per-service failure isolation
//! - `throttling` / `delay_queue`: per-policy rate limiting with backoff
//! - `reliable` / `persistence`: acknowledged, ordered, dead-lettering delivery
//! - `cache`: TTL response caches with capacity eviction
//! - `manager`: facade used by proxy services

pub mod cache;
pub mod circuit_breaker;
pub mod delay_queue;
pub mod manager;
pub mod persistence;
pub mod reliable;
pub mod throttling;

pub use cache::{
    Cache, CacheConfig, CacheEntry, CacheManager, CacheManagerConfig, CacheStats, EvictionPolicy,
};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerModule, CircuitBreakerStats, CircuitState,
};
pub use delay_queue::{DelayQueue, ThrottledRequest};
pub use manager::{QosManager, ResponseCache};
pub use persistence::InMemoryPersistence;
#[cfg(feature = "redb")]
pub use persistence::RedbPersistence;
pub use reliable::{
    EndpointDeliveryCallback, MessageContext, ReliableMessagingConfig, ReliableMessagingModule,
};
pub use throttling::{
    ThrottleDecision, ThrottlingConfig, ThrottlingModule, ThrottlingPolicy, ThrottlingType,
};
