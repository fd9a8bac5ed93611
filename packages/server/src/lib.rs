//! `RelayBus` Server — mediation pipeline, QoS control plane, and lifecycle.

pub mod context;
pub mod mediation;
pub mod qos;
pub mod service;
pub mod traits;

pub use context::{BusContext, BusContextBuilder};
pub use mediation::{
    MediationContext, MediationEngine, MediationError, MediationRegistry, MediationSequence,
    Mediator, ProxyService, ServiceEndpoint,
};
pub use qos::QosManager;
pub use service::{BusConfig, HealthState, ShutdownController};
pub use traits::{Endpoint, MessageDeliveryCallback, MessagePersistenceProvider};
