//! Bootstrap object owning one bus instance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relaybus_core::{ClockSource, Message, SystemClock};
use tracing::{info, warn};

use crate::mediation::{MediationEngine, MediationError, MediationRegistry};
use crate::qos::reliable::EndpointDeliveryCallback;
use crate::qos::QosManager;
use crate::service::config::BusConfig;
use crate::service::registry::ServiceContext;
use crate::service::shutdown::{HealthState, ShutdownController};
use crate::traits::MessagePersistenceProvider;

/// One bus: the mediation registry and engine, the QoS modules, and the
/// shutdown controller they share.
///
/// Populate the registry, call [`start`](Self::start), route traffic through
/// [`mediate`](Self::mediate) or [`process`](Self::process), then call
/// [`shutdown`](Self::shutdown).
pub struct BusContext {
    config: Arc<BusConfig>,
    clock: Arc<dyn ClockSource>,
    registry: Arc<MediationRegistry>,
    qos: Arc<QosManager>,
    engine: MediationEngine,
    shutdown: Arc<ShutdownController>,
    started: AtomicBool,
}

/// Builder for [`BusContext`].
pub struct BusContextBuilder {
    config: BusConfig,
    clock: Option<Arc<dyn ClockSource>>,
    persistence: Option<Arc<dyn MessagePersistenceProvider>>,
}

impl BusContextBuilder {
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Persistence provider for reliable messaging. Only used when
    /// persistence is enabled in the config.
    #[must_use]
    pub fn persistence(mut self, provider: Arc<dyn MessagePersistenceProvider>) -> Self {
        self.persistence = Some(provider);
        self
    }

    /// Builds the bus. Nothing runs until [`BusContext::start`].
    ///
    /// # Errors
    ///
    /// Returns an error if the configured persistence store cannot be opened.
    pub fn build(self) -> anyhow::Result<BusContext> {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let persistence = match self.persistence {
            Some(provider) => Some(provider),
            None => default_persistence(&self.config)?,
        };

        let shutdown = Arc::new(ShutdownController::new());
        let registry = Arc::new(MediationRegistry::new());
        let qos = Arc::new(QosManager::new(&self.config, clock.clone(), persistence));
        let engine = MediationEngine::new(registry.clone(), shutdown.clone()).with_qos(qos.clone());

        Ok(BusContext {
            config: Arc::new(self.config),
            clock,
            registry,
            qos,
            engine,
            shutdown,
            started: AtomicBool::new(false),
        })
    }
}

#[cfg(feature = "redb")]
fn default_persistence(
    config: &BusConfig,
) -> anyhow::Result<Option<Arc<dyn MessagePersistenceProvider>>> {
    use anyhow::Context;

    match (&config.reliable.persistence_path, config.reliable.persistence_enabled) {
        (Some(path), true) => {
            let store = crate::qos::RedbPersistence::open(path)
                .with_context(|| format!("opening reliable message store {}", path.display()))?;
            Ok(Some(Arc::new(store)))
        }
        _ => Ok(None),
    }
}

#[cfg(not(feature = "redb"))]
fn default_persistence(
    config: &BusConfig,
) -> anyhow::Result<Option<Arc<dyn MessagePersistenceProvider>>> {
    if config.reliable.persistence_path.is_some() {
        warn!("persistence_path set but the redb feature is disabled; using in-memory persistence");
    }
    Ok(None)
}

impl BusContext {
    #[must_use]
    pub fn builder(config: BusConfig) -> BusContextBuilder {
        BusContextBuilder {
            config,
            clock: None,
            persistence: None,
        }
    }

    /// Builds a bus on the system clock.
    ///
    /// # Errors
    ///
    /// See [`BusContextBuilder::build`].
    pub fn new(config: BusConfig) -> anyhow::Result<Self> {
        Self::builder(config).build()
    }

    /// Initializes the QoS modules, starts every registered proxy service,
    /// and marks the bus ready. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first module initialization error.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let ctx = ServiceContext {
            config: self.config.clone(),
        };
        if let Err(error) = self.qos.init(&ctx).await {
            self.started.store(false, Ordering::Release);
            return Err(error);
        }
        for proxy in self.registry.proxies() {
            proxy.start();
        }
        self.shutdown.set_ready();
        info!(
            node_id = %self.config.node_id,
            proxies = self.registry.proxy_names().len(),
            "bus started"
        );
        Ok(())
    }

    /// Mediates `message` through the engine. See [`MediationEngine::mediate`].
    ///
    /// # Errors
    ///
    /// Any engine failure.
    pub async fn mediate(
        &self,
        message: Message,
        sequence_name: &str,
    ) -> Result<Message, MediationError> {
        self.engine.mediate(message, sequence_name).await
    }

    /// Sends `message` through the named proxy service.
    ///
    /// # Errors
    ///
    /// `ShuttingDown` once draining, `InvalidArgument` for an unknown proxy,
    /// otherwise whatever the proxy returns.
    pub async fn process(&self, proxy: &str, message: Message) -> Result<Message, MediationError> {
        let _guard = self.shutdown.try_enter().ok_or(MediationError::ShuttingDown)?;
        let service = self
            .registry
            .get_proxy(proxy)
            .ok_or_else(|| {
                MediationError::InvalidArgument(format!("unknown proxy service {proxy}"))
            })?;
        service.process_request(message, &self.engine.context()).await
    }

    /// Delivers reliable messages to the named endpoint, acknowledging each
    /// on a successful response.
    ///
    /// # Errors
    ///
    /// `EndpointNotFound` if the endpoint is not registered.
    pub fn route_reliable_to(&self, endpoint: &str) -> Result<(), MediationError> {
        let target = self
            .registry
            .get_endpoint(endpoint)
            .ok_or_else(|| MediationError::EndpointNotFound {
                name: endpoint.to_string(),
            })?;
        let reliable = self.qos.reliable();
        reliable.set_callback(Arc::new(EndpointDeliveryCallback::new(target, reliable)));
        Ok(())
    }

    /// Refuses new work, waits up to `shutdown_timeout_ms` for in-flight
    /// requests, stops the proxies and shuts the QoS modules down. Background
    /// work is aborted instead of joined when the drain timed out.
    ///
    /// # Errors
    ///
    /// Returns the first module shutdown error.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.shutdown.trigger_shutdown();
        let timeout = Duration::from_millis(self.config.shutdown_timeout_ms);
        let drained = self.shutdown.wait_for_drain(timeout).await;
        if !drained {
            warn!(
                in_flight = self.shutdown.in_flight_count(),
                timeout_ms = self.config.shutdown_timeout_ms,
                "drain timed out, terminating"
            );
        }
        for proxy in self.registry.proxies() {
            proxy.stop();
        }
        self.qos.shutdown(!drained).await?;
        self.started.store(false, Ordering::Release);
        info!(node_id = %self.config.node_id, "bus stopped");
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn ClockSource> {
        &self.clock
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<MediationRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn qos(&self) -> &Arc<QosManager> {
        &self.qos
    }

    #[must_use]
    pub fn engine(&self) -> &MediationEngine {
        &self.engine
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> &Arc<ShutdownController> {
        &self.shutdown
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        self.shutdown.health_state()
    }
}

impl std::fmt::Debug for BusContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusContext")
            .field("node_id", &self.config.node_id)
            .field("registry", &self.registry)
            .field("health", &self.health_state())
            .finish_non_exhaustive()
    }
}
