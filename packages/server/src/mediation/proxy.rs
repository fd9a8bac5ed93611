//! Proxy services: virtual endpoints binding sequences to a backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use relaybus_core::{properties, Message, Value};
use tracing::{debug, info, info_span, warn, Instrument};

use super::error::MediationError;
use super::mediator::MediationContext;
use super::sequence::stamp_error;
use crate::qos::manager::QosManager;
use crate::qos::throttling::ThrottleDecision;
use crate::traits::Endpoint;

/// Client id used for throttling when the message carries none.
pub const ANONYMOUS_CLIENT: &str = "anonymous";

/// QoS options of a proxy. Everything is off by default except circuit
/// breaking, which applies whenever a QoS manager is present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyQos {
    /// Breaker id; defaults to the target endpoint name.
    pub circuit_breaker_id: Option<String>,
    /// Throttling policy checked for every request.
    pub throttle_policy: Option<String>,
    /// Hand requests to reliable delivery instead of calling the endpoint.
    pub reliable: bool,
    /// Ordering group for reliable delivery.
    pub reliable_sequence: Option<String>,
    /// Name of the response cache consulted before calling the endpoint.
    pub response_cache: Option<String>,
}

/// A virtual service: in-sequence, QoS gate, endpoint call, out-sequence,
/// with a fault sequence catching any failure on the way.
pub struct ProxyService {
    name: String,
    target_endpoint: Option<String>,
    in_sequence: Option<String>,
    out_sequence: Option<String>,
    fault_sequence: Option<String>,
    parameters: HashMap<String, String>,
    qos: ProxyQos,
    started: AtomicBool,
}

impl ProxyService {
    /// Creates a stopped proxy.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target_endpoint: None,
            in_sequence: None,
            out_sequence: None,
            fault_sequence: None,
            parameters: HashMap::new(),
            qos: ProxyQos::default(),
            started: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn target(mut self, endpoint: impl Into<String>) -> Self {
        self.target_endpoint = Some(endpoint.into());
        self
    }

    #[must_use]
    pub fn in_sequence(mut self, sequence: impl Into<String>) -> Self {
        self.in_sequence = Some(sequence.into());
        self
    }

    #[must_use]
    pub fn out_sequence(mut self, sequence: impl Into<String>) -> Self {
        self.out_sequence = Some(sequence.into());
        self
    }

    #[must_use]
    pub fn fault_sequence(mut self, sequence: impl Into<String>) -> Self {
        self.fault_sequence = Some(sequence.into());
        self
    }

    #[must_use]
    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn circuit_breaker(mut self, id: impl Into<String>) -> Self {
        self.qos.circuit_breaker_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn throttle_policy(mut self, policy_id: impl Into<String>) -> Self {
        self.qos.throttle_policy = Some(policy_id.into());
        self
    }

    /// Routes requests through reliable delivery, ordered within `sequence`.
    #[must_use]
    pub fn reliable(mut self, sequence: Option<&str>) -> Self {
        self.qos.reliable = true;
        self.qos.reliable_sequence = sequence.map(str::to_string);
        self
    }

    #[must_use]
    pub fn response_cache(mut self, cache: impl Into<String>) -> Self {
        self.qos.response_cache = Some(cache.into());
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn target_endpoint(&self) -> Option<&str> {
        self.target_endpoint.as_deref()
    }

    #[must_use]
    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }

    #[must_use]
    pub fn qos(&self) -> &ProxyQos {
        &self.qos
    }

    pub fn start(&self) {
        if !self.started.swap(true, Ordering::AcqRel) {
            info!(proxy = %self.name, target = ?self.target_endpoint, "proxy service started");
        }
    }

    pub fn stop(&self) {
        if self.started.swap(false, Ordering::AcqRel) {
            info!(proxy = %self.name, "proxy service stopped");
        }
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Runs one request through the proxy and returns the response.
    ///
    /// # Errors
    ///
    /// `ProxyNotStarted` when stopped. Any other failure is handed to the
    /// fault sequence; if there is none, or it fails too, the original error
    /// is returned wrapped with the proxy name.
    pub async fn process_request(
        &self,
        message: Message,
        ctx: &MediationContext,
    ) -> Result<Message, MediationError> {
        if !self.is_started() {
            return Err(MediationError::ProxyNotStarted {
                name: self.name.clone(),
            });
        }

        let span = info_span!("proxy", proxy = %self.name, message_id = %message.id);
        async move {
            let mut message = message;
            match self.run(&mut message, ctx).await {
                Ok(response) => Ok(response),
                Err(error) => self.handle_fault(message, error, ctx).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        message: &mut Message,
        ctx: &MediationContext,
    ) -> Result<Message, MediationError> {
        if let Some(sequence) = &self.in_sequence {
            ctx.registry().apply_sequence(sequence, message, ctx).await?;
        }
        if message.is_flow_stopped() {
            debug!("in-sequence stopped the flow");
            return Ok(message.clone());
        }

        let qos = ctx.qos();
        if let Some(qos) = qos {
            self.throttle_gate(qos, message)?;
            if let Some(breaker) = self.breaker_id() {
                if qos.is_circuit_open(breaker) {
                    return Err(MediationError::CircuitOpen {
                        service_id: breaker.to_string(),
                    });
                }
            }
        }

        if self.qos.reliable {
            let qos = qos.ok_or_else(|| {
                MediationError::InvalidArgument(format!(
                    "proxy {} needs QoS for reliable delivery",
                    self.name
                ))
            })?;
            let message_id = qos
                .send_reliable(message.payload.clone(), self.qos.reliable_sequence.as_deref())
                .await?;
            debug!(reliable_message_id = %message_id, "handed to reliable delivery");
            message.set_property(properties::RELIABLE_MESSAGE_ID, message_id);
            return Ok(message.clone());
        }

        let endpoint = self.resolve_endpoint(ctx)?;
        let mut response = self.call_endpoint(endpoint.as_ref(), message, qos).await?;

        if let Some(sequence) = &self.out_sequence {
            ctx.registry().apply_sequence(sequence, &mut response, ctx).await?;
        }
        Ok(response)
    }

    fn throttle_gate(&self, qos: &QosManager, message: &Message) -> Result<(), MediationError> {
        let Some(policy_id) = &self.qos.throttle_policy else {
            return Ok(());
        };
        let client_id = message
            .property(properties::CLIENT_ID)
            .and_then(Value::as_str)
            .unwrap_or(ANONYMOUS_CLIENT);
        match qos.check_throttle(policy_id, client_id) {
            ThrottleDecision::Allowed => Ok(()),
            ThrottleDecision::Throttled { retry_after_ms } => Err(MediationError::Throttled {
                policy_id: policy_id.clone(),
                client_id: client_id.to_string(),
                retry_after_ms,
            }),
        }
    }

    fn breaker_id(&self) -> Option<&str> {
        self.qos
            .circuit_breaker_id
            .as_deref()
            .or(self.target_endpoint.as_deref())
    }

    fn resolve_endpoint(
        &self,
        ctx: &MediationContext,
    ) -> Result<Arc<dyn Endpoint>, MediationError> {
        let name = self
            .target_endpoint
            .as_deref()
            .ok_or_else(|| {
                MediationError::InvalidArgument(format!(
                    "proxy {} has no target endpoint",
                    self.name
                ))
            })?;
        let endpoint = ctx
            .registry()
            .get_endpoint(name)
            .ok_or_else(|| MediationError::EndpointNotFound {
                name: name.to_string(),
            })?;
        if !endpoint.is_available() {
            return Err(MediationError::TransportUnavailable {
                endpoint: name.to_string(),
            });
        }
        Ok(endpoint)
    }

    /// Calls the endpoint, consulting and filling the response cache and
    /// recording the outcome on the circuit breaker.
    async fn call_endpoint(
        &self,
        endpoint: &dyn Endpoint,
        message: &Message,
        qos: Option<&Arc<QosManager>>,
    ) -> Result<Message, MediationError> {
        let cache = qos
            .zip(self.qos.response_cache.as_deref())
            .map(|(qos, name)| qos.response_cache(name));
        let cache_key = cache.as_ref().map(|_| response_cache_key(&self.name, message));

        if let (Some(cache), Some(key)) = (&cache, &cache_key) {
            if let Some(mut cached) = cache.get(key) {
                debug!(endpoint = endpoint.name(), "response served from cache");
                cached.set_property(properties::CACHE_HIT, true);
                return Ok(cached);
            }
        }

        let breaker = self.breaker_id();
        match endpoint.send(message).await {
            Ok(response) => {
                if let (Some(qos), Some(breaker)) = (qos, breaker) {
                    qos.record_success(breaker);
                }
                if let (Some(cache), Some(key)) = (&cache, cache_key) {
                    cache.put(key, response.clone());
                }
                Ok(response)
            }
            Err(source) => {
                if let (Some(qos), Some(breaker)) = (qos, breaker) {
                    qos.record_failure(breaker);
                }
                warn!(
                    endpoint = endpoint.name(),
                    url = endpoint.url(),
                    error = %source,
                    "endpoint call failed"
                );
                Err(MediationError::EndpointFailed {
                    endpoint: endpoint.name().to_string(),
                    source,
                })
            }
        }
    }

    async fn handle_fault(
        &self,
        mut message: Message,
        error: MediationError,
        ctx: &MediationContext,
    ) -> Result<Message, MediationError> {
        let context = format!("proxy {} failed", self.name);
        let Some(fault_sequence) = self.fault_sequence.as_deref() else {
            return Err(error.wrap(context));
        };

        stamp_error(&mut message, &error, &self.name);
        let Some(handler) = ctx.registry().get_sequence(fault_sequence) else {
            return Err(error.wrap(context));
        };
        match handler.apply(&mut message, ctx).await {
            Ok(()) => {
                debug!(fault_sequence, error = %error, "fault handled by fault sequence");
                Ok(message)
            }
            Err(fault_error) => {
                warn!(fault_sequence, error = %fault_error, "fault sequence failed");
                Err(error.wrap(context))
            }
        }
    }
}

/// Cache key for a proxy response: hash of the proxy name and request payload.
#[must_use]
pub fn response_cache_key(proxy: &str, message: &Message) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(proxy.as_bytes());
    hasher.update(&[0]);
    hasher.update(&message.payload);
    hasher.finalize().to_hex().to_string()
}

impl std::fmt::Debug for ProxyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyService")
            .field("name", &self.name)
            .field("target_endpoint", &self.target_endpoint)
            .field("in_sequence", &self.in_sequence)
            .field("out_sequence", &self.out_sequence)
            .field("fault_sequence", &self.fault_sequence)
            .field("qos", &self.qos)
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
