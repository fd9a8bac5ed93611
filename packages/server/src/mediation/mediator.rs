//! The `Mediator` trait and the runtime context handed to every mediator.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use relaybus_core::Message;

use super::error::MediationError;
use super::registry::MediationRegistry;
use crate::qos::manager::QosManager;

/// Nesting limit for sequence references and error sequences.
pub const MAX_NESTING_DEPTH: usize = 32;

/// Boxed future returned by recursive pipeline steps.
pub type MediationFuture<'a> =
    Pin<Box<dyn Future<Output = Result<(), MediationError>> + Send + 'a>>;

/// One transformation step of a pipeline.
///
/// Mediators are stateless across invocations: all per-request state lives
/// in the message. A mediator either transforms the message in place or
/// fails; setting `STOP_FLOW` on the message ends the enclosing pipeline
/// after the mediator returns.
#[async_trait]
pub trait Mediator: Send + Sync {
    /// Name used in logs and error context.
    fn name(&self) -> &str;

    async fn mediate(
        &self,
        message: &mut Message,
        ctx: &MediationContext,
    ) -> Result<(), MediationError>;

    /// Whether each invocation is logged at trace level.
    fn trace_enabled(&self) -> bool {
        false
    }

    /// Whether invocations are counted in metrics.
    fn statistics_enabled(&self) -> bool {
        false
    }
}

/// Runtime environment of one pipeline run.
///
/// Carries the registry used to resolve sequences and endpoints, the QoS
/// facade (absent for bare pipelines), and the current nesting depth.
#[derive(Clone)]
pub struct MediationContext {
    registry: Arc<MediationRegistry>,
    qos: Option<Arc<QosManager>>,
    depth: usize,
}

impl MediationContext {
    #[must_use]
    pub fn new(registry: Arc<MediationRegistry>) -> Self {
        Self {
            registry,
            qos: None,
            depth: 0,
        }
    }

    #[must_use]
    pub fn with_qos(mut self, qos: Arc<QosManager>) -> Self {
        self.qos = Some(qos);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<MediationRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn qos(&self) -> Option<&Arc<QosManager>> {
        self.qos.as_ref()
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Context for a nested sequence invocation.
    ///
    /// # Errors
    ///
    /// Fails once nesting exceeds [`MAX_NESTING_DEPTH`], which catches
    /// sequences that reference themselves.
    pub fn nested(&self, sequence: &str) -> Result<Self, MediationError> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(MediationError::InvalidArgument(format!(
                "sequence {sequence} exceeds nesting depth {MAX_NESTING_DEPTH}"
            )));
        }
        Ok(Self {
            registry: self.registry.clone(),
            qos: self.qos.clone(),
            depth: self.depth + 1,
        })
    }
}

impl std::fmt::Debug for MediationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediationContext")
            .field("depth", &self.depth)
            .field("qos", &self.qos.is_some())
            .finish_non_exhaustive()
    }
}

/// Runs `mediators` in order, stopping early once the message carries
/// `STOP_FLOW`. The failing mediator's error is returned as is.
///
/// # Errors
///
/// Returns the first mediator error.
pub async fn run_chain(
    mediators: &[Arc<dyn Mediator>],
    message: &mut Message,
    ctx: &MediationContext,
) -> Result<(), MediationError> {
    for mediator in mediators {
        if mediator.trace_enabled() {
            tracing::trace!(mediator = mediator.name(), message_id = %message.id, "mediating");
        }
        if mediator.statistics_enabled() {
            metrics::counter!(
                "relaybus_mediator_invocations_total",
                "mediator" => mediator.name().to_string()
            )
                .increment(1);
        }
        mediator.mediate(message, ctx).await?;
        if message.is_flow_stopped() {
            tracing::debug!(mediator = mediator.name(), message_id = %message.id, "flow stopped");
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesting_is_bounded() {
        let mut ctx = MediationContext::new(Arc::new(MediationRegistry::new()));
        for _ in 0..MAX_NESTING_DEPTH {
            ctx = ctx.nested("loop").unwrap();
        }
        assert_eq!(ctx.depth(), MAX_NESTING_DEPTH);
        assert!(matches!(
            ctx.nested("loop"),
            Err(MediationError::InvalidArgument(_))
        ));
    }
}
