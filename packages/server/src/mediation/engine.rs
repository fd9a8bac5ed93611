//! Entry point for inbound messages: global mediators, then a named sequence.

use std::sync::Arc;

use parking_lot::RwLock;
use relaybus_core::Message;
use tracing::{debug, info_span, Instrument};

use super::error::MediationError;
use super::mediator::{run_chain, MediationContext, Mediator};
use super::registry::MediationRegistry;
use crate::qos::manager::QosManager;
use crate::service::shutdown::ShutdownController;

/// Applies the global mediators and then a named sequence to each message.
///
/// Global mediators run for every message in registration order. Once a
/// message carries `STOP_FLOW`, the remaining global mediators and the named
/// sequence are skipped and the message is returned as is.
pub struct MediationEngine {
    registry: Arc<MediationRegistry>,
    qos: Option<Arc<QosManager>>,
    global_mediators: RwLock<Vec<Arc<dyn Mediator>>>,
    shutdown: Arc<ShutdownController>,
}

impl MediationEngine {
    #[must_use]
    pub fn new(registry: Arc<MediationRegistry>, shutdown: Arc<ShutdownController>) -> Self {
        Self {
            registry,
            qos: None,
            global_mediators: RwLock::new(Vec::new()),
            shutdown,
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

    /// Context handed to sequences run by this engine.
    #[must_use]
    pub fn context(&self) -> MediationContext {
        let ctx = MediationContext::new(self.registry.clone());
        match &self.qos {
            Some(qos) => ctx.with_qos(qos.clone()),
            None => ctx,
        }
    }

    pub fn add_global_mediator(&self, mediator: Arc<dyn Mediator>) {
        debug!(mediator = mediator.name(), "global mediator added");
        self.global_mediators.write().push(mediator);
    }

    /// Removes every global mediator named `name`. Returns whether any was removed.
    pub fn remove_global_mediator(&self, name: &str) -> bool {
        let mut mediators = self.global_mediators.write();
        let before = mediators.len();
        mediators.retain(|m| m.name() != name);
        before != mediators.len()
    }

    #[must_use]
    pub fn global_mediator_names(&self) -> Vec<String> {
        self.global_mediators
            .read()
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    /// Mediates `message` through the global mediators and `sequence_name`.
    ///
    /// An empty `sequence_name` runs the global mediators only.
    ///
    /// # Errors
    ///
    /// `ShuttingDown` once the bus drains. Otherwise any pipeline failure,
    /// including `SequenceNotFound` for an unknown name, wrapped with the
    /// sequence the engine was asked to run.
    pub async fn mediate(
        &self,
        message: Message,
        sequence_name: &str,
    ) -> Result<Message, MediationError> {
        let _guard = self.shutdown.try_enter().ok_or(MediationError::ShuttingDown)?;

        let span = info_span!("mediate", sequence = sequence_name, message_id = %message.id);
        async move {
            let mut message = message;
            self.run(&mut message, sequence_name)
                .await
                .map_err(|e| e.wrap(format!("engine failed for sequence {sequence_name}")))?;
            Ok(message)
        }
        .instrument(span)
        .await
    }

    async fn run(&self, message: &mut Message, sequence_name: &str) -> Result<(), MediationError> {
        let ctx = self.context();
        // Snapshot so the lock is not held across mediator awaits.
        let globals = self.global_mediators.read().clone();
        run_chain(&globals, message, &ctx).await?;

        if message.is_flow_stopped() {
            debug!("flow stopped by global mediators");
            return Ok(());
        }
        if sequence_name.is_empty() {
            return Ok(());
        }
        self.registry.apply_sequence(sequence_name, message, &ctx).await
    }
}

impl std::fmt::Debug for MediationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediationEngine")
            .field("global_mediators", &self.global_mediator_names())
            .field("qos", &self.qos.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use relaybus_core::{properties, Value};

    use super::*;
    use crate::mediation::mediators::{DropMediator, FnMediator, PropertyMediator};
    use crate::mediation::sequence::MediationSequence;

    fn engine() -> MediationEngine {
        MediationEngine::new(
            Arc::new(MediationRegistry::new()),
            Arc::new(ShutdownController::new()),
        )
    }

    fn append(tag: &'static str) -> Arc<dyn Mediator> {
        Arc::new(FnMediator::new(tag, move |m| {
            m.payload.extend_from_slice(tag.as_bytes());
            Ok(())
        }))
    }

    #[tokio::test]
    async fn globals_run_before_named_sequence() {
        let engine = engine();
        engine.add_global_mediator(append("g1"));
        engine.add_global_mediator(append("g2"));
        engine
            .registry()
            .register_sequence(MediationSequence::new("main").mediator(append("s")));

        let out = engine.mediate(Message::new(""), "main").await.unwrap();
        assert_eq!(out.payload, b"g1g2s".to_vec());
        assert_eq!(engine.global_mediator_names(), vec!["g1", "g2"]);
    }

    #[tokio::test]
    async fn empty_sequence_name_runs_globals_only() {
        let engine = engine();
        engine.add_global_mediator(Arc::new(PropertyMediator::set("tag", "seen", true)));
        let out = engine.mediate(Message::new("x"), "").await.unwrap();
        assert_eq!(out.property("seen"), Some(&Value::Bool(true)));
    }

    #[tokio::test]
    async fn stop_flow_skips_remaining_globals_and_sequence() {
        let engine = engine();
        engine.add_global_mediator(Arc::new(DropMediator::new("drop")));
        engine.add_global_mediator(append("late"));
        engine
            .registry()
            .register_sequence(MediationSequence::new("main").mediator(append("s")));

        let out = engine.mediate(Message::new(""), "main").await.unwrap();
        assert!(out.is_flow_stopped());
        assert!(out.payload.is_empty());
    }

    #[tokio::test]
    async fn unknown_sequence_is_wrapped_not_found() {
        let engine = engine();
        let err = engine.mediate(Message::new("x"), "ghost").await.unwrap_err();
        assert_eq!(err.to_string(), "engine failed for sequence ghost");
        assert!(matches!(
            err.root_cause(),
            MediationError::SequenceNotFound { name } if name == "ghost"
        ));
    }

    #[tokio::test]
    async fn global_failures_are_wrapped() {
        let engine = engine();
        engine.add_global_mediator(Arc::new(FnMediator::new("reject", |_| {
            Err(MediationError::mediator("reject", "no"))
        })));
        let err = engine.mediate(Message::new("x"), "").await.unwrap_err();
        assert_eq!(err.depth(), 1);
        assert!(matches!(err.root_cause(), MediationError::MediatorFailed { .. }));
    }

    #[tokio::test]
    async fn removing_global_mediators() {
        let engine = engine();
        engine.add_global_mediator(append("a"));
        engine.add_global_mediator(append("b"));
        assert!(engine.remove_global_mediator("a"));
        assert!(!engine.remove_global_mediator("a"));

        let out = engine.mediate(Message::new(""), "").await.unwrap();
        assert_eq!(out.payload, b"b".to_vec());
    }

    #[tokio::test]
    async fn draining_engine_refuses_work() {
        let shutdown = Arc::new(ShutdownController::new());
        let engine = MediationEngine::new(Arc::new(MediationRegistry::new()), shutdown.clone());
        shutdown.trigger_shutdown();

        let err = engine.mediate(Message::new("x"), "").await.unwrap_err();
        assert!(matches!(err, MediationError::ShuttingDown));
        assert_eq!(shutdown.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn error_properties_reach_error_sequence() {
        let engine = engine();
        let registry = engine.registry();
        registry.register_sequence(MediationSequence::new("errors").mediator(append("!")));
        registry.register_sequence(
            MediationSequence::new("main")
                .mediator(Arc::new(FnMediator::new("fail", |_| {
                    Err(MediationError::mediator("fail", "bad input"))
                })))
                .on_error("errors"),
        );

        let out = engine.mediate(Message::new("x"), "main").await.unwrap();
        assert_eq!(out.payload, b"x!".to_vec());
        assert_eq!(
            out.property(properties::ERROR_SEQUENCE).and_then(Value::as_str),
            Some("main")
        );
    }
}
