//! Named mediator pipelines with error recovery.

use std::sync::Arc;

use relaybus_core::{properties, Message};
use tracing::{debug, warn};

use super::error::MediationError;
use super::mediator::{run_chain, MediationContext, MediationFuture, Mediator};

/// Ordered list of mediators executed as a unit.
///
/// On a mediator failure the sequence hands the message to its
/// `error_sequence`, if one is configured, after stamping the error
/// properties on it. The error sequence's outcome becomes the outcome of
/// this sequence. If the error sequence is missing or fails too, the
/// original error propagates.
pub struct MediationSequence {
    name: String,
    mediators: Vec<Arc<dyn Mediator>>,
    error_sequence: Option<String>,
    is_in_sequence: bool,
    is_out_sequence: bool,
    is_template: bool,
    template_params: Vec<String>,
}

impl MediationSequence {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mediators: Vec::new(),
            error_sequence: None,
            is_in_sequence: false,
            is_out_sequence: false,
            is_template: false,
            template_params: Vec::new(),
        }
    }

    #[must_use]
    pub fn mediator(mut self, mediator: Arc<dyn Mediator>) -> Self {
        self.mediators.push(mediator);
        self
    }

    #[must_use]
    pub fn mediators(mut self, mediators: impl IntoIterator<Item = Arc<dyn Mediator>>) -> Self {
        self.mediators.extend(mediators);
        self
    }

    #[must_use]
    pub fn on_error(mut self, error_sequence: impl Into<String>) -> Self {
        self.error_sequence = Some(error_sequence.into());
        self
    }

    #[must_use]
    pub fn as_in_sequence(mut self) -> Self {
        self.is_in_sequence = true;
        self
    }

    #[must_use]
    pub fn as_out_sequence(mut self) -> Self {
        self.is_out_sequence = true;
        self
    }

    /// Marks the sequence as a template requiring `params` on invocation.
    #[must_use]
    pub fn as_template<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.is_template = true;
        self.template_params = params.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mediators.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mediators.is_empty()
    }

    #[must_use]
    pub fn error_sequence(&self) -> Option<&str> {
        self.error_sequence.as_deref()
    }

    #[must_use]
    pub fn is_in_sequence(&self) -> bool {
        self.is_in_sequence
    }

    #[must_use]
    pub fn is_out_sequence(&self) -> bool {
        self.is_out_sequence
    }

    #[must_use]
    pub fn is_template(&self) -> bool {
        self.is_template
    }

    #[must_use]
    pub fn template_params(&self) -> &[String] {
        &self.template_params
    }

    /// Runs the mediators in order against `message`.
    ///
    /// Stops after the first mediator that sets `STOP_FLOW`; the partially
    /// mediated message is a successful result.
    pub fn apply<'a>(
        &'a self,
        message: &'a mut Message,
        ctx: &'a MediationContext,
    ) -> MediationFuture<'a> {
        Box::pin(async move {
            debug!(sequence = %self.name, message_id = %message.id, "applying sequence");
            match run_chain(&self.mediators, message, ctx).await {
                Ok(()) => Ok(()),
                Err(error) => self.recover(error, message, ctx).await,
            }
        })
    }

    async fn recover(
        &self,
        error: MediationError,
        message: &mut Message,
        ctx: &MediationContext,
    ) -> Result<(), MediationError> {
        let context = format!("sequence {} failed", self.name);
        let Some(error_sequence) = self.error_sequence.as_deref() else {
            return Err(error.wrap(context));
        };

        stamp_error(message, &error, &self.name);
        let Some(handler) = ctx.registry().get_sequence(error_sequence) else {
            warn!(sequence = %self.name, error_sequence, "error sequence not found");
            return Err(error.wrap(context));
        };
        let nested = ctx.nested(error_sequence)?;
        match handler.apply(message, &nested).await {
            Ok(()) => {
                debug!(sequence = %self.name, error_sequence, "error recovered by error sequence");
                Ok(())
            }
            Err(handler_error) => {
                warn!(
                    sequence = %self.name,
                    error_sequence,
                    error = %handler_error,
                    "error sequence failed"
                );
                Err(error.wrap(context))
            }
        }
    }
}

impl std::fmt::Debug for MediationSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.mediators.iter().map(|m| m.name()).collect();
        f.debug_struct("MediationSequence")
            .field("name", &self.name)
            .field("mediators", &names)
            .field("error_sequence", &self.error_sequence)
            .field("is_template", &self.is_template)
            .finish_non_exhaustive()
    }
}

/// Sets `ERROR_MESSAGE`, `ERROR_DETAIL` and `ERROR_SEQUENCE` on `message`.
pub(crate) fn stamp_error(message: &mut Message, error: &MediationError, origin: &str) {
    message.set_property(properties::ERROR_MESSAGE, error.to_string());
    message.set_property(properties::ERROR_DETAIL, error.chain());
    message.set_property(properties::ERROR_SEQUENCE, origin);
}
