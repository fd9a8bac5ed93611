//! Errors raised by the mediation pipeline.

/// Failure of a mediator, sequence, engine run or proxy request.
///
/// Each pipeline boundary (sequence, engine, proxy) wraps the error it
/// receives in [`MediationError::Wrapped`] with its own context, so a
/// failure surfacing from a proxy carries the full path it took.
#[derive(Debug, thiserror::Error)]
pub enum MediationError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("sequence not found: {name}")]
    SequenceNotFound { name: String },

    #[error("endpoint not found: {name}")]
    EndpointNotFound { name: String },

    #[error("transport unavailable for endpoint {endpoint}")]
    TransportUnavailable { endpoint: String },

    #[error("proxy service {name} is not started")]
    ProxyNotStarted { name: String },

    #[error("circuit open for service {service_id}")]
    CircuitOpen { service_id: String },

    #[error("request throttled by policy {policy_id} for client {client_id}")]
    Throttled {
        policy_id: String,
        client_id: String,
        /// Backoff after which a queued request is released.
        retry_after_ms: Option<u64>,
    },

    #[error("mediator {mediator} failed: {reason}")]
    MediatorFailed { mediator: String, reason: String },

    #[error("endpoint {endpoint} failed")]
    EndpointFailed {
        endpoint: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("bus is shutting down")]
    ShuttingDown,

    #[error("{context}")]
    Wrapped {
        context: String,
        #[source]
        source: Box<MediationError>,
    },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl MediationError {
    /// Shorthand for a mediator failure.
    pub fn mediator(mediator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MediatorFailed {
            mediator: mediator.into(),
            reason: reason.into(),
        }
    }

    /// Wraps `self` with another layer of context.
    #[must_use]
    pub fn wrap(self, context: impl Into<String>) -> Self {
        Self::Wrapped {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost non-wrapper error.
    #[must_use]
    pub fn root_cause(&self) -> &MediationError {
        let mut current = self;
        while let Self::Wrapped { source, .. } = current {
            current = source;
        }
        current
    }

    /// Number of wrapping layers around the root cause.
    #[must_use]
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self;
        while let Self::Wrapped { source, .. } = current {
            depth += 1;
            current = source;
        }
        depth
    }

    /// Full context chain, outermost first, joined with `": "`.
    #[must_use]
    pub fn chain(&self) -> String {
        let mut parts = Vec::new();
        let mut current = self;
        while let Self::Wrapped { context, source } = current {
            parts.push(context.clone());
            current = source;
        }
        parts.push(current.to_string());
        parts.join(": ")
    }
}
