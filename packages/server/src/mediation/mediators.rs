//! Built-in mediators.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use relaybus_core::{Message, Value};
use tracing::{debug, info, trace, warn};

use super::error::MediationError;
use super::mediator::{run_chain, MediationContext, Mediator};

// ---------------------------------------------------------------------------
// LogMediator
// ---------------------------------------------------------------------------

/// Level at which [`LogMediator`] emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
}

impl std::str::FromStr for LogLevel {
    type Err = MediationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            other => Err(MediationError::InvalidArgument(format!(
                "unknown log level {other}"
            ))),
        }
    }
}

/// Logs the message id and selected properties.
pub struct LogMediator {
    name: String,
    level: LogLevel,
    properties: Vec<String>,
    include_payload: bool,
}

impl LogMediator {
    #[must_use]
    pub fn new(name: impl Into<String>, level: LogLevel) -> Self {
        Self {
            name: name.into(),
            level,
            properties: Vec::new(),
            include_payload: false,
        }
    }

    /// Adds a property to the logged fields.
    #[must_use]
    pub fn property(mut self, name: impl Into<String>) -> Self {
        self.properties.push(name.into());
        self
    }

    #[must_use]
    pub fn with_payload(mut self) -> Self {
        self.include_payload = true;
        self
    }
}

#[async_trait]
impl Mediator for LogMediator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn mediate(
        &self,
        message: &mut Message,
        _ctx: &MediationContext,
    ) -> Result<(), MediationError> {
        let selected: BTreeMap<&str, String> = self
            .properties
            .iter()
            .filter_map(|p| message.property(p).map(|v| (p.as_str(), v.to_string())))
            .collect();
        let payload = if self.include_payload {
            message.payload_text().into_owned()
        } else {
            String::new()
        };
        let id = message.id.as_str();
        let direction = message.direction;
        match self.level {
            LogLevel::Trace => trace!(
                mediator = %self.name,
                message_id = id,
                ?direction,
                properties = ?selected,
                %payload,
                "message"
            ),
            LogLevel::Debug => debug!(
                mediator = %self.name,
                message_id = id,
                ?direction,
                properties = ?selected,
                %payload,
                "message"
            ),
            LogLevel::Info => info!(
                mediator = %self.name,
                message_id = id,
                ?direction,
                properties = ?selected,
                %payload,
                "message"
            ),
            LogLevel::Warn => warn!(
                mediator = %self.name,
                message_id = id,
                ?direction,
                properties = ?selected,
                %payload,
                "message"
            ),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PropertyMediator / HeaderMediator
// ---------------------------------------------------------------------------

/// Sets or removes one message property.
pub struct PropertyMediator {
    name: String,
    property: String,
    value: Option<Value>,
}

impl PropertyMediator {
    #[must_use]
    pub fn set(
        name: impl Into<String>,
        property: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            name: name.into(),
            property: property.into(),
            value: Some(value.into()),
        }
    }

    #[must_use]
    pub fn remove(name: impl Into<String>, property: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            property: property.into(),
            value: None,
        }
    }
}

#[async_trait]
impl Mediator for PropertyMediator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn mediate(
        &self,
        message: &mut Message,
        _ctx: &MediationContext,
    ) -> Result<(), MediationError> {
        match &self.value {
            Some(value) => {
                message.set_property(self.property.clone(), value.clone());
            }
            None => {
                message.remove_property(&self.property);
            }
        }
        Ok(())
    }
}

/// Sets or removes one transport header.
pub struct HeaderMediator {
    name: String,
    header: String,
    value: Option<String>,
}

impl HeaderMediator {
    #[must_use]
    pub fn set(
        name: impl Into<String>,
        header: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            header: header.into(),
            value: Some(value.into()),
        }
    }

    #[must_use]
    pub fn remove(name: impl Into<String>, header: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            header: header.into(),
            value: None,
        }
    }
}

#[async_trait]
impl Mediator for HeaderMediator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn mediate(
        &self,
        message: &mut Message,
        _ctx: &MediationContext,
    ) -> Result<(), MediationError> {
        match &self.value {
            Some(value) => {
                message.headers.insert(self.header.clone(), value.clone());
            }
            None => {
                message.headers.remove(&self.header);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DropMediator
// ---------------------------------------------------------------------------

/// Ends the current pipeline by setting `STOP_FLOW`.
pub struct DropMediator {
    name: String,
}

impl DropMediator {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Mediator for DropMediator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn mediate(
        &self,
        message: &mut Message,
        _ctx: &MediationContext,
    ) -> Result<(), MediationError> {
        debug!(mediator = %self.name, message_id = %message.id, "message dropped");
        message.stop_flow();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FilterMediator
// ---------------------------------------------------------------------------

type Predicate = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Routes the message through one of two mediator lists based on a predicate.
pub struct FilterMediator {
    name: String,
    predicate: Predicate,
    then_branch: Vec<Arc<dyn Mediator>>,
    else_branch: Vec<Arc<dyn Mediator>>,
}

impl FilterMediator {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        predicate: impl Fn(&Message) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
            then_branch: Vec::new(),
            else_branch: Vec::new(),
        }
    }

    /// Matches when `property` equals `value`.
    #[must_use]
    pub fn property_equals(
        name: impl Into<String>,
        property: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        let property = property.into();
        let value = value.into();
        Self::new(name, move |message| message.property(&property) == Some(&value))
    }

    /// Matches when `header` is present.
    #[must_use]
    pub fn has_header(name: impl Into<String>, header: impl Into<String>) -> Self {
        let header = header.into();
        Self::new(name, move |message| message.headers.contains_key(&header))
    }

    #[must_use]
    pub fn then(mut self, mediator: Arc<dyn Mediator>) -> Self {
        self.then_branch.push(mediator);
        self
    }

    #[must_use]
    pub fn otherwise(mut self, mediator: Arc<dyn Mediator>) -> Self {
        self.else_branch.push(mediator);
        self
    }
}

#[async_trait]
impl Mediator for FilterMediator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn mediate(
        &self,
        message: &mut Message,
        ctx: &MediationContext,
    ) -> Result<(), MediationError> {
        let matched = (self.predicate)(message);
        debug!(mediator = %self.name, message_id = %message.id, matched, "filter evaluated");
        let branch = if matched {
            &self.then_branch
        } else {
            &self.else_branch
        };
        run_chain(branch, message, ctx).await
    }
}

// ---------------------------------------------------------------------------
// SequenceMediator
// ---------------------------------------------------------------------------

/// Invokes another registered sequence, optionally a template with arguments.
///
/// Template arguments are set as message properties before the sequence
/// runs. A template invoked without all of its declared parameters fails.
pub struct SequenceMediator {
    name: String,
    sequence: String,
    arguments: BTreeMap<String, Value>,
}

impl SequenceMediator {
    #[must_use]
    pub fn new(name: impl Into<String>, sequence: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sequence: sequence.into(),
            arguments: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn argument(mut self, param: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(param.into(), value.into());
        self
    }
}

#[async_trait]
impl Mediator for SequenceMediator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn mediate(
        &self,
        message: &mut Message,
        ctx: &MediationContext,
    ) -> Result<(), MediationError> {
        let sequence = ctx
            .registry()
            .get_sequence(&self.sequence)
            .ok_or_else(|| MediationError::SequenceNotFound {
                name: self.sequence.clone(),
            })?;

        if sequence.is_template() {
            if let Some(missing) = sequence
                .template_params()
                .iter()
                .find(|p| !self.arguments.contains_key(p.as_str()))
            {
                return Err(MediationError::InvalidArgument(format!(
                    "template {} invoked without parameter {missing}",
                    self.sequence
                )));
            }
        }
        for (param, value) in &self.arguments {
            message.set_property(param.clone(), value.clone());
        }

        let nested = ctx.nested(&self.sequence)?;
        sequence.apply(message, &nested).await
    }
}

// ---------------------------------------------------------------------------
// FnMediator
// ---------------------------------------------------------------------------

type MediateFn = Arc<dyn Fn(&mut Message) -> Result<(), MediationError> + Send + Sync>;

/// Wraps a synchronous closure as a mediator.
pub struct FnMediator {
    name: String,
    f: MediateFn,
}

impl FnMediator {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        f: impl Fn(&mut Message) -> Result<(), MediationError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            f: Arc::new(f),
        }
    }
}

#[async_trait]
impl Mediator for FnMediator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn mediate(
        &self,
        message: &mut Message,
        _ctx: &MediationContext,
    ) -> Result<(), MediationError> {
        (self.f)(message)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
