//! String-tag construction of mediators and endpoints.
//!
//! A configuration front end maps each element tag (`"log"`, `"property"`,
//! ...) to a constructor closure taking the element's string parameters.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use relaybus_core::Value;

use super::endpoint::ServiceEndpoint;
use super::error::MediationError;
use super::mediator::Mediator;
use super::mediators::{
    DropMediator, HeaderMediator, LogLevel, LogMediator, PropertyMediator, SequenceMediator,
};
use crate::traits::Endpoint;

/// Parameters of one configuration element.
pub type Params = HashMap<String, String>;

type Constructor<T> = Arc<dyn Fn(&Params) -> Result<Arc<T>, MediationError> + Send + Sync>;

/// Registry of constructors keyed by tag.
pub struct TagFactory<T: ?Sized> {
    kind: &'static str,
    constructors: DashMap<String, Constructor<T>>,
}

pub type MediatorFactory = TagFactory<dyn Mediator>;
pub type EndpointFactory = TagFactory<dyn Endpoint>;

impl<T: ?Sized> TagFactory<T> {
    /// Creates an empty factory. `kind` names the product in error messages.
    #[must_use]
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            constructors: DashMap::new(),
        }
    }

    /// Registers (or replaces) the constructor for `tag`.
    pub fn register(
        &self,
        tag: impl Into<String>,
        constructor: impl Fn(&Params) -> Result<Arc<T>, MediationError> + Send + Sync + 'static,
    ) {
        self.constructors.insert(tag.into(), Arc::new(constructor));
    }

    /// Builds an instance for `tag`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an unknown tag, otherwise whatever the
    /// constructor returns.
    pub fn create(&self, tag: &str, params: &Params) -> Result<Arc<T>, MediationError> {
        let constructor = self
            .constructors
            .get(tag)
            .map(|c| c.value().clone())
            .ok_or_else(|| {
                MediationError::InvalidArgument(format!("unknown {} tag {tag}", self.kind))
            })?;
        constructor(params)
    }

    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.constructors.contains_key(tag)
    }

    /// Registered tags, sorted.
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<_> = self.constructors.iter().map(|c| c.key().clone()).collect();
        tags.sort();
        tags
    }
}

/// Reads a required parameter.
///
/// # Errors
///
/// `InvalidArgument` naming the missing parameter.
pub fn required<'a>(params: &'a Params, key: &str) -> Result<&'a str, MediationError> {
    params
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| MediationError::InvalidArgument(format!("missing parameter {key}")))
}

fn name_or<'a>(params: &'a Params, fallback: &'a str) -> &'a str {
    params.get("name").map_or(fallback, String::as_str)
}

impl MediatorFactory {
    /// Factory preloaded with `log`, `property`, `header`, `drop` and `sequence`.
    #[must_use]
    pub fn with_builtins() -> Self {
        let factory = Self::new("mediator");
        factory.register("log", |p| {
            let level = p.get("level").map_or(Ok(LogLevel::Info), |l| l.parse())?;
            let mut log = LogMediator::new(name_or(p, "log"), level);
            if let Some(props) = p.get("properties") {
                for prop in props.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    log = log.property(prop);
                }
            }
            if p.get("payload").is_some_and(|v| v == "true") {
                log = log.with_payload();
            }
            Ok(Arc::new(log) as Arc<dyn Mediator>)
        });
        factory.register("property", |p| {
            let name = name_or(p, "property");
            let property = required(p, "property")?;
            let mediator = match p.get("action").map_or("set", String::as_str) {
                "set" => PropertyMediator::set(name, property, Value::from(required(p, "value")?)),
                "remove" => PropertyMediator::remove(name, property),
                other => {
                    return Err(MediationError::InvalidArgument(format!(
                        "unknown property action {other}"
                    )))
                }
            };
            Ok(Arc::new(mediator) as Arc<dyn Mediator>)
        });
        factory.register("header", |p| {
            let name = name_or(p, "header");
            let header = required(p, "header")?;
            let mediator = match p.get("action").map_or("set", String::as_str) {
                "set" => HeaderMediator::set(name, header, required(p, "value")?),
                "remove" => HeaderMediator::remove(name, header),
                other => {
                    return Err(MediationError::InvalidArgument(format!(
                        "unknown header action {other}"
                    )))
                }
            };
            Ok(Arc::new(mediator) as Arc<dyn Mediator>)
        });
        factory.register("drop", |p| {
            Ok(Arc::new(DropMediator::new(name_or(p, "drop"))) as Arc<dyn Mediator>)
        });
        factory.register("sequence", |p| {
            let target = required(p, "key")?;
            let mut call = SequenceMediator::new(name_or(p, target), target);
            // Remaining parameters become template arguments.
            for (k, v) in p.iter().filter(|(k, _)| !matches!(k.as_str(), "name" | "key")) {
                call = call.argument(k.clone(), v.as_str());
            }
            Ok(Arc::new(call) as Arc<dyn Mediator>)
        });
        factory
    }
}

impl EndpointFactory {
    /// Factory preloaded with `echo`, a loopback endpoint.
    #[must_use]
    pub fn with_builtins() -> Self {
        let factory = Self::new("endpoint");
        factory.register("echo", |p| {
            let name = required(p, "name")?;
            Ok(Arc::new(ServiceEndpoint::echo(name)) as Arc<dyn Endpoint>)
        });
        factory
    }
}
