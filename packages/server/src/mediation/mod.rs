//! Mediation pipeline: mediators, sequences, the engine and proxy services.
//!
//! A message enters through [`MediationEngine::mediate`] or
//! [`ProxyService::process_request`], runs through named
//! [`MediationSequence`]s resolved from the [`MediationRegistry`], and fails
//! with a [`MediationError`] that is wrapped at every pipeline boundary.

pub mod endpoint;
pub mod engine;
pub mod error;
pub mod factory;
pub mod mediator;
pub mod mediators;
pub mod proxy;
pub mod registry;
pub mod sequence;

pub use endpoint::ServiceEndpoint;
pub use engine::MediationEngine;
pub use error::MediationError;
pub use factory::{EndpointFactory, MediatorFactory, Params, TagFactory};
pub use mediator::{run_chain, MediationContext, Mediator, MAX_NESTING_DEPTH};
pub use mediators::{
    DropMediator, FilterMediator, FnMediator, HeaderMediator, LogLevel, LogMediator,
    PropertyMediator, SequenceMediator,
};
pub use proxy::{ProxyQos, ProxyService};
pub use registry::MediationRegistry;
pub use sequence::MediationSequence;
