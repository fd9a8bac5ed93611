//! Name-based lookup of sequences, endpoints and proxy services.

use std::sync::Arc;

use dashmap::DashMap;
use relaybus_core::Message;
use tracing::{debug, warn};

use super::error::MediationError;
use super::mediator::MediationContext;
use super::proxy::ProxyService;
use super::sequence::MediationSequence;
use crate::traits::Endpoint;

/// The mediation graph: everything a pipeline can refer to by name.
///
/// Lookups return `None` on a miss and log a warning; deciding whether a
/// miss is an error is up to the caller.
#[derive(Default)]
pub struct MediationRegistry {
    sequences: DashMap<String, Arc<MediationSequence>>,
    endpoints: DashMap<String, Arc<dyn Endpoint>>,
    proxies: DashMap<String, Arc<ProxyService>>,
}

fn sorted_keys<V>(map: &DashMap<String, V>) -> Vec<String> {
    let mut names: Vec<_> = map.iter().map(|e| e.key().clone()).collect();
    names.sort();
    names
}

impl MediationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // -- sequences ----------------------------------------------------------

    /// Adds a sequence, replacing any sequence with the same name.
    pub fn register_sequence(&self, sequence: impl Into<Arc<MediationSequence>>) {
        let sequence = sequence.into();
        debug!(sequence = sequence.name(), mediators = sequence.len(), "sequence registered");
        self.sequences.insert(sequence.name().to_string(), sequence);
    }

    #[must_use]
    pub fn get_sequence(&self, name: &str) -> Option<Arc<MediationSequence>> {
        let found = self.sequences.get(name).map(|s| s.value().clone());
        if found.is_none() {
            warn!(sequence = name, "sequence not found");
        }
        found
    }

    pub fn remove_sequence(&self, name: &str) -> Option<Arc<MediationSequence>> {
        self.sequences.remove(name).map(|(_, s)| s)
    }

    #[must_use]
    pub fn sequence_names(&self) -> Vec<String> {
        sorted_keys(&self.sequences)
    }

    /// Resolves `name` and applies it to `message`.
    ///
    /// # Errors
    ///
    /// `SequenceNotFound` if the name does not resolve, otherwise whatever the
    /// sequence returns.
    pub async fn apply_sequence(
        &self,
        name: &str,
        message: &mut Message,
        ctx: &MediationContext,
    ) -> Result<(), MediationError> {
        let sequence = self
            .get_sequence(name)
            .ok_or_else(|| MediationError::SequenceNotFound {
                name: name.to_string(),
            })?;
        sequence.apply(message, ctx).await
    }

    // -- endpoints ----------------------------------------------------------

    /// Adds an endpoint under its own name.
    pub fn register_endpoint(&self, endpoint: Arc<dyn Endpoint>) {
        debug!(endpoint = endpoint.name(), url = endpoint.url(), "endpoint registered");
        self.endpoints.insert(endpoint.name().to_string(), endpoint);
    }

    #[must_use]
    pub fn get_endpoint(&self, name: &str) -> Option<Arc<dyn Endpoint>> {
        let found = self.endpoints.get(name).map(|e| e.value().clone());
        if found.is_none() {
            warn!(endpoint = name, "endpoint not found");
        }
        found
    }

    pub fn remove_endpoint(&self, name: &str) -> Option<Arc<dyn Endpoint>> {
        self.endpoints.remove(name).map(|(_, e)| e)
    }

    #[must_use]
    pub fn endpoint_names(&self) -> Vec<String> {
        sorted_keys(&self.endpoints)
    }

    // -- proxies ------------------------------------------------------------

    pub fn register_proxy(&self, proxy: impl Into<Arc<ProxyService>>) -> Arc<ProxyService> {
        let proxy = proxy.into();
        debug!(proxy = proxy.name(), "proxy service registered");
        self.proxies.insert(proxy.name().to_string(), proxy.clone());
        proxy
    }

    #[must_use]
    pub fn get_proxy(&self, name: &str) -> Option<Arc<ProxyService>> {
        let found = self.proxies.get(name).map(|p| p.value().clone());
        if found.is_none() {
            warn!(proxy = name, "proxy service not found");
        }
        found
    }

    pub fn remove_proxy(&self, name: &str) -> Option<Arc<ProxyService>> {
        self.proxies.remove(name).map(|(_, p)| p)
    }

    #[must_use]
    pub fn proxy_names(&self) -> Vec<String> {
        sorted_keys(&self.proxies)
    }

    /// Proxies currently registered, in name order.
    #[must_use]
    pub fn proxies(&self) -> Vec<Arc<ProxyService>> {
        let mut proxies: Vec<_> = self.proxies.iter().map(|p| p.value().clone()).collect();
        proxies.sort_by(|a, b| a.name().cmp(b.name()));
        proxies
    }
}

impl std::fmt::Debug for MediationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediationRegistry")
            .field("sequences", &self.sequence_names())
            .field("endpoints", &self.endpoint_names())
            .field("proxies", &self.proxy_names())
            .finish()
    }
}
