use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::config::BusConfig;

// ---------------------------------------------------------------------------
// ServiceContext
// ---------------------------------------------------------------------------

/// Context provided to modules during initialization.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub config: Arc<BusConfig>,
}

// ---------------------------------------------------------------------------
// ManagedService trait
// ---------------------------------------------------------------------------

/// Lifecycle-managed module trait. Every QoS module implements this.
///
/// Modules are registered with a `ServiceRegistry`, initialized in registration
/// order, and shut down in reverse registration order.
#[async_trait]
pub trait ManagedService: Send + Sync {
    /// Returns the unique name of this module (e.g., `"throttling"`, `"cache"`).
    fn name(&self) -> &'static str;

    /// Initialize the module and start its background work.
    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()>;

    /// Drop all in-memory state while keeping background work running.
    async fn reset(&self) -> anyhow::Result<()>;

    /// Stop background work and release state. If `terminate` is true, skip
    /// the bounded wait and abort background tasks immediately.
    async fn shutdown(&self, terminate: bool) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Registry for lifecycle-managed modules.
///
/// Modules are looked up by name. They are initialized in registration
/// order and shut down in reverse order. A failed initialization rolls back: every module already
/// initialized is terminated before the error is returned.
pub struct ServiceRegistry {
    by_name: DashMap<&'static str, Arc<dyn ManagedService>>,
    order: RwLock<Vec<&'static str>>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Adds a shared module. Re-registering a name replaces the module but
    /// keeps its original position in the lifecycle order.
    pub fn register(&self, module: Arc<dyn ManagedService>) {
        let name = module.name();
        let replaced = self.by_name.insert(name, module).is_some();
        if replaced {
            debug!(module = name, "module replaced");
        } else {
            self.order.write().push(name);
        }
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn ManagedService>> {
        self.by_name.get(name).map(|entry| entry.value().clone())
    }

    /// Module names in lifecycle order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.order.read().clone()
    }

    fn modules(&self) -> Vec<Arc<dyn ManagedService>> {
        self.order
            .read()
            .iter()
            .filter_map(|name| self.get_by_name(name))
            .collect()
    }

    /// Initializes every module in registration order.
    ///
    /// # Errors
    ///
    /// Returns the first `init()` failure, after terminating the modules
    /// that were already initialized.
    pub async fn init_all(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let modules = self.modules();
        for (index, module) in modules.iter().enumerate() {
            debug!(module = module.name(), "initializing module");
            if let Err(error) = module.init(ctx).await {
                warn!(module = module.name(), %error, "module failed to initialize, rolling back");
                for started in modules[..index].iter().rev() {
                    if let Err(rollback) = started.shutdown(true).await {
                        warn!(
                            module = started.name(),
                            error = %rollback,
                            "rollback shutdown failed"
                        );
                    }
                }
                return Err(error.context(format!("initializing module {}", module.name())));
            }
        }
        info!(modules = modules.len(), "all modules initialized");
        Ok(())
    }

    /// Resets every module in registration order.
    ///
    /// # Errors
    ///
    /// Returns the first `reset()` failure.
    pub async fn reset_all(&self) -> anyhow::Result<()> {
        for module in self.modules() {
            module
                .reset()
                .await
                .with_context(|| format!("resetting module {}", module.name()))?;
        }
        Ok(())
    }

    /// Shuts every module down in reverse registration order.
    ///
    /// A failing module does not stop the others from shutting down.
    ///
    /// # Errors
    ///
    /// Returns the first `shutdown()` failure once all modules were visited.
    pub async fn shutdown_all(&self, terminate: bool) -> anyhow::Result<()> {
        let mut first_error = None;
        for module in self.modules().into_iter().rev() {
            debug!(module = module.name(), terminate, "shutting down module");
            if let Err(error) = module.shutdown(terminate).await {
                warn!(module = module.name(), %error, "module shutdown failed");
                first_error.get_or_insert_with(|| {
                    error.context(format!("shutting down module {}", module.name()))
                });
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
