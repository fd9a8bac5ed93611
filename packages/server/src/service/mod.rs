//! Lifecycle framework shared by the bus and its QoS modules.
//!
//! 1. **Configuration** (`config`): `BusConfig`, loaded from JSON or defaults
//! 2. **Registry** (`registry`): ordered init/shutdown of `ManagedService`s
//! 3. **Background workers** (`worker`): periodic sweeps with bounded stop
//! 4. **Shutdown** (`shutdown`): health state and in-flight request draining

pub mod config;
pub mod registry;
pub mod shutdown;
pub mod worker;

pub use config::BusConfig;
pub use registry::{ManagedService, ServiceContext, ServiceRegistry};
pub use shutdown::{HealthState, InFlightGuard, ShutdownController};
pub use worker::{BackgroundRunnable, BackgroundWorker, SweepTask};
