//! portshift - host-port collision supervisor for a local Docker runtime
//!
//! This crate watches container start events and relocates any host-port
//! binding that would collide with an already-bound port to a free port
//! from a configured dynamic range, recreating the offending container
//! with a rewritten binding set. A pre-planner applies the same policy to
//! compose descriptors before they launch.

pub mod allocator;
pub mod compose;
pub mod error;
pub mod ports;
pub mod reconciler;
pub mod recreate;
pub mod runtime;
pub mod server;
pub mod store;

pub use error::{ComposeError, PortShiftError, Result, RuntimeError};
pub use ports::{PortBinding, PortRange};
pub use store::{ContainerRecord, ContainerStore};

// Re-export anyhow for applications embedding the supervisor.
pub use anyhow;

use crate::allocator::PortAllocator;
use crate::compose::PrePlanner;
use crate::reconciler::Reconciler;
use crate::runtime::{ContainerRuntime, DockerCli};
use std::sync::Arc;

/// Wires the store, allocator and reconciler around one runtime adapter.
pub struct Supervisor {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<ContainerStore>,
    allocator: Arc<PortAllocator>,
    range: PortRange,
}

impl Supervisor {
    /// Supervisor over the local `docker` CLI.
    pub fn new(range: PortRange) -> Self {
        Self::with_runtime(Arc::new(DockerCli::new()), range)
    }

    /// Supervisor over an arbitrary runtime adapter.
    pub fn with_runtime(runtime: Arc<dyn ContainerRuntime>, range: PortRange) -> Self {
        let store = Arc::new(ContainerStore::new(runtime.clone()));
        let allocator = Arc::new(PortAllocator::new(store.clone(), range));
        Self {
            runtime,
            store,
            allocator,
            range,
        }
    }

    pub fn store(&self) -> Arc<ContainerStore> {
        self.store.clone()
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Initial load of the container listing. An unreachable runtime here
    /// is fatal; later failures are retried by the event loop.
    pub async fn bootstrap(&self) -> Result<()> {
        self.store.refresh().await
    }

    /// Spawns the event-reconciliation loop.
    pub fn spawn_reconciler(&self) -> tokio::task::JoinHandle<()> {
        let reconciler = Arc::new(Reconciler::new(
            self.runtime.clone(),
            self.store.clone(),
            self.allocator.clone(),
            self.range,
        ));
        tokio::spawn(reconciler.run())
    }

    /// Pre-planner sharing this supervisor's store snapshot and allocator.
    pub fn pre_planner(&self) -> PrePlanner {
        PrePlanner::new(self.store.clone(), self.allocator.clone())
    }
}
