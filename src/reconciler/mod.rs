//! Event-driven reconciliation of container port bindings.
//!
//! One task consumes the runtime's event stream and dispatches each event
//! to a detached worker. Workers for different containers run unordered;
//! workers racing on the same container are resolved by the processed set,
//! which is consulted before any relocation and written before the first
//! recreate of a container.

use crate::allocator::PortAllocator;
use crate::ports::PortRange;
use crate::recreate::Recreator;
use crate::runtime::{BoundPort, ContainerRuntime, DockerEvent, EventStream};
use crate::store::ContainerStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const START_SETTLE: Duration = Duration::from_millis(500);
const EVENT_DEBOUNCE: Duration = Duration::from_millis(300);
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(5);
const PANIC_RESTART_BACKOFF: Duration = Duration::from_secs(2);

pub struct Reconciler {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<ContainerStore>,
    allocator: Arc<PortAllocator>,
    recreator: Recreator,
    range: PortRange,
}

impl Reconciler {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<ContainerStore>,
        allocator: Arc<PortAllocator>,
        range: PortRange,
    ) -> Self {
        let recreator = Recreator::new(runtime.clone(), store.clone());
        Self {
            runtime,
            store,
            allocator,
            recreator,
            range,
        }
    }

    /// Consumes the event stream until shutdown, re-subscribing whenever
    /// the stream terminates or the dispatch loop dies.
    pub async fn run(self: Arc<Self>) {
        loop {
            let stream = match self.runtime.events().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("cannot subscribe to runtime events: {}", e);
                    tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
                    continue;
                }
            };

            let dispatcher = self.clone();
            let handle = tokio::spawn(async move { dispatcher.dispatch(stream).await });
            match handle.await {
                Ok(()) => {
                    warn!("runtime event stream ended, re-subscribing");
                    tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
                }
                Err(e) => {
                    error!("event dispatch loop died: {}", e);
                    tokio::time::sleep(PANIC_RESTART_BACKOFF).await;
                }
            }
        }
    }

    async fn dispatch(self: Arc<Self>, mut stream: EventStream) {
        while let Some(event) = stream.next().await {
            let worker = self.clone();
            tokio::spawn(async move { worker.handle_event(event).await });
        }
    }

    /// Routes a single container event. Exposed for scenario tests.
    pub async fn handle_event(&self, event: DockerEvent) {
        match event.status.as_str() {
            "start" => self.handle_start(&event.id).await,
            "die" | "stop" | "kill" | "destroy" | "remove" => {
                self.handle_terminal(&event.id).await
            }
            status if status.starts_with("exec_") => {}
            status => {
                debug!("container event {} for {}", status, event.id);
                tokio::time::sleep(EVENT_DEBOUNCE).await;
                self.refresh().await;
            }
        }
    }

    /// Start-event core: inspect the container, relocate any host binding
    /// that collides under the policy, and commit the id to the processed
    /// set so it is never examined again.
    async fn handle_start(&self, id: &str) {
        // Let the runtime finish committing the host config.
        tokio::time::sleep(START_SETTLE).await;
        info!("container started: {}", id);

        // Once recreated or approved, a container is never touched again;
        // this is what keeps replacement start events from looping.
        if self.store.is_processed(id).await {
            debug!("container {} already processed, skipping", id);
            self.refresh().await;
            return;
        }

        let data = match self.runtime.inspect(id).await {
            Ok(data) => data,
            Err(e) => {
                warn!("cannot inspect started container {}: {}", id, e);
                return;
            }
        };

        let bound = data.bound_ports();
        if bound.is_empty() {
            return;
        }

        // Ports inside the dynamic range were assigned by this supervisor
        // (or a prior run) and must not be moved again.
        if bound.iter().all(|b| self.range.contains(b.host_port)) {
            info!(
                "container {} has all ports in the dynamic range, marking processed",
                id
            );
            self.store.mark_processed(id).await;
            self.refresh().await;
            return;
        }

        let mut relocations: Vec<(BoundPort, u16)> = Vec::new();
        for port in &bound {
            if self.range.contains(port.host_port) {
                if self
                    .store
                    .held_by_other(id, port.host_port, &port.protocol)
                    .await
                {
                    let new_port = self.allocator.allocate().await;
                    info!(
                        "port {}/{} of {} is taken by another container, moving to {}",
                        port.host_port, port.protocol, id, new_port
                    );
                    relocations.push((port.clone(), new_port));
                }
            } else {
                // Anything outside the dynamic range is a potential
                // conflict by policy and gets relocated unconditionally.
                let new_port = self.allocator.allocate().await;
                info!(
                    "port {}/{} of {} is outside {}, moving to {}",
                    port.host_port, port.protocol, id, self.range, new_port
                );
                relocations.push((port.clone(), new_port));
            }
        }

        if relocations.is_empty() {
            info!("no port conflicts for container {}", id);
            self.store.mark_processed(id).await;
            self.refresh().await;
            return;
        }

        // Commit before the first recreate: the replacement's start event
        // may fire before the recreator's own marking does.
        self.store.mark_processed(id).await;

        for (port, new_port) in relocations {
            if let Err(e) = self
                .recreator
                .remap(id, port.host_port, new_port, port.container_port, &port.protocol)
                .await
            {
                warn!("remap of {} failed: {}", id, e);
            }
        }
        self.refresh().await;
    }

    /// Terminal events drop the container from every map; the follow-up
    /// refresh re-observes whatever the runtime still has.
    async fn handle_terminal(&self, id: &str) {
        debug!("container stopped or removed: {}", id);
        self.store.remove(id).await;
        self.refresh().await;
    }

    async fn refresh(&self) {
        if let Err(e) = self.store.refresh().await {
            warn!("container refresh failed: {}", e);
        }
    }
}
