//! In-memory view of running containers and their port bindings.
//!
//! Three maps live behind a single reader-writer lock: the container
//! records, the per-container original-port index, and the processed set.
//! Runtime calls are never made while the lock is held; `refresh` gathers
//! everything first and applies the new state in one exclusive swap.

use crate::error::Result;
use crate::ports::{parse_port_bindings, PortBinding};
use crate::runtime::{ContainerRuntime, PsEntry};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Label asserting that this supervisor has examined the container.
pub const SENTINEL_LABEL: &str = "com.dynamic-port-mapper.has-dynamic-ports";

/// Grouping bucket for containers without a project.
pub const STANDALONE_GROUP: &str = "standalone";

const PROJECT_LABELS: [&str; 5] = [
    "com.docker.compose.project",
    "docker-compose.project",
    "io.compose.project",
    "com.docker.project",
    "project",
];

const SERVICE_LABELS: [&str; 5] = [
    "com.docker.compose.service",
    "docker-compose.service",
    "io.compose.service",
    "com.docker.service",
    "service",
];

/// A tracked container.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerRecord {
    pub id: String,
    pub image: String,
    pub command: String,
    pub created: String,
    pub status: String,
    pub name: String,
    /// Compose project, empty when unknown.
    pub project: String,
    /// Compose service within the project, empty when unknown.
    pub service: String,
    pub bindings: Vec<PortBinding>,
}

impl ContainerRecord {
    pub fn has_remapped_ports(&self) -> bool {
        self.bindings.iter().any(PortBinding::is_remapped)
    }
}

#[derive(Default)]
struct StoreState {
    containers: HashMap<String, ContainerRecord>,
    /// id -> `"<cport>/<proto>"` -> first-observed host port.
    original_ports: HashMap<String, HashMap<String, u16>>,
    processed: HashSet<String>,
}

pub struct ContainerStore {
    runtime: Arc<dyn ContainerRuntime>,
    state: RwLock<StoreState>,
}

impl ContainerStore {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Reloads the container listing and merges it with the prior state.
    ///
    /// Bindings keep their first-observed `original` port; processed ids
    /// stay processed while still listed; everything absent from the
    /// listing is dropped. A failed listing leaves the state untouched.
    pub async fn refresh(&self) -> Result<()> {
        let (prior_originals, prior_processed) = {
            let state = self.state.read().await;
            (state.original_ports.clone(), state.processed.clone())
        };

        let listing = self.runtime.list().await?;

        let mut containers = HashMap::new();
        let mut original_ports = HashMap::new();
        let mut processed = HashSet::new();

        for entry in listing {
            let (project, service) = match self.resolve_group(&entry).await {
                Some(pair) => pair,
                // The container vanished between ps and inspect.
                None => {
                    debug!("container {} no longer exists, skipping", entry.id);
                    continue;
                }
            };

            let mut bindings = parse_port_bindings(&entry.ports);
            bindings.dedup();

            let prior = prior_originals.get(&entry.id);
            let mut originals = HashMap::new();
            for binding in &mut bindings {
                let key = binding.key();
                if let Some(original) = prior.and_then(|m| m.get(&key)) {
                    binding.original_port = *original;
                }
                originals.insert(key, binding.original_port);
            }

            if prior_processed.contains(&entry.id) {
                processed.insert(entry.id.clone());
            }
            if !originals.is_empty() {
                original_ports.insert(entry.id.clone(), originals);
            }
            containers.insert(
                entry.id.clone(),
                ContainerRecord {
                    id: entry.id,
                    image: entry.image,
                    command: entry.command,
                    created: entry.running_for,
                    status: entry.status,
                    name: entry.names,
                    project,
                    service,
                    bindings,
                },
            );
        }

        let mut state = self.state.write().await;
        state.containers = containers;
        state.original_ports = original_ports;
        state.processed = processed;
        Ok(())
    }

    /// Resolves the compose project and service of a listed container via
    /// the label ladder, falling back to name inference. Returns `None`
    /// when the container no longer exists.
    async fn resolve_group(&self, entry: &PsEntry) -> Option<(String, String)> {
        let mut project = String::new();
        for label in PROJECT_LABELS {
            match self.runtime.get_label(&entry.id, label).await {
                Ok(value) if !value.is_empty() => {
                    project = value;
                    break;
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => return None,
                Err(e) => {
                    warn!("label lookup failed for {}: {}", entry.id, e);
                    break;
                }
            }
        }
        if project.is_empty() {
            if let Some(inferred) = infer_project_from_name(&entry.names) {
                debug!(
                    "inferred project '{}' from container name {}",
                    inferred, entry.names
                );
                project = inferred;
            }
        }

        let mut service = String::new();
        if !project.is_empty() {
            for label in SERVICE_LABELS {
                match self.runtime.get_label(&entry.id, label).await {
                    Ok(value) if !value.is_empty() => {
                        service = value;
                        break;
                    }
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => return None,
                    Err(_) => break,
                }
            }
            if service.is_empty() {
                service = infer_service_from_name(&entry.names).unwrap_or_default();
            }
        }

        Some((project, service))
    }

    /// Snapshot of all tracked containers.
    pub async fn get_all(&self) -> Vec<ContainerRecord> {
        let state = self.state.read().await;
        state.containers.values().cloned().collect()
    }

    /// Groups the snapshot by project; containers without one land in the
    /// `standalone` bucket.
    pub async fn group_by_project(&self) -> HashMap<String, Vec<ContainerRecord>> {
        let state = self.state.read().await;
        let mut groups: HashMap<String, Vec<ContainerRecord>> = HashMap::new();
        for record in state.containers.values() {
            let project = if !record.project.is_empty() && record.project != "<no value>" {
                record.project.clone()
            } else if let Some(inferred) = infer_project_from_name(&record.name) {
                inferred
            } else {
                STANDALONE_GROUP.to_string()
            };
            groups.entry(project).or_default().push(record.clone());
        }
        groups
    }

    /// Records the id as processed and, best-effort, writes the sentinel
    /// label. The in-memory set is authoritative; the label is a backup
    /// that survives a supervisor restart.
    pub async fn mark_processed(&self, id: &str) {
        {
            let mut state = self.state.write().await;
            state.processed.insert(id.to_string());
        }
        info!("tracking container {} as processed", id);

        if let Err(e) = self.runtime.update_label(id, SENTINEL_LABEL, "true").await {
            debug!("could not write sentinel label on {}: {}", id, e);
        }
    }

    /// Checks the processed set, consulting the sentinel label when the
    /// id is not in memory. A positive label answer is cached.
    pub async fn is_processed(&self, id: &str) -> bool {
        {
            let state = self.state.read().await;
            if state.processed.contains(id) {
                return true;
            }
        }

        match self.runtime.get_label(id, SENTINEL_LABEL).await {
            Ok(value) if value == "true" => {
                let mut state = self.state.write().await;
                state.processed.insert(id.to_string());
                true
            }
            _ => false,
        }
    }

    /// Evicts a container from all three maps.
    pub async fn remove(&self, id: &str) {
        let mut state = self.state.write().await;
        state.containers.remove(id);
        state.original_ports.remove(id);
        state.processed.remove(id);
    }

    /// Seeds the replacement container produced by a remap: marks it
    /// processed and pins the moved binding's original host port so the
    /// next refresh does not reset it.
    pub async fn record_remap(&self, new_id: &str, key: &str, original_port: u16) {
        let mut state = self.state.write().await;
        state.processed.insert(new_id.to_string());
        state
            .original_ports
            .entry(new_id.to_string())
            .or_default()
            .insert(key.to_string(), original_port);
    }

    /// First-observed host port of a tracked binding, if known.
    pub async fn original_for(&self, id: &str, key: &str) -> Option<u16> {
        let state = self.state.read().await;
        state.original_ports.get(id)?.get(key).copied()
    }

    /// True when any tracked binding publishes the host port, regardless
    /// of protocol.
    pub async fn uses_host_port(&self, port: u16) -> bool {
        let state = self.state.read().await;
        state
            .containers
            .values()
            .flat_map(|c| &c.bindings)
            .any(|b| b.host_port == port)
    }

    /// True when a container other than `id` holds `(port, protocol)`.
    pub async fn held_by_other(&self, id: &str, port: u16, protocol: &str) -> bool {
        let state = self.state.read().await;
        state
            .containers
            .values()
            .filter(|c| c.id != id)
            .flat_map(|c| &c.bindings)
            .any(|b| b.host_port == port && b.protocol == protocol)
    }

    /// True when a tracked binding holds exactly `(port, protocol)`.
    pub async fn holds_binding(&self, port: u16, protocol: &str) -> bool {
        let state = self.state.read().await;
        state
            .containers
            .values()
            .flat_map(|c| &c.bindings)
            .any(|b| b.host_port == port && b.protocol == protocol)
    }
}

/// Infers a compose project from container naming conventions:
/// `project_service_1` first, then `project-service-1` (three or more
/// parts required to avoid matching plain hyphenated names).
pub fn infer_project_from_name(name: &str) -> Option<String> {
    let name = name.trim_start_matches('/');

    let parts: Vec<&str> = name.split('_').collect();
    if parts.len() >= 2 && !parts[0].is_empty() {
        return Some(parts[0].to_string());
    }

    let parts: Vec<&str> = name.split('-').collect();
    if parts.len() >= 3 && !parts[0].is_empty() {
        return Some(parts[0].to_string());
    }

    None
}

/// Infers the service name from a `project_service_1` style name.
pub fn infer_service_from_name(name: &str) -> Option<String> {
    let name = name.trim_start_matches('/');
    let parts: Vec<&str> = name.split('_').collect();
    if parts.len() >= 2 && !parts[1].is_empty() {
        return Some(parts[1].to_string());
    }
    None
}
