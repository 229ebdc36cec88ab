//! Scripted in-memory runtime used by the scenario tests.

#![allow(dead_code)]

use async_trait::async_trait;
use portshift::error::{Result, RuntimeError};
use portshift::runtime::{
    ContainerRuntime, DockerEvent, EventStream, HostPortBinding, InspectConfig, InspectData,
    InspectHostConfig, InspectMount, InspectRestartPolicy, PsEntry, RunSpec,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default)]
pub struct MockContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub mounts: Vec<(String, String)>,
    pub network_mode: String,
    pub restart_name: String,
    pub restart_retries: i64,
    /// `(container_spec, host_ip, host_port)`, e.g. `("80/tcp", "0.0.0.0", "8080")`.
    pub bindings: Vec<(String, String, String)>,
}

impl MockContainer {
    pub fn new(id: &str, name: &str, image: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            image: image.to_string(),
            network_mode: "bridge".to_string(),
            ..Default::default()
        }
    }

    pub fn with_binding(mut self, host_port: u16, container_port: u16, proto: &str) -> Self {
        self.bindings.push((
            format!("{}/{}", container_port, proto),
            "0.0.0.0".to_string(),
            host_port.to_string(),
        ));
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    fn ports_string(&self) -> String {
        self.bindings
            .iter()
            .map(|(spec, ip, host)| format!("{}:{}->{}", ip, host, spec))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    run_count: usize,
    next_id: usize,
    fail_list: bool,
}

#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, container: MockContainer) {
        let mut state = self.state.lock().unwrap();
        state.containers.insert(container.id.clone(), container);
    }

    pub fn take(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.containers.remove(id);
    }

    pub fn container(&self, id: &str) -> Option<MockContainer> {
        self.state.lock().unwrap().containers.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .containers
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn run_count(&self) -> usize {
        self.state.lock().unwrap().run_count
    }

    pub fn set_fail_list(&self, fail: bool) {
        self.state.lock().unwrap().fail_list = fail;
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list(&self) -> Result<Vec<PsEntry>> {
        let state = self.state.lock().unwrap();
        if state.fail_list {
            return Err(RuntimeError::Unavailable {
                reason: "scripted list failure".to_string(),
            }
            .into());
        }
        let mut entries: Vec<PsEntry> = state
            .containers
            .values()
            .map(|c| PsEntry {
                id: c.id.clone(),
                image: c.image.clone(),
                command: "\"/entrypoint.sh\"".to_string(),
                running_for: "About a minute ago".to_string(),
                status: "Up About a minute".to_string(),
                ports: c.ports_string(),
                names: c.name.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    async fn inspect(&self, id: &str) -> Result<InspectData> {
        let state = self.state.lock().unwrap();
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound { id: id.to_string() })?;

        let mut port_bindings = HashMap::new();
        for (spec, ip, host) in &container.bindings {
            port_bindings.insert(
                spec.clone(),
                Some(vec![HostPortBinding {
                    host_ip: ip.clone(),
                    host_port: host.clone(),
                }]),
            );
        }

        Ok(InspectData {
            name: format!("/{}", container.name),
            config: InspectConfig {
                image: container.image.clone(),
                env: Some(container.env.clone()),
                labels: Some(container.labels.clone()),
            },
            host_config: InspectHostConfig {
                network_mode: container.network_mode.clone(),
                port_bindings: Some(port_bindings),
                restart_policy: InspectRestartPolicy {
                    name: container.restart_name.clone(),
                    maximum_retry_count: container.restart_retries,
                },
            },
            mounts: container
                .mounts
                .iter()
                .map(|(source, destination)| InspectMount {
                    source: source.clone(),
                    destination: destination.clone(),
                })
                .collect(),
        })
    }

    async fn stop(&self, id: &str, _grace_secs: u32) -> Result<()> {
        let state = self.state.lock().unwrap();
        if state.containers.contains_key(id) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound { id: id.to_string() }.into())
        }
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.stop(id, 0).await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound { id: id.to_string() }.into())
    }

    async fn run(&self, spec: &RunSpec) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.run_count += 1;
        state.next_id += 1;
        let id = format!("generated-{}", state.next_id);

        let container = MockContainer {
            id: id.clone(),
            name: spec.name.clone(),
            image: spec.image.clone(),
            env: spec.env.clone(),
            labels: spec.labels.iter().cloned().collect(),
            mounts: spec.mounts.clone(),
            network_mode: spec.network_mode.clone(),
            restart_name: String::new(),
            restart_retries: 0,
            bindings: spec
                .ports
                .iter()
                .map(|p| {
                    (
                        p.container_spec.clone(),
                        p.host_ip.clone(),
                        p.host_port.clone(),
                    )
                })
                .collect(),
        };
        state.containers.insert(id.clone(), container);
        Ok(id)
    }

    async fn get_label(&self, id: &str, key: &str) -> Result<String> {
        let state = self.state.lock().unwrap();
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound { id: id.to_string() })?;
        Ok(container.labels.get(key).cloned().unwrap_or_default())
    }

    async fn update_label(&self, id: &str, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound { id: id.to_string() })?;
        container.labels.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn events(&self) -> Result<EventStream> {
        let (_tx, rx) = mpsc::channel::<DockerEvent>(1);
        Ok(EventStream::new(rx))
    }
}

pub fn start_event(id: &str) -> DockerEvent {
    DockerEvent {
        status: "start".to_string(),
        id: id.to_string(),
        kind: "container".to_string(),
        ..Default::default()
    }
}

pub fn terminal_event(status: &str, id: &str) -> DockerEvent {
    DockerEvent {
        status: status.to_string(),
        id: id.to_string(),
        kind: "container".to_string(),
        ..Default::default()
    }
}
