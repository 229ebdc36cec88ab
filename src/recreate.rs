//! Atomic replacement of a container with one whose host binding on a
//! given container-side port has been moved.

use crate::error::{Result, RuntimeError};
use crate::runtime::{ContainerRuntime, PortPublish, RunSpec};
use crate::store::{ContainerStore, SENTINEL_LABEL};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const STOP_GRACE_SECS: u32 = 10;
const SETTLE_AFTER_STOP: Duration = Duration::from_secs(1);

pub struct Recreator {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<ContainerStore>,
}

impl Recreator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, store: Arc<ContainerStore>) -> Self {
        Self { runtime, store }
    }

    /// Replaces the container with an equivalent one whose
    /// `container_port/proto` binding publishes `new_host_port`.
    ///
    /// Name, image, environment, mounts, restart policy, network mode and
    /// labels carry over. Health checks, user, entrypoint overrides,
    /// capabilities, sysctls, ulimits, devices, tmpfs and log config do
    /// not; containers relying on them come back without them.
    pub async fn remap(
        &self,
        id: &str,
        old_host_port: u16,
        new_host_port: u16,
        container_port: u16,
        protocol: &str,
    ) -> Result<()> {
        info!(
            "remapping container {}: {}->{}:{}/{}",
            id, old_host_port, new_host_port, container_port, protocol
        );

        // Processed before anything else: even a half-finished remap must
        // not re-enter the relocation path on the next start event.
        self.store.mark_processed(id).await;

        let fail = |reason: String| RuntimeError::RecreateFailed {
            id: id.to_string(),
            reason,
        };

        let data = self
            .runtime
            .inspect(id)
            .await
            .map_err(|e| fail(format!("inspect: {}", e)))?;

        let name = data.name.trim_start_matches('/').to_string();
        let labels = data.config.labels.clone().unwrap_or_default();

        if let Some(project) = labels.get("com.docker.compose.project") {
            warn!(
                "container {} belongs to compose project {}; its replacement will no \
                 longer be managed by that project's lifecycle",
                name, project
            );
        }

        let remap_key = format!("{}/{}", container_port, protocol);

        let mut ports = Vec::new();
        if let Some(bindings) = &data.host_config.port_bindings {
            let mut keys: Vec<&String> = bindings.keys().collect();
            keys.sort();
            for key in keys {
                if *key == remap_key {
                    continue;
                }
                for binding in bindings[key].iter().flatten() {
                    ports.push(PortPublish {
                        host_ip: binding.host_ip.clone(),
                        host_port: binding.host_port.clone(),
                        container_spec: key.clone(),
                    });
                }
            }
        }
        ports.push(PortPublish {
            host_ip: String::new(),
            host_port: new_host_port.to_string(),
            container_spec: remap_key.clone(),
        });

        let mut label_pairs: Vec<(String, String)> = labels
            .iter()
            .filter(|(key, _)| key.as_str() != SENTINEL_LABEL)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        label_pairs.sort();
        label_pairs.push((SENTINEL_LABEL.to_string(), "true".to_string()));

        let policy = &data.host_config.restart_policy;
        let restart = match policy.name.as_str() {
            "" => String::new(),
            "on-failure" => format!("on-failure:{}", policy.maximum_retry_count),
            other => other.to_string(),
        };

        let spec = RunSpec {
            name: name.clone(),
            image: data.config.image.clone(),
            network_mode: data.host_config.network_mode.clone(),
            restart,
            env: data.config.env.clone().unwrap_or_default(),
            mounts: data
                .mounts
                .iter()
                .map(|m| (m.source.clone(), m.destination.clone()))
                .collect(),
            labels: label_pairs,
            ports,
        };

        if let Err(e) = self.runtime.stop(id, STOP_GRACE_SECS).await {
            warn!("graceful stop of {} failed ({}), killing", id, e);
            self.runtime
                .kill(id)
                .await
                .map_err(|e| fail(format!("kill: {}", e)))?;
        }
        tokio::time::sleep(SETTLE_AFTER_STOP).await;

        // Volumes survive removal: they are bind mounts or named volumes.
        self.runtime
            .remove(id)
            .await
            .map_err(|e| fail(format!("remove: {}", e)))?;

        let new_id = self
            .runtime
            .run(&spec)
            .await
            .map_err(|e| fail(format!("run: {}", e)))?;

        // The replacement must be classified before its start event can
        // race us; also pin the binding's original port so the next
        // refresh keeps reporting where it came from.
        let original = self
            .store
            .original_for(id, &remap_key)
            .await
            .unwrap_or(old_host_port);
        self.store.record_remap(&new_id, &remap_key, original).await;

        info!(
            "container {} replaced by {} with {}/{} on host port {}",
            id, new_id, container_port, protocol, new_host_port
        );
        Ok(())
    }
}
