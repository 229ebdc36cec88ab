//! Gateway to the container runtime.
//!
//! Every interaction with Docker goes through the [`ContainerRuntime`]
//! trait; [`DockerCli`] is the production implementation and shells out to
//! the `docker` binary. Keeping the seam here lets the reconciler and the
//! recreator run against a scripted runtime in tests.

use crate::error::{Result, RuntimeError};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use tokio::process::Command as AsyncCommand;
use tracing::warn;

pub mod events;

pub use events::{DockerEvent, EventActor, EventStream};

/// One line of `docker ps --format '{{json .}}' --no-trunc`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PsEntry {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "Command", default)]
    pub command: String,
    #[serde(rename = "RunningFor", default)]
    pub running_for: String,
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "Ports", default)]
    pub ports: String,
    #[serde(rename = "Names", default)]
    pub names: String,
}

/// Typed shape of `docker inspect <id>` output, restricted to the fields
/// recreation needs. A document missing any of the structural fields is
/// rejected as malformed rather than patched over.
#[derive(Debug, Clone, Deserialize)]
pub struct InspectData {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Config")]
    pub config: InspectConfig,
    #[serde(rename = "HostConfig")]
    pub host_config: InspectHostConfig,
    #[serde(rename = "Mounts", default)]
    pub mounts: Vec<InspectMount>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InspectConfig {
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "Env")]
    pub env: Option<Vec<String>>,
    #[serde(rename = "Labels")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InspectHostConfig {
    #[serde(rename = "NetworkMode")]
    pub network_mode: String,
    #[serde(rename = "PortBindings")]
    pub port_bindings: Option<HashMap<String, Option<Vec<HostPortBinding>>>>,
    #[serde(rename = "RestartPolicy")]
    pub restart_policy: InspectRestartPolicy,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InspectRestartPolicy {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "MaximumRetryCount", default)]
    pub maximum_retry_count: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostPortBinding {
    #[serde(rename = "HostIp", default)]
    pub host_ip: String,
    #[serde(rename = "HostPort", default)]
    pub host_port: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InspectMount {
    #[serde(rename = "Source")]
    pub source: String,
    #[serde(rename = "Destination")]
    pub destination: String,
}

/// A published port observed in `HostConfig.PortBindings`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundPort {
    pub container_port: u16,
    pub protocol: String,
    pub host_port: u16,
}

impl InspectData {
    /// Flattens `HostConfig.PortBindings` to one entry per container-side
    /// key, taking the first binding of each. Keys are sorted so callers
    /// walk the set in a stable order. Entries without a numeric host port
    /// are skipped.
    pub fn bound_ports(&self) -> Vec<BoundPort> {
        let Some(map) = self.host_config.port_bindings.as_ref() else {
            return Vec::new();
        };
        let mut keys: Vec<&String> = map.keys().collect();
        keys.sort();

        let mut out = Vec::new();
        for key in keys {
            let Some((cport, proto)) = key.split_once('/') else {
                continue;
            };
            let Ok(container_port) = cport.parse::<u16>() else {
                continue;
            };
            let Some(binding) = map[key].as_deref().and_then(|b| b.first()) else {
                continue;
            };
            let Ok(host_port) = binding.host_port.parse::<u16>() else {
                continue;
            };
            out.push(BoundPort {
                container_port,
                protocol: proto.to_string(),
                host_port,
            });
        }
        out
    }
}

/// A port publication to apply on `run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortPublish {
    pub host_ip: String,
    pub host_port: String,
    /// Container side in `"<port>/<proto>"` form.
    pub container_spec: String,
}

/// Everything needed to launch a replacement container.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub network_mode: String,
    /// Restart policy in CLI form, e.g. `always` or `on-failure:3`.
    /// Empty means none.
    pub restart: String,
    pub env: Vec<String>,
    /// `(source, destination)` pairs.
    pub mounts: Vec<(String, String)>,
    pub labels: Vec<(String, String)>,
    pub ports: Vec<PortPublish>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Lists running containers.
    async fn list(&self) -> Result<Vec<PsEntry>>;

    /// Full inspection of a single container.
    async fn inspect(&self, id: &str) -> Result<InspectData>;

    /// Graceful stop with the given grace period in seconds.
    async fn stop(&self, id: &str, grace_secs: u32) -> Result<()>;

    async fn kill(&self, id: &str) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<()>;

    /// Launches a detached container and returns its id.
    async fn run(&self, spec: &RunSpec) -> Result<String>;

    /// Reads a single label; returns an empty string when unset.
    async fn get_label(&self, id: &str, key: &str) -> Result<String>;

    async fn update_label(&self, id: &str, key: &str, value: &str) -> Result<()>;

    /// Subscribes to the container-scoped event stream. The stream ends
    /// when the underlying process exits; callers re-subscribe.
    async fn events(&self) -> Result<EventStream>;
}

/// Production adapter shelling out to the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    async fn exec(&self, args: &[&str]) -> Result<std::process::Output> {
        let output = AsyncCommand::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| RuntimeError::Unavailable {
                reason: format!("failed to invoke {}: {}", self.binary, e),
            })?;
        Ok(output)
    }

    /// Classifies a failed CLI invocation by its stderr.
    fn command_error(id: &str, stderr: &[u8]) -> RuntimeError {
        let stderr = String::from_utf8_lossy(stderr);
        let lowered = stderr.to_ascii_lowercase();
        // `rm`/`stop` report "No such container", `inspect` "No such object".
        if lowered.contains("no such container") || lowered.contains("no such object") {
            RuntimeError::NotFound { id: id.to_string() }
        } else {
            RuntimeError::Malformed {
                reason: stderr.trim().to_string(),
            }
        }
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn list(&self) -> Result<Vec<PsEntry>> {
        let output = self
            .exec(&["ps", "--format", "{{json .}}", "--no-trunc"])
            .await?;
        if !output.status.success() {
            return Err(RuntimeError::Unavailable {
                reason: format!(
                    "docker ps failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            }
            .into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut entries = Vec::new();
        for line in stdout.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PsEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("skipping unparseable ps line: {}", e),
            }
        }
        Ok(entries)
    }

    async fn inspect(&self, id: &str) -> Result<InspectData> {
        let output = self.exec(&["inspect", id]).await?;
        if !output.status.success() {
            return Err(Self::command_error(id, &output.stderr).into());
        }

        let documents: Vec<InspectData> =
            serde_json::from_slice(&output.stdout).map_err(|e| RuntimeError::Malformed {
                reason: format!("inspect output for {}: {}", id, e),
            })?;
        documents
            .into_iter()
            .next()
            .ok_or_else(|| RuntimeError::NotFound { id: id.to_string() }.into())
    }

    async fn stop(&self, id: &str, grace_secs: u32) -> Result<()> {
        let grace = grace_secs.to_string();
        let output = self.exec(&["stop", "--time", &grace, id]).await?;
        if !output.status.success() {
            return Err(Self::command_error(id, &output.stderr).into());
        }
        Ok(())
    }

    async fn kill(&self, id: &str) -> Result<()> {
        let output = self.exec(&["kill", id]).await?;
        if !output.status.success() {
            return Err(Self::command_error(id, &output.stderr).into());
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let output = self.exec(&["rm", id]).await?;
        if !output.status.success() {
            return Err(Self::command_error(id, &output.stderr).into());
        }
        Ok(())
    }

    async fn run(&self, spec: &RunSpec) -> Result<String> {
        let mut args: Vec<String> = vec!["run".into(), "-d".into()];
        args.push("--name".into());
        args.push(spec.name.clone());

        if !spec.network_mode.is_empty() && spec.network_mode != "default" {
            args.push("--network".into());
            args.push(spec.network_mode.clone());
        }
        if !spec.restart.is_empty() {
            args.push("--restart".into());
            args.push(spec.restart.clone());
        }
        for (source, destination) in &spec.mounts {
            args.push("-v".into());
            args.push(format!("{}:{}", source, destination));
        }
        for publish in &spec.ports {
            args.push("-p".into());
            if !publish.host_ip.is_empty() && publish.host_ip != "0.0.0.0" {
                args.push(format!(
                    "{}:{}:{}",
                    publish.host_ip, publish.host_port, publish.container_spec
                ));
            } else {
                args.push(format!("{}:{}", publish.host_port, publish.container_spec));
            }
        }
        for env in &spec.env {
            args.push("-e".into());
            args.push(env.clone());
        }
        for (key, value) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(spec.image.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.exec(&arg_refs).await?;
        if !output.status.success() {
            return Err(RuntimeError::Malformed {
                reason: format!(
                    "docker run failed for {}: {}",
                    spec.name,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            }
            .into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let id = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or_default()
            .to_string();
        if id.is_empty() {
            return Err(RuntimeError::Malformed {
                reason: format!("docker run for {} produced no container id", spec.name),
            }
            .into());
        }
        Ok(id)
    }

    async fn get_label(&self, id: &str, key: &str) -> Result<String> {
        let format = format!("{{{{index .Config.Labels \"{}\"}}}}", key);
        let output = self.exec(&["inspect", "--format", &format, id]).await?;
        if !output.status.success() {
            return Err(Self::command_error(id, &output.stderr).into());
        }
        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if value == "<no value>" {
            return Ok(String::new());
        }
        Ok(value)
    }

    async fn update_label(&self, id: &str, key: &str, value: &str) -> Result<()> {
        let label = format!("{}={}", key, value);
        let output = self
            .exec(&["container", "update", "--label", &label, id])
            .await?;
        if !output.status.success() {
            return Err(Self::command_error(id, &output.stderr).into());
        }
        Ok(())
    }

    async fn events(&self) -> Result<EventStream> {
        events::subscribe(&self.binary).await
    }
}
