//! Pre-flight port planning for compose deployments.
//!
//! Before a descriptor is launched, every published host port is checked
//! against the tracked bindings and a live listen probe; colliding ports
//! are reassigned into the dynamic range and a rewritten copy of the
//! descriptor is emitted for the actual launch.

use crate::allocator::{probe_port, PortAllocator};
use crate::error::{ComposeError, Result, RuntimeError};
use crate::store::ContainerStore;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use tokio::process::Command as AsyncCommand;
use tracing::{info, warn};

/// `services` table of a canonically rendered descriptor. Everything not
/// needed for port planning is ignored.
#[derive(Debug, Deserialize)]
pub struct ComposeConfig {
    pub services: BTreeMap<String, ComposeService>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ComposeService {
    #[serde(default)]
    pub ports: Vec<ComposePort>,
}

/// A single `ports` entry, in either the `"H:C[/P]"` string form or the
/// `{published, target, protocol}` table form. Table values may be
/// strings or integers depending on the compose version.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ComposePort {
    Short(String),
    Long {
        published: Option<PortValue>,
        target: Option<PortValue>,
        protocol: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(u64),
    Text(String),
}

impl PortValue {
    pub fn as_port(&self) -> Option<u16> {
        match self {
            PortValue::Number(n) => u16::try_from(*n).ok(),
            PortValue::Text(s) => s.parse().ok(),
        }
    }
}

/// A host-port publication declared by a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredPort {
    pub host: u16,
    pub protocol: String,
}

impl ComposePort {
    /// Resolves the entry to its published host port. Entries without
    /// both a host and a container side are skipped.
    pub fn resolve(&self) -> Option<DeclaredPort> {
        match self {
            ComposePort::Short(s) => {
                let (address, protocol) = match s.split_once('/') {
                    Some((address, protocol)) => (address, protocol.to_string()),
                    None => (s.as_str(), "tcp".to_string()),
                };
                let (host, target) = address.split_once(':')?;
                if target.contains(':') || target.is_empty() {
                    return None;
                }
                let host = host.parse().ok()?;
                let _: u16 = target.parse().ok()?;
                Some(DeclaredPort { host, protocol })
            }
            ComposePort::Long {
                published,
                target,
                protocol,
            } => {
                let host = published.as_ref()?.as_port()?;
                let _: u16 = target.as_ref()?.as_port()?;
                Some(DeclaredPort {
                    host,
                    protocol: protocol.clone().unwrap_or_else(|| "tcp".to_string()),
                })
            }
        }
    }
}

/// Result of a pre-plan: the applied remappings keyed
/// `"<service>:<host-port>"` and, when any were needed, the rewritten
/// descriptor. The caller unlinks the file after launching.
#[derive(Debug)]
pub struct ComposePlan {
    pub remappings: HashMap<String, u16>,
    pub rewritten_file: Option<PathBuf>,
}

pub struct PrePlanner {
    store: Arc<ContainerStore>,
    allocator: Arc<PortAllocator>,
}

impl PrePlanner {
    pub fn new(store: Arc<ContainerStore>, allocator: Arc<PortAllocator>) -> Self {
        Self { store, allocator }
    }

    /// Renders the descriptor to canonical form and plans replacements
    /// for every conflicting host port.
    pub async fn plan(&self, file: &Path) -> Result<ComposePlan> {
        if !file.exists() {
            return Err(ComposeError::FileNotFound {
                path: file.display().to_string(),
            }
            .into());
        }
        let canonical = render_canonical(file).await?;
        self.plan_canonical(&canonical, file).await
    }

    /// Plans against an already-rendered canonical document. Split out so
    /// the conflict scan can be exercised without a compose binary.
    pub async fn plan_canonical(&self, canonical: &str, original: &Path) -> Result<ComposePlan> {
        let config: ComposeConfig =
            serde_yaml::from_str(canonical).map_err(|e| ComposeError::InvalidFormat {
                reason: e.to_string(),
            })?;

        let mut remappings = HashMap::new();
        for (service, definition) in &config.services {
            for port in &definition.ports {
                let Some(declared) = port.resolve() else {
                    continue;
                };
                if !self.is_conflicting(&declared).await {
                    continue;
                }
                let new_port = self.allocator.allocate().await;
                info!(
                    "port conflict for service {}: {} -> {}",
                    service, declared.host, new_port
                );
                remappings.insert(format!("{}:{}", service, declared.host), new_port);
            }
        }

        let rewritten_file = if remappings.is_empty() {
            None
        } else {
            Some(rewrite_descriptor(original, &remappings)?)
        };
        Ok(ComposePlan {
            remappings,
            rewritten_file,
        })
    }

    async fn is_conflicting(&self, declared: &DeclaredPort) -> bool {
        if self
            .store
            .holds_binding(declared.host, &declared.protocol)
            .await
        {
            return true;
        }
        !probe_port(declared.host)
    }
}

/// Renders the descriptor through the runtime's own renderer.
async fn render_canonical(file: &Path) -> Result<String> {
    let output = AsyncCommand::new("docker-compose")
        .arg("-f")
        .arg(file)
        .arg("config")
        .output()
        .await
        .map_err(|e| RuntimeError::Unavailable {
            reason: format!("failed to invoke docker-compose: {}", e),
        })?;
    if !output.status.success() {
        return Err(ComposeError::InvalidFormat {
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Writes a copy of the original descriptor with the remapped host ports
/// substituted in place. String entries stay strings and table entries
/// stay tables, with published values keeping their string/integer type.
pub fn rewrite_descriptor(
    original: &Path,
    remappings: &HashMap<String, u16>,
) -> Result<PathBuf> {
    let content = std::fs::read_to_string(original)?;
    let mut document: serde_yaml::Value =
        serde_yaml::from_str(&content).map_err(|e| ComposeError::InvalidFormat {
            reason: e.to_string(),
        })?;

    let Some(services) = document.get_mut("services") else {
        return Err(ComposeError::InvalidFormat {
            reason: "no services defined".to_string(),
        }
        .into());
    };

    for (key, new_port) in remappings {
        let Some((service, old_port)) = key.split_once(':') else {
            continue;
        };
        let Some(ports) = services
            .get_mut(service)
            .and_then(|s| s.get_mut("ports"))
            .and_then(serde_yaml::Value::as_sequence_mut)
        else {
            warn!("service {} has no ports to rewrite", service);
            continue;
        };

        for entry in ports.iter_mut() {
            match entry {
                serde_yaml::Value::String(s) => {
                    if let Some(rest) = s.strip_prefix(&format!("{}:", old_port)) {
                        *s = format!("{}:{}", new_port, rest);
                    }
                }
                serde_yaml::Value::Mapping(mapping) => {
                    let published = serde_yaml::Value::from("published");
                    match mapping.get_mut(&published) {
                        Some(serde_yaml::Value::String(s)) if s == old_port => {
                            *s = new_port.to_string();
                        }
                        Some(value @ serde_yaml::Value::Number(_)) => {
                            if value.as_u64() == old_port.parse::<u64>().ok() {
                                *value = serde_yaml::Value::Number((*new_port as u64).into());
                            }
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }
    }

    let rewritten =
        serde_yaml::to_string(&document).map_err(|e| ComposeError::InvalidFormat {
            reason: e.to_string(),
        })?;

    let mut file = tempfile::Builder::new()
        .prefix("portshift-compose-")
        .suffix(".yml")
        .tempfile()?;
    file.write_all(rewritten.as_bytes())?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

/// Launches `docker-compose` against the (possibly rewritten) descriptor
/// with inherited stdio and returns its exit status.
pub async fn exec_compose(file: &Path, args: &[String]) -> Result<ExitStatus> {
    let status = AsyncCommand::new("docker-compose")
        .arg("-f")
        .arg(file)
        .args(args)
        .status()
        .await
        .map_err(|e| RuntimeError::Unavailable {
            reason: format!("failed to invoke docker-compose: {}", e),
        })?;
    Ok(status)
}
