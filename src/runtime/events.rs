//! Subscription to the runtime's container event stream.

use crate::error::{Result, RuntimeError};
use serde::Deserialize;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as AsyncCommand;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One line of `docker events --format '{{json .}}'`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerEvent {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub id: String,
    #[serde(rename = "Type", alias = "type", default)]
    pub kind: String,
    #[serde(rename = "Actor", default)]
    pub actor: EventActor,
    #[serde(default)]
    pub time: i64,
    #[serde(rename = "timeNano", default)]
    pub time_nano: i64,
    #[serde(default)]
    pub scope: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventActor {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Attributes", default)]
    pub attributes: HashMap<String, String>,
}

/// Lazy, single-pass sequence of container events.
///
/// [`next`](EventStream::next) returns `None` when the underlying stream
/// terminates; the consumer is expected to re-subscribe. Dropping the
/// stream tears down the producing process.
pub struct EventStream {
    rx: mpsc::Receiver<DockerEvent>,
}

impl EventStream {
    pub fn new(rx: mpsc::Receiver<DockerEvent>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<DockerEvent> {
        self.rx.recv().await
    }
}

/// Spawns `docker events` filtered to container-scoped events and forwards
/// each parsed line into the returned stream.
pub(crate) async fn subscribe(binary: &str) -> Result<EventStream> {
    let mut child = AsyncCommand::new(binary)
        .args([
            "events",
            "--format",
            "{{json .}}",
            "--filter",
            "type=container",
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| RuntimeError::Unavailable {
            reason: format!("failed to start {} events: {}", binary, e),
        })?;

    let stdout = child.stdout.take().ok_or_else(|| RuntimeError::Unavailable {
        reason: "event stream has no stdout".to_string(),
    })?;

    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        // The child is held here so dropping the receiver kills it.
        let _child = child;
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let event: DockerEvent = match serde_json::from_str(&line) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!("skipping unparseable event line: {}", e);
                            continue;
                        }
                    };
                    if event.kind != "container" {
                        continue;
                    }
                    if tx.send(event).await.is_err() {
                        debug!("event consumer went away, closing stream");
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("error reading event stream: {}", e);
                    break;
                }
            }
        }
    });

    Ok(EventStream::new(rx))
}
