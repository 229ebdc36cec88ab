//! Host-port binding types and the `docker ps` port-string parser.

use serde::Serialize;
use std::fmt;

/// Inclusive interval of host ports reserved for dynamic reassignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: 10000,
            max: 65000,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// A single published port of a container.
///
/// `original_port` is the host port the binding was first observed on; it
/// stays fixed across refreshes even after the binding has been relocated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: String,
    pub original_port: u16,
}

impl PortBinding {
    /// Index key in `"<container-port>/<protocol>"` form.
    pub fn key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }

    pub fn is_remapped(&self) -> bool {
        self.host_port != self.original_port
    }
}

impl fmt::Display for PortBinding {
    /// Canonical `HOST->CONTAINER/PROTO` form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}->{}/{}",
            self.host_port, self.container_port, self.protocol
        )
    }
}

/// Parses a `docker ps` port column into bindings.
///
/// Recognizes `[IP:]HOST->CONTAINER/PROTO` entries anywhere in the string;
/// text that does not match the pattern is dropped. The host IP, when
/// present, is not retained: recreation takes its IPs from `inspect` output.
pub fn parse_port_bindings(ports: &str) -> Vec<PortBinding> {
    let bytes = ports.as_bytes();
    let mut out = Vec::new();
    let mut at = 0;

    while let Some(rel) = ports[at..].find("->") {
        let arrow = at + rel;
        let mut next = arrow + 2;

        // Host side: digits immediately before the arrow.
        let mut host_start = arrow;
        while host_start > 0 && bytes[host_start - 1].is_ascii_digit() {
            host_start -= 1;
        }

        // Container side: digits, then '/', then the protocol word.
        let mut cport_end = next;
        while cport_end < bytes.len() && bytes[cport_end].is_ascii_digit() {
            cport_end += 1;
        }

        let host = ports[host_start..arrow].parse::<u16>().ok();
        let cport = ports[next..cport_end].parse::<u16>().ok();
        let proto = if cport_end < bytes.len() && bytes[cport_end] == b'/' {
            let proto_start = cport_end + 1;
            let mut proto_end = proto_start;
            while proto_end < bytes.len()
                && (bytes[proto_end].is_ascii_alphanumeric() || bytes[proto_end] == b'_')
            {
                proto_end += 1;
            }
            if proto_end > proto_start {
                next = proto_end;
                Some(ports[proto_start..proto_end].to_string())
            } else {
                None
            }
        } else {
            None
        };

        if let (Some(host_port), Some(container_port), Some(protocol)) = (host, cport, proto) {
            if host_port > 0 && container_port > 0 {
                out.push(PortBinding {
                    container_port,
                    host_port,
                    protocol,
                    original_port: host_port,
                });
            }
        }

        at = next;
    }

    out
}
