//! Free-port selection within the dynamic range.

use crate::ports::PortRange;
use crate::store::ContainerStore;
use rand::Rng;
use std::net::TcpListener;
use std::sync::Arc;
use tracing::warn;

const MAX_PROBE_ATTEMPTS: usize = 100;

/// Picks random candidates from the dynamic range until one is neither
/// tracked in the store nor bound on the host.
///
/// Random selection keeps expected cost O(1) for a few dozen containers
/// in a 55k-wide range and avoids the contention hotspots a linear scan
/// would create at the bottom of the range.
pub struct PortAllocator {
    store: Arc<ContainerStore>,
    range: PortRange,
}

impl PortAllocator {
    pub fn new(store: Arc<ContainerStore>, range: PortRange) -> Self {
        Self { store, range }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Returns a host port from the dynamic range.
    ///
    /// Up to 100 candidates are validated against the store and a TCP
    /// listen probe. If none passes, the next draw is returned unchecked;
    /// allocation degrades rather than fails.
    pub async fn allocate(&self) -> u16 {
        for _ in 0..MAX_PROBE_ATTEMPTS {
            let candidate = self.draw();
            if self.store.uses_host_port(candidate).await {
                continue;
            }
            if !probe_port(candidate) {
                continue;
            }
            return candidate;
        }

        let fallback = self.draw();
        warn!(
            "no free port found in {} after {} probes, handing out {} unchecked",
            self.range, MAX_PROBE_ATTEMPTS, fallback
        );
        fallback
    }

    fn draw(&self) -> u16 {
        let mut rng = rand::thread_rng();
        rng.gen_range(self.range.min..=self.range.max)
    }
}

/// Attempts a TCP listen on the port and releases it immediately.
pub fn probe_port(port: u16) -> bool {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(_) => false,
    }
}
