use std::{
    collections::{BTreeSet, HashSet},
    ops::RangeInclusive,
    sync::Arc,
};

use tokio::sync::Mutex;

/// Ports handed out for games that have not launched yet.
///
/// Ports already bound to hosted games are passed in by the caller; this
/// store only remembers its own speculative reservations.
#[derive(Debug, Clone)]
pub struct ReservedPorts {
    range: RangeInclusive<u16>,
    reserved: Arc<Mutex<BTreeSet<u16>>>,
}

impl ReservedPorts {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            reserved: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Reserves the lowest port in range that is neither bound nor reserved.
    pub async fn reserve_port(&self, bound: &HashSet<u16>) -> Option<u16> {
        let mut reserved = self.reserved.lock().await;
        let port = self
            .range
            .clone()
            .find(|p| !bound.contains(p) && !reserved.contains(p))?;
        reserved.insert(port);
        tracing::debug!(port, "reserved port");
        Some(port)
    }

    pub async fn release_port(&self, port: u16) -> bool {
        self.reserved.lock().await.remove(&port)
    }

    /// Drops every speculative reservation; bound ports are unaffected.
    pub async fn release_all_ports(&self) -> usize {
        let mut reserved = self.reserved.lock().await;
        let n = reserved.len();
        reserved.clear();
        n
    }

    #[cfg(test)]
    pub async fn reserved_ports(&self) -> Vec<u16> {
        self.reserved.lock().await.iter().copied().collect()
    }
}
