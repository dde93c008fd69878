//! Least-loaded peer selection.
//!
//! Tracks an in-flight download counter per peer endpoint.  The counter map
//! is reconciled with the configured peer list on every dispatch, so peers
//! removed from configuration disappear and new ones start at zero.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

#[derive(Debug, Clone, Default)]
pub struct NodeBalancer {
    counters: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl NodeBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the peer with the fewest in-flight tasks and count one more task
    /// against it.  Ties go to the lexicographically smallest endpoint.
    ///
    /// Returns `None` when `peers` is empty.  The returned slot decrements
    /// the counter again when dropped.
    pub fn distribute_node(&self, peers: &[String]) -> Option<NodeSlot> {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());

        counters.retain(|endpoint, _| peers.iter().any(|p| p == endpoint));
        for peer in peers {
            counters.entry(peer.clone()).or_insert(0);
        }

        // BTreeMap iteration is ordered and min_by_key keeps the first
        // minimum, which yields the lexicographic tie-break.
        let endpoint = counters
            .iter()
            .min_by_key(|(_, load)| **load)
            .map(|(endpoint, _)| endpoint.clone())?;

        let load = counters.entry(endpoint.clone()).or_insert(0);
        *load += 1;
        debug!(%endpoint, in_flight = *load, "dispatching to peer");

        Some(NodeSlot {
            endpoint,
            counters: Arc::clone(&self.counters),
        })
    }

    /// Decrement the counter for `endpoint`, saturating at zero.
    pub fn release_node(&self, endpoint: &str) {
        release(&self.counters, endpoint);
    }

    /// Current in-flight count for `endpoint`, if it is tracked.
    pub fn load(&self, endpoint: &str) -> Option<usize> {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(endpoint)
            .copied()
    }

    pub fn snapshot(&self) -> BTreeMap<String, usize> {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    #[cfg(test)]
    pub(crate) fn with_loads<'a>(loads: impl IntoIterator<Item = (&'a str, usize)>) -> Self {
        let counters = loads
            .into_iter()
            .map(|(endpoint, load)| (endpoint.to_string(), load))
            .collect();
        Self {
            counters: Arc::new(Mutex::new(counters)),
        }
    }
}

fn release(counters: &Mutex<BTreeMap<String, usize>>, endpoint: &str) {
    let mut counters = counters.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(load) = counters.get_mut(endpoint) {
        *load = load.saturating_sub(1);
        trace!(%endpoint, in_flight = *load, "released peer slot");
    }
}

/// One unit of in-flight work charged against a peer.
#[derive(Debug)]
#[must_use = "dropping the slot releases the peer immediately"]
pub struct NodeSlot {
    endpoint: String,
    counters: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl NodeSlot {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Drop for NodeSlot {
    fn drop(&mut self) {
        release(&self.counters, &self.endpoint);
    }
}
