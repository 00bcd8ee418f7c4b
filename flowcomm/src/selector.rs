//! Destination selection for partition-family operators.

use std::collections::HashMap;
use std::hash::Hash;

use crate::hash::fnv1a;
use crate::types::TaskId;

/// Picks the destination of each partitioned value.
///
/// `next` may be called repeatedly for one value while its send is being
/// retried; until `commit` records the send, asking again for the same
/// source and key returns the same destination.
pub trait DestinationSelector<K>: Send {
    fn prepare(&mut self, sources: &[TaskId], destinations: &[TaskId]);

    fn next(&mut self, source: TaskId, key: &K) -> TaskId;

    fn commit(&mut self, source: TaskId, destination: TaskId);
}

/// Routes a key to `destinations[fnv1a(key) % len]`, with destinations in
/// ascending id order.
#[derive(Debug, Clone, Default)]
pub struct HashSelector {
    destinations: Vec<TaskId>,
}

impl HashSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pure form of the hash placement, for checking where a key lands.
    pub fn destination_for<K: Hash + ?Sized>(key: &K, destinations: &[TaskId]) -> Option<TaskId> {
        if destinations.is_empty() {
            return None;
        }
        let mut sorted = destinations.to_vec();
        sorted.sort_unstable();
        Some(sorted[(fnv1a(key) % sorted.len() as u64) as usize])
    }
}

impl<K: Hash> DestinationSelector<K> for HashSelector {
    fn prepare(&mut self, _sources: &[TaskId], destinations: &[TaskId]) {
        self.destinations = destinations.to_vec();
        self.destinations.sort_unstable();
    }

    /// Depends on the key alone, so a retry with another key is routed by
    /// that key.
    fn next(&mut self, _source: TaskId, key: &K) -> TaskId {
        self.destinations[(fnv1a(key) % self.destinations.len() as u64) as usize]
    }

    fn commit(&mut self, _source: TaskId, _destination: TaskId) {}
}

/// Per-source round robin over the destinations, ignoring the value.
#[derive(Debug, Clone, Default)]
pub struct LoadBalanceSelector {
    destinations: Vec<TaskId>,
    cursor: HashMap<TaskId, usize>,
    pending: HashMap<TaskId, TaskId>,
}

impl LoadBalanceSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K> DestinationSelector<K> for LoadBalanceSelector {
    fn prepare(&mut self, sources: &[TaskId], destinations: &[TaskId]) {
        self.destinations = destinations.to_vec();
        self.destinations.sort_unstable();
        self.pending.clear();
        // stagger starting points so sources do not all hit the same task first
        self.cursor = sources
            .iter()
            .enumerate()
            .map(|(i, &s)| (s, i % self.destinations.len().max(1)))
            .collect();
    }

    fn next(&mut self, source: TaskId, _key: &K) -> TaskId {
        if let Some(&d) = self.pending.get(&source) {
            return d;
        }
        let at = self.cursor.entry(source).or_insert(0);
        let d = self.destinations[*at % self.destinations.len()];
        self.pending.insert(source, d);
        d
    }

    fn commit(&mut self, source: TaskId, _destination: TaskId) {
        if self.pending.remove(&source).is_some() {
            *self.cursor.entry(source).or_insert(0) += 1;
        }
    }
}
