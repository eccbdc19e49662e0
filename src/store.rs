use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::types::{
    wall_clock_seconds, ChangeKind, MeshEvents, NodeId, Register, Snapshot, Tombstone, WriteStamp,
};

/// Replicated key/value state with last-write-wins conflict resolution.
///
/// Holds the register entries, the tombstones that shadow deleted keys, and
/// the vector clock tracking causal progress per node. Remote snapshots merge
/// deterministically: the merge is commutative and idempotent, so replicas
/// converge regardless of delivery order or duplication.
pub struct CrdtStore {
    node_id: NodeId,
    events: Arc<dyn MeshEvents>,
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    data: BTreeMap<String, Register>,
    tombstones: BTreeMap<String, Tombstone>,
    vector_clock: BTreeMap<NodeId, u64>,
    version: u64,
}

/// A single write candidate considered during merge. At equal stamps the
/// tombstone outranks the register entry.
#[derive(Clone, Copy)]
enum Candidate<'a> {
    Entry(&'a Register),
    Tomb(&'a Tombstone),
}

impl<'a> Candidate<'a> {
    fn stamp(&self) -> WriteStamp<'a> {
        match self {
            Candidate::Entry(reg) => reg.stamp(),
            Candidate::Tomb(tomb) => tomb.stamp(),
        }
    }

    fn rank(&self) -> (WriteStamp<'a>, bool) {
        (self.stamp(), matches!(self, Candidate::Tomb(_)))
    }
}

impl CrdtStore {
    pub fn new(node_id: NodeId, events: Arc<dyn MeshEvents>) -> Self {
        Self {
            node_id,
            events,
            state: Mutex::new(StoreState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().expect("store mutex poisoned")
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Write a key with the current wall-clock timestamp.
    pub fn set(&self, key: &str, value: Value) {
        let notify = {
            let mut state = self.lock();
            let entry = Register(value, wall_clock_seconds(), self.node_id.clone());
            if let Some(tomb) = state.tombstones.get(key) {
                if tomb.stamp() < entry.stamp() {
                    state.tombstones.remove(key);
                }
            }
            let value = entry.0.clone();
            state.data.insert(key.to_string(), entry);
            state.bump_local(&self.node_id);
            value
        };
        self.events
            .on_state_change(key, Some(&notify), ChangeKind::Set);
    }

    /// Delete a key by recording a tombstone.
    pub fn delete(&self, key: &str) {
        {
            let mut state = self.lock();
            let tomb = Tombstone(wall_clock_seconds(), self.node_id.clone());
            state.tombstones.insert(key.to_string(), tomb);
            state.data.remove(key);
            state.bump_local(&self.node_id);
        }
        self.events.on_state_change(key, None, ChangeKind::Delete);
    }

    /// Visible value for a key, `None` when absent or tombstoned.
    pub fn get(&self, key: &str) -> Option<Value> {
        let state = self.lock();
        state.visible(key).cloned()
    }

    /// All visible key/value pairs.
    pub fn list(&self) -> BTreeMap<String, Value> {
        let state = self.lock();
        state
            .data
            .keys()
            .filter_map(|k| state.visible(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    pub fn key_count(&self) -> usize {
        let state = self.lock();
        state.data.keys().filter(|k| state.visible(k).is_some()).count()
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    pub fn vector_clock(&self) -> BTreeMap<NodeId, u64> {
        self.lock().vector_clock.clone()
    }

    /// Serializable view of the full replica state, for sync responses.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.lock();
        Snapshot {
            data: state.data.clone(),
            tombstones: state.tombstones.clone(),
            vector_clock: state.vector_clock.clone(),
        }
    }

    /// Merge a remote snapshot, key by key, under the LWW order.
    ///
    /// Returns the number of keys whose local state changed. The vector clock
    /// merges component-wise by max; clock movement alone does not count as a
    /// mutation and does not bump the state version.
    pub fn merge(&self, remote: &Snapshot) -> usize {
        let changed = {
            let mut state = self.lock();
            let keys: BTreeSet<String> = remote
                .data
                .keys()
                .chain(remote.tombstones.keys())
                .cloned()
                .collect();

            let mut changed = Vec::new();
            for key in keys {
                if state.merge_key(&key, remote.data.get(&key), remote.tombstones.get(&key)) {
                    let value = state.visible(&key).cloned();
                    changed.push((key, value));
                }
            }

            for (node, &seq) in &remote.vector_clock {
                let local = state.vector_clock.entry(node.clone()).or_insert(0);
                if seq > *local {
                    *local = seq;
                }
            }

            if !changed.is_empty() {
                state.version += 1;
            }
            changed
        };

        if !changed.is_empty() {
            debug!(keys = changed.len(), "merged remote state");
        }
        for (key, value) in &changed {
            self.events
                .on_state_change(key, value.as_ref(), ChangeKind::Merge);
        }
        changed.len()
    }

    /// Drop tombstones older than `ttl`. Returns how many were removed.
    ///
    /// Forgetting a tombstone re-opens the window for a stale write with a
    /// later stamp to resurrect the key, so the ttl should comfortably exceed
    /// the mesh's convergence time. Never runs automatically.
    pub fn purge_tombstones(&self, ttl: Duration) -> usize {
        let cutoff = wall_clock_seconds() - ttl.as_secs_f64();
        let mut state = self.lock();
        let before = state.tombstones.len();
        state.tombstones.retain(|_, tomb| tomb.0 > cutoff);
        before - state.tombstones.len()
    }
}

impl StoreState {
    fn bump_local(&mut self, node_id: &str) {
        *self.vector_clock.entry(node_id.to_string()).or_insert(0) += 1;
        self.version += 1;
    }

    fn visible(&self, key: &str) -> Option<&Value> {
        let entry = self.data.get(key)?;
        if let Some(tomb) = self.tombstones.get(key) {
            if tomb.stamp() >= entry.stamp() {
                return None;
            }
        }
        Some(entry.value())
    }

    /// Apply the LWW rule for one key. Returns whether local state changed.
    fn merge_key(
        &mut self,
        key: &str,
        remote_entry: Option<&Register>,
        remote_tomb: Option<&Tombstone>,
    ) -> bool {
        enum Winner {
            Entry(Register),
            Tomb(Tombstone),
        }

        let winner = {
            let candidates = [
                self.data.get(key).map(Candidate::Entry),
                self.tombstones.get(key).map(Candidate::Tomb),
                remote_entry.map(Candidate::Entry),
                remote_tomb.map(Candidate::Tomb),
            ];
            candidates
                .into_iter()
                .flatten()
                .max_by(|a, b| a.rank().cmp(&b.rank()))
                .map(|best| match best {
                    Candidate::Entry(entry) => Winner::Entry(entry.clone()),
                    Candidate::Tomb(tomb) => Winner::Tomb(tomb.clone()),
                })
        };

        match winner {
            None => false,
            Some(Winner::Tomb(winner)) => {
                let mut changed = false;
                if self.tombstones.get(key) != Some(&winner) {
                    self.tombstones.insert(key.to_string(), winner.clone());
                    changed = true;
                }
                let dominated = self
                    .data
                    .get(key)
                    .is_some_and(|entry| entry.stamp() <= winner.stamp());
                if dominated {
                    self.data.remove(key);
                    changed = true;
                }
                changed
            }
            Some(Winner::Entry(winner)) => {
                let mut changed = false;
                if self.data.get(key) != Some(&winner) {
                    self.data.insert(key.to_string(), winner.clone());
                    changed = true;
                }
                let dominated = self
                    .tombstones
                    .get(key)
                    .is_some_and(|tomb| tomb.stamp() < winner.stamp());
                if dominated {
                    self.tombstones.remove(key);
                    changed = true;
                }
                changed
            }
        }
    }
}
