use std::collections::{BTreeSet, HashMap};

use crate::core::{NodeId, Value};
use crate::engine::resolve::{Resolved, RunState, resolve};
use crate::engine::{NodeInfo, RunOptions};
use crate::graph::{Graph, NodeRecord};

/// Cached result of one node: one value list per output slot.
///
/// An empty slot list is a per-slot "no value"; a result without slots is
/// the node-level "no value".
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Outputs(Vec<Vec<Value>>);

impl Outputs {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn from_values(values: Vec<Option<Value>>) -> Self {
        Self(values.into_iter().map(|v| v.into_iter().collect()).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn slot(&self, index: usize) -> &[Value] {
        self.0.get(index).map(Vec::as_slice).unwrap_or_default()
    }

    /// First value of slot `index`.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.slot(index).first()
    }

    pub fn slots(&self) -> &[Vec<Value>] {
        &self.0
    }

    pub(crate) fn formatted(&self) -> Vec<Vec<String>> {
        self.0
            .iter()
            .map(|slot| slot.iter().map(ToString::to_string).collect())
            .collect()
    }
}

#[derive(Debug, Default)]
pub(crate) struct OutputCache {
    entries: HashMap<NodeId, Outputs>,
}

impl OutputCache {
    pub fn get(&self, id: &str) -> Option<&Outputs> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn insert(&mut self, id: NodeId, outputs: Outputs) -> Option<Outputs> {
        self.entries.insert(id, outputs)
    }

    pub fn remove(&mut self, id: &str) -> Option<Outputs> {
        self.entries.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Outputs)> {
        self.entries.iter()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SnapshotEntry {
    pub record: NodeRecord,
    pub signature: Option<Value>,
}

/// What each node looked like when it last ran.
#[derive(Debug, Default)]
pub(crate) struct Snapshot {
    entries: HashMap<NodeId, SnapshotEntry>,
}

impl Snapshot {
    pub fn get(&self, id: &str) -> Option<&SnapshotEntry> {
        self.entries.get(id)
    }

    pub fn insert(&mut self, id: NodeId, entry: SnapshotEntry) {
        self.entries.insert(id, entry);
    }

    pub fn remove(&mut self, id: &str) -> Option<SnapshotEntry> {
        self.entries.remove(id)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&NodeId) -> bool) {
        self.entries.retain(|id, _| keep(id));
    }
}

#[derive(Debug, Default)]
pub(crate) struct Invalidation {
    pub invalidated: BTreeSet<NodeId>,
    pub cached: BTreeSet<NodeId>,
}

/// Drops every cached output made stale by a change since the last
/// invocation.
///
/// A node is stale when it has no cached output, its change signature
/// differs from the recorded one, its bindings differ from the recorded
/// ones, or one of its producers has no cached output. Staleness then spreads
/// to everything downstream.
pub(crate) fn reconcile(
    graph: &Graph,
    cache: &mut OutputCache,
    snapshot: &mut Snapshot,
    options: &RunOptions,
) -> Invalidation {
    cache.entries.retain(|id, _| graph.contains(id));
    snapshot.retain(|id| graph.contains(id));

    let state = RunState::default();
    let mut seeds = Vec::new();

    for id in graph.ids() {
        if !cache.contains(id) {
            seeds.push(id.clone());
            continue;
        }

        let record = graph.record(id);
        let Some(entry) = snapshot.get(id) else {
            tracing::debug!(node = %id, "no snapshot, invalidating");
            seeds.push(id.clone());
            continue;
        };

        if entry.record != *record {
            tracing::debug!(node = %id, "bindings changed, invalidating");
            seeds.push(id.clone());
            continue;
        }

        if record.links().any(|(_, link)| !cache.contains(&link.node)) {
            seeds.push(id.clone());
            continue;
        }

        let info = NodeInfo {
            id,
            graph,
            options,
        };
        if let Resolved::Ready(inputs) = resolve(graph, id, cache, &state, options)
            && let Some(signature) = graph.kind(id).node().signature(&info, &inputs)
        {
            match signature {
                Ok(signature) if entry.signature.as_ref() == Some(&signature) => {}
                Ok(_) => {
                    tracing::debug!(node = %id, "change signature differs, invalidating");
                    seeds.push(id.clone());
                }
                Err(err) => {
                    tracing::warn!(node = %id, "change signature failed: {err}");
                    seeds.push(id.clone());
                }
            }
        }
    }

    let invalidated = graph.downstream_all(&seeds);
    for id in &invalidated {
        cache.remove(id);
    }

    let cached = graph
        .ids()
        .filter(|id| cache.contains(id))
        .cloned()
        .collect();

    Invalidation {
        invalidated,
        cached,
    }
}
