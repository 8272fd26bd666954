//! The prompt and the graph derived from it.
//!
//! A [`Prompt`] is what a host submits: a map from node id to a
//! [`NodeRecord`] naming the node kind and binding each input either to a
//! literal or to an output slot of another node. It deserializes from the
//! host's API format:
//!
//! ```json
//! {
//!   "1": { "class_type": "Const", "inputs": { "value": 3 } },
//!   "2": { "class_type": "Add", "inputs": { "a": ["1", 0], "b": 4 } }
//! }
//! ```
//!
//! A [`Graph`] is built per invocation from a prompt and a
//! [`Registry`](crate::Registry). Building it performs every structural check,
//! so later stages can index nodes and slots without failing.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeFiltered, EdgeRef, Reversed};
use petgraph::Direction;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::core::{NodeId, Value};
use crate::engine::{NodeKind, Schema};
use crate::error::GraphError;
use crate::registry::Registry;

/// Reference to output slot `slot` of node `node`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Link {
    pub node: NodeId,
    pub slot: usize,
}

impl Link {
    pub fn new(node: impl Into<NodeId>, slot: usize) -> Self {
        Self {
            node: node.into(),
            slot,
        }
    }
}

/// Binding of a single input.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(from = "serde_json::Value")]
pub enum Input {
    Literal(Value),
    Link(Link),
}

impl Input {
    pub fn as_link(&self) -> Option<&Link> {
        match self {
            Input::Link(link) => Some(link),
            Input::Literal(_) => None,
        }
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            Input::Literal(value) => Some(value),
            Input::Link(_) => None,
        }
    }
}

impl From<serde_json::Value> for Input {
    fn from(value: serde_json::Value) -> Self {
        if let serde_json::Value::Array(items) = &value
            && let [serde_json::Value::String(node), slot] = items.as_slice()
            && let Some(slot) = slot.as_u64()
        {
            return Input::Link(Link::new(node.as_str(), slot as usize));
        }
        Input::Literal(Value::from(value))
    }
}

impl From<Link> for Input {
    fn from(link: Link) -> Self {
        Input::Link(link)
    }
}

impl Serialize for Input {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Input::Literal(value) => value.serialize(serializer),
            Input::Link(link) => {
                let mut tuple = serializer.serialize_tuple(2)?;
                tuple.serialize_element(&link.node)?;
                tuple.serialize_element(&link.slot)?;
                tuple.end()
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// One node of a prompt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    #[serde(rename = "class_type")]
    pub kind: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, Input>,
    #[serde(default, rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

impl NodeRecord {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            inputs: BTreeMap::new(),
            meta: None,
        }
    }

    pub fn literal(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs
            .insert(name.into(), Input::Literal(value.into()));
        self
    }

    pub fn link(mut self, name: impl Into<String>, node: impl Into<NodeId>, slot: usize) -> Self {
        self.inputs
            .insert(name.into(), Input::Link(Link::new(node, slot)));
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.meta = Some(Meta {
            title: Some(title.into()),
        });
        self
    }

    pub fn display_title(&self) -> Option<&str> {
        self.meta.as_ref()?.title.as_deref()
    }

    /// Linked inputs, in input name order.
    pub fn links(&self) -> impl Iterator<Item = (&str, &Link)> {
        self.inputs
            .iter()
            .filter_map(|(name, input)| Some((name.as_str(), input.as_link()?)))
    }
}

/// A node graph submitted for execution.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Prompt {
    nodes: BTreeMap<NodeId, NodeRecord>,
}

impl Prompt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn insert(&mut self, id: impl Into<NodeId>, record: NodeRecord) -> Result<(), GraphError> {
        let id = id.into();
        if self.nodes.contains_key(&id) {
            return Err(GraphError::DuplicateId(id));
        }
        self.nodes.insert(id, record);
        Ok(())
    }

    /// Builder form of [`Prompt::insert`] that replaces an existing node.
    pub fn with(mut self, id: impl Into<NodeId>, record: NodeRecord) -> Self {
        self.nodes.insert(id.into(), record);
        self
    }

    pub fn get(&self, id: &str) -> Option<&NodeRecord> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut NodeRecord> {
        self.nodes.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<NodeRecord> {
        self.nodes.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &NodeRecord)> {
        self.nodes.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl<'de> Deserialize<'de> for Prompt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PromptVisitor;

        impl<'de> Visitor<'de> for PromptVisitor {
            type Value = Prompt;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of node ids to node records")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Prompt, A::Error> {
                let mut prompt = Prompt::new();
                while let Some((id, record)) = map.next_entry::<NodeId, NodeRecord>()? {
                    prompt
                        .insert(id, record)
                        .map_err(serde::de::Error::custom)?;
                }
                Ok(prompt)
            }
        }

        deserializer.deserialize_map(PromptVisitor)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Edge {
    pub input: String,
    pub slot: usize,
    pub feedback: bool,
}

/// A structurally checked view of a prompt.
pub struct Graph<'a> {
    prompt: &'a Prompt,
    kinds: HashMap<NodeId, NodeKind>,
    graph: DiGraph<NodeId, Edge>,
    indices: HashMap<NodeId, NodeIndex>,
}

impl<'a> Graph<'a> {
    pub fn new(prompt: &'a Prompt, registry: &Registry) -> Result<Self, GraphError> {
        let mut kinds = HashMap::with_capacity(prompt.len());
        let mut graph = DiGraph::with_capacity(prompt.len(), prompt.len());
        let mut indices = HashMap::with_capacity(prompt.len());

        for (id, record) in prompt.iter() {
            let kind = registry
                .get(&record.kind)
                .ok_or_else(|| GraphError::UnknownKind {
                    node: id.clone(),
                    kind: record.kind.clone(),
                })?;
            kinds.insert(id.clone(), kind.clone());
            indices.insert(id.clone(), graph.add_node(id.clone()));
        }

        for (id, record) in prompt.iter() {
            let feedback = kinds[id].schema().feedback();
            for (input, link) in record.links() {
                let Some(&source) = indices.get(&link.node) else {
                    return Err(GraphError::DanglingLink {
                        node: id.clone(),
                        input: input.to_string(),
                        target: link.node.clone(),
                    });
                };

                let available = kinds[&link.node].schema().outputs.len();
                if link.slot >= available {
                    return Err(GraphError::MissingSlot {
                        node: id.clone(),
                        input: input.to_string(),
                        target: link.node.clone(),
                        slot: link.slot,
                        available,
                    });
                }

                graph.add_edge(
                    source,
                    indices[id],
                    Edge {
                        input: input.to_string(),
                        slot: link.slot,
                        feedback: feedback == Some(input),
                    },
                );
            }
        }

        // Loops close through feedback inputs only, anything else is a cycle.
        let forward = EdgeFiltered::from_fn(&graph, |edge| !edge.weight().feedback);
        if let Err(cycle) = toposort(&forward, None) {
            return Err(GraphError::Cycle(graph[cycle.node_id()].clone()));
        }

        Ok(Self {
            prompt,
            kinds,
            graph,
            indices,
        })
    }

    pub fn prompt(&self) -> &'a Prompt {
        self.prompt
    }

    pub fn contains(&self, id: &str) -> bool {
        self.indices.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.prompt.ids()
    }

    pub fn record(&self, id: &NodeId) -> &'a NodeRecord {
        &self.prompt.nodes[id]
    }

    pub fn kind(&self, id: &NodeId) -> &NodeKind {
        &self.kinds[id]
    }

    pub fn schema(&self, id: &NodeId) -> &Schema {
        self.kinds[id].schema()
    }

    /// Human facing name of a node: its title if set, else its kind.
    pub fn title(&self, id: &NodeId) -> String {
        let record = self.record(id);
        match record.display_title() {
            Some(title) => title.to_string(),
            None => self.schema(id).title().to_string(),
        }
    }

    /// Consumers of any output of `id`, sorted and without duplicates.
    pub fn dependents(&self, id: &NodeId) -> Vec<NodeId> {
        let Some(&index) = self.indices.get(id) else {
            return Vec::new();
        };
        let set: BTreeSet<NodeId> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .map(|n| self.graph[n].clone())
            .collect();
        set.into_iter().collect()
    }

    /// Output slots of `id` that at least one other node links to.
    pub fn connected_slots(&self, id: &NodeId) -> BTreeSet<usize> {
        let Some(&index) = self.indices.get(id) else {
            return BTreeSet::new();
        };
        self.graph
            .edges_directed(index, Direction::Outgoing)
            .map(|edge| edge.weight().slot)
            .collect()
    }

    /// The producer feeding the loop feedback input of `id`, if any.
    pub fn feedback_link(&self, id: &NodeId) -> Option<&'a Link> {
        let feedback = self.schema(id).feedback()?;
        self.record(id).inputs.get(feedback)?.as_link()
    }

    /// Every node reachable from `start` by following links forward,
    /// `start` included.
    pub fn downstream(&self, start: &NodeId) -> BTreeSet<NodeId> {
        self.downstream_all([start])
    }

    /// Forward closure of all `starts` in one walk. A node reached from one
    /// start is not walked again from another.
    pub fn downstream_all<'i>(&self, starts: impl IntoIterator<Item = &'i NodeId>) -> BTreeSet<NodeId> {
        let mut dfs = Dfs::empty(&self.graph);
        let mut reached = BTreeSet::new();

        for start in starts {
            let Some(&index) = self.indices.get(start) else {
                continue;
            };
            if dfs.discovered.contains(index.index()) {
                continue;
            }
            dfs.move_to(index);
            while let Some(nx) = dfs.next(&self.graph) {
                reached.insert(self.graph[nx].clone());
            }
        }

        reached
    }

    /// Every node `targets` depend on, directly or not, `targets` included.
    pub fn upstream<'i>(&self, targets: impl IntoIterator<Item = &'i NodeId>) -> BTreeSet<NodeId> {
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::empty(reversed);
        let mut reached = BTreeSet::new();

        for target in targets {
            let Some(&index) = self.indices.get(target) else {
                continue;
            };
            dfs.move_to(index);
            while let Some(nx) = dfs.next(reversed) {
                reached.insert(self.graph[nx].clone());
            }
        }

        reached
    }

    pub(crate) fn edges(&self) -> impl Iterator<Item = (&NodeId, &NodeId, &Edge)> {
        self.graph.edge_references().map(|edge| {
            (
                &self.graph[edge.source()],
                &self.graph[edge.target()],
                edge.weight(),
            )
        })
    }
}
