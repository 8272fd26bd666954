//! Node kinds and the machinery that runs them.
//!
//! A node kind is a [`Schema`] (its declared inputs, outputs and control
//! behavior) paired with a [`Node`] implementation. Kinds are data: the
//! built-in control nodes, closure based kinds registered through
//! [`KindDef`](crate::KindDef), and components built from a definition graph
//! all end up as the same [`NodeKind`] value in a
//! [`Registry`](crate::Registry).
//!
//! ## Execution
//!
//! The [`Executor`] owns the output cache, the change snapshot and the
//! per-node component contexts. Each call to [`Executor::execute`]:
//!
//! 1. checks the prompt structurally (see [`Graph`](crate::Graph)),
//! 2. invalidates cached outputs that a change upstream made stale,
//! 3. runs a worklist over the nodes the requested sinks still need,
//! 4. records a snapshot of what ran, for the next invocation to diff against.

mod cache;
mod node;
mod resolve;
mod runner;
mod schema;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::anyhow;

use crate::component::ComponentStore;
use crate::core::{NodeId, Value};
use crate::error::Interrupted;
use crate::events::{Event, EventSink};
use crate::graph::Graph;
use crate::registry::Registry;

pub use crate::engine::cache::Outputs;
pub(crate) use crate::engine::node::{CheckFn, FnNode, SignatureFn};
pub use crate::engine::runner::{Executor, Interrupt, Report, RunOptions, TaskExecution};
pub use crate::engine::schema::{
    Constraint, ControlKind, DataType, Hidden, InputSpec, OutputSpec, Presence, Schema, coerce,
};

/// Behavior of a node kind.
pub trait Node: Send + Sync {
    /// Runs the node on its resolved inputs.
    ///
    /// Returning [`Interrupted`] (directly or wrapped in an `anyhow::Error`)
    /// stops the invocation without reporting an error.
    fn execute(&self, ctx: &mut NodeContext<'_>, inputs: &Inputs) -> anyhow::Result<Outcome>;

    /// Optional change signature. When it differs from the value recorded at
    /// the node's last execution the node is re-run, even if none of its
    /// inputs changed. An error also forces a re-run.
    fn signature(&self, _info: &NodeInfo<'_>, _inputs: &Inputs) -> Option<anyhow::Result<Value>> {
        None
    }

    /// Optional custom validation, consulted last with the node's literal
    /// inputs only.
    fn check(&self, _literals: &Inputs) -> Result<(), String> {
        Ok(())
    }
}

/// A registered node kind: its schema and its behavior.
#[derive(Clone)]
pub struct NodeKind {
    schema: Arc<Schema>,
    node: Arc<dyn Node>,
}

impl NodeKind {
    pub fn new(schema: Schema, node: impl Node + 'static) -> Self {
        Self {
            schema: Arc::new(schema),
            node: Arc::new(node),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub(crate) fn node(&self) -> &dyn Node {
        &*self.node
    }
}

impl std::fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKind")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// What a node body returns.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// One entry per declared output slot; `None` leaves that slot empty.
    Values {
        outputs: Vec<Option<Value>>,
        ui: Option<serde_json::Value>,
    },
    /// The node produced nothing. Consumers see every slot as empty; for a
    /// loop body this ends the loop.
    NoValue,
}

impl Outcome {
    pub fn values<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Outcome::Values {
            outputs: values.into_iter().map(|v| Some(v.into())).collect(),
            ui: None,
        }
    }

    pub fn slots(outputs: Vec<Option<Value>>) -> Self {
        Outcome::Values { outputs, ui: None }
    }

    pub fn one(value: impl Into<Value>) -> Self {
        Outcome::slots(vec![Some(value.into())])
    }

    /// Result of a sink: no outputs.
    pub fn done() -> Self {
        Outcome::slots(Vec::new())
    }

    pub fn with_ui(self, payload: serde_json::Value) -> Self {
        match self {
            Outcome::Values { outputs, .. } => Outcome::Values {
                outputs,
                ui: Some(payload),
            },
            Outcome::NoValue => Outcome::NoValue,
        }
    }
}

/// Resolved inputs of a node. Absent inputs have no entry.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Inputs {
    values: BTreeMap<String, Vec<Value>>,
}

impl Inputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, vec![value.into()]);
        self
    }

    pub(crate) fn insert(&mut self, name: impl Into<String>, values: Vec<Value>) {
        self.values.insert(name.into(), values);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// First value bound to `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)?.first()
    }

    /// Every value bound to `name`, for batch shaped producers.
    pub fn list(&self, name: &str) -> &[Value] {
        self.values.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn require(&self, name: &str) -> anyhow::Result<&Value> {
        self.get(name)
            .ok_or_else(|| anyhow!("Missing input `{name}`"))
    }

    pub fn int(&self, name: &str) -> anyhow::Result<i64> {
        let value = self.require(name)?;
        value
            .as_int()
            .ok_or_else(|| anyhow!("Input `{name}` is not an INT: {value}"))
    }

    pub fn float(&self, name: &str) -> anyhow::Result<f64> {
        let value = self.require(name)?;
        value
            .as_float()
            .ok_or_else(|| anyhow!("Input `{name}` is not a FLOAT: {value}"))
    }

    pub fn string(&self, name: &str) -> anyhow::Result<&str> {
        let value = self.require(name)?;
        value
            .as_str()
            .ok_or_else(|| anyhow!("Input `{name}` is not a STRING: {value}"))
    }

    pub fn bool(&self, name: &str) -> anyhow::Result<bool> {
        let value = self.require(name)?;
        value
            .as_bool()
            .ok_or_else(|| anyhow!("Input `{name}` is not a BOOLEAN: {value}"))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Value])> {
        self.values
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub(crate) fn formatted(&self) -> BTreeMap<String, String> {
        self.iter()
            .map(|(name, values)| {
                let text = match values {
                    [single] => single.to_string(),
                    many => Value::List(many.to_vec()).to_string(),
                };
                (name.to_string(), text)
            })
            .collect()
    }
}

/// Read-only facts about the node being run.
#[derive(Clone, Copy)]
pub struct NodeInfo<'a> {
    pub(crate) id: &'a NodeId,
    pub(crate) graph: &'a Graph<'a>,
    pub(crate) options: &'a RunOptions,
}

impl<'a> NodeInfo<'a> {
    pub fn id(&self) -> &'a NodeId {
        self.id
    }

    pub fn options(&self) -> &'a RunOptions {
        self.options
    }

    /// Output slots of this node that some other node consumes.
    pub fn connected_slots(&self) -> BTreeSet<usize> {
        self.graph.connected_slots(self.id)
    }

    /// Outputs the caller asked for explicitly, for nodes run without
    /// consumers.
    pub fn requested_outputs(&self) -> Option<&'a BTreeSet<String>> {
        self.options.used_outputs.get(self.id)
    }
}

/// Everything a node body may use while it runs.
pub struct NodeContext<'a> {
    pub(crate) info: NodeInfo<'a>,
    pub(crate) iteration: usize,
    pub(crate) registry: &'a Registry,
    pub(crate) components: &'a mut ComponentStore,
    pub(crate) events: &'a mut dyn EventSink,
}

impl<'a> NodeContext<'a> {
    pub fn id(&self) -> &'a NodeId {
        self.info.id
    }

    pub fn info(&self) -> &NodeInfo<'a> {
        &self.info
    }

    /// How many times this node already ran in the current invocation.
    /// Only loop bodies ever see a value above zero.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn registry(&self) -> &'a Registry {
        self.registry
    }

    /// Reports intermediate progress of a long running node.
    pub fn progress(&mut self, fraction: f32, label: impl Into<String>) {
        self.events.emit(Event::Progress {
            node: self.info.id.clone(),
            fraction,
            label: label.into(),
        });
    }

    pub fn check_interrupt(&self) -> Result<(), Interrupted> {
        if self.info.options.interrupt.is_set() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }
}
