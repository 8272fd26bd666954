use std::collections::{HashMap, HashSet};

use crate::core::{NodeId, Value};
use crate::engine::cache::OutputCache;
use crate::engine::schema::{ControlKind, Hidden, Presence, coerce};
use crate::engine::{Inputs, RunOptions};
use crate::graph::{Graph, Input};

/// Progress of the current invocation, as seen by readiness checks.
#[derive(Debug, Default)]
pub(crate) struct RunState {
    executed: HashSet<NodeId>,
    closed: HashSet<NodeId>,
    runs: HashMap<NodeId, usize>,
    stamps: HashMap<NodeId, u64>,
    tick: u64,
}

impl RunState {
    pub fn is_executed(&self, id: &NodeId) -> bool {
        self.executed.contains(id)
    }

    pub fn executed(&self) -> &HashSet<NodeId> {
        &self.executed
    }

    /// Number of completed runs of `id` in this invocation.
    pub fn runs(&self, id: &NodeId) -> usize {
        self.runs.get(id).copied().unwrap_or(0)
    }

    fn stamp(&self, id: &NodeId) -> u64 {
        self.stamps.get(id).copied().unwrap_or(0)
    }

    pub fn finish(&mut self, id: &NodeId) {
        self.tick += 1;
        self.executed.insert(id.clone());
        *self.runs.entry(id.clone()).or_default() += 1;
        self.stamps.insert(id.clone(), self.tick);
    }

    /// Marks a loop body as done for the rest of the invocation.
    pub fn close(&mut self, id: &NodeId) {
        self.closed.insert(id.clone());
    }

    /// Forgets that `id` ran, so a loop iteration runs it again from scratch.
    pub fn reset(&mut self, id: &NodeId) {
        self.executed.remove(id);
        self.closed.remove(id);
        self.runs.remove(id);
    }
}

/// Result of resolving the inputs of one node.
#[derive(Debug, PartialEq)]
pub(crate) enum Resolved {
    Ready(Inputs),
    /// A required input carries no value; the node short-circuits to no value.
    Blocked,
    /// Some producer has not run yet.
    Incomplete,
}

pub(crate) fn is_ready(graph: &Graph, id: &NodeId, cache: &OutputCache, state: &RunState) -> bool {
    let schema = graph.schema(id);
    let record = graph.record(id);

    match &schema.control {
        ControlKind::Plain => record.links().all(|(_, link)| cache.contains(&link.node)),
        ControlKind::FirstSatisfied => {
            let mut pending = false;
            for (_, link) in record.links() {
                match cache.get(&link.node) {
                    Some(outputs) if !outputs.slot(link.slot).is_empty() => return true,
                    Some(_) => {}
                    None => pending = true,
                }
            }
            !pending
        }
        ControlKind::LoopBody { feedback } => {
            let seeded = record
                .links()
                .filter(|(name, _)| *name != &**feedback)
                .all(|(_, link)| cache.contains(&link.node));

            if !seeded {
                return false;
            }
            if state.runs(id) == 0 {
                return true;
            }
            has_fresh_feedback(graph, id, cache, state)
        }
    }
}

fn has_fresh_feedback(graph: &Graph, id: &NodeId, cache: &OutputCache, state: &RunState) -> bool {
    match graph.feedback_link(id) {
        Some(link) => cache.contains(&link.node) && state.stamp(&link.node) > state.stamp(id),
        None => false,
    }
}

/// Whether an already executed loop body should run another iteration.
pub(crate) fn wants_iteration(
    graph: &Graph,
    id: &NodeId,
    cache: &OutputCache,
    state: &RunState,
) -> bool {
    graph.schema(id).is_loop_body()
        && state.is_executed(id)
        && !state.closed.contains(id)
        && is_ready(graph, id, cache, state)
}

pub(crate) fn resolve(
    graph: &Graph,
    id: &NodeId,
    cache: &OutputCache,
    state: &RunState,
    options: &RunOptions,
) -> Resolved {
    if !is_ready(graph, id, cache, state) {
        return Resolved::Incomplete;
    }

    let schema = graph.schema(id);
    let record = graph.record(id);
    let first_iteration = state.runs(id) == 0;
    let feedback = schema.feedback();

    let mut inputs = Inputs::new();
    let mut blocked = false;

    for spec in &schema.inputs {
        let name: &str = &spec.name;

        if let Presence::Hidden(hidden) = spec.presence {
            inputs.insert(name, vec![hidden_value(hidden, id, graph, options)]);
            continue;
        }

        match record.inputs.get(name) {
            None => {
                if let Some(default) = &spec.constraint.default {
                    inputs.insert(name, vec![default.clone()]);
                }
            }
            Some(Input::Literal(value)) => {
                let value = coerce(value, &spec.ty).unwrap_or_else(|| value.clone());
                inputs.insert(name, vec![value]);
            }
            Some(Input::Link(link)) => {
                if first_iteration && feedback == Some(name) {
                    continue;
                }
                // A missing producer only gets past readiness for
                // first-satisfied alternatives, which are simply not taken.
                let Some(outputs) = cache.get(&link.node) else {
                    continue;
                };
                let slot = outputs.slot(link.slot);
                if !slot.is_empty() {
                    inputs.insert(name, slot.to_vec());
                } else if spec.is_required() && schema.control != ControlKind::FirstSatisfied {
                    blocked = true;
                }
            }
        }
    }

    if blocked {
        Resolved::Blocked
    } else {
        Resolved::Ready(inputs)
    }
}

fn hidden_value(hidden: Hidden, id: &NodeId, graph: &Graph, options: &RunOptions) -> Value {
    match hidden {
        Hidden::UniqueId => Value::String(id.to_string()),
        Hidden::Prompt => serde_json::to_value(graph.prompt())
            .map(Value::from)
            .unwrap_or_default(),
        Hidden::ExtraInfo => Value::from(options.extra.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Outputs;
    use crate::graph::{NodeRecord, Prompt};
    use crate::testing::registry;

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    #[test]
    fn test_incomplete_until_producer_cached() {
        let registry = registry();
        let prompt = Prompt::new()
            .with("1", NodeRecord::new("Const").literal("value", 2))
            .with("2", NodeRecord::new("AddOne").link("x", "1", 0));
        let graph = Graph::new(&prompt, &registry).unwrap();
        let state = RunState::default();
        let options = RunOptions::default();
        let mut cache = OutputCache::default();

        assert_eq!(
            resolve(&graph, &id("2"), &cache, &state, &options),
            Resolved::Incomplete
        );

        cache.insert(id("1"), Outputs::from_values(vec![Some(Value::Int(2))]));
        assert_eq!(
            resolve(&graph, &id("2"), &cache, &state, &options),
            Resolved::Ready(Inputs::new().with("x", 2))
        );
    }

    #[test]
    fn test_literal_coercion_and_default() {
        let registry = registry();
        let prompt = Prompt::new().with("1", NodeRecord::new("Scale").literal("x", "4"));
        let graph = Graph::new(&prompt, &registry).unwrap();
        let resolved = resolve(
            &graph,
            &id("1"),
            &OutputCache::default(),
            &RunState::default(),
            &RunOptions::default(),
        );

        let Resolved::Ready(inputs) = resolved else {
            panic!("expected ready inputs");
        };
        assert_eq!(inputs.get("x"), Some(&Value::Int(4)));
        assert_eq!(inputs.get("factor"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_hidden_inputs() {
        let registry = registry();
        let prompt = Prompt::new().with("n", NodeRecord::new("Whoami"));
        let graph = Graph::new(&prompt, &registry).unwrap();
        let options = RunOptions::default().with_extra(serde_json::json!({"workflow": "w"}));
        let resolved = resolve(
            &graph,
            &id("n"),
            &OutputCache::default(),
            &RunState::default(),
            &options,
        );

        let Resolved::Ready(inputs) = resolved else {
            panic!("expected ready inputs");
        };
        assert_eq!(inputs.string("id").unwrap(), "n");
        let Some(Value::Map(extra)) = inputs.get("extra") else {
            panic!("expected extra info map");
        };
        assert_eq!(extra["workflow"], Value::from("w"));
    }

    #[test]
    fn test_empty_slot_propagates() {
        let registry = registry();
        let prompt = Prompt::new()
            .with("1", NodeRecord::new("Const").literal("value", 2))
            .with("2", NodeRecord::new("AddOne").link("x", "1", 0))
            .with("3", NodeRecord::new("Maybe").link("x", "1", 0));
        let graph = Graph::new(&prompt, &registry).unwrap();
        let mut cache = OutputCache::default();
        cache.insert(id("1"), Outputs::empty());

        let state = RunState::default();
        let options = RunOptions::default();
        // required input with no value
        assert_eq!(
            resolve(&graph, &id("2"), &cache, &state, &options),
            Resolved::Blocked
        );
        // optional input with no value is simply absent
        assert_eq!(
            resolve(&graph, &id("3"), &cache, &state, &options),
            Resolved::Ready(Inputs::new())
        );
    }

    #[test]
    fn test_first_satisfied_readiness() {
        let registry = registry();

        let prompt = Prompt::new()
            .with("a", NodeRecord::new("Const").literal("value", 1))
            .with("b", NodeRecord::new("Const").literal("value", 2))
            .with(
                "one",
                NodeRecord::new("ExecutionOneOf")
                    .link("input1", "a", 0)
                    .link("input2", "b", 0),
            );
        let graph = Graph::new(&prompt, &registry).unwrap();
        let state = RunState::default();
        let mut cache = OutputCache::default();

        assert!(!is_ready(&graph, &id("one"), &cache, &state));

        cache.insert(id("a"), Outputs::empty());
        assert!(!is_ready(&graph, &id("one"), &cache, &state));

        cache.insert(id("b"), Outputs::from_values(vec![Some(Value::Int(2))]));
        assert!(is_ready(&graph, &id("one"), &cache, &state));

        let Resolved::Ready(inputs) =
            resolve(&graph, &id("one"), &cache, &state, &RunOptions::default())
        else {
            panic!("expected ready inputs");
        };
        assert!(!inputs.contains("input1"));
        assert_eq!(inputs.get("input2"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_loop_feedback_freshness() {
        let registry = registry();

        let prompt = Prompt::new()
            .with("cond", NodeRecord::new("LoopCounterCondition").literal("count", 3))
            .with("seed", NodeRecord::new("Const").literal("value", 0))
            .with(
                "loop",
                NodeRecord::new("LoopControl")
                    .link("loop_condition", "cond", 0)
                    .link("initial_input", "seed", 0)
                    .link("loopback_input", "inc", 0),
            )
            .with("inc", NodeRecord::new("AddOne").link("x", "loop", 0));
        let graph = Graph::new(&prompt, &registry).unwrap();
        let mut state = RunState::default();
        let mut cache = OutputCache::default();
        cache.insert(id("cond"), Outputs::from_values(vec![Some(Value::Int(0))]));
        cache.insert(id("seed"), Outputs::from_values(vec![Some(Value::Int(0))]));

        // first iteration ignores the feedback edge
        assert!(is_ready(&graph, &id("loop"), &cache, &state));
        state.finish(&id("loop"));
        assert!(!wants_iteration(&graph, &id("loop"), &cache, &state));

        cache.insert(id("inc"), Outputs::from_values(vec![Some(Value::Int(1))]));
        state.finish(&id("inc"));
        assert!(wants_iteration(&graph, &id("loop"), &cache, &state));

        state.finish(&id("loop"));
        assert!(!wants_iteration(&graph, &id("loop"), &cache, &state));
    }
}
