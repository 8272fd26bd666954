//! Checks a prompt against the declared schemas before anything runs.
//!
//! Validation never fails: it returns a [`Validation`] describing which sinks
//! may run and what is wrong with everything else.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use crate::core::NodeId;
use crate::engine::{DataType, Inputs, coerce};
use crate::error::{GraphError, ValidationError};
use crate::graph::{Graph, Input, Prompt};
use crate::registry::Registry;

/// Errors found on one node.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeErrors {
    pub kind: String,
    pub errors: Vec<ValidationError>,
    /// Sinks that cannot run because of this node.
    pub dependent_sinks: BTreeSet<NodeId>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Validation {
    /// At least one sink may run.
    pub ok: bool,
    pub good_sinks: Vec<NodeId>,
    pub errors: BTreeMap<NodeId, NodeErrors>,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() && self.good_sinks.is_empty() {
            return f.write_str("Prompt has no output nodes");
        }

        for (id, node) in &self.errors {
            writeln!(f, "{} [{id}]:", node.kind)?;
            for error in &node.errors {
                writeln!(f, "  - {error}")?;
            }
        }
        Ok(())
    }
}

/// Builds the graph for `prompt` and validates every sink in it.
pub fn validate_prompt(registry: &Registry, prompt: &Prompt) -> Result<Validation, GraphError> {
    let graph = Graph::new(prompt, registry)?;
    let sinks: Vec<NodeId> = graph
        .ids()
        .filter(|id| graph.schema(id).sink)
        .cloned()
        .collect();
    Ok(validate(&graph, &sinks))
}

/// Validates `sinks` and everything they depend on.
///
/// A sink is good when no node it depends on, itself included, has errors.
/// This is decided once every node is checked, so a loop feedback edge
/// cannot hide an invalid ancestor.
pub fn validate(graph: &Graph, sinks: &[NodeId]) -> Validation {
    let mut checker = Checker {
        graph,
        checked: HashSet::new(),
        errors: BTreeMap::new(),
    };
    for sink in sinks {
        checker.check(sink);
    }

    let mut errors = checker.errors;
    let mut good_sinks = Vec::new();
    for sink in sinks {
        let upstream = graph.upstream([sink]);
        let mut valid = true;
        for id in &upstream {
            if let Some(node) = errors.get_mut(id) {
                node.dependent_sinks.insert(sink.clone());
                valid = false;
            }
        }
        if valid {
            good_sinks.push(sink.clone());
        }
    }

    Validation {
        ok: !good_sinks.is_empty(),
        good_sinks,
        errors,
    }
}

struct Checker<'g, 'a> {
    graph: &'g Graph<'a>,
    checked: HashSet<NodeId>,
    errors: BTreeMap<NodeId, NodeErrors>,
}

impl Checker<'_, '_> {
    /// Records the errors of `id` and of everything it depends on.
    fn check(&mut self, id: &NodeId) {
        // also marks nodes in progress, a loop feedback edge leads back here
        if !self.checked.insert(id.clone()) {
            return;
        }

        let graph = self.graph;
        let schema = graph.schema(id);
        let record = graph.record(id);

        let mut found = Vec::new();
        let mut literals = Inputs::new();

        for spec in schema.inputs.iter().filter(|spec| !spec.is_hidden()) {
            let name: &str = &spec.name;

            match record.inputs.get(name) {
                None => {
                    if spec.is_required() && spec.constraint.default.is_none() {
                        found.push(ValidationError::MissingInput {
                            input: name.to_string(),
                        });
                    }
                }
                Some(Input::Link(link)) => {
                    let produced = &graph.schema(&link.node).outputs[link.slot].ty;
                    if !spec.ty.accepts(produced) {
                        found.push(ValidationError::TypeMismatch {
                            input: name.to_string(),
                            expected: spec.ty.to_string(),
                            received: produced.to_string(),
                        });
                        continue;
                    }
                    self.check(&link.node);
                }
                Some(Input::Literal(value)) => {
                    let Some(value) = coerce(value, &spec.ty) else {
                        found.push(ValidationError::Coercion {
                            input: name.to_string(),
                            expected: spec.ty.to_string(),
                            value: value.to_string(),
                        });
                        continue;
                    };

                    let numeric = spec.ty == DataType::INT || spec.ty == DataType::FLOAT;
                    if let Some(number) = value.as_float().filter(|_| numeric) {
                        if let Some(min) = spec.constraint.min
                            && number < min
                        {
                            found.push(ValidationError::BelowMin {
                                input: name.to_string(),
                                value: number,
                                min,
                            });
                            continue;
                        }
                        if let Some(max) = spec.constraint.max
                            && number > max
                        {
                            found.push(ValidationError::AboveMax {
                                input: name.to_string(),
                                value: number,
                                max,
                            });
                            continue;
                        }
                    }

                    if let Some(choices) = &spec.constraint.choices
                        && !choices.contains(&value)
                    {
                        let listed: Vec<String> = choices.iter().map(ToString::to_string).collect();
                        found.push(ValidationError::NotInDomain {
                            input: name.to_string(),
                            value: value.to_string(),
                            choices: format!("[{}]", listed.join(", ")),
                        });
                        continue;
                    }

                    literals.insert(name, vec![value]);
                }
            }
        }

        if found.is_empty()
            && let Err(message) = graph.kind(id).node().check(&literals)
        {
            found.push(ValidationError::Custom { message });
        }

        if !found.is_empty() {
            tracing::debug!(node = %id, "{} validation errors", found.len());
            self.errors.insert(
                id.clone(),
                NodeErrors {
                    kind: schema.name.clone(),
                    errors: found,
                    dependent_sinks: BTreeSet::new(),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeRecord;
    use crate::testing::registry;

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    #[test]
    fn test_valid_prompt() {
        let registry = registry();
        let prompt = Prompt::new()
            .with("1", NodeRecord::new("Const").literal("value", 1))
            .with("2", NodeRecord::new("AddOne").link("x", "1", 0))
            .with("3", NodeRecord::new("Record").link("value", "2", 0));

        let validation = validate_prompt(&registry, &prompt).unwrap();
        assert!(validation.ok);
        assert_eq!(validation.good_sinks, vec![id("3")]);
        assert!(validation.errors.is_empty());
    }

    #[test]
    fn test_missing_input_and_default() {
        let registry = registry();
        let prompt = Prompt::new()
            .with("1", NodeRecord::new("AddOne"))
            .with("2", NodeRecord::new("Record").link("value", "1", 0))
            // factor has a default
            .with("3", NodeRecord::new("Scale").literal("x", 2))
            .with("4", NodeRecord::new("Record").link("value", "3", 0));

        let validation = validate_prompt(&registry, &prompt).unwrap();
        assert_eq!(validation.good_sinks, vec![id("4")]);
        assert_eq!(
            validation.errors[&id("1")].errors,
            vec![ValidationError::MissingInput { input: "x".into() }]
        );
        // the sink itself has nothing wrong
        assert!(!validation.errors.contains_key(&id("2")));
        assert_eq!(
            validation.errors[&id("1")].dependent_sinks,
            BTreeSet::from([id("2")])
        );
    }

    #[test]
    fn test_type_mismatch() {
        let registry = registry();
        let prompt = Prompt::new()
            .with("1", NodeRecord::new("Whoami"))
            .with("2", NodeRecord::new("AddOne").link("x", "1", 0))
            .with("3", NodeRecord::new("Record").link("value", "2", 0));

        let validation = validate_prompt(&registry, &prompt).unwrap();
        assert!(!validation.ok);
        assert_eq!(
            validation.errors[&id("2")].errors,
            vec![ValidationError::TypeMismatch {
                input: "x".into(),
                expected: "INT".into(),
                received: "STRING".into(),
            }]
        );
    }

    #[test]
    fn test_literal_checks() {
        let registry = registry();
        let prompt = Prompt::new()
            .with("bad", NodeRecord::new("AddOne").literal("x", "abc"))
            .with("low", NodeRecord::new("LoopCounterCondition").literal("count", -1))
            .with(
                "combo",
                NodeRecord::new("ExecutionSwitch")
                    .literal("select", 9)
                    .literal("input1", 1),
            )
            .with("r1", NodeRecord::new("Record").link("value", "bad", 0))
            .with("r2", NodeRecord::new("Record").link("value", "low", 0))
            .with("r3", NodeRecord::new("Record").link("value", "combo", 0));

        let validation = validate_prompt(&registry, &prompt).unwrap();
        assert!(!validation.ok);
        assert!(matches!(
            validation.errors[&id("bad")].errors[..],
            [ValidationError::Coercion { .. }]
        ));
        assert!(matches!(
            validation.errors[&id("low")].errors[..],
            [ValidationError::BelowMin { min: 0.0, .. }]
        ));
        assert!(matches!(
            validation.errors[&id("combo")].errors[..],
            [ValidationError::AboveMax { .. }]
        ));
        assert!(validation.to_string().contains("Value -1 smaller than min of 0: count"));
    }

    #[test]
    fn test_not_in_domain_and_custom_check() {
        let mut registry = registry();
        registry
            .kind("Pick")
            .input(crate::engine::InputSpec::required("mode", DataType::STRING).choices(["a", "b"]))
            .optional("limit", DataType::INT)
            .check(|inputs| match inputs.get("limit") {
                Some(limit) if limit.as_int() == Some(13) => Err("unlucky limit".into()),
                _ => Ok(()),
            })
            .sink()
            .run(|_, _| Ok(crate::engine::Outcome::done()));

        let prompt = Prompt::new()
            .with("1", NodeRecord::new("Pick").literal("mode", "c"))
            .with("2", NodeRecord::new("Pick").literal("mode", "a").literal("limit", 13))
            .with("3", NodeRecord::new("Pick").literal("mode", "b"));

        let validation = validate_prompt(&registry, &prompt).unwrap();
        assert!(validation.ok);
        assert_eq!(validation.good_sinks, vec![id("3")]);
        assert_eq!(
            validation.errors[&id("1")].errors,
            vec![ValidationError::NotInDomain {
                input: "mode".into(),
                value: "c".into(),
                choices: "[a, b]".into(),
            }]
        );
        assert_eq!(
            validation.errors[&id("2")].errors,
            vec![ValidationError::Custom {
                message: "unlucky limit".into()
            }]
        );
    }

    #[test]
    fn test_loop_feedback_is_not_a_problem() {
        let registry = registry();
        let prompt = Prompt::new()
            .with("cond", NodeRecord::new("LoopCounterCondition").literal("count", 2))
            .with("seed", NodeRecord::new("Const").literal("value", 0))
            .with(
                "loop",
                NodeRecord::new("LoopControl")
                    .link("loop_condition", "cond", 0)
                    .link("initial_input", "seed", 0)
                    .link("loopback_input", "inc", 0),
            )
            .with("inc", NodeRecord::new("AddOne").link("x", "loop", 0))
            .with("out", NodeRecord::new("Record").link("value", "loop", 0));

        let validation = validate_prompt(&registry, &prompt).unwrap();
        assert!(validation.ok);
        assert!(validation.errors.is_empty());
    }

    #[test]
    fn test_invalid_loop_reaches_sinks_behind_feedback() {
        let registry = registry();
        let prompt = Prompt::new()
            .with("cond", NodeRecord::new("LoopCounterCondition").literal("count", -1))
            .with("seed", NodeRecord::new("Const").literal("value", 0))
            .with(
                "loop",
                NodeRecord::new("LoopControl")
                    .link("loop_condition", "cond", 0)
                    .link("initial_input", "seed", 0)
                    .link("loopback_input", "inc", 0),
            )
            .with("inc", NodeRecord::new("AddOne").link("x", "loop", 0))
            .with("out1", NodeRecord::new("Record").link("value", "loop", 0))
            .with("out2", NodeRecord::new("Record").link("value", "inc", 0));

        let validation = validate_prompt(&registry, &prompt).unwrap();
        assert!(!validation.ok);
        assert!(validation.good_sinks.is_empty());
        assert_eq!(validation.errors.keys().collect::<Vec<_>>(), vec![&id("cond")]);
        assert_eq!(
            validation.errors[&id("cond")].dependent_sinks,
            BTreeSet::from([id("out1"), id("out2")])
        );
    }

    #[test]
    fn test_no_sinks() {
        let registry = registry();
        let prompt = Prompt::new().with("1", NodeRecord::new("Const").literal("value", 1));
        let validation = validate_prompt(&registry, &prompt).unwrap();
        assert!(!validation.ok);
        assert_eq!(validation.to_string(), "Prompt has no output nodes");
    }
}
