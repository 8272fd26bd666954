use std::collections::BTreeMap;
use std::fmt::Write;

use console::style;
use thiserror::Error;

use crate::core::NodeId;
use crate::validate::Validation;

pub use anyhow::Error as RuntimeError;

/// Structural defects of a prompt. These are fatal to loading the prompt and
/// are reported before anything runs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Node '{node}' input '{input}' links to missing node '{target}'")]
    DanglingLink {
        node: NodeId,
        input: String,
        target: NodeId,
    },

    #[error("Node '{node}' input '{input}' links to slot {slot} of '{target}', which has {available} outputs")]
    MissingSlot {
        node: NodeId,
        input: String,
        target: NodeId,
        slot: usize,
        available: usize,
    },

    #[error("Duplicate node id '{0}'")]
    DuplicateId(NodeId),

    #[error("Node '{node}' has unknown kind '{kind}'")]
    UnknownKind { node: NodeId, kind: String },

    #[error("Cycle detected at node '{0}', cycles are only allowed through a loop feedback input")]
    Cycle(NodeId),

    #[error("Requested node '{0}' is not part of the prompt")]
    MissingNode(NodeId),
}

/// A single failed check on a node, reported by the validator.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Required input is missing: {input}")]
    MissingInput { input: String },

    #[error("Return type mismatch between linked nodes: {input}, {received} != {expected}")]
    TypeMismatch {
        input: String,
        expected: String,
        received: String,
    },

    #[error("Failed to convert an input value to a {expected} value: {input}, {value}")]
    Coercion {
        input: String,
        expected: String,
        value: String,
    },

    #[error("Value {value} smaller than min of {min}: {input}")]
    BelowMin { input: String, value: f64, min: f64 },

    #[error("Value {value} bigger than max of {max}: {input}")]
    AboveMax { input: String, value: f64, max: f64 },

    #[error("Value not in list: {input}: '{value}' not in {choices}")]
    NotInDomain {
        input: String,
        value: String,
        choices: String,
    },

    #[error("Custom validation failed for node: {message}")]
    Custom { message: String },
}

/// Cooperative cancellation signal.
///
/// Node bodies return it (usually through [`crate::NodeContext::check_interrupt`])
/// to stop the current invocation. The scheduler reports it as an
/// interruption, never as an error.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Processing interrupted")]
pub struct Interrupted;

/// A node failed while running. Carries everything a host needs to show the
/// failure next to the node that caused it.
#[derive(Debug, Error, Clone)]
#[error("Error while executing '{kind}' ({node}): {message}")]
pub struct ExecutionError {
    pub node: NodeId,
    pub kind: String,
    pub message: String,
    pub traceback: Vec<String>,
    pub inputs: BTreeMap<String, String>,
    pub outputs: BTreeMap<NodeId, Vec<Vec<String>>>,
}

impl ExecutionError {
    pub(crate) fn new(node: NodeId, kind: impl Into<String>, error: &anyhow::Error) -> Self {
        Self {
            node,
            kind: kind.into(),
            message: error.to_string(),
            traceback: error.chain().skip(1).map(|cause| cause.to_string()).collect(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Human readable report for terminals.
    pub fn render(&self) -> String {
        let mut f = String::new();
        let _ = writeln!(
            f,
            "{} {} {}",
            style("error:").red().bold(),
            style(&self.kind).bold(),
            style(format!("[{}]", self.node)).dim()
        );
        let _ = writeln!(f, "  {}", self.message);

        if !self.traceback.is_empty() {
            let _ = writeln!(f, "{}", style("traceback:").yellow());
            for line in &self.traceback {
                let _ = writeln!(f, "  {line}");
            }
        }

        if !self.inputs.is_empty() {
            let _ = writeln!(f, "{}", style("inputs:").cyan());
            for (name, value) in &self.inputs {
                let _ = writeln!(f, "  {name} = {value}");
            }
        }

        f
    }
}

/// A node inside a component failed. The error is attributed to the outer
/// node that invoked the component.
#[derive(Debug, Error, Clone)]
#[error("internal error inside component `{component}` on [{node}]:{kind}\nError: {message}\nTraceback:\n{}", .traceback.join("\n"))]
pub struct ComponentError {
    pub component: String,
    pub node: NodeId,
    pub kind: String,
    pub message: String,
    pub traceback: Vec<String>,
}

impl From<(&str, ExecutionError)> for ComponentError {
    fn from((component, inner): (&str, ExecutionError)) -> Self {
        Self {
            component: component.to_string(),
            node: inner.node,
            kind: inner.kind,
            message: inner.message,
            traceback: inner.traceback,
        }
    }
}

/// Malformed component definitions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("Component '{component}': input name '{name}' is not unique")]
    DuplicateInput { component: String, name: String },

    #[error("Component '{component}': output index {index} is not unique")]
    DuplicateOutput { component: String, index: i64 },

    #[error("Component '{component}': node '{node}' has an invalid '{field}' value")]
    Field {
        component: String,
        node: NodeId,
        field: &'static str,
    },

    #[error("Component '{component}': malformed definition: {message}")]
    Json { component: String, message: String },

    #[error("Component '{component}': invalid extra_args on node '{node}':\n{message}")]
    ExtraArgs {
        component: String,
        node: NodeId,
        message: String,
    },
}

/// Outcome of a single invocation that did not complete.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Prompt has no valid output nodes:\n{0}")]
    Invalid(Box<Validation>),

    #[error(transparent)]
    Execution(Box<ExecutionError>),

    #[error("Processing interrupted")]
    Interrupted { node: Option<NodeId> },

    #[error("Execution stalled, these nodes never became ready: {pending:?}")]
    Stalled { pending: Vec<NodeId> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_error_traceback() {
        let err = anyhow::anyhow!("root cause").context("while adding");
        let exec = ExecutionError::new(NodeId::from("4"), "Add", &err);
        assert_eq!(exec.message, "while adding");
        assert_eq!(exec.traceback, vec!["root cause".to_string()]);
        assert!(exec.render().contains("root cause"));
    }

    #[test]
    fn test_component_error_display() {
        let exec = ExecutionError::new(NodeId::from("7"), "Fail", &anyhow::anyhow!("boom"));
        let err = ComponentError::from(("Blur", exec));
        let text = err.to_string();
        assert!(text.starts_with("internal error inside component `Blur` on [7]:Fail"));
        assert!(text.contains("Error: boom"));
    }
}
