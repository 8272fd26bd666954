#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod component;
mod core;
mod engine;
mod error;
mod events;
mod graph;
mod nodes;
mod registry;
mod utils;
mod validate;

#[cfg(test)]
mod testing;

pub use crate::component::{ComponentDef, ComponentInputDef, ComponentOutputDef, InputType};
pub use crate::core::{Hash32, NodeId, Opaque, Value};
pub use crate::engine::{
    Constraint, ControlKind, DataType, Executor, Hidden, InputSpec, Inputs, Interrupt, Node,
    NodeContext, NodeInfo, NodeKind, Outcome, OutputSpec, Outputs, Presence, Report, RunOptions,
    Schema, TaskExecution, coerce,
};
pub use crate::error::*;
pub use crate::events::{Event, EventSink, FnSink, TracingSink};
pub use crate::graph::{Graph, Input, Link, Meta, NodeRecord, Prompt};
pub use crate::nodes::LoopCondition;
pub use crate::registry::{KindDef, Registry};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
pub use crate::validate::{NodeErrors, Validation, validate, validate_prompt};
