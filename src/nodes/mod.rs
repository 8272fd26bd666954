//! Built-in node kinds.
//!
//! Control nodes steer which branches of a prompt produce values, loop
//! nodes re-enter a subgraph, and the component boundary kinds mark the
//! inputs and outputs of a component definition.

mod control;
mod io;

pub use control::LoopCondition;

use crate::registry::Registry;

pub(crate) fn install(registry: &mut Registry) {
    control::install(registry);
    io::install(registry);
}
