//! Status events published while a prompt runs.

use crate::core::NodeId;
use crate::error::ExecutionError;

#[derive(Clone, Debug)]
pub enum Event {
    Started {
        prompt_id: String,
    },
    /// Nodes whose cached outputs are reused by this invocation.
    Cached {
        nodes: Vec<NodeId>,
    },
    Progress {
        node: NodeId,
        fraction: f32,
        label: String,
    },
    NodeFinished {
        node: NodeId,
        ui: Option<serde_json::Value>,
    },
    Interrupted {
        node: Option<NodeId>,
    },
    Error(Box<ExecutionError>),
    Finished {
        prompt_id: String,
    },
}

impl Event {
    /// Node this event is attributed to, if any.
    pub fn node(&self) -> Option<&NodeId> {
        match self {
            Event::Progress { node, .. } | Event::NodeFinished { node, .. } => Some(node),
            Event::Interrupted { node } => node.as_ref(),
            Event::Error(err) => Some(&err.node),
            Event::Started { .. } | Event::Cached { .. } | Event::Finished { .. } => None,
        }
    }
}

/// Receiver of status events.
pub trait EventSink {
    fn emit(&mut self, event: Event);
}

/// Discards every event.
impl EventSink for () {
    fn emit(&mut self, _: Event) {}
}

/// Collects every event, mostly useful in tests.
impl EventSink for Vec<Event> {
    fn emit(&mut self, event: Event) {
        self.push(event);
    }
}

impl<T: EventSink + ?Sized> EventSink for &mut T {
    fn emit(&mut self, event: Event) {
        (**self).emit(event);
    }
}

/// Adapts a closure into an [`EventSink`].
pub struct FnSink<F>(pub F);

impl<F: FnMut(Event)> EventSink for FnSink<F> {
    fn emit(&mut self, event: Event) {
        (self.0)(event);
    }
}

/// Writes every event to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&mut self, event: Event) {
        match event {
            Event::Started { prompt_id } => tracing::info!(prompt = %prompt_id, "execution started"),
            Event::Cached { nodes } => tracing::info!("reusing {} cached nodes", nodes.len()),
            Event::Progress {
                node,
                fraction,
                label,
            } => tracing::debug!(node = %node, "{label} ({:.0}%)", fraction * 100.0),
            Event::NodeFinished { node, .. } => tracing::debug!(node = %node, "node finished"),
            Event::Interrupted { node } => match node {
                Some(node) => tracing::warn!(node = %node, "execution interrupted"),
                None => tracing::warn!("execution interrupted"),
            },
            Event::Error(err) => tracing::error!(node = %err.node, "{err}"),
            Event::Finished { prompt_id } => tracing::info!(prompt = %prompt_id, "execution finished"),
        }
    }
}
