mod diagnostics;

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use indicatif::ProgressStyle;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::component::ComponentStore;
use crate::core::{NodeId, Value};
use crate::engine::cache::{self, OutputCache, Outputs, Snapshot, SnapshotEntry};
use crate::engine::resolve::{self, Resolved, RunState};
use crate::engine::{Inputs, NodeContext, NodeInfo, Outcome, Schema};
use crate::error::{ExecutionError, GraphError, Interrupted, RunError};
use crate::events::{Event, EventSink};
use crate::graph::{Graph, NodeRecord, Prompt};
use crate::registry::Registry;
use crate::validate::validate_prompt;

pub use diagnostics::Report;

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Shared cancellation flag. Clones observe the same flag, so a host can keep
/// one and trigger it from elsewhere while a prompt runs.
#[derive(Clone, Debug, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-invocation settings.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Identifier echoed in `Started` and `Finished` events.
    pub prompt_id: String,
    /// Graph metadata injected into `ExtraInfo` hidden inputs.
    pub extra: serde_json::Value,
    /// Outputs to compute for nodes that run without any consumer, keyed by
    /// node id. Used by components invoked headless.
    pub used_outputs: HashMap<NodeId, BTreeSet<String>>,
    pub interrupt: Interrupt,
}

impl RunOptions {
    pub fn new(prompt_id: impl Into<String>) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            ..Default::default()
        }
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = extra;
        self
    }

    pub fn with_used_outputs<I, S>(mut self, node: impl Into<NodeId>, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.used_outputs
            .insert(node.into(), outputs.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Priority {
    Low,
    Normal,
    High,
}

/// Sinks first, loop bodies last, so a full pass over the rest of the graph
/// completes before a loop is re-entered.
fn priority(schema: &Schema) -> Priority {
    if schema.sink {
        Priority::High
    } else if schema.is_loop_body() {
        Priority::Low
    } else {
        Priority::Normal
    }
}

// Field order matters: entries compare by priority, then by insertion order.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    priority: Priority,
    seq: Reverse<u64>,
    id: NodeId,
}

/// Priority queue that accepts duplicate ids and counts them.
#[derive(Default)]
struct Worklist {
    heap: BinaryHeap<Entry>,
    counts: HashMap<NodeId, usize>,
    seq: u64,
}

impl Worklist {
    fn push(&mut self, id: NodeId, priority: Priority) {
        self.seq += 1;
        *self.counts.entry(id.clone()).or_default() += 1;
        self.heap.push(Entry {
            priority,
            seq: Reverse(self.seq),
            id,
        });
    }

    /// Next id, with the priority it was queued at.
    fn pop(&mut self) -> Option<(NodeId, Priority)> {
        let entry = self.heap.pop()?;
        if let Some(count) = self.counts.get_mut(&entry.id) {
            *count -= 1;
            if *count == 0 {
                self.counts.remove(&entry.id);
            }
        }
        Some((entry.id, entry.priority))
    }

    fn len(&self) -> usize {
        self.heap.len()
    }

    /// Number of distinct ids waiting.
    fn pending(&self) -> usize {
        self.counts.len()
    }

    fn ids(&self) -> BTreeSet<NodeId> {
        self.counts.keys().cloned().collect()
    }
}

enum Abort {
    Failed(Box<ExecutionError>),
    Interrupted(Option<NodeId>),
    Stalled(Vec<NodeId>),
}

/// Runs prompts and keeps what they computed.
///
/// One executor serves a sequence of invocations: outputs computed by one
/// invocation are reused by the next as long as nothing they depend on
/// changed.
///
/// # Example
///
/// ```rust
/// use subflow::{Executor, NodeRecord, Prompt, Registry, RunOptions};
///
/// let registry = Registry::with_builtins();
/// let prompt = Prompt::new()
///     .with("a", NodeRecord::new("InputZip").literal("input1", 1).literal("input2", 2))
///     .with("b", NodeRecord::new("InputUnzip").link("zipped_input", "a", 0));
///
/// let mut executor = Executor::new();
/// let report = executor
///     .execute(&registry, &prompt, &["b".into()], &RunOptions::new("p1"), &mut ())
///     .unwrap();
///
/// assert_eq!(report.executed.len(), 2);
/// assert_eq!(executor.value("b", 1).and_then(|v| v.as_int()), Some(2));
/// ```
#[derive(Default)]
pub struct Executor {
    cache: OutputCache,
    snapshot: Snapshot,
    ui: HashMap<NodeId, serde_json::Value>,
    pub(crate) components: ComponentStore,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached outputs of a node.
    pub fn outputs(&self, id: &str) -> Option<&Outputs> {
        self.cache.get(id)
    }

    /// First value of output `slot` of a node.
    pub fn value(&self, id: &str, slot: usize) -> Option<&Value> {
        self.cache.get(id)?.get(slot)
    }

    /// UI payload the node returned when it last ran.
    pub fn ui(&self, id: &str) -> Option<&serde_json::Value> {
        self.ui.get(id)
    }

    /// Forgets everything, including component contexts.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Validates the prompt, then runs every sink that passed validation.
    pub fn submit(
        &mut self,
        registry: &Registry,
        prompt: &Prompt,
        options: &RunOptions,
        events: &mut dyn EventSink,
    ) -> Result<Report, RunError> {
        let validation = validate_prompt(registry, prompt)?;

        if !validation.ok {
            return Err(RunError::Invalid(Box::new(validation)));
        }

        for (node, errors) in &validation.errors {
            tracing::warn!(node = %node, kind = %errors.kind, "skipping invalid node: {} errors", errors.errors.len());
        }

        self.execute(registry, prompt, &validation.good_sinks, options, events)
    }

    /// Runs everything `sinks` need that is not already cached.
    pub fn execute(
        &mut self,
        registry: &Registry,
        prompt: &Prompt,
        sinks: &[NodeId],
        options: &RunOptions,
        events: &mut dyn EventSink,
    ) -> Result<Report, RunError> {
        let graph = Graph::new(prompt, registry)?;

        if let Some(missing) = sinks.iter().find(|id| !graph.contains(id)) {
            return Err(GraphError::MissingNode(missing.clone()).into());
        }

        events.emit(Event::Started {
            prompt_id: options.prompt_id.clone(),
        });

        let invalidation = cache::reconcile(&graph, &mut self.cache, &mut self.snapshot, options);
        self.ui.retain(|id, _| self.cache.contains(id));

        if !invalidation.invalidated.is_empty() {
            tracing::debug!("invalidated {} nodes", invalidation.invalidated.len());
        }

        events.emit(Event::Cached {
            nodes: invalidation.cached.iter().cloned().collect(),
        });

        let scope: BTreeSet<NodeId> = graph
            .upstream(sinks)
            .into_iter()
            .filter(|id| !self.cache.contains(id))
            .collect();

        let mut report = Report::new(options.prompt_id.clone());
        report.cached = invalidation.cached;

        let root_span = tracing::span!(Level::INFO, "execute", prompt = %options.prompt_id);
        root_span.pb_set_length(scope.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            root_span.pb_set_style(&style.progress_chars("=>-"));
        }
        root_span.pb_set_message("Running nodes...");
        let _enter = root_span.enter();

        let mut state = RunState::default();
        let mut signatures = HashMap::new();

        let outcome = self.drive(
            &graph,
            registry,
            options,
            &scope,
            &mut state,
            &mut signatures,
            &mut report,
            events,
            &root_span,
        );

        for id in state.executed() {
            self.snapshot.insert(
                id.clone(),
                SnapshotEntry {
                    record: graph.record(id).clone(),
                    signature: signatures.remove(id),
                },
            );
        }

        let outcome = outcome.and_then(|()| {
            let missing: Vec<NodeId> = sinks
                .iter()
                .filter(|id| !self.cache.contains(id))
                .cloned()
                .collect();
            if missing.is_empty() {
                Ok(())
            } else {
                Err(Abort::Stalled(missing))
            }
        });

        self.components.retain(|id, identity| {
            prompt
                .get(id)
                .and_then(|record| registry.component(&record.kind))
                .is_some_and(|def| def.identity() == identity)
        });
        tracing::debug!("{} component contexts alive", self.components.len());

        let abort = match outcome {
            Ok(()) => {
                tracing::info!(
                    "execution finished: {} ran, {} cached",
                    report.executed.len(),
                    report.cached.len()
                );
                events.emit(Event::Finished {
                    prompt_id: options.prompt_id.clone(),
                });
                return Ok(report);
            }
            Err(abort) => abort,
        };

        // Whatever was supposed to run but did not must not look up to date
        // on the next invocation.
        for id in &scope {
            if !state.is_executed(id) {
                self.cache.remove(id);
                self.snapshot.remove(id);
                self.ui.remove(id);
            }
        }

        Err(match abort {
            Abort::Failed(err) => {
                events.emit(Event::Error(err.clone()));
                RunError::Execution(err)
            }
            Abort::Interrupted(node) => {
                tracing::warn!("execution interrupted");
                events.emit(Event::Interrupted { node: node.clone() });
                RunError::Interrupted { node }
            }
            Abort::Stalled(pending) => {
                tracing::warn!("execution stalled on {pending:?}");
                RunError::Stalled { pending }
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn drive(
        &mut self,
        graph: &Graph,
        registry: &Registry,
        options: &RunOptions,
        scope: &BTreeSet<NodeId>,
        state: &mut RunState,
        signatures: &mut HashMap<NodeId, Value>,
        report: &mut Report,
        events: &mut dyn EventSink,
        root_span: &tracing::Span,
    ) -> Result<(), Abort> {
        let mut worklist = Worklist::default();
        for id in scope {
            if resolve::is_ready(graph, id, &self.cache, state) {
                worklist.push(id.clone(), priority(graph.schema(id)));
            }
        }

        let mut completed = 0usize;
        let mut idle = 0usize;

        while let Some((id, queued_at)) = worklist.pop() {
            let iterating = state.is_executed(&id);
            if iterating && !resolve::wants_iteration(graph, &id, &self.cache, state) {
                continue;
            }

            let inputs = match resolve::resolve(graph, &id, &self.cache, state, options) {
                Resolved::Incomplete => {
                    // Every queued node was retried without any progress.
                    idle += 1;
                    if idle > worklist.len() + 1 {
                        let mut pending = worklist.ids();
                        pending.insert(id);
                        return Err(Abort::Stalled(pending.into_iter().collect()));
                    }
                    worklist.push(id, queued_at);
                    continue;
                }
                Resolved::Blocked => None,
                Resolved::Ready(inputs) => Some(inputs),
            };
            idle = 0;

            let kind = graph.kind(&id);
            let schema = kind.schema();
            let start = Instant::now();

            let (outputs, ui, ends_loop) = match inputs {
                None => {
                    tracing::debug!(node = %id, "required input has no value, skipping");
                    (Outputs::empty(), None, schema.is_loop_body())
                }
                Some(inputs) => {
                    let info = NodeInfo {
                        id: &id,
                        graph,
                        options,
                    };

                    match kind.node().signature(&info, &inputs) {
                        Some(Ok(signature)) => {
                            signatures.insert(id.clone(), signature);
                        }
                        Some(Err(err)) => {
                            tracing::warn!(node = %id, "change signature failed: {err}");
                        }
                        None => {}
                    }

                    let span = tracing::span!(Level::INFO, "node", id = %id, kind = %schema.name);
                    let result = {
                        let _enter = span.enter();
                        let mut ctx = NodeContext {
                            info,
                            iteration: state.runs(&id),
                            registry,
                            components: &mut self.components,
                            events: &mut *events,
                        };

                        // A panicking node must not take the host down with it,
                        // the node only sees its own cloned inputs.
                        match catch_unwind(AssertUnwindSafe(|| {
                            kind.node().execute(&mut ctx, &inputs)
                        })) {
                            Ok(result) => result,
                            Err(panic) => Err(anyhow!(panic_message(panic))),
                        }
                    };

                    let outcome = match result {
                        Ok(outcome) => outcome,
                        Err(err) if err.downcast_ref::<Interrupted>().is_some() => {
                            return Err(Abort::Interrupted(Some(id)));
                        }
                        Err(err) => return Err(self.failure(&id, schema, &inputs, err)),
                    };

                    match outcome {
                        Outcome::NoValue => (Outputs::empty(), None, schema.is_loop_body()),
                        Outcome::Values { outputs, ui } => {
                            if outputs.len() != schema.outputs.len() {
                                let err = anyhow!(
                                    "Node returned {} outputs, {} are declared",
                                    outputs.len(),
                                    schema.outputs.len()
                                );
                                return Err(self.failure(&id, schema, &inputs, err));
                            }
                            (Outputs::from_values(outputs), ui, false)
                        }
                    }
                }
            };

            let duration = start.elapsed();

            // A loop body without a value ends its loop. Past the first
            // iteration the consumers already hold the final results.
            if ends_loop {
                state.close(&id);
            }
            let terminal = ends_loop && iterating;

            // A new loop iteration: the body runs again from scratch.
            if iterating && !terminal {
                for node in graph.downstream(&id) {
                    if node != id && scope.contains(&node) {
                        state.reset(&node);
                        self.cache.remove(&node);
                        self.ui.remove(&node);
                    }
                }
            }

            // The last iteration's outputs stay in place when a loop ends.
            if !terminal {
                self.cache.insert(id.clone(), outputs);
            }
            match &ui {
                Some(ui) => self.ui.insert(id.clone(), ui.clone()),
                None => self.ui.remove(&id),
            };
            state.finish(&id);

            report.executed.push(id.clone());
            report
                .execution_times
                .insert(id.clone(), TaskExecution { start, duration });

            completed += 1;
            root_span.pb_inc(1);
            events.emit(Event::Progress {
                node: id.clone(),
                fraction: completed as f32 / (completed + worklist.pending()) as f32,
                label: graph.title(&id),
            });
            events.emit(Event::NodeFinished {
                node: id.clone(),
                ui,
            });

            if options.interrupt.is_set() {
                return Err(Abort::Interrupted(Some(id)));
            }

            if terminal {
                tracing::debug!(node = %id, "loop finished");
                continue;
            }

            for dependent in graph.dependents(&id) {
                if !scope.contains(&dependent) {
                    continue;
                }
                let wanted = if state.is_executed(&dependent) {
                    resolve::wants_iteration(graph, &dependent, &self.cache, state)
                } else {
                    resolve::is_ready(graph, &dependent, &self.cache, state)
                };
                if wanted {
                    let priority = priority(graph.schema(&dependent));
                    worklist.push(dependent, priority);
                }
            }
        }

        Ok(())
    }

    fn failure(&self, id: &NodeId, schema: &Schema, inputs: &Inputs, err: anyhow::Error) -> Abort {
        tracing::error!(node = %id, kind = %schema.name, "{err:#}");

        let mut failure = ExecutionError::new(id.clone(), &schema.name, &err);
        failure.inputs = inputs.formatted();
        failure.outputs = self
            .cache
            .iter()
            .map(|(node, outputs)| (node.clone(), outputs.formatted()))
            .collect();

        Abort::Failed(Box::new(failure))
    }

    /// Seeds the cached output of `id` with `value`, as if the node had
    /// produced it, and pins its snapshot so the next invocation keeps it.
    /// Returns whether the value differs from the previous one.
    pub(crate) fn inject(&mut self, id: &NodeId, record: &NodeRecord, value: Value) -> bool {
        let outputs = Outputs::from_values(vec![Some(value)]);
        let changed = self.cache.get(id) != Some(&outputs);
        if changed {
            self.cache.insert(id.clone(), outputs);
        }
        self.snapshot.insert(
            id.clone(),
            SnapshotEntry {
                record: record.clone(),
                signature: None,
            },
        );
        changed
    }

    /// Drops the cached output and snapshot of `id`, so it runs again.
    pub(crate) fn forget(&mut self, id: &NodeId) {
        self.cache.remove(id);
        self.snapshot.remove(id);
    }

    /// Drops the snapshot of `id`, forcing it and everything downstream to
    /// be recomputed on the next invocation.
    pub(crate) fn touch(&mut self, id: &NodeId) {
        self.snapshot.remove(id);
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Node panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Node panicked: {s}")
    } else {
        String::from("Node panicked with unknown payload")
    }
}
