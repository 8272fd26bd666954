//! Components: prompts packaged as node kinds.
//!
//! A component definition is an ordinary prompt whose boundary is marked with
//! `ComponentInput`, `ComponentOutput` and `ComponentMetadata` nodes. Once
//! registered, every node of the component kind owns a private [`Executor`]
//! that runs the inner prompt and keeps its cache between invocations, so an
//! unchanged input never re-runs the inner nodes that depend on it.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::anyhow;

use crate::core::{Hash32, NodeId, Value};
use crate::engine::{
    Constraint, DataType, Executor, InputSpec, Inputs, Node, NodeContext, NodeInfo, Outcome,
    OutputSpec, Presence, RunOptions, Schema, coerce,
};
use crate::error::{ComponentError, DefinitionError, Interrupted, RunError};
use crate::events::{Event, EventSink};
use crate::graph::{Input, NodeRecord, Prompt};
use crate::registry::Registry;

/// Where the type of a component input comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum InputType {
    Declared { ty: DataType, constraint: Constraint },
    /// `COMBO:<kind>:<input>`: copy the declaration of an input of another kind,
    /// looked up when the component is registered.
    Borrowed { kind: String, input: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ComponentInputDef {
    pub node: NodeId,
    pub name: String,
    pub ty: InputType,
    pub order: i64,
    pub optional: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ComponentOutputDef {
    pub node: NodeId,
    pub name: String,
    pub ty: DataType,
    pub index: i64,
}

/// A component definition read from its inner prompt.
#[derive(Clone, Debug)]
pub struct ComponentDef {
    name: String,
    display_name: String,
    identity: Hash32,
    prompt: Prompt,
    inputs: Vec<ComponentInputDef>,
    outputs: Vec<ComponentOutputDef>,
    always_output: bool,
}

impl ComponentDef {
    /// Reads the boundary of `prompt`.
    ///
    /// Inputs are ordered by `(explicit_input_order, name)` and outputs by
    /// `index`; both keys must be unique.
    pub fn from_prompt(name: &str, prompt: Prompt) -> Result<Self, DefinitionError> {
        let mut display_name = name.to_string();
        let mut always_output = false;
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();

        for (id, record) in prompt.iter() {
            let fields = Fields {
                component: name,
                id,
                record,
            };

            match record.kind.as_str() {
                "ComponentMetadata" => {
                    let title = fields.string("name", Some(""))?;
                    if !title.is_empty() {
                        display_name = title;
                    }
                    always_output = fields.flag("always_output", Some(false))?;
                }
                "ComponentInput" => {
                    let data_type = fields.string("data_type", Some("*"))?;
                    let extra_args = fields.string("extra_args", Some(""))?;
                    inputs.push(ComponentInputDef {
                        node: id.clone(),
                        name: fields.string("name", None)?,
                        ty: fields.input_type(&data_type, &extra_args)?,
                        order: fields.int("explicit_input_order", Some(0))?,
                        optional: fields.flag("is_optional", Some(false))?,
                    });
                }
                "ComponentOutput" => {
                    let data_type = fields.string("data_type", Some("*"))?;
                    let label = fields.string("name", Some(""))?;
                    outputs.push(ComponentOutputDef {
                        node: id.clone(),
                        name: if label.is_empty() { data_type.clone() } else { label },
                        ty: DataType::new(data_type),
                        index: fields.int("index", Some(0))?,
                    });
                }
                _ => {}
            }
        }

        inputs.sort_by(|a, b| (a.order, &a.name).cmp(&(b.order, &b.name)));
        outputs.sort_by_key(|output| output.index);

        if let Some(pair) = inputs.windows(2).find(|pair| pair[0].name == pair[1].name) {
            return Err(DefinitionError::DuplicateInput {
                component: name.to_string(),
                name: pair[1].name.clone(),
            });
        }
        if let Some(pair) = outputs.windows(2).find(|pair| pair[0].index == pair[1].index) {
            return Err(DefinitionError::DuplicateOutput {
                component: name.to_string(),
                index: pair[1].index,
            });
        }

        let canonical = serde_json::to_string(&prompt).unwrap_or_default();

        Ok(Self {
            name: name.to_string(),
            display_name,
            identity: Hash32::hash(canonical),
            prompt,
            inputs,
            outputs,
            always_output,
        })
    }

    /// Reads a definition from JSON: either the inner prompt itself or an
    /// object carrying it under `output`.
    pub fn from_json(name: &str, json: &str) -> Result<Self, DefinitionError> {
        let error = |err: serde_json::Error| DefinitionError::Json {
            component: name.to_string(),
            message: err.to_string(),
        };

        let mut value: serde_json::Value = serde_json::from_str(json).map_err(error)?;
        let wrapped = value
            .get_mut("output")
            .filter(|inner| inner.get("class_type").is_none())
            .map(serde_json::Value::take);
        if let Some(inner) = wrapped {
            value = inner;
        }

        let prompt = serde_json::from_value(value).map_err(error)?;
        Self::from_prompt(name, prompt)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Hash of the canonical JSON form of the inner prompt.
    pub fn identity(&self) -> Hash32 {
        self.identity
    }

    /// Registered kind name, `## <name> [<hash prefix>]`.
    pub fn kind_name(&self) -> String {
        format!("## {} [{}]", self.name, &self.identity.to_hex()[..6])
    }

    pub fn prompt(&self) -> &Prompt {
        &self.prompt
    }

    pub fn inputs(&self) -> &[ComponentInputDef] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ComponentOutputDef] {
        &self.outputs
    }

    pub(crate) fn schema(&self, registry: &Registry) -> Schema {
        let inputs = self
            .inputs
            .iter()
            .map(|input| {
                let (ty, constraint) = match &input.ty {
                    InputType::Declared { ty, constraint } => (ty.clone(), constraint.clone()),
                    InputType::Borrowed { kind, input } => {
                        match registry.get(kind).and_then(|k| k.schema().input(input)) {
                            Some(spec) => (spec.ty.clone(), spec.constraint.clone()),
                            None => (
                                DataType::new(format!("Missing: '{kind}'")),
                                Constraint::default(),
                            ),
                        }
                    }
                };

                InputSpec {
                    name: Cow::Owned(input.name.clone()),
                    ty,
                    presence: if input.optional {
                        Presence::Optional
                    } else {
                        Presence::Required
                    },
                    constraint,
                }
            })
            .collect();

        let outputs = self
            .outputs
            .iter()
            .map(|output| OutputSpec {
                name: Cow::Owned(output.name.clone()),
                ty: output.ty.clone(),
            })
            .collect();

        Schema {
            name: self.kind_name(),
            display_name: Some(self.display_name.clone()),
            inputs,
            outputs,
            sink: self.always_output || self.outputs.is_empty(),
            ..Default::default()
        }
    }
}

/// Typed access to the literal fields of a boundary node.
struct Fields<'a> {
    component: &'a str,
    id: &'a NodeId,
    record: &'a NodeRecord,
}

impl Fields<'_> {
    fn invalid(&self, field: &'static str) -> DefinitionError {
        DefinitionError::Field {
            component: self.component.to_string(),
            node: self.id.clone(),
            field,
        }
    }

    fn literal(&self, field: &'static str, ty: &DataType) -> Result<Option<Value>, DefinitionError> {
        match self.record.inputs.get(field) {
            None => Ok(None),
            Some(Input::Literal(value)) => coerce(value, ty)
                .map(Some)
                .ok_or_else(|| self.invalid(field)),
            Some(Input::Link(_)) => Err(self.invalid(field)),
        }
    }

    fn string(&self, field: &'static str, default: Option<&str>) -> Result<String, DefinitionError> {
        match self.literal(field, &DataType::STRING)? {
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(self.invalid(field)),
            None => default.map(str::to_string).ok_or_else(|| self.invalid(field)),
        }
    }

    fn int(&self, field: &'static str, default: Option<i64>) -> Result<i64, DefinitionError> {
        match self.literal(field, &DataType::INT)? {
            Some(value) => value.as_int().ok_or_else(|| self.invalid(field)),
            None => default.ok_or_else(|| self.invalid(field)),
        }
    }

    fn flag(&self, field: &'static str, default: Option<bool>) -> Result<bool, DefinitionError> {
        match self.literal(field, &DataType::BOOLEAN)? {
            Some(value) => value.as_bool().ok_or_else(|| self.invalid(field)),
            None => default.ok_or_else(|| self.invalid(field)),
        }
    }

    fn input_type(&self, data_type: &str, extra_args: &str) -> Result<InputType, DefinitionError> {
        if let Some(combo) = extra_args.trim().strip_prefix("COMBO:") {
            let mut parts = combo.split(':');
            return match (parts.next(), parts.next(), parts.next()) {
                (Some(kind), Some(input), None) => Ok(InputType::Borrowed {
                    kind: kind.to_string(),
                    input: input.to_string(),
                }),
                _ => Err(self.extra_args("expected COMBO:<kind>:<input>")),
            };
        }

        let (ty, choices) = if data_type.starts_with('[') {
            let choices: Vec<Value> =
                serde_json::from_str(data_type).map_err(|_| self.invalid("data_type"))?;
            (DataType::COMBO, Some(choices))
        } else {
            (DataType::new(data_type.to_string()), None)
        };

        let body = extra_args.trim();
        let extra: serde_json::Map<String, serde_json::Value> = if body.is_empty() {
            serde_json::Map::new()
        } else {
            serde_json::from_str(&format!("{{{body}}}"))
                .map_err(|err| self.extra_args(&err.to_string()))?
        };

        let mut constraint = match ty.name() {
            "INT" => Constraint {
                default: Some(Value::Int(0)),
                min: Some(-1_000_000.0),
                max: Some(1_000_000.0),
                step: Some(1.0),
                choices: None,
            },
            "FLOAT" => Constraint {
                default: Some(Value::Float(0.0)),
                min: Some(-1_000_000.0),
                max: Some(1_000_000.0),
                step: Some(0.1),
                choices: None,
            },
            _ => Constraint::default(),
        };

        if let Some(default) = extra.get("default") {
            constraint.default = Some(Value::from(default.clone()));
        }
        for (key, slot) in [
            ("min", &mut constraint.min),
            ("max", &mut constraint.max),
            ("step", &mut constraint.step),
        ] {
            if let Some(value) = extra.get(key) {
                *slot = Some(value.as_f64().ok_or_else(|| {
                    self.extra_args(&format!("`{key}` must be a number"))
                })?);
            }
        }
        constraint.choices = choices;

        Ok(InputType::Declared { ty, constraint })
    }

    fn extra_args(&self, message: &str) -> DefinitionError {
        DefinitionError::ExtraArgs {
            component: self.component.to_string(),
            node: self.id.clone(),
            message: message.to_string(),
        }
    }
}

/// Per outer node state: the inner executor and what was injected into it.
pub(crate) struct ComponentContext {
    identity: Hash32,
    executor: Executor,
    injected: HashSet<NodeId>,
}

/// Component contexts, keyed by the id of the outer node.
#[derive(Default)]
pub(crate) struct ComponentStore {
    contexts: HashMap<NodeId, ComponentContext>,
}

impl ComponentStore {
    /// Context of `id`, recreated when it was bound to another definition.
    fn context(&mut self, id: &NodeId, identity: Hash32) -> &mut ComponentContext {
        let context = self
            .contexts
            .entry(id.clone())
            .or_insert_with(|| ComponentContext {
                identity,
                executor: Executor::new(),
                injected: HashSet::new(),
            });

        if context.identity != identity {
            tracing::debug!(node = %id, "component definition changed, dropping context");
            *context = ComponentContext {
                identity,
                executor: Executor::new(),
                injected: HashSet::new(),
            };
        }

        context
    }

    /// Keeps the contexts for which `keep(node, definition identity)` holds.
    pub fn retain(&mut self, mut keep: impl FnMut(&NodeId, Hash32) -> bool) {
        self.contexts.retain(|id, context| keep(id, context.identity));
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    #[cfg(test)]
    pub fn contains(&self, id: &str) -> bool {
        self.contexts.contains_key(id)
    }
}

static VIRTUAL_PROMPT_ID: AtomicU64 = AtomicU64::new(0);

fn virtual_prompt_id(node: &NodeId) -> String {
    let n = VIRTUAL_PROMPT_ID.fetch_add(1, Ordering::Relaxed) + 1;
    format!("wc-{node}-{n}")
}

/// Translates inner events into progress of the outer node.
struct Relay<'a> {
    node: NodeId,
    outer: &'a mut dyn EventSink,
}

impl Relay<'_> {
    fn progress(&mut self, fraction: f32, label: String) {
        self.outer.emit(Event::Progress {
            node: self.node.clone(),
            fraction,
            label,
        });
    }
}

impl EventSink for Relay<'_> {
    fn emit(&mut self, event: Event) {
        match event {
            Event::Started { .. } => self.progress(0.0, "Begin (0%)".into()),
            Event::Progress {
                fraction, label, ..
            } => {
                let percent = (fraction * 100.0) as u32;
                self.progress(fraction, format!("{label} ({percent}%)"));
            }
            Event::Finished { .. } => self.progress(1.0, "Done".into()),
            // Failures come back as the result of the inner run.
            Event::Cached { .. }
            | Event::NodeFinished { .. }
            | Event::Interrupted { .. }
            | Event::Error(_) => {}
        }
    }
}

/// Behavior of every component kind.
pub(crate) struct ComponentNode {
    def: Arc<ComponentDef>,
}

impl ComponentNode {
    pub fn new(def: Arc<ComponentDef>) -> Self {
        Self { def }
    }

    /// Which declared outputs the outer graph asks for.
    fn wanted(&self, info: &NodeInfo<'_>) -> Vec<bool> {
        let connected = info.connected_slots();
        let requested = info.requested_outputs();

        self.def
            .outputs
            .iter()
            .enumerate()
            .map(|(slot, output)| {
                connected.contains(&slot)
                    || requested.is_some_and(|names| names.contains(&output.name))
            })
            .collect()
    }
}

impl Node for ComponentNode {
    fn execute(&self, ctx: &mut NodeContext<'_>, inputs: &Inputs) -> anyhow::Result<Outcome> {
        let info = ctx.info;
        let id = info.id.clone();
        let registry = ctx.registry;
        let wanted = self.wanted(&info);

        let context = ctx.components.context(&id, self.def.identity);
        let mut prompt = self.def.prompt.clone();
        let mut changed = HashSet::new();

        for input in &self.def.inputs {
            match inputs.get(&input.name) {
                Some(value) => {
                    let Some(record) = prompt.get_mut(&input.node) else {
                        continue;
                    };
                    record.inputs.remove("default_value");
                    let record = record.clone();

                    if context.executor.inject(&input.node, &record, value.clone()) {
                        changed.insert(input.node.clone());
                    }
                    context.injected.insert(input.node.clone());
                }
                None => {
                    if context.injected.remove(&input.node) {
                        context.executor.forget(&input.node);
                        changed.insert(input.node.clone());
                    }
                }
            }
        }

        for (inner, record) in prompt.iter() {
            if record.links().any(|(_, link)| changed.contains(&link.node)) {
                context.executor.touch(inner);
            }
        }

        let mut sinks: Vec<NodeId> = self
            .def
            .outputs
            .iter()
            .zip(&wanted)
            .filter(|(_, wanted)| **wanted)
            .map(|(output, _)| output.node.clone())
            .collect();
        sinks.extend(
            prompt
                .iter()
                .filter(|(_, record)| registry.get(&record.kind).is_some_and(|k| k.schema().sink))
                .map(|(inner, _)| inner.clone()),
        );

        let options = RunOptions {
            prompt_id: virtual_prompt_id(&id),
            extra: info.options.extra.clone(),
            used_outputs: HashMap::new(),
            interrupt: info.options.interrupt.clone(),
        };

        let mut relay = Relay {
            node: id.clone(),
            outer: &mut *ctx.events,
        };

        let component = self.def.display_name.as_str();
        match context
            .executor
            .execute(registry, &prompt, &sinks, &options, &mut relay)
        {
            Ok(_) => {}
            Err(RunError::Execution(err)) => {
                tracing::error!(component, node = %err.node, "component failed");
                return Err(anyhow::Error::new(ComponentError::from((component, *err))));
            }
            Err(RunError::Interrupted { .. }) => return Err(Interrupted.into()),
            Err(err) => {
                return Err(anyhow!(err).context(format!("component `{component}` failed")));
            }
        }

        let outputs = self
            .def
            .outputs
            .iter()
            .zip(&wanted)
            .map(|(output, wanted)| {
                if !*wanted {
                    return None;
                }
                let value = context.executor.value(&output.node, 0).cloned();
                if value.is_none() {
                    tracing::warn!(component, output = %output.name, "component output has no value");
                }
                value
            })
            .collect();

        Ok(Outcome::slots(outputs))
    }

    /// Connecting another output re-runs the component.
    fn signature(&self, info: &NodeInfo<'_>, _: &Inputs) -> Option<anyhow::Result<Value>> {
        let mut parts: Vec<Value> = info
            .connected_slots()
            .into_iter()
            .map(|slot| Value::Int(slot as i64))
            .collect();

        if let Some(requested) = info.requested_outputs() {
            parts.extend(requested.iter().map(|name| Value::String(name.clone())));
        }

        Some(Ok(Value::List(parts)))
    }
}
