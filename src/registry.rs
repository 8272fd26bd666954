use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::component::{ComponentDef, ComponentNode};
use crate::core::Value;
use crate::engine::{
    CheckFn, ControlKind, DataType, FnNode, Hidden, InputSpec, Inputs, NodeContext, NodeKind,
    Outcome, OutputSpec, Schema, SignatureFn,
};
use crate::error::DefinitionError;

/// The set of node kinds a prompt may use.
///
/// Kinds are registered once, up front, and looked up by name whenever a
/// prompt is loaded. Host kinds are usually declared with the [`KindDef`]
/// builder returned by [`Registry::kind`].
///
/// # Example
///
/// ```rust
/// use subflow::{DataType, Outcome, Registry};
///
/// let mut registry = Registry::with_builtins();
/// registry
///     .kind("Add")
///     .required("a", DataType::INT)
///     .required("b", DataType::INT)
///     .output("sum", DataType::INT)
///     .run(|_, inputs| Ok(Outcome::one(inputs.int("a")? + inputs.int("b")?)));
///
/// assert!(registry.contains("Add"));
/// assert!(registry.contains("LoopControl"));
/// ```
#[derive(Default, Clone)]
pub struct Registry {
    kinds: BTreeMap<String, NodeKind>,
    components: BTreeMap<String, Arc<ComponentDef>>,
}

impl Registry {
    /// Creates an empty registry, without even the built-in kinds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in control and component boundary
    /// kinds.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::nodes::install(&mut registry);
        registry
    }

    /// Adds a kind, replacing any previous kind with the same name.
    pub fn register(&mut self, kind: NodeKind) -> Option<NodeKind> {
        self.kinds.insert(kind.name().to_string(), kind)
    }

    /// Starts declaring a closure based kind.
    pub fn kind(&mut self, name: impl Into<String>) -> KindDef<'_> {
        KindDef {
            registry: self,
            schema: Schema::new(name),
            signature: None,
            check: None,
        }
    }

    pub fn get(&self, name: &str) -> Option<&NodeKind> {
        self.kinds.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kinds.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }

    /// Registers a component as a node kind and returns the kind name.
    ///
    /// A definition with the same identity is only registered once; the
    /// existing kind is kept.
    pub fn register_component(&mut self, def: ComponentDef) -> String {
        let name = def.kind_name();
        if self.components.contains_key(&name) {
            return name;
        }

        let def = Arc::new(def);
        let schema = def.schema(self);
        let kind = NodeKind::new(schema, ComponentNode::new(def.clone()));

        tracing::info!("loaded component {name}");
        self.kinds.insert(name.clone(), kind);
        self.components.insert(name.clone(), def);
        name
    }

    /// Parses a component definition from JSON and registers it.
    pub fn load_component(&mut self, name: &str, json: &str) -> Result<String, DefinitionError> {
        let def = ComponentDef::from_json(name, json)?;
        Ok(self.register_component(def))
    }

    pub fn component(&self, kind: &str) -> Option<&ComponentDef> {
        self.components.get(kind).map(|def| &**def)
    }

    /// Inner kinds each registered component uses that are not registered
    /// (yet). Components that resolve fully are left out.
    pub fn unresolved(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.components
            .iter()
            .filter_map(|(name, def)| {
                let missing: BTreeSet<String> = def
                    .prompt()
                    .iter()
                    .map(|(_, record)| &record.kind)
                    .filter(|kind| !self.kinds.contains_key(*kind))
                    .cloned()
                    .collect();

                (!missing.is_empty()).then(|| (name.clone(), missing))
            })
            .collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("kinds", &self.kinds.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for a closure based kind, see [`Registry::kind`].
pub struct KindDef<'a> {
    registry: &'a mut Registry,
    schema: Schema,
    signature: Option<SignatureFn>,
    check: Option<CheckFn>,
}

impl<'a> KindDef<'a> {
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.schema.display_name = Some(name.into());
        self
    }

    pub fn input(mut self, spec: InputSpec) -> Self {
        self.schema.inputs.push(spec);
        self
    }

    pub fn required(self, name: impl Into<Cow<'static, str>>, ty: DataType) -> Self {
        self.input(InputSpec::required(name, ty))
    }

    pub fn optional(self, name: impl Into<Cow<'static, str>>, ty: DataType) -> Self {
        self.input(InputSpec::optional(name, ty))
    }

    pub fn hidden(self, name: impl Into<Cow<'static, str>>, hidden: Hidden) -> Self {
        self.input(InputSpec::hidden(name, hidden))
    }

    pub fn output(mut self, name: impl Into<Cow<'static, str>>, ty: DataType) -> Self {
        self.schema.outputs.push(OutputSpec {
            name: name.into(),
            ty,
        });
        self
    }

    /// Marks the kind as a sink: a side effect requested as a result.
    pub fn sink(mut self) -> Self {
        self.schema.sink = true;
        self
    }

    pub fn control(mut self, control: ControlKind) -> Self {
        self.schema.control = control;
        self
    }

    /// Sets a change signature computed from the resolved inputs.
    pub fn signature<F>(mut self, signature: F) -> Self
    where
        F: Fn(&Inputs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.signature = Some(Arc::new(signature));
        self
    }

    /// Sets a custom validation hook over the literal inputs.
    pub fn check<F>(mut self, check: F) -> Self
    where
        F: Fn(&Inputs) -> Result<(), String> + Send + Sync + 'static,
    {
        self.check = Some(Arc::new(check));
        self
    }

    /// Registers the kind with `callback` as its body.
    pub fn run<F>(self, callback: F) -> NodeKind
    where
        F: Fn(&mut NodeContext<'_>, &Inputs) -> anyhow::Result<Outcome> + Send + Sync + 'static,
    {
        let kind = NodeKind::new(
            self.schema,
            FnNode {
                callback,
                signature: self.signature,
                check: self.check,
            },
        );
        self.registry.register(kind.clone());
        kind
    }
}
