use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::Value;

/// Name of a value type flowing along a link, e.g. `INT` or `IMAGE`.
///
/// `*` is a wildcard that is compatible with every other type.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataType(Cow<'static, str>);

impl DataType {
    pub const ANY: DataType = DataType(Cow::Borrowed("*"));
    pub const INT: DataType = DataType(Cow::Borrowed("INT"));
    pub const FLOAT: DataType = DataType(Cow::Borrowed("FLOAT"));
    pub const STRING: DataType = DataType(Cow::Borrowed("STRING"));
    pub const BOOLEAN: DataType = DataType(Cow::Borrowed("BOOLEAN"));
    /// Enumerated string domain, see [`Constraint::choices`].
    pub const COMBO: DataType = DataType(Cow::Borrowed("COMBO"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn is_any(&self) -> bool {
        self.0 == "*"
    }

    /// Whether an input of this type may be linked to an output of type
    /// `produced`.
    pub fn accepts(&self, produced: &DataType) -> bool {
        if self.is_any() || produced.is_any() || self == produced {
            return true;
        }
        *self == DataType::COMBO && *produced == DataType::STRING
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataType({})", self.0)
    }
}

/// Declared restrictions on a literal input.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Constraint {
    pub default: Option<Value>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub step: Option<f64>,
    pub choices: Option<Vec<Value>>,
}

/// Values the engine injects instead of reading them from the prompt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hidden {
    /// The id of the node being run.
    UniqueId,
    /// The whole prompt, as a value.
    Prompt,
    /// Caller supplied graph metadata, see [`crate::RunOptions::extra`].
    ExtraInfo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    Required,
    Optional,
    Hidden(Hidden),
}

#[derive(Clone, Debug, PartialEq)]
pub struct InputSpec {
    pub name: Cow<'static, str>,
    pub ty: DataType,
    pub presence: Presence,
    pub constraint: Constraint,
}

impl InputSpec {
    pub fn required(name: impl Into<Cow<'static, str>>, ty: DataType) -> Self {
        Self {
            name: name.into(),
            ty,
            presence: Presence::Required,
            constraint: Constraint::default(),
        }
    }

    pub fn optional(name: impl Into<Cow<'static, str>>, ty: DataType) -> Self {
        Self {
            presence: Presence::Optional,
            ..Self::required(name, ty)
        }
    }

    pub fn hidden(name: impl Into<Cow<'static, str>>, hidden: Hidden) -> Self {
        Self {
            presence: Presence::Hidden(hidden),
            ..Self::required(name, DataType::ANY)
        }
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.constraint.default = Some(value.into());
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.constraint.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.constraint.max = Some(max);
        self
    }

    pub fn step(mut self, step: f64) -> Self {
        self.constraint.step = Some(step);
        self
    }

    /// Restricts the input to an enumerated domain and turns it into a
    /// `COMBO` input.
    pub fn choices<I, V>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.ty = DataType::COMBO;
        self.constraint.choices = Some(choices.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_required(&self) -> bool {
        self.presence == Presence::Required
    }

    pub fn is_hidden(&self) -> bool {
        matches!(self.presence, Presence::Hidden(_))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OutputSpec {
    pub name: Cow<'static, str>,
    pub ty: DataType,
}

/// How the readiness checker and the scheduler treat a kind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ControlKind {
    /// Ready once every linked input has been produced.
    #[default]
    Plain,
    /// Ready once any one of its linked inputs carries a value; linked
    /// inputs are alternatives.
    FirstSatisfied,
    /// Re-entered once per iteration. The `feedback` input closes the loop
    /// and is ignored on the first iteration.
    LoopBody { feedback: Cow<'static, str> },
}

/// Static description of a node kind.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Schema {
    pub name: String,
    pub display_name: Option<String>,
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<OutputSpec>,
    /// Sink kinds are pure side effects and are requested as results.
    pub sink: bool,
    pub control: ControlKind,
}

impl Schema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn input(&self, name: &str) -> Option<&InputSpec> {
        self.inputs.iter().find(|spec| spec.name == name)
    }

    pub fn title(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    pub fn is_loop_body(&self) -> bool {
        matches!(self.control, ControlKind::LoopBody { .. })
    }

    pub(crate) fn feedback(&self) -> Option<&str> {
        match &self.control {
            ControlKind::LoopBody { feedback } => Some(feedback),
            _ => None,
        }
    }
}

/// Converts a literal to the declared primitive type, `None` when it does not
/// convert. Non-primitive types accept any value unchanged.
pub fn coerce(value: &Value, ty: &DataType) -> Option<Value> {
    match ty.name() {
        "INT" => match value {
            Value::Int(_) => Some(value.clone()),
            Value::Float(f) if f.is_finite() => Some(Value::Int(f.trunc() as i64)),
            Value::Bool(b) => Some(Value::Int(i64::from(*b))),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
                    .map(Value::Int)
            }
            _ => None,
        },
        "FLOAT" => match value {
            Value::Float(_) => Some(value.clone()),
            Value::Int(i) => Some(Value::Float(*i as f64)),
            Value::String(s) => s.trim().parse::<f64>().ok().map(Value::Float),
            _ => None,
        },
        "STRING" => match value {
            Value::String(_) => Some(value.clone()),
            Value::Int(_) | Value::Float(_) | Value::Bool(_) => Some(Value::String(value.to_string())),
            _ => None,
        },
        "BOOLEAN" => match value {
            Value::Bool(_) => Some(value.clone()),
            Value::Int(i) => Some(Value::Bool(*i != 0)),
            Value::String(s) => match s.trim() {
                "true" | "True" => Some(Value::Bool(true)),
                "false" | "False" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        },
        _ => Some(value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts() {
        assert!(DataType::ANY.accepts(&DataType::INT));
        assert!(DataType::INT.accepts(&DataType::ANY));
        assert!(DataType::INT.accepts(&DataType::INT));
        assert!(!DataType::INT.accepts(&DataType::FLOAT));
        assert!(DataType::COMBO.accepts(&DataType::STRING));
        assert!(DataType::new("IMAGE").accepts(&DataType::new("IMAGE")));
    }

    #[test]
    fn test_coerce() {
        assert_eq!(coerce(&Value::from("12"), &DataType::INT), Some(Value::Int(12)));
        assert_eq!(coerce(&Value::Float(3.7), &DataType::INT), Some(Value::Int(3)));
        assert_eq!(coerce(&Value::Int(2), &DataType::FLOAT), Some(Value::Float(2.0)));
        assert_eq!(coerce(&Value::Int(2), &DataType::STRING), Some(Value::from("2")));
        assert_eq!(coerce(&Value::from("abc"), &DataType::INT), None);
        assert_eq!(coerce(&Value::List(vec![]), &DataType::FLOAT), None);
        assert_eq!(
            coerce(&Value::List(vec![]), &DataType::new("IMAGE")),
            Some(Value::List(vec![]))
        );
    }

    #[test]
    fn test_input_spec_builder() {
        let spec = InputSpec::required("mode", DataType::STRING).choices(["a", "b"]);
        assert_eq!(spec.ty, DataType::COMBO);
        assert_eq!(
            spec.constraint.choices,
            Some(vec![Value::from("a"), Value::from("b")])
        );
        assert!(spec.is_required());
        assert!(InputSpec::hidden("id", Hidden::UniqueId).is_hidden());
    }
}
