use crate::engine::{DataType, InputSpec, Outcome};
use crate::registry::Registry;

pub(super) fn install(registry: &mut Registry) {
    // Outside a component it simply forwards its default value.
    registry
        .kind("ComponentInput")
        .required("name", DataType::STRING)
        .input(InputSpec::required("data_type", DataType::STRING).default("*"))
        .input(InputSpec::required("extra_args", DataType::STRING).default(""))
        .input(
            InputSpec::required("explicit_input_order", DataType::INT)
                .default(0)
                .min(0.0)
                .max(1000.0)
                .step(1.0),
        )
        .input(InputSpec::required("is_optional", DataType::BOOLEAN).default(false))
        .optional("default_value", DataType::ANY)
        .output("input", DataType::ANY)
        .run(|_, inputs| Ok(Outcome::slots(vec![inputs.get("default_value").cloned()])));

    registry
        .kind("ComponentOutput")
        .input(InputSpec::required("name", DataType::STRING).default(""))
        .input(InputSpec::required("data_type", DataType::STRING).default("*"))
        .input(
            InputSpec::required("index", DataType::INT)
                .default(0)
                .min(0.0)
                .max(1000.0)
                .step(1.0),
        )
        .required("value", DataType::ANY)
        .output("value", DataType::ANY)
        .run(|_, inputs| Ok(Outcome::one(inputs.require("value")?.clone())));

    registry
        .kind("ComponentMetadata")
        .input(InputSpec::required("name", DataType::STRING).default(""))
        .input(InputSpec::required("always_output", DataType::BOOLEAN).default(false))
        .run(|_, _| Ok(Outcome::done()));
}
