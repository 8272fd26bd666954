//! Small node kinds shared by the unit tests.

use anyhow::anyhow;
use serde_json::json;

use crate::engine::{DataType, Hidden, InputSpec, Outcome};
use crate::error::Interrupted;
use crate::registry::Registry;

/// Built-ins plus the test kinds.
pub(crate) fn registry() -> Registry {
    let mut registry = Registry::with_builtins();
    install(&mut registry);
    registry
}

pub(crate) fn install(registry: &mut Registry) {
    registry
        .kind("Const")
        .required("value", DataType::ANY)
        .output("value", DataType::ANY)
        .run(|_, inputs| Ok(Outcome::one(inputs.require("value")?.clone())));

    registry
        .kind("AddOne")
        .required("x", DataType::INT)
        .output("x", DataType::INT)
        .run(|_, inputs| Ok(Outcome::one(inputs.int("x")? + 1)));

    registry
        .kind("Sum")
        .required("a", DataType::INT)
        .required("b", DataType::INT)
        .output("sum", DataType::INT)
        .run(|_, inputs| Ok(Outcome::one(inputs.int("a")? + inputs.int("b")?)));

    registry
        .kind("Scale")
        .required("x", DataType::INT)
        .input(InputSpec::required("factor", DataType::INT).default(2))
        .output("x", DataType::INT)
        .run(|_, inputs| Ok(Outcome::one(inputs.int("x")? * inputs.int("factor")?)));

    registry
        .kind("Record")
        .required("value", DataType::ANY)
        .sink()
        .run(|_, inputs| {
            let value = inputs.require("value")?;
            Ok(Outcome::done().with_ui(json!({ "value": value.to_string() })))
        });

    registry
        .kind("Whoami")
        .hidden("id", Hidden::UniqueId)
        .hidden("extra", Hidden::ExtraInfo)
        .output("id", DataType::STRING)
        .output("extra", DataType::ANY)
        .run(|_, inputs| {
            Ok(Outcome::values([
                inputs.require("id")?.clone(),
                inputs.require("extra")?.clone(),
            ]))
        });

    registry
        .kind("Maybe")
        .optional("x", DataType::ANY)
        .output("x", DataType::ANY)
        .run(|_, inputs| Ok(Outcome::slots(vec![inputs.get("x").cloned()])));

    // Re-runs whenever its input changes, even with identical bindings.
    registry
        .kind("Volatile")
        .required("x", DataType::INT)
        .output("x", DataType::INT)
        .signature(|inputs| Ok(inputs.require("x")?.clone()))
        .run(|_, inputs| Ok(Outcome::one(inputs.int("x")?)));

    registry
        .kind("Nothing")
        .output("value", DataType::ANY)
        .run(|_, _| Ok(Outcome::NoValue));

    registry
        .kind("Fail")
        .optional("x", DataType::ANY)
        .output("x", DataType::ANY)
        .run(|_, _| Err(anyhow!("boom")));

    registry
        .kind("Panic")
        .optional("x", DataType::ANY)
        .output("x", DataType::ANY)
        .run(|_, _| panic!("kaboom"));

    registry
        .kind("Halt")
        .optional("x", DataType::ANY)
        .output("x", DataType::ANY)
        .run(|_, _| Err(Interrupted.into()));

    registry
        .kind("Twice")
        .required("x", DataType::ANY)
        .output("x", DataType::ANY)
        .run(|_, inputs| {
            let x = inputs.require("x")?.clone();
            // declares one output, returns two
            Ok(Outcome::values([x.clone(), x]))
        });

    registry
        .kind("Cancel")
        .required("x", DataType::ANY)
        .output("x", DataType::ANY)
        .run(|ctx, inputs| {
            ctx.info().options().interrupt.trigger();
            Ok(Outcome::one(inputs.require("x")?.clone()))
        });
}
