use anyhow::{anyhow, bail};

use crate::core::Value;
use crate::engine::{ControlKind, DataType, InputSpec, Outcome};
use crate::registry::Registry;

const ALTERNATIVES: [&str; 5] = ["input1", "input2", "input3", "input4", "input5"];
const SWITCHED: [&str; 5] = ["input1", "input2_opt", "input3_opt", "input4_opt", "input5_opt"];

/// Bound of a counted loop, produced by `LoopCounterCondition`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopCondition {
    pub count: i64,
}

impl LoopCondition {
    /// Value emitted on iteration `iteration`, or `None` once the loop is
    /// done. The first iteration takes the initial value, later ones the
    /// feedback.
    pub fn next<'v>(&self, iteration: usize, initial: &'v Value, feedback: Option<&'v Value>) -> Option<&'v Value> {
        let iteration = i64::try_from(iteration).unwrap_or(i64::MAX);
        if iteration >= self.count {
            None
        } else if iteration == 0 {
            Some(initial)
        } else {
            feedback
        }
    }
}

fn zip_type() -> DataType {
    DataType::new("ZIP")
}

fn loop_condition_type() -> DataType {
    DataType::new("LOOP_CONDITION")
}

pub(super) fn install(registry: &mut Registry) {
    let mut one_of = registry
        .kind("ExecutionOneOf")
        .control(ControlKind::FirstSatisfied)
        .required("input1", DataType::ANY);
    for name in &ALTERNATIVES[1..] {
        one_of = one_of.optional(*name, DataType::ANY);
    }
    one_of
        .output("output", DataType::ANY)
        .run(|_, inputs| {
            Ok(ALTERNATIVES
                .iter()
                .find_map(|name| inputs.get(name))
                .map_or(Outcome::NoValue, |value| Outcome::one(value.clone())))
        });

    let mut switch = registry
        .kind("ExecutionSwitch")
        .input(InputSpec::required("select", DataType::INT).default(1).min(0.0).max(5.0))
        .required("input1", DataType::ANY);
    for name in &SWITCHED[1..] {
        switch = switch.optional(*name, DataType::ANY);
    }
    for name in ["output1", "output2", "output3", "output4", "output5"] {
        switch = switch.output(name, DataType::ANY);
    }
    switch.run(|_, inputs| {
        let select = inputs.int("select")?;
        let outputs = SWITCHED
            .iter()
            .zip(1..)
            .map(|(name, slot)| (slot == select).then(|| inputs.get(name).cloned()).flatten())
            .collect();
        Ok(Outcome::slots(outputs))
    });

    registry
        .kind("ExecutionControlString")
        .input(InputSpec::required("A", DataType::STRING).default(""))
        .required("B_STR", DataType::ANY)
        .input(
            InputSpec::required("condition_kind", DataType::COMBO)
                .choices(["A = B", "A != B", "A in B", "A not in B"]),
        )
        .required("pass_value", DataType::ANY)
        .output("pass_value", DataType::ANY)
        .run(|_, inputs| {
            let a = inputs.string("A")?;
            let b = inputs.require("B_STR")?;
            let pass = match inputs.string("condition_kind")? {
                "A = B" => b.as_str() == Some(a),
                "A != B" => b.as_str() != Some(a),
                "A in B" => contains(b, a),
                "A not in B" => !contains(b, a),
                other => bail!("Unknown condition kind `{other}`"),
            };

            if pass {
                Ok(Outcome::one(inputs.require("pass_value")?.clone()))
            } else {
                Ok(Outcome::NoValue)
            }
        });

    registry
        .kind("LoopCounterCondition")
        .input(
            InputSpec::required("count", DataType::INT)
                .default(1)
                .min(0.0)
                .max(9_999_999.0)
                .step(1.0),
        )
        // Toggled by hosts to force a fresh condition.
        .input(InputSpec::required("trigger", DataType::COMBO).choices(["A", "B"]).default("A"))
        .output("condition", loop_condition_type())
        .run(|_, inputs| {
            let count = inputs.int("count")?;
            Ok(Outcome::one(Value::opaque(LoopCondition { count })))
        });

    registry
        .kind("LoopControl")
        .control(ControlKind::LoopBody {
            feedback: "loopback_input".into(),
        })
        .required("loop_condition", loop_condition_type())
        .required("initial_input", DataType::ANY)
        .required("loopback_input", DataType::ANY)
        .output("output", DataType::ANY)
        .run(|ctx, inputs| {
            let condition = inputs
                .require("loop_condition")?
                .downcast_ref::<LoopCondition>()
                .ok_or_else(|| anyhow!("Input `loop_condition` is not a LOOP_CONDITION"))?;
            let initial = inputs.require("initial_input")?;

            tracing::debug!(node = %ctx.id(), "loop iteration {}/{}", ctx.iteration(), condition.count);

            Ok(
                match condition.next(ctx.iteration(), initial, inputs.get("loopback_input")) {
                    Some(value) => Outcome::one(value.clone()),
                    None => Outcome::NoValue,
                },
            )
        });

    registry
        .kind("InputZip")
        .required("input1", DataType::ANY)
        .required("input2", DataType::ANY)
        .output("zipped", zip_type())
        .run(|_, inputs| {
            let pair = vec![
                inputs.require("input1")?.clone(),
                inputs.require("input2")?.clone(),
            ];
            Ok(Outcome::one(Value::List(pair)))
        });

    registry
        .kind("InputUnzip")
        .required("zipped_input", zip_type())
        .output("output1", DataType::ANY)
        .output("output2", DataType::ANY)
        .run(|_, inputs| match inputs.require("zipped_input")?.as_list() {
            Some([first, second]) => Ok(Outcome::values([first.clone(), second.clone()])),
            _ => bail!("Input `zipped_input` is not a pair"),
        });
}

fn contains(haystack: &Value, needle: &str) -> bool {
    match haystack {
        Value::String(s) => s.contains(needle),
        Value::List(items) => items.iter().any(|item| item.as_str() == Some(needle)),
        Value::Map(map) => map.contains_key(needle),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeId;
    use crate::engine::{Executor, Report, RunOptions};
    use crate::graph::{NodeRecord, Prompt};
    use crate::testing::registry;

    fn run(prompt: &Prompt, sinks: &[&str]) -> (Executor, Report) {
        let registry = registry();
        let sinks: Vec<NodeId> = sinks.iter().map(|s| NodeId::from(*s)).collect();
        let mut executor = Executor::new();
        let report = executor
            .execute(&registry, prompt, &sinks, &RunOptions::new("test"), &mut ())
            .unwrap();
        (executor, report)
    }

    fn counted(count: i64) -> Prompt {
        Prompt::new()
            .with("cond", NodeRecord::new("LoopCounterCondition").literal("count", count))
            .with("seed", NodeRecord::new("Const").literal("value", 0))
            .with(
                "loop",
                NodeRecord::new("LoopControl")
                    .link("loop_condition", "cond", 0)
                    .link("initial_input", "seed", 0)
                    .link("loopback_input", "inc", 0),
            )
            .with("inc", NodeRecord::new("AddOne").link("x", "loop", 0))
            .with("out", NodeRecord::new("Record").link("value", "inc", 0))
    }

    #[test]
    fn test_loop_condition_next() {
        let condition = LoopCondition { count: 2 };
        let initial = Value::Int(0);
        let feedback = Value::Int(5);
        assert_eq!(condition.next(0, &initial, Some(&feedback)), Some(&initial));
        assert_eq!(condition.next(1, &initial, Some(&feedback)), Some(&feedback));
        assert_eq!(condition.next(2, &initial, Some(&feedback)), None);
        assert_eq!(LoopCondition { count: 0 }.next(0, &initial, None), None);
    }

    #[test]
    fn test_loop_runs_body_n_times() {
        for count in [1, 3, 5] {
            let (executor, report) = run(&counted(count), &["out"]);
            assert_eq!(report.runs("inc"), count as usize);
            assert_eq!(report.runs("loop"), count as usize + 1);
            assert_eq!(executor.value("out", 0), None);
            assert_eq!(
                executor.ui("out"),
                Some(&serde_json::json!({ "value": count.to_string() }))
            );
        }
    }

    #[test]
    fn test_loop_with_zero_count() {
        let (executor, report) = run(&counted(0), &["out"]);
        assert_eq!(report.runs("loop"), 1);
        assert!(executor.outputs("loop").unwrap().is_empty());
        // the body is blocked, not run
        assert!(executor.outputs("inc").unwrap().is_empty());
        assert!(report.ran("out"));
    }

    #[test]
    fn test_loop_is_cached_afterwards() {
        let registry = registry();
        let mut executor = Executor::new();
        let options = RunOptions::new("test");
        let sinks = [NodeId::from("out")];

        executor.execute(&registry, &counted(3), &sinks, &options, &mut ()).unwrap();
        let again = executor.execute(&registry, &counted(3), &sinks, &options, &mut ()).unwrap();
        assert!(again.executed.is_empty());

        let changed = executor.execute(&registry, &counted(4), &sinks, &options, &mut ()).unwrap();
        assert_eq!(changed.runs("inc"), 4);
        assert!(!changed.ran("seed"));
    }

    #[test]
    fn test_zip_shares_one_feedback_edge() {
        // carries (counter, total) around the loop: total = 1 + 2 + 3
        let prompt = Prompt::new()
            .with("cond", NodeRecord::new("LoopCounterCondition").literal("count", 3))
            .with("zero", NodeRecord::new("Const").literal("value", 0))
            .with(
                "seed",
                NodeRecord::new("InputZip").link("input1", "zero", 0).link("input2", "zero", 0),
            )
            .with(
                "loop",
                NodeRecord::new("LoopControl")
                    .link("loop_condition", "cond", 0)
                    .link("initial_input", "seed", 0)
                    .link("loopback_input", "next", 0),
            )
            .with("unzip", NodeRecord::new("InputUnzip").link("zipped_input", "loop", 0))
            .with("count", NodeRecord::new("AddOne").link("x", "unzip", 0))
            .with(
                "total",
                NodeRecord::new("Sum").link("a", "unzip", 1).link("b", "count", 0),
            )
            .with(
                "next",
                NodeRecord::new("InputZip").link("input1", "count", 0).link("input2", "total", 0),
            )
            .with("out", NodeRecord::new("Record").link("value", "total", 0));

        let (executor, report) = run(&prompt, &["out"]);
        assert_eq!(report.runs("total"), 3);
        assert_eq!(executor.value("total", 0), Some(&Value::Int(6)));
    }

    #[test]
    fn test_one_of_takes_first_present() {
        let prompt = Prompt::new()
            .with("a", NodeRecord::new("Nothing"))
            .with("b", NodeRecord::new("Const").literal("value", "second"))
            .with("c", NodeRecord::new("Nothing"))
            .with(
                "one",
                NodeRecord::new("ExecutionOneOf")
                    .link("input1", "a", 0)
                    .link("input2", "b", 0)
                    .link("input3", "c", 0),
            )
            .with("out", NodeRecord::new("Record").link("value", "one", 0));

        let (executor, _) = run(&prompt, &["out"]);
        assert_eq!(executor.value("one", 0), Some(&Value::from("second")));
    }

    #[test]
    fn test_one_of_without_values() {
        let prompt = Prompt::new()
            .with("a", NodeRecord::new("Nothing"))
            .with("one", NodeRecord::new("ExecutionOneOf").link("input1", "a", 0))
            .with("out", NodeRecord::new("Record").link("value", "one", 0));

        let (executor, report) = run(&prompt, &["out"]);
        assert!(executor.outputs("one").unwrap().is_empty());
        // blocked on the missing value
        assert!(executor.ui("out").is_none());
        assert!(report.ran("out"));
    }

    #[test]
    fn test_switch_selects_one_slot() {
        let prompt = Prompt::new()
            .with("x", NodeRecord::new("Const").literal("value", 1))
            .with("y", NodeRecord::new("Const").literal("value", 2))
            .with(
                "sw",
                NodeRecord::new("ExecutionSwitch")
                    .literal("select", 2)
                    .link("input1", "x", 0)
                    .link("input2_opt", "y", 0),
            )
            .with("r1", NodeRecord::new("Record").link("value", "sw", 0))
            .with("r2", NodeRecord::new("Record").link("value", "sw", 1));

        let (executor, _) = run(&prompt, &["r1", "r2"]);
        let outputs = executor.outputs("sw").unwrap();
        assert!(outputs.slot(0).is_empty());
        assert_eq!(outputs.get(1), Some(&Value::Int(2)));
        assert!(executor.ui("r1").is_none());
        assert!(executor.ui("r2").is_some());
    }

    #[test]
    fn test_control_string_conditions() {
        let cases = [
            ("A = B", "cat", true),
            ("A != B", "cat", false),
            ("A in B", "concatenate", true),
            ("A not in B", "concatenate", false),
        ];

        for (kind, b, passes) in cases {
            let prompt = Prompt::new()
                .with("v", NodeRecord::new("Const").literal("value", 42))
                .with(
                    "gate",
                    NodeRecord::new("ExecutionControlString")
                        .literal("A", "cat")
                        .literal("B_STR", b)
                        .literal("condition_kind", kind)
                        .link("pass_value", "v", 0),
                )
                .with("out", NodeRecord::new("Record").link("value", "gate", 0));

            let (executor, _) = run(&prompt, &["out"]);
            let passed = executor.value("gate", 0) == Some(&Value::Int(42));
            assert_eq!(passed, passes, "{kind}");
        }
    }
}
