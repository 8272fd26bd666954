use std::collections::{BTreeSet, HashMap};
use std::fmt::Write;

use crate::core::NodeId;
use crate::engine::TaskExecution;
use crate::graph::Graph;

/// Summary of a single invocation.
#[derive(Debug, Default, Clone)]
pub struct Report {
    pub prompt_id: String,
    /// Every node run, in execution order. Loop bodies appear once per
    /// iteration.
    pub executed: Vec<NodeId>,
    /// Nodes whose outputs were reused from an earlier invocation.
    pub cached: BTreeSet<NodeId>,
    /// Timing of the last run of each executed node.
    pub execution_times: HashMap<NodeId, TaskExecution>,
}

impl Report {
    pub(crate) fn new(prompt_id: impl Into<String>) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            ..Default::default()
        }
    }

    pub fn ran(&self, id: &str) -> bool {
        self.executed.iter().any(|x| x.as_str() == id)
    }

    /// How many times `id` ran in this invocation.
    pub fn runs(&self, id: &str) -> usize {
        self.executed.iter().filter(|x| x.as_str() == id).count()
    }

    /// Renders the graph as a Mermaid diagram, color-coded by execution duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Cached (skipped)
    /// * **Grey**: Not needed by this invocation
    pub fn render_mermaid(&self, graph: &Graph) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let times = &self.execution_times;
        let (min_time, max_time) = times
            .values()
            .map(|t| t.duration.as_secs_f64())
            .fold(None, |acc: Option<(f64, f64)>, secs| match acc {
                None => Some((secs, secs)),
                Some((lo, hi)) => Some((lo.min(secs), hi.max(secs))),
            })
            .unwrap_or((0.0, 0.0));
        let span = (max_time - min_time).max(f64::EPSILON);

        for id in graph.ids() {
            let name = graph.title(id).replace('"', "\\\"");
            let key = mermaid_key(id);

            let (label_extra, color_code) = if let Some(exec) = times.get(id) {
                let t = (exec.duration.as_secs_f64() - min_time) / span;
                let (r, g) = if t < 0.5 {
                    ((255.0 * t * 2.0) as u8, 255)
                } else {
                    (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
                };
                (format!("{:.2?}", exec.duration), format!("#{r:02X}{g:02X}00"))
            } else if self.cached.contains(id) {
                ("Cached".to_string(), "#ADD8E6".to_string())
            } else {
                ("Skipped".to_string(), "#D3D3D3".to_string())
            };

            let _ = writeln!(f, "    {key}[\"{name}\\n{label_extra}\"]");
            let _ = writeln!(f, "    style {key} fill:{color_code}");

            if graph.schema(id).sink {
                let _ = writeln!(f, "    {key} --> Output");
            }
        }

        let _ = writeln!(f, "    Output[Output]");

        for (source, target, edge) in graph.edges() {
            let arrow = if edge.feedback { "-.->" } else { "-->" };
            let _ = writeln!(
                f,
                "    {} {arrow}|\"{}\"| {}",
                mermaid_key(source),
                edge.input,
                mermaid_key(target),
            );
        }

        f
    }
}

fn mermaid_key(id: &NodeId) -> String {
    let safe: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("n{safe}")
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::graph::{NodeRecord, Prompt};
    use crate::testing::registry;

    #[test]
    fn test_render_mermaid() {
        let registry = registry();
        let prompt = Prompt::new()
            .with("1", NodeRecord::new("Const").literal("value", 1))
            .with("2", NodeRecord::new("AddOne").link("x", "1", 0))
            .with("3", NodeRecord::new("Record").link("value", "2", 0).title("Out"));
        let graph = Graph::new(&prompt, &registry).unwrap();

        let mut report = Report::new("p");
        report.cached.insert(NodeId::from("1"));
        report.executed.push(NodeId::from("2"));
        report.execution_times.insert(
            NodeId::from("2"),
            TaskExecution {
                start: Instant::now(),
                duration: Duration::from_millis(3),
            },
        );

        let text = report.render_mermaid(&graph);
        assert!(text.starts_with("graph LR"));
        assert!(text.contains("style n1 fill:#ADD8E6"));
        assert!(text.contains("n3[\"Out\\nSkipped\"]"));
        assert!(text.contains("n3 --> Output"));
        assert!(text.contains("n1 -->|\"x\"| n2"));
    }
}
