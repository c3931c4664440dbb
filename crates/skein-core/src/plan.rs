use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::definition::OutputMode;

/// Compiled, immutable execution graph for one
/// `(project, definition, entry point)` triple.
///
/// A plan is a DAG: cycles are rejected at compile time, and every state is
/// on some path from the requested entry to the requested output. Running
/// activations pin their own copy, so plans must serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub project_id: String,
    pub definition: String,
    pub entry_point: String,
    /// The entry node the first continuation starts at.
    pub entry_id: String,
    /// The requested output node every surviving path reaches.
    pub output_id: String,
    pub nodes: HashMap<String, PlanNode>,
    /// Edges reachable from the entry point, in discovery order.
    pub states: Vec<PlanState>,
    /// True iff every state is synchronous. Synchronous invocation requests
    /// against a plan where this is false are rejected up front.
    pub synchronous: bool,
    #[serde(default)]
    pub catch: Option<String>,
    #[serde(default)]
    pub finally: Option<String>,
}

impl Plan {
    /// All states leaving `channel_id`, optionally narrowed to one named
    /// output of that node. A state without a `from_output` restriction
    /// matches any output name. This is the fan-out point: zero, one, or
    /// many states may match.
    pub fn states_from<'a>(
        &'a self,
        channel_id: &'a str,
        output_name: Option<&'a str>,
    ) -> impl Iterator<Item = &'a PlanState> {
        self.states.iter().filter(move |s| {
            s.from == channel_id
                && match (&s.from_output, output_name) {
                    (Some(restrict), Some(name)) => restrict == name,
                    _ => true,
                }
        })
    }

    pub fn node(&self, id: &str) -> Option<&PlanNode> {
        self.nodes.get(id)
    }

    /// Number of distinct states targeting `channel_id`.
    pub fn arity_into(&self, channel_id: &str) -> usize {
        self.states.iter().filter(|s| s.to == channel_id).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Input,
    Skill,
    Output,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanNode {
    pub kind: NodeKind,
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Fan-in aggregation mode, on output nodes only.
    #[serde(default)]
    pub mode: Option<OutputMode>,
    /// Reference-level properties (for skill nodes these are the override
    /// layer; merge joins carry their injected `expected` count here).
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    Skill,
    Output,
}

/// One compiled edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanState {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub from_output: Option<String>,
    #[serde(default)]
    pub to_input: Option<String>,
    pub kind: StateKind,
    /// Skill name backing the target node (skill states only).
    #[serde(default)]
    pub skill: Option<String>,
    /// Whether every route reachable for the target skill is backed by a
    /// synchronous-capable kind. Output states are always synchronous.
    pub synchronous: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_plan() -> Plan {
        let mut nodes = HashMap::new();
        nodes.insert(
            "in".to_string(),
            PlanNode {
                kind: NodeKind::Input,
                name: "submit".into(),
                title: None,
                mode: None,
                properties: HashMap::new(),
            },
        );
        nodes.insert(
            "s1".to_string(),
            PlanNode {
                kind: NodeKind::Skill,
                name: "echo".into(),
                title: None,
                mode: None,
                properties: HashMap::new(),
            },
        );
        nodes.insert(
            "out".to_string(),
            PlanNode {
                kind: NodeKind::Output,
                name: "done".into(),
                title: None,
                mode: Some(OutputMode::Single),
                properties: HashMap::new(),
            },
        );

        Plan {
            project_id: "p".into(),
            definition: "d".into(),
            entry_point: "submit".into(),
            entry_id: "in".into(),
            output_id: "out".into(),
            nodes,
            states: vec![
                PlanState {
                    from: "in".into(),
                    to: "s1".into(),
                    from_output: None,
                    to_input: None,
                    kind: StateKind::Skill,
                    skill: Some("echo".into()),
                    synchronous: true,
                },
                PlanState {
                    from: "s1".into(),
                    to: "out".into(),
                    from_output: Some("done".into()),
                    to_input: None,
                    kind: StateKind::Output,
                    skill: None,
                    synchronous: true,
                },
            ],
            synchronous: true,
            catch: None,
            finally: None,
        }
    }

    #[test]
    fn test_states_from_matches_wildcard() {
        let plan = sample_plan();
        // No from_output restriction on the entry edge: any output matches.
        assert_eq!(plan.states_from("in", None).count(), 1);
        assert_eq!(plan.states_from("in", Some("anything")).count(), 1);
    }

    #[test]
    fn test_states_from_restricted() {
        let plan = sample_plan();
        assert_eq!(plan.states_from("s1", Some("done")).count(), 1);
        assert_eq!(plan.states_from("s1", Some("other")).count(), 0);
        // A message with no output name matches restricted edges too.
        assert_eq!(plan.states_from("s1", None).count(), 1);
    }

    #[test]
    fn test_arity() {
        let plan = sample_plan();
        assert_eq!(plan.arity_into("out"), 1);
        assert_eq!(plan.arity_into("s1"), 1);
        assert_eq!(plan.arity_into("in"), 0);
    }

    #[test]
    fn test_plan_round_trips_as_json() {
        let plan = sample_plan();
        let json = serde_json::to_string(&plan).unwrap();
        let back: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(back.states.len(), 2);
        assert!(back.synchronous);
    }
}
