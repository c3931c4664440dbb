//! Plan compilation: turns a declarative agent definition plus a requested
//! entry point into an executable plan.
//!
//! The walk is depth-first over mappings. A path survives only if it
//! reaches the output the entry point declares; branches into other
//! outputs are pruned, and nodes left off every surviving path are dropped
//! from the result. Cycle detection is pair-based (`(from, to)` seen twice
//! on one path), not node-based, because a node may legitimately sit on
//! two different branches.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use skein_core::definition::{AgentDefinition, Mapping, OutputMode, RuntimeKind, SkillDefinition};
use skein_core::error::{Result, SkeinError};
use skein_core::plan::{NodeKind, Plan, PlanNode, PlanState, StateKind};
use skein_core::traits::ResourceCatalog;

use crate::routing;

/// Compile `definition` for one entry point. Pure except for skill
/// definition lookups through the catalog.
pub async fn compile(
    catalog: &dyn ResourceCatalog,
    definition: &AgentDefinition,
    entry_point: &str,
) -> Result<Plan> {
    if definition.mappings.is_empty() {
        return Err(SkeinError::EmptyDefinition(definition.name.clone()));
    }

    let entry = definition
        .input_by_name(entry_point)
        .or_else(|| definition.inputs.iter().find(|s| s.signal_id == entry_point))
        .ok_or_else(|| SkeinError::MissingEntryPoint(entry_point.to_string()))?;

    let target_name = entry
        .output
        .as_deref()
        .ok_or_else(|| SkeinError::MissingOutput(format!("{} declares none", entry.name)))?;
    let output = definition
        .output_by_name(target_name)
        .ok_or_else(|| SkeinError::MissingOutput(target_name.to_string()))?;

    // Fetch skill definitions up front; whether a missing one is an error
    // depends on it surviving the walk.
    let mut skills: HashMap<String, Option<SkillDefinition>> = HashMap::new();
    for skill_ref in &definition.skills {
        let def = catalog
            .skill(&definition.project_id, &skill_ref.skill)
            .await?;
        skills.insert(skill_ref.ref_id.clone(), def);
    }

    let mut walker = Walker {
        definition,
        output_id: &output.signal_id,
        path: Vec::new(),
        kept: Vec::new(),
        reaches: HashMap::new(),
    };
    walker.visit(&entry.signal_id)?;
    let kept = order_from_entry(walker.kept, &entry.signal_id);
    if kept.is_empty() {
        // Every branch drained into some other output.
        return Err(SkeinError::NoMapping(entry.name.clone()));
    }

    // Nodes on a surviving path only.
    let mut nodes: HashMap<String, PlanNode> = HashMap::new();
    nodes.insert(
        entry.signal_id.clone(),
        PlanNode {
            kind: NodeKind::Input,
            name: entry.name.clone(),
            title: None,
            mode: None,
            properties: entry.properties.clone(),
        },
    );
    nodes.insert(
        output.signal_id.clone(),
        PlanNode {
            kind: NodeKind::Output,
            name: output.name.clone(),
            title: None,
            mode: output.mode,
            properties: output.properties.clone(),
        },
    );

    let mut states = Vec::with_capacity(kept.len());
    for mapping in &kept {
        let state = if mapping.to == output.signal_id {
            PlanState {
                from: mapping.from.clone(),
                to: mapping.to.clone(),
                from_output: mapping.from_output.clone(),
                to_input: mapping.to_input.clone(),
                kind: StateKind::Output,
                skill: None,
                synchronous: true,
            }
        } else {
            let skill_ref = definition
                .skill_ref(&mapping.to)
                .ok_or_else(|| SkeinError::DanglingReference(mapping.to.clone()))?;
            let skill = skills
                .get(&skill_ref.ref_id)
                .and_then(|s| s.as_ref())
                .ok_or_else(|| SkeinError::SkillNotFound(skill_ref.skill.clone()))?;
            if skill.routing.is_empty() {
                return Err(SkeinError::MissingAction(skill.name.clone()));
            }

            nodes.entry(skill_ref.ref_id.clone()).or_insert_with(|| PlanNode {
                kind: NodeKind::Skill,
                name: skill_ref.skill.clone(),
                title: skill_ref.title.clone(),
                mode: None,
                properties: skill_ref.properties.clone(),
            });

            PlanState {
                from: mapping.from.clone(),
                to: mapping.to.clone(),
                from_output: mapping.from_output.clone(),
                to_input: mapping.to_input.clone(),
                kind: StateKind::Skill,
                skill: Some(skill_ref.skill.clone()),
                synchronous: routing::is_synchronous(skill),
            }
        };
        states.push(state);
    }

    let synchronous = states.iter().all(|s| s.synchronous);

    let mut plan = Plan {
        project_id: definition.project_id.clone(),
        definition: definition.name.clone(),
        entry_point: entry.name.clone(),
        entry_id: entry.signal_id.clone(),
        output_id: output.signal_id.clone(),
        nodes,
        states,
        synchronous,
        catch: definition.catch.clone(),
        finally: definition.finally.clone(),
    };
    inject_join_arity(&mut plan, &skills, definition);

    debug!(
        definition = %definition.name,
        entry_point,
        states = plan.states.len(),
        synchronous = plan.synchronous,
        "Plan compiled"
    );
    Ok(plan)
}

/// The walk keeps edges in post-order (a branch's tail before its head).
/// Re-walk them breadth-first from the entry so states read in execution
/// order.
fn order_from_entry(kept: Vec<Mapping>, entry_id: &str) -> Vec<Mapping> {
    let mut ordered = Vec::with_capacity(kept.len());
    let mut taken = vec![false; kept.len()];
    let mut frontier = VecDeque::from([entry_id.to_string()]);
    let mut seen = vec![entry_id.to_string()];

    while let Some(node) = frontier.pop_front() {
        for (i, edge) in kept.iter().enumerate() {
            if taken[i] || edge.from != node {
                continue;
            }
            taken[i] = true;
            ordered.push(edge.clone());
            if !seen.contains(&edge.to) {
                seen.push(edge.to.clone());
                frontier.push_back(edge.to.clone());
            }
        }
    }
    ordered
}

/// Fan-in joins (merge- or stats-mode outputs, merge-backed skills) need
/// to know how many arrivals to wait for. The count of distinct edges
/// targeting the join becomes its `expected` property, unless the
/// definition supplied one explicitly.
fn inject_join_arity(
    plan: &mut Plan,
    skills: &HashMap<String, Option<SkillDefinition>>,
    definition: &AgentDefinition,
) {
    let ids: Vec<String> = plan.nodes.keys().cloned().collect();
    for id in ids {
        let arity = plan.arity_into(&id) as i64;
        if arity == 0 {
            continue;
        }
        let is_join = match plan.nodes[&id].kind {
            NodeKind::Output => matches!(
                plan.nodes[&id].mode,
                Some(OutputMode::Merge) | Some(OutputMode::Stats)
            ),
            NodeKind::Skill => definition
                .skill_ref(&id)
                .and_then(|r| skills.get(&r.ref_id))
                .and_then(|s| s.as_ref())
                .map(|s| {
                    s.reachable_routes()
                        .iter()
                        .any(|route| route.runtime == RuntimeKind::Merge)
                })
                .unwrap_or(false),
            NodeKind::Input => false,
        };
        if !is_join {
            continue;
        }
        if let Some(node) = plan.nodes.get_mut(&id) {
            node.properties
                .entry("expected".to_string())
                .or_insert_with(|| serde_json::json!(arity));
        }
    }
}

struct Walker<'a> {
    definition: &'a AgentDefinition,
    output_id: &'a str,
    /// `(from, to)` pairs on the current DFS path.
    path: Vec<(String, String)>,
    /// Surviving edges in discovery order, deduplicated.
    kept: Vec<Mapping>,
    /// Memo: does this node reach the requested output?
    reaches: HashMap<String, bool>,
}

impl Walker<'_> {
    fn visit(&mut self, node_id: &str) -> Result<bool> {
        if let Some(&memo) = self.reaches.get(node_id) {
            return Ok(memo);
        }

        let edges: Vec<Mapping> = self
            .definition
            .mappings
            .iter()
            .filter(|m| m.from == node_id)
            .cloned()
            .collect();
        if edges.is_empty() {
            return Err(SkeinError::NoMapping(self.display(node_id)));
        }

        let mut survived = false;
        for edge in edges {
            let pair = (edge.from.clone(), edge.to.clone());
            if self.path.contains(&pair) {
                return Err(SkeinError::Cycle(self.display(&edge.from)));
            }

            if edge.to == self.output_id {
                self.keep(edge);
                survived = true;
            } else if self.definition.output_by_id(&edge.to).is_some() {
                // A different output: prune this branch, no error.
            } else if self.definition.skill_ref(&edge.to).is_some() {
                self.path.push(pair);
                let downstream = self.visit(&edge.to.clone())?;
                self.path.pop();
                if downstream {
                    self.keep(edge);
                    survived = true;
                }
            } else {
                return Err(SkeinError::DanglingReference(edge.to.clone()));
            }
        }

        self.reaches.insert(node_id.to_string(), survived);
        Ok(survived)
    }

    fn keep(&mut self, edge: Mapping) {
        let duplicate = self.kept.iter().any(|m| {
            m.from == edge.from
                && m.to == edge.to
                && m.from_output == edge.from_output
                && m.to_input == edge.to_input
        });
        if !duplicate {
            self.kept.push(edge);
        }
    }

    /// Human-readable node name for error messages.
    fn display(&self, node_id: &str) -> String {
        if let Some(skill_ref) = self.definition.skill_ref(node_id) {
            return skill_ref.skill.clone();
        }
        self.definition
            .inputs
            .iter()
            .chain(self.definition.outputs.iter())
            .find(|s| s.signal_id == node_id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| node_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::catalog::MemoryCatalog;
    use skein_core::definition::{Mapping, Route, RoutingRules, Signal, SkillRef};

    fn signal(id: &str, name: &str) -> Signal {
        Signal {
            signal_id: id.into(),
            name: name.into(),
            output: None,
            mode: None,
            properties: HashMap::new(),
        }
    }

    fn input(id: &str, name: &str, output: &str) -> Signal {
        Signal {
            output: Some(output.into()),
            ..signal(id, name)
        }
    }

    fn skill_ref(ref_id: &str, skill: &str) -> SkillRef {
        SkillRef {
            ref_id: ref_id.into(),
            skill: skill.into(),
            title: None,
            properties: HashMap::new(),
        }
    }

    fn mapping(from: &str, to: &str) -> Mapping {
        Mapping {
            from: from.into(),
            to: to.into(),
            from_output: None,
            to_input: None,
        }
    }

    fn script_skill(name: &str) -> SkillDefinition {
        SkillDefinition {
            project_id: "p".into(),
            name: name.into(),
            title: None,
            properties: vec![],
            routing: RoutingRules {
                all: Some(Route {
                    action: Some("run".into()),
                    runtime: RuntimeKind::Script,
                    output_name: Some("done".into()),
                }),
                ..Default::default()
            },
        }
    }

    fn job_skill(name: &str) -> SkillDefinition {
        SkillDefinition {
            routing: RoutingRules {
                all: Some(Route {
                    action: None,
                    runtime: RuntimeKind::Job,
                    output_name: Some("done".into()),
                }),
                ..Default::default()
            },
            ..script_skill(name)
        }
    }

    fn linear_definition() -> AgentDefinition {
        AgentDefinition {
            project_id: "p".into(),
            name: "flow".into(),
            title: None,
            inputs: vec![input("in", "submit", "done")],
            outputs: vec![signal("out", "done")],
            skills: vec![skill_ref("s1", "step-one")],
            mappings: vec![mapping("in", "s1"), mapping("s1", "out")],
            catch: None,
            finally: None,
        }
    }

    async fn catalog_with(defs: Vec<SkillDefinition>) -> MemoryCatalog {
        let catalog = MemoryCatalog::new();
        for def in defs {
            catalog.add_skill(def);
        }
        catalog
    }

    #[tokio::test]
    async fn test_linear_plan_has_two_states() {
        let catalog = catalog_with(vec![script_skill("step-one")]).await;
        let plan = compile(&catalog, &linear_definition(), "submit").await.unwrap();

        assert_eq!(plan.states.len(), 2);
        assert_eq!(plan.states[0].kind, StateKind::Skill);
        assert_eq!(plan.states[0].from, "in");
        assert_eq!(plan.states[1].kind, StateKind::Output);
        assert_eq!(plan.states[1].from, "s1");
        assert_eq!(plan.states[1].to, "out");
        assert!(plan.synchronous);
    }

    #[tokio::test]
    async fn test_synchronous_flag_follows_skill_kind() {
        let catalog = catalog_with(vec![job_skill("step-one")]).await;
        let plan = compile(&catalog, &linear_definition(), "submit").await.unwrap();

        assert!(!plan.states[0].synchronous);
        assert!(plan.states[1].synchronous); // output edges always are
        assert!(!plan.synchronous);
    }

    #[tokio::test]
    async fn test_compile_is_deterministic() {
        let catalog = catalog_with(vec![script_skill("step-one")]).await;
        let def = linear_definition();
        let a = compile(&catalog, &def, "submit").await.unwrap();
        let b = compile(&catalog, &def, "submit").await.unwrap();

        assert_eq!(
            serde_json::to_value(&a).unwrap(),
            serde_json::to_value(&b).unwrap()
        );
    }

    #[tokio::test]
    async fn test_empty_definition_rejected() {
        let catalog = MemoryCatalog::new();
        let mut def = linear_definition();
        def.mappings.clear();

        let err = compile(&catalog, &def, "submit").await.unwrap_err();
        assert!(matches!(err, SkeinError::EmptyDefinition(_)));
    }

    #[tokio::test]
    async fn test_missing_entry_point() {
        let catalog = catalog_with(vec![script_skill("step-one")]).await;
        let err = compile(&catalog, &linear_definition(), "nope").await.unwrap_err();
        assert!(matches!(err, SkeinError::MissingEntryPoint(_)));
    }

    #[tokio::test]
    async fn test_missing_declared_output() {
        let catalog = catalog_with(vec![script_skill("step-one")]).await;
        let mut def = linear_definition();
        def.inputs[0].output = Some("absent".into());

        let err = compile(&catalog, &def, "submit").await.unwrap_err();
        assert!(matches!(err, SkeinError::MissingOutput(_)));
    }

    #[tokio::test]
    async fn test_dead_end_skill_rejected() {
        let catalog = catalog_with(vec![script_skill("step-one")]).await;
        let mut def = linear_definition();
        def.mappings.retain(|m| m.from != "s1");

        let err = compile(&catalog, &def, "submit").await.unwrap_err();
        match err {
            SkeinError::NoMapping(name) => assert_eq!(name, "step-one"),
            other => panic!("expected NoMapping, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_cycle_detected_by_edge_pair() {
        let catalog =
            catalog_with(vec![script_skill("step-one"), script_skill("step-two")]).await;
        let mut def = linear_definition();
        def.skills.push(skill_ref("s2", "step-two"));
        def.mappings = vec![
            mapping("in", "s1"),
            mapping("s1", "s2"),
            mapping("s2", "s1"),
            mapping("s2", "out"),
        ];

        let err = compile(&catalog, &def, "submit").await.unwrap_err();
        assert!(matches!(err, SkeinError::Cycle(_)));
    }

    #[tokio::test]
    async fn test_diamond_is_not_a_cycle() {
        // in → s1 → {s2, s3} → s4 → out: s4 sits on two branches.
        let catalog = catalog_with(vec![
            script_skill("a"),
            script_skill("b"),
            script_skill("c"),
            script_skill("d"),
        ])
        .await;
        let def = AgentDefinition {
            project_id: "p".into(),
            name: "diamond".into(),
            title: None,
            inputs: vec![input("in", "submit", "done")],
            outputs: vec![signal("out", "done")],
            skills: vec![
                skill_ref("s1", "a"),
                skill_ref("s2", "b"),
                skill_ref("s3", "c"),
                skill_ref("s4", "d"),
            ],
            mappings: vec![
                mapping("in", "s1"),
                mapping("s1", "s2"),
                mapping("s1", "s3"),
                mapping("s2", "s4"),
                mapping("s3", "s4"),
                mapping("s4", "out"),
            ],
            catch: None,
            finally: None,
        };

        let plan = compile(&catalog, &def, "submit").await.unwrap();
        assert_eq!(plan.states.len(), 6);
        assert_eq!(plan.arity_into("s4"), 2);
    }

    #[tokio::test]
    async fn test_branch_to_other_output_is_pruned() {
        // Two disjoint branches; compiling for "done" must not include the
        // "audit" branch's skill.
        let catalog = catalog_with(vec![script_skill("main"), script_skill("audit")]).await;
        let def = AgentDefinition {
            project_id: "p".into(),
            name: "forked".into(),
            title: None,
            inputs: vec![input("in", "submit", "done")],
            outputs: vec![signal("out", "done"), signal("aud", "audit")],
            skills: vec![skill_ref("s1", "main"), skill_ref("s2", "audit")],
            mappings: vec![
                mapping("in", "s1"),
                mapping("in", "s2"),
                mapping("s1", "out"),
                mapping("s2", "aud"),
            ],
            catch: None,
            finally: None,
        };

        let plan = compile(&catalog, &def, "submit").await.unwrap();
        assert_eq!(plan.states.len(), 2);
        assert!(plan.nodes.contains_key("s1"));
        assert!(!plan.nodes.contains_key("s2"));
        assert!(!plan.nodes.contains_key("aud"));
    }

    #[tokio::test]
    async fn test_dangling_reference() {
        let catalog = catalog_with(vec![script_skill("step-one")]).await;
        let mut def = linear_definition();
        def.mappings.push(mapping("in", "ghost"));

        let err = compile(&catalog, &def, "submit").await.unwrap_err();
        match err {
            SkeinError::DanglingReference(id) => assert_eq!(id, "ghost"),
            other => panic!("expected DanglingReference, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_skill_on_surviving_path() {
        let catalog = MemoryCatalog::new(); // nothing registered
        let err = compile(&catalog, &linear_definition(), "submit").await.unwrap_err();
        assert!(matches!(err, SkeinError::SkillNotFound(_)));
    }

    #[tokio::test]
    async fn test_skill_without_routes() {
        let mut bare = script_skill("step-one");
        bare.routing = RoutingRules::default();
        let catalog = catalog_with(vec![bare]).await;

        let err = compile(&catalog, &linear_definition(), "submit").await.unwrap_err();
        assert!(matches!(err, SkeinError::MissingAction(_)));
    }

    #[tokio::test]
    async fn test_merge_join_expected_count_injected() {
        let catalog = catalog_with(vec![script_skill("a"), script_skill("b")]).await;
        let def = AgentDefinition {
            project_id: "p".into(),
            name: "joiner".into(),
            title: None,
            inputs: vec![input("in", "submit", "done")],
            outputs: vec![Signal {
                mode: Some(OutputMode::Merge),
                ..signal("out", "done")
            }],
            skills: vec![skill_ref("s1", "a"), skill_ref("s2", "b")],
            mappings: vec![
                mapping("in", "s1"),
                mapping("in", "s2"),
                mapping("s1", "out"),
                mapping("s2", "out"),
            ],
            catch: None,
            finally: None,
        };

        let plan = compile(&catalog, &def, "submit").await.unwrap();
        assert_eq!(plan.nodes["out"].properties["expected"], 2);
    }

    #[tokio::test]
    async fn test_stats_output_counts_as_a_join() {
        let catalog = catalog_with(vec![script_skill("a"), script_skill("b")]).await;
        let def = AgentDefinition {
            project_id: "p".into(),
            name: "counted".into(),
            title: None,
            inputs: vec![input("in", "submit", "done")],
            outputs: vec![Signal {
                mode: Some(OutputMode::Stats),
                ..signal("out", "done")
            }],
            skills: vec![skill_ref("s1", "a"), skill_ref("s2", "b")],
            mappings: vec![
                mapping("in", "s1"),
                mapping("in", "s2"),
                mapping("s1", "out"),
                mapping("s2", "out"),
            ],
            catch: None,
            finally: None,
        };

        let plan = compile(&catalog, &def, "submit").await.unwrap();
        assert_eq!(plan.nodes["out"].properties["expected"], 2);
    }

    #[tokio::test]
    async fn test_explicit_expected_count_preserved() {
        let catalog = catalog_with(vec![script_skill("a"), script_skill("b")]).await;
        let mut out = signal("out", "done");
        out.mode = Some(OutputMode::Merge);
        out.properties
            .insert("expected".into(), serde_json::json!(5));
        let def = AgentDefinition {
            project_id: "p".into(),
            name: "joiner".into(),
            title: None,
            inputs: vec![input("in", "submit", "done")],
            outputs: vec![out],
            skills: vec![skill_ref("s1", "a"), skill_ref("s2", "b")],
            mappings: vec![
                mapping("in", "s1"),
                mapping("in", "s2"),
                mapping("s1", "out"),
                mapping("s2", "out"),
            ],
            catch: None,
            finally: None,
        };

        let plan = compile(&catalog, &def, "submit").await.unwrap();
        assert_eq!(plan.nodes["out"].properties["expected"], 5);
    }
}
