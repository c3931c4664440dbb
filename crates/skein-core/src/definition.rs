use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A declaratively wired agent: inputs, outputs, skill references, and the
/// mappings (edges) connecting them.
///
/// Definitions are immutable once loaded and identified by
/// `(project_id, name)`. They are authored as TOML files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    #[serde(default)]
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub inputs: Vec<Signal>,
    #[serde(default)]
    pub outputs: Vec<Signal>,
    #[serde(default)]
    pub skills: Vec<SkillRef>,
    #[serde(default)]
    pub mappings: Vec<Mapping>,
    /// Skill run on the failure path before `finally`, able to rewrite the
    /// response.
    #[serde(default)]
    pub catch: Option<String>,
    /// Skill always run before finalize, able to rewrite the response.
    #[serde(default)]
    pub finally: Option<String>,
}

impl AgentDefinition {
    /// Look up an input signal by its entry-point name.
    pub fn input_by_name(&self, name: &str) -> Option<&Signal> {
        self.inputs.iter().find(|s| s.name == name)
    }

    /// Look up an output signal by name.
    pub fn output_by_name(&self, name: &str) -> Option<&Signal> {
        self.outputs.iter().find(|s| s.name == name)
    }

    pub fn output_by_id(&self, signal_id: &str) -> Option<&Signal> {
        self.outputs.iter().find(|s| s.signal_id == signal_id)
    }

    pub fn skill_ref(&self, ref_id: &str) -> Option<&SkillRef> {
        self.skills.iter().find(|s| s.ref_id == ref_id)
    }
}

/// An input or output terminal of an agent, addressed by a stable id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: String,
    pub name: String,
    /// For inputs: the name of the output this entry point targets.
    #[serde(default)]
    pub output: Option<String>,
    /// For outputs: how fan-in results are aggregated.
    #[serde(default)]
    pub mode: Option<OutputMode>,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
}

/// Fan-in aggregation mode for an output node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Last (or only) payload delivered.
    #[default]
    Single,
    /// Every delivered payload, collected into an ordered list.
    Merge,
    /// `{received, done, errors}` counts instead of payload content.
    Stats,
}

/// A use of a skill inside an agent, addressed by `ref_id`. Override
/// properties layer over the skill definition's own declared properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillRef {
    pub ref_id: String,
    pub skill: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
}

/// An edge: `input→skill`, `skill→skill`, or `skill→output`. Each side is a
/// `signal_id` or `ref_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mapping {
    pub from: String,
    pub to: String,
    /// Restrict this edge to one named output of the `from` node.
    #[serde(default)]
    pub from_output: Option<String>,
    #[serde(default)]
    pub to_input: Option<String>,
}

/// A reusable processing unit: declared properties plus routing rules that
/// pick the concrete action for each invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillDefinition {
    #[serde(default)]
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub properties: Vec<PropertySpec>,
    #[serde(default)]
    pub routing: RoutingRules,
}

impl SkillDefinition {
    /// All routes an invocation of this skill could take. When an
    /// unconditional route exists it shadows everything else.
    pub fn reachable_routes(&self) -> Vec<&Route> {
        if let Some(ref all) = self.routing.all {
            return vec![all];
        }
        let mut routes: Vec<&Route> = self.routing.rules.iter().map(|r| &r.route).collect();
        if let Some(ref default) = self.routing.default {
            routes.push(default);
        }
        routes
    }
}

/// A declared skill property: `value` is the author's explicit setting,
/// `default` the fallback when neither value nor override is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySpec {
    pub name: String,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

/// Declarative routing rules, evaluated strictly in priority order:
/// `all`, then `property` rules, then `field` rules, then `default`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingRules {
    /// Unconditional route. When present the rest is ignored.
    #[serde(default)]
    pub all: Option<Route>,
    /// Name of the property whose value is matched against `rules`.
    #[serde(default)]
    pub property: Option<String>,
    /// Name of the payload field matched against `rules` when no property
    /// rule matched.
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub rules: Vec<RouteRule>,
    #[serde(default)]
    pub default: Option<Route>,
}

impl RoutingRules {
    pub fn is_empty(&self) -> bool {
        self.all.is_none() && self.rules.is_empty() && self.default.is_none()
    }
}

/// One conditional route: matches case-insensitively against the routing
/// key's value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    #[serde(rename = "match")]
    pub matches: String,
    pub route: Route,
}

/// A concrete dispatch target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Action name. Irrelevant for the externally-dispatched job runtime.
    #[serde(default)]
    pub action: Option<String>,
    pub runtime: RuntimeKind,
    #[serde(default)]
    pub output_name: Option<String>,
}

/// The kind of provider backing a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeKind {
    /// Long-lived remote daemon, synchronous round trip.
    Daemon,
    /// Out-of-process job; completion arrives later as an external callback.
    Job,
    /// Generic outbound HTTP call.
    Rest,
    /// In-process template evaluation.
    Script,
    /// In-process fan-in join.
    Merge,
    /// Invoke another agent as a step.
    SubAgent,
}

impl RuntimeKind {
    /// Whether a step backed by this kind can complete within the original
    /// request's lifetime.
    pub fn is_synchronous(&self) -> bool {
        !matches!(self, Self::Job)
    }

    /// The externally-dispatched kind: no action name is needed, the remote
    /// executor owns the work.
    pub fn is_external(&self) -> bool {
        matches!(self, Self::Job)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daemon => "daemon",
            Self::Job => "job",
            Self::Rest => "rest",
            Self::Script => "script",
            Self::Merge => "merge",
            Self::SubAgent => "sub-agent",
        }
    }
}
