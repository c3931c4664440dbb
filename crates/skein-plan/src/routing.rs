//! Routing resolution — picks the concrete action for a skill step from its
//! declarative rules.
//!
//! Priority is strict, first match wins: `all`, then `property`-keyed
//! rules, then `field`-keyed rules, then `default`. Matching is
//! case-insensitive.

use std::collections::HashMap;

use skein_core::definition::{Route, RuntimeKind, SkillDefinition};
use skein_core::error::{Result, SkeinError};

/// A fully validated dispatch decision.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub action: Option<String>,
    pub runtime: RuntimeKind,
    pub output_name: String,
}

/// Resolve the route for one invocation of `skill`, given its resolved
/// property bag and the inbound payload.
pub fn resolve_route(
    skill: &SkillDefinition,
    properties: &HashMap<String, serde_json::Value>,
    payload: &serde_json::Value,
) -> Result<ResolvedRoute> {
    if skill.routing.is_empty() {
        return Err(SkeinError::MissingAction(skill.name.clone()));
    }

    if let Some(ref all) = skill.routing.all {
        return validate(skill, all);
    }

    if let Some(ref property) = skill.routing.property {
        if let Some(value) = properties.get(property) {
            if let Some(route) = match_rules(skill, value) {
                return validate(skill, route);
            }
        }
    }

    if let Some(ref field) = skill.routing.field {
        if let Some(value) = payload.get(field) {
            if let Some(route) = match_rules(skill, value) {
                return validate(skill, route);
            }
        }
    }

    match skill.routing.default {
        Some(ref default) => validate(skill, default),
        None => Err(SkeinError::NoMatchingRoute {
            skill: skill.name.clone(),
        }),
    }
}

/// Whether every route reachable for this skill is backed by a
/// synchronous-capable kind. Used at compile time to mark plan edges.
pub fn is_synchronous(skill: &SkillDefinition) -> bool {
    skill
        .reachable_routes()
        .iter()
        .all(|r| r.runtime.is_synchronous())
}

fn match_rules<'a>(
    skill: &'a SkillDefinition,
    value: &serde_json::Value,
) -> Option<&'a Route> {
    let needle = text_of(value).to_lowercase();
    skill
        .routing
        .rules
        .iter()
        .find(|rule| rule.matches.to_lowercase() == needle)
        .map(|rule| &rule.route)
}

/// Routing keys compare as text: strings match their content, everything
/// else its JSON rendering.
fn text_of(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn validate(skill: &SkillDefinition, route: &Route) -> Result<ResolvedRoute> {
    if route.action.is_none() && !route.runtime.is_external() {
        return Err(SkeinError::RouteWithoutAction {
            skill: skill.name.clone(),
        });
    }
    let output_name = route
        .output_name
        .clone()
        .ok_or_else(|| SkeinError::RouteWithoutOutput {
            skill: skill.name.clone(),
        })?;

    Ok(ResolvedRoute {
        action: route.action.clone(),
        runtime: route.runtime,
        output_name,
    })
}
