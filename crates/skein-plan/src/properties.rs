//! Property resolution for skill invocations.
//!
//! Precedence, lowest to highest: the skill definition's default value,
//! the skill definition's explicit value, the reference-level override.
//! The merge is explicit and ordered; there is no generic deep merge.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use skein_core::definition::SkillDefinition;
use skein_core::error::{Result, SkeinError};
use skein_core::traits::SecretStore;

fn secure_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^secure:([A-Za-z0-9_.\-]+)$").unwrap())
}

/// Layer reference-level overrides over the skill's declared properties.
pub fn merge_properties(
    skill: &SkillDefinition,
    overrides: &HashMap<String, serde_json::Value>,
) -> HashMap<String, serde_json::Value> {
    let mut merged = HashMap::new();

    for spec in &skill.properties {
        if let Some(ref default) = spec.default {
            merged.insert(spec.name.clone(), default.clone());
        }
    }
    for spec in &skill.properties {
        if let Some(ref value) = spec.value {
            merged.insert(spec.name.clone(), value.clone());
        }
    }
    for (name, value) in overrides {
        merged.insert(name.clone(), value.clone());
    }

    merged
}

/// Replace every `secure:NAME` value with the secret store's value for
/// NAME. All-or-nothing: one failed fetch fails the whole bag, properties
/// never partially resolve.
pub async fn resolve_secure(
    secrets: &dyn SecretStore,
    project_id: &str,
    mut properties: HashMap<String, serde_json::Value>,
) -> Result<HashMap<String, serde_json::Value>> {
    let mut pending: Vec<(String, String)> = properties
        .iter()
        .filter_map(|(key, value)| {
            let text = value.as_str()?;
            let caps = secure_pattern().captures(text)?;
            Some((key.clone(), caps[1].to_string()))
        })
        .collect();
    // Deterministic fetch order regardless of map iteration.
    pending.sort();

    if pending.is_empty() {
        return Ok(properties);
    }

    let names: Vec<String> = pending.iter().map(|(_, name)| name.clone()).collect();
    let values = secrets.secrets(project_id, &names).await?;
    if values.len() != names.len() {
        return Err(SkeinError::SecretResolution(format!(
            "expected {} secrets, got {}",
            names.len(),
            values.len()
        )));
    }

    for ((key, _), value) in pending.into_iter().zip(values) {
        properties.insert(key, serde_json::Value::String(value));
    }
    Ok(properties)
}
