use std::sync::OnceLock;

use futures::future::BoxFuture;
use regex::Regex;

use skein_core::definition::RuntimeKind;
use skein_core::error::Result;
use skein_core::traits::ActionProvider;
use skein_core::types::{ActionInvocation, ActionOutcome};

use super::string_property;

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").unwrap())
}

/// In-process template evaluation. The `script` property is a template
/// over the inbound payload: `{{payload}}` splices the whole payload,
/// `{{payload.a.b}}` a field path. If the rendered text parses as JSON it
/// becomes the output payload, otherwise it is emitted as a string.
pub struct ScriptAction;

impl ScriptAction {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ScriptAction {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionProvider for ScriptAction {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Script
    }

    fn invoke(&self, invocation: ActionInvocation) -> BoxFuture<'_, Result<ActionOutcome>> {
        Box::pin(async move {
            let Some(script) = string_property(&invocation.properties, "script") else {
                return Ok(ActionOutcome::failed(format!(
                    "skill '{}' has no script property",
                    invocation.skill
                )));
            };

            let rendered = render(&script, &invocation.payload);
            let payload = serde_json::from_str(&rendered)
                .unwrap_or(serde_json::Value::String(rendered));
            Ok(ActionOutcome::ok(invocation.output_name, payload))
        })
    }
}

fn render(template: &str, payload: &serde_json::Value) -> String {
    placeholder_pattern()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            splice(&caps[1], payload)
        })
        .into_owned()
}

fn splice(path: &str, payload: &serde_json::Value) -> String {
    let mut segments = path.split('.');
    if segments.next() != Some("payload") {
        return String::new();
    }

    let mut current = payload;
    for segment in segments {
        match current.get(segment) {
            Some(value) => current = value,
            None => return String::new(),
        }
    }
    match current {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use skein_core::types::RequestId;

    fn invocation(script: &str, payload: serde_json::Value) -> ActionInvocation {
        let mut properties = HashMap::new();
        properties.insert("script".to_string(), serde_json::json!(script));
        ActionInvocation {
            request_id: RequestId::from_string("r1"),
            project_id: "p".into(),
            skill: "script".into(),
            action: Some("run".into()),
            output_name: "done".into(),
            channel_id: "s1".into(),
            message_id: None,
            properties,
            payload,
            headers: HashMap::new(),
            token: None,
        }
    }

    #[tokio::test]
    async fn test_whole_payload_splice() {
        let action = ScriptAction::new();
        let outcome = action
            .invoke(invocation(
                r#"{"wrapped": {{payload}}}"#,
                serde_json::json!({"n": 3}),
            ))
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.payload.unwrap()["wrapped"]["n"], 3);
    }

    #[tokio::test]
    async fn test_field_path_splice() {
        let action = ScriptAction::new();
        let outcome = action
            .invoke(invocation(
                "user={{payload.user.name}}",
                serde_json::json!({"user": {"name": "ada"}}),
            ))
            .await
            .unwrap();

        assert_eq!(outcome.payload.unwrap(), serde_json::json!("user=ada"));
    }

    #[tokio::test]
    async fn test_missing_path_renders_empty() {
        let action = ScriptAction::new();
        let outcome = action
            .invoke(invocation("x={{payload.absent}}", serde_json::json!({})))
            .await
            .unwrap();

        assert_eq!(outcome.payload.unwrap(), serde_json::json!("x="));
    }

    #[tokio::test]
    async fn test_missing_script_property_fails() {
        let action = ScriptAction::new();
        let mut inv = invocation("", serde_json::Value::Null);
        inv.properties.clear();

        let outcome = action.invoke(inv).await.unwrap();
        assert!(!outcome.success);
    }
}
