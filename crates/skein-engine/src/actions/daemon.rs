use futures::future::BoxFuture;

use skein_core::definition::RuntimeKind;
use skein_core::error::Result;
use skein_core::traits::ActionProvider;
use skein_core::types::{ActionInvocation, ActionOutcome};

use super::string_property;

/// Synchronous dispatch to a long-lived remote daemon. The caller awaits
/// the HTTP round trip; the daemon's response payload continues the plan.
pub struct DaemonAction {
    http: reqwest::Client,
}

impl DaemonAction {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl ActionProvider for DaemonAction {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Daemon
    }

    fn invoke(&self, invocation: ActionInvocation) -> BoxFuture<'_, Result<ActionOutcome>> {
        Box::pin(async move {
            let Some(endpoint) = string_property(&invocation.properties, "endpoint") else {
                return Ok(ActionOutcome::failed(format!(
                    "skill '{}' has no endpoint property",
                    invocation.skill
                )));
            };
            let Some(action) = invocation.action.as_deref() else {
                return Ok(ActionOutcome::failed(format!(
                    "daemon route for '{}' names no action",
                    invocation.skill
                )));
            };
            let url = format!(
                "{}/skills/{}/actions/{}",
                endpoint.trim_end_matches('/'),
                invocation.skill,
                action
            );

            let body = serde_json::json!({
                "request_id": invocation.request_id,
                "payload": invocation.payload,
                "properties": invocation.properties,
            });
            let mut request = self.http.post(&url).json(&body);
            for (name, value) in &invocation.headers {
                request = request.header(name, value);
            }
            if let Some(ref token) = invocation.token {
                request = request.bearer_auth(token);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => return Ok(ActionOutcome::failed(format!("{}: {}", url, e))),
            };

            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(ActionOutcome::target_missing(format!(
                    "daemon target not found: {}",
                    url
                )));
            }
            if !response.status().is_success() {
                return Ok(ActionOutcome::failed(format!(
                    "{} returned {}",
                    url,
                    response.status()
                )));
            }

            let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
            let output_name = body
                .get("output_name")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or(invocation.output_name);
            let payload = body.get("payload").cloned().unwrap_or(body);

            Ok(ActionOutcome::ok(output_name, payload))
        })
    }
}
