use futures::future::BoxFuture;

use skein_core::definition::RuntimeKind;
use skein_core::error::Result;
use skein_core::traits::ActionProvider;
use skein_core::types::{ActionInvocation, ActionOutcome};

use super::string_property;

/// Out-of-process job submission. Acceptance means deferred: the step's
/// transit stays open until the remote runner posts a callback, possibly
/// to a different engine instance, arbitrarily later.
pub struct JobAction {
    http: reqwest::Client,
}

impl JobAction {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl ActionProvider for JobAction {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Job
    }

    fn invoke(&self, invocation: ActionInvocation) -> BoxFuture<'_, Result<ActionOutcome>> {
        Box::pin(async move {
            let Some(endpoint) = string_property(&invocation.properties, "endpoint") else {
                return Ok(ActionOutcome::failed(format!(
                    "skill '{}' has no endpoint property",
                    invocation.skill
                )));
            };
            let url = format!("{}/jobs", endpoint.trim_end_matches('/'));

            // Everything the runner needs to call back in: the activation
            // id and the channel the continuation should re-enter at.
            let body = serde_json::json!({
                "request_id": invocation.request_id,
                "channel_id": invocation.channel_id,
                "message_id": invocation.message_id,
                "output_name": invocation.output_name,
                "skill": invocation.skill,
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
                    "job runner not found: {}",
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

            Ok(ActionOutcome::deferred())
        })
    }
}
