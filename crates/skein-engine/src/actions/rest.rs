use futures::future::BoxFuture;

use skein_core::definition::RuntimeKind;
use skein_core::error::Result;
use skein_core::traits::ActionProvider;
use skein_core::types::{ActionInvocation, ActionOutcome};

use super::string_property;

/// Generic outbound HTTP call: the `url` property is the target, the
/// payload travels as the request body (except for GET), and the response
/// body becomes the step's output payload.
pub struct RestAction {
    http: reqwest::Client,
}

impl RestAction {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl ActionProvider for RestAction {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Rest
    }

    fn invoke(&self, invocation: ActionInvocation) -> BoxFuture<'_, Result<ActionOutcome>> {
        Box::pin(async move {
            let Some(url) = string_property(&invocation.properties, "url") else {
                return Ok(ActionOutcome::failed(format!(
                    "skill '{}' has no url property",
                    invocation.skill
                )));
            };
            let method = string_property(&invocation.properties, "method")
                .unwrap_or_else(|| "POST".to_string())
                .to_uppercase();

            let mut request = match method.as_str() {
                "GET" => self.http.get(&url),
                "POST" => self.http.post(&url).json(&invocation.payload),
                "PUT" => self.http.put(&url).json(&invocation.payload),
                "DELETE" => self.http.delete(&url),
                other => {
                    return Ok(ActionOutcome::failed(format!(
                        "unsupported method '{}' for '{}'",
                        other, invocation.skill
                    )))
                }
            };
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
                return Ok(ActionOutcome::target_missing(format!("not found: {}", url)));
            }
            if !response.status().is_success() {
                return Ok(ActionOutcome::failed(format!(
                    "{} returned {}",
                    url,
                    response.status()
                )));
            }

            let payload: serde_json::Value =
                response.json().await.unwrap_or(serde_json::Value::Null);
            Ok(ActionOutcome::ok(invocation.output_name, payload))
        })
    }
}
