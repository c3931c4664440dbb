use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::warn;

use skein_core::definition::RuntimeKind;
use skein_core::error::Result;
use skein_core::traits::{ActionProvider, ActivationStore};
use skein_core::types::{ActionInvocation, ActionOutcome};

/// Explicit fan-in join as a skill step. Each arrival is appended to the
/// join's accumulation key; only the arrival that completes the expected
/// count continues downstream with the ordered list, every other one
/// resolves into the no-op sink. The append returns the post-insert
/// length, so exactly one arrival observes the full count even when
/// siblings land concurrently from different processes.
pub struct MergeAction {
    store: Arc<dyn ActivationStore>,
}

impl MergeAction {
    pub fn new(store: Arc<dyn ActivationStore>) -> Self {
        Self { store }
    }
}

impl ActionProvider for MergeAction {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Merge
    }

    fn invoke(&self, invocation: ActionInvocation) -> BoxFuture<'_, Result<ActionOutcome>> {
        Box::pin(async move {
            let expected = invocation
                .properties
                .get("expected")
                .and_then(|v| v.as_i64())
                .unwrap_or(1);
            let key = format!("join:{}", invocation.channel_id);

            let arrived = self
                .store
                .append(&invocation.request_id, &key, invocation.payload.clone())
                .await?;

            if arrived < expected {
                return Ok(ActionOutcome {
                    success: true,
                    output_name: Some(crate::engine::IGNORE_OUTPUT.to_string()),
                    ..Default::default()
                });
            }
            if arrived > expected {
                warn!(
                    request_id = %invocation.request_id,
                    channel_id = %invocation.channel_id,
                    arrived,
                    expected,
                    "Merge join received more arrivals than expected"
                );
                return Ok(ActionOutcome {
                    success: true,
                    output_name: Some(crate::engine::IGNORE_OUTPUT.to_string()),
                    ..Default::default()
                });
            }

            let items = self.store.list(&invocation.request_id, &key).await?;
            Ok(ActionOutcome::ok(
                invocation.output_name,
                serde_json::Value::Array(items),
            ))
        })
    }
}
