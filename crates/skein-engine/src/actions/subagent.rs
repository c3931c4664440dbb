use futures::future::BoxFuture;
use tokio::sync::mpsc;

use skein_core::definition::RuntimeKind;
use skein_core::error::Result;
use skein_core::traits::ActionProvider;
use skein_core::types::{ActionInvocation, ActionOutcome, ParentLink};

use super::string_property;
use crate::engine::InvokeRequest;
use crate::queue::Job;

/// Invoke another agent as a step. The child activation goes through the
/// same asynchronous work path as any top-level invocation and carries a
/// parent link by id; when it finalizes, the parent resumes exactly like
/// an external callback would resume it. No in-memory pointer ties the
/// two activations together.
pub struct SubAgentAction {
    queue_tx: mpsc::UnboundedSender<Job>,
}

impl SubAgentAction {
    pub(crate) fn new(queue_tx: mpsc::UnboundedSender<Job>) -> Self {
        Self { queue_tx }
    }
}

impl ActionProvider for SubAgentAction {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::SubAgent
    }

    fn invoke(&self, invocation: ActionInvocation) -> BoxFuture<'_, Result<ActionOutcome>> {
        Box::pin(async move {
            let Some(agent) = string_property(&invocation.properties, "agent") else {
                return Ok(ActionOutcome::failed(format!(
                    "skill '{}' has no agent property",
                    invocation.skill
                )));
            };
            let project_id = string_property(&invocation.properties, "project")
                .unwrap_or_else(|| invocation.project_id.clone());

            let request = InvokeRequest {
                project_id,
                name: agent,
                entry_point: string_property(&invocation.properties, "entry_point"),
                payload: invocation.payload.clone(),
                properties: Default::default(),
                headers: invocation.headers.clone(),
                token: invocation.token.clone(),
                request_id: None,
                session_id: None,
                callback_url: None,
                synchronous: false,
                parent: Some(ParentLink {
                    request_id: invocation.request_id.clone(),
                    channel_id: invocation.channel_id.clone(),
                    output_name: invocation.output_name.clone(),
                    message_id: invocation.message_id.clone(),
                }),
            };

            if self.queue_tx.send(Job::Invoke(request)).is_err() {
                return Ok(ActionOutcome::failed("engine is shutting down"));
            }
            Ok(ActionOutcome::deferred())
        })
    }
}
