use serde::{Deserialize, Serialize};

use crate::types::{ActivationStatus, RequestId};

/// Lifecycle notification published by the engine. Fire-and-forget:
/// consumers (log shipping, live subscriptions) are never awaited for
/// correctness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LifecycleEvent {
    /// An invocation was observed at an agent entry point.
    AgentInput {
        request_id: RequestId,
        agent: String,
        payload: serde_json::Value,
    },
    /// An activation reached its terminal result.
    AgentOutput {
        request_id: RequestId,
        agent: String,
        status: ActivationStatus,
        response: serde_json::Value,
    },
    /// A skill step began.
    SkillInput {
        request_id: RequestId,
        channel_id: String,
        skill: String,
    },
    /// A skill step ended.
    SkillOutput {
        request_id: RequestId,
        channel_id: String,
        skill: String,
        success: bool,
    },
}

impl LifecycleEvent {
    /// Dotted event name used by downstream fan-out subscribers.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AgentInput { .. } => "agent.input",
            Self::AgentOutput { .. } => "agent.output",
            Self::SkillInput { .. } => "skill.input",
            Self::SkillOutput { .. } => "skill.output",
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: LifecycleEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
