use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::plan::Plan;

/// Unique activation identifier. Caller-supplied or generated at invoke time.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whole-activation lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActivationStatus {
    Pending,
    Retry,
    Complete,
    Error,
    Cancelled,
}

impl ActivationStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }
}

impl std::fmt::Display for ActivationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Retry => "RETRY",
            Self::Complete => "COMPLETE",
            Self::Error => "ERROR",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

/// One execution instance of a compiled plan.
///
/// The activation record is the only state shared across engine instances:
/// no in-memory call stack survives a deferred step, so everything needed
/// to finish the run lives here or in the transit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activation {
    pub request_id: RequestId,
    pub status: ActivationStatus,
    pub project_id: String,
    /// Agent definition name (or skill name for direct skill invocations).
    pub agent: String,
    /// Entry point the caller addressed.
    pub entry_point: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub response: Option<serde_json::Value>,
    /// Compiled plan pinned at invoke time. Concurrent definition edits
    /// never change the plan mid-flight.
    #[serde(default)]
    pub plan: Option<Plan>,
    /// Callback URL registered by the caller, if any.
    #[serde(default)]
    pub callback_url: Option<String>,
    /// Parent linkage for sub-agent invocations: resuming the parent is an
    /// ordinary continuation enqueue, activations are referenced by id only.
    #[serde(default)]
    pub parent: Option<ParentLink>,
    #[serde(default)]
    pub attempts: u32,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Activation {
    pub fn new(
        request_id: RequestId,
        project_id: impl Into<String>,
        agent: impl Into<String>,
        entry_point: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id,
            status: ActivationStatus::Pending,
            project_id: project_id.into(),
            agent: agent.into(),
            entry_point: entry_point.into(),
            payload,
            response: None,
            plan: None,
            callback_url: None,
            parent: None,
            attempts: 0,
            created: now,
            updated: now,
        }
    }
}

impl Activation {
    /// Apply a partial update. `None` fields are untouched.
    pub fn apply(&mut self, patch: ActivationPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(response) = patch.response {
            self.response = Some(response);
        }
        if let Some(plan) = patch.plan {
            self.plan = Some(plan);
        }
        if let Some(callback_url) = patch.callback_url {
            self.callback_url = Some(callback_url);
        }
        if let Some(parent) = patch.parent {
            self.parent = Some(parent);
        }
        if let Some(attempts) = patch.attempts {
            self.attempts = attempts;
        }
        self.updated = chrono::Utc::now();
    }
}

/// Where to resume a parent activation once a sub-agent finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentLink {
    pub request_id: RequestId,
    pub channel_id: String,
    pub output_name: String,
    #[serde(default)]
    pub message_id: Option<String>,
}

/// Partial update applied to an activation record. Fields left `None` are
/// untouched; the store merges, it never replaces the whole record.
#[derive(Debug, Clone, Default)]
pub struct ActivationPatch {
    pub status: Option<ActivationStatus>,
    pub response: Option<serde_json::Value>,
    pub plan: Option<Plan>,
    pub callback_url: Option<String>,
    pub parent: Option<ParentLink>,
    pub attempts: Option<u32>,
}

impl ActivationPatch {
    pub fn status(status: ActivationStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Step status for a single traversed edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransitStatus {
    Started,
    Complete,
    Error,
}

impl TransitStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

/// Record of one edge traversal, keyed by `(from, to, message_id)`.
/// An activation's transits collectively describe how far execution has
/// gotten and drive the completion predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transit {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub message_id: Option<String>,
    pub name: String,
    pub status: TransitStatus,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

impl Transit {
    pub fn started(
        from: impl Into<String>,
        to: impl Into<String>,
        message_id: Option<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            message_id,
            name: name.into(),
            status: TransitStatus::Started,
            start: Utc::now(),
            end: None,
        }
    }

    /// Terminal transition. Irreversible once applied via the store.
    pub fn finish(mut self, status: TransitStatus) -> Self {
        self.status = status;
        self.end = Some(Utc::now());
        self
    }
}

/// The serializable unit passed along an edge. A continuation is the sole
/// means by which execution state crosses process and callback boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Continuation {
    pub request_id: RequestId,
    pub project_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// The node the message currently sits at (the `to` side of the last
    /// traversed edge).
    pub channel_id: String,
    /// Which named output of that node produced the payload.
    #[serde(default)]
    pub output_name: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    /// Terminal status reported by an external callback ("error" marks the
    /// deferred step failed). Unset on ordinary in-plan messages.
    #[serde(default)]
    pub status: Option<String>,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub token: Option<String>,
}

impl Continuation {
    /// Follow an edge: same activation, new position and payload.
    pub fn advance(
        &self,
        channel_id: impl Into<String>,
        output_name: Option<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            request_id: self.request_id.clone(),
            project_id: self.project_id.clone(),
            session_id: self.session_id.clone(),
            channel_id: channel_id.into(),
            output_name,
            message_id: self.message_id.clone(),
            status: None,
            payload,
            properties: self.properties.clone(),
            headers: self.headers.clone(),
            token: self.token.clone(),
        }
    }
}

/// Everything an action provider needs to dispatch one step.
#[derive(Debug, Clone)]
pub struct ActionInvocation {
    pub request_id: RequestId,
    pub project_id: String,
    pub skill: String,
    pub action: Option<String>,
    /// Output name from the resolved route; providers may override it in
    /// their outcome.
    pub output_name: String,
    /// The node this invocation will report back to on async completion.
    pub channel_id: String,
    pub message_id: Option<String>,
    pub properties: HashMap<String, serde_json::Value>,
    pub payload: serde_json::Value,
    pub headers: HashMap<String, String>,
    pub token: Option<String>,
}

/// Result of one action dispatch.
#[derive(Debug, Clone, Default)]
pub struct ActionOutcome {
    /// Deferred dispatch: the step completes later via an external callback.
    pub is_async: bool,
    pub success: bool,
    pub output_name: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub error: Option<String>,
    /// The dispatch target itself was absent (retryable class of failure).
    pub target_missing: bool,
}

impl ActionOutcome {
    pub fn ok(output_name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            success: true,
            output_name: Some(output_name.into()),
            payload: Some(payload),
            ..Self::default()
        }
    }

    /// Accepted for deferred execution; a callback finishes the step.
    pub fn deferred() -> Self {
        Self {
            is_async: true,
            success: true,
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn target_missing(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            target_missing: true,
            ..Self::default()
        }
    }
}
