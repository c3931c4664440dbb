use futures::future::BoxFuture;

use crate::definition::{AgentDefinition, RuntimeKind, SkillDefinition};
use crate::error::Result;
use crate::types::*;

/// Resource catalog — agent and skill definition lookup, project-scoped
/// with shared-namespace fallback.
pub trait ResourceCatalog: Send + Sync + 'static {
    fn agent(
        &self,
        project_id: &str,
        name: &str,
    ) -> BoxFuture<'_, Result<Option<AgentDefinition>>>;

    fn skill(
        &self,
        project_id: &str,
        name: &str,
    ) -> BoxFuture<'_, Result<Option<SkillDefinition>>>;
}

/// Secret resolution — all-or-nothing per call: properties never partially
/// resolve.
pub trait SecretStore: Send + Sync + 'static {
    fn secrets(
        &self,
        project_id: &str,
        keys: &[String],
    ) -> BoxFuture<'_, Result<Vec<String>>>;
}

/// Action provider — one per runtime kind, polymorphic over daemon/job/
/// rest/script/merge/sub-agent dispatch.
pub trait ActionProvider: Send + Sync + 'static {
    fn kind(&self) -> RuntimeKind;

    fn invoke(&self, invocation: ActionInvocation) -> BoxFuture<'_, Result<ActionOutcome>>;
}

/// Activation store — the persistence contract the engine depends on.
///
/// Consistency requirements: counter increments and list appends must be
/// linearizable per key (the engine trusts the returned post-update value
/// for completion decisions), and `exists`/`get` must observe the latest
/// write in the same logical session — the fan-in race-safety check relies
/// on it.
pub trait ActivationStore: Send + Sync + 'static {
    fn create(&self, activation: &Activation) -> BoxFuture<'_, Result<()>>;

    fn get(&self, request_id: &RequestId) -> BoxFuture<'_, Result<Option<Activation>>>;

    /// Merge-set top-level fields; `None` fields are left untouched.
    fn merge(
        &self,
        request_id: &RequestId,
        patch: ActivationPatch,
    ) -> BoxFuture<'_, Result<()>>;

    fn exists(&self, request_id: &RequestId) -> BoxFuture<'_, Result<bool>>;

    /// Atomically increment a named counter, returning the new value.
    fn increment(&self, request_id: &RequestId, counter: &str) -> BoxFuture<'_, Result<i64>>;

    fn counter(&self, request_id: &RequestId, counter: &str) -> BoxFuture<'_, Result<i64>>;

    /// Append a value to an ordered list, returning the new length.
    fn append(
        &self,
        request_id: &RequestId,
        key: &str,
        value: serde_json::Value,
    ) -> BoxFuture<'_, Result<i64>>;

    fn list(&self, request_id: &RequestId, key: &str) -> BoxFuture<'_, Result<Vec<serde_json::Value>>>;

    /// Set a transit by its `(from, to, message_id)` key. Re-setting an
    /// existing key overwrites; status changes are always explicit.
    fn put_transit(&self, request_id: &RequestId, transit: &Transit) -> BoxFuture<'_, Result<()>>;

    fn transits(&self, request_id: &RequestId) -> BoxFuture<'_, Result<Vec<Transit>>>;

    /// All transits whose `to` starts with the given prefix. A channel may
    /// have been targeted by more than one transit (retries, fan-in).
    fn transits_to(
        &self,
        request_id: &RequestId,
        to_prefix: &str,
    ) -> BoxFuture<'_, Result<Vec<Transit>>>;

    /// Remove every key under the activation's namespace.
    fn remove(&self, request_id: &RequestId) -> BoxFuture<'_, Result<()>>;
}
