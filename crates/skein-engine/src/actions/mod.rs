//! Action providers — one per runtime kind, constructed through a
//! memoizing factory. Providers are tagged implementations of a single
//! `invoke` capability, never an inheritance hierarchy.

pub mod daemon;
pub mod job;
pub mod merge;
pub mod rest;
pub mod script;
pub mod subagent;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use skein_core::definition::RuntimeKind;
use skein_core::traits::{ActionProvider, ActivationStore};

use crate::queue::Job;

pub use daemon::DaemonAction;
pub use job::JobAction;
pub use merge::MergeAction;
pub use rest::RestAction;
pub use script::ScriptAction;
pub use subagent::SubAgentAction;

/// Builds and memoizes one provider instance per runtime kind.
/// `register` replaces the built-in provider for a kind; tests and
/// embedders use it to install their own dispatch.
pub struct ProviderFactory {
    http: reqwest::Client,
    store: Arc<dyn ActivationStore>,
    queue_tx: mpsc::UnboundedSender<Job>,
    cache: Mutex<HashMap<RuntimeKind, Arc<dyn ActionProvider>>>,
}

impl ProviderFactory {
    pub(crate) fn new(
        http: reqwest::Client,
        store: Arc<dyn ActivationStore>,
        queue_tx: mpsc::UnboundedSender<Job>,
    ) -> Self {
        Self {
            http,
            store,
            queue_tx,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, provider: Arc<dyn ActionProvider>) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(provider.kind(), provider);
    }

    pub fn provider(&self, kind: RuntimeKind) -> Arc<dyn ActionProvider> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .entry(kind)
            .or_insert_with(|| self.build(kind))
            .clone()
    }

    fn build(&self, kind: RuntimeKind) -> Arc<dyn ActionProvider> {
        match kind {
            RuntimeKind::Daemon => Arc::new(DaemonAction::new(self.http.clone())),
            RuntimeKind::Job => Arc::new(JobAction::new(self.http.clone())),
            RuntimeKind::Rest => Arc::new(RestAction::new(self.http.clone())),
            RuntimeKind::Script => Arc::new(ScriptAction::new()),
            RuntimeKind::Merge => Arc::new(MergeAction::new(self.store.clone())),
            RuntimeKind::SubAgent => Arc::new(SubAgentAction::new(self.queue_tx.clone())),
        }
    }
}

/// Read a string property, e.g. an endpoint or target name.
pub(crate) fn string_property(
    properties: &HashMap<String, serde_json::Value>,
    key: &str,
) -> Option<String> {
    properties.get(key).and_then(|v| v.as_str()).map(str::to_string)
}
