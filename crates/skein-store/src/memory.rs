use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use skein_core::error::Result;
use skein_core::traits::ActivationStore;
use skein_core::types::{Activation, ActivationPatch, RequestId, Transit};

/// In-memory activation store for tests and single-process deployments.
///
/// One mutex guards everything, which trivially makes counter increments
/// and list appends linearizable and existence checks consistent with the
/// latest write.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    activations: HashMap<String, Activation>,
    counters: HashMap<(String, String), i64>,
    lists: HashMap<(String, String), Vec<serde_json::Value>>,
    /// Insertion-ordered; upserts replace in place by `(from, to, message_id)`.
    transits: HashMap<String, Vec<Transit>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn same_key(a: &Transit, b: &Transit) -> bool {
    a.from == b.from && a.to == b.to && a.message_id == b.message_id
}

impl ActivationStore for MemoryStore {
    fn create(&self, activation: &Activation) -> BoxFuture<'_, Result<()>> {
        let activation = activation.clone();
        Box::pin(async move {
            self.lock()
                .activations
                .insert(activation.request_id.0.clone(), activation);
            Ok(())
        })
    }

    fn get(&self, request_id: &RequestId) -> BoxFuture<'_, Result<Option<Activation>>> {
        let key = request_id.0.clone();
        Box::pin(async move { Ok(self.lock().activations.get(&key).cloned()) })
    }

    fn merge(&self, request_id: &RequestId, patch: ActivationPatch) -> BoxFuture<'_, Result<()>> {
        let key = request_id.0.clone();
        Box::pin(async move {
            if let Some(activation) = self.lock().activations.get_mut(&key) {
                activation.apply(patch);
            }
            Ok(())
        })
    }

    fn exists(&self, request_id: &RequestId) -> BoxFuture<'_, Result<bool>> {
        let key = request_id.0.clone();
        Box::pin(async move { Ok(self.lock().activations.contains_key(&key)) })
    }

    fn increment(&self, request_id: &RequestId, counter: &str) -> BoxFuture<'_, Result<i64>> {
        let key = (request_id.0.clone(), counter.to_string());
        Box::pin(async move {
            let mut inner = self.lock();
            let value = inner.counters.entry(key).or_insert(0);
            *value += 1;
            Ok(*value)
        })
    }

    fn counter(&self, request_id: &RequestId, counter: &str) -> BoxFuture<'_, Result<i64>> {
        let key = (request_id.0.clone(), counter.to_string());
        Box::pin(async move { Ok(self.lock().counters.get(&key).copied().unwrap_or(0)) })
    }

    fn append(
        &self,
        request_id: &RequestId,
        key: &str,
        value: serde_json::Value,
    ) -> BoxFuture<'_, Result<i64>> {
        let key = (request_id.0.clone(), key.to_string());
        Box::pin(async move {
            let mut inner = self.lock();
            let list = inner.lists.entry(key).or_default();
            list.push(value);
            Ok(list.len() as i64)
        })
    }

    fn list(
        &self,
        request_id: &RequestId,
        key: &str,
    ) -> BoxFuture<'_, Result<Vec<serde_json::Value>>> {
        let key = (request_id.0.clone(), key.to_string());
        Box::pin(async move { Ok(self.lock().lists.get(&key).cloned().unwrap_or_default()) })
    }

    fn put_transit(&self, request_id: &RequestId, transit: &Transit) -> BoxFuture<'_, Result<()>> {
        let key = request_id.0.clone();
        let transit = transit.clone();
        Box::pin(async move {
            let mut inner = self.lock();
            let transits = inner.transits.entry(key).or_default();
            match transits.iter_mut().find(|t| same_key(t, &transit)) {
                Some(existing) => *existing = transit,
                None => transits.push(transit),
            }
            Ok(())
        })
    }

    fn transits(&self, request_id: &RequestId) -> BoxFuture<'_, Result<Vec<Transit>>> {
        let key = request_id.0.clone();
        Box::pin(async move { Ok(self.lock().transits.get(&key).cloned().unwrap_or_default()) })
    }

    fn transits_to(
        &self,
        request_id: &RequestId,
        to_prefix: &str,
    ) -> BoxFuture<'_, Result<Vec<Transit>>> {
        let key = request_id.0.clone();
        let prefix = to_prefix.to_string();
        Box::pin(async move {
            Ok(self
                .lock()
                .transits
                .get(&key)
                .map(|transits| {
                    transits
                        .iter()
                        .filter(|t| t.to.starts_with(&prefix))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn remove(&self, request_id: &RequestId) -> BoxFuture<'_, Result<()>> {
        let key = request_id.0.clone();
        Box::pin(async move {
            let mut inner = self.lock();
            inner.activations.remove(&key);
            inner.counters.retain(|(id, _), _| id != &key);
            inner.lists.retain(|(id, _), _| id != &key);
            inner.transits.remove(&key);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::types::TransitStatus;
    use std::sync::Arc;

    fn activation(id: &str) -> Activation {
        Activation::new(
            RequestId::from_string(id),
            "p",
            "agent",
            "submit",
            serde_json::Value::Null,
        )
    }

    #[tokio::test]
    async fn test_create_get_remove() {
        let store = MemoryStore::new();
        let id = RequestId::from_string("r1");

        store.create(&activation("r1")).await.unwrap();
        assert!(store.exists(&id).await.unwrap());

        store.remove(&id).await.unwrap();
        assert!(!store.exists(&id).await.unwrap());
        assert!(store.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_merge_only_touches_set_fields() {
        let store = MemoryStore::new();
        let id = RequestId::from_string("r1");
        store.create(&activation("r1")).await.unwrap();

        store
            .merge(
                &id,
                ActivationPatch {
                    response: Some(serde_json::json!({"ok": true})),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, skein_core::types::ActivationStatus::Pending);
        assert_eq!(stored.response.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_linearizable() {
        let store = Arc::new(MemoryStore::new());
        let id = RequestId::from_string("r1");

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                store.increment(&id, "done:out").await.unwrap()
            }));
        }

        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        seen.sort_unstable();
        // Every post-increment value is observed exactly once.
        assert_eq!(seen, (1..=50).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_append_returns_length_and_keeps_order() {
        let store = MemoryStore::new();
        let id = RequestId::from_string("r1");

        assert_eq!(store.append(&id, "acc", serde_json::json!(1)).await.unwrap(), 1);
        assert_eq!(store.append(&id, "acc", serde_json::json!(2)).await.unwrap(), 2);

        let list = store.list(&id, "acc").await.unwrap();
        assert_eq!(list, vec![serde_json::json!(1), serde_json::json!(2)]);
    }

    #[tokio::test]
    async fn test_transit_upsert_by_key() {
        let store = MemoryStore::new();
        let id = RequestId::from_string("r1");

        let started = Transit::started("a", "b", None, "step");
        store.put_transit(&id, &started).await.unwrap();
        store
            .put_transit(&id, &started.clone().finish(TransitStatus::Complete))
            .await
            .unwrap();

        let transits = store.transits(&id).await.unwrap();
        assert_eq!(transits.len(), 1);
        assert_eq!(transits[0].status, TransitStatus::Complete);

        // A different message id is a distinct transit.
        store
            .put_transit(&id, &Transit::started("a", "b", Some("m2".into()), "step"))
            .await
            .unwrap();
        assert_eq!(store.transits(&id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_transits_to_prefix() {
        let store = MemoryStore::new();
        let id = RequestId::from_string("r1");

        store
            .put_transit(&id, &Transit::started("in", "s1", None, "a"))
            .await
            .unwrap();
        store
            .put_transit(&id, &Transit::started("in", "s1#2", None, "b"))
            .await
            .unwrap();
        store
            .put_transit(&id, &Transit::started("s1", "out", None, "c"))
            .await
            .unwrap();

        assert_eq!(store.transits_to(&id, "s1").await.unwrap().len(), 2);
        assert_eq!(store.transits_to(&id, "out").await.unwrap().len(), 1);
    }
}
