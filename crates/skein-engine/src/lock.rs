use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use skein_core::types::RequestId;

/// Per-activation completion locks.
///
/// The critical section covers decide-and-commit at fan-in only: holders
/// re-check the activation still exists, evaluate the completion predicate,
/// and finalize. It never spans remote invocation latency.
#[derive(Default)]
pub struct ActivationLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ActivationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, request_id: &RequestId) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .entry(request_id.0.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }

    /// Forget the lock after terminal finalize. Late acquirers get a fresh
    /// mutex and bounce off the store existence check.
    pub fn release(&self, request_id: &RequestId) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&request_id.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let locks = Arc::new(ActivationLocks::new());
        let id = RequestId::from_string("r1");
        let in_section = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let locks = locks.clone();
            let id = id.clone();
            let in_section = in_section.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(&id).await;
                let now = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                in_section.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_independent_activations_do_not_contend() {
        let locks = ActivationLocks::new();
        let _a = locks.acquire(&RequestId::from_string("a")).await;
        // Would deadlock if activations shared a lock.
        let _b = locks.acquire(&RequestId::from_string("b")).await;
    }
}
