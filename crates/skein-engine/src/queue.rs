use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

use skein_core::types::Continuation;

use crate::engine::{Engine, InvokeRequest};

/// Work handed to the asynchronous path. Enqueuing never blocks the caller
/// that triggered it; the semaphore bounds how many jobs process at once.
pub(crate) enum Job {
    /// A fresh top-level invocation (also how sub-agent steps start).
    Invoke(InvokeRequest),
    /// Continue an activation from inside the plan.
    Process(Continuation),
    /// External callback re-entry: settle the deferred transit, then
    /// continue.
    Resume(Continuation),
}

pub(crate) async fn run(engine: Arc<Engine>, mut rx: mpsc::UnboundedReceiver<Job>) {
    let semaphore = Arc::new(Semaphore::new(engine.max_concurrent()));
    let cancel = engine.cancel_token();
    info!(max_concurrent = engine.max_concurrent(), "Engine work queue started");

    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let engine = engine.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = engine.run_job(job).await {
                warn!(error = %e, "Queued job failed");
            }
        });
    }

    info!("Engine work queue stopped");
}
