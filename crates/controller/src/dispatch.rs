use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use weir_core::{HandlerError, Object, ObjectKey};
use weir_queue::WorkQueue;
use weir_store::Indexer;

use crate::handler::Handlers;

/// One failed dispatch, as published on the controller's error sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub key: ObjectKey,
    /// Name the failing handler was registered under.
    pub handler: String,
    pub error: String,
    /// Requeues already spent on this key before this failure.
    pub retries: u32,
    /// `true` when the key was dropped instead of requeued.
    pub terminal: bool,
}

/// Runs every registered handler for one key at a time.
pub(crate) struct Dispatcher<K> {
    pub name: String,
    pub store: Arc<Indexer<K>>,
    pub queue: WorkQueue,
    pub handlers: Arc<Handlers<K>>,
    pub errors: broadcast::Sender<HandlerFailure>,
    pub max_retries: Option<u32>,
}

impl<K: Object> Dispatcher<K> {
    pub async fn run_worker(self: Arc<Self>, id: usize) {
        debug!(controller = %self.name, worker = id, "dispatch: worker started");
        while let Some(key) = self.queue.get().await {
            self.process(key).await;
        }
        info!(controller = %self.name, worker = id, "dispatch: worker stopped");
    }

    /// Dispatch `key` against the current cache, then release it.
    pub async fn process(&self, key: ObjectKey) {
        let t0 = Instant::now();
        let obj = self.store.get(&key);
        match self.invoke(&key, obj).await {
            Ok(()) => self.queue.forget(&key),
            Err((handler, err)) => self.fail(&key, handler, err),
        }
        self.queue.done(&key);
        histogram!("weir_dispatch_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("weir_dispatch_total", 1);
    }

    async fn invoke(&self, key: &ObjectKey, obj: Option<Arc<K>>) -> Result<(), (String, HandlerError)> {
        let handlers = self.handlers.snapshot();
        for h in handlers.iter() {
            if let Err(e) = h.handler.handle(key, obj.clone()).await {
                return Err((h.name.clone(), e));
            }
        }
        Ok(())
    }

    fn fail(&self, key: &ObjectKey, handler: String, err: HandlerError) {
        counter!("weir_handler_errors_total", 1);
        let retries = self.queue.num_requeues(key);
        let exhausted = self.max_retries.is_some_and(|max| retries >= max);
        let terminal = err.is_terminal() || exhausted;
        if terminal {
            self.queue.forget(key);
            error!(controller = %self.name, key = %key, handler = %handler, retries, error = %err, "dispatch: giving up on key");
        } else {
            let delay = self.queue.add_rate_limited(key.clone());
            warn!(
                controller = %self.name,
                key = %key,
                handler = %handler,
                retries,
                retry_in_ms = %delay.as_millis(),
                error = %err,
                "dispatch: handler failed; requeued"
            );
        }
        // no subscribers is fine
        let _ = self.errors.send(HandlerFailure { key: key.clone(), handler, error: err.to_string(), retries, terminal });
    }
}
