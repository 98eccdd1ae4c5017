use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use weir_core::{ControllerConfig, ListOptions, Object, ObjectKey, RemoteSource, WeirError, WeirResult};
use weir_queue::WorkQueue;
use weir_reflector::Reflector;
use weir_store::{Indexer, Lister};

use crate::dispatch::{Dispatcher, HandlerFailure};
use crate::handler::{Handler, Handlers};

#[derive(Default)]
struct Tasks {
    /// Token the reflector was started with.
    owner: Option<CancellationToken>,
    reflector: bool,
    workers: bool,
    handles: Vec<JoinHandle<()>>,
}

/// One cached collection: reflector, store, queue and a dispatcher pool.
///
/// Nothing runs until [`Controller::sync`] or [`Controller::start`]. Both are
/// idempotent; the token passed first owns every spawned task. A controller
/// runs once: after that token fires its queue is shut down, `start` is a
/// no-op and `sync` returns [`WeirError::Cancelled`].
pub struct Controller<K: Object> {
    name: String,
    namespace: Option<String>,
    source: Arc<dyn RemoteSource<K>>,
    config: ControllerConfig,
    list_options: ListOptions,
    dispatcher: Arc<Dispatcher<K>>,
    tasks: Mutex<Tasks>,
}

impl<K: Object> Controller<K> {
    /// `resource` names the collection in logs and `NotFound` errors.
    pub fn new(resource: &str, source: Arc<dyn RemoteSource<K>>, config: ControllerConfig) -> Self {
        let store = Arc::new(Indexer::new());
        let queue = WorkQueue::new(resource, config.retry_backoff());
        let (errors, _) = broadcast::channel(config.error_sink_cap.max(1));
        let dispatcher = Arc::new(Dispatcher {
            name: resource.to_string(),
            store,
            queue,
            handlers: Arc::new(Handlers::new()),
            errors,
            max_retries: config.max_retries,
        });
        Self {
            name: resource.to_string(),
            namespace: None,
            source,
            config,
            list_options: ListOptions::default(),
            dispatcher,
            tasks: Mutex::new(Tasks::default()),
        }
    }

    /// Scope label for logs; the source itself decides what is visible.
    pub fn in_namespace(mut self, namespace: Option<&str>) -> Self {
        self.namespace = namespace.map(str::to_string);
        self
    }

    /// Label/field selectors applied to every list and watch.
    pub fn with_list_options(mut self, opts: ListOptions) -> Self {
        self.list_options = opts;
        self
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> { self.tasks.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn name(&self) -> &str { &self.name }

    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }

    pub fn config(&self) -> &ControllerConfig { &self.config }

    /// Raw store shared with the reflector.
    pub fn informer(&self) -> &Arc<Indexer<K>> { &self.dispatcher.store }

    pub fn lister(&self) -> Lister<K> { Lister::new(Arc::clone(&self.dispatcher.store), self.name.clone()) }

    pub fn queue(&self) -> &WorkQueue { &self.dispatcher.queue }

    pub fn has_synced(&self) -> bool { self.dispatcher.store.has_synced() }

    /// The owning token has fired; the controller cannot be started again.
    pub fn is_stopped(&self) -> bool { self.tasks().owner.as_ref().is_some_and(CancellationToken::is_cancelled) }

    /// Append a handler; takes effect from the next dispatch.
    pub fn add_handler(&self, name: &str, handler: impl Handler<K> + 'static) {
        self.add_shared_handler(name, Arc::new(handler));
    }

    pub fn add_shared_handler(&self, name: &str, handler: Arc<dyn Handler<K>>) {
        self.dispatcher.handlers.add(name, handler);
        debug!(controller = %self.name, handler = %name, "controller: handler registered");
    }

    pub fn handler_names(&self) -> Vec<String> { self.dispatcher.handlers.names() }

    /// Mark a key dirty without any remote event.
    pub fn enqueue(&self, namespace: Option<&str>, name: &str) { self.dispatcher.queue.add(ObjectKey::new(namespace, name)); }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<HandlerFailure> { self.dispatcher.errors.subscribe() }

    fn ensure_reflector(&self, tasks: &mut Tasks, token: &CancellationToken) {
        if tasks.reflector {
            return;
        }
        tasks.reflector = true;
        tasks.owner = Some(token.clone());
        let reflector = Reflector::new(
            &self.name,
            Arc::clone(&self.source),
            Arc::clone(&self.dispatcher.store),
            self.dispatcher.queue.clone(),
            &self.config,
        )
        .with_list_options(self.list_options.clone());
        tasks.handles.push(reflector.spawn(token.clone()));

        if let Some(period) = self.config.resync_period() {
            let store = Arc::clone(&self.dispatcher.store);
            let queue = self.dispatcher.queue.clone();
            let token = token.clone();
            let name = self.name.clone();
            tasks.handles.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tick.tick() => {
                            let keys = store.keys();
                            debug!(controller = %name, count = keys.len(), "controller: resync");
                            for key in keys {
                                queue.add(key);
                            }
                        }
                    }
                }
            }));
        }

        let queue = self.dispatcher.queue.clone();
        let token = token.clone();
        tasks.handles.push(tokio::spawn(async move {
            token.cancelled().await;
            queue.shut_down();
        }));
        info!(controller = %self.name, namespace = ?self.namespace, "controller: reflector started");
    }

    /// Start the reflector if needed and wait for the initial listing. When no
    /// workers are running, the keys queued at that point are dispatched
    /// inline once each; requeues from failures wait for the next call.
    pub async fn sync(&self, token: &CancellationToken) -> WeirResult<()> {
        if self.is_stopped() {
            warn!(controller = %self.name, "controller: already stopped; sync refused");
            return Err(WeirError::Cancelled);
        }
        let workers = {
            let mut tasks = self.tasks();
            self.ensure_reflector(&mut tasks, token);
            tasks.workers
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(WeirError::Cancelled),
            _ = self.dispatcher.store.wait_synced() => {}
        }
        if !workers {
            let pending = self.dispatcher.queue.len();
            let mut drained = 0usize;
            while drained < pending {
                let Some(key) = self.dispatcher.queue.try_get() else { break };
                self.dispatcher.process(key).await;
                drained += 1;
            }
            debug!(controller = %self.name, drained, "controller: drained queue inline");
        }
        Ok(())
    }

    /// Start the reflector (if needed) and `threadiness` dispatch workers.
    pub fn start(&self, token: &CancellationToken, threadiness: usize) {
        if self.is_stopped() {
            warn!(controller = %self.name, "controller: already stopped; start ignored");
            return;
        }
        let mut tasks = self.tasks();
        self.ensure_reflector(&mut tasks, token);
        if tasks.workers {
            return;
        }
        tasks.workers = true;
        let n = threadiness.max(1);
        for id in 0..n {
            let dispatcher = Arc::clone(&self.dispatcher);
            tasks.handles.push(tokio::spawn(dispatcher.run_worker(id)));
        }
        info!(controller = %self.name, threadiness = n, "controller: workers started");
    }

    /// Wait for every spawned task to exit; returns at once if none were started.
    pub async fn stopped(&self) {
        let handles = std::mem::take(&mut self.tasks().handles);
        for handle in handles {
            let _ = handle.await;
        }
    }
}
