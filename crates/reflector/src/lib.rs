//! Weir reflector: keeps an [`Indexer`] in step with a [`RemoteSource`].
//!
//! List, replace the store, watch from the listed version, apply events. A
//! watch the server closes cleanly is resumed from the last version seen
//! (events or bookmarks); any other termination backs off and starts over
//! with a fresh list. Errors never end the loop, only cancellation does.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use metrics::{counter, histogram};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use weir_core::{Backoff, ControllerConfig, ListOptions, Object, ObjectKey, RemoteSource, WatchEvent, WeirError};
use weir_queue::WorkQueue;
use weir_store::{Indexer, PutOutcome};

/// A watch that ends sooner than this without delivering anything does not
/// reset the backoff.
const MIN_HEALTHY_WATCH: Duration = Duration::from_secs(1);

/// Why a watch stopped.
#[derive(Debug)]
enum WatchEnd {
    Cancelled,
    /// Server closed the stream.
    Closed,
    /// Version too old, relist required.
    Expired,
    /// Periodic relist is due.
    Relist,
    Failed(WeirError),
}

struct Watched {
    end: WatchEnd,
    /// Newest collection version observed, to resume from.
    last_rv: Option<String>,
    /// Delivered at least one event or stayed open for [`MIN_HEALTHY_WATCH`].
    healthy: bool,
}

pub struct Reflector<K: Object> {
    name: String,
    source: Arc<dyn RemoteSource<K>>,
    store: Arc<Indexer<K>>,
    queue: WorkQueue,
    opts: ListOptions,
    backoff: Backoff,
    relist_period: Option<Duration>,
    watch_timeout_secs: u32,
}

impl<K: Object> Reflector<K> {
    pub fn new(
        name: &str,
        source: Arc<dyn RemoteSource<K>>,
        store: Arc<Indexer<K>>,
        queue: WorkQueue,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            name: name.to_string(),
            source,
            store,
            queue,
            opts: ListOptions::default(),
            backoff: config.watch_backoff(),
            relist_period: config.relist_period(),
            watch_timeout_secs: config.watch_timeout_secs,
        }
    }

    /// Restrict list and watch with label/field selectors.
    pub fn with_list_options(mut self, opts: ListOptions) -> Self {
        self.opts = ListOptions { resource_version: None, ..opts };
        self
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> { tokio::spawn(self.run(cancel)) }

    pub async fn run(self, cancel: CancellationToken) {
        info!(reflector = %self.name, "reflector: started");
        // grows across list/watch cycles until a watch proves healthy
        let mut attempt: u32 = 0;
        let mut resume: Option<String> = None;
        loop {
            let from = match resume.take() {
                Some(rv) => Some(rv),
                None => {
                    let listed = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        r = self.list_and_replace() => r,
                    };
                    match listed {
                        Ok(rv) => rv,
                        Err(e) => {
                            counter!("weir_reflector_list_errors_total", 1);
                            warn!(reflector = %self.name, error = %e, attempt, "reflector: list failed; serving stale cache");
                            if !self.pause(&mut attempt, &cancel).await {
                                break;
                            }
                            continue;
                        }
                    }
                }
            };
            let watched = self.watch_from(from, &cancel).await;
            if watched.healthy {
                attempt = 0;
            }
            match watched.end {
                WatchEnd::Cancelled => break,
                WatchEnd::Relist => {
                    debug!(reflector = %self.name, "reflector: periodic relist");
                    continue;
                }
                WatchEnd::Closed => {
                    info!(reflector = %self.name, rv = ?watched.last_rv, "reflector: watch closed, resuming");
                    resume = watched.last_rv;
                }
                WatchEnd::Expired => info!(reflector = %self.name, "reflector: watch expired, resync needed"),
                WatchEnd::Failed(e) => warn!(reflector = %self.name, error = %e, attempt, "reflector: watch failed"),
            }
            counter!("weir_reflector_watch_restarts_total", 1);
            if !self.pause(&mut attempt, &cancel).await {
                break;
            }
        }
        info!(reflector = %self.name, "reflector: stopped");
    }

    // Sleep out the current backoff step. False when cancelled meanwhile.
    async fn pause(&self, attempt: &mut u32, cancel: &CancellationToken) -> bool {
        let delay = self.backoff.delay(*attempt);
        *attempt = attempt.saturating_add(1);
        debug!(reflector = %self.name, delay_ms = %delay.as_millis(), "reflector: backing off");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Full list, atomic replace, enqueue every changed or vanished key.
    /// Returns the collection version to watch from.
    pub async fn list_and_replace(&self) -> Result<Option<String>, WeirError> {
        let t0 = Instant::now();
        let list = self.source.list(&self.opts).await?;
        let count = list.items.len();
        let diff = self.store.replace(list.items);
        let (upserted, deleted) = (diff.upserted.len(), diff.deleted.len());
        for key in diff.upserted.into_iter().chain(diff.deleted) {
            self.queue.add(key);
        }
        self.store.mark_synced();
        counter!("weir_reflector_lists_total", 1);
        histogram!("weir_reflector_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(
            reflector = %self.name,
            count,
            upserted,
            deleted,
            rv = ?list.resource_version,
            took_ms = %t0.elapsed().as_millis(),
            "reflector: listed"
        );
        Ok(list.resource_version)
    }

    /// Apply one event to the store and enqueue its key when something changed.
    pub fn apply(&self, ev: WatchEvent<K>) -> Option<ObjectKey> {
        match ev {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                let key = ObjectKey::for_object(&obj);
                match self.store.put_if_newer(obj) {
                    PutOutcome::Stale => {
                        counter!("weir_reflector_stale_events_total", 1);
                        debug!(reflector = %self.name, key = %key, "reflector: stale event discarded");
                        None
                    }
                    _ => {
                        counter!("weir_reflector_events_total", 1);
                        self.queue.add(key.clone());
                        Some(key)
                    }
                }
            }
            WatchEvent::Deleted(obj) => {
                let key = ObjectKey::for_object(&obj);
                self.store.delete(&key)?;
                counter!("weir_reflector_events_total", 1);
                self.queue.add(key.clone());
                Some(key)
            }
            WatchEvent::Bookmark(_) => None,
        }
    }

    async fn watch_from(&self, rv: Option<String>, cancel: &CancellationToken) -> Watched {
        let opts = ListOptions { resource_version: rv, timeout_secs: Some(self.watch_timeout_secs), ..self.opts.clone() };
        let mut last_rv = opts.resource_version.clone();
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Watched { end: WatchEnd::Cancelled, last_rv, healthy: false },
            s = self.source.watch(&opts) => s,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(WeirError::Expired(_)) => return Watched { end: WatchEnd::Expired, last_rv, healthy: false },
            Err(e) => return Watched { end: WatchEnd::Failed(e), last_rv, healthy: false },
        };
        debug!(reflector = %self.name, rv = ?last_rv, "reflector: watching");
        let opened_at = tokio::time::Instant::now();
        let relist_at = self.relist_period.map(|p| opened_at + p);
        let mut seen = 0usize;
        let end = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break WatchEnd::Cancelled,
                _ = until(relist_at) => break WatchEnd::Relist,
                n = stream.next() => n,
            };
            match next {
                None => break WatchEnd::Closed,
                Some(Err(WeirError::Expired(_))) => break WatchEnd::Expired,
                Some(Err(e)) => break WatchEnd::Failed(e),
                Some(Ok(ev)) => {
                    seen += 1;
                    if let Some(rv) = ev.resource_version() {
                        last_rv = Some(rv.to_string());
                    }
                    self.apply(ev);
                }
            }
        };
        let healthy = seen > 0 || opened_at.elapsed() >= MIN_HEALTHY_WATCH || matches!(end, WatchEnd::Relist);
        debug!(reflector = %self.name, rv = ?last_rv, seen, healthy, end = ?end, "reflector: watch ended");
        Watched { end, last_rv, healthy }
    }
}

async fn until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
