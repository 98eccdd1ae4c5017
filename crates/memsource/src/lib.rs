//! In-memory remote source.
//!
//! Behaves like a tiny API server for one resource type: every write bumps a
//! global revision, watches replay retained history after the requested
//! version and then follow live changes, and objects carrying finalizers are
//! only marked for deletion. Fault hooks let tests break lists and watches.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tokio::sync::broadcast;
use tracing::debug;
use weir_core::{
    DeleteOptions, LabelSelector, ListOptions, Object, ObjectKey, ObjectList, RemoteSource, WatchEvent, WatchStream,
    WeirError, WeirResult,
};

const HISTORY_CAP: usize = 1024;
const FEED_CAP: usize = 4096;

#[derive(Clone)]
enum Feed<K> {
    Event(WatchEvent<K>),
    Close,
    Expire,
}

struct State<K> {
    items: BTreeMap<ObjectKey, K>,
    revision: u64,
    history: VecDeque<(u64, WatchEvent<K>)>,
    // revisions at or below this are gone from history
    compacted: u64,
    fail_lists: usize,
    fail_watches: usize,
}

struct Shared<K> {
    state: Mutex<State<K>>,
    feed: broadcast::Sender<Feed<K>>,
    lists: AtomicUsize,
    watches: AtomicUsize,
}

/// Handle scoped to a namespace (or the whole collection). Clones share state.
pub struct MemorySource<K> {
    shared: Arc<Shared<K>>,
    namespace: Option<String>,
    resource: String,
}

impl<K> Clone for MemorySource<K> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared), namespace: self.namespace.clone(), resource: self.resource.clone() }
    }
}

struct Filter {
    namespace: Option<String>,
    labels: LabelSelector,
    // (field, value) pairs; only metadata.name and metadata.namespace are supported
    fields: Vec<(String, String)>,
}

impl Filter {
    fn new(namespace: Option<&str>, opts: &ListOptions) -> WeirResult<Self> {
        let labels = match opts.label_selector.as_deref() {
            Some(s) => LabelSelector::parse(s)?,
            None => LabelSelector::everything(),
        };
        let mut fields = Vec::new();
        for term in opts.field_selector.as_deref().unwrap_or("").split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (field, want) = term
                .split_once("==")
                .or_else(|| term.split_once('='))
                .ok_or_else(|| WeirError::Invalid(format!("unsupported field selector: {term}")))?;
            let field = field.trim();
            if field != "metadata.name" && field != "metadata.namespace" {
                return Err(WeirError::Invalid(format!("unsupported field: {field}")));
            }
            fields.push((field.to_string(), want.trim().to_string()));
        }
        Ok(Self { namespace: namespace.map(str::to_string), labels, fields })
    }

    fn matches<K: Object>(&self, obj: &K) -> bool {
        let meta = obj.meta();
        if let Some(ns) = &self.namespace {
            if meta.namespace.as_deref() != Some(ns.as_str()) {
                return false;
            }
        }
        let fields_ok = self.fields.iter().all(|(field, want)| {
            let have = if field == "metadata.name" { meta.name.as_deref() } else { meta.namespace.as_deref() };
            have.unwrap_or("") == want
        });
        fields_ok && self.labels.matches_object(obj)
    }
}

impl<K: Object> MemorySource<K> {
    /// Cluster-wide source; `resource` names the collection in errors.
    pub fn new(resource: &str) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAP);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    items: BTreeMap::new(),
                    revision: 0,
                    history: VecDeque::new(),
                    compacted: 0,
                    fail_lists: 0,
                    fail_watches: 0,
                }),
                feed,
                lists: AtomicUsize::new(0),
                watches: AtomicUsize::new(0),
            }),
            namespace: None,
            resource: resource.to_string(),
        }
    }

    /// Same collection, restricted to `namespace`.
    pub fn namespaced(&self, namespace: &str) -> Self {
        Self { namespace: Some(namespace.to_string()), ..self.clone() }
    }

    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }

    fn lock(&self) -> MutexGuard<'_, State<K>> { self.shared.state.lock().unwrap_or_else(PoisonError::into_inner) }

    fn key_for(&self, name: &str) -> ObjectKey { ObjectKey::new(self.namespace.as_deref(), name) }

    fn not_found(&self, name: &str) -> WeirError { WeirError::not_found(self.resource.clone(), name) }

    // Stamp the next revision, record it and fan it out. Caller holds the lock.
    fn commit(&self, st: &mut State<K>, obj: K, deleted: bool, existed: bool) -> K {
        self.commit_with(st, obj, deleted, existed, true)
    }

    fn commit_with(&self, st: &mut State<K>, mut obj: K, deleted: bool, existed: bool, publish: bool) -> K {
        st.revision += 1;
        obj.meta_mut().resource_version = Some(st.revision.to_string());
        let key = ObjectKey::for_object(&obj);
        let ev = if deleted {
            st.items.remove(&key);
            WatchEvent::Deleted(obj.clone())
        } else {
            st.items.insert(key, obj.clone());
            if existed { WatchEvent::Modified(obj.clone()) } else { WatchEvent::Added(obj.clone()) }
        };
        if !publish {
            return obj;
        }
        st.history.push_back((st.revision, ev.clone()));
        while st.history.len() > HISTORY_CAP {
            if let Some((rev, _)) = st.history.pop_front() {
                st.compacted = rev;
            }
        }
        // no receivers is fine
        let _ = self.shared.feed.send(Feed::Event(ev));
        obj
    }

    fn scope(&self, mut obj: K) -> WeirResult<K> {
        if let Some(ns) = &self.namespace {
            match obj.meta().namespace.as_deref() {
                None | Some("") => obj.meta_mut().namespace = Some(ns.clone()),
                Some(other) if other != ns => {
                    return Err(WeirError::Invalid(format!("object namespace {other:?} outside scope {ns:?}")));
                }
                Some(_) => {}
            }
        }
        if obj.meta().name.as_deref().unwrap_or("").is_empty() {
            return Err(WeirError::Invalid("metadata.name is required".into()));
        }
        Ok(obj)
    }

    /// Create or overwrite without version checks; returns the stored object.
    pub fn put(&self, obj: K) -> WeirResult<K> {
        let obj = self.scope(obj)?;
        let key = ObjectKey::for_object(&obj);
        let mut st = self.lock();
        let obj = match st.items.get(&key) {
            Some(current) => {
                let mut obj = obj;
                obj.meta_mut().uid = current.meta().uid.clone();
                obj.meta_mut().creation_timestamp = current.meta().creation_timestamp.clone();
                obj
            }
            None => stamp_new(obj),
        };
        let existed = st.items.contains_key(&key);
        Ok(self.commit(&mut st, obj, false, existed))
    }

    /// Like [`MemorySource::put`], but no watcher ever sees the change; only a
    /// fresh list picks it up. Models events lost in transit.
    pub fn put_unobserved(&self, obj: K) -> WeirResult<K> {
        let obj = stamp_new(self.scope(obj)?);
        let key = ObjectKey::for_object(&obj);
        let mut st = self.lock();
        let existed = st.items.contains_key(&key);
        Ok(self.commit_with(&mut st, obj, false, existed, false))
    }

    /// Send every open watch a bookmark at the current revision.
    pub fn bookmark(&self) {
        let rv = self.lock().revision.to_string();
        let _ = self.shared.feed.send(Feed::Event(WatchEvent::Bookmark(rv)));
    }

    /// Remove outright, ignoring finalizers.
    pub fn remove(&self, name: &str) -> Option<K> {
        let key = self.key_for(name);
        let mut st = self.lock();
        let obj = st.items.get(&key).cloned()?;
        Some(self.commit(&mut st, obj, true, true))
    }

    /// Current object, bypassing the async trait.
    pub fn peek(&self, name: &str) -> Option<K> { self.lock().items.get(&self.key_for(name)).cloned() }

    pub fn revision(&self) -> u64 { self.lock().revision }

    /// End every open watch cleanly.
    pub fn close_watches(&self) { let _ = self.shared.feed.send(Feed::Close); }

    /// Tell every open watch its version is gone (HTTP 410 on a real server).
    pub fn expire_watches(&self) { let _ = self.shared.feed.send(Feed::Expire); }

    /// Drop retained history so watches from older versions expire.
    pub fn compact(&self) {
        let mut st = self.lock();
        st.history.clear();
        st.compacted = st.revision;
    }

    pub fn fail_next_lists(&self, n: usize) { self.lock().fail_lists = n; }

    pub fn fail_next_watches(&self, n: usize) { self.lock().fail_watches = n; }

    pub fn list_calls(&self) -> usize { self.shared.lists.load(Ordering::SeqCst) }

    pub fn watch_calls(&self) -> usize { self.shared.watches.load(Ordering::SeqCst) }

    pub fn open_watches(&self) -> usize { self.shared.feed.receiver_count() }
}

impl<K: Object> MemorySource<K> {
    // Finalizers turn a delete into a deletion mark. Caller holds the lock.
    fn delete_locked(&self, st: &mut State<K>, mut obj: K) {
        if has_finalizers(&obj) {
            if obj.meta().deletion_timestamp.is_none() {
                obj.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
                self.commit(st, obj, false, true);
            }
            return;
        }
        self.commit(st, obj, true, true);
    }
}

fn stamp_new<K: Object>(mut obj: K) -> K {
    let meta = obj.meta_mut();
    if meta.uid.is_none() {
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
    }
    if meta.creation_timestamp.is_none() {
        meta.creation_timestamp = Some(Time(chrono::Utc::now()));
    }
    obj
}

fn has_finalizers<K: Object>(obj: &K) -> bool { obj.meta().finalizers.as_ref().is_some_and(|f| !f.is_empty()) }

#[async_trait::async_trait]
impl<K: Object> RemoteSource<K> for MemorySource<K> {
    async fn list(&self, opts: &ListOptions) -> WeirResult<ObjectList<K>> {
        self.shared.lists.fetch_add(1, Ordering::SeqCst);
        let filter = Filter::new(self.namespace.as_deref(), opts)?;
        let mut st = self.lock();
        if st.fail_lists > 0 {
            st.fail_lists -= 1;
            return Err(WeirError::Transport("injected list failure".into()));
        }
        let items = st.items.values().filter(|o| filter.matches(*o)).cloned().collect();
        Ok(ObjectList { items, resource_version: Some(st.revision.to_string()) })
    }

    async fn get(&self, name: &str) -> WeirResult<K> { self.peek(name).ok_or_else(|| self.not_found(name)) }

    async fn create(&self, obj: &K) -> WeirResult<K> {
        let obj = self.scope(obj.clone())?;
        let key = ObjectKey::for_object(&obj);
        let mut st = self.lock();
        if st.items.contains_key(&key) {
            return Err(WeirError::Conflict(format!("{} {key} already exists", self.resource)));
        }
        let mut obj = stamp_new(obj);
        obj.meta_mut().resource_version = None;
        Ok(self.commit(&mut st, obj, false, false))
    }

    async fn update(&self, obj: &K) -> WeirResult<K> {
        let obj = self.scope(obj.clone())?;
        let key = ObjectKey::for_object(&obj);
        let mut st = self.lock();
        let current = st.items.get(&key).ok_or_else(|| self.not_found(key.name()))?;
        if let Some(rv) = obj.meta().resource_version.as_deref() {
            if current.meta().resource_version.as_deref() != Some(rv) {
                return Err(WeirError::Conflict(format!("{} {key} was modified (have {rv})", self.resource)));
            }
        }
        // the server owns these
        let mut obj = obj;
        obj.meta_mut().uid = current.meta().uid.clone();
        obj.meta_mut().creation_timestamp = current.meta().creation_timestamp.clone();
        obj.meta_mut().deletion_timestamp = current.meta().deletion_timestamp.clone();
        let finish_delete = obj.meta().deletion_timestamp.is_some() && !has_finalizers(&obj);
        if finish_delete {
            debug!(key = %key, "memsource: last finalizer removed, deleting");
        }
        Ok(self.commit(&mut st, obj, finish_delete, true))
    }

    async fn delete(&self, name: &str, _opts: &DeleteOptions) -> WeirResult<()> {
        let key = self.key_for(name);
        let mut st = self.lock();
        let obj = st.items.get(&key).cloned().ok_or_else(|| self.not_found(name))?;
        self.delete_locked(&mut st, obj);
        Ok(())
    }

    async fn delete_collection(&self, _delete: &DeleteOptions, list: &ListOptions) -> WeirResult<()> {
        let ListOptions { label_selector, field_selector, .. } = list.clone();
        let opts = ListOptions { label_selector, field_selector, ..Default::default() };
        let filter = Filter::new(self.namespace.as_deref(), &opts)?;
        let mut st = self.lock();
        let doomed: Vec<K> = st.items.values().filter(|o| filter.matches(*o)).cloned().collect();
        debug!(count = doomed.len(), "memsource: delete collection");
        for obj in doomed {
            self.delete_locked(&mut st, obj);
        }
        Ok(())
    }

    async fn watch(&self, opts: &ListOptions) -> WeirResult<WatchStream<K>> {
        self.shared.watches.fetch_add(1, Ordering::SeqCst);
        let filter = Filter::new(self.namespace.as_deref(), opts)?;
        let (replay, mut rx, expired) = {
            let mut st = self.lock();
            if st.fail_watches > 0 {
                st.fail_watches -= 1;
                return Err(WeirError::Transport("injected watch failure".into()));
            }
            let since = match opts.resource_version.as_deref() {
                Some(rv) => rv.parse::<u64>().map_err(|_| WeirError::Invalid(format!("bad resource version {rv:?}")))?,
                None => st.revision,
            };
            let expired = since < st.compacted;
            let replay: Vec<WatchEvent<K>> = st
                .history
                .iter()
                .filter(|(rev, ev)| *rev > since && ev.object().is_some_and(|o| filter.matches(o)))
                .map(|(_, ev)| ev.clone())
                .collect();
            // subscribe under the lock: nothing committed after this point is in `replay`
            (replay, self.shared.feed.subscribe(), expired)
        };
        let resource = self.resource.clone();
        let stream = async_stream::stream! {
            if expired {
                yield Err(WeirError::Expired(format!("{resource}: requested version compacted")));
                return;
            }
            for ev in replay {
                yield Ok(ev);
            }
            loop {
                match rx.recv().await {
                    Ok(Feed::Event(ev)) => {
                        if ev.object().map_or(true, |o| filter.matches(o)) {
                            yield Ok(ev);
                        }
                    }
                    Ok(Feed::Close) | Err(broadcast::error::RecvError::Closed) => break,
                    Ok(Feed::Expire) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        yield Err(WeirError::Expired(format!("{resource}: watch expired")));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}
