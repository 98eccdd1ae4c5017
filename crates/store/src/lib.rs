//! Weir store: in-RAM indexed mirror of a remote collection.
//!
//! Entries and every index live behind one `RwLock`, so a reader never sees an
//! index entry whose object is missing (or the reverse).

#![forbid(unsafe_code)]

mod lister;

pub use lister::Lister;

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use metrics::gauge;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tracing::debug;
use weir_core::{version, LabelSelector, Object, ObjectKey, WeirError, WeirResult};

/// Extracts index values from an object.
pub type IndexFn<K> = Arc<dyn Fn(&K) -> Vec<String> + Send + Sync>;

/// Result of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    Updated,
    /// The incoming version was not newer than the stored one; nothing changed.
    Stale,
}

impl PutOutcome {
    pub fn applied(self) -> bool { !matches!(self, PutOutcome::Stale) }
}

/// Keys touched by [`Indexer::replace`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaceDiff {
    /// New keys and keys whose resource version changed.
    pub upserted: Vec<ObjectKey>,
    /// Keys that were cached but missing from the new listing.
    pub deleted: Vec<ObjectKey>,
}

struct Index<K> {
    func: IndexFn<K>,
    values: FxHashMap<String, FxHashSet<ObjectKey>>,
}

struct Inner<K> {
    items: FxHashMap<ObjectKey, Arc<K>>,
    // cluster-scoped objects are filed under ""
    by_namespace: FxHashMap<String, FxHashSet<ObjectKey>>,
    indices: FxHashMap<String, Index<K>>,
}

impl<K: Object> Inner<K> {
    fn insert(&mut self, key: ObjectKey, obj: Arc<K>) -> PutOutcome {
        let outcome = match self.items.remove(&key) {
            Some(old) => {
                self.unindex(&key, &old);
                PutOutcome::Updated
            }
            None => PutOutcome::Inserted,
        };
        self.index(&key, &obj);
        self.items.insert(key, obj);
        outcome
    }

    fn remove(&mut self, key: &ObjectKey) -> Option<Arc<K>> {
        let old = self.items.remove(key)?;
        self.unindex(key, &old);
        Some(old)
    }

    fn index(&mut self, key: &ObjectKey, obj: &K) {
        let ns = obj.meta().namespace.clone().unwrap_or_default();
        self.by_namespace.entry(ns).or_default().insert(key.clone());
        for idx in self.indices.values_mut() {
            for v in (idx.func)(obj) {
                idx.values.entry(v).or_default().insert(key.clone());
            }
        }
    }

    fn unindex(&mut self, key: &ObjectKey, obj: &K) {
        let ns = obj.meta().namespace.as_deref().unwrap_or("");
        if let Some(set) = self.by_namespace.get_mut(ns) {
            set.remove(key);
            if set.is_empty() {
                self.by_namespace.remove(ns);
            }
        }
        for idx in self.indices.values_mut() {
            for v in (idx.func)(obj) {
                if let Some(set) = idx.values.get_mut(&v) {
                    set.remove(key);
                    if set.is_empty() {
                        idx.values.remove(&v);
                    }
                }
            }
        }
    }
}

/// Local indexed store keyed by [`ObjectKey`].
pub struct Indexer<K> {
    inner: RwLock<Inner<K>>,
    synced: watch::Sender<bool>,
}

impl<K: Object> Default for Indexer<K> {
    fn default() -> Self { Self::new() }
}

impl<K: Object> Indexer<K> {
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            inner: RwLock::new(Inner {
                items: FxHashMap::default(),
                by_namespace: FxHashMap::default(),
                indices: FxHashMap::default(),
            }),
            synced,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<K>> { self.inner.read().unwrap_or_else(PoisonError::into_inner) }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<K>> { self.inner.write().unwrap_or_else(PoisonError::into_inner) }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> { self.read().items.get(key).cloned() }

    /// Objects matching `selector`, optionally restricted to one namespace.
    /// Order is unspecified.
    pub fn list(&self, namespace: Option<&str>, selector: &LabelSelector) -> Vec<Arc<K>> {
        let inner = self.read();
        match namespace {
            Some(ns) => inner
                .by_namespace
                .get(ns)
                .into_iter()
                .flatten()
                .filter_map(|k| inner.items.get(k))
                .filter(|o| selector.matches_object::<K>(o))
                .cloned()
                .collect(),
            None => inner.items.values().filter(|o| selector.matches_object::<K>(o)).cloned().collect(),
        }
    }

    pub fn keys(&self) -> Vec<ObjectKey> { self.read().items.keys().cloned().collect() }

    pub fn len(&self) -> usize { self.read().items.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Unconditional write.
    pub fn put(&self, obj: K) -> PutOutcome {
        let key = ObjectKey::for_object(&obj);
        let mut inner = self.write();
        let outcome = inner.insert(key, Arc::new(obj));
        gauge!("weir_store_items", inner.items.len() as f64);
        outcome
    }

    /// Write only when `obj` carries a newer resource version than the cached entry.
    pub fn put_if_newer(&self, obj: K) -> PutOutcome {
        let key = ObjectKey::for_object(&obj);
        let mut inner = self.write();
        if let Some(cur) = inner.items.get(&key) {
            let incoming = obj.meta().resource_version.as_deref();
            let current = cur.meta().resource_version.as_deref();
            if !version::is_newer(incoming, current) {
                debug!(key = %key, incoming = ?incoming, current = ?current, "store: stale write discarded");
                return PutOutcome::Stale;
            }
        }
        let outcome = inner.insert(key, Arc::new(obj));
        gauge!("weir_store_items", inner.items.len() as f64);
        outcome
    }

    pub fn delete(&self, key: &ObjectKey) -> Option<Arc<K>> {
        let mut inner = self.write();
        let old = inner.remove(key);
        gauge!("weir_store_items", inner.items.len() as f64);
        old
    }

    /// Swap the whole content for `items` in one step.
    pub fn replace(&self, items: Vec<K>) -> ReplaceDiff {
        let mut diff = ReplaceDiff::default();
        let mut inner = self.write();
        let mut seen: FxHashSet<ObjectKey> = FxHashSet::default();
        for obj in items {
            let key = ObjectKey::for_object(&obj);
            let changed = match inner.items.get(&key) {
                Some(cur) => cur.meta().resource_version != obj.meta().resource_version,
                None => true,
            };
            if changed {
                inner.insert(key.clone(), Arc::new(obj));
                diff.upserted.push(key.clone());
            }
            seen.insert(key);
        }
        let gone: Vec<ObjectKey> = inner.items.keys().filter(|k| !seen.contains(*k)).cloned().collect();
        for key in gone {
            inner.remove(&key);
            diff.deleted.push(key);
        }
        gauge!("weir_store_items", inner.items.len() as f64);
        debug!(upserted = diff.upserted.len(), deleted = diff.deleted.len(), total = inner.items.len(), "store: replaced");
        diff
    }

    /// Register a named secondary index; existing entries are indexed immediately.
    pub fn add_index(&self, name: &str, func: IndexFn<K>) {
        let mut inner = self.write();
        let mut values: FxHashMap<String, FxHashSet<ObjectKey>> = FxHashMap::default();
        for (key, obj) in &inner.items {
            for v in func(&**obj) {
                values.entry(v).or_default().insert(key.clone());
            }
        }
        inner.indices.insert(name.to_string(), Index { func, values });
    }

    pub fn by_index(&self, name: &str, value: &str) -> WeirResult<Vec<Arc<K>>> {
        let inner = self.read();
        let idx = inner.indices.get(name).ok_or_else(|| WeirError::Invalid(format!("no index named {name:?}")))?;
        Ok(idx
            .values
            .get(value)
            .into_iter()
            .flatten()
            .filter_map(|k| inner.items.get(k).cloned())
            .collect())
    }

    /// Flag the initial listing as complete.
    pub fn mark_synced(&self) { self.synced.send_replace(true); }

    pub fn has_synced(&self) -> bool { *self.synced.borrow() }

    /// Resolve once the initial listing has landed.
    pub async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        // Sender lives in self, so wait_for cannot fail while we hold &self.
        let _ = rx.wait_for(|synced| *synced).await;
    }
}
