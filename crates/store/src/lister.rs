use std::sync::Arc;

use weir_core::{LabelSelector, Object, ObjectKey, WeirError, WeirResult};

use crate::Indexer;

/// Read-only namespace/name view over an [`Indexer`].
pub struct Lister<K> {
    indexer: Arc<Indexer<K>>,
    resource: String,
}

impl<K> Clone for Lister<K> {
    fn clone(&self) -> Self { Self { indexer: Arc::clone(&self.indexer), resource: self.resource.clone() } }
}

impl<K: Object> Lister<K> {
    /// `resource` names the collection in `NotFound` errors (e.g. `configmaps`).
    pub fn new(indexer: Arc<Indexer<K>>, resource: impl Into<String>) -> Self {
        Self { indexer, resource: resource.into() }
    }

    pub fn list(&self, namespace: Option<&str>, selector: &LabelSelector) -> Vec<Arc<K>> {
        self.indexer.list(namespace, selector)
    }

    pub fn get(&self, namespace: Option<&str>, name: &str) -> WeirResult<Arc<K>> {
        self.indexer
            .get(&ObjectKey::new(namespace, name))
            .ok_or_else(|| WeirError::not_found(self.resource.clone(), name))
    }
}
