use std::sync::Arc;

use weir_core::{
    DeleteOptions, HandlerError, ListOptions, Object, ObjectKey, ObjectList, RemoteSource, WatchStream, WeirResult,
};

use crate::controller::Controller;
use crate::handler::{Handler, SyncFn};
use crate::lifecycle::{Lifecycle, LifecycleAdapter};
use crate::registry::ControllerRegistry;

/// Typed facade over one namespace of a collection: direct CRUD plus access to
/// the shared controller for that scope.
pub struct Client<K: Object> {
    source: Arc<dyn RemoteSource<K>>,
    namespace: Option<String>,
    registry: Arc<ControllerRegistry<K>>,
}

impl<K: Object> Clone for Client<K> {
    fn clone(&self) -> Self {
        Self { source: Arc::clone(&self.source), namespace: self.namespace.clone(), registry: Arc::clone(&self.registry) }
    }
}

impl<K: Object> Client<K> {
    /// `source` must already be scoped to `namespace`.
    pub fn new(source: Arc<dyn RemoteSource<K>>, namespace: Option<&str>, registry: Arc<ControllerRegistry<K>>) -> Self {
        Self { source, namespace: namespace.map(str::to_string), registry }
    }

    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }

    pub fn source(&self) -> &Arc<dyn RemoteSource<K>> { &self.source }

    pub async fn create(&self, obj: &K) -> WeirResult<K> { self.source.create(obj).await }

    pub async fn get(&self, name: &str) -> WeirResult<K> { self.source.get(name).await }

    pub async fn update(&self, obj: &K) -> WeirResult<K> { self.source.update(obj).await }

    pub async fn delete(&self, name: &str, opts: &DeleteOptions) -> WeirResult<()> { self.source.delete(name, opts).await }

    pub async fn list(&self, opts: &ListOptions) -> WeirResult<ObjectList<K>> { self.source.list(opts).await }

    pub async fn watch(&self, opts: &ListOptions) -> WeirResult<WatchStream<K>> { self.source.watch(opts).await }

    pub async fn delete_collection(&self, delete: &DeleteOptions, list: &ListOptions) -> WeirResult<()> {
        self.source.delete_collection(delete, list).await
    }

    /// The controller shared by every client of this scope.
    pub fn controller(&self) -> Arc<Controller<K>> {
        self.registry.controller_for(self.namespace.as_deref(), || Arc::clone(&self.source))
    }

    pub fn add_handler(&self, name: &str, handler: impl Handler<K> + 'static) { self.controller().add_handler(name, handler) }

    /// Register a synchronous callback.
    pub fn add_sync_handler<F>(&self, name: &str, f: F)
    where
        F: Fn(&ObjectKey, Option<&K>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.controller().add_handler(name, SyncFn(f))
    }

    /// Drive `lifecycle` through create/update/remove with a finalizer guarding deletion.
    pub fn add_lifecycle<L>(&self, name: &str, lifecycle: L)
    where
        K: PartialEq,
        L: Lifecycle<K> + 'static,
    {
        let adapter = LifecycleAdapter::new(name, lifecycle, Arc::clone(&self.source));
        self.controller().add_handler(name, adapter)
    }
}
