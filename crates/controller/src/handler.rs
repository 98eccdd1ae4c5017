use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use weir_core::{HandlerError, ObjectKey};

/// Reacts to a key becoming dirty.
///
/// `obj` is the cached object at dispatch time; `None` means it was deleted.
#[async_trait::async_trait]
pub trait Handler<K>: Send + Sync {
    async fn handle(&self, key: &ObjectKey, obj: Option<Arc<K>>) -> Result<(), HandlerError>;
}

/// Adapter returned by [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<K, F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ObjectKey, Option<Arc<K>>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait::async_trait]
impl<K, F, Fut> Handler<K> for FnHandler<F>
where
    K: Send + Sync + 'static,
    F: Fn(ObjectKey, Option<Arc<K>>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, key: &ObjectKey, obj: Option<Arc<K>>) -> Result<(), HandlerError> {
        (self.0)(key.clone(), obj).await
    }
}

/// Adapter for plain synchronous callbacks.
pub struct SyncFn<F>(pub(crate) F);

#[async_trait::async_trait]
impl<K, F> Handler<K> for SyncFn<F>
where
    K: Send + Sync + 'static,
    F: Fn(&ObjectKey, Option<&K>) -> Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self, key: &ObjectKey, obj: Option<Arc<K>>) -> Result<(), HandlerError> {
        (self.0)(key, obj.as_deref())
    }
}

pub(crate) struct Named<K> {
    pub name: String,
    pub handler: Arc<dyn Handler<K>>,
}

impl<K> Clone for Named<K> {
    fn clone(&self) -> Self { Self { name: self.name.clone(), handler: Arc::clone(&self.handler) } }
}

/// Ordered handler list. Writers swap in a new copy; a dispatch keeps the
/// snapshot it started with.
pub(crate) struct Handlers<K> {
    list: ArcSwap<Vec<Named<K>>>,
}

impl<K> Handlers<K> {
    pub fn new() -> Self { Self { list: ArcSwap::from_pointee(Vec::new()) } }

    pub fn add(&self, name: &str, handler: Arc<dyn Handler<K>>) {
        let entry = Named { name: name.to_string(), handler };
        self.list.rcu(|cur| {
            let mut next = Vec::with_capacity(cur.len() + 1);
            next.extend(cur.iter().cloned());
            next.push(entry.clone());
            next
        });
    }

    pub fn snapshot(&self) -> Arc<Vec<Named<K>>> { self.list.load_full() }

    pub fn names(&self) -> Vec<String> { self.list.load().iter().map(|h| h.name.clone()).collect() }
}
