use std::sync::Arc;

use tracing::{debug, info};
use weir_core::{HandlerError, Object, ObjectKey, RemoteSource};

use crate::handler::Handler;

/// Object lifecycle callbacks. Each returns the (possibly modified) object.
#[async_trait::async_trait]
pub trait Lifecycle<K>: Send + Sync {
    /// Called once per object, after our finalizer is in place. Runs again if
    /// recording the "created" annotation fails, so keep it idempotent.
    async fn create(&self, obj: K) -> Result<K, HandlerError>;
    /// Called once the object is being deleted, before the finalizer is released.
    async fn remove(&self, obj: K) -> Result<K, HandlerError>;
    /// Called on every later change.
    async fn updated(&self, obj: K) -> Result<K, HandlerError>;
}

pub fn finalizer_name(name: &str) -> String { format!("controller.weir.io/{name}") }

pub fn created_annotation(name: &str) -> String { format!("lifecycle.weir.io/create.{name}") }

/// Turns a [`Lifecycle`] into a [`Handler`] that owns a finalizer and a
/// "created" annotation on every object it sees.
pub struct LifecycleAdapter<K, L> {
    name: String,
    finalizer: String,
    annotation: String,
    lifecycle: L,
    source: Arc<dyn RemoteSource<K>>,
}

impl<K: Object, L: Lifecycle<K>> LifecycleAdapter<K, L> {
    pub fn new(name: &str, lifecycle: L, source: Arc<dyn RemoteSource<K>>) -> Self {
        Self {
            name: name.to_string(),
            finalizer: finalizer_name(name),
            annotation: created_annotation(name),
            lifecycle,
            source,
        }
    }

    fn has_finalizer(&self, obj: &K) -> bool {
        obj.meta().finalizers.as_ref().is_some_and(|f| f.iter().any(|x| *x == self.finalizer))
    }

    fn is_created(&self, obj: &K) -> bool {
        obj.meta().annotations.as_ref().is_some_and(|a| a.get(&self.annotation).is_some_and(|v| v == "true"))
    }

    async fn finalize(&self, key: &ObjectKey, obj: K) -> Result<(), HandlerError> {
        if !self.has_finalizer(&obj) {
            return Ok(());
        }
        let mut obj = self.lifecycle.remove(obj).await?;
        if let Some(f) = obj.meta_mut().finalizers.as_mut() {
            f.retain(|x| *x != self.finalizer);
        }
        self.source.update(&obj).await?;
        info!(lifecycle = %self.name, key = %key, "lifecycle: finalizer released");
        Ok(())
    }
}

#[async_trait::async_trait]
impl<K, L> Handler<K> for LifecycleAdapter<K, L>
where
    K: Object + PartialEq,
    L: Lifecycle<K>,
{
    async fn handle(&self, key: &ObjectKey, obj: Option<Arc<K>>) -> Result<(), HandlerError> {
        let Some(obj) = obj else { return Ok(()) };
        let mut obj = (*obj).clone();
        if obj.meta().deletion_timestamp.is_some() {
            return self.finalize(key, obj).await;
        }

        if !self.has_finalizer(&obj) {
            obj.meta_mut().finalizers.get_or_insert_with(Vec::new).push(self.finalizer.clone());
            obj = self.source.update(&obj).await?;
            debug!(lifecycle = %self.name, key = %key, "lifecycle: finalizer added");
        }

        if !self.is_created(&obj) {
            let mut obj = self.lifecycle.create(obj).await?;
            obj.meta_mut().annotations.get_or_insert_with(Default::default).insert(self.annotation.clone(), "true".into());
            self.source.update(&obj).await?;
            info!(lifecycle = %self.name, key = %key, "lifecycle: created");
            return Ok(());
        }

        let after = self.lifecycle.updated(obj.clone()).await?;
        if after != obj {
            self.source.update(&after).await?;
            debug!(lifecycle = %self.name, key = %key, "lifecycle: updated object written back");
        }
        Ok(())
    }
}
