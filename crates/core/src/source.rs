//! Contract of the remote collection the controller mirrors.

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::WeirResult;
use crate::Object;

/// Options shared by list and watch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    /// Lower bound: watch events strictly after this version.
    pub resource_version: Option<String>,
    pub timeout_secs: Option<u32>,
}

impl ListOptions {
    pub fn labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string());
        self
    }

    pub fn fields(mut self, selector: &str) -> Self {
        self.field_selector = Some(selector.to_string());
        self
    }

    pub fn at(mut self, resource_version: impl Into<String>) -> Self {
        self.resource_version = Some(resource_version.into());
        self
    }

    pub fn timeout(mut self, secs: u32) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Propagation {
    Orphan,
    Background,
    Foreground,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOptions {
    pub grace_period_seconds: Option<u32>,
    pub propagation: Option<Propagation>,
}

/// A full listing plus the collection version it was read at.
#[derive(Debug, Clone)]
pub struct ObjectList<K> {
    pub items: Vec<K>,
    pub resource_version: Option<String>,
}

/// One change pushed by a watch.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Progress marker carrying only a newer collection version.
    Bookmark(String),
}

impl<K: kube::Resource> WatchEvent<K> {
    pub fn object(&self) -> Option<&K> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => Some(o),
            WatchEvent::Bookmark(_) => None,
        }
    }

    pub fn resource_version(&self) -> Option<&str> {
        match self {
            WatchEvent::Bookmark(rv) => Some(rv),
            other => other.object().and_then(|o| o.meta().resource_version.as_deref()),
        }
    }
}

/// Watch stream. An `Err(WeirError::Expired)` item means the caller must relist.
pub type WatchStream<K> = BoxStream<'static, WeirResult<WatchEvent<K>>>;

/// Remote collection of typed objects, bound to one scope (a namespace, or the
/// whole cluster).
#[async_trait::async_trait]
pub trait RemoteSource<K: Object>: Send + Sync {
    async fn list(&self, opts: &ListOptions) -> WeirResult<ObjectList<K>>;
    async fn get(&self, name: &str) -> WeirResult<K>;
    async fn create(&self, obj: &K) -> WeirResult<K>;
    async fn update(&self, obj: &K) -> WeirResult<K>;
    async fn delete(&self, name: &str, opts: &DeleteOptions) -> WeirResult<()>;
    async fn delete_collection(&self, delete: &DeleteOptions, list: &ListOptions) -> WeirResult<()>;
    async fn watch(&self, opts: &ListOptions) -> WeirResult<WatchStream<K>>;
}
