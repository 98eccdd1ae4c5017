use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of an object inside store, queue and dispatch: `namespace/name`
/// for namespaced objects, `name` otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Build a key from its parts. An empty namespace is treated as cluster scope.
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Self(format!("{ns}/{name}")),
            _ => Self(name.to_string()),
        }
    }

    pub fn for_object<K: kube::Resource>(obj: &K) -> Self {
        let meta = obj.meta();
        Self::new(meta.namespace.as_deref(), meta.name.as_deref().unwrap_or(""))
    }

    /// `(namespace, name)`; names never contain `/`.
    pub fn split(&self) -> (Option<&str>, &str) {
        match self.0.split_once('/') {
            Some((ns, name)) => (Some(ns), name),
            None => (None, self.0.as_str()),
        }
    }

    pub fn namespace(&self) -> Option<&str> { self.split().0 }

    pub fn name(&self) -> &str { self.split().1 }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl Borrow<str> for ObjectKey {
    fn borrow(&self) -> &str { &self.0 }
}

impl From<&str> for ObjectKey {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl From<String> for ObjectKey {
    fn from(s: String) -> Self { Self(s) }
}
