//! Weir core types: object keys, resource versions, label selectors, the
//! remote source contract and the error taxonomy shared by every crate.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod config;
pub mod error;
pub mod key;
pub mod selector;
pub mod source;
pub mod version;

pub use backoff::Backoff;
pub use config::ControllerConfig;
pub use error::{HandlerError, WeirError, WeirResult};
pub use key::ObjectKey;
pub use selector::{LabelSelector, Requirement};
pub use source::{
    DeleteOptions, ListOptions, ObjectList, Propagation, RemoteSource, WatchEvent, WatchStream,
};

/// Anything the controller can mirror: a kube resource that can be cloned and
/// shared across tasks.
pub trait Object: kube::Resource + Clone + Send + Sync + 'static {}

impl<T> Object for T where T: kube::Resource + Clone + Send + Sync + 'static {}

pub mod prelude {
    pub use super::{
        HandlerError, LabelSelector, ListOptions, Object, ObjectKey, RemoteSource, WatchEvent,
        WeirError, WeirResult,
    };
}
