//! Weir controller: turns a remote collection into handler calls.
//!
//! A [`Controller`] owns one reflector, one store and one work queue, and a pool
//! of workers that hand each dirty key to every registered [`Handler`] in
//! order. [`Client`] adds direct CRUD and lifecycle helpers on top, and
//! [`ControllerRegistry`] makes sure each scope gets exactly one controller.

#![forbid(unsafe_code)]

mod client;
mod controller;
mod dispatch;
mod handler;
mod lifecycle;
mod registry;

pub use client::Client;
pub use controller::Controller;
pub use dispatch::HandlerFailure;
pub use handler::{handler_fn, FnHandler, Handler, SyncFn};
pub use lifecycle::{created_annotation, finalizer_name, Lifecycle, LifecycleAdapter};
pub use registry::ControllerRegistry;

pub use weir_core::{ControllerConfig, HandlerError, ObjectKey, WeirError, WeirResult};
