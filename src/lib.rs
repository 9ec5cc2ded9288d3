//! Controller runtime core: watch fan-in, a keyed delay-aware queue, and a bounded worker pool
//! for building Kubernetes-style reconciliation controllers.
//!
//! This crate does not talk to the Kubernetes API server, parse CRDs, or define a typed object
//! model: it consumes a pre-existing streaming list/watch abstraction (the [`watch::ApiClient`]
//! trait) and drives an application-supplied reconcile function with single-flight, coalescing,
//! and exponential-backoff-on-failure semantics.
//!
//! The [`controller::Controller`] builder is the main entry point.

pub mod backoff;
pub mod controller;
pub mod error;
pub mod object;
pub mod queue;
pub mod request;
pub mod supervisor;
pub mod watch;
pub mod worker_pool;

pub use controller::{Controller, ControllerOptions};
pub use error::{Error, WatchError};
pub use object::{DynamicObject, LabelSelector, OwnerReference};
pub use queue::Queue;
pub use request::{ObjectKey, ReconcileResult, Request};
pub use watch::{ApiClient, EventType, Watch, WatchEvent, WatchParams};
pub use worker_pool::{Worker, WorkerPool};
