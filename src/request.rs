//! Reconciliation requests and the results reconcilers hand back to the [`Queue`](crate::queue::Queue).

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Identifies a single Kubernetes object to reconcile.
///
/// Namespace is empty for cluster-scoped objects. Two keys are equal iff both fields match;
/// this is the sole identity the [`Queue`](crate::queue::Queue) uses for coalescing and
/// single-flight tracking.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// The object's namespace, or `None` for a cluster-scoped object.
    pub namespace: Option<String>,
    /// The object's name.
    pub name: String,
}

impl ObjectKey {
    /// Create a new key for a namespaced or cluster-scoped object.
    #[must_use]
    pub fn new(name: impl Into<String>, namespace: Option<String>) -> Self {
        Self {
            namespace,
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// A request to reconcile an object.
///
/// Carries no payload beyond identity: the reconcile function is expected to re-read the
/// live object from the API server, which is the canonical source of truth. `id` is a
/// process-local monotonically increasing value used only for logging/tracing; it plays no
/// role in equality, hashing, or queue ordering.
#[derive(Debug, Clone)]
pub struct Request {
    /// The object this request concerns.
    pub key: ObjectKey,
    /// A process-local id, assigned at construction, for tracing/log correlation.
    pub id: u64,
}

impl Request {
    /// Build a new request for `key`, assigning it the next monotonic id.
    #[must_use]
    pub fn new(key: ObjectKey) -> Self {
        Self {
            key,
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for Request {}

/// The outcome of a single reconcile attempt.
///
/// The default value (`{requeue: false, requeue_after: None}`) means "nothing further to do
/// until the next watch event", matching a reconcile function that returns no explicit action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Whether the object should be requeued for another attempt.
    pub requeue: bool,
    /// An explicit delay to wait before the next attempt.
    ///
    /// Setting this implies `requeue: true` and resets the backoff attempt counter, since the
    /// caller has expressed domain knowledge of when to retry (see [`crate::backoff`]).
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    /// The object reconciled successfully; nothing further is scheduled.
    #[must_use]
    pub fn done() -> Self {
        Self::default()
    }

    /// Requeue immediately, subject to the controller's exponential backoff policy.
    #[must_use]
    pub fn requeue() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    /// Requeue after exactly `delay`, resetting the backoff attempt counter.
    #[must_use]
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: true,
            requeue_after: Some(delay),
        }
    }
}
