//! Crate-wide error types.

use std::fmt;

/// Error surfaced by an [`ApiClient`](crate::watch::ApiClient) when a watch stream fails
/// unrecoverably.
///
/// Implementations are expected to absorb transient disconnects themselves (resyncing with
/// an appropriate resource version) and only ever surface errors here that should tear down
/// the whole controller.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct WatchError(#[from] Box<dyn std::error::Error + Send + Sync>);

impl WatchError {
    /// Wrap an arbitrary error as a [`WatchError`].
    pub fn new(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self(Box::new(source))
    }
}

/// Errors that can terminate a running [`Controller`](crate::controller::Controller).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A [`Watch`](crate::watch::Watch) terminated with an unrecoverable error.
    #[error("watch for {api_version}/{kind} failed")]
    Watch {
        /// The `apiVersion` of the resource being watched.
        api_version: String,
        /// The `kind` of the resource being watched.
        kind: String,
        /// The underlying cause.
        #[source]
        source: WatchError,
    },

    /// A supervised task panicked or was dropped without completing.
    #[error("controller task failed to run to completion")]
    TaskFailed(#[source] tokio::task::JoinError),

    /// An invariant that the [`Queue`](crate::queue::Queue) is required to uphold did not hold.
    ///
    /// This indicates a bug in this crate rather than a recoverable runtime condition; callers
    /// should treat it as fatal.
    #[error("queue invariant violated: {0}")]
    QueueInvariant(QueueInvariantViolation),
}

/// Description of which [`Queue`](crate::queue::Queue) invariant was found to be broken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInvariantViolation(pub(crate) String);

impl fmt::Display for QueueInvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
