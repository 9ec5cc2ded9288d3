//! The keyed, delay-aware work queue at the center of the dispatch loop.
//!
//! This is a from-scratch generalization of the delay/dedup technique `kube-runtime`'s
//! scheduler uses (a metadata map keyed by message identity, paired with a time-ordered
//! structure for expiry), extended with the attempt-count and single-flight "dirty" tracking
//! a backoff-aware reconciler queue needs that a plain dedup scheduler does not.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashSet},
    time::Duration,
};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

use crate::error::QueueInvariantViolation;
use crate::request::{ObjectKey, Request};

/// A pending entry's position in the time-ordered heap.
///
/// Ordered by `(eligible_at, seq)` ascending; `seq` breaks ties in enqueue order (FIFO), and
/// also lets us tell a stale heap entry (superseded by a later coalesce/requeue for the same
/// key) apart from the current canonical one, which is tracked in `Inner::pending`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HeapItem {
    eligible_at: Instant,
    seq: u64,
    key: ObjectKey,
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.eligible_at, self.seq).cmp(&(other.eligible_at, other.seq))
    }
}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The canonical metadata for a pending (not-yet-dequeued) entry.
struct PendingEntry {
    request: Request,
    attempt: u32,
    eligible_at: Instant,
    seq: u64,
}

struct Inner {
    /// Min-heap of candidate wakeups. May contain stale entries for keys that were since
    /// coalesced, dequeued, or moved to processing; `seq` lets us recognize and discard those
    /// lazily instead of having to search/remove from the heap directly.
    order: BinaryHeap<Reverse<HeapItem>>,
    /// Canonical state for every pending key.
    pending: HashMap<ObjectKey, PendingEntry>,
    /// Keys currently checked out to a worker.
    processing: HashSet<ObjectKey>,
    /// Keys that received a new `enqueue` while processing; holds the request that should be
    /// re-enqueued (at attempt 0) once processing completes.
    dirty: HashMap<ObjectKey, Request>,
    next_seq: u64,
}

impl Inner {
    fn push(&mut self, key: ObjectKey, request: Request, attempt: u32, eligible_at: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.push(Reverse(HeapItem {
            eligible_at,
            seq,
            key: key.clone(),
        }));
        self.pending.insert(key, PendingEntry {
            request,
            attempt,
            eligible_at,
            seq,
        });
    }

    /// Discard heap entries that no longer correspond to the canonical pending metadata,
    /// leaving the head (if any) pointing at the earliest still-live entry.
    fn prune_stale_head(&mut self) {
        while let Some(Reverse(top)) = self.order.peek() {
            match self.pending.get(&top.key) {
                Some(entry) if entry.seq == top.seq => break,
                _ => {
                    self.order.pop();
                }
            }
        }
    }

    fn earliest_eligible_at(&mut self) -> Option<Instant> {
        self.prune_stale_head();
        self.order.peek().map(|Reverse(item)| item.eligible_at)
    }

    /// Pop the earliest pending entry if it is eligible (`eligible_at <= now`), moving its key
    /// into `processing`.
    fn try_take(&mut self) -> Option<(Request, u32)> {
        self.prune_stale_head();
        let ready = matches!(self.order.peek(), Some(Reverse(item)) if item.eligible_at <= Instant::now());
        if !ready {
            return None;
        }
        let Reverse(item) = self.order.pop().expect("just peeked");
        let entry = self
            .pending
            .remove(&item.key)
            .expect("prune_stale_head guarantees the head entry is canonical");
        self.processing.insert(item.key);
        Some((entry.request, entry.attempt))
    }
}

/// A keyed, delay-aware, single-flight work queue.
///
/// See the [module docs](self) and the design document's Queue section for the full state
/// machine. All methods besides [`Queue::dequeue`] and [`Queue::wait_for_eligible`] are
/// non-suspending: they take a brief lock, mutate in-memory state, and return.
pub struct Queue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

impl Queue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                order: BinaryHeap::new(),
                pending: HashMap::new(),
                processing: HashSet::new(),
                dirty: HashMap::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Add or coalesce `request` at attempt 0, eligible immediately.
    ///
    /// If `request.key` is currently being processed, it is marked dirty instead: it will be
    /// re-enqueued automatically once [`Queue::processing_complete`] runs for that key.
    pub fn enqueue(&self, request: Request) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.processing.contains(&request.key) {
            inner.dirty.insert(request.key.clone(), request);
            return;
        }
        // A plain enqueue always contributes attempt 0, so coalescing's "minimum of the two
        // attempts" collapses to 0 whenever an existing pending entry is present too: a
        // freshly observed change is never penalised by backoff accumulated on stale data.
        let eligible_at = match inner.pending.get(&request.key) {
            Some(existing) => existing.eligible_at.min(now),
            None => now,
        };
        let key = request.key.clone();
        inner.push(key, request, 0, eligible_at);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Schedule a retry for `request`, `delay` from now, with the given `attempt` count.
    ///
    /// `request.key` must currently be in the processing state; this call transitions it back
    /// to pending, superseding (and clearing) any dirty flag that accumulated while it ran.
    ///
    /// Returns `Err` without touching any state if `request.key` was not in the processing
    /// state; that would otherwise create a second pending entry for an already-pending key,
    /// violating the queue's unique-pending-per-key invariant. This indicates a caller bug
    /// (only the dispatcher, exactly once per dequeued request, is meant to call this), and is
    /// deliberately not a `debug_assert!`: callers are expected to treat it as fatal in release
    /// builds too.
    pub fn requeue(
        &self,
        request: Request,
        attempt: u32,
        delay: Duration,
    ) -> Result<(), QueueInvariantViolation> {
        let eligible_at = Instant::now() + delay;
        let mut inner = self.inner.lock();
        if !inner.processing.remove(&request.key) {
            return Err(QueueInvariantViolation(format!(
                "requeue() called for key {} that was not in the processing state",
                request.key
            )));
        }
        inner.dirty.remove(&request.key);
        let key = request.key.clone();
        inner.push(key, request, attempt, eligible_at);
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Mark `request`'s key as done processing.
    ///
    /// If the key was marked dirty while it was processing, the stashed request is immediately
    /// re-enqueued at attempt 0; otherwise the key becomes idle.
    pub fn processing_complete(&self, request: Request) {
        let mut inner = self.inner.lock();
        inner.processing.remove(&request.key);
        if let Some(dirty_request) = inner.dirty.remove(&request.key) {
            let now = Instant::now();
            let key = dirty_request.key.clone();
            inner.push(key, dirty_request, 0, now);
            drop(inner);
            self.notify.notify_waiters();
        }
    }

    /// True iff at least one pending entry is eligible for dequeue right now.
    pub fn has_eligible_request(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.prune_stale_head();
        matches!(inner.order.peek(), Some(Reverse(item)) if item.eligible_at <= Instant::now())
    }

    /// Suspend until [`Queue::has_eligible_request`] would return `true`.
    ///
    /// Races a `Notify` wakeup (fired by `enqueue`/`requeue`/`processing_complete`) against a
    /// timer set to the nearest known `eligible_at`, instead of polling on a fixed interval.
    pub async fn wait_for_eligible(&self) {
        loop {
            // Subscribe before checking state: `Notify` guarantees that a `notify_waiters()`
            // call occurring after `notified()` was created (even before it's first polled) is
            // observed, which is what rules out the check-then-sleep lost-wakeup race.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            let deadline = {
                let mut inner = self.inner.lock();
                if inner.earliest_eligible_at().map(|at| at <= Instant::now()) == Some(true) {
                    return;
                }
                inner.earliest_eligible_at()
            };
            match deadline {
                Some(at) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Suspend until an eligible entry exists, then remove it from pending and mark its key
    /// processing.
    ///
    /// Ties among eligible entries are broken by `eligible_at` ascending, then by enqueue
    /// order.
    pub async fn dequeue(&self) -> (Request, u32) {
        loop {
            if let Some(result) = self.inner.lock().try_take() {
                return result;
            }
            self.wait_for_eligible().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ObjectKey;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new(name, None)
    }

    fn req(name: &str) -> Request {
        Request::new(key(name))
    }

    #[tokio::test(start_paused = true)]
    async fn basic_enqueue_dequeue() {
        let queue = Queue::new();
        assert!(!queue.has_eligible_request());
        queue.enqueue(req("a"));
        assert!(queue.has_eligible_request());
        let (request, attempt) = queue.dequeue().await;
        assert_eq!(request.key, key("a"));
        assert_eq!(attempt, 0);
        assert!(!queue.has_eligible_request());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_enqueue_before_dequeue_yields_one_dequeue() {
        let queue = Queue::new();
        queue.enqueue(req("a"));
        queue.enqueue(req("a"));
        queue.enqueue(req("a"));
        let _ = queue.dequeue().await;
        assert!(!queue.has_eligible_request());
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_while_processing_marks_dirty_and_requeues_on_complete() {
        let queue = Queue::new();
        let (first, _attempt) = {
            queue.enqueue(req("a"));
            queue.dequeue().await
        };
        // Many more events arrive for the same key while "a" is processing.
        for _ in 0..1000 {
            queue.enqueue(req("a"));
        }
        assert!(!queue.has_eligible_request(), "dirty key must not appear pending");
        queue.processing_complete(first);
        assert!(queue.has_eligible_request());
        let (request, attempt) = queue.dequeue().await;
        assert_eq!(request.key, key("a"));
        assert_eq!(attempt, 0);
        // Exactly one follow-up dequeue, not one per coalesced event.
        assert!(!queue.has_eligible_request());
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_schedules_a_future_retry() {
        let queue = Queue::new();
        queue.enqueue(req("a"));
        let (request, attempt) = queue.dequeue().await;
        queue.requeue(request, attempt + 1, Duration::from_secs(5)).unwrap();
        assert!(!queue.has_eligible_request());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(queue.has_eligible_request());
        let (_request, attempt) = queue.dequeue().await;
        assert_eq!(attempt, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_on_a_key_not_processing_is_an_invariant_violation() {
        let queue = Queue::new();
        let request = req("a");
        let err = queue
            .requeue(request, 1, Duration::from_secs(1))
            .unwrap_err();
        assert!(err.to_string().contains("a"));
        assert!(!queue.has_eligible_request(), "the failed call must not have mutated state");
    }

    #[tokio::test(start_paused = true)]
    async fn single_flight_never_double_processes_a_key() {
        let queue = Queue::new();
        queue.enqueue(req("a"));
        let (first, _) = queue.dequeue().await;
        // A concurrent enqueue for the same key must not produce a second pending entry.
        queue.enqueue(req("a"));
        assert!(!queue.has_eligible_request());
        queue.processing_complete(first);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_are_independently_eligible() {
        let queue = Queue::new();
        for i in 0..20 {
            queue.enqueue(req(&format!("k{i}")));
        }
        let mut seen = HashSet::new();
        for _ in 0..20 {
            let (request, _) = queue.dequeue().await;
            assert!(seen.insert(request.key), "each key must be dequeued exactly once");
        }
        assert!(!queue.has_eligible_request());
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_breaks_ties_by_enqueue_order() {
        let queue = Queue::new();
        queue.enqueue(req("first"));
        queue.enqueue(req("second"));
        let (request, _) = queue.dequeue().await;
        assert_eq!(request.key, key("first"));
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_waits_for_the_nearest_eligible_at() {
        let queue = Queue::new();
        queue.enqueue(req("a"));
        let (request, attempt) = queue.dequeue().await;
        queue.requeue(request, attempt + 1, Duration::from_millis(500)).unwrap();

        let dequeue = queue.dequeue();
        tokio::pin!(dequeue);
        assert!(
            futures::poll!(&mut dequeue).is_pending(),
            "must not be eligible before the delay elapses"
        );
        tokio::time::advance(Duration::from_millis(500)).await;
        let (request, attempt) = dequeue.await;
        assert_eq!(request.key, key("a"));
        assert_eq!(attempt, 1);
    }
}
