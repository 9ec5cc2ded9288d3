//! Fail-fast supervision of a group of concurrent tasks.
//!
//! Mirrors the "first-of-N" shutdown-selector idiom (`futures::future::select_all`) used to
//! compose a watcher stream with a shutdown signal in comparable controller runtimes, but
//! generalized to an arbitrary number of tasks and implemented with [`tokio::task::JoinSet`] so
//! that "the rest" can actually be cancelled rather than merely ignored.

use tokio::task::JoinSet;

/// Run every future in `tasks` concurrently as a group.
///
/// As soon as any one of them terminates (by returning, panicking, or in principle being
/// aborted), every other task in the group is aborted, and that first terminal outcome is
/// returned. This guarantees that if any one task in the group (e.g. a watch) dies, the whole
/// group shuts down instead of silently continuing with one fewer worker.
pub async fn run_tasks<F, T>(tasks: impl IntoIterator<Item = F>) -> Result<T, tokio::task::JoinError>
where
    F: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let mut set = JoinSet::new();
    for task in tasks {
        set.spawn(task);
    }
    let first = set
        .join_next()
        .await
        .expect("run_tasks requires at least one task");
    set.abort_all();
    // Drain the rest so their (now-aborted) JoinErrors don't log as "unhandled" on drop.
    while set.join_next().await.is_some() {}
    first
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn first_completion_wins_and_cancels_the_rest() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancelled2 = cancelled.clone();

        let fast = async { 1u32 };
        let slow = async move {
            let guard = DropFlag(cancelled2);
            tokio::time::sleep(Duration::from_secs(100)).await;
            drop(guard);
            2u32
        };

        let result = run_tasks(vec![
            Box::pin(fast) as std::pin::Pin<Box<dyn std::future::Future<Output = u32> + Send>>,
            Box::pin(slow),
        ])
        .await
        .unwrap();
        assert_eq!(result, 1);
        assert!(cancelled.load(Ordering::SeqCst), "the slow task must have been aborted, running its drop glue");
    }

    struct DropFlag(Arc<AtomicBool>);
    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn a_panicking_task_is_reported_as_the_first_outcome() {
        let panics = async { panic!("boom") };
        let never = std::future::pending::<()>();
        let result = run_tasks(vec![
            Box::pin(panics) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>,
            Box::pin(never),
        ])
        .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().is_panic());
    }
}
