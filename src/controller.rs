//! The controller builder: composes watches, a worker pool, and the dispatch loop into one
//! runnable unit.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, info_span, warn, Instrument};

use crate::backoff;
use crate::error::{Error, QueueInvariantViolation};
use crate::object::LabelSelector;
use crate::queue::Queue;
use crate::request::{ReconcileResult, Request};
use crate::supervisor::run_tasks;
use crate::watch::{owned_child_mapper, primary_mapper, ApiClient, Mapper, Watch, WatchParams};
use crate::worker_pool::WorkerPool;

/// Configuration for a [`Controller`].
///
/// There is no CLI, config file, or environment variable parsing in this crate: this struct is
/// the entire configuration surface, constructed by the embedding application.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// The number of reconciles that may run concurrently.
    pub worker_count: usize,
    /// The ceiling on exponential backoff between failed-reconcile retries.
    pub requeue_max_backoff: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            worker_count: 10,
            requeue_max_backoff: Duration::from_secs(120),
        }
    }
}

struct WatchSpec {
    params: WatchParams,
    mapper: Mapper,
}

/// A running controller for one primary resource kind plus any number of secondary watches.
///
/// Built via [`Controller::new`], extended with [`Controller::owns`] / [`Controller::watches`],
/// and started with [`Controller::run`], which consumes the builder.
pub struct Controller<C, F, Fut, E> {
    primary: WatchSpec,
    secondary: Vec<WatchSpec>,
    reconcile_func: F,
    options: ControllerOptions,
    worker_pool: Option<Arc<WorkerPool>>,
    queue: Arc<Queue>,
    _marker: std::marker::PhantomData<fn(Arc<C>, Request) -> Fut>,
    _error: std::marker::PhantomData<E>,
}

impl<C, F, Fut, E> Controller<C, F, Fut, E>
where
    C: ApiClient + Send + Sync + 'static,
    F: Fn(Arc<C>, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ReconcileResult, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Start building a controller for the primary resource `(api_version, kind)`.
    ///
    /// `reconcile_func` is called with the user's client and a [`Request`] for every primary
    /// event and every event derived from a secondary watch.
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        reconcile_func: F,
        options: ControllerOptions,
    ) -> Self {
        let params = WatchParams {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: None,
            labels: None,
        };
        Self {
            primary: WatchSpec {
                params,
                mapper: primary_mapper(),
            },
            secondary: Vec::new(),
            reconcile_func,
            options,
            worker_pool: None,
            queue: Arc::new(Queue::new()),
            _marker: std::marker::PhantomData,
            _error: std::marker::PhantomData,
        }
    }

    /// Run against a caller-supplied worker pool instead of one constructed from
    /// `ControllerOptions::worker_count`.
    ///
    /// Useful when the caller wants to retain a handle to the pool the controller actually runs
    /// against, e.g. to confirm its capacity is fully released after the controller is
    /// cancelled. `ControllerOptions::worker_count` is ignored when a pool is supplied this way.
    #[must_use]
    pub fn worker_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.worker_pool = Some(pool);
        self
    }

    /// Additionally watch `(api_version, kind)`, mapping each event to the owning primary
    /// object via its `ownerReferences`.
    ///
    /// When `controller_only` is set, only the owner reference with `controller: true` is
    /// considered; otherwise every matching reference produces a request.
    #[must_use]
    pub fn owns(
        mut self,
        api_version: impl Into<String>,
        kind: impl Into<String>,
        controller_only: bool,
    ) -> Self {
        let api_version = api_version.into();
        let kind = kind.into();
        let mapper = owned_child_mapper(
            self.primary.params.api_version.clone(),
            self.primary.params.kind.clone(),
            controller_only,
        );
        self.secondary.push(WatchSpec {
            params: WatchParams {
                api_version,
                kind,
                namespace: None,
                labels: None,
            },
            mapper,
        });
        self
    }

    /// Additionally watch `(api_version, kind)`, mapping each event to requests via an
    /// arbitrary user-supplied `mapper`.
    #[must_use]
    pub fn watches(
        mut self,
        api_version: impl Into<String>,
        kind: impl Into<String>,
        mapper: Mapper,
        labels: Option<LabelSelector>,
        namespace: Option<String>,
    ) -> Self {
        self.secondary.push(WatchSpec {
            params: WatchParams {
                api_version: api_version.into(),
                kind: kind.into(),
                namespace,
                labels,
            },
            mapper,
        });
        self
    }

    /// Run every watch and the dispatch loop to completion.
    ///
    /// Returns only when the task supervisor observes the first terminal outcome among them:
    /// normally this means a watch or the dispatcher hit an unrecoverable error, or the
    /// returned future was cancelled by the caller (e.g. dropped under a `tokio::select!`).
    pub async fn run(mut self, client: Arc<C>) -> Result<(), Error> {
        let worker_pool = self
            .worker_pool
            .take()
            .unwrap_or_else(|| Arc::new(WorkerPool::new(self.options.worker_count)));
        let max_backoff = self.options.requeue_max_backoff;
        let primary_api_version = self.primary.params.api_version.clone();
        let primary_kind = self.primary.params.kind.clone();

        let mut watch_specs = Vec::with_capacity(1 + self.secondary.len());
        watch_specs.push(self.primary);
        watch_specs.extend(self.secondary);

        let client_for_api = client.clone();
        let mut tasks: Vec<std::pin::Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>> =
            Vec::with_capacity(watch_specs.len() + 1);

        for spec in watch_specs {
            let queue = self.queue.clone();
            let api_client = client_for_api.clone();
            tasks.push(Box::pin(async move {
                let api_version = spec.params.api_version.clone();
                let kind = spec.params.kind.clone();
                let watch = Watch::new(spec.params, spec.mapper, queue);
                watch
                    .run(api_client_as_dyn(&*api_client))
                    .await
                    .map_err(|source| Error::Watch {
                        api_version,
                        kind,
                        source,
                    })
            }));
        }

        let queue = self.queue.clone();
        let reconcile_func = Arc::new(self.reconcile_func);
        tasks.push(Box::pin(async move {
            dispatch_loop(
                queue,
                worker_pool,
                client,
                reconcile_func,
                max_backoff,
                primary_api_version,
                primary_kind,
            )
            .await
        }));

        run_tasks(tasks)
            .await
            .map_err(Error::TaskFailed)
            .and_then(std::convert::identity)
    }
}

/// Narrows `client` to the `dyn ApiClient` trait object `Watch::run` expects.
///
/// `C` is the user's own client type, which is also expected to implement `ApiClient`; this
/// crate does not otherwise constrain it.
fn api_client_as_dyn<C: ApiClient + 'static>(client: &C) -> &dyn ApiClient {
    client
}

/// The in-flight reconcile tasks spawned by one dispatch loop.
///
/// Aborts every still-running task on drop, so that cancelling the dispatch loop itself (e.g.
/// the whole controller being cancelled) also cancels whatever reconciles were mid-flight,
/// matching `Worker`'s own reservation-release-on-drop discipline one level up.
#[derive(Default)]
struct InFlight(Vec<tokio::task::JoinHandle<()>>);

impl InFlight {
    fn push(&mut self, handle: tokio::task::JoinHandle<()>) {
        self.0.retain(|h| !h.is_finished());
        self.0.push(handle);
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_loop<C, F, Fut, E>(
    queue: Arc<Queue>,
    worker_pool: Arc<WorkerPool>,
    client: Arc<C>,
    reconcile_func: Arc<F>,
    max_backoff: Duration,
    api_version: String,
    kind: String,
) -> Result<(), Error>
where
    C: Send + Sync + 'static,
    F: Fn(Arc<C>, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ReconcileResult, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut in_flight = InFlight::default();
    // A `handle_request` invocation that hits a queue invariant violation cannot propagate it
    // by returning a value (its task is detached once spawned); it reports it here instead, so
    // the dispatcher can surface it as a fatal `Error::QueueInvariant` and let the supervisor
    // tear down the whole controller.
    let (invariant_tx, mut invariant_rx) = mpsc::channel::<QueueInvariantViolation>(1);

    loop {
        tokio::select! {
            biased;
            Some(violation) = invariant_rx.recv() => {
                return Err(Error::QueueInvariant(violation));
            }
            () = async {
                while !queue.has_eligible_request() {
                    queue.wait_for_eligible().await;
                }
                let worker = worker_pool.reserve().await;
                let (request, attempt) = queue.dequeue().await;
                let worker_id = worker.id;
                let queue = queue.clone();
                let client = client.clone();
                let reconcile_func = reconcile_func.clone();
                let api_version = api_version.clone();
                let kind = kind.clone();
                let invariant_tx = invariant_tx.clone();
                let handle = worker.set_task(async move {
                    handle_request(
                        queue,
                        client,
                        reconcile_func,
                        request,
                        attempt,
                        worker_id,
                        max_backoff,
                        api_version,
                        kind,
                        invariant_tx,
                    )
                    .await;
                });
                in_flight.push(handle);
            } => {}
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_request<C, F, Fut, E>(
    queue: Arc<Queue>,
    client: Arc<C>,
    reconcile_func: Arc<F>,
    request: Request,
    attempt: u32,
    worker_id: u32,
    max_backoff: Duration,
    api_version: String,
    kind: String,
    invariant_tx: mpsc::Sender<QueueInvariantViolation>,
) where
    F: Fn(Arc<C>, Request) -> Fut,
    Fut: Future<Output = Result<ReconcileResult, E>> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    let span = info_span!(
        "reconcile",
        api_version = %api_version,
        kind = %kind,
        key = %request.key,
        request_id = request.id,
        worker_id,
        attempt,
    );
    async move {
        info!("handling request");
        let outcome = reconcile_func(client, request.clone()).await;
        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                error!(error = %err, "reconcile failed");
                ReconcileResult::requeue()
            }
        };

        let requeued = if let Some(explicit) = result.requeue_after {
            let (delay, next_attempt) = backoff::explicit_delay(explicit);
            info!(delay_secs = delay.as_secs_f64(), "requeue scheduled");
            Some(queue.requeue(request, next_attempt, delay))
        } else if result.requeue {
            let (delay, next_attempt) = backoff::failure_delay(attempt, max_backoff);
            warn!(delay_secs = delay.as_secs_f64(), next_attempt, "requeue scheduled after failure");
            Some(queue.requeue(request, next_attempt, delay))
        } else {
            info!("reconcile succeeded");
            queue.processing_complete(request);
            None
        };

        if let Some(Err(violation)) = requeued {
            error!(violation = %violation, "queue invariant violated");
            let _ = invariant_tx.send(violation).await;
        }
    }
    .instrument(span)
    .await;
}
