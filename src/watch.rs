//! Binds one external event stream to the queue, turning watch events into requests.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, instrument};

use crate::error::WatchError;
use crate::object::{DynamicObject, LabelSelector};
use crate::queue::Queue;
use crate::request::Request;

/// The kind of change a [`WatchEvent`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// The object was created.
    Added,
    /// The object's spec or status changed.
    Modified,
    /// The object was deleted.
    Deleted,
}

/// A single change observed on a watched resource.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    /// What kind of change this is.
    pub event_type: EventType,
    /// The object as it exists (or existed, for `Deleted`) at the time of the event.
    pub object: DynamicObject,
}

/// The resource and scope a [`Watch`] should observe.
#[derive(Debug, Clone)]
pub struct WatchParams {
    /// The resource's `apiVersion`.
    pub api_version: String,
    /// The resource's `kind`.
    pub kind: String,
    /// Restrict the watch to one namespace, or `None` to watch cluster-wide.
    pub namespace: Option<String>,
    /// Restrict the watch to objects matching this selector.
    pub labels: Option<LabelSelector>,
}

/// The external collaborator this crate consumes a live stream of Kubernetes events from.
///
/// Implementations are expected to absorb reconnects and resource-version resyncs internally;
/// only unrecoverable failures should surface as `Err` items in the returned stream (or as the
/// `Err` of the initial call).
#[async_trait::async_trait]
pub trait ApiClient: Send + Sync {
    /// Open a (possibly infinite, self-healing) stream of events matching `params`.
    async fn watch(
        &self,
        params: &WatchParams,
    ) -> Result<BoxStream<'static, Result<WatchEvent, WatchError>>, WatchError>;
}

/// Derives zero or more [`Request`]s from a single [`WatchEvent`].
pub type Mapper = Arc<dyn Fn(&WatchEvent) -> Vec<Request> + Send + Sync>;

/// A resource kind bound to a queue via a mapper.
///
/// Running a `Watch` drains its stream forever (or until the stream itself errors), enqueuing
/// whatever requests the mapper produces for each event. It carries no state beyond what it
/// needs to start and drive that loop; a terminated `Watch` is simply dropped.
pub struct Watch {
    params: WatchParams,
    mapper: Mapper,
    queue: Arc<Queue>,
}

impl Watch {
    /// Bind `params` to `queue`, deriving requests from each event via `mapper`.
    #[must_use]
    pub fn new(params: WatchParams, mapper: Mapper, queue: Arc<Queue>) -> Self {
        Self {
            params,
            mapper,
            queue,
        }
    }

    /// Run this watch to completion.
    ///
    /// Never returns `Ok` on its own: the underlying stream is expected to run until the
    /// surrounding controller is cancelled. Returns `Err` only when the stream itself (not a
    /// single event) reports an unrecoverable failure.
    #[instrument(skip_all, fields(api_version = %self.params.api_version, kind = %self.params.kind))]
    pub async fn run(self, client: &dyn ApiClient) -> Result<(), WatchError> {
        let mut stream = client.watch(&self.params).await?;
        while let Some(event) = stream.next().await {
            let event = event?;
            for request in (self.mapper)(&event) {
                debug!(key = %request.key, "enqueuing request from watch event");
                self.queue.enqueue(request);
            }
        }
        Ok(())
    }
}

/// The mapper used for a controller's primary resource: one request per event, keyed by the
/// object's own identity.
#[must_use]
pub fn primary_mapper() -> Mapper {
    Arc::new(|event: &WatchEvent| {
        let Some(name) = event.object.name() else {
            return Vec::new();
        };
        let namespace = event.object.namespace().map(str::to_string);
        vec![Request::new(crate::request::ObjectKey::new(
            name.to_string(),
            namespace,
        ))]
    })
}

/// The mapper used for a secondary watch declared via `owns(...)`: one request per owner
/// reference matching `(owner_api_version, owner_kind)`, optionally restricted to the unique
/// controller reference.
#[must_use]
pub fn owned_child_mapper(
    owner_api_version: String,
    owner_kind: String,
    controller_only: bool,
) -> Mapper {
    Arc::new(move |event: &WatchEvent| {
        let namespace = event.object.namespace().map(str::to_string);
        event
            .object
            .owner_references()
            .filter(|owner| {
                owner.api_version == owner_api_version
                    && owner.kind == owner_kind
                    && (!controller_only || owner.controller)
            })
            .map(|owner| {
                Request::new(crate::request::ObjectKey::new(
                    owner.name,
                    namespace.clone(),
                ))
            })
            .collect()
    })
}
