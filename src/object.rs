//! A structural (untyped) view of a Kubernetes API object.
//!
//! This crate carries no typed Kubernetes object model or CRD machinery; that belongs to a
//! client layer built on top of it. Objects are instead represented as a thin wrapper around a
//! [`serde_json::Value`] with path-based accessors for the handful of `metadata` fields the
//! queue/watch machinery actually needs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A Kubernetes API object, represented structurally rather than with a generated type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DynamicObject(pub Value);

impl DynamicObject {
    /// Wrap a raw JSON value as a `DynamicObject`.
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// `metadata.name`.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.0.pointer("/metadata/name").and_then(Value::as_str)
    }

    /// `metadata.namespace`, if the object is namespaced.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.0.pointer("/metadata/namespace").and_then(Value::as_str)
    }

    /// `metadata.labels`, as a flat map of string to string.
    pub fn labels(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .pointer("/metadata/labels")
            .and_then(Value::as_object)
            .into_iter()
            .flatten()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.as_str(), v)))
    }

    /// `metadata.ownerReferences`, parsed into [`OwnerReference`]s.
    ///
    /// Entries that are missing a required field are skipped rather than causing the whole
    /// list to be discarded, since a single malformed owner reference should not hide the
    /// others.
    pub fn owner_references(&self) -> impl Iterator<Item = OwnerReference> + '_ {
        self.0
            .pointer("/metadata/ownerReferences")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(OwnerReference::from_json)
    }
}

/// A pointer from a child object's metadata back to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerReference {
    /// The owner's `apiVersion`.
    pub api_version: String,
    /// The owner's `kind`.
    pub kind: String,
    /// The owner's `name`.
    pub name: String,
    /// Whether this reference marks the unique managing controller of the child.
    pub controller: bool,
    /// The owner's `uid`.
    pub uid: String,
}

impl OwnerReference {
    fn from_json(value: &Value) -> Option<Self> {
        Some(Self {
            api_version: value.get("apiVersion")?.as_str()?.to_string(),
            kind: value.get("kind")?.as_str()?.to_string(),
            name: value.get("name")?.as_str()?.to_string(),
            controller: value
                .get("controller")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            uid: value
                .get("uid")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

/// A label selector, passed through to the [`ApiClient`](crate::watch::ApiClient) unmodified.
///
/// This crate does not interpret selectors itself; it is a value type threaded through
/// [`WatchParams`](crate::watch::WatchParams) to the external client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector(pub Vec<(String, String)>);

impl LabelSelector {
    /// Build a selector requiring every given `key=value` pair.
    #[must_use]
    pub fn matching(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self(pairs.into_iter().collect())
    }
}
