use std::{fmt, str::FromStr, sync::Arc};

use kube::core::{DynamicObject, GroupVersionKind, ObjectMeta};
use serde::{Deserialize, Serialize};

/// Separator between namespace and name in the string form of a [`ReconcileKey`].
pub const KEY_SEPARATOR: char = '/';

/// A key string which does not have the form `namespace/name` or `name`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unexpected key format: {key:?}")]
pub struct MalformedKeyError {
    pub key: String,
}

/// Namespace and name of the object a reconcile is requested for.
///
/// The namespace is empty for cluster scoped objects. The string form is
/// `namespace/name`, or just `name` for cluster scoped objects, and is what
/// gets stored in the work queue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReconcileKey {
    pub namespace: String,
    pub name: String,
}

impl ReconcileKey {
    /// Neither part may contain [`KEY_SEPARATOR`], otherwise the string form
    /// of the key does not parse back into it. Kubernetes names never do.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self::new("", name)
    }

    /// Key of the object described by `meta`, `None` if the object has no name.
    pub fn from_meta(meta: &ObjectMeta) -> Option<Self> {
        match meta.name.as_deref() {
            Some(name) if !name.is_empty() => Some(Self::new(
                meta.namespace.as_deref().unwrap_or(""),
                name,
            )),
            _ => None,
        }
    }

    /// Parse a key from its string form.
    pub fn parse(key: &str) -> Result<Self, MalformedKeyError> {
        let mut parts = key.split(KEY_SEPARATOR);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) => Ok(Self::cluster_scoped(name)),
            (Some(namespace), Some(name), None) => Ok(Self::new(namespace, name)),
            _ => Err(MalformedKeyError {
                key: key.to_string(),
            }),
        }
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}{}{}", self.namespace, KEY_SEPARATOR, self.name)
        }
    }
}

impl FromStr for ReconcileKey {
    type Err = MalformedKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ReconcileKey {
    type Error = MalformedKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value.as_str())
    }
}

impl From<ReconcileKey> for String {
    fn from(key: ReconcileKey) -> Self {
        key.to_string()
    }
}

/// An object as delivered by an event source.
///
/// Deletions are not always observed with the final state of the object, e.g.
/// if the watch was interrupted and the object vanished before the re-list.
/// In that case the event source hands out the last state it knew of as a
/// [`ObservedObject::Tombstone`].
#[derive(Clone, Debug)]
pub enum ObservedObject {
    Live(Arc<DynamicObject>),
    Tombstone(Arc<DynamicObject>),
}

impl ObservedObject {
    /// The observed object, or the last known state for tombstones.
    pub fn object(&self) -> &DynamicObject {
        match self {
            ObservedObject::Live(o) | ObservedObject::Tombstone(o) => o,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        &self.object().metadata
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, ObservedObject::Tombstone(_))
    }
}

impl From<Arc<DynamicObject>> for ObservedObject {
    fn from(o: Arc<DynamicObject>) -> Self {
        ObservedObject::Live(o)
    }
}

impl From<DynamicObject> for ObservedObject {
    fn from(o: DynamicObject) -> Self {
        ObservedObject::Live(Arc::new(o))
    }
}

/// Point-in-time view of a controller's work queue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    /// Start times (unix seconds, ascending) of the reconciles currently running.
    pub uncompleted_reconcile_ts: Vec<i64>,
    /// Number of keys waiting to be processed.
    pub queue_length: usize,
}

/// Split an `apiVersion` (`group/version` or `version` for the core group)
/// into group and version.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// The [`GroupVersionKind`] denoted by an `apiVersion` and a `kind`.
pub fn gvk_of(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = split_api_version(api_version);
    GroupVersionKind::gvk(group, version, kind)
}

/// Human readable `group/version/kind` form of a [`GroupVersionKind`].
pub fn gvk_name(gvk: &GroupVersionKind) -> String {
    format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
}
