//! Mapping of observed objects to the keys which have to be reconciled.
//!
//! - [`map_to_self`] reconciles the object itself.
//! - Transformations (closures passed to the `watch_transformation*` methods
//!   of [`GenericController`](crate::controller::GenericController)) map an
//!   object to any number of keys.
//! - [`MapToController`] follows the chain of controller owner references up
//!   to the object the controller is responsible for. E.g. a Deployment
//!   controller watching Pods uses the path `[lookup ReplicaSet, lookup
//!   Deployment]`: a Pod event resolves the Pod's ReplicaSet, then the
//!   ReplicaSet's Deployment, and enqueues the Deployment's key.
//!
//! [`MapAndEnqueue`] runs the predicates and a mapping for every event of an
//! informer and enqueues the result.

use crate::{
    informers::{EventHandler, Informer},
    predicates::Predicate,
    workqueue::RateLimitingQueue,
};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{DynamicObject, GroupVersionKind};
use kube_reconcile_engine_apis::{ObservedObject, ReconcileKey, gvk_of};
use std::sync::Arc;

/// Produces the [`EventHandler`] which feeds a controller's queue.
pub trait EventHandlerProvider: Send + Sync {
    fn get(&self, queue: Arc<RateLimitingQueue>) -> Arc<dyn EventHandler>;
}

impl<F> EventHandlerProvider for F
where
    F: Fn(Arc<RateLimitingQueue>) -> Arc<dyn EventHandler> + Send + Sync,
{
    fn get(&self, queue: Arc<RateLimitingQueue>) -> Arc<dyn EventHandler> {
        self(queue)
    }
}

/// Maps an object to the work queue items to enqueue. Items are key strings,
/// see [`ReconcileKey`].
pub type MapFn = Arc<dyn Fn(&ObservedObject) -> Vec<String> + Send + Sync>;

/// Key of the object itself, `None` if it has no name.
pub fn map_to_self(obj: &ObservedObject) -> Option<ReconcileKey> {
    let key = ReconcileKey::from_meta(obj.meta());
    if key.is_none() {
        error!(
            "cannot compute key of object without name (generateName {:?})",
            obj.meta().generate_name
        );
    }
    key
}

/// Resolves the object with the given key, `Ok(None)` if it does not exist.
pub type ControllerLookup =
    Arc<dyn Fn(&ReconcileKey) -> anyhow::Result<Option<Arc<DynamicObject>>> + Send + Sync>;

/// Lookup step reading from an informer's cache.
pub fn lookup_in(informer: Arc<dyn Informer>) -> ControllerLookup {
    Arc::new(move |key: &ReconcileKey| -> anyhow::Result<Option<Arc<DynamicObject>>> {
        Ok(informer.get(key))
    })
}

/// The owner reference marked as controller, if any.
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .iter()
        .flatten()
        .find(|r| r.controller == Some(true))
}

/// Maps an object to the key of the ancestor reached by following its
/// controller owner references along `path`.
///
/// At every hop the looked up owner must carry the UID recorded in the owner
/// reference, otherwise the reference points to a deleted object whose name
/// was reused and nothing is enqueued.
#[derive(Clone, Default)]
pub struct MapToController {
    path: Vec<ControllerLookup>,
    owner_types: Vec<GroupVersionKind>,
}

impl MapToController {
    pub fn new(path: Vec<ControllerLookup>) -> Self {
        Self {
            path,
            owner_types: vec![],
        }
    }

    /// Only follow objects whose immediate controller is of type `owner_type`.
    /// Can be called multiple times to accept several types.
    pub fn owner_type(mut self, owner_type: GroupVersionKind) -> Self {
        self.owner_types.push(owner_type);
        self
    }

    fn owner_type_matches(&self, owner: &OwnerReference) -> bool {
        self.owner_types.is_empty()
            || self
                .owner_types
                .contains(&gvk_of(owner.api_version.as_str(), owner.kind.as_str()))
    }

    pub fn map(&self, obj: &ObservedObject) -> Option<ReconcileKey> {
        if obj.is_tombstone() {
            debug!(
                "recovered deleted object {:?} from tombstone",
                obj.meta().name
            );
        }
        let namespace = obj.meta().namespace.clone().unwrap_or_default();
        let mut current: Arc<DynamicObject> = match obj {
            ObservedObject::Live(o) | ObservedObject::Tombstone(o) => o.clone(),
        };
        for (hop, lookup) in self.path.iter().enumerate() {
            let owner_ref = match controller_of(&current.metadata) {
                Some(r) => r,
                None => {
                    debug!(
                        "object {:?} does not have a controller owner reference",
                        current.metadata.name
                    );
                    return None;
                }
            };
            if hop == 0 && !self.owner_type_matches(owner_ref) {
                return None;
            }
            let owner_key = ReconcileKey::new(
                current.metadata.namespace.clone().unwrap_or_default(),
                owner_ref.name.clone(),
            );
            let owner = match lookup(&owner_key) {
                Ok(Some(owner)) => owner,
                Ok(None) => {
                    debug!("owner {} of {:?} not found", owner_key, current.metadata.name);
                    return None;
                }
                Err(e) => {
                    debug!("could not lookup owner {}: {}", owner_key, e);
                    return None;
                }
            };
            if owner.metadata.uid.as_deref() != Some(owner_ref.uid.as_str()) {
                debug!(
                    "owner {} has uid {:?} but the reference expects {}",
                    owner_key, owner.metadata.uid, owner_ref.uid
                );
                return None;
            }
            if hop + 1 == self.path.len() {
                return Some(ReconcileKey::new(namespace, owner_ref.name.clone()));
            }
            current = owner;
        }
        None
    }
}

/// Runs predicates and a mapping for every event and enqueues the result
/// with [`RateLimitingQueue::add_rate_limited`].
#[derive(Clone)]
pub struct MapAndEnqueue {
    pub predicates: Vec<Arc<dyn Predicate>>,
    pub map: MapFn,
}

impl MapAndEnqueue {
    pub fn new(map: MapFn, predicates: Vec<Arc<dyn Predicate>>) -> Self {
        Self { predicates, map }
    }

    /// Map by [`map_to_self`].
    pub fn to_self(predicates: Vec<Arc<dyn Predicate>>) -> Self {
        Self::keys(map_to_self, predicates)
    }

    /// Map by a function returning keys; keys without a name are dropped.
    pub fn keys<F, I>(map: F, predicates: Vec<Arc<dyn Predicate>>) -> Self
    where
        F: Fn(&ObservedObject) -> I + Send + Sync + 'static,
        I: IntoIterator<Item = ReconcileKey>,
    {
        Self::new(
            Arc::new(move |obj: &ObservedObject| -> Vec<String> {
                map(obj)
                    .into_iter()
                    .filter(|k| !k.name.is_empty())
                    .map(|k| k.to_string())
                    .collect()
            }),
            predicates,
        )
    }

    /// Map by a function returning key strings; empty strings are dropped,
    /// anything else is enqueued as is.
    pub fn strings<F, I>(map: F, predicates: Vec<Arc<dyn Predicate>>) -> Self
    where
        F: Fn(&ObservedObject) -> I + Send + Sync + 'static,
        I: IntoIterator<Item = String>,
    {
        Self::new(
            Arc::new(move |obj: &ObservedObject| -> Vec<String> {
                map(obj).into_iter().filter(|k| !k.is_empty()).collect()
            }),
            predicates,
        )
    }

    /// Map by a [`MapToController`].
    pub fn to_controller(mapper: MapToController, predicates: Vec<Arc<dyn Predicate>>) -> Self {
        Self::keys(move |obj| mapper.map(obj), predicates)
    }
}

impl EventHandlerProvider for MapAndEnqueue {
    fn get(&self, queue: Arc<RateLimitingQueue>) -> Arc<dyn EventHandler> {
        Arc::new(MapAndEnqueueHandler {
            inner: self.clone(),
            queue,
        })
    }
}

struct MapAndEnqueueHandler {
    inner: MapAndEnqueue,
    queue: Arc<RateLimitingQueue>,
}

impl MapAndEnqueueHandler {
    fn enqueue(&self, obj: &ObservedObject) {
        for key in (self.inner.map)(obj) {
            self.queue.add_rate_limited(key);
        }
    }
}

impl EventHandler for MapAndEnqueueHandler {
    fn on_add(&self, obj: Arc<DynamicObject>) {
        if self.inner.predicates.iter().all(|p| p.handle_create(&obj)) {
            self.enqueue(&ObservedObject::Live(obj));
        }
    }

    fn on_update(&self, old: Arc<DynamicObject>, new: Arc<DynamicObject>) {
        if self
            .inner
            .predicates
            .iter()
            .all(|p| p.handle_update(&old, &new))
        {
            self.enqueue(&ObservedObject::Live(new));
        }
    }

    fn on_delete(&self, obj: ObservedObject) {
        if self.inner.predicates.iter().all(|p| p.handle_delete(&obj)) {
            self.enqueue(&obj);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fake::{FakeInformer, deployment_type, object, owned_by, pod_type, replica_set_type},
        predicates::ResourceVersionChanged,
        rate_limiter::ItemExponentialFailureRateLimiter,
    };
    use std::time::Duration;

    fn lookup_of(informer: &Arc<FakeInformer>) -> ControllerLookup {
        lookup_in(informer.clone())
    }

    fn queue() -> Arc<RateLimitingQueue> {
        Arc::new(RateLimitingQueue::new(
            "test",
            Box::new(ItemExponentialFailureRateLimiter::new(
                Duration::ZERO,
                Duration::ZERO,
            )),
        ))
    }

    #[test]
    fn self_mapping() {
        let pod = object(&pod_type(), "default", "test-pod", "uid1");
        assert_eq!(
            Some(ReconcileKey::new("default", "test-pod")),
            map_to_self(&ObservedObject::from(pod))
        );
        let mut nameless = object(&pod_type(), "default", "x", "uid1");
        nameless.metadata.name = None;
        assert_eq!(None, map_to_self(&ObservedObject::from(nameless)));
    }

    #[test]
    fn owner_chain_one_hop_uid_match() {
        let replica_sets = Arc::new(FakeInformer::new());
        let parent = object(&replica_set_type(), "default", "parent", "uid5");
        replica_sets.seed(parent.clone());
        let mapper = MapToController::new(vec![lookup_of(&replica_sets)]);

        let child = owned_by(object(&pod_type(), "default", "child", "uid1"), &parent, true);
        assert_eq!(
            Some(ReconcileKey::new("default", "parent")),
            mapper.map(&ObservedObject::from(child))
        );
    }

    #[test]
    fn owner_chain_uid_mismatch() {
        let replica_sets = Arc::new(FakeInformer::new());
        let parent = object(&replica_set_type(), "default", "parent", "uid5");
        replica_sets.seed(parent.clone());
        let mapper = MapToController::new(vec![lookup_of(&replica_sets)]);

        // Same name, but the reference was recorded for an earlier incarnation.
        let earlier = object(&replica_set_type(), "default", "parent", "uid3");
        let child = owned_by(object(&pod_type(), "default", "child", "uid1"), &earlier, true);
        assert_eq!(None, mapper.map(&ObservedObject::from(child)));
    }

    #[test]
    fn owner_chain_two_hops() {
        let replica_sets = Arc::new(FakeInformer::new());
        let deployments = Arc::new(FakeInformer::new());
        let grandparent = object(&deployment_type(), "default", "grandparent", "uid7");
        let parent = owned_by(
            object(&replica_set_type(), "default", "parent", "uid5"),
            &grandparent,
            true,
        );
        deployments.seed(grandparent.clone());
        replica_sets.seed(parent.clone());
        let mapper =
            MapToController::new(vec![lookup_of(&replica_sets), lookup_of(&deployments)]);

        let child = owned_by(object(&pod_type(), "default", "child", "uid1"), &parent, true);
        assert_eq!(
            Some(ReconcileKey::new("default", "grandparent")),
            mapper.map(&ObservedObject::from(child.clone()))
        );

        // second hop with mismatching uid
        let other_deployments = Arc::new(FakeInformer::new());
        other_deployments.seed(object(&deployment_type(), "default", "grandparent", "uid9"));
        let mapper =
            MapToController::new(vec![lookup_of(&replica_sets), lookup_of(&other_deployments)]);
        assert_eq!(None, mapper.map(&ObservedObject::from(child)));
    }

    #[test]
    fn owner_chain_without_controller_reference() {
        let replica_sets = Arc::new(FakeInformer::new());
        let parent = object(&replica_set_type(), "default", "parent", "uid5");
        replica_sets.seed(parent.clone());
        let mapper = MapToController::new(vec![lookup_of(&replica_sets)]);

        let orphan = object(&pod_type(), "default", "child", "uid1");
        assert_eq!(None, mapper.map(&ObservedObject::from(orphan)));
        // owner reference which is not the controller
        let owned = owned_by(object(&pod_type(), "default", "child", "uid1"), &parent, false);
        assert_eq!(None, mapper.map(&ObservedObject::from(owned)));
    }

    #[test]
    fn owner_chain_lookup_failures() {
        let parent = object(&replica_set_type(), "default", "parent", "uid5");
        let child = owned_by(object(&pod_type(), "default", "child", "uid1"), &parent, true);

        let failing: ControllerLookup = Arc::new(
            |_: &ReconcileKey| -> anyhow::Result<Option<Arc<DynamicObject>>> {
                Err(anyhow::anyhow!("boom"))
            },
        );
        assert_eq!(
            None,
            MapToController::new(vec![failing]).map(&ObservedObject::from(child.clone()))
        );
        let missing: ControllerLookup = Arc::new(
            |_: &ReconcileKey| -> anyhow::Result<Option<Arc<DynamicObject>>> { Ok(None) },
        );
        assert_eq!(
            None,
            MapToController::new(vec![missing]).map(&ObservedObject::from(child.clone()))
        );
        assert_eq!(None, MapToController::new(vec![]).map(&ObservedObject::from(child)));
    }

    #[test]
    fn owner_chain_lookup_uses_child_namespace() {
        let parent = object(&replica_set_type(), "team-a", "parent", "uid5");
        let child = owned_by(object(&pod_type(), "team-a", "child", "uid1"), &parent, true);
        let lookup: ControllerLookup = Arc::new(
            move |key: &ReconcileKey| -> anyhow::Result<Option<Arc<DynamicObject>>> {
            assert_eq!(&ReconcileKey::new("team-a", "parent"), key);
                Ok(Some(Arc::new(parent.clone())))
            },
        );
        assert_eq!(
            Some(ReconcileKey::new("team-a", "parent")),
            MapToController::new(vec![lookup]).map(&ObservedObject::from(child))
        );
    }

    #[test]
    fn owner_chain_owner_type_filter() {
        let replica_sets = Arc::new(FakeInformer::new());
        let parent = object(&replica_set_type(), "default", "parent", "uid5");
        replica_sets.seed(parent.clone());
        let child = owned_by(object(&pod_type(), "default", "child", "uid1"), &parent, true);

        let matching = MapToController::new(vec![lookup_of(&replica_sets)])
            .owner_type(deployment_type())
            .owner_type(replica_set_type());
        assert_eq!(
            Some(ReconcileKey::new("default", "parent")),
            matching.map(&ObservedObject::from(child.clone()))
        );
        let other =
            MapToController::new(vec![lookup_of(&replica_sets)]).owner_type(deployment_type());
        assert_eq!(None, other.map(&ObservedObject::from(child)));
    }

    #[test]
    fn owner_chain_tombstone() {
        let replica_sets = Arc::new(FakeInformer::new());
        let parent = object(&replica_set_type(), "default", "parent", "uid5");
        replica_sets.seed(parent.clone());
        let mapper = MapToController::new(vec![lookup_of(&replica_sets)]);
        let child = owned_by(object(&pod_type(), "default", "child", "uid1"), &parent, true);
        assert_eq!(
            Some(ReconcileKey::new("default", "parent")),
            mapper.map(&ObservedObject::Tombstone(Arc::new(child)))
        );
    }

    #[tokio::test]
    async fn map_and_enqueue_runs_predicates() {
        let q = queue();
        let handler = MapAndEnqueue::to_self(vec![Arc::new(ResourceVersionChanged)]).get(q.clone());
        let pod = Arc::new(object(&pod_type(), "default", "test-pod", "uid1"));

        handler.on_update(pod.clone(), pod.clone());
        assert_eq!(0, q.len());

        handler.on_add(pod.clone());
        assert_eq!(1, q.len());
        assert_eq!(Some("default/test-pod".to_string()), q.get().await);
        q.done("default/test-pod");

        handler.on_delete(ObservedObject::Tombstone(pod));
        assert_eq!(1, q.len());
    }

    #[tokio::test]
    async fn map_and_enqueue_many_keys() {
        let q = queue();
        let handler = MapAndEnqueue::keys(
            |obj: &ObservedObject| {
                let name = obj.meta().name.clone().unwrap_or_default();
                vec![
                    ReconcileKey::new("a", name.clone()),
                    ReconcileKey::new("b", name),
                    ReconcileKey::new("c", ""),
                ]
            },
            vec![],
        )
        .get(q.clone());
        handler.on_add(Arc::new(object(&pod_type(), "default", "x", "uid1")));
        assert_eq!(2, q.len());

        let q = queue();
        let ignore = MapAndEnqueue::keys(|_: &ObservedObject| None::<ReconcileKey>, vec![]).get(q.clone());
        ignore.on_add(Arc::new(object(&pod_type(), "default", "x", "uid1")));
        assert_eq!(0, q.len());
    }

    #[tokio::test]
    async fn map_and_enqueue_strings_are_not_validated() {
        let q = queue();
        let handler = MapAndEnqueue::strings(
            |_: &ObservedObject| vec!["hello/world/foo".to_string(), String::new()],
            vec![],
        )
        .get(q.clone());
        handler.on_add(Arc::new(object(&pod_type(), "default", "x", "uid1")));
        assert_eq!(Some("hello/world/foo".to_string()), q.get().await);
        assert_eq!(0, q.len());
    }
}
