//! In-memory [`Informer`] for tests.
//!
//! Objects are fed in through [`FakeInformer::add`], [`FakeInformer::update`]
//! and [`FakeInformer::delete`], which update the cache and call the
//! registered handlers on the caller's task.

use crate::{
    informers::{EventHandler, Informer},
    run::StopSignal,
};

use futures::{FutureExt, future::BoxFuture};
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube_reconcile_engine_apis::{ObservedObject, ReconcileKey};
use std::{
    collections::HashMap,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

pub struct FakeInformer {
    synced: AtomicBool,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    objects: RwLock<HashMap<ReconcileKey, Arc<DynamicObject>>>,
}

impl Default for FakeInformer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeInformer {
    /// A synced, empty informer.
    pub fn new() -> Self {
        Self {
            synced: AtomicBool::new(true),
            handlers: Default::default(),
            objects: Default::default(),
        }
    }

    /// An informer whose initial list has not been delivered yet.
    pub fn unsynced() -> Self {
        let me = Self::new();
        me.set_synced(false);
        me
    }

    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }

    fn handlers(&self) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, obj: &Arc<DynamicObject>) -> Option<Arc<DynamicObject>> {
        let key = ReconcileKey::from_meta(&obj.metadata)?;
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, obj.clone())
    }

    fn remove(&self, obj: &DynamicObject) {
        if let Some(key) = ReconcileKey::from_meta(&obj.metadata) {
            self.objects
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
        }
    }

    /// Put `obj` into the cache without notifying anybody.
    pub fn seed(&self, obj: DynamicObject) {
        self.store(&Arc::new(obj));
    }

    pub fn add(&self, obj: DynamicObject) {
        let obj = Arc::new(obj);
        self.store(&obj);
        for h in self.handlers() {
            h.on_add(obj.clone());
        }
    }

    /// Replace `new` in the cache and notify handlers with the previous state,
    /// which must exist.
    pub fn update(&self, new: DynamicObject) {
        let new = Arc::new(new);
        match self.store(&new) {
            Some(old) => {
                for h in self.handlers() {
                    h.on_update(old.clone(), new.clone());
                }
            }
            None => {
                for h in self.handlers() {
                    h.on_add(new.clone());
                }
            }
        }
    }

    pub fn delete(&self, obj: DynamicObject) {
        self.remove(&obj);
        let obj = Arc::new(obj);
        for h in self.handlers() {
            h.on_delete(ObservedObject::Live(obj.clone()));
        }
    }

    /// Deletion whose final state was missed, `last_known` is handed out as a
    /// tombstone.
    pub fn delete_final_state_unknown(&self, last_known: DynamicObject) {
        self.remove(&last_known);
        let obj = Arc::new(last_known);
        for h in self.handlers() {
            h.on_delete(ObservedObject::Tombstone(obj.clone()));
        }
    }
}

impl Informer for FakeInformer {
    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    fn add_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    fn get(&self, key: &ReconcileKey) -> Option<Arc<DynamicObject>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn run(&self, stop: StopSignal) -> BoxFuture<'static, ()> {
        async move { stop.stopped().await }.boxed()
    }
}

pub fn pod_type() -> GroupVersionKind {
    GroupVersionKind::gvk("", "v1", "Pod")
}

pub fn replica_set_type() -> GroupVersionKind {
    GroupVersionKind::gvk("apps", "v1", "ReplicaSet")
}

pub fn deployment_type() -> GroupVersionKind {
    GroupVersionKind::gvk("apps", "v1", "Deployment")
}

/// Object of type `gvk` with the given identity.
pub fn object(gvk: &GroupVersionKind, namespace: &str, name: &str, uid: &str) -> DynamicObject {
    let mut o = DynamicObject::new(name, &ApiResource::from_gvk(gvk));
    if !namespace.is_empty() {
        o = o.within(namespace);
    }
    o.metadata.uid = Some(uid.to_string());
    o.metadata.resource_version = Some("1".to_string());
    o
}

/// Add an owner reference to `owner`, marked as controller if `controller`.
pub fn owned_by(mut o: DynamicObject, owner: &DynamicObject, controller: bool) -> DynamicObject {
    let types = owner.types.clone().unwrap_or_default();
    o.metadata
        .owner_references
        .get_or_insert_with(Vec::new)
        .push(OwnerReference {
            api_version: types.api_version,
            kind: types.kind,
            name: owner.metadata.name.clone().unwrap_or_default(),
            uid: owner.metadata.uid.clone().unwrap_or_default(),
            controller: Some(controller),
            block_owner_deletion: None,
        });
    o
}
