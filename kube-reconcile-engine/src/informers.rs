//! Contract between the engine and event sources.
//!
//! An [`Informer`] pushes add/update/delete notifications for one object type
//! to its registered [`EventHandler`]s and keeps a local cache of the objects
//! it has seen. Informers are registered per object type
//! ([`GroupVersionKind`]) in the [`InformerRegistry`] of a
//! [`ControllerManager`](crate::manager::ControllerManager).

use crate::{errors::ControllerError, run::StopSignal};

use futures::future::BoxFuture;
use kube::api::{DynamicObject, GroupVersionKind};
use kube_reconcile_engine_apis::{ObservedObject, ReconcileKey, gvk_name};
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

/// Receives the notifications of an [`Informer`].
///
/// Callbacks run on the informer's task and must not block.
pub trait EventHandler: Send + Sync {
    fn on_add(&self, obj: Arc<DynamicObject>);
    fn on_update(&self, old: Arc<DynamicObject>, new: Arc<DynamicObject>);
    fn on_delete(&self, obj: ObservedObject);
}

pub trait Informer: Send + Sync {
    /// Whether the initial list of objects has been delivered and the cache is
    /// complete.
    fn has_synced(&self) -> bool;

    fn add_event_handler(&self, handler: Arc<dyn EventHandler>);

    /// Read the cached state of an object.
    fn get(&self, key: &ReconcileKey) -> Option<Arc<DynamicObject>>;

    /// The informer's main loop, resolves after `stop` fired.
    fn run(&self, stop: StopSignal) -> BoxFuture<'static, ()>;
}

pub trait InformerProvider: Send + Sync {
    fn informer(&self) -> Arc<dyn Informer>;
}

impl<I: Informer + 'static> InformerProvider for Arc<I> {
    fn informer(&self) -> Arc<dyn Informer> {
        self.clone()
    }
}

/// Object type to informer provider mapping. Cloning yields a handle to the
/// same registry.
#[derive(Clone, Default)]
pub struct InformerRegistry {
    providers: Arc<RwLock<HashMap<GroupVersionKind, Arc<dyn InformerProvider>>>>,
}

impl InformerRegistry {
    /// Register `provider` for `object_type`, fails if one is registered
    /// already.
    pub fn insert<P: InformerProvider + 'static>(
        &self,
        object_type: GroupVersionKind,
        provider: P,
    ) -> Result<(), ControllerError> {
        let mut providers = self
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if providers.contains_key(&object_type) {
            return Err(ControllerError::DuplicateEventSource(gvk_name(
                &object_type,
            )));
        }
        providers.insert(object_type, Arc::new(provider));
        Ok(())
    }

    pub fn get_informer_provider(
        &self,
        object_type: &GroupVersionKind,
    ) -> Option<Arc<dyn InformerProvider>> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(object_type)
            .cloned()
    }

    pub fn get_informer(&self, object_type: &GroupVersionKind) -> Option<Arc<dyn Informer>> {
        self.get_informer_provider(object_type)
            .map(|p| p.informer())
    }

    pub fn object_types(&self) -> Vec<GroupVersionKind> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the main loop of every registered informer.
    pub fn run_all(&self, stop: &StopSignal) {
        let providers: Vec<(GroupVersionKind, Arc<dyn InformerProvider>)> = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (object_type, provider) in providers {
            debug!("starting informer for {}", gvk_name(&object_type));
            tokio::spawn(provider.informer().run(stop.clone()));
        }
    }
}

impl std::fmt::Display for InformerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.object_types().iter().map(gvk_name).collect();
        names.sort();
        write!(f, "[{}]", names.join(", "))
    }
}
