//! Coordinates informers and the controllers consuming them.

use crate::{
    controller::{ControllerBuilder, GenericController},
    errors::ControllerError,
    informers::{Informer, InformerProvider, InformerRegistry},
    metrics::queue_gauges,
    run::RunArguments,
};

use kube::api::GroupVersionKind;
use kube_reconcile_engine_apis::gvk_name;
use opentelemetry::metrics::ObservableGauge;
use std::{
    panic::Location,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::task::JoinHandle;

/// Holds the informer provider of every object type and the controllers
/// built on top of them. Informers are shared: every controller watching an
/// object type registers its handler with the same informer.
#[derive(Default)]
pub struct ControllerManager {
    informers: InformerRegistry,
    controllers: Vec<Arc<GenericController>>,
    gauges: Mutex<Vec<ObservableGauge<u64>>>,
}

impl ControllerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn informers(&self) -> &InformerRegistry {
        &self.informers
    }

    /// Register the informer provider of `object_type`. There can only be
    /// one provider per object type.
    pub fn add_informer_provider<P: InformerProvider + 'static>(
        &self,
        object_type: GroupVersionKind,
        provider: P,
    ) -> Result<(), ControllerError> {
        let name = gvk_name(&object_type);
        self.informers.insert(object_type, provider)?;
        debug!("registered informer provider for {}", name);
        Ok(())
    }

    #[track_caller]
    pub fn get_informer_provider(
        &self,
        object_type: &GroupVersionKind,
    ) -> Option<Arc<dyn InformerProvider>> {
        let provider = self.informers.get_informer_provider(object_type);
        if provider.is_none() {
            warn_missing_informer(object_type, Location::caller());
        }
        provider
    }

    #[track_caller]
    pub fn get_informer(&self, object_type: &GroupVersionKind) -> Option<Arc<dyn Informer>> {
        let informer = self.informers.get_informer(object_type);
        if informer.is_none() {
            warn_missing_informer(object_type, Location::caller());
        }
        informer
    }

    /// Builder for a controller watching the informers of this manager.
    pub fn controller_builder(&self) -> ControllerBuilder {
        ControllerBuilder::new(self.informers.clone())
    }

    pub fn add_controller(&mut self, controller: Arc<GenericController>) {
        self.controllers.push(controller);
    }

    /// First controller named `name`.
    pub fn get_controller(&self, name: &str) -> Option<Arc<GenericController>> {
        self.controllers.iter().find(|c| c.name() == name).cloned()
    }

    pub fn controllers(&self) -> &[Arc<GenericController>] {
        &self.controllers
    }

    /// Start all informers and controllers without waiting for them. The
    /// returned handles resolve once the respective controller shut down.
    pub fn run_informers_and_controllers(
        &self,
        options: RunArguments,
    ) -> Vec<JoinHandle<Result<(), ControllerError>>> {
        let (parallelism, stop) = options.normalized();
        info!("starting informers {}", self.informers);
        self.informers.run_all(&stop);
        self.gauges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(queue_gauges(&self.controllers));
        self.controllers
            .iter()
            .map(|c| {
                info!("starting controller {}", c.name());
                tokio::spawn(
                    c.clone()
                        .run(RunArguments::new(parallelism, stop.clone())),
                )
            })
            .collect()
    }
}

impl std::fmt::Display for ControllerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.controllers.iter().map(|c| c.name()).collect();
        write!(
            f,
            "ControllerManager {{ informers: {}, controllers: [{}] }}",
            self.informers,
            names.join(", ")
        )
    }
}

fn warn_missing_informer(object_type: &GroupVersionKind, caller: &Location<'_>) {
    warn!(
        "no informer provider registered for {} (requested at {}:{}), register one with add_informer_provider",
        gvk_name(object_type),
        caller.file(),
        caller.line()
    );
}
