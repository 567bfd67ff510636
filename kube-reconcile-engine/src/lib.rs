//! Reconciliation engine for Kubernetes controllers.
//!
//! Informers deliver object events, event mappings turn them into
//! [`ReconcileKey`]s which are fed into the deduplicating, rate limited work
//! queue of a [`GenericController`]. Workers take keys from the queue and run
//! the controller's reconcile function until it succeeds.
//! [`ControllerManager`] wires informers and controllers together and runs
//! them until a [`StopSignal`] fires.

#[macro_use]
extern crate log;

pub mod controller;
pub mod errors;
pub mod eventhandlers;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
pub mod informers;
pub mod kube_informer;
pub mod listening_queue;
pub mod manager;
pub mod metrics;
pub mod predicates;
pub mod prometheus_exporter;
pub mod rate_limiter;
pub mod run;
mod utils;
pub mod workqueue;

pub use controller::{ControllerBuilder, ControllerState, GenericController};
pub use errors::ControllerError;
pub use kube_reconcile_engine_apis::{Metrics, ObservedObject, ReconcileKey};
pub use manager::ControllerManager;
pub use run::{RunArguments, StopHandle, StopSignal};
