//! # Generic controller
//!
//! A [`GenericController`] owns a rate limited work queue which is fed by
//! informers (through the `watch*` methods) and drained by a pool of workers
//! calling the reconcile function for every key.
//!
//! Guarantees:
//!
//! - Workers only start after every watched informer has synced.
//! - A key is never reconciled by two workers at the same time. A key which
//!   is enqueued again while it is being reconciled is reconciled once more
//!   afterwards.
//! - Failed (or panicking) reconciles are retried with backoff, successful
//!   ones reset the backoff of the key.

use crate::{
    errors::ControllerError,
    eventhandlers::{EventHandlerProvider, MapAndEnqueue, MapToController},
    informers::InformerRegistry,
    listening_queue::ListeningQueue,
    metrics::{ControllerMetrics, ReconcileTimestamps},
    predicates::Predicate,
    rate_limiter::{RateLimiter, default_controller_rate_limiter},
    run::RunArguments,
    workqueue::RateLimitingQueue,
};

use futures::{
    FutureExt,
    future::{BoxFuture, join_all},
};
use k8s_openapi::chrono::Utc;
use kube::api::GroupVersionKind;
use kube_reconcile_engine_apis::{Metrics, ObservedObject, ReconcileKey};
use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};
use tokio::{
    runtime::Handle,
    sync::mpsc::Receiver,
    time::{Duration, sleep},
};

/// Interval in which `run` checks whether the watched informers have synced.
const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

static CONTROLLER_COUNT: AtomicU64 = AtomicU64::new(0);

pub type ReconcileFn =
    Arc<dyn Fn(ReconcileKey) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type BeforeReconcileFn = Arc<dyn Fn(&ReconcileKey) + Send + Sync>;
pub type AfterReconcileFn = Arc<dyn Fn(&ReconcileKey, Option<&anyhow::Error>) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    Initialized,
    Running,
    ShuttingDown,
    Stopped,
}

pub struct ControllerBuilder {
    informers: InformerRegistry,
    name: Option<String>,
    reconcile: Option<ReconcileFn>,
    before_reconcile: Option<BeforeReconcileFn>,
    after_reconcile: Option<AfterReconcileFn>,
    rate_limiter: Option<Box<dyn RateLimiter>>,
}

impl ControllerBuilder {
    /// Builder for a controller watching informers of `informers`. Usually
    /// obtained through [`ControllerManager::controller_builder`](crate::manager::ControllerManager::controller_builder).
    pub fn new(informers: InformerRegistry) -> Self {
        Self {
            informers,
            name: None,
            reconcile: None,
            before_reconcile: None,
            after_reconcile: None,
            rate_limiter: None,
        }
    }

    /// Name of the controller and its queue, `controller-<n>` if not set.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn reconcile<F, Fut>(mut self, reconcile: F) -> Self
    where
        F: Fn(ReconcileKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let reconcile: ReconcileFn = Arc::new(
            move |key: ReconcileKey| -> BoxFuture<'static, anyhow::Result<()>> {
                reconcile(key).boxed()
            },
        );
        self.reconcile = Some(reconcile);
        self
    }

    /// Called right before every reconcile.
    pub fn before_reconcile(mut self, hook: impl Fn(&ReconcileKey) + Send + Sync + 'static) -> Self {
        let hook: BeforeReconcileFn = Arc::new(hook);
        self.before_reconcile = Some(hook);
        self
    }

    /// Called after every reconcile with its error, if any.
    pub fn after_reconcile(
        mut self,
        hook: impl Fn(&ReconcileKey, Option<&anyhow::Error>) + Send + Sync + 'static,
    ) -> Self {
        let hook: AfterReconcileFn = Arc::new(hook);
        self.after_reconcile = Some(hook);
        self
    }

    /// Replace the [`default_controller_rate_limiter`].
    pub fn rate_limiter(mut self, rate_limiter: Box<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn build(self) -> GenericController {
        let name = self.name.unwrap_or_else(|| {
            format!(
                "controller-{}",
                CONTROLLER_COUNT.fetch_add(1, Ordering::SeqCst)
            )
        });
        let reconcile = self.reconcile.unwrap_or_else(|| {
            let controller = name.clone();
            let noop: ReconcileFn = Arc::new(
                move |key: ReconcileKey| -> BoxFuture<'static, anyhow::Result<()>> {
                    info!("{}: no reconcile function set, ignoring {}", controller, key);
                    futures::future::ready(Ok(())).boxed()
                },
            );
            noop
        });
        let queue = RateLimitingQueue::new(
            name.clone(),
            self.rate_limiter
                .unwrap_or_else(default_controller_rate_limiter),
        );
        GenericController {
            metrics: ControllerMetrics::new(&name),
            name,
            queue: ListeningQueue::new(queue, self.informers),
            reconcile,
            before_reconcile: self.before_reconcile,
            after_reconcile: self.after_reconcile,
            state: Mutex::new(ControllerState::Initialized),
            in_flight: Default::default(),
        }
    }
}

pub struct GenericController {
    name: String,
    queue: ListeningQueue,
    reconcile: ReconcileFn,
    before_reconcile: Option<BeforeReconcileFn>,
    after_reconcile: Option<AfterReconcileFn>,
    state: Mutex<ControllerState>,
    in_flight: ReconcileTimestamps,
    metrics: ControllerMetrics,
}

impl GenericController {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ControllerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ControllerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn queue(&self) -> &Arc<RateLimitingQueue> {
        self.queue.queue()
    }

    /// Reconcile objects of `object_type` by their own key.
    pub fn watch(
        &self,
        object_type: &GroupVersionKind,
        predicates: Vec<Arc<dyn Predicate>>,
    ) -> Result<(), ControllerError> {
        self.queue
            .add_event_handler(object_type, &MapAndEnqueue::to_self(predicates))
    }

    /// Reconcile the controlling ancestor of objects of `object_type`.
    pub fn watch_controller_of(
        &self,
        object_type: &GroupVersionKind,
        mapper: MapToController,
        predicates: Vec<Arc<dyn Predicate>>,
    ) -> Result<(), ControllerError> {
        self.queue.add_event_handler(
            object_type,
            &MapAndEnqueue::to_controller(mapper, predicates),
        )
    }

    /// Reconcile the keys `map` computes for objects of `object_type`.
    pub fn watch_transformation_of<F, I>(
        &self,
        object_type: &GroupVersionKind,
        map: F,
        predicates: Vec<Arc<dyn Predicate>>,
    ) -> Result<(), ControllerError>
    where
        F: Fn(&ObservedObject) -> I + Send + Sync + 'static,
        I: IntoIterator<Item = ReconcileKey>,
    {
        self.queue
            .add_event_handler(object_type, &MapAndEnqueue::keys(map, predicates))
    }

    /// Like [`GenericController::watch_transformation_of`] with key strings.
    /// Strings which are not valid keys are dropped by the workers.
    pub fn watch_transformation_keys_of<F, I>(
        &self,
        object_type: &GroupVersionKind,
        map: F,
        predicates: Vec<Arc<dyn Predicate>>,
    ) -> Result<(), ControllerError>
    where
        F: Fn(&ObservedObject) -> I + Send + Sync + 'static,
        I: IntoIterator<Item = String>,
    {
        self.queue
            .add_event_handler(object_type, &MapAndEnqueue::strings(map, predicates))
    }

    /// Bind a custom [`EventHandler`](crate::informers::EventHandler) to the
    /// informer of `object_type`.
    pub fn watch_events(
        &self,
        object_type: &GroupVersionKind,
        provider: &dyn EventHandlerProvider,
    ) -> Result<(), ControllerError> {
        self.queue.add_event_handler(object_type, provider)
    }

    /// Reconcile every key string received on `rx`.
    pub fn watch_channel(&self, rx: Receiver<String>) {
        self.queue.watch_channel(rx)
    }

    pub fn get_metrics(&self) -> Metrics {
        Metrics {
            uncompleted_reconcile_ts: self.in_flight.sorted(),
            queue_length: self.queue.queue().len(),
        }
    }

    /// Wait for the watched informers to sync, then process keys with
    /// `controller_parallelism` workers until the stop signal fires.
    ///
    /// Returns once shutdown started, the workers finish the reconciles in
    /// progress in the background.
    pub async fn run(self: Arc<Self>, options: RunArguments) -> Result<(), ControllerError> {
        let (parallelism, stop) = options.normalized();
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != ControllerState::Initialized {
                return Err(ControllerError::AlreadyStarted(self.name.clone()));
            }
            *state = ControllerState::Running;
        }
        self.queue.start_channels(&Handle::current());
        info!("{}: waiting for caches to sync", self.name);
        let synced = async {
            while !self.queue.has_synced() {
                sleep(SYNC_POLL_INTERVAL).await;
            }
        };
        tokio::select! {
            biased;
            _ = synced => (),
            _ = stop.stopped() => {
                self.set_state(ControllerState::ShuttingDown);
                self.queue.queue().shut_down();
                self.set_state(ControllerState::Stopped);
                let err = ControllerError::CacheSyncFailed(self.name.clone());
                error!("{}", err);
                return Err(err);
            }
        }
        info!("{}: starting {} workers", self.name, parallelism);
        let workers: Vec<_> = (0..parallelism)
            .map(|_| tokio::spawn(self.clone().worker()))
            .collect();

        stop.stopped().await;
        info!("{}: shutting down workers", self.name);
        self.set_state(ControllerState::ShuttingDown);
        self.queue.queue().shut_down();
        let me = self.clone();
        tokio::spawn(async move {
            for result in join_all(workers).await {
                if let Err(e) = result {
                    error!("{}: worker failed: {}", me.name, e);
                }
            }
            me.set_state(ControllerState::Stopped);
            info!("{}: stopped", me.name);
        });
        Ok(())
    }

    async fn worker(self: Arc<Self>) {
        while let Some(item) = self.queue.queue().get().await {
            let started = Utc::now().timestamp();
            self.in_flight.insert(started);
            // A panicking hook must not take the worker down with the key
            // still marked as being processed.
            if let Err(panic) = AssertUnwindSafe(self.process(&item)).catch_unwind().await {
                error!(
                    "{}: processing '{}' panicked: {}",
                    self.name,
                    item,
                    panic_message(panic.as_ref())
                );
                self.metrics.record_error();
                self.queue.queue().add_rate_limited(item.as_str());
            }
            self.queue.queue().done(&item);
            self.in_flight.remove(started);
        }
    }

    async fn process(&self, item: &str) {
        let queue = self.queue.queue();
        let key = match ReconcileKey::parse(item) {
            Ok(key) => key,
            Err(e) => {
                // Retrying a malformed key cannot succeed.
                queue.forget(item);
                self.metrics.record_error();
                error!("{}: {}", self.name, e);
                return;
            }
        };
        if let Some(hook) = &self.before_reconcile {
            hook(&key);
        }
        let start = Instant::now();
        let result = AssertUnwindSafe(async { (self.reconcile)(key.clone()).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(anyhow::anyhow!(
                    "reconcile panicked: {}",
                    panic_message(panic.as_ref())
                ))
            });
        let duration = start.elapsed();
        if let Some(hook) = &self.after_reconcile {
            hook(&key, result.as_ref().err());
        }
        self.metrics.record(duration, result.is_err());
        match result {
            Ok(()) => {
                queue.forget(item);
                info!("{}: Successfully synced '{}'", self.name, item);
            }
            Err(e) => {
                error!("{}: error syncing '{}': {:#}", self.name, item, e);
                queue.add_rate_limited(item);
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown cause"
    }
}
