use crate::{
    errors::ControllerError,
    eventhandlers::EventHandlerProvider,
    informers::{Informer, InformerRegistry},
    workqueue::RateLimitingQueue,
};

use kube::api::GroupVersionKind;
use kube_reconcile_engine_apis::gvk_name;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::{runtime::Handle, sync::mpsc::Receiver};

/// Work queue of a controller together with the event sources feeding it.
pub struct ListeningQueue {
    queue: Arc<RateLimitingQueue>,
    informers: InformerRegistry,
    /// Informers which must be synced before workers start.
    sources: Mutex<Vec<Arc<dyn Informer>>>,
    /// Channels handed in without a runtime, drained by `start_channels`.
    pending_channels: Mutex<Vec<Receiver<String>>>,
}

impl ListeningQueue {
    pub fn new(queue: RateLimitingQueue, informers: InformerRegistry) -> Self {
        Self {
            queue: Arc::new(queue),
            informers,
            sources: Default::default(),
            pending_channels: Default::default(),
        }
    }

    pub fn queue(&self) -> &Arc<RateLimitingQueue> {
        &self.queue
    }

    /// Register the handler produced by `provider` with the informer of
    /// `object_type`.
    pub fn add_event_handler(
        &self,
        object_type: &GroupVersionKind,
        provider: &dyn EventHandlerProvider,
    ) -> Result<(), ControllerError> {
        let informer = match self.informers.get_informer(object_type) {
            Some(informer) => informer,
            None => {
                let err = ControllerError::MissingEventSource(gvk_name(object_type));
                error!("{}: {}", self.queue.name(), err);
                return Err(err);
            }
        };
        informer.add_event_handler(provider.get(self.queue.clone()));
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(informer);
        debug!(
            "{} is watching {}",
            self.queue.name(),
            gvk_name(object_type)
        );
        Ok(())
    }

    /// Enqueue every key string received on `rx` until all senders are gone.
    ///
    /// Outside of a runtime the channel is only read once `start_channels`
    /// is called from within one.
    pub fn watch_channel(&self, rx: Receiver<String>) {
        match Handle::try_current() {
            Ok(handle) => self.forward(&handle, rx),
            Err(_) => {
                debug!(
                    "no async runtime to read channel of {}, deferring until start",
                    self.queue.name()
                );
                self.pending_channels
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(rx);
            }
        }
    }

    /// Start forwarding the channels which were watched outside of a runtime.
    pub fn start_channels(&self, handle: &Handle) {
        let pending = std::mem::take(
            &mut *self
                .pending_channels
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for rx in pending {
            self.forward(handle, rx);
        }
    }

    fn forward(&self, handle: &Handle, mut rx: Receiver<String>) {
        let queue = self.queue.clone();
        handle.spawn(async move {
            while let Some(key) = rx.recv().await {
                queue.add_rate_limited(key);
            }
            debug!("channel source of {} closed", queue.name());
        });
    }

    /// Whether all informers bound so far have delivered their initial list.
    pub fn has_synced(&self) -> bool {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .all(|i| i.has_synced())
    }
}
