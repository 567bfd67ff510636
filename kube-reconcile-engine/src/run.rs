use std::sync::Arc;
use tokio::sync::watch;

/// Fires the [`StopSignal`]s created together with it.
///
/// Dropping the handle fires the signal as well.
pub struct StopHandle {
    sender: watch::Sender<bool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.sender.send_replace(true);
    }
}

/// One-shot broadcast stop signal shared by informers, controllers and
/// workers.
#[derive(Clone)]
pub struct StopSignal {
    receiver: watch::Receiver<bool>,
    /// Keeps the channel open for signals which never fire.
    _never: Option<Arc<watch::Sender<bool>>>,
}

impl StopSignal {
    pub fn new() -> (StopHandle, StopSignal) {
        let (sender, receiver) = watch::channel(false);
        (
            StopHandle { sender },
            StopSignal {
                receiver,
                _never: None,
            },
        )
    }

    /// A signal which never fires.
    pub fn never() -> StopSignal {
        let (sender, receiver) = watch::channel(false);
        StopSignal {
            receiver,
            _never: Some(Arc::new(sender)),
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }

    /// Resolves once the signal fired.
    pub async fn stopped(&self) {
        let mut receiver = self.receiver.clone();
        // An error means the handle was dropped, which counts as stop.
        let _ = receiver.wait_for(|stopped| *stopped).await;
    }
}

/// Options for [`ControllerManager::run_informers_and_controllers`](crate::manager::ControllerManager::run_informers_and_controllers).
#[derive(Clone)]
pub struct RunArguments {
    /// Number of workers per controller, values below 1 are raised to 1.
    pub controller_parallelism: usize,
    /// Defaults to a signal which never fires.
    pub stop: Option<StopSignal>,
}

impl Default for RunArguments {
    fn default() -> Self {
        Self {
            controller_parallelism: 1,
            stop: None,
        }
    }
}

impl RunArguments {
    pub fn new(controller_parallelism: usize, stop: StopSignal) -> Self {
        Self {
            controller_parallelism,
            stop: Some(stop),
        }
    }

    pub(crate) fn normalized(mut self) -> (usize, StopSignal) {
        if self.controller_parallelism < 1 {
            self.controller_parallelism = 1;
        }
        (
            self.controller_parallelism,
            self.stop.unwrap_or_else(StopSignal::never),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn stop_fires_all_clones() {
        let (handle, signal) = StopSignal::new();
        let other = signal.clone();
        assert!(!signal.is_stopped());
        handle.stop();
        assert!(signal.is_stopped());
        timeout(Duration::from_secs(1), other.stopped()).await.unwrap();
    }

    #[tokio::test]
    async fn dropping_the_handle_stops() {
        let (handle, signal) = StopSignal::new();
        drop(handle);
        assert!(signal.is_stopped());
        timeout(Duration::from_secs(1), signal.stopped()).await.unwrap();
    }

    #[tokio::test]
    async fn never_does_not_fire() {
        let signal = StopSignal::never();
        assert!(!signal.is_stopped());
        assert!(timeout(Duration::from_millis(20), signal.stopped()).await.is_err());
    }

    #[test]
    fn parallelism_is_clamped() {
        let (parallelism, stop) = RunArguments {
            controller_parallelism: 0,
            stop: None,
        }
        .normalized();
        assert_eq!(1, parallelism);
        assert!(!stop.is_stopped());
    }
}
