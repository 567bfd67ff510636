#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    /// An informer provider is already registered for the object type.
    /// Registering a second one would silently shadow the first.
    #[error("informer provider for {0} is already registered")]
    DuplicateEventSource(String),
    /// A controller tried to watch an object type for which no informer
    /// provider is registered. This is a wiring bug, fix it by registering
    /// the provider with the `ControllerManager` before calling `watch*`.
    #[error(
        "no informer provider registered for {0}, register one with ControllerManager::add_informer_provider before watching it"
    )]
    MissingEventSource(String),
    /// The stop signal fired before all informer caches were synced.
    #[error("failed to wait for {0} caches to sync")]
    CacheSyncFailed(String),
    /// `run` was called on a controller which was already started.
    #[error("controller {0} was already started")]
    AlreadyStarted(String),
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
}

impl ControllerError {
    /// Configuration errors are caused by wrong wiring and will not go away
    /// by retrying.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            ControllerError::DuplicateEventSource(_)
                | ControllerError::MissingEventSource(_)
                | ControllerError::AlreadyStarted(_)
        )
    }
}
