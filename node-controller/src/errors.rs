use std::time::Duration;

/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }
}

/// How the reconcile engine treats an error returned from a sync handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ErrorClass {
    /// Retried with exponential backoff.
    Transient,
    /// The object is gone, nothing left to do.
    NotFound,
    /// The object identity cannot be recovered, never retried.
    Malformed,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    /// The object has no usable identity (missing name, invalid key format).
    #[error("malformed resource key: {0}")]
    MalformedKey(String),
    /// The object does no longer exist.
    #[error("{0} not found")]
    NotFound(String),
    /// A sync handler panicked, the panic was caught at the worker boundary.
    #[error("sync handler panicked: {0}")]
    Panic(String),
    /// The resource cache did not complete its initial listing in time.
    #[error("cache of {controller} controller did not sync within {timeout:?}")]
    CacheSyncTimeout {
        controller: String,
        timeout: Duration,
    },
    /// The stop signal arrived before the controller finished starting up.
    #[error("{0} controller stopped before its cache synced")]
    Stopped(String),
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// The watch of a resource kind failed, the watcher retries on its own.
    #[error("{0}")]
    Watch(#[from] kube_runtime::watcher::Error),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    /// Any other kind of errors
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl ControllerError {
    pub(crate) fn class(&self) -> ErrorClass {
        match self {
            ControllerError::MalformedKey(_) => ErrorClass::Malformed,
            ControllerError::NotFound(_) => ErrorClass::NotFound,
            ControllerError::KubeApi(e) if e.is_not_found() => ErrorClass::NotFound,
            _ => ErrorClass::Transient,
        }
    }
}
