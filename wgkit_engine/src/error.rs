//! Error types for the engine.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use thiserror::Error;
use wgkit_shared::proto::UapiError;

use crate::transport::TransportError;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Failure classes visible at the C boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No live session for this handle
    #[error("Unknown tunnel handle {0}")]
    UnknownHandle(i32),

    /// Settings text could not be decoded or applied
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Descriptor or proxy could not be attached
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Device could not be brought up
    #[error("Engine failed to start: {0}")]
    EngineStartFailed(String),

    /// Suspend/resume before the health check was started
    #[error("Health check not started for handle {0}")]
    WatchdogNotStarted(i32),

    /// Panic or broken invariant inside the engine
    #[error("Internal engine error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Negative errno value returned across the C boundary.
    pub fn code(&self) -> i32 {
        match self {
            EngineError::UnknownHandle(_) => -libc::EBADF,
            EngineError::ConfigInvalid(_) => -libc::EINVAL,
            EngineError::TransportUnavailable(_) => -libc::ENODEV,
            EngineError::EngineStartFailed(_) => -libc::EIO,
            EngineError::WatchdogNotStarted(_) => -libc::ESRCH,
            EngineError::Internal(_) => -libc::EFAULT,
        }
    }
}

impl From<UapiError> for EngineError {
    fn from(err: UapiError) -> Self {
        EngineError::ConfigInvalid(err.to_string())
    }
}

impl From<TransportError> for EngineError {
    fn from(err: TransportError) -> Self {
        EngineError::TransportUnavailable(err.to_string())
    }
}

/// Render a caught panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Run a device future, turning a panic into [`EngineError::Internal`].
pub(crate) async fn guarded<T>(fut: impl Future<Output = EngineResult<T>>) -> EngineResult<T> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(EngineError::Internal(panic_message(payload))),
    }
}

pub(crate) fn guarded_sync<T>(f: impl FnOnce() -> T) -> EngineResult<T> {
    std::panic::catch_unwind(AssertUnwindSafe(f))
        .map_err(|payload| EngineError::Internal(panic_message(payload)))
}
