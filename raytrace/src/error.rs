//! Ray tracing pipeline error types and the context error state.

use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

use hardshadow_core::SceneError;

/// Errors that can occur in the ray tracing pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RaytraceError {
    #[error("initialization failed: {0}")]
    InitializationFailed(String),
    #[error("feature not supported: {0}")]
    FeatureNotSupported(String),
    #[error("shader compilation failed: {0}")]
    ShaderCompilationFailed(String),
    #[error("resource creation failed: {0}")]
    ResourceCreationFailed(String),
    #[error("out of GPU memory")]
    OutOfMemory,
    #[error("GPU device lost")]
    DeviceLost,
    #[error("timed out after {0:?} waiting for fence {1}")]
    Timeout(Duration, u64),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("context is invalid, reinitialization required")]
    ContextInvalid,
    #[error("scene error: {0}")]
    Scene(#[from] SceneError),
}

impl RaytraceError {
    /// Device-class failures tear down the whole context.
    pub fn is_device_fatal(&self) -> bool {
        matches!(self, Self::DeviceLost | Self::Timeout(..))
    }

    /// Allocation-class failures skip the affected geometry for one frame.
    pub fn is_allocation(&self) -> bool {
        matches!(self, Self::OutOfMemory | Self::ResourceCreationFailed(_))
    }
}

pub type RaytraceResult<T> = Result<T, RaytraceError>;

/// Validity flag and last error message of a context.
///
/// Errors are pulled by the host on demand, nothing is pushed.
#[derive(Debug, Default)]
pub struct ErrorState {
    inner: Mutex<ErrorStateInner>,
}

#[derive(Debug, Default)]
struct ErrorStateInner {
    invalid: bool,
    last_error: String,
}

impl ErrorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an error. Device-class and initialization errors invalidate the context.
    pub fn record(&self, error: &RaytraceError) {
        let mut inner = self.inner.lock();
        inner.last_error = error.to_string();
        if error.is_device_fatal()
            || matches!(
                error,
                RaytraceError::InitializationFailed(_)
                    | RaytraceError::FeatureNotSupported(_)
                    | RaytraceError::ShaderCompilationFailed(_)
            )
        {
            inner.invalid = true;
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.inner.lock().invalid
    }

    pub fn invalidate(&self) {
        self.inner.lock().invalid = true;
    }

    /// Last recorded message, empty if none.
    pub fn last_error(&self) -> String {
        self.inner.lock().last_error.clone()
    }

    /// Forgets the last message. Validity is unchanged.
    pub fn clear_message(&self) {
        self.inner.lock().last_error.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RaytraceError::OutOfMemory;
        assert_eq!(err.to_string(), "out of GPU memory");

        let err = RaytraceError::InitializationFailed("no ray tracing device".to_string());
        assert_eq!(
            err.to_string(),
            "initialization failed: no ray tracing device"
        );

        let err = RaytraceError::Timeout(Duration::from_millis(3000), 7);
        assert_eq!(err.to_string(), "timed out after 3s waiting for fence 7");
    }

    #[test]
    fn test_classification() {
        assert!(RaytraceError::DeviceLost.is_device_fatal());
        assert!(RaytraceError::Timeout(Duration::ZERO, 1).is_device_fatal());
        assert!(RaytraceError::OutOfMemory.is_allocation());
        assert!(!RaytraceError::OutOfMemory.is_device_fatal());
    }

    #[test]
    fn test_error_state() {
        let state = ErrorState::new();
        assert!(state.is_valid());

        state.record(&RaytraceError::OutOfMemory);
        assert!(state.is_valid());
        assert_eq!(state.last_error(), "out of GPU memory");
        state.clear_message();
        assert!(state.last_error().is_empty());

        state.record(&RaytraceError::DeviceLost);
        assert!(!state.is_valid());
        assert_eq!(state.last_error(), "GPU device lost");
    }
}
