//! Scene layer error types.

use thiserror::Error;

/// Errors raised by the scene registry and descriptor validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SceneError {
    #[error("invalid mesh: {0}")]
    InvalidMesh(String),
    #[error("unknown or released mesh")]
    UnknownMesh,
    #[error("unknown or released instance")]
    UnknownInstance,
    #[error("vertex data replacement requires a CPU mesh of {expected} bytes, got {actual}")]
    VertexDataMismatch { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SceneError::InvalidMesh("vertex count is zero".to_string());
        assert_eq!(err.to_string(), "invalid mesh: vertex count is zero");
        assert_eq!(SceneError::UnknownMesh.to_string(), "unknown or released mesh");
    }
}
