//! Context configuration.

use std::time::Duration;

use crate::error::{RaytraceError, RaytraceResult};

/// Which backend a context runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendKind {
    /// Vulkan when compiled in and a ray tracing device is present, else software.
    #[default]
    Auto,
    /// CPU emulation of the device.
    Software,
    /// Vulkan with the KHR ray tracing extensions.
    Vulkan,
}

/// Compiled ray programs and their entry points.
///
/// GPU backends build the ray pipeline from `spirv`. The software backend
/// runs built-in programs and ignores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RayProgramLibrary {
    pub spirv: Vec<u32>,
    /// Default, adaptive sampling and antialiasing ray generation.
    pub raygen: [String; 3],
    /// Camera and shadow miss.
    pub miss: [String; 2],
    /// Camera and shadow closest hit.
    pub closest_hit: [String; 2],
}

impl Default for RayProgramLibrary {
    fn default() -> Self {
        Self {
            spirv: Vec::new(),
            raygen: [
                "raygen_default".to_string(),
                "raygen_adaptive".to_string(),
                "raygen_antialias".to_string(),
            ],
            miss: ["miss_camera".to_string(), "miss_shadow".to_string()],
            closest_hit: ["hit_camera".to_string(), "hit_shadow".to_string()],
        }
    }
}

impl RayProgramLibrary {
    pub fn from_spirv(spirv: Vec<u32>) -> Self {
        Self {
            spirv,
            ..Self::default()
        }
    }

    pub fn is_builtin(&self) -> bool {
        self.spirv.is_empty()
    }
}

/// Configuration of a [`ShadowContext`](crate::ShadowContext).
#[derive(Debug, Clone, PartialEq)]
pub struct ContextConfig {
    pub backend: BackendKind,
    /// Budget of every blocking CPU wait on a fence.
    pub fence_timeout: Duration,
    /// Enable API validation layers on GPU backends.
    pub validation: bool,
    pub ray_programs: RayProgramLibrary,
    /// Initial row capacity of top-level instance buffers.
    pub min_tlas_instances: u32,
    /// Initial size of top-level build scratch buffers.
    pub min_scratch_size: u64,
    /// Initial size of top-level structure storage.
    pub min_tlas_size: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            fence_timeout: Duration::from_millis(3000),
            validation: false,
            ray_programs: RayProgramLibrary::default(),
            min_tlas_instances: 4096,
            min_scratch_size: 64 * 1024,
            min_tlas_size: 256 * 1024,
        }
    }
}

impl ContextConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.validation = enabled;
        self
    }

    pub fn with_ray_programs(mut self, programs: RayProgramLibrary) -> Self {
        self.ray_programs = programs;
        self
    }

    pub fn with_min_tlas_instances(mut self, rows: u32) -> Self {
        self.min_tlas_instances = rows;
        self
    }

    pub fn with_min_scratch_size(mut self, bytes: u64) -> Self {
        self.min_scratch_size = bytes;
        self
    }

    pub fn with_min_tlas_size(mut self, bytes: u64) -> Self {
        self.min_tlas_size = bytes;
        self
    }

    /// Checks the values before a context is created from them.
    pub fn validate(&self) -> RaytraceResult<()> {
        if self.fence_timeout.is_zero() {
            return Err(RaytraceError::InvalidParameter(
                "fence timeout must be non-zero".to_string(),
            ));
        }
        if self.min_tlas_instances == 0 || self.min_scratch_size == 0 || self.min_tlas_size == 0 {
            return Err(RaytraceError::InvalidParameter(
                "minimum top-level capacities must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ContextConfig::default();
        assert_eq!(config.backend, BackendKind::Auto);
        assert_eq!(config.fence_timeout, Duration::from_secs(3));
        assert_eq!(config.min_tlas_instances, 4096);
        assert_eq!(config.min_scratch_size, 65536);
        assert_eq!(config.min_tlas_size, 262144);
        assert!(config.ray_programs.is_builtin());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = ContextConfig::new().with_fence_timeout(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(RaytraceError::InvalidParameter(_))
        ));
    }
}
