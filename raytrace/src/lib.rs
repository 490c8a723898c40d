//! # Hardshadow Raytrace
//!
//! Per-frame GPU ray tracing pipeline producing hard shadow masks.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`ShadowContext`] - Explicitly owned device context shared by renderers
//! - [`ShadowRenderer`] - One shadow mask per frame for one camera and light set
//! - [`RtBackend`] - Trait for ray tracing backends: Software and Vulkan
//! - [`QueueScheduler`] - Cross-queue submission ordered by fence values
//! - [`DeviceCache`] - Device state of meshes, instances and host resources
//!
//! Each frame runs translate, deform, bottom-level build, top-level build and
//! ray dispatch, every stage waiting on the fence of the previous one.
//!
//! ## Example
//!
//! ```ignore
//! use hardshadow_raytrace::{ContextConfig, ShadowContext};
//!
//! let context = ShadowContext::new(ContextConfig::default(), scene, translator);
//! let renderer = context.create_renderer();
//!
//! context.frame_begin();
//! renderer.begin_scene();
//! renderer.set_camera(camera);
//! renderer.add_directional_light(direction, LayerMask::ALL)?;
//! renderer.add_instance(instance);
//! renderer.end_scene();
//! renderer.render()?;
//! renderer.finish()?;
//! context.frame_end();
//! ```

pub mod accel;
pub mod backend;
pub mod cache;
pub mod config;
pub mod context;
pub mod deform;
pub mod dispatch;
pub mod error;
pub mod renderer;
pub mod scheduler;
pub mod timestamp;
pub mod translator;
pub mod types;

// Re-export main types for convenience
pub use accel::{Blas, GrowableBuffer, Tlas, TlasInstance};
pub use backend::{
    Command, CommandList, DeviceCapabilities, GpuAccelerationStructure, GpuBuffer, GpuPipeline,
    GpuQuerySet, GpuTexture, RtBackend, SoftwareBackend, create_backend,
};
pub use cache::DeviceCache;
pub use config::{BackendKind, ContextConfig, RayProgramLibrary};
pub use context::{PipelineStats, ShadowContext};
pub use deform::DeformEngine;
pub use dispatch::{RayDispatcher, RenderTargets};
pub use error::{RaytraceError, RaytraceResult};
pub use renderer::ShadowRenderer;
pub use scheduler::{FenceValue, QueueKind, QueueScheduler, StageFences};
pub use timestamp::TimestampLog;
pub use translator::{
    HostResources, ResourceObserver, ResourceOrigin, ResourceTranslator, UploadTranslator,
};
pub use types::RenderTargetFormat;

/// Raytrace library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_software_backend() {
        let backend = SoftwareBackend::new();
        assert_eq!(backend.name(), "software");
    }
}
