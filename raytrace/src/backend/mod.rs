//! GPU backend abstraction layer.
//!
//! The pipeline records backend-neutral [`CommandList`]s and hands them to an
//! [`RtBackend`] together with the fence values to wait for and to signal.
//!
//! # Available Backends
//!
//! - `software` (always built): deterministic CPU emulation of the ray tracing
//!   capability set, used by tests and headless tools
//! - `vulkan-backend`: native Vulkan backend using ash with the KHR ray tracing
//!   extensions
//!
//! # Resource lifetime
//!
//! Resources are reference counted. A submitted command list holds clones of
//! every resource it touches until the queue signals its fence, so dropping a
//! cache entry never frees memory still in use by the GPU.

pub mod command;
pub mod software;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "vulkan-backend")]
use ash::vk;
#[cfg(feature = "vulkan-backend")]
use gpu_allocator::vulkan::{Allocation, Allocator};
#[cfg(feature = "vulkan-backend")]
use parking_lot::Mutex;

use crate::config::{BackendKind, ContextConfig, RayProgramLibrary};
use crate::error::RaytraceResult;
use crate::scheduler::{FenceWait, QueueKind};
use crate::types::{
    AccelBuildFlags, AccelDescriptor, AccelLevel, AccelShape, AccelSizes, BufferDescriptor,
    TextureDescriptor,
};

pub use command::{
    AccelBuild, BarrierKind, Command, CommandList, DeformDispatch, RayBindings, RayDispatch,
    ShaderTableRegion, ShaderTableRegions,
};
pub use software::SoftwareBackend;

/// Capabilities of the ray tracing device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCapabilities {
    pub device_name: String,
    /// Whether acceleration structures and ray pipelines are supported.
    pub ray_tracing: bool,
    /// Size in bytes of one program identifier.
    pub program_identifier_size: u32,
    /// Required alignment of every shader record.
    pub shader_record_alignment: u32,
    /// Required alignment of the start of each shader table region.
    pub shader_table_alignment: u32,
    /// Nanoseconds per timestamp tick.
    pub timestamp_period: f32,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            device_name: String::new(),
            ray_tracing: true,
            program_identifier_size: 32,
            shader_record_alignment: 32,
            shader_table_alignment: 64,
            timestamp_period: 1.0,
        }
    }
}

/// What a pipeline object runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    /// Compute pipeline of the deformation pass.
    Deform,
    /// Ray tracing pipeline with the shadow programs.
    Ray,
}

/// Handle to a GPU buffer resource.
#[allow(clippy::large_enum_variant)]
pub enum GpuBuffer {
    /// Software backend buffer
    Software(software::SoftBuffer),
    /// Vulkan backend buffer
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        allocator: Arc<Mutex<Allocator>>,
        buffer: vk::Buffer,
        allocation: Mutex<Option<Allocation>>,
        size: u64,
        address: u64,
    },
}

impl GpuBuffer {
    /// Size in bytes.
    pub fn size(&self) -> u64 {
        match self {
            Self::Software(buffer) => buffer.size(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { size, .. } => *size,
        }
    }
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Software(buffer) => f.debug_tuple("GpuBuffer::Software").field(buffer).finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { buffer, size, .. } => f
                .debug_struct("GpuBuffer::Vulkan")
                .field("buffer", buffer)
                .field("size", size)
                .finish_non_exhaustive(),
        }
    }
}

/// Handle to a GPU storage texture.
#[allow(clippy::large_enum_variant)]
pub enum GpuTexture {
    /// Software backend texture
    Software(software::SoftTexture),
    /// Vulkan backend texture
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        allocator: Arc<Mutex<Allocator>>,
        image: vk::Image,
        view: vk::ImageView,
        allocation: Mutex<Option<Allocation>>,
        format: vk::Format,
        descriptor: TextureDescriptor,
    },
}

impl GpuTexture {
    pub fn descriptor(&self) -> &TextureDescriptor {
        match self {
            Self::Software(texture) => texture.descriptor(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { descriptor, .. } => descriptor,
        }
    }
}

impl std::fmt::Debug for GpuTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Software(texture) => f
                .debug_tuple("GpuTexture::Software")
                .field(texture)
                .finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan {
                image,
                view,
                format,
                descriptor,
                ..
            } => f
                .debug_struct("GpuTexture::Vulkan")
                .field("image", image)
                .field("view", view)
                .field("format", format)
                .field("descriptor", descriptor)
                .finish_non_exhaustive(),
        }
    }
}

/// Handle to a bottom- or top-level acceleration structure.
#[allow(clippy::large_enum_variant)]
pub enum GpuAccelerationStructure {
    /// Software backend structure
    Software(software::SoftAccel),
    /// Vulkan backend structure, placed in its own storage buffer
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        loader: ash::khr::acceleration_structure::Device,
        handle: vk::AccelerationStructureKHR,
        storage: GpuBuffer,
        address: u64,
        level: AccelLevel,
    },
}

impl GpuAccelerationStructure {
    pub fn level(&self) -> AccelLevel {
        match self {
            Self::Software(accel) => accel.level(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { level, .. } => *level,
        }
    }

    /// Device address written into top-level instance rows.
    pub fn address(&self) -> u64 {
        match self {
            Self::Software(accel) => accel.address(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { address, .. } => *address,
        }
    }

    /// Storage size in bytes.
    pub fn size(&self) -> u64 {
        match self {
            Self::Software(accel) => accel.size(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { storage, .. } => storage.size(),
        }
    }
}

impl std::fmt::Debug for GpuAccelerationStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Software(accel) => f
                .debug_tuple("GpuAccelerationStructure::Software")
                .field(accel)
                .finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan {
                handle,
                address,
                level,
                ..
            } => f
                .debug_struct("GpuAccelerationStructure::Vulkan")
                .field("handle", handle)
                .field("address", address)
                .field("level", level)
                .finish_non_exhaustive(),
        }
    }
}

/// Handle to a compute or ray tracing pipeline.
pub enum GpuPipeline {
    /// Software backend pipeline
    Software(software::SoftPipeline),
    /// Vulkan backend pipeline
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
        set_layout: vk::DescriptorSetLayout,
        kind: PipelineKind,
    },
}

impl GpuPipeline {
    pub fn kind(&self) -> PipelineKind {
        match self {
            Self::Software(pipeline) => pipeline.kind(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { kind, .. } => *kind,
        }
    }
}

impl std::fmt::Debug for GpuPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Software(pipeline) => f
                .debug_tuple("GpuPipeline::Software")
                .field(pipeline)
                .finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { pipeline, kind, .. } => f
                .debug_struct("GpuPipeline::Vulkan")
                .field("pipeline", pipeline)
                .field("kind", kind)
                .finish_non_exhaustive(),
        }
    }
}

/// Handle to a set of timestamp queries.
pub enum GpuQuerySet {
    /// Software backend queries
    Software(software::SoftQuerySet),
    /// Vulkan backend query pool
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        pool: vk::QueryPool,
        count: u32,
    },
}

impl GpuQuerySet {
    pub fn count(&self) -> u32 {
        match self {
            Self::Software(set) => set.count(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { count, .. } => *count,
        }
    }
}

impl std::fmt::Debug for GpuQuerySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Software(set) => f.debug_tuple("GpuQuerySet::Software").field(set).finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { pool, count, .. } => f
                .debug_struct("GpuQuerySet::Vulkan")
                .field("pool", pool)
                .field("count", count)
                .finish_non_exhaustive(),
        }
    }
}

// ============================================================================
// Vulkan Resource Cleanup (Drop implementations)
// ============================================================================

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if let GpuBuffer::Vulkan {
            device,
            allocator,
            buffer,
            allocation,
            ..
        } = self
        {
            if let Some(allocation) = allocation.lock().take() {
                if let Err(e) = allocator.lock().free(allocation) {
                    log::warn!("Failed to free buffer allocation: {e}");
                }
            }
            unsafe {
                device.destroy_buffer(*buffer, None);
            }
        }
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuTexture {
    fn drop(&mut self) {
        if let GpuTexture::Vulkan {
            device,
            allocator,
            image,
            view,
            allocation,
            ..
        } = self
        {
            if let Some(allocation) = allocation.lock().take() {
                if let Err(e) = allocator.lock().free(allocation) {
                    log::warn!("Failed to free texture allocation: {e}");
                }
            }
            unsafe {
                device.destroy_image_view(*view, None);
                device.destroy_image(*image, None);
            }
        }
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuAccelerationStructure {
    fn drop(&mut self) {
        if let GpuAccelerationStructure::Vulkan { loader, handle, .. } = self {
            // The storage buffer is dropped after the structure that lives in it.
            unsafe {
                loader.destroy_acceleration_structure(*handle, None);
            }
        }
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuPipeline {
    fn drop(&mut self) {
        if let GpuPipeline::Vulkan {
            device,
            pipeline,
            layout,
            set_layout,
            ..
        } = self
        {
            unsafe {
                device.destroy_pipeline(*pipeline, None);
                device.destroy_pipeline_layout(*layout, None);
                device.destroy_descriptor_set_layout(*set_layout, None);
            }
        }
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuQuerySet {
    fn drop(&mut self) {
        if let GpuQuerySet::Vulkan { device, pool, .. } = self {
            unsafe {
                device.destroy_query_pool(*pool, None);
            }
        }
    }
}

/// Ray tracing backend trait.
///
/// All methods take `&self`; backends synchronize internally so one backend
/// can be shared by every renderer of a context.
pub trait RtBackend: Send + Sync + 'static {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> &DeviceCapabilities;

    /// Create a buffer resource.
    fn create_buffer(&self, descriptor: &BufferDescriptor) -> RaytraceResult<GpuBuffer>;

    /// Create a storage texture for ray program output.
    fn create_texture(&self, descriptor: &TextureDescriptor) -> RaytraceResult<GpuTexture>;

    /// Memory requirements of a structure with the given shape.
    fn acceleration_structure_sizes(
        &self,
        shape: &AccelShape,
        flags: AccelBuildFlags,
    ) -> RaytraceResult<AccelSizes>;

    /// Create an empty acceleration structure. Its content is produced by a
    /// [`Command::BuildAccelerationStructure`].
    fn create_acceleration_structure(
        &self,
        descriptor: &AccelDescriptor,
    ) -> RaytraceResult<GpuAccelerationStructure>;

    /// Write data to a host visible buffer.
    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> RaytraceResult<()>;

    /// Read data from a buffer.
    ///
    /// This is a blocking operation. The caller makes sure every submission
    /// writing the buffer has completed.
    fn read_buffer(&self, buffer: &GpuBuffer, offset: u64, size: u64) -> RaytraceResult<Vec<u8>>;

    /// Read a texture as tightly packed texels of its format. Blocking, like
    /// [`read_buffer`](Self::read_buffer).
    fn read_texture(&self, texture: &GpuTexture) -> RaytraceResult<Vec<u8>>;

    /// Create the compute pipeline of the deformation pass.
    fn create_deform_pipeline(&self) -> RaytraceResult<GpuPipeline>;

    /// Create the ray tracing pipeline with its seven program groups.
    fn create_ray_pipeline(&self, programs: &RayProgramLibrary) -> RaytraceResult<GpuPipeline>;

    /// Program identifiers of every group of a ray pipeline, in group order.
    fn program_identifiers(&self, pipeline: &GpuPipeline) -> RaytraceResult<Vec<u8>>;

    /// Create a set of timestamp queries.
    fn create_query_set(&self, count: u32) -> RaytraceResult<GpuQuerySet>;

    /// Read resolved timestamps in nanoseconds. Queries never written this
    /// frame read as `None`.
    fn read_timestamps(&self, set: &GpuQuerySet, count: u32) -> RaytraceResult<Vec<Option<u64>>>;

    /// Submit work to a queue.
    ///
    /// The queue first waits for `wait` (if any), executes `commands` in
    /// order, then advances its timeline to `signal`.
    fn submit(
        &self,
        queue: QueueKind,
        commands: CommandList,
        wait: Option<FenceWait>,
        signal: u64,
    ) -> RaytraceResult<()>;

    /// Highest value the queue's timeline has reached.
    fn completed_value(&self, queue: QueueKind) -> RaytraceResult<u64>;

    /// Block until the queue reaches `value`. Returns `Ok(false)` on timeout.
    fn wait(&self, queue: QueueKind, value: u64, timeout: Duration) -> RaytraceResult<bool>;

    /// Reports a lost device as [`RaytraceError::DeviceLost`](crate::RaytraceError::DeviceLost).
    fn device_status(&self) -> RaytraceResult<()>;
}

/// Selects and creates the backend named by the configuration.
///
/// `Auto` tries Vulkan first when compiled in and compiled ray programs are
/// configured, and falls back to the software backend.
pub fn create_backend(config: &ContextConfig) -> RaytraceResult<Arc<dyn RtBackend>> {
    match config.backend {
        BackendKind::Software => {
            log::info!("Using software backend");
            Ok(Arc::new(SoftwareBackend::new()))
        }
        BackendKind::Vulkan => create_vulkan(config),
        BackendKind::Auto if config.ray_programs.is_builtin() => {
            log::info!("No compiled ray programs, using software backend");
            Ok(Arc::new(SoftwareBackend::new()))
        }
        BackendKind::Auto => match create_vulkan(config) {
            Ok(backend) => Ok(backend),
            Err(e) => {
                log::warn!("Vulkan backend unavailable ({e}), falling back to software");
                log::info!("Using software backend");
                Ok(Arc::new(SoftwareBackend::new()))
            }
        },
    }
}

#[cfg(feature = "vulkan-backend")]
fn create_vulkan(config: &ContextConfig) -> RaytraceResult<Arc<dyn RtBackend>> {
    let backend = vulkan::VulkanBackend::new(config.validation)?;
    log::info!("Using Vulkan backend");
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "vulkan-backend"))]
fn create_vulkan(_config: &ContextConfig) -> RaytraceResult<Arc<dyn RtBackend>> {
    Err(crate::error::RaytraceError::InitializationFailed(
        "Vulkan backend not compiled in".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_software_backend() {
        let config = ContextConfig::default().with_backend(BackendKind::Software);
        let backend = create_backend(&config).unwrap();
        assert_eq!(backend.name(), "software");
        assert!(backend.capabilities().ray_tracing);
    }

    #[test]
    fn test_auto_always_yields_backend() {
        let backend = create_backend(&ContextConfig::default()).unwrap();
        assert!(!backend.name().is_empty());
    }
}
