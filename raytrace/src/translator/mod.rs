//! Host resource translation.
//!
//! A [`ResourceTranslator`] turns host buffer and texture identities into
//! resources of the ray tracing device, either by importing a shared handle
//! or by uploading a CPU copy. Observers registered at translation time are
//! told when the host mutates or releases the resource, so device caches
//! never have to watch host objects they do not own.

mod upload;

pub use upload::{HostResources, UploadTranslator, upload_bytes};

use std::sync::Arc;

use hardshadow_core::{HostBuffer, HostTexture};

use crate::backend::{GpuBuffer, GpuTexture};
use crate::error::RaytraceResult;
use crate::scheduler::{FenceValue, QueueScheduler};

/// How a translated resource reached the ray tracing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceOrigin {
    /// Shared with the host device through an imported handle.
    Imported,
    /// A device-local copy of host memory.
    Uploaded,
}

/// A host buffer as seen by the ray tracing device.
#[derive(Debug, Clone)]
pub struct TranslatedBuffer {
    pub host: HostBuffer,
    pub buffer: Arc<GpuBuffer>,
    pub size: u64,
    pub origin: ResourceOrigin,
    /// Signaled once the contents are valid on the device.
    pub ready: FenceValue,
}

/// A host texture as seen by the ray tracing device.
#[derive(Debug, Clone)]
pub struct TranslatedTexture {
    pub host: HostTexture,
    pub texture: Arc<GpuTexture>,
    pub origin: ResourceOrigin,
    pub ready: FenceValue,
}

/// Notifications about host resources a device cache depends on.
pub trait ResourceObserver: Send + Sync {
    /// The host wrote new contents into the buffer.
    fn buffer_updated(&self, buffer: HostBuffer);

    /// The host destroyed the buffer.
    fn buffer_released(&self, buffer: HostBuffer);

    /// The host destroyed the texture.
    fn texture_released(&self, texture: HostTexture);
}

/// Makes host resources usable by the ray tracing device.
pub trait ResourceTranslator: Send + Sync {
    /// Translates a host buffer and registers `observer` for its changes.
    fn translate_buffer(
        &self,
        scheduler: &QueueScheduler,
        buffer: HostBuffer,
        observer: Arc<dyn ResourceObserver>,
    ) -> RaytraceResult<TranslatedBuffer>;

    /// Brings a translated buffer up to date after the host updated it.
    /// Returns the fence after which the new contents are valid.
    fn refresh_buffer(
        &self,
        scheduler: &QueueScheduler,
        translated: &TranslatedBuffer,
    ) -> RaytraceResult<FenceValue>;

    /// Translates a host texture and registers `observer` for its release.
    fn translate_texture(
        &self,
        scheduler: &QueueScheduler,
        texture: HostTexture,
        observer: Arc<dyn ResourceObserver>,
    ) -> RaytraceResult<TranslatedTexture>;

    /// Hands `source` back to the host texture once `after` has signaled.
    /// Returns the fence the host must wait on before reading.
    fn publish_texture(
        &self,
        scheduler: &QueueScheduler,
        source: &Arc<GpuTexture>,
        target: HostTexture,
        after: FenceValue,
    ) -> RaytraceResult<FenceValue>;
}
