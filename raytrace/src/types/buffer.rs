//! Buffer types and descriptors.

use std::sync::Arc;

use bitflags::bitflags;

use crate::backend::GpuBuffer;

bitflags! {
    /// Usage flags for buffers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Buffer can be copied from.
        const COPY_SRC = 1 << 0;
        /// Buffer can be copied to.
        const COPY_DST = 1 << 1;
        /// Buffer is bound as a read/write storage buffer.
        const STORAGE = 1 << 2;
        /// Buffer is bound as a uniform buffer.
        const UNIFORM = 1 << 3;
        /// Buffer is read by acceleration structure builds (vertices, indices, instances).
        const ACCEL_INPUT = 1 << 4;
        /// Buffer backs an acceleration structure.
        const ACCEL_STORAGE = 1 << 5;
        /// Buffer is scratch memory for acceleration structure builds.
        const SCRATCH = 1 << 6;
        /// Buffer holds shader table records.
        const SHADER_TABLE = 1 << 7;
    }
}

impl Default for BufferUsage {
    fn default() -> Self {
        Self::empty()
    }
}

/// Where buffer memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryLocation {
    /// Device local, written through copies.
    #[default]
    GpuOnly,
    /// Host visible, written directly by the CPU.
    CpuToGpu,
    /// Host visible, read back by the CPU.
    GpuToCpu,
}

/// Descriptor for creating a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BufferDescriptor {
    /// Debug label for the buffer.
    pub label: Option<String>,
    /// Size in bytes.
    pub size: u64,
    /// Usage flags.
    pub usage: BufferUsage,
    pub location: MemoryLocation,
}

impl BufferDescriptor {
    /// Create a new device local buffer descriptor.
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            label: None,
            size,
            usage,
            location: MemoryLocation::GpuOnly,
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_location(mut self, location: MemoryLocation) -> Self {
        self.location = location;
        self
    }
}

/// A byte range inside a buffer, used as a build or dispatch input.
#[derive(Debug, Clone)]
pub struct BufferSlice {
    pub buffer: Arc<GpuBuffer>,
    pub offset: u64,
}

impl BufferSlice {
    pub fn new(buffer: Arc<GpuBuffer>, offset: u64) -> Self {
        Self { buffer, offset }
    }

    pub fn whole(buffer: Arc<GpuBuffer>) -> Self {
        Self { buffer, offset: 0 }
    }
}
