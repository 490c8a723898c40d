//! Acceleration structure builder.
//!
//! Bottom-level structures index the triangles of one mesh, or of one
//! deformed instance whose vertices are private. Top-level structures are
//! owned by one renderer and rebuilt only when one of their bottom-level
//! structures changed or the resident instance list differs from the last
//! build.
//!
//! | Structure | Owner | Hints | Refresh |
//! |-----------|-------|-------|---------|
//! | Static [`Blas`] | Mesh cache entry | Prefer fast trace | Full rebuild on vertex update |
//! | Deformed [`Blas`] | Instance cache entry | Allow update, prefer fast build | Refit when deformed |
//! | [`Tlas`] | Renderer | None | Rebuild when dirty |

mod blas;
mod tlas;

pub use blas::{Blas, BlasKind};
pub use tlas::{Tlas, TlasInstance, TlasLimits, instance_row};

use std::sync::Arc;

use crate::backend::{GpuBuffer, RtBackend};
use crate::error::RaytraceResult;
use crate::types::{BufferDescriptor, BufferUsage};

/// A device buffer that grows by doubling and never shrinks.
#[derive(Debug)]
pub struct GrowableBuffer {
    label: String,
    usage: BufferUsage,
    min_capacity: u64,
    buffer: Option<Arc<GpuBuffer>>,
}

impl GrowableBuffer {
    pub fn new(label: impl Into<String>, usage: BufferUsage, min_capacity: u64) -> Self {
        Self {
            label: label.into(),
            usage,
            min_capacity: min_capacity.max(4),
            buffer: None,
        }
    }

    /// Current capacity in bytes, zero before the first allocation.
    pub fn capacity(&self) -> u64 {
        self.buffer.as_ref().map_or(0, |b| b.size())
    }

    pub fn buffer(&self) -> Option<&Arc<GpuBuffer>> {
        self.buffer.as_ref()
    }

    /// Capacity needed to hold `size` bytes, starting from `current`.
    pub fn grown_capacity(current: u64, min_capacity: u64, size: u64) -> u64 {
        let mut capacity = current.max(min_capacity);
        while capacity < size {
            capacity *= 2;
        }
        capacity
    }

    /// Makes room for `size` bytes. Returns the buffer and whether it was
    /// reallocated; a reallocated buffer starts without contents.
    pub fn reserve(
        &mut self,
        backend: &dyn RtBackend,
        size: u64,
    ) -> RaytraceResult<(Arc<GpuBuffer>, bool)> {
        if let Some(buffer) = &self.buffer {
            if buffer.size() >= size {
                return Ok((Arc::clone(buffer), false));
            }
        }
        let capacity = Self::grown_capacity(self.capacity(), self.min_capacity, size);
        log::debug!(
            "Growing '{}' from {} to {} bytes",
            self.label,
            self.capacity(),
            capacity
        );
        let buffer = Arc::new(backend.create_buffer(
            &BufferDescriptor::new(capacity, self.usage).with_label(self.label.clone()),
        )?);
        self.buffer = Some(Arc::clone(&buffer));
        Ok((buffer, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;

    #[test]
    fn test_grown_capacity_doubles() {
        assert_eq!(GrowableBuffer::grown_capacity(0, 64, 10), 64);
        assert_eq!(GrowableBuffer::grown_capacity(64, 64, 65), 128);
        assert_eq!(GrowableBuffer::grown_capacity(64, 64, 1000), 1024);
    }

    #[test]
    fn test_never_shrinks() {
        let backend = SoftwareBackend::new();
        let mut buffer = GrowableBuffer::new("rows", BufferUsage::STORAGE, 256);

        let (first, grown) = buffer.reserve(&backend, 100).unwrap();
        assert!(grown);
        assert_eq!(first.size(), 256);

        let (_, grown) = buffer.reserve(&backend, 600).unwrap();
        assert!(grown);
        assert_eq!(buffer.capacity(), 1024);

        let (same, grown) = buffer.reserve(&backend, 10).unwrap();
        assert!(!grown);
        assert_eq!(same.size(), 1024);
    }
}
