//! Identities of resources owned by the host graphics device.
//!
//! The pipeline never dereferences these; they are keys handed to a resource
//! translator which knows how to reach the underlying memory.

/// A buffer owned by the host graphics device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostBuffer(pub u64);

/// A texture owned by the host graphics device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostTexture(pub u64);

/// Element type of an index buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IndexFormat {
    U16,
    #[default]
    U32,
}

impl IndexFormat {
    /// Size of one index in bytes.
    pub fn stride(self) -> u32 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }

    /// Picks the format from an index stride in bytes. A stride of 2 means
    /// 16-bit indices, anything else 32-bit.
    pub fn from_stride(stride: u32) -> Self {
        if stride == 2 { Self::U16 } else { Self::U32 }
    }
}
