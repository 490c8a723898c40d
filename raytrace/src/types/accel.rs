//! Acceleration structure types.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use hardshadow_core::IndexFormat;

use super::buffer::BufferSlice;

/// Level of an acceleration structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelLevel {
    /// Indexes the triangles of one mesh.
    Bottom,
    /// Indexes instance placements referencing bottom-level structures.
    Top,
}

bitflags! {
    /// Build hints for acceleration structures.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccelBuildFlags: u32 {
        /// The structure may later be refit in place.
        const ALLOW_UPDATE = 1 << 0;
        /// Spend more build time for faster traversal.
        const PREFER_FAST_TRACE = 1 << 1;
        /// Build quickly at some traversal cost.
        const PREFER_FAST_BUILD = 1 << 2;
    }
}

/// Whether a build starts from scratch or refits the existing structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelBuildMode {
    Build,
    /// Incremental update in place. Requires [`AccelBuildFlags::ALLOW_UPDATE`]
    /// on the original build and an unchanged topology.
    Update,
}

/// Triangle geometry feeding a bottom-level build.
///
/// Positions are three `f32` at the start of each vertex.
#[derive(Debug, Clone)]
pub struct TriangleGeometry {
    pub vertices: BufferSlice,
    pub vertex_stride: u32,
    pub vertex_count: u32,
    pub indices: BufferSlice,
    pub index_format: IndexFormat,
    pub index_count: u32,
}

impl TriangleGeometry {
    pub fn shape(&self) -> AccelShape {
        AccelShape::Triangles {
            vertex_count: self.vertex_count,
            vertex_stride: self.vertex_stride,
            index_format: self.index_format,
            index_count: self.index_count,
        }
    }
}

/// Instance rows feeding a top-level build.
#[derive(Debug, Clone)]
pub struct InstanceGeometry {
    /// Tightly packed [`InstanceDesc`] rows.
    pub instances: BufferSlice,
    pub count: u32,
}

/// Inputs of an acceleration structure build.
#[derive(Debug, Clone)]
pub enum AccelInputs {
    Triangles(TriangleGeometry),
    Instances(InstanceGeometry),
}

impl AccelInputs {
    pub fn level(&self) -> AccelLevel {
        match self {
            Self::Triangles(_) => AccelLevel::Bottom,
            Self::Instances(_) => AccelLevel::Top,
        }
    }

    pub fn shape(&self) -> AccelShape {
        match self {
            Self::Triangles(t) => t.shape(),
            Self::Instances(i) => AccelShape::Instances { count: i.count },
        }
    }
}

/// Counts that determine acceleration structure memory requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelShape {
    Triangles {
        vertex_count: u32,
        vertex_stride: u32,
        index_format: IndexFormat,
        index_count: u32,
    },
    Instances {
        count: u32,
    },
}

impl AccelShape {
    pub fn level(&self) -> AccelLevel {
        match self {
            Self::Triangles { .. } => AccelLevel::Bottom,
            Self::Instances { .. } => AccelLevel::Top,
        }
    }
}

/// Memory requirements reported by the backend before a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AccelSizes {
    pub storage: u64,
    pub build_scratch: u64,
    pub update_scratch: u64,
}

/// Descriptor for creating an acceleration structure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccelDescriptor {
    pub label: Option<String>,
    pub level: AccelLevel,
    /// Storage size in bytes, from [`AccelSizes::storage`].
    pub size: u64,
}

impl AccelDescriptor {
    pub fn new(level: AccelLevel, size: u64) -> Self {
        Self {
            label: None,
            level,
            size,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Ray visibility bits written into each instance row.
pub struct InstanceMask;

impl InstanceMask {
    /// Visible to camera rays.
    pub const RECEIVER: u8 = 0x01;
    /// Visible to shadow rays.
    pub const CASTER: u8 = 0x02;
}

bitflags! {
    /// Per-instance flags of the instance row, identical for all ray tracing APIs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InstanceDescFlags: u8 {
        const TRIANGLE_CULL_DISABLE = 0x1;
        const TRIANGLE_FRONT_COUNTERCLOCKWISE = 0x2;
        const FORCE_OPAQUE = 0x4;
        const FORCE_NON_OPAQUE = 0x8;
    }
}

/// One row of the top-level instance buffer.
///
/// Layout is fixed by the ray tracing APIs: a row-major 3x4 transform, a
/// 24-bit custom index with an 8-bit mask, a 24-bit hit group offset with 8
/// bits of flags, and the device address of the bottom-level structure.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceDesc {
    pub transform: [f32; 12],
    pub custom_index_and_mask: u32,
    pub hit_group_and_flags: u32,
    pub blas_address: u64,
}

const_assert_eq!(std::mem::size_of::<InstanceDesc>(), 64);

impl InstanceDesc {
    pub fn new(
        transform: [f32; 12],
        custom_index: u32,
        mask: u8,
        hit_group: u32,
        flags: InstanceDescFlags,
        blas_address: u64,
    ) -> Self {
        Self {
            transform,
            custom_index_and_mask: (custom_index & 0x00FF_FFFF) | ((mask as u32) << 24),
            hit_group_and_flags: (hit_group & 0x00FF_FFFF) | ((flags.bits() as u32) << 24),
            blas_address,
        }
    }

    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & 0x00FF_FFFF
    }

    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    pub fn hit_group(&self) -> u32 {
        self.hit_group_and_flags & 0x00FF_FFFF
    }

    pub fn flags(&self) -> InstanceDescFlags {
        InstanceDescFlags::from_bits_truncate((self.hit_group_and_flags >> 24) as u8)
    }
}
