//! Bottom-level acceleration structures.

use std::sync::Arc;

use crate::backend::{AccelBuild, Command, CommandList, GpuAccelerationStructure, GpuBuffer, RtBackend};
use crate::error::{RaytraceError, RaytraceResult};
use crate::types::{
    AccelBuildFlags, AccelBuildMode, AccelDescriptor, AccelInputs, AccelLevel, AccelShape,
    BufferDescriptor, BufferUsage, TriangleGeometry,
};

/// Which geometry a bottom-level structure indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlasKind {
    /// Undeformed mesh geometry, shared by every instance of the mesh.
    Static,
    /// Private deformed vertices of one instance.
    Deformed,
}

impl BlasKind {
    pub fn build_flags(self) -> AccelBuildFlags {
        match self {
            Self::Static => AccelBuildFlags::PREFER_FAST_TRACE,
            Self::Deformed => AccelBuildFlags::ALLOW_UPDATE | AccelBuildFlags::PREFER_FAST_BUILD,
        }
    }
}

/// A bottom-level structure with its own scratch memory.
///
/// Storage and scratch are allocated once for the geometry's shape and reused
/// by every later build or refit.
#[derive(Debug)]
pub struct Blas {
    kind: BlasKind,
    shape: AccelShape,
    accel: Arc<GpuAccelerationStructure>,
    scratch: Arc<GpuBuffer>,
    built: bool,
}

impl Blas {
    pub fn new(
        backend: &dyn RtBackend,
        label: &str,
        kind: BlasKind,
        shape: AccelShape,
    ) -> RaytraceResult<Self> {
        if shape.level() != AccelLevel::Bottom {
            return Err(RaytraceError::InvalidParameter(
                "bottom-level structure needs triangle geometry".to_string(),
            ));
        }
        let sizes = backend.acceleration_structure_sizes(&shape, kind.build_flags())?;
        let accel = backend.create_acceleration_structure(
            &AccelDescriptor::new(AccelLevel::Bottom, sizes.storage).with_label(format!("{label} BLAS")),
        )?;
        let scratch = backend.create_buffer(
            &BufferDescriptor::new(
                sizes.build_scratch.max(sizes.update_scratch).max(4),
                BufferUsage::SCRATCH | BufferUsage::STORAGE,
            )
            .with_label(format!("{label} BLAS scratch")),
        )?;
        log::debug!(
            "Allocated {:?} BLAS '{}' ({} bytes, scratch {})",
            kind,
            label,
            sizes.storage,
            scratch.size()
        );
        Ok(Self {
            kind,
            shape,
            accel: Arc::new(accel),
            scratch: Arc::new(scratch),
            built: false,
        })
    }

    pub fn kind(&self) -> BlasKind {
        self.kind
    }

    pub fn shape(&self) -> AccelShape {
        self.shape
    }

    pub fn accel(&self) -> &Arc<GpuAccelerationStructure> {
        &self.accel
    }

    /// Device address referenced by instance rows.
    pub fn address(&self) -> u64 {
        self.accel.address()
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Records a build of `geometry` into this structure.
    ///
    /// Deformed structures are refit in place once built. Static structures
    /// are always rebuilt from scratch.
    pub fn record(
        &mut self,
        list: &mut CommandList,
        geometry: TriangleGeometry,
    ) -> RaytraceResult<AccelBuildMode> {
        if geometry.shape() != self.shape {
            return Err(RaytraceError::InvalidParameter(format!(
                "geometry {:?} does not match structure shape {:?}",
                geometry.shape(),
                self.shape
            )));
        }
        let mode = match (self.kind, self.built) {
            (BlasKind::Deformed, true) => AccelBuildMode::Update,
            _ => AccelBuildMode::Build,
        };
        list.push(Command::BuildAccelerationStructure(AccelBuild {
            dst: Arc::clone(&self.accel),
            inputs: AccelInputs::Triangles(geometry),
            flags: self.kind.build_flags(),
            mode,
            scratch: Arc::clone(&self.scratch),
        }));
        self.built = true;
        Ok(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use crate::types::BufferSlice;
    use hardshadow_core::IndexFormat;

    fn geometry(backend: &SoftwareBackend, index_count: u32) -> TriangleGeometry {
        let buffer = Arc::new(
            backend
                .create_buffer(&BufferDescriptor::new(64, BufferUsage::ACCEL_INPUT))
                .unwrap(),
        );
        TriangleGeometry {
            vertices: BufferSlice::whole(Arc::clone(&buffer)),
            vertex_stride: 12,
            vertex_count: 3,
            indices: BufferSlice::whole(buffer),
            index_format: IndexFormat::U32,
            index_count,
        }
    }

    fn build_mode(list: &CommandList, index: usize) -> AccelBuildMode {
        match &list.commands()[index] {
            Command::BuildAccelerationStructure(build) => build.mode,
            other => panic!("unexpected command {}", other.name()),
        }
    }

    #[test]
    fn test_deformed_blas_refits_after_first_build() {
        let backend = SoftwareBackend::new();
        let tri = geometry(&backend, 3);
        let mut blas = Blas::new(&backend, "skinned", BlasKind::Deformed, tri.shape()).unwrap();
        let mut list = CommandList::new("blas");
        assert_eq!(blas.record(&mut list, tri.clone()).unwrap(), AccelBuildMode::Build);
        assert_eq!(blas.record(&mut list, tri).unwrap(), AccelBuildMode::Update);
        assert_eq!(build_mode(&list, 1), AccelBuildMode::Update);
    }

    #[test]
    fn test_static_blas_always_rebuilds() {
        let backend = SoftwareBackend::new();
        let tri = geometry(&backend, 3);
        let mut blas = Blas::new(&backend, "static", BlasKind::Static, tri.shape()).unwrap();
        let mut list = CommandList::new("blas");
        blas.record(&mut list, tri.clone()).unwrap();
        assert_eq!(blas.record(&mut list, tri).unwrap(), AccelBuildMode::Build);
        assert!(blas.is_built());
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let backend = SoftwareBackend::new();
        let tri = geometry(&backend, 3);
        let mut blas = Blas::new(&backend, "static", BlasKind::Static, tri.shape()).unwrap();
        let mut list = CommandList::new("blas");
        assert!(blas.record(&mut list, geometry(&backend, 6)).is_err());
        assert!(list.is_empty());
    }
}
