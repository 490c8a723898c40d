//! Per-renderer top-level acceleration structure.

use std::sync::Arc;

use glam::Mat4;

use hardshadow_core::math::to_rows_3x4;
use hardshadow_core::{InstanceFlags, InstanceId, LayerMask};

use super::GrowableBuffer;
use crate::backend::{
    AccelBuild, BarrierKind, Command, CommandList, GpuAccelerationStructure, GpuBuffer, RtBackend,
};
use crate::config::ContextConfig;
use crate::error::RaytraceResult;
use crate::types::{
    AccelBuildFlags, AccelBuildMode, AccelDescriptor, AccelInputs, AccelLevel, AccelShape,
    BufferSlice, BufferUsage, InstanceData, InstanceDesc, InstanceDescFlags, InstanceGeometry,
    InstanceMask,
};

const ROW_SIZE: u64 = std::mem::size_of::<InstanceDesc>() as u64;
const DATA_SIZE: u64 = std::mem::size_of::<InstanceData>() as u64;

/// Minimum capacities of the top-level buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlasLimits {
    pub min_instances: u32,
    pub min_scratch_size: u64,
    pub min_size: u64,
}

impl From<&ContextConfig> for TlasLimits {
    fn from(config: &ContextConfig) -> Self {
        Self {
            min_instances: config.min_tlas_instances,
            min_scratch_size: config.min_scratch_size,
            min_size: config.min_tlas_size,
        }
    }
}

/// One resident instance as the top-level build sees it.
#[derive(Debug, Clone)]
pub struct TlasInstance {
    pub id: InstanceId,
    pub transform: Mat4,
    pub flags: InstanceFlags,
    /// Compacted GPU layer bits of the instance.
    pub layer_mask: LayerMask,
    pub blas: Arc<GpuAccelerationStructure>,
    /// Stamp of the last change to the instance's geometry, transform or flags.
    pub stamp: u64,
}

/// Packs the instance row for the instance at `index`.
///
/// Camera rays see every instance except shadow-only ones, shadow rays see
/// casters. Shadow-only instances are never culled.
pub fn instance_row(index: u32, instance: &TlasInstance) -> InstanceDesc {
    let mut mask = 0u8;
    if !instance.flags.contains(InstanceFlags::SHADOWS_ONLY) {
        mask |= InstanceMask::RECEIVER;
    }
    if instance.flags.contains(InstanceFlags::CAST_SHADOWS) {
        mask |= InstanceMask::CASTER;
    }
    let mut flags = InstanceDescFlags::empty();
    if instance.flags.contains(InstanceFlags::SHADOWS_ONLY) {
        flags |= InstanceDescFlags::TRIANGLE_CULL_DISABLE;
    }
    InstanceDesc::new(
        to_rows_3x4(&instance.transform),
        index,
        mask,
        0,
        flags,
        instance.blas.address(),
    )
}

/// Top-level structure, instance rows and auxiliary instance data of one
/// renderer. Never shared across renderers.
#[derive(Debug)]
pub struct Tlas {
    limits: TlasLimits,
    rows: GrowableBuffer,
    data: GrowableBuffer,
    scratch: GrowableBuffer,
    accel: Option<Arc<GpuAccelerationStructure>>,
    resident: Vec<(InstanceId, u64)>,
    built_stamp: u64,
    builds: u64,
}

impl Tlas {
    pub fn new(limits: TlasLimits) -> Self {
        Self {
            limits,
            rows: GrowableBuffer::new(
                "TLAS instance rows",
                BufferUsage::ACCEL_INPUT | BufferUsage::COPY_DST,
                limits.min_instances as u64 * ROW_SIZE,
            ),
            data: GrowableBuffer::new(
                "TLAS instance data",
                BufferUsage::STORAGE | BufferUsage::COPY_DST,
                limits.min_instances as u64 * DATA_SIZE,
            ),
            scratch: GrowableBuffer::new(
                "TLAS scratch",
                BufferUsage::SCRATCH | BufferUsage::STORAGE,
                limits.min_scratch_size,
            ),
            accel: None,
            resident: Vec::new(),
            built_stamp: 0,
            builds: 0,
        }
    }

    pub fn accel(&self) -> Option<&Arc<GpuAccelerationStructure>> {
        self.accel.as_ref()
    }

    /// [`InstanceData`] records indexed by custom instance index.
    pub fn instance_data(&self) -> Option<&Arc<GpuBuffer>> {
        self.data.buffer()
    }

    /// Instances of the last build, in row order.
    pub fn resident(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.resident.iter().map(|(id, _)| *id)
    }

    /// Cache stamp the last build observed.
    pub fn built_stamp(&self) -> u64 {
        self.built_stamp
    }

    pub fn builds(&self) -> u64 {
        self.builds
    }

    /// Returns true if `instances` differ from the last build by identity,
    /// order or referenced structure, or any of them changed since.
    pub fn is_dirty(&self, instances: &[TlasInstance]) -> bool {
        if self.accel.is_none() || self.resident.len() != instances.len() {
            return true;
        }
        instances
            .iter()
            .zip(&self.resident)
            .any(|(inst, &(id, address))| {
                inst.id != id || inst.blas.address() != address || inst.stamp > self.built_stamp
            })
    }

    /// Records a rebuild when the structure is dirty or `force` is set.
    /// `stamp` is the current cache stamp. Returns true if a build was recorded.
    pub fn record(
        &mut self,
        backend: &dyn RtBackend,
        list: &mut CommandList,
        instances: &[TlasInstance],
        stamp: u64,
        force: bool,
    ) -> RaytraceResult<bool> {
        if !force && !self.is_dirty(instances) {
            return Ok(false);
        }

        let rows: Vec<InstanceDesc> = instances
            .iter()
            .enumerate()
            .map(|(i, inst)| instance_row(i as u32, inst))
            .collect();
        let data: Vec<InstanceData> = instances
            .iter()
            .map(|inst| InstanceData {
                instance_flags: inst.flags.bits(),
                layer_mask: inst.layer_mask.bits(),
            })
            .collect();

        let count = rows.len() as u32;
        let (row_buffer, _) = self.rows.reserve(backend, count as u64 * ROW_SIZE)?;
        let (data_buffer, _) = self.data.reserve(backend, count as u64 * DATA_SIZE)?;

        let shape = AccelShape::Instances { count };
        let sizes = backend.acceleration_structure_sizes(&shape, AccelBuildFlags::empty())?;
        let (scratch, _) = self.scratch.reserve(backend, sizes.build_scratch)?;
        let accel = match &self.accel {
            Some(accel) if accel.size() >= sizes.storage => Arc::clone(accel),
            current => {
                let current = current.as_ref().map_or(0, |a| a.size());
                let size = GrowableBuffer::grown_capacity(current, self.limits.min_size, sizes.storage);
                log::debug!("Allocating TLAS storage of {size} bytes for {count} instances");
                let accel = Arc::new(backend.create_acceleration_structure(
                    &AccelDescriptor::new(AccelLevel::Top, size).with_label("TLAS"),
                )?);
                self.accel = Some(Arc::clone(&accel));
                accel
            }
        };

        if !rows.is_empty() {
            list.upload(&row_buffer, 0, bytemuck::cast_slice(&rows));
            list.upload(&data_buffer, 0, bytemuck::cast_slice(&data));
        }
        list.push(Command::BuildAccelerationStructure(AccelBuild {
            dst: accel,
            inputs: AccelInputs::Instances(InstanceGeometry {
                instances: BufferSlice::whole(row_buffer),
                count,
            }),
            flags: AccelBuildFlags::empty(),
            mode: AccelBuildMode::Build,
            scratch,
        }));
        list.barrier(BarrierKind::AccelerationStructure);

        self.resident = instances
            .iter()
            .map(|inst| (inst.id, inst.blas.address()))
            .collect();
        self.built_stamp = stamp;
        self.builds += 1;
        log::debug!("Recorded TLAS build over {count} instances (stamp {stamp})");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use crate::types::{AccelDescriptor, AccelLevel};
    use slotmap::SlotMap;

    fn limits() -> TlasLimits {
        TlasLimits {
            min_instances: 4,
            min_scratch_size: 256,
            min_size: 1024,
        }
    }

    fn instances(backend: &SoftwareBackend, count: usize) -> Vec<TlasInstance> {
        let mut ids: SlotMap<InstanceId, ()> = SlotMap::with_key();
        let blas = Arc::new(
            backend
                .create_acceleration_structure(&AccelDescriptor::new(AccelLevel::Bottom, 256))
                .unwrap(),
        );
        (0..count)
            .map(|_| TlasInstance {
                id: ids.insert(()),
                transform: Mat4::IDENTITY,
                flags: InstanceFlags::DEFAULT,
                layer_mask: LayerMask::from_layer(0),
                blas: Arc::clone(&blas),
                stamp: 1,
            })
            .collect()
    }

    #[test]
    fn test_row_mask_from_flags() {
        let backend = SoftwareBackend::new();
        let mut inst = instances(&backend, 1).remove(0);
        let row = instance_row(3, &inst);
        assert_eq!(row.custom_index(), 3);
        assert_eq!(row.mask(), InstanceMask::RECEIVER | InstanceMask::CASTER);
        assert!(row.flags().is_empty());

        inst.flags = InstanceFlags::SHADOWS_ONLY | InstanceFlags::CAST_SHADOWS;
        let row = instance_row(0, &inst);
        assert_eq!(row.mask(), InstanceMask::CASTER);
        assert_eq!(row.flags(), InstanceDescFlags::TRIANGLE_CULL_DISABLE);

        inst.flags = InstanceFlags::RECEIVE_SHADOWS;
        assert_eq!(instance_row(0, &inst).mask(), InstanceMask::RECEIVER);
    }

    #[test]
    fn test_rebuild_only_when_dirty() {
        let backend = SoftwareBackend::new();
        let mut tlas = Tlas::new(limits());
        let mut set = instances(&backend, 2);

        let mut list = CommandList::new("tlas");
        assert!(tlas.record(&backend, &mut list, &set, 1, false).unwrap());
        assert!(!tlas.record(&backend, &mut list, &set, 1, false).unwrap());
        assert!(tlas.record(&backend, &mut list, &set, 1, true).unwrap());

        set.swap(0, 1);
        assert!(tlas.is_dirty(&set));
        assert!(tlas.record(&backend, &mut list, &set, 2, false).unwrap());

        set[1].stamp = 3;
        assert!(tlas.is_dirty(&set));
        assert!(tlas.record(&backend, &mut list, &set, 3, false).unwrap());
        assert!(!tlas.is_dirty(&set));

        set.pop();
        assert!(tlas.is_dirty(&set));
        assert_eq!(tlas.builds(), 4);
    }

    #[test]
    fn test_row_buffer_grows_with_instances() {
        let backend = SoftwareBackend::new();
        let mut tlas = Tlas::new(limits());
        let mut list = CommandList::new("tlas");
        tlas.record(&backend, &mut list, &instances(&backend, 3), 1, false)
            .unwrap();
        assert_eq!(tlas.rows.capacity(), 4 * ROW_SIZE);

        tlas.record(&backend, &mut list, &instances(&backend, 9), 2, false)
            .unwrap();
        assert_eq!(tlas.rows.capacity(), 16 * ROW_SIZE);
        assert_eq!(tlas.instance_data().unwrap().size(), 16 * DATA_SIZE);

        let last = list.commands().last().unwrap();
        assert_eq!(last.name(), "barrier");
    }

    #[test]
    fn test_empty_instance_list_builds() {
        let backend = SoftwareBackend::new();
        let mut tlas = Tlas::new(limits());
        let mut list = CommandList::new("tlas");
        assert!(tlas.record(&backend, &mut list, &[], 1, false).unwrap());
        assert!(tlas.accel().is_some());
        assert_eq!(tlas.resident().count(), 0);
    }
}
