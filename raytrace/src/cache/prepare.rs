//! Per-renderer frame preparation: translation, deformation and BLAS work.

use std::sync::Arc;

use hardshadow_core::{
    InstanceId, InstanceSnapshot, LayerTable, MeshId, RenderFlags, Scene, UpdateFlags, VertexSource,
};

use super::{DeviceCache, InstanceEntry, MeshEntry};
use crate::accel::{Blas, BlasKind, TlasInstance};
use crate::backend::{BarrierKind, CommandList};
use crate::context::PipelineStats;
use crate::deform::{DeformEngine, DeformTableData, InstanceDeformBuffers, MeshDeformTables};
use crate::error::{RaytraceError, RaytraceResult};
use crate::scheduler::{FenceValue, QueueScheduler};
use crate::translator::upload_bytes;
use crate::types::{AccelBuildMode, BufferSlice, BufferUsage, DeformFlags, TriangleGeometry};

/// Stride in bytes of deformed vertices.
const DEFORMED_STRIDE: u32 = 16;

/// Everything a renderer needs from the cache for one frame.
#[derive(Debug)]
pub struct PreparedFrame {
    /// Resident instances in submission order.
    pub instances: Vec<TlasInstance>,
    /// Completes once every input of this frame is on the device.
    pub translate: FenceValue,
    /// Deformation dispatches for the compute queue.
    pub deform: CommandList,
    /// BLAS builds and refits for the direct queue.
    pub blas: CommandList,
    pub stats: PipelineStats,
}

/// Shared inputs of [`DeviceCache::prepare`].
#[derive(Clone, Copy)]
pub struct PrepareInputs<'a> {
    pub scheduler: &'a QueueScheduler,
    pub engine: &'a DeformEngine,
    pub scene: &'a Scene,
    pub layers: &'a LayerTable,
    pub flags: RenderFlags,
}

fn bump(counter: &mut u64) -> u64 {
    *counter += 1;
    *counter
}

fn missing_mesh(id: MeshId) -> RaytraceError {
    RaytraceError::InvalidParameter(format!("mesh {id:?} has no cache entry"))
}

impl DeviceCache {
    /// Snapshots `ids` from the scene and records the deformation and BLAS
    /// work they need this frame.
    ///
    /// Allocation failures and invalid geometry skip the affected instance
    /// for this frame. Consumed update flags are cleared on the scene.
    pub fn prepare(
        &mut self,
        inputs: &PrepareInputs<'_>,
        ids: &[InstanceId],
    ) -> RaytraceResult<PreparedFrame> {
        let mut frame = PreparedFrame {
            instances: Vec::with_capacity(ids.len()),
            translate: FenceValue::NONE,
            deform: CommandList::new("deform"),
            blas: CommandList::new("build BLAS"),
            stats: PipelineStats::default(),
        };

        for &id in ids {
            let Some(snapshot) = inputs.scene.snapshot(id) else {
                log::warn!("Skipping instance {id:?}: not in the scene");
                frame.stats.skipped_instances += 1;
                continue;
            };
            match self.prepare_instance(inputs, id, &snapshot, &mut frame) {
                Ok(instance) => {
                    frame.instances.push(instance);
                    inputs.scene.clear_update_flags(id);
                }
                Err(e) if e.is_allocation() || matches!(e, RaytraceError::InvalidParameter(_)) => {
                    log::warn!(
                        "Skipping instance {id:?} of mesh '{}' this frame: {e}",
                        snapshot.mesh.name
                    );
                    frame.stats.skipped_instances += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if !frame.blas.is_empty() {
            let mut blas = CommandList::new("build BLAS");
            if !frame.deform.is_empty() {
                blas.barrier(BarrierKind::ComputeToBuild);
            }
            blas.append(std::mem::take(&mut frame.blas));
            blas.barrier(BarrierKind::AccelerationStructure);
            frame.blas = blas;
        }
        log::debug!(
            "Frame {}: {} instances, {} deformed, {} BLAS builds, {} refits, {} skipped",
            self.frame,
            frame.instances.len(),
            frame.stats.deform_dispatches,
            frame.stats.blas_builds,
            frame.stats.blas_updates,
            frame.stats.skipped_instances
        );
        Ok(frame)
    }

    fn prepare_instance(
        &mut self,
        inputs: &PrepareInputs<'_>,
        id: InstanceId,
        snapshot: &InstanceSnapshot,
        frame: &mut PreparedFrame,
    ) -> RaytraceResult<TlasInstance> {
        let scheduler = inputs.scheduler;
        let backend = scheduler.backend().as_ref();
        let frame_index = self.frame;
        let force = inputs.flags.contains(RenderFlags::DBG_FORCE_UPDATE_AS);
        let update = snapshot.instance.update_flags();

        self.ensure_mesh(scheduler, snapshot)?;
        let tables = if snapshot.mesh.is_deformable()
            && inputs.flags.contains(RenderFlags::GPU_SKINNING)
            && inputs.engine.is_enabled()
        {
            self.ensure_deform_tables(scheduler, snapshot.mesh_id)?
        } else {
            None
        };

        if !self.instances.contains_key(id) {
            let stamp = bump(&mut self.stamp);
            self.instances.insert(
                id,
                InstanceEntry {
                    deform: None,
                    blas: None,
                    blas_stamp: 0,
                    instance_stamp: stamp,
                    deform_input_stamp: 0,
                    deformed_stamp: 0,
                    deformed_clamp: false,
                    source_stamp: 0,
                    deformed_frame: 0,
                    last_used: frame_index,
                },
            );
        }

        let mesh = self
            .meshes
            .get_mut(snapshot.mesh_id)
            .ok_or_else(|| missing_mesh(snapshot.mesh_id))?;
        let entry = self
            .instances
            .get_mut(id)
            .ok_or_else(|| RaytraceError::InvalidParameter(format!("instance {id:?} has no cache entry")))?;
        mesh.last_used = frame_index;
        entry.last_used = frame_index;

        // Update flags are cleared once any renderer consumed them, whether or
        // not it deforms, so deformation inputs are tracked on the entry.
        let skinned_mesh = snapshot.mesh.skin.is_some();
        if snapshot.mesh.is_deformable()
            && (update.deform_changed() || (skinned_mesh && update.contains(UpdateFlags::TRANSFORM)))
        {
            entry.deform_input_stamp = bump(&mut self.stamp);
        }
        frame.translate = scheduler.join(frame.translate, mesh.ready)?;

        let descriptor = &mesh.descriptor;
        let indices = BufferSlice::new(Arc::clone(&mesh.indices), descriptor.index_offset as u64);

        let (accel, blas_stamp) = match tables {
            Some(tables) => {
                if entry.deform.is_none() {
                    entry.deform = Some(InstanceDeformBuffers::new(backend, &tables)?);
                }
                let Some(buffers) = &entry.deform else {
                    return Err(missing_mesh(snapshot.mesh_id));
                };
                let geometry = TriangleGeometry {
                    vertices: BufferSlice::whole(Arc::clone(&buffers.output)),
                    vertex_stride: DEFORMED_STRIDE,
                    vertex_count: descriptor.vertex_count,
                    indices,
                    index_format: descriptor.index_format,
                    index_count: descriptor.index_count,
                };
                if entry.blas.is_none() {
                    entry.blas = Some(Blas::new(
                        backend,
                        &format!("{} (deformed)", descriptor.name),
                        BlasKind::Deformed,
                        geometry.shape(),
                    )?);
                }
                let Some(blas) = entry.blas.as_mut() else {
                    return Err(missing_mesh(snapshot.mesh_id));
                };

                let clamp = inputs.flags.contains(RenderFlags::CLAMP_BLENDSHAPE_WEIGHTS)
                    && tables.data.flags().contains(DeformFlags::BLENDSHAPE);
                let dirty = !blas.is_built()
                    || entry.deform_input_stamp > entry.deformed_stamp
                    || clamp != entry.deformed_clamp
                    || mesh.vertex_stamp > entry.source_stamp
                    || (force && entry.deformed_frame != frame_index);
                if dirty {
                    inputs.engine.record(
                        &mut frame.deform,
                        &tables,
                        BufferSlice::whole(Arc::clone(&mesh.vertices)),
                        buffers,
                        &snapshot.instance,
                        inputs.flags,
                    );
                    frame.stats.deform_dispatches += 1;
                    match blas.record(&mut frame.blas, geometry)? {
                        AccelBuildMode::Build => frame.stats.blas_builds += 1,
                        AccelBuildMode::Update => frame.stats.blas_updates += 1,
                    }
                    entry.blas_stamp = bump(&mut self.stamp);
                    entry.source_stamp = mesh.vertex_stamp;
                    entry.deformed_stamp = entry.deform_input_stamp;
                    entry.deformed_clamp = clamp;
                    entry.deformed_frame = frame_index;
                    log::trace!("Instance {id:?} deformed, BLAS stamp {}", entry.blas_stamp);
                }
                (Arc::clone(blas.accel()), entry.blas_stamp)
            }
            None => {
                let geometry = TriangleGeometry {
                    vertices: BufferSlice::new(
                        Arc::clone(&mesh.vertices),
                        descriptor.vertex_offset as u64,
                    ),
                    vertex_stride: descriptor.vertex_stride,
                    vertex_count: descriptor.vertex_count,
                    indices,
                    index_format: descriptor.index_format,
                    index_count: descriptor.index_count,
                };
                if mesh.blas.is_none() {
                    mesh.blas = Some(Blas::new(
                        backend,
                        &descriptor.name,
                        BlasKind::Static,
                        geometry.shape(),
                    )?);
                }
                let Some(blas) = mesh.blas.as_mut() else {
                    return Err(missing_mesh(snapshot.mesh_id));
                };
                let rebuild = !blas.is_built()
                    || mesh.vertices_updated
                    || (force && mesh.built_frame != frame_index);
                if rebuild {
                    blas.record(&mut frame.blas, geometry)?;
                    frame.stats.blas_builds += 1;
                    mesh.blas_stamp = bump(&mut self.stamp);
                    mesh.vertices_updated = false;
                    mesh.built_frame = frame_index;
                    log::trace!(
                        "Mesh {:?} BLAS built, stamp {}",
                        snapshot.mesh_id,
                        mesh.blas_stamp
                    );
                }
                (Arc::clone(blas.accel()), mesh.blas_stamp)
            }
        };

        if update.intersects(UpdateFlags::TRANSFORM | UpdateFlags::FLAGS) {
            entry.instance_stamp = bump(&mut self.stamp);
        }

        let instance = &snapshot.instance;
        Ok(TlasInstance {
            id,
            transform: *instance.transform(),
            flags: instance.flags(),
            layer_mask: inputs.layers.instance_mask(instance.layer()),
            blas: accel,
            stamp: blas_stamp.max(entry.instance_stamp),
        })
    }

    /// Creates the mesh entry on first use and re-uploads CPU vertices whose
    /// scene version moved on.
    fn ensure_mesh(
        &mut self,
        scheduler: &QueueScheduler,
        snapshot: &InstanceSnapshot,
    ) -> RaytraceResult<()> {
        let id = snapshot.mesh_id;
        let mesh = &snapshot.mesh;

        if let Some(entry) = self.meshes.get(id) {
            if entry.version == snapshot.mesh_version {
                return Ok(());
            }
            let VertexSource::Cpu { vertices, .. } = &mesh.source else {
                return Ok(());
            };
            let (buffer, ready) = upload_bytes(
                scheduler,
                &format!("{} vertices", mesh.name),
                vertices,
                BufferUsage::STORAGE | BufferUsage::ACCEL_INPUT,
            )?;
            let stamp = bump(&mut self.stamp);
            let Some(entry) = self.meshes.get_mut(id) else {
                return Err(missing_mesh(id));
            };
            entry.ready = scheduler.join(entry.ready, ready)?;
            entry.vertices = buffer;
            entry.descriptor = Arc::clone(mesh);
            entry.version = snapshot.mesh_version;
            entry.vertices_updated = true;
            entry.vertex_stamp = stamp;
            log::debug!("Mesh {id:?} vertices re-uploaded at version {}", entry.version);
            return Ok(());
        }

        let (vertices, indices, ready, host) = match &mesh.source {
            VertexSource::Host { vertices, indices } => {
                let v = self.translate_buffer(scheduler, *vertices)?;
                let i = self.translate_buffer(scheduler, *indices)?;
                if (v.size as usize) < mesh.vertex_bytes() || (i.size as usize) < mesh.index_bytes() {
                    return Err(RaytraceError::InvalidParameter(format!(
                        "host buffers of mesh '{}' are smaller than its layout",
                        mesh.name
                    )));
                }
                let ready = scheduler.join(v.ready, i.ready)?;
                (v.buffer, i.buffer, ready, Some((*vertices, *indices)))
            }
            VertexSource::Cpu { vertices, indices } => {
                let (vb, vr) = upload_bytes(
                    scheduler,
                    &format!("{} vertices", mesh.name),
                    vertices,
                    BufferUsage::STORAGE | BufferUsage::ACCEL_INPUT,
                )?;
                let (ib, ir) = upload_bytes(
                    scheduler,
                    &format!("{} indices", mesh.name),
                    indices,
                    BufferUsage::ACCEL_INPUT,
                )?;
                (vb, ib, scheduler.join(vr, ir)?, None)
            }
        };

        let stamp = bump(&mut self.stamp);
        self.meshes.insert(
            id,
            MeshEntry {
                descriptor: Arc::clone(mesh),
                version: snapshot.mesh_version,
                host,
                vertices,
                indices,
                ready,
                blas: None,
                blas_stamp: 0,
                built_frame: 0,
                vertex_stamp: stamp,
                vertices_updated: false,
                deform: None,
                last_used: self.frame,
            },
        );
        log::debug!("Created cache entry for mesh '{}' ({id:?})", mesh.name);
        Ok(())
    }

    /// Uploads the mesh-invariant deformation tables once per mesh.
    fn ensure_deform_tables(
        &mut self,
        scheduler: &QueueScheduler,
        id: MeshId,
    ) -> RaytraceResult<Option<Arc<MeshDeformTables>>> {
        let entry = self.meshes.get_mut(id).ok_or_else(|| missing_mesh(id))?;
        if let Some(tables) = &entry.deform {
            return Ok(Some(Arc::clone(tables)));
        }
        let Some(data) = DeformTableData::from_mesh(&entry.descriptor)? else {
            return Ok(None);
        };
        let tables = Arc::new(MeshDeformTables::upload(scheduler, data)?);
        entry.ready = scheduler.join(entry.ready, tables.ready)?;
        entry.deform = Some(Arc::clone(&tables));
        log::debug!("Uploaded deformation tables of mesh '{}'", entry.descriptor.name);
        Ok(Some(tables))
    }
}
