//! Skinning and blendshape deformation pass.
//!
//! Mesh-invariant tables are built once per mesh and cached with it. Every
//! frame the instance weights and bone matrices are uploaded inline on the
//! compute queue, followed by one invocation per vertex that writes deformed
//! mesh-space positions into the instance's private vertex buffer. The builder
//! reads that buffer directly, there is no CPU readback.
//!
//! If the deformation pipeline cannot be created the engine disables itself
//! and instances fall back to their undeformed geometry.

pub mod kernel;

use std::sync::Arc;

use glam::Mat4;

use hardshadow_core::{MeshDescriptor, MeshInstance, RenderFlags};

use crate::backend::command::{BlendshapeBindings, SkinBindings};
use crate::backend::{Command, CommandList, DeformDispatch, GpuBuffer, GpuPipeline, RtBackend};
use crate::error::{RaytraceError, RaytraceResult};
use crate::scheduler::{FenceValue, QueueScheduler};
use crate::translator::upload_bytes;
use crate::types::{
    BlendshapeFrameInfo, BlendshapeInfo, BoneCount, BoneWeightData, BufferDescriptor, BufferSlice,
    BufferUsage, DeformFlags, DeformMeshInfo,
};

/// Source WGSL of the deformation kernel, compiled by GPU backends.
pub const DEFORM_WGSL: &str = include_str!("deform.wgsl");

/// Entry point of [`DEFORM_WGSL`].
pub const DEFORM_ENTRY_POINT: &str = "deform_main";

/// Invocations per workgroup of the deformation kernel.
pub const DEFORM_WORKGROUP_SIZE: u32 = 64;

/// Authored blendshape weights are percentages.
const WEIGHT_SCALE: f32 = 100.0;

/// Host-side deformation tables of one mesh.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeformTableData {
    pub info: DeformMeshInfo,
    /// Deltas ordered by blendshape, then frame, then vertex.
    pub deltas: Vec<[f32; 4]>,
    pub frames: Vec<BlendshapeFrameInfo>,
    pub shapes: Vec<BlendshapeInfo>,
    /// Highest authored weight of each channel, normalized.
    pub max_weights: Vec<f32>,
    pub bone_counts: Vec<BoneCount>,
    pub bone_weights: Vec<BoneWeightData>,
    pub bind_poses: Vec<Mat4>,
}

impl DeformTableData {
    /// Flattens the skin and blendshape data of a mesh. Returns `None` for
    /// meshes that do not deform.
    pub fn from_mesh(mesh: &MeshDescriptor) -> RaytraceResult<Option<Self>> {
        if !mesh.is_deformable() {
            return Ok(None);
        }
        if mesh.vertex_stride % 4 != 0 || mesh.vertex_offset % 4 != 0 {
            return Err(RaytraceError::InvalidParameter(format!(
                "mesh '{}' vertex layout is not word aligned",
                mesh.name
            )));
        }

        let vertex_count = mesh.vertex_count as usize;
        let mut data = Self::default();
        let mut flags = DeformFlags::empty();

        if !mesh.blendshapes.is_empty() {
            flags |= DeformFlags::BLENDSHAPE;
            for shape in &mesh.blendshapes {
                data.shapes.push(BlendshapeInfo {
                    frame_count: shape.frames.len() as u32,
                    frame_offset: data.frames.len() as u32,
                });
                data.max_weights.push(shape.max_weight() / WEIGHT_SCALE);
                for frame in &shape.frames {
                    data.frames.push(BlendshapeFrameInfo {
                        delta_offset: data.deltas.len() as u32,
                        weight: frame.weight / WEIGHT_SCALE,
                    });
                    data.deltas.extend((0..vertex_count).map(|v| {
                        frame
                            .deltas
                            .get(v)
                            .map_or([0.0; 4], |d| d.extend(0.0).to_array())
                    }));
                }
            }
        }

        if let Some(skin) = &mesh.skin {
            flags |= DeformFlags::SKINNING;
            let mut offset = 0u32;
            for v in 0..vertex_count {
                let count = skin.bone_counts.get(v).copied().unwrap_or(0) as u32;
                data.bone_counts.push(BoneCount {
                    weight_count: count,
                    weight_offset: offset,
                });
                offset += count;
            }
            data.bone_weights = skin
                .weights
                .iter()
                .map(|w| BoneWeightData {
                    weight: w.weight,
                    index: w.index,
                })
                .collect();
            data.bind_poses = skin.bind_poses.clone();
        }

        data.info = DeformMeshInfo {
            vertex_count: mesh.vertex_count,
            vertex_stride: mesh.vertex_stride / 4,
            vertex_offset: mesh.vertex_offset / 4,
            deform_flags: flags.bits(),
            blendshape_count: data.shapes.len() as u32,
            _pad: [0; 3],
        };
        Ok(Some(data))
    }

    pub fn flags(&self) -> DeformFlags {
        DeformFlags::from_bits_truncate(self.info.deform_flags)
    }

    /// Normalized channel weights of an instance, clamped to the authored
    /// range when `clamp` is set.
    pub fn instance_weights(&self, weights: &[f32], clamp: bool) -> Vec<f32> {
        self.max_weights
            .iter()
            .enumerate()
            .map(|(i, &max)| {
                let w = weights.get(i).copied().unwrap_or(0.0) / WEIGHT_SCALE;
                if clamp { w.clamp(0.0, max) } else { w }
            })
            .collect()
    }

    /// Column-major bone matrices mapping mesh space through the bind pose
    /// and current bone into the instance's local space.
    pub fn bone_matrices(&self, transform: &Mat4, bones: &[Mat4]) -> Vec<[f32; 16]> {
        let world_to_local = transform.inverse();
        self.bind_poses
            .iter()
            .enumerate()
            .map(|(i, bind)| {
                let bone = bones.get(i).copied().unwrap_or(Mat4::IDENTITY);
                (world_to_local * bone * *bind).to_cols_array()
            })
            .collect()
    }
}

/// Device copies of the mesh-invariant tables, cached on the mesh entry.
#[derive(Debug, Clone)]
pub struct MeshDeformTables {
    pub data: Arc<DeformTableData>,
    blendshapes: Option<[Arc<GpuBuffer>; 3]>,
    skin: Option<[Arc<GpuBuffer>; 2]>,
    /// Signaled once every table is uploaded.
    pub ready: FenceValue,
}

impl MeshDeformTables {
    /// Uploads the tables through the copy queue.
    pub fn upload(scheduler: &QueueScheduler, data: DeformTableData) -> RaytraceResult<Self> {
        let mut ready = FenceValue::NONE;
        let mut upload = |label: &str, bytes: &[u8]| -> RaytraceResult<Arc<GpuBuffer>> {
            let (buffer, fence) = upload_bytes(scheduler, label, bytes, BufferUsage::STORAGE)?;
            ready = ready.max(fence);
            Ok(buffer)
        };
        let blendshapes = if data.flags().contains(DeformFlags::BLENDSHAPE) {
            Some([
                upload("blendshape deltas", bytemuck::cast_slice(&data.deltas))?,
                upload("blendshape frames", bytemuck::cast_slice(&data.frames))?,
                upload("blendshape shapes", bytemuck::cast_slice(&data.shapes))?,
            ])
        } else {
            None
        };
        let skin = if data.flags().contains(DeformFlags::SKINNING) {
            Some([
                upload("bone counts", bytemuck::cast_slice(&data.bone_counts))?,
                upload("bone weights", bytemuck::cast_slice(&data.bone_weights))?,
            ])
        } else {
            None
        };
        Ok(Self {
            data: Arc::new(data),
            blendshapes,
            skin,
            ready,
        })
    }
}

/// Per-instance deformation buffers.
#[derive(Debug, Clone)]
pub struct InstanceDeformBuffers {
    /// Deformed positions, one `vec4<f32>` per vertex.
    pub output: Arc<GpuBuffer>,
    weights: Option<Arc<GpuBuffer>>,
    bones: Option<Arc<GpuBuffer>>,
}

impl InstanceDeformBuffers {
    pub fn new(backend: &dyn RtBackend, tables: &MeshDeformTables) -> RaytraceResult<Self> {
        let data = &tables.data;
        let output = backend.create_buffer(
            &BufferDescriptor::new(
                (data.info.vertex_count.max(1) as u64) * 16,
                BufferUsage::STORAGE | BufferUsage::ACCEL_INPUT,
            )
            .with_label("deformed vertices"),
        )?;
        let weights = match tables.blendshapes {
            Some(_) => Some(Arc::new(backend.create_buffer(
                &BufferDescriptor::new(
                    (data.shapes.len().max(1) * 4) as u64,
                    BufferUsage::STORAGE | BufferUsage::COPY_DST,
                )
                .with_label("blendshape weights"),
            )?)),
            None => None,
        };
        let bones = match tables.skin {
            Some(_) => Some(Arc::new(backend.create_buffer(
                &BufferDescriptor::new(
                    (data.bind_poses.len().max(1) * 64) as u64,
                    BufferUsage::STORAGE | BufferUsage::COPY_DST,
                )
                .with_label("bone matrices"),
            )?)),
            None => None,
        };
        Ok(Self {
            output: Arc::new(output),
            weights,
            bones,
        })
    }

    /// Size in bytes of the private buffers.
    pub fn size(&self) -> u64 {
        self.output.size()
            + self.weights.as_ref().map_or(0, |b| b.size())
            + self.bones.as_ref().map_or(0, |b| b.size())
    }
}

/// Records deformation dispatches onto the compute queue.
#[derive(Debug)]
pub struct DeformEngine {
    pipeline: Option<Arc<GpuPipeline>>,
}

impl DeformEngine {
    /// Creates the deformation pipeline. A failure disables the engine for
    /// the lifetime of the context.
    pub fn new(backend: &dyn RtBackend) -> Self {
        match backend.create_deform_pipeline() {
            Ok(pipeline) => Self {
                pipeline: Some(Arc::new(pipeline)),
            },
            Err(e) => {
                log::error!("Deformation disabled, pipeline creation failed: {e}");
                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        Self { pipeline: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Uploads the instance's current pose and records one dispatch.
    /// Returns false when the engine is disabled.
    pub fn record(
        &self,
        list: &mut CommandList,
        tables: &MeshDeformTables,
        source: BufferSlice,
        buffers: &InstanceDeformBuffers,
        instance: &MeshInstance,
        flags: RenderFlags,
    ) -> bool {
        let Some(pipeline) = &self.pipeline else {
            return false;
        };
        let data = &tables.data;

        let blendshapes = match (&tables.blendshapes, &buffers.weights) {
            (Some([deltas, frames, shapes]), Some(weights)) => {
                let values = data.instance_weights(
                    instance.blendshape_weights(),
                    flags.contains(RenderFlags::CLAMP_BLENDSHAPE_WEIGHTS),
                );
                list.upload(weights, 0, bytemuck::cast_slice(&values));
                Some(BlendshapeBindings {
                    deltas: Arc::clone(deltas),
                    frames: Arc::clone(frames),
                    shapes: Arc::clone(shapes),
                    weights: Arc::clone(weights),
                })
            }
            _ => None,
        };
        let skin = match (&tables.skin, &buffers.bones) {
            (Some([bone_counts, bone_weights]), Some(bones)) => {
                let matrices = data.bone_matrices(instance.transform(), instance.bones());
                list.upload(bones, 0, bytemuck::cast_slice(&matrices));
                Some(SkinBindings {
                    bone_counts: Arc::clone(bone_counts),
                    bone_weights: Arc::clone(bone_weights),
                    bone_matrices: Arc::clone(bones),
                })
            }
            _ => None,
        };

        list.push(Command::Deform(DeformDispatch {
            pipeline: Arc::clone(pipeline),
            info: data.info,
            source,
            output: Arc::clone(&buffers.output),
            blendshapes,
            skin,
        }));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use crate::scheduler::QueueKind;
    use glam::Vec3;
    use hardshadow_core::{Blendshape, BlendshapeFrame, BoneWeight, Scene, SkinData};
    use std::time::Duration;

    fn triangle() -> MeshDescriptor {
        MeshDescriptor::from_positions("tri", &[Vec3::ZERO, Vec3::X, Vec3::Y], &[0, 1, 2])
    }

    fn lifted(weight: f32) -> Blendshape {
        Blendshape {
            name: "lift".to_string(),
            frames: vec![BlendshapeFrame {
                weight,
                deltas: vec![Vec3::Z; 3],
            }],
        }
    }

    #[test]
    fn test_static_mesh_has_no_tables() {
        assert!(DeformTableData::from_mesh(&triangle()).unwrap().is_none());
    }

    #[test]
    fn test_blendshape_tables() {
        let mesh = triangle()
            .with_blendshape(lifted(100.0))
            .with_blendshape(Blendshape {
                name: "two".to_string(),
                frames: vec![
                    BlendshapeFrame {
                        weight: 50.0,
                        deltas: vec![Vec3::X; 3],
                    },
                    BlendshapeFrame {
                        weight: 80.0,
                        deltas: vec![Vec3::Y; 3],
                    },
                ],
            });
        let data = DeformTableData::from_mesh(&mesh).unwrap().unwrap();
        assert_eq!(data.deltas.len(), 9);
        assert_eq!(data.frames[2].delta_offset, 6);
        assert_eq!(data.frames[1].weight, 0.5);
        assert_eq!(data.shapes[1].frame_offset, 1);
        assert_eq!(data.max_weights, vec![1.0, 0.8]);
        assert_eq!(data.info.vertex_stride, 3);
        assert_eq!(data.flags(), DeformFlags::BLENDSHAPE);

        assert_eq!(data.instance_weights(&[150.0], false), vec![1.5, 0.0]);
        assert_eq!(data.instance_weights(&[150.0, 90.0], true), vec![1.0, 0.8]);
    }

    #[test]
    fn test_bone_offsets_accumulate() {
        let mesh = triangle().with_skin(SkinData {
            bind_poses: vec![Mat4::IDENTITY; 2],
            bone_counts: vec![1, 2, 1],
            weights: vec![
                BoneWeight { weight: 1.0, index: 0 },
                BoneWeight { weight: 0.5, index: 0 },
                BoneWeight { weight: 0.5, index: 1 },
                BoneWeight { weight: 1.0, index: 1 },
            ],
        });
        let data = DeformTableData::from_mesh(&mesh).unwrap().unwrap();
        let offsets: Vec<u32> = data.bone_counts.iter().map(|c| c.weight_offset).collect();
        assert_eq!(offsets, vec![0, 1, 3]);
    }

    #[test]
    fn test_bone_matrices_remove_instance_transform() {
        let mesh = triangle().with_skin(SkinData {
            bind_poses: vec![Mat4::IDENTITY],
            bone_counts: vec![1; 3],
            weights: vec![BoneWeight { weight: 1.0, index: 0 }; 3],
        });
        let data = DeformTableData::from_mesh(&mesh).unwrap().unwrap();
        let transform = Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0));
        let m = data.bone_matrices(&transform, &[transform]);
        let m = Mat4::from_cols_array(&m[0]);
        assert!(m.abs_diff_eq(Mat4::IDENTITY, 1e-6));
    }

    #[test]
    fn test_dispatch_writes_deformed_positions() {
        let backend = Arc::new(SoftwareBackend::new());
        let scheduler = QueueScheduler::new(backend.clone(), Duration::from_secs(1));
        let scene = Scene::new();
        let mesh = scene.create_mesh(triangle().with_blendshape(lifted(100.0))).unwrap();
        let instance = scene.create_instance(mesh).unwrap();
        scene.set_blendshape_weights(instance, &[50.0]).unwrap();
        let snapshot = scene.snapshot(instance).unwrap();

        let data = DeformTableData::from_mesh(&snapshot.mesh).unwrap().unwrap();
        let tables = MeshDeformTables::upload(&scheduler, data).unwrap();
        let buffers = InstanceDeformBuffers::new(backend.as_ref(), &tables).unwrap();
        let hardshadow_core::VertexSource::Cpu { vertices, .. } = &snapshot.mesh.source else {
            panic!("cpu mesh expected");
        };
        let (source, uploaded) =
            upload_bytes(&scheduler, "vertices", vertices, BufferUsage::STORAGE).unwrap();

        let engine = DeformEngine::new(backend.as_ref());
        let mut list = CommandList::new("deform");
        assert!(engine.record(
            &mut list,
            &tables,
            BufferSlice::whole(source),
            &buffers,
            &snapshot.instance,
            RenderFlags::DEFAULT,
        ));
        let ready = scheduler.join(tables.ready, uploaded).unwrap();
        let done = scheduler.submit(QueueKind::Compute, list, ready).unwrap();
        scheduler.wait(done).unwrap();

        let bytes = backend.read_buffer(&buffers.output, 0, 48).unwrap();
        let positions: &[[f32; 4]] = bytemuck::cast_slice(&bytes);
        assert_eq!(positions[1], [1.0, 0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_disabled_engine_records_nothing() {
        let backend = Arc::new(SoftwareBackend::new());
        let scheduler = QueueScheduler::new(backend.clone(), Duration::from_secs(1));
        let data = DeformTableData::from_mesh(&triangle().with_blendshape(lifted(100.0)))
            .unwrap()
            .unwrap();
        let tables = MeshDeformTables::upload(&scheduler, data).unwrap();
        let buffers = InstanceDeformBuffers::new(backend.as_ref(), &tables).unwrap();
        let scene = Scene::new();
        let mesh = scene.create_mesh(triangle()).unwrap();
        let instance = scene.instance(scene.create_instance(mesh).unwrap()).unwrap();

        let engine = DeformEngine::disabled();
        let mut list = CommandList::new("deform");
        let source = Arc::clone(&buffers.output);
        assert!(!engine.record(
            &mut list,
            &tables,
            BufferSlice::whole(source),
            &buffers,
            &instance,
            RenderFlags::DEFAULT,
        ));
        assert!(list.is_empty());
    }
}
