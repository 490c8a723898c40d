//! Command execution for the software backend.

use std::sync::Arc;

use bytemuck::Pod;
use glam::{Mat4, Vec3};

use hardshadow_core::IndexFormat;
use hardshadow_core::math::from_rows_3x4;

use super::trace::{self, BottomLevel, DispatchInputs, Hint, TopInstance};
use super::{AccelContent, SoftBuffer, SoftTexture, SoftwareBackend, decode_program_identifier};
use crate::backend::{
    AccelBuild, Command, CommandList, DeformDispatch, GpuAccelerationStructure, GpuBuffer,
    GpuTexture, PipelineKind, RayDispatch, ShaderTableRegion,
};
use crate::deform::kernel::{self, BlendshapeTables, DeformTables, SkinTables};
use crate::dispatch::shader_table::{HitGroup, MissProgram, RayGenProgram};
use crate::error::{RaytraceError, RaytraceResult};
use crate::types::{
    AccelBuildFlags, AccelBuildMode, AccelInputs, BlendshapeFrameInfo, BlendshapeInfo, BoneCount,
    BoneWeightData, BufferSlice, InstanceData, InstanceDesc, SceneConstants,
};

pub(super) fn soft_buffer(buffer: &GpuBuffer) -> RaytraceResult<&SoftBuffer> {
    match buffer {
        GpuBuffer::Software(b) => Ok(b),
        #[allow(unreachable_patterns)]
        _ => Err(RaytraceError::InvalidParameter(
            "buffer belongs to another backend".to_string(),
        )),
    }
}

pub(super) fn soft_texture(texture: &GpuTexture) -> RaytraceResult<&SoftTexture> {
    match texture {
        GpuTexture::Software(t) => Ok(t),
        #[allow(unreachable_patterns)]
        _ => Err(RaytraceError::InvalidParameter(
            "texture belongs to another backend".to_string(),
        )),
    }
}

fn soft_accel(accel: &GpuAccelerationStructure) -> RaytraceResult<&super::SoftAccel> {
    match accel {
        GpuAccelerationStructure::Software(a) => Ok(a),
        #[allow(unreachable_patterns)]
        _ => Err(RaytraceError::InvalidParameter(
            "acceleration structure belongs to another backend".to_string(),
        )),
    }
}

fn out_of_bounds(offset: u64, len: u64, size: u64) -> RaytraceError {
    RaytraceError::InvalidParameter(format!(
        "range {offset}..{} exceeds buffer size {size}",
        offset.saturating_add(len)
    ))
}

pub(super) fn write_bytes(buffer: &SoftBuffer, offset: u64, bytes: &[u8]) -> RaytraceResult<()> {
    let end = offset
        .checked_add(bytes.len() as u64)
        .filter(|end| *end <= buffer.size())
        .ok_or_else(|| out_of_bounds(offset, bytes.len() as u64, buffer.size()))?;
    buffer.data().write()[offset as usize..end as usize].copy_from_slice(bytes);
    Ok(())
}

pub(super) fn read_bytes(buffer: &SoftBuffer, offset: u64, size: u64) -> RaytraceResult<Vec<u8>> {
    let end = offset
        .checked_add(size)
        .filter(|end| *end <= buffer.size())
        .ok_or_else(|| out_of_bounds(offset, size, buffer.size()))?;
    Ok(buffer.data().read()[offset as usize..end as usize].to_vec())
}

/// Reads every whole `T` from `offset` to the end of the buffer.
fn read_all<T: Pod>(buffer: &GpuBuffer, offset: u64) -> RaytraceResult<Vec<T>> {
    let buffer = soft_buffer(buffer)?;
    let stride = std::mem::size_of::<T>() as u64;
    let count = buffer.size().saturating_sub(offset) / stride;
    read_array(buffer, offset, count as usize)
}

fn read_array<T: Pod>(buffer: &SoftBuffer, offset: u64, count: usize) -> RaytraceResult<Vec<T>> {
    let stride = std::mem::size_of::<T>();
    let bytes = read_bytes(buffer, offset, (count * stride) as u64)?;
    Ok(bytes
        .chunks_exact(stride)
        .map(bytemuck::pod_read_unaligned)
        .collect())
}

impl SoftwareBackend {
    /// Runs every command of a list in order.
    ///
    /// Called from [`pump`](SoftwareBackend::pump) with the queue state
    /// locked, so nothing here may touch `self.state`.
    pub(super) fn execute(&self, commands: &CommandList) -> RaytraceResult<()> {
        for command in commands.commands() {
            match command {
                Command::UploadBuffer { dst, offset, data } => {
                    write_bytes(soft_buffer(dst)?, *offset, data)?;
                }
                Command::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    let bytes = read_bytes(soft_buffer(src)?, *src_offset, *size)?;
                    write_bytes(soft_buffer(dst)?, *dst_offset, &bytes)?;
                }
                Command::Deform(dispatch) => self.execute_deform(dispatch)?,
                Command::BuildAccelerationStructure(build) => self.execute_build(build)?,
                Command::Barrier(_) => {}
                Command::TransitionTexture { texture, from, to } => {
                    let texture = soft_texture(texture)?;
                    let mut state = texture.state.lock();
                    if *state != *from {
                        return Err(RaytraceError::InvalidParameter(format!(
                            "texture {:?} is {:?}, transition expects {:?}",
                            texture.descriptor.label, *state, from
                        )));
                    }
                    *state = *to;
                }
                Command::DispatchRays(dispatch) => self.execute_rays(dispatch)?,
                Command::CopyTexture { src, dst } => {
                    let (src, dst) = (soft_texture(src)?, soft_texture(dst)?);
                    if std::ptr::eq(src, dst) {
                        continue;
                    }
                    if (src.descriptor.width, src.descriptor.height)
                        != (dst.descriptor.width, dst.descriptor.height)
                    {
                        return Err(RaytraceError::InvalidParameter(
                            "texture copy between different sizes".to_string(),
                        ));
                    }
                    let texels = src.texels.read().clone();
                    *dst.texels.write() = texels;
                }
                Command::WriteTimestamp { set, index } => {
                    let crate::backend::GpuQuerySet::Software(set) = &**set else {
                        return Err(RaytraceError::InvalidParameter(
                            "query set belongs to another backend".to_string(),
                        ));
                    };
                    let mut values = set.values.lock();
                    let slot = values.get_mut(*index as usize).ok_or_else(|| {
                        RaytraceError::InvalidParameter(format!("timestamp index {index}"))
                    })?;
                    *slot = Some(self.timestamp_now());
                }
            }
        }
        Ok(())
    }

    fn execute_deform(&self, dispatch: &DeformDispatch) -> RaytraceResult<()> {
        if dispatch.pipeline.kind() != PipelineKind::Deform {
            return Err(RaytraceError::InvalidParameter(
                "deformation dispatch needs a deform pipeline".to_string(),
            ));
        }
        let source: Vec<f32> = read_all(&dispatch.source.buffer, dispatch.source.offset)?;

        let blendshapes = match &dispatch.blendshapes {
            Some(b) => Some((
                read_all::<[f32; 4]>(&b.deltas, 0)?,
                read_all::<BlendshapeFrameInfo>(&b.frames, 0)?,
                read_all::<BlendshapeInfo>(&b.shapes, 0)?,
                read_all::<f32>(&b.weights, 0)?,
            )),
            None => None,
        };
        let skin = match &dispatch.skin {
            Some(s) => Some((
                read_all::<BoneCount>(&s.bone_counts, 0)?,
                read_all::<BoneWeightData>(&s.bone_weights, 0)?,
                read_all::<[f32; 16]>(&s.bone_matrices, 0)?
                    .iter()
                    .map(Mat4::from_cols_array)
                    .collect::<Vec<_>>(),
            )),
            None => None,
        };

        let tables = DeformTables {
            info: dispatch.info,
            blendshapes: blendshapes
                .as_ref()
                .map(|(deltas, frames, shapes, weights)| BlendshapeTables {
                    deltas,
                    frames,
                    shapes,
                    weights,
                }),
            skin: skin
                .as_ref()
                .map(|(bone_counts, bone_weights, bone_matrices)| SkinTables {
                    bone_counts,
                    bone_weights,
                    bone_matrices,
                }),
        };
        let positions = kernel::deform_all(&tables, &source);
        write_bytes(
            soft_buffer(&dispatch.output)?,
            0,
            bytemuck::cast_slice(&positions),
        )
    }

    fn execute_build(&self, build: &AccelBuild) -> RaytraceResult<()> {
        let dst = soft_accel(&build.dst)?;
        let level = build.inputs.level();
        if dst.level() != level {
            return Err(RaytraceError::InvalidParameter(format!(
                "{level:?} inputs built into a {:?} structure",
                dst.level()
            )));
        }
        let sizes = crate::backend::RtBackend::acceleration_structure_sizes(
            self,
            &build.inputs.shape(),
            build.flags,
        )?;
        let update = build.mode == AccelBuildMode::Update;
        let scratch = if update {
            sizes.update_scratch
        } else {
            sizes.build_scratch
        };
        if dst.size() < sizes.storage {
            return Err(RaytraceError::InvalidParameter(format!(
                "structure storage {} below required {}",
                dst.size(),
                sizes.storage
            )));
        }
        let scratch_size = soft_buffer(&build.scratch)?.size();
        if scratch_size < scratch {
            return Err(RaytraceError::InvalidParameter(format!(
                "scratch buffer {scratch_size} below required {scratch}"
            )));
        }

        let content = match &build.inputs {
            AccelInputs::Triangles(geometry) => {
                let triangles = read_triangles(
                    &geometry.vertices,
                    geometry.vertex_stride,
                    geometry.vertex_count,
                    &geometry.indices,
                    geometry.index_format,
                    geometry.index_count,
                )?;
                if update {
                    match &*dst.inner().content.read() {
                        AccelContent::Bottom(previous)
                            if previous.allow_update
                                && previous.triangles.len() == triangles.len() => {}
                        _ => {
                            return Err(RaytraceError::InvalidParameter(
                                "refit needs an updatable structure with the same topology"
                                    .to_string(),
                            ));
                        }
                    }
                }
                AccelContent::Bottom(Arc::new(BottomLevel::new(
                    triangles,
                    build.flags.contains(AccelBuildFlags::ALLOW_UPDATE),
                )))
            }
            AccelInputs::Instances(geometry) => {
                let rows: Vec<InstanceDesc> = read_array(
                    soft_buffer(&geometry.instances.buffer)?,
                    geometry.instances.offset,
                    geometry.count as usize,
                )?;
                let mut instances = Vec::with_capacity(rows.len());
                for row in &rows {
                    let blas = self.resolve_address(row.blas_address).ok_or_else(|| {
                        RaytraceError::InvalidParameter(format!(
                            "instance {} references unknown address {:#x}",
                            row.custom_index(),
                            row.blas_address
                        ))
                    })?;
                    instances.push(TopInstance {
                        object_to_world: from_rows_3x4(&row.transform),
                        custom_index: row.custom_index(),
                        mask: row.mask(),
                        flags: row.flags(),
                        blas,
                    });
                }
                AccelContent::Top(Arc::new(instances))
            }
        };
        *dst.inner().content.write() = content;
        self.record_build(level, update);
        Ok(())
    }

    fn execute_rays(&self, dispatch: &RayDispatch) -> RaytraceResult<()> {
        if dispatch.pipeline.kind() != PipelineKind::Ray {
            return Err(RaytraceError::InvalidParameter(
                "ray dispatch needs a ray pipeline".to_string(),
            ));
        }
        let program = self.check_shader_table(dispatch)?;

        let bindings = &dispatch.bindings;
        let rows = match &*soft_accel(&bindings.tlas)?.inner().content.read() {
            AccelContent::Top(rows) => Arc::clone(rows),
            _ => {
                return Err(RaytraceError::InvalidParameter(
                    "ray dispatch needs a built top-level structure".to_string(),
                ));
            }
        };
        let instance_data: Vec<InstanceData> = read_all(&bindings.instance_data, 0)?;
        let constants: SceneConstants = read_array(soft_buffer(&bindings.constants)?, 0, 1)?
            .pop()
            .ok_or_else(|| RaytraceError::InvalidParameter("missing scene constants".into()))?;

        let output = soft_texture(&bindings.output)?;
        if output.state() != crate::types::ResourceState::UnorderedAccess {
            return Err(RaytraceError::InvalidParameter(format!(
                "ray output {:?} is not in the unordered access state",
                output.descriptor.label
            )));
        }
        let hint_texture = match &bindings.hint {
            Some(hint) => {
                let hint = soft_texture(hint)?;
                if std::ptr::eq(hint, output) {
                    return Err(RaytraceError::InvalidParameter(
                        "hint and output are the same texture".to_string(),
                    ));
                }
                Some(hint)
            }
            None => None,
        };
        let hint_texels = hint_texture.map(|t| t.texels.read());

        let inputs = DispatchInputs {
            program,
            rows: &rows,
            instance_data: &instance_data,
            constants: &constants,
            width: dispatch.width.min(output.descriptor.width),
            height: dispatch.height.min(output.descriptor.height),
            hint: match (hint_texture, &hint_texels) {
                (Some(t), Some(texels)) => Some(Hint {
                    texels,
                    width: t.descriptor.width,
                    height: t.descriptor.height,
                }),
                _ => None,
            },
        };
        let mut texels = output.texels.write();
        trace::dispatch_rays(&inputs, &mut texels)
    }

    /// Decodes the program selected by the ray generation record and checks
    /// that the miss and hit regions hold the expected programs.
    fn check_shader_table(&self, dispatch: &RayDispatch) -> RaytraceResult<RayGenProgram> {
        let table = soft_buffer(&dispatch.table.buffer)?;
        let id_size = self.capabilities.program_identifier_size as u64;
        let record = |region: &ShaderTableRegion, index: u64| -> RaytraceResult<Option<u32>> {
            let start = index * region.stride;
            if (index > 0 && region.stride == 0) || start + id_size > region.size {
                return Ok(None);
            }
            let bytes = read_bytes(table, region.offset + start, id_size)?;
            Ok(decode_program_identifier(&bytes))
        };

        let program = record(&dispatch.table.raygen, 0)?
            .and_then(RayGenProgram::from_group)
            .ok_or_else(|| {
                RaytraceError::InvalidParameter(
                    "ray generation record holds no ray generation program".to_string(),
                )
            })?;
        for miss in MissProgram::ALL {
            if record(&dispatch.table.miss, miss as u64)? != Some(miss.group()) {
                return Err(RaytraceError::InvalidParameter(format!(
                    "miss record {} does not hold {miss:?}",
                    miss as u32
                )));
            }
        }
        for hit in HitGroup::ALL {
            if record(&dispatch.table.hit, hit as u64)? != Some(hit.group()) {
                return Err(RaytraceError::InvalidParameter(format!(
                    "hit record {} does not hold {hit:?}",
                    hit as u32
                )));
            }
        }
        Ok(program)
    }
}

/// Reads the triangles of a bottom-level build from vertex and index buffers.
fn read_triangles(
    vertices: &BufferSlice,
    vertex_stride: u32,
    vertex_count: u32,
    indices: &BufferSlice,
    index_format: IndexFormat,
    index_count: u32,
) -> RaytraceResult<Vec<[Vec3; 3]>> {
    let vertex_bytes = read_bytes(
        soft_buffer(&vertices.buffer)?,
        vertices.offset,
        vertex_count as u64 * vertex_stride as u64,
    )?;
    let positions: Vec<Vec3> = vertex_bytes
        .chunks_exact(vertex_stride as usize)
        .map(|v| Vec3::from_array(bytemuck::pod_read_unaligned::<[f32; 3]>(&v[..12])))
        .collect();

    let index_bytes = read_bytes(
        soft_buffer(&indices.buffer)?,
        indices.offset,
        index_count as u64 * index_format.stride() as u64,
    )?;
    let indices: Vec<u32> = match index_format {
        IndexFormat::U16 => index_bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]) as u32)
            .collect(),
        IndexFormat::U32 => index_bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    };

    indices
        .chunks_exact(3)
        .map(|tri| {
            let mut corners = [Vec3::ZERO; 3];
            for (corner, &index) in corners.iter_mut().zip(tri) {
                *corner = *positions.get(index as usize).ok_or_else(|| {
                    RaytraceError::InvalidParameter(format!(
                        "index {index} out of range for {vertex_count} vertices"
                    ))
                })?;
            }
            Ok(corners)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RtBackend;
    use crate::scheduler::QueueKind;
    use crate::types::{BufferDescriptor, BufferUsage, MemoryLocation};

    fn buffer(backend: &SoftwareBackend, size: u64) -> Arc<GpuBuffer> {
        Arc::new(
            backend
                .create_buffer(
                    &BufferDescriptor::new(size, BufferUsage::STORAGE)
                        .with_location(MemoryLocation::CpuToGpu),
                )
                .unwrap(),
        )
    }

    #[test]
    fn test_copy_buffer_within_same_buffer() {
        let backend = SoftwareBackend::new();
        let buf = buffer(&backend, 8);
        backend.write_buffer(&buf, 0, &[1, 2, 3, 4, 0, 0, 0, 0]).unwrap();

        let mut list = CommandList::new("copy");
        list.push(Command::CopyBuffer {
            src: Arc::clone(&buf),
            src_offset: 0,
            dst: Arc::clone(&buf),
            dst_offset: 4,
            size: 4,
        });
        backend.submit(QueueKind::Copy, list, None, 1).unwrap();
        assert_eq!(
            backend.read_buffer(&buf, 0, 8).unwrap(),
            vec![1, 2, 3, 4, 1, 2, 3, 4]
        );
    }

    #[test]
    fn test_out_of_bounds_upload_faults_device() {
        let backend = SoftwareBackend::new();
        let buf = buffer(&backend, 4);
        let mut list = CommandList::new("overflow");
        list.upload(&buf, 2, &[0; 4]);
        backend.submit(QueueKind::Copy, list, None, 1).unwrap();
        assert_eq!(backend.device_status(), Err(RaytraceError::DeviceLost));
    }

    #[test]
    fn test_read_triangles_u16() {
        let backend = SoftwareBackend::new();
        let positions: [[f32; 3]; 3] = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let vertices = buffer(&backend, 36);
        backend
            .write_buffer(&vertices, 0, bytemuck::cast_slice(&positions))
            .unwrap();
        let indices = buffer(&backend, 8);
        backend
            .write_buffer(&indices, 0, bytemuck::cast_slice(&[0u16, 1, 2, 0]))
            .unwrap();

        let tris = read_triangles(
            &BufferSlice::whole(vertices),
            12,
            3,
            &BufferSlice::whole(indices),
            IndexFormat::U16,
            3,
        )
        .unwrap();
        assert_eq!(tris, vec![[Vec3::ZERO, Vec3::X, Vec3::Y]]);
    }
}
