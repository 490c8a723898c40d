//! Records backend-neutral commands into Vulkan command buffers.

use ash::vk;

use super::pipeline::{DEFORM_BINDING_COUNT, ray_binding};
use super::resources::{
    accel_geometry, align_up, color_layers, convert_build_flags, convert_level, raw_accel,
    raw_buffer, raw_pipeline, raw_query_pool, raw_texture,
};
use super::VulkanBackend;
use crate::backend::{
    AccelBuild, BarrierKind, Command, DeformDispatch, GpuBuffer, RayDispatch, ShaderTableRegion,
};
use crate::deform::DEFORM_WORKGROUP_SIZE;
use crate::error::{RaytraceError, RaytraceResult};
use crate::types::{
    AccelBuildMode, AccelInputs, BufferDescriptor, BufferUsage, MemoryLocation, ResourceState,
};

/// Objects a submission owns until its fence signals.
#[derive(Default)]
pub struct Retained {
    /// Host visible copies of inline uploads.
    pub staging: Vec<GpuBuffer>,
    pub descriptor_pool: Option<vk::DescriptorPool>,
}

/// Descriptor demand of one command list.
fn descriptor_demand(commands: &[Command]) -> (u32, u32) {
    commands.iter().fold((0, 0), |(deform, rays), command| match command {
        Command::Deform(_) => (deform + 1, rays),
        Command::DispatchRays(_) => (deform, rays + 1),
        _ => (deform, rays),
    })
}

impl VulkanBackend {
    /// Creates a descriptor pool sized for every dispatch in `commands`.
    pub(super) fn descriptor_pool_for(
        &self,
        commands: &[Command],
    ) -> RaytraceResult<Option<vk::DescriptorPool>> {
        let (deform, rays) = descriptor_demand(commands);
        if deform + rays == 0 {
            return Ok(None);
        }
        let mut sizes = vec![vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: deform * DEFORM_BINDING_COUNT + rays,
        }];
        if rays > 0 {
            sizes.extend([
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                    descriptor_count: rays,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: rays,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::STORAGE_IMAGE,
                    descriptor_count: rays * 2,
                },
            ]);
        }
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(deform + rays)
            .pool_sizes(&sizes);
        let pool = unsafe { self.device.create_descriptor_pool(&pool_info, None) }
            .map_err(|e| self.fail("create descriptor pool", e))?;
        Ok(Some(pool))
    }
}

/// Records one command list into a command buffer in the recording state.
pub struct Encoder<'a> {
    backend: &'a VulkanBackend,
    cmd: vk::CommandBuffer,
    retained: &'a mut Retained,
}

impl<'a> Encoder<'a> {
    pub fn new(backend: &'a VulkanBackend, cmd: vk::CommandBuffer, retained: &'a mut Retained) -> Self {
        Self {
            backend,
            cmd,
            retained,
        }
    }

    fn device(&self) -> &ash::Device {
        &self.backend.device
    }

    pub fn record(&mut self, commands: &[Command]) -> RaytraceResult<()> {
        for command in commands {
            log::trace!("encode {}", command.name());
            match command {
                Command::UploadBuffer { dst, offset, data } => {
                    self.upload(dst, *offset, data)?;
                    self.transfer_barrier();
                }
                Command::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    let (src, _) = raw_buffer(src)?;
                    let (dst, _) = raw_buffer(dst)?;
                    let region = vk::BufferCopy {
                        src_offset: *src_offset,
                        dst_offset: *dst_offset,
                        size: *size,
                    };
                    if *size > 0 {
                        unsafe { self.device().cmd_copy_buffer(self.cmd, src, dst, &[region]) };
                    }
                    self.transfer_barrier();
                }
                Command::Deform(dispatch) => self.deform(dispatch)?,
                Command::BuildAccelerationStructure(build) => self.build(build)?,
                Command::Barrier(kind) => self.barrier(*kind),
                Command::TransitionTexture { texture, to, .. } => {
                    let (image, _) = raw_texture(texture)?;
                    self.transition(image, *to);
                }
                Command::DispatchRays(dispatch) => self.trace(dispatch)?,
                Command::CopyTexture { src, dst } => {
                    let descriptor = src.descriptor();
                    let target = dst.descriptor();
                    if (descriptor.width, descriptor.height, descriptor.format)
                        != (target.width, target.height, target.format)
                    {
                        return Err(RaytraceError::InvalidParameter(
                            "texture copy between mismatched textures".to_string(),
                        ));
                    }
                    let (src_image, _) = raw_texture(src)?;
                    let (dst_image, _) = raw_texture(dst)?;
                    let region = vk::ImageCopy {
                        src_subresource: color_layers(),
                        src_offset: vk::Offset3D::default(),
                        dst_subresource: color_layers(),
                        dst_offset: vk::Offset3D::default(),
                        extent: vk::Extent3D {
                            width: descriptor.width,
                            height: descriptor.height,
                            depth: 1,
                        },
                    };
                    unsafe {
                        self.device().cmd_copy_image(
                            self.cmd,
                            src_image,
                            vk::ImageLayout::GENERAL,
                            dst_image,
                            vk::ImageLayout::GENERAL,
                            &[region],
                        )
                    };
                    self.transfer_barrier();
                }
                Command::WriteTimestamp { set, index } => {
                    if *index >= set.count() {
                        return Err(RaytraceError::InvalidParameter(format!(
                            "timestamp {index} out of range"
                        )));
                    }
                    let pool = raw_query_pool(set)?;
                    unsafe {
                        self.device().cmd_reset_query_pool(self.cmd, pool, *index, 1);
                        self.device().cmd_write_timestamp2(
                            self.cmd,
                            vk::PipelineStageFlags2::ALL_COMMANDS,
                            pool,
                            *index,
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn memory_barrier(
        &self,
        src_stage: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) {
        let barriers = [vk::MemoryBarrier2::default()
            .src_stage_mask(src_stage)
            .src_access_mask(src_access)
            .dst_stage_mask(dst_stage)
            .dst_access_mask(dst_access)];
        let dependency = vk::DependencyInfo::default().memory_barriers(&barriers);
        unsafe { self.device().cmd_pipeline_barrier2(self.cmd, &dependency) };
    }

    /// Makes transfer writes visible to every later command.
    fn transfer_barrier(&self) {
        self.memory_barrier(
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
        );
    }

    fn barrier(&self, kind: BarrierKind) {
        match kind {
            BarrierKind::AccelerationStructure => self.memory_barrier(
                vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
                vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR
                    | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
                vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
                    | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
            ),
            BarrierKind::ComputeToBuild => self.memory_barrier(
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_STORAGE_WRITE,
                vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags2::SHADER_READ,
            ),
        }
    }

    /// Storage images stay in the general layout; a state change orders the
    /// accesses on either side of it.
    fn transition(&self, image: vk::Image, to: ResourceState) {
        let (src_stage, src_access, dst_stage, dst_access) = match to {
            ResourceState::UnorderedAccess => (
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
                vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
                vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
            ),
            ResourceState::Common => (
                vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
                vk::AccessFlags2::SHADER_STORAGE_WRITE,
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::MEMORY_READ,
            ),
        };
        let barriers = [vk::ImageMemoryBarrier2::default()
            .src_stage_mask(src_stage)
            .src_access_mask(src_access)
            .dst_stage_mask(dst_stage)
            .dst_access_mask(dst_access)
            .old_layout(vk::ImageLayout::GENERAL)
            .new_layout(vk::ImageLayout::GENERAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(super::resources::color_range())];
        let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
        unsafe { self.device().cmd_pipeline_barrier2(self.cmd, &dependency) };
    }

    fn upload(&mut self, dst: &GpuBuffer, offset: u64, data: &[u8]) -> RaytraceResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        if offset + data.len() as u64 > dst.size() {
            return Err(RaytraceError::InvalidParameter(format!(
                "upload of {} bytes at {offset} exceeds buffer size {}",
                data.len(),
                dst.size()
            )));
        }
        let staging = self.backend.allocate_buffer(
            &BufferDescriptor::new(data.len() as u64, BufferUsage::COPY_SRC)
                .with_label("upload staging")
                .with_location(MemoryLocation::CpuToGpu),
        )?;
        self.backend.write_mapped(&staging, 0, data)?;
        let (src, _) = raw_buffer(&staging)?;
        let (dst, _) = raw_buffer(dst)?;
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: offset,
            size: data.len() as u64,
        };
        unsafe { self.device().cmd_copy_buffer(self.cmd, src, dst, &[region]) };
        self.retained.staging.push(staging);
        Ok(())
    }

    fn allocate_set(&self, layout: vk::DescriptorSetLayout) -> RaytraceResult<vk::DescriptorSet> {
        let pool = self.retained.descriptor_pool.ok_or_else(|| {
            RaytraceError::InvalidParameter("dispatch recorded without descriptors".to_string())
        })?;
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device().allocate_descriptor_sets(&info) }
            .map_err(|e| self.backend.fail("allocate descriptor set", e))?;
        sets.first().copied().ok_or_else(|| {
            RaytraceError::ResourceCreationFailed("empty descriptor set allocation".to_string())
        })
    }

    fn deform(&mut self, dispatch: &DeformDispatch) -> RaytraceResult<()> {
        let (pipeline, layout, set_layout) = raw_pipeline(&dispatch.pipeline)?;
        let set = self.allocate_set(set_layout)?;

        let placeholder = &self.backend.placeholder;
        let source = raw_buffer(&dispatch.source.buffer)?.0;
        let mut buffers = vec![
            (source, dispatch.source.offset),
            (raw_buffer(&dispatch.output)?.0, 0),
        ];
        match &dispatch.blendshapes {
            Some(b) => {
                for buffer in [&b.deltas, &b.frames, &b.shapes, &b.weights] {
                    buffers.push((raw_buffer(buffer)?.0, 0));
                }
            }
            None => buffers.extend([(raw_buffer(placeholder)?.0, 0); 4]),
        }
        match &dispatch.skin {
            Some(s) => {
                for buffer in [&s.bone_counts, &s.bone_weights, &s.bone_matrices] {
                    buffers.push((raw_buffer(buffer)?.0, 0));
                }
            }
            None => buffers.extend([(raw_buffer(placeholder)?.0, 0); 3]),
        }

        let infos: Vec<[vk::DescriptorBufferInfo; 1]> = buffers
            .iter()
            .map(|&(buffer, offset)| {
                [vk::DescriptorBufferInfo {
                    buffer,
                    offset,
                    range: vk::WHOLE_SIZE,
                }]
            })
            .collect();
        let writes: Vec<_> = infos
            .iter()
            .enumerate()
            .map(|(binding, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(binding as u32)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(info)
            })
            .collect();
        unsafe { self.device().update_descriptor_sets(&writes, &[]) };

        let groups = dispatch.info.vertex_count.div_ceil(DEFORM_WORKGROUP_SIZE);
        unsafe {
            let device = self.device();
            device.cmd_bind_pipeline(self.cmd, vk::PipelineBindPoint::COMPUTE, pipeline);
            device.cmd_bind_descriptor_sets(
                self.cmd,
                vk::PipelineBindPoint::COMPUTE,
                layout,
                0,
                &[set],
                &[],
            );
            device.cmd_push_constants(
                self.cmd,
                layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(&dispatch.info),
            );
            if groups > 0 {
                device.cmd_dispatch(self.cmd, groups, 1, 1);
            }
        }
        Ok(())
    }

    fn build(&mut self, build: &AccelBuild) -> RaytraceResult<()> {
        if build.dst.level() != build.inputs.level() {
            return Err(RaytraceError::InvalidParameter(
                "build inputs do not match the structure level".to_string(),
            ));
        }
        let dst = raw_accel(&build.dst)?;
        let (_, scratch_address) = raw_buffer(&build.scratch)?;
        let scratch_address =
            align_up(scratch_address, self.backend.limits.scratch_alignment as u64);

        let shape = build.inputs.shape();
        let (geometry, primitive_count) = match &build.inputs {
            AccelInputs::Triangles(triangles) => {
                let (_, vertices) = raw_buffer(&triangles.vertices.buffer)?;
                let (_, indices) = raw_buffer(&triangles.indices.buffer)?;
                accel_geometry(
                    &shape,
                    vertices + triangles.vertices.offset,
                    indices + triangles.indices.offset,
                    0,
                )
            }
            AccelInputs::Instances(instances) => {
                let (_, rows) = raw_buffer(&instances.instances.buffer)?;
                accel_geometry(&shape, 0, 0, rows + instances.instances.offset)
            }
        };

        let mode = match build.mode {
            AccelBuildMode::Build => vk::BuildAccelerationStructureModeKHR::BUILD,
            AccelBuildMode::Update => vk::BuildAccelerationStructureModeKHR::UPDATE,
        };
        let geometries = [geometry];
        let mut info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(convert_level(shape.level()))
            .flags(convert_build_flags(build.flags))
            .mode(mode)
            .dst_acceleration_structure(dst)
            .geometries(&geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            });
        if build.mode == AccelBuildMode::Update {
            info = info.src_acceleration_structure(dst);
        }
        let ranges = [vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(primitive_count)];

        unsafe {
            self.backend
                .accel_loader
                .cmd_build_acceleration_structures(self.cmd, &[info], &[&ranges[..]])
        };
        Ok(())
    }

    fn trace(&mut self, dispatch: &RayDispatch) -> RaytraceResult<()> {
        let (pipeline, layout, set_layout) = raw_pipeline(&dispatch.pipeline)?;
        let set = self.allocate_set(set_layout)?;
        let bindings = &dispatch.bindings;

        let tlas = [raw_accel(&bindings.tlas)?];
        let mut tlas_write =
            vk::WriteDescriptorSetAccelerationStructureKHR::default().acceleration_structures(&tlas);
        let instance_data = [vk::DescriptorBufferInfo {
            buffer: raw_buffer(&bindings.instance_data)?.0,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];
        let constants = [vk::DescriptorBufferInfo {
            buffer: raw_buffer(&bindings.constants)?.0,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];
        let (_, output_view) = raw_texture(&bindings.output)?;
        let hint_view = match &bindings.hint {
            Some(hint) => raw_texture(hint)?.1,
            None => output_view,
        };
        let output = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: output_view,
            image_layout: vk::ImageLayout::GENERAL,
        }];
        let hint = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: hint_view,
            image_layout: vk::ImageLayout::GENERAL,
        }];

        let mut accel_write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(ray_binding::TLAS)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .push_next(&mut tlas_write);
        accel_write.descriptor_count = 1;
        let writes = [
            accel_write,
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(ray_binding::INSTANCE_DATA)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&instance_data),
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(ray_binding::CONSTANTS)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&constants),
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(ray_binding::OUTPUT)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(&output),
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(ray_binding::HINT)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(&hint),
        ];
        unsafe { self.device().update_descriptor_sets(&writes, &[]) };

        let (_, table_address) = raw_buffer(&dispatch.table.buffer)?;
        let region = |r: ShaderTableRegion| vk::StridedDeviceAddressRegionKHR {
            device_address: table_address + r.offset,
            stride: r.stride,
            size: r.size,
        };
        let raygen = region(dispatch.table.raygen);
        let miss = region(dispatch.table.miss);
        let hit = region(dispatch.table.hit);
        let callable = vk::StridedDeviceAddressRegionKHR::default();

        unsafe {
            let device = self.device();
            device.cmd_bind_pipeline(self.cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, pipeline);
            device.cmd_bind_descriptor_sets(
                self.cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                layout,
                0,
                &[set],
                &[],
            );
            self.backend.rt_loader.cmd_trace_rays(
                self.cmd,
                &raygen,
                &miss,
                &hit,
                &callable,
                dispatch.width,
                dispatch.height,
                1,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CommandList, RtBackend, SoftwareBackend};
    use std::sync::Arc;

    #[test]
    fn test_descriptor_demand_counts_dispatches() {
        let backend = SoftwareBackend::new();
        let buffer = Arc::new(
            backend
                .create_buffer(&BufferDescriptor::new(16, BufferUsage::COPY_DST))
                .unwrap(),
        );
        let mut list = CommandList::new("demand");
        list.upload(&buffer, 0, &[0; 4]);
        list.barrier(BarrierKind::AccelerationStructure);
        assert_eq!(descriptor_demand(list.commands()), (0, 0));
    }
}
