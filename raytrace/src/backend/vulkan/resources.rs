//! Buffer, texture, acceleration structure and query pool creation.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme};
use parking_lot::Mutex;

use super::VulkanBackend;
use crate::backend::{GpuAccelerationStructure, GpuBuffer, GpuPipeline, GpuQuerySet, GpuTexture};
use crate::error::{RaytraceError, RaytraceResult};
use crate::types::{
    AccelBuildFlags, AccelDescriptor, AccelLevel, AccelShape, AccelSizes, BufferDescriptor,
    BufferUsage, MemoryLocation, RenderTargetFormat, TextureDescriptor,
};
use hardshadow_core::IndexFormat;

// ============================================================================
// Conversions
// ============================================================================

pub fn convert_buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    // Every buffer can be copied, bound as storage and addressed.
    let mut flags = vk::BufferUsageFlags::TRANSFER_SRC
        | vk::BufferUsageFlags::TRANSFER_DST
        | vk::BufferUsageFlags::STORAGE_BUFFER
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    if usage.contains(BufferUsage::UNIFORM) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::ACCEL_INPUT) {
        flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
    }
    if usage.contains(BufferUsage::ACCEL_STORAGE) {
        flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR;
    }
    if usage.contains(BufferUsage::SHADER_TABLE) {
        flags |= vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR;
    }
    flags
}

pub fn convert_memory_location(location: MemoryLocation) -> gpu_allocator::MemoryLocation {
    match location {
        MemoryLocation::GpuOnly => gpu_allocator::MemoryLocation::GpuOnly,
        MemoryLocation::CpuToGpu => gpu_allocator::MemoryLocation::CpuToGpu,
        MemoryLocation::GpuToCpu => gpu_allocator::MemoryLocation::GpuToCpu,
    }
}

pub fn convert_format(format: RenderTargetFormat) -> vk::Format {
    match format {
        RenderTargetFormat::Ru8 => vk::Format::R8_UNORM,
        RenderTargetFormat::RGu8 => vk::Format::R8G8_UNORM,
        RenderTargetFormat::RGBAu8 => vk::Format::R8G8B8A8_UNORM,
        RenderTargetFormat::Rf16 => vk::Format::R16_SFLOAT,
        RenderTargetFormat::RGf16 => vk::Format::R16G16_SFLOAT,
        RenderTargetFormat::RGBAf16 => vk::Format::R16G16B16A16_SFLOAT,
        RenderTargetFormat::Rf32 => vk::Format::R32_SFLOAT,
        RenderTargetFormat::RGf32 => vk::Format::R32G32_SFLOAT,
        RenderTargetFormat::RGBAf32 => vk::Format::R32G32B32A32_SFLOAT,
    }
}

pub fn convert_index_type(format: IndexFormat) -> vk::IndexType {
    match format {
        IndexFormat::U16 => vk::IndexType::UINT16,
        IndexFormat::U32 => vk::IndexType::UINT32,
    }
}

pub fn convert_build_flags(flags: AccelBuildFlags) -> vk::BuildAccelerationStructureFlagsKHR {
    let mut out = vk::BuildAccelerationStructureFlagsKHR::empty();
    if flags.contains(AccelBuildFlags::ALLOW_UPDATE) {
        out |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
    }
    if flags.contains(AccelBuildFlags::PREFER_FAST_TRACE) {
        out |= vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
    }
    if flags.contains(AccelBuildFlags::PREFER_FAST_BUILD) {
        out |= vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD;
    }
    out
}

pub fn convert_level(level: AccelLevel) -> vk::AccelerationStructureTypeKHR {
    match level {
        AccelLevel::Bottom => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        AccelLevel::Top => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

fn allocation_error(e: gpu_allocator::AllocationError) -> RaytraceError {
    match e {
        gpu_allocator::AllocationError::OutOfMemory => RaytraceError::OutOfMemory,
        other => RaytraceError::ResourceCreationFailed(format!("allocation failed: {other}")),
    }
}

pub fn align_up(value: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    value.div_ceil(alignment) * alignment
}

// ============================================================================
// Raw handle access
// ============================================================================

/// Buffer handle and device address of a Vulkan buffer.
pub fn raw_buffer(buffer: &GpuBuffer) -> RaytraceResult<(vk::Buffer, u64)> {
    match buffer {
        GpuBuffer::Vulkan {
            buffer, address, ..
        } => Ok((*buffer, *address)),
        _ => Err(RaytraceError::InvalidParameter(
            "buffer belongs to another backend".to_string(),
        )),
    }
}

pub fn raw_texture(texture: &GpuTexture) -> RaytraceResult<(vk::Image, vk::ImageView)> {
    match texture {
        GpuTexture::Vulkan { image, view, .. } => Ok((*image, *view)),
        _ => Err(RaytraceError::InvalidParameter(
            "texture belongs to another backend".to_string(),
        )),
    }
}

pub fn raw_accel(accel: &GpuAccelerationStructure) -> RaytraceResult<vk::AccelerationStructureKHR> {
    match accel {
        GpuAccelerationStructure::Vulkan { handle, .. } => Ok(*handle),
        _ => Err(RaytraceError::InvalidParameter(
            "acceleration structure belongs to another backend".to_string(),
        )),
    }
}

pub fn raw_pipeline(
    pipeline: &GpuPipeline,
) -> RaytraceResult<(vk::Pipeline, vk::PipelineLayout, vk::DescriptorSetLayout)> {
    match pipeline {
        GpuPipeline::Vulkan {
            pipeline,
            layout,
            set_layout,
            ..
        } => Ok((*pipeline, *layout, *set_layout)),
        _ => Err(RaytraceError::InvalidParameter(
            "pipeline belongs to another backend".to_string(),
        )),
    }
}

pub fn raw_query_pool(set: &GpuQuerySet) -> RaytraceResult<vk::QueryPool> {
    match set {
        GpuQuerySet::Vulkan { pool, .. } => Ok(*pool),
        _ => Err(RaytraceError::InvalidParameter(
            "query set belongs to another backend".to_string(),
        )),
    }
}

// ============================================================================
// Acceleration structure geometry
// ============================================================================

/// Geometry description of a build. Addresses are zero when only sizes are queried.
pub fn accel_geometry(
    shape: &AccelShape,
    vertex_address: u64,
    index_address: u64,
    instance_address: u64,
) -> (vk::AccelerationStructureGeometryKHR<'static>, u32) {
    match *shape {
        AccelShape::Triangles {
            vertex_count,
            vertex_stride,
            index_format,
            index_count,
        } => {
            let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                .vertex_format(vk::Format::R32G32B32_SFLOAT)
                .vertex_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: vertex_address,
                })
                .vertex_stride(vertex_stride as u64)
                .max_vertex(vertex_count.saturating_sub(1))
                .index_type(convert_index_type(index_format))
                .index_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: index_address,
                });
            let geometry = vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                .flags(vk::GeometryFlagsKHR::OPAQUE);
            (geometry, index_count / 3)
        }
        AccelShape::Instances { count } => {
            let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: instance_address,
                });
            let geometry = vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                .geometry(vk::AccelerationStructureGeometryDataKHR { instances });
            (geometry, count)
        }
    }
}

// ============================================================================
// Creation
// ============================================================================

impl VulkanBackend {
    fn sharing<'a>(&'a self) -> (vk::SharingMode, &'a [u32]) {
        if self.families.len() > 1 {
            (vk::SharingMode::CONCURRENT, &self.families)
        } else {
            (vk::SharingMode::EXCLUSIVE, &[])
        }
    }

    pub(super) fn allocate_buffer(&self, descriptor: &BufferDescriptor) -> RaytraceResult<GpuBuffer> {
        let (sharing_mode, families) = self.sharing();
        let buffer_info = vk::BufferCreateInfo::default()
            .size(descriptor.size.max(4))
            .usage(convert_buffer_usage(descriptor.usage))
            .sharing_mode(sharing_mode)
            .queue_family_indices(families);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(|e| self.fail("create buffer", e))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = self.allocator.lock().allocate(&AllocationCreateDesc {
            name: descriptor.label.as_deref().unwrap_or("buffer"),
            requirements,
            location: convert_memory_location(descriptor.location),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(allocation_error(e));
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            let _ = self.allocator.lock().free(allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(self.fail("bind buffer memory", e));
        }

        let address = unsafe {
            self.device
                .get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
        };

        Ok(GpuBuffer::Vulkan {
            device: self.device.clone(),
            allocator: Arc::clone(&self.allocator),
            buffer,
            allocation: Mutex::new(Some(allocation)),
            size: descriptor.size,
            address,
        })
    }

    pub(super) fn allocate_texture(
        &self,
        descriptor: &TextureDescriptor,
    ) -> RaytraceResult<GpuTexture> {
        if descriptor.width == 0 || descriptor.height == 0 {
            return Err(RaytraceError::InvalidParameter(
                "texture extent must be non-zero".to_string(),
            ));
        }
        let format = convert_format(descriptor.format);
        let (sharing_mode, families) = self.sharing();
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: descriptor.width,
                height: descriptor.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::STORAGE
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(sharing_mode)
            .queue_family_indices(families)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&image_info, None) }
            .map_err(|e| self.fail("create image", e))?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = self.allocator.lock().allocate(&AllocationCreateDesc {
            name: descriptor.label.as_deref().unwrap_or("texture"),
            requirements,
            location: gpu_allocator::MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(allocation_error(e));
            }
        };
        if let Err(e) = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            let _ = self.allocator.lock().free(allocation);
            unsafe { self.device.destroy_image(image, None) };
            return Err(self.fail("bind image memory", e));
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(color_range());
        let view = match unsafe { self.device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                let _ = self.allocator.lock().free(allocation);
                unsafe { self.device.destroy_image(image, None) };
                return Err(self.fail("create image view", e));
            }
        };

        let texture = GpuTexture::Vulkan {
            device: self.device.clone(),
            allocator: Arc::clone(&self.allocator),
            image,
            view,
            allocation: Mutex::new(Some(allocation)),
            format,
            descriptor: descriptor.clone(),
        };

        // Storage images live in the general layout for their whole life.
        self.immediate(|device, cmd| {
            let barrier = vk::ImageMemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::NONE)
                .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::GENERAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(color_range());
            let barriers = [barrier];
            let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
            unsafe { device.cmd_pipeline_barrier2(cmd, &dependency) };
            let clear = vk::ClearColorValue { float32: [0.0; 4] };
            unsafe {
                device.cmd_clear_color_image(
                    cmd,
                    image,
                    vk::ImageLayout::GENERAL,
                    &clear,
                    &[color_range()],
                )
            };
            Ok(())
        })?;

        Ok(texture)
    }

    pub(super) fn sizes_for(
        &self,
        shape: &AccelShape,
        flags: AccelBuildFlags,
    ) -> RaytraceResult<AccelSizes> {
        let (geometry, primitive_count) = accel_geometry(shape, 0, 0, 0);
        let geometries = [geometry];
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(convert_level(shape.level()))
            .flags(convert_build_flags(flags))
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);
        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.accel_loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[primitive_count],
                &mut size_info,
            )
        };

        // Scratch is padded so the encoder can align its start address.
        let pad = self.limits.scratch_alignment as u64;
        Ok(AccelSizes {
            storage: size_info.acceleration_structure_size,
            build_scratch: size_info.build_scratch_size + pad,
            update_scratch: size_info.update_scratch_size + pad,
        })
    }

    pub(super) fn allocate_accel(
        &self,
        descriptor: &AccelDescriptor,
    ) -> RaytraceResult<GpuAccelerationStructure> {
        let label = descriptor.label.as_deref().unwrap_or("acceleration structure");
        let storage = self.allocate_buffer(
            &BufferDescriptor::new(descriptor.size, BufferUsage::ACCEL_STORAGE).with_label(label),
        )?;
        let (buffer, _) = raw_buffer(&storage)?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer)
            .offset(0)
            .size(descriptor.size)
            .ty(convert_level(descriptor.level));
        let handle = unsafe {
            self.accel_loader
                .create_acceleration_structure(&create_info, None)
        }
        .map_err(|e| self.fail("create acceleration structure", e))?;
        let address = unsafe {
            self.accel_loader.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::default()
                    .acceleration_structure(handle),
            )
        };

        Ok(GpuAccelerationStructure::Vulkan {
            loader: self.accel_loader.clone(),
            handle,
            storage,
            address,
            level: descriptor.level,
        })
    }

    pub(super) fn allocate_query_set(&self, count: u32) -> RaytraceResult<GpuQuerySet> {
        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(count.max(1));
        let pool = unsafe { self.device.create_query_pool(&create_info, None) }
            .map_err(|e| self.fail("create query pool", e))?;
        unsafe { self.device.reset_query_pool(pool, 0, count.max(1)) };
        Ok(GpuQuerySet::Vulkan {
            device: self.device.clone(),
            pool,
            count,
        })
    }

    /// Copies host bytes into a mapped buffer.
    pub(super) fn write_mapped(
        &self,
        buffer: &GpuBuffer,
        offset: u64,
        data: &[u8],
    ) -> RaytraceResult<()> {
        let GpuBuffer::Vulkan {
            allocation, size, ..
        } = buffer
        else {
            return Err(RaytraceError::InvalidParameter(
                "buffer belongs to another backend".to_string(),
            ));
        };
        if offset + data.len() as u64 > *size {
            return Err(RaytraceError::InvalidParameter(format!(
                "write of {} bytes at {offset} exceeds buffer size {size}",
                data.len()
            )));
        }
        let mut allocation = allocation.lock();
        let mapped = allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .ok_or_else(|| {
                RaytraceError::InvalidParameter("buffer is not host visible".to_string())
            })?;
        let start = offset as usize;
        mapped[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Reads bytes of a mapped buffer, `None` if the buffer is not host visible.
    pub(super) fn read_mapped(
        &self,
        buffer: &GpuBuffer,
        offset: u64,
        size: u64,
    ) -> RaytraceResult<Option<Vec<u8>>> {
        let GpuBuffer::Vulkan { allocation, .. } = buffer else {
            return Err(RaytraceError::InvalidParameter(
                "buffer belongs to another backend".to_string(),
            ));
        };
        let allocation = allocation.lock();
        let Some(mapped) = allocation.as_ref().and_then(|a| a.mapped_slice()) else {
            return Ok(None);
        };
        let start = offset as usize;
        Ok(Some(mapped[start..start + size as usize].to_vec()))
    }
}

pub fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

pub fn color_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_buffer_usage() {
        let flags = convert_buffer_usage(BufferUsage::SHADER_TABLE);
        assert!(flags.contains(vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR));
        assert!(flags.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
        assert!(!flags.contains(vk::BufferUsageFlags::UNIFORM_BUFFER));
    }

    #[test]
    fn test_convert_format() {
        assert_eq!(convert_format(RenderTargetFormat::Rf32), vk::Format::R32_SFLOAT);
        assert_eq!(
            convert_format(RenderTargetFormat::RGBAu8),
            vk::Format::R8G8B8A8_UNORM
        );
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 128), 0);
        assert_eq!(align_up(1, 128), 128);
        assert_eq!(align_up(256, 128), 256);
    }

    #[test]
    fn test_triangle_geometry_primitive_count() {
        let shape = AccelShape::Triangles {
            vertex_count: 4,
            vertex_stride: 12,
            index_format: IndexFormat::U16,
            index_count: 6,
        };
        let (geometry, count) = accel_geometry(&shape, 0, 0, 0);
        assert_eq!(count, 2);
        assert_eq!(geometry.geometry_type, vk::GeometryTypeKHR::TRIANGLES);
    }
}
