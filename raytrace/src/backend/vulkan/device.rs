//! Physical device selection, queue families, logical device and allocator.

use std::ffi::CStr;

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};

use crate::error::{RaytraceError, RaytraceResult};
use crate::scheduler::QueueKind;

/// Device extensions the pipeline cannot run without.
const REQUIRED_EXTENSIONS: [&CStr; 3] = [
    ash::khr::acceleration_structure::NAME,
    ash::khr::ray_tracing_pipeline::NAME,
    ash::khr::deferred_host_operations::NAME,
];

/// Queue family index and queue index of every [`QueueKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSlot {
    pub family: u32,
    pub index: u32,
}

/// Where each queue kind lives on the device.
#[derive(Debug, Clone, Copy)]
pub struct QueueLayout {
    pub direct: QueueSlot,
    pub compute: QueueSlot,
    pub copy: QueueSlot,
}

impl QueueLayout {
    pub fn slot(&self, queue: QueueKind) -> QueueSlot {
        match queue {
            QueueKind::Direct => self.direct,
            QueueKind::Compute => self.compute,
            QueueKind::Copy => self.copy,
        }
    }

    /// Distinct families in use. Resources are shared concurrently between them.
    pub fn families(&self) -> Vec<u32> {
        let mut families = vec![self.direct.family, self.compute.family, self.copy.family];
        families.sort_unstable();
        families.dedup();
        families
    }
}

/// Limits of the ray tracing extensions read at device selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct RayTracingLimits {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub scratch_alignment: u32,
    pub timestamp_period: f32,
}

fn supports_ray_tracing(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
    let Ok(extensions) = (unsafe { instance.enumerate_device_extension_properties(device) }) else {
        return false;
    };
    let has_extensions = REQUIRED_EXTENSIONS.iter().all(|required| {
        extensions.iter().any(|ext| {
            // SAFETY: extension_name is a null-terminated array filled by the driver
            unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == *required
        })
    });
    if !has_extensions {
        return false;
    }

    let mut accel = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
    let mut pipeline = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
    let mut vulkan_12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut vulkan_13 = vk::PhysicalDeviceVulkan13Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut accel)
        .push_next(&mut pipeline)
        .push_next(&mut vulkan_12)
        .push_next(&mut vulkan_13);
    unsafe { instance.get_physical_device_features2(device, &mut features) };

    accel.acceleration_structure == vk::TRUE
        && pipeline.ray_tracing_pipeline == vk::TRUE
        && vulkan_12.buffer_device_address == vk::TRUE
        && vulkan_12.timeline_semaphore == vk::TRUE
        && vulkan_13.synchronization2 == vk::TRUE
}

/// Select the best physical device with hardware ray tracing.
///
/// Prefers discrete GPUs over integrated GPUs.
pub fn select_physical_device(
    instance: &ash::Instance,
) -> RaytraceResult<(vk::PhysicalDevice, String)> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        RaytraceError::InitializationFailed(format!("Failed to enumerate physical devices: {e:?}"))
    })?;

    if devices.is_empty() {
        return Err(RaytraceError::InitializationFailed(
            "No Vulkan-capable GPU found".to_string(),
        ));
    }

    let mut best = None;
    let mut best_score = 0;
    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        // SAFETY: device_name is a null-terminated array filled by the driver
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        if properties.api_version < super::instance::REQUIRED_API_VERSION
            || !supports_ray_tracing(instance, device)
        {
            log::info!("Skipping GPU without ray tracing: {name}");
            continue;
        }

        let mut score = 1;
        if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 1000;
        } else if properties.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 100;
        }
        log::info!(
            "Found GPU: {name} (type: {:?}, score: {score})",
            properties.device_type
        );

        if score > best_score {
            best_score = score;
            best = Some((device, name));
        }
    }

    best.ok_or_else(|| {
        RaytraceError::FeatureNotSupported("no GPU with hardware ray tracing found".to_string())
    })
}

/// Reads handle sizes and alignments of the ray tracing extensions.
pub fn ray_tracing_limits(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> RayTracingLimits {
    let mut pipeline = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
    let mut accel = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
    let mut properties = vk::PhysicalDeviceProperties2::default()
        .push_next(&mut pipeline)
        .push_next(&mut accel);
    unsafe { instance.get_physical_device_properties2(physical_device, &mut properties) };

    RayTracingLimits {
        shader_group_handle_size: pipeline.shader_group_handle_size,
        shader_group_handle_alignment: pipeline.shader_group_handle_alignment,
        shader_group_base_alignment: pipeline.shader_group_base_alignment,
        scratch_alignment: accel.min_acceleration_structure_scratch_offset_alignment,
        timestamp_period: properties.properties.limits.timestamp_period,
    }
}

/// Maps the three queue kinds to device queues.
///
/// Direct needs graphics and compute. Compute prefers a family without
/// graphics, copy prefers a transfer-only family. Kinds fall back to the
/// direct family, taking the next queue index while the family has one.
pub fn find_queue_layout(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> RaytraceResult<QueueLayout> {
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    let find = |include: vk::QueueFlags, exclude: vk::QueueFlags| {
        families
            .iter()
            .position(|f| f.queue_flags.contains(include) && !f.queue_flags.intersects(exclude))
            .map(|i| i as u32)
    };

    let direct = find(
        vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
        vk::QueueFlags::empty(),
    )
    .ok_or_else(|| RaytraceError::InitializationFailed("No direct queue family found".into()))?;
    let compute = find(vk::QueueFlags::COMPUTE, vk::QueueFlags::GRAPHICS).unwrap_or(direct);
    let copy = find(
        vk::QueueFlags::TRANSFER,
        vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
    )
    .unwrap_or(compute);

    let mut used = vec![0u32; families.len()];
    let mut take = |family: u32| {
        let count = families[family as usize].queue_count.max(1);
        let slot = &mut used[family as usize];
        let index = (*slot).min(count - 1);
        *slot += 1;
        QueueSlot { family, index }
    };
    Ok(QueueLayout {
        direct: take(direct),
        compute: take(compute),
        copy: take(copy),
    })
}

/// Create the logical device with the ray tracing extensions and features.
pub fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    layout: &QueueLayout,
) -> RaytraceResult<ash::Device> {
    let priorities = [1.0f32; 3];
    let queue_create_infos: Vec<_> = layout
        .families()
        .into_iter()
        .map(|family| {
            let count = QueueKind::ALL
                .iter()
                .map(|&q| layout.slot(q))
                .filter(|slot| slot.family == family)
                .map(|slot| slot.index + 1)
                .max()
                .unwrap_or(1);
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(&priorities[..count as usize])
        })
        .collect();

    let extensions: Vec<_> = REQUIRED_EXTENSIONS.iter().map(|e| e.as_ptr()).collect();

    let mut accel = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
        .acceleration_structure(true);
    let mut pipeline =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);
    let mut vulkan_12 = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .timeline_semaphore(true)
        .host_query_reset(true);
    let mut vulkan_13 = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extensions)
        .push_next(&mut accel)
        .push_next(&mut pipeline)
        .push_next(&mut vulkan_12)
        .push_next(&mut vulkan_13);

    unsafe { instance.create_device(physical_device, &create_info, None) }.map_err(|e| {
        RaytraceError::InitializationFailed(format!("Failed to create logical device: {e:?}"))
    })
}

/// Create a memory allocator with device addresses enabled.
pub fn create_allocator(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
) -> RaytraceResult<Allocator> {
    Allocator::new(&AllocatorCreateDesc {
        instance: instance.clone(),
        device,
        physical_device,
        debug_settings: Default::default(),
        buffer_device_address: true,
        allocation_sizes: gpu_allocator::AllocationSizes::default(),
    })
    .map_err(|e| {
        RaytraceError::InitializationFailed(format!("Failed to create memory allocator: {e}"))
    })
}
