//! Vulkan ray tracing backend.
//!
//! Uses `VK_KHR_acceleration_structure` and `VK_KHR_ray_tracing_pipeline`
//! with buffer device addresses. Every [`QueueKind`] owns a timeline
//! semaphore whose counter is the queue's fence value, so cross-queue waits
//! map directly onto semaphore waits at submission.
//!
//! Command lists are recorded into a fresh command buffer per submission.
//! The submission keeps its command list, staging copies and descriptor pool
//! until its timeline value is reached.

mod device;
mod encode;
mod instance;
mod pipeline;
mod resources;

use std::collections::VecDeque;
use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ash::vk;
use gpu_allocator::vulkan::Allocator;
use parking_lot::Mutex;

use super::{
    CommandList, DeviceCapabilities, GpuAccelerationStructure, GpuBuffer, GpuPipeline,
    GpuQuerySet, GpuTexture, RtBackend,
};
use crate::config::RayProgramLibrary;
use crate::error::{RaytraceError, RaytraceResult};
use crate::scheduler::{FenceWait, QueueKind};
use crate::types::{
    AccelBuildFlags, AccelDescriptor, AccelShape, AccelSizes, BufferDescriptor, BufferUsage,
    MemoryLocation, TextureDescriptor,
};

use device::{QueueLayout, RayTracingLimits};
use encode::{Encoder, Retained};
use resources::{color_layers, raw_buffer, raw_query_pool, raw_texture};

/// Budget of blocking one-shot submissions (readbacks, image setup).
const IMMEDIATE_TIMEOUT: Duration = Duration::from_secs(10);

/// A submission whose timeline value has not been reached yet.
struct InFlight {
    queue: QueueKind,
    signal: u64,
    command_buffer: vk::CommandBuffer,
    retained: Retained,
    commands: CommandList,
}

struct Submissions {
    pools: [vk::CommandPool; 3],
    /// Last value submitted to each queue's timeline.
    last_signal: [u64; 3],
    in_flight: VecDeque<InFlight>,
}

/// Vulkan implementation of [`RtBackend`].
pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    debug_utils: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    device: ash::Device,
    accel_loader: ash::khr::acceleration_structure::Device,
    rt_loader: ash::khr::ray_tracing_pipeline::Device,
    allocator: ManuallyDrop<Arc<Mutex<Allocator>>>,
    layout: QueueLayout,
    families: Vec<u32>,
    limits: RayTracingLimits,
    capabilities: DeviceCapabilities,
    queues: [vk::Queue; 3],
    timelines: [vk::Semaphore; 3],
    submissions: Mutex<Submissions>,
    lost: AtomicBool,
    /// Bound in place of absent optional storage buffers.
    placeholder: ManuallyDrop<Arc<GpuBuffer>>,
}

impl VulkanBackend {
    /// Create a new Vulkan backend on the best ray tracing capable GPU.
    pub fn new(validation: bool) -> RaytraceResult<Self> {
        log::info!("Initializing Vulkan backend");

        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            RaytraceError::InitializationFailed(format!("Failed to load Vulkan: {e}"))
        })?;
        let (instance, debug_messenger, debug_utils) =
            instance::create_instance(&entry, validation)?;

        // The instance is released by hand until the backend owns it.
        let destroy_instance = |instance: &ash::Instance| unsafe {
            if let (Some(utils), Some(messenger)) = (&debug_utils, debug_messenger) {
                utils.destroy_debug_utils_messenger(messenger, None);
            }
            instance.destroy_instance(None);
        };

        let selected = device::select_physical_device(&instance).and_then(|(physical, name)| {
            let layout = device::find_queue_layout(&instance, physical)?;
            let device = device::create_logical_device(&instance, physical, &layout)?;
            Ok((physical, name, layout, device))
        });
        let (physical_device, device_name, layout, device) = match selected {
            Ok(selected) => selected,
            Err(e) => {
                destroy_instance(&instance);
                return Err(e);
            }
        };

        let allocator =
            match device::create_allocator(&instance, physical_device, device.clone()) {
                Ok(allocator) => Arc::new(Mutex::new(allocator)),
                Err(e) => {
                    unsafe { device.destroy_device(None) };
                    destroy_instance(&instance);
                    return Err(e);
                }
            };

        let limits = device::ray_tracing_limits(&instance, physical_device);
        let queues = QueueKind::ALL.map(|queue| {
            let slot = layout.slot(queue);
            unsafe { device.get_device_queue(slot.family, slot.index) }
        });

        let mut timelines = [vk::Semaphore::null(); 3];
        let mut pools = [vk::CommandPool::null(); 3];
        for queue in QueueKind::ALL {
            let mut timeline_info = vk::SemaphoreTypeCreateInfo::default()
                .semaphore_type(vk::SemaphoreType::TIMELINE)
                .initial_value(0);
            let semaphore_info = vk::SemaphoreCreateInfo::default().push_next(&mut timeline_info);
            let pool_info = vk::CommandPoolCreateInfo::default()
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                .queue_family_index(layout.slot(queue).family);
            let created = unsafe {
                device.create_semaphore(&semaphore_info, None).and_then(|semaphore| {
                    timelines[queue.index()] = semaphore;
                    device.create_command_pool(&pool_info, None)
                })
            };
            match created {
                Ok(pool) => pools[queue.index()] = pool,
                Err(e) => {
                    unsafe {
                        for semaphore in timelines.iter().filter(|s| **s != vk::Semaphore::null()) {
                            device.destroy_semaphore(*semaphore, None);
                        }
                        for pool in pools.iter().filter(|p| **p != vk::CommandPool::null()) {
                            device.destroy_command_pool(*pool, None);
                        }
                    }
                    drop(allocator);
                    unsafe { device.destroy_device(None) };
                    destroy_instance(&instance);
                    return Err(RaytraceError::InitializationFailed(format!(
                        "Failed to create queue timeline: {e:?}"
                    )));
                }
            }
        }

        let capabilities = DeviceCapabilities {
            device_name: device_name.clone(),
            ray_tracing: true,
            program_identifier_size: limits.shader_group_handle_size,
            shader_record_alignment: limits.shader_group_handle_alignment,
            shader_table_alignment: limits.shader_group_base_alignment,
            timestamp_period: limits.timestamp_period,
        };

        let accel_loader = ash::khr::acceleration_structure::Device::new(&instance, &device);
        let rt_loader = ash::khr::ray_tracing_pipeline::Device::new(&instance, &device);
        let families = layout.families();

        let placeholder = GpuBuffer::Vulkan {
            device: device.clone(),
            allocator: Arc::clone(&allocator),
            buffer: vk::Buffer::null(),
            allocation: Mutex::new(None),
            size: 0,
            address: 0,
        };

        let mut backend = Self {
            _entry: entry,
            instance,
            debug_utils,
            debug_messenger,
            device,
            accel_loader,
            rt_loader,
            allocator: ManuallyDrop::new(allocator),
            layout,
            families,
            limits,
            capabilities,
            queues,
            timelines,
            submissions: Mutex::new(Submissions {
                pools,
                last_signal: [0; 3],
                in_flight: VecDeque::new(),
            }),
            lost: AtomicBool::new(false),
            placeholder: ManuallyDrop::new(Arc::new(placeholder)),
        };

        // From here on Drop releases everything.
        let placeholder = backend.allocate_buffer(
            &BufferDescriptor::new(16, BufferUsage::STORAGE).with_label("placeholder"),
        )?;
        let previous = std::mem::replace(&mut *backend.placeholder, Arc::new(placeholder));
        drop(previous);

        log::info!(
            "Vulkan backend initialized on {device_name} (direct family {}, compute family {}, copy family {})",
            backend.layout.direct.family,
            backend.layout.compute.family,
            backend.layout.copy.family
        );
        Ok(backend)
    }

    /// Converts a Vulkan error, latching device loss.
    fn fail(&self, what: &str, e: vk::Result) -> RaytraceError {
        match e {
            vk::Result::ERROR_DEVICE_LOST => {
                if !self.lost.swap(true, Ordering::SeqCst) {
                    log::error!("Vulkan device lost during {what}");
                }
                RaytraceError::DeviceLost
            }
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                RaytraceError::OutOfMemory
            }
            other => RaytraceError::ResourceCreationFailed(format!("{what}: {other:?}")),
        }
    }

    fn counter(&self, queue: QueueKind) -> RaytraceResult<u64> {
        unsafe {
            self.device
                .get_semaphore_counter_value(self.timelines[queue.index()])
        }
        .map_err(|e| self.fail("read timeline", e))
    }

    /// Releases submissions whose timeline value has been reached.
    fn reclaim(&self, submissions: &mut Submissions) -> RaytraceResult<()> {
        let mut completed = [0u64; 3];
        for queue in QueueKind::ALL {
            completed[queue.index()] = self.counter(queue)?;
        }
        let pools = submissions.pools;
        submissions.in_flight.retain_mut(|entry| {
            if entry.signal > completed[entry.queue.index()] {
                return true;
            }
            self.release(pools[entry.queue.index()], entry);
            false
        });
        Ok(())
    }

    fn release(&self, pool: vk::CommandPool, entry: &mut InFlight) {
        unsafe {
            self.device
                .free_command_buffers(pool, &[entry.command_buffer]);
            if let Some(descriptors) = entry.retained.descriptor_pool.take() {
                self.device.destroy_descriptor_pool(descriptors, None);
            }
        }
        entry.retained.staging.clear();
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> RaytraceResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }
            .map_err(|e| self.fail("allocate command buffer", e))?;
        let cmd = buffers[0];
        let begin = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if let Err(e) = unsafe { self.device.begin_command_buffer(cmd, &begin) } {
            unsafe { self.device.free_command_buffers(pool, &buffers) };
            return Err(self.fail("begin command buffer", e));
        }
        Ok(cmd)
    }

    /// Records and runs a one-shot command buffer on the direct queue and
    /// blocks until it finished. It waits for everything submitted so far.
    fn immediate(
        &self,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer) -> RaytraceResult<()>,
    ) -> RaytraceResult<()> {
        self.device_status()?;
        let submissions = self.submissions.lock();
        let pool = submissions.pools[QueueKind::Direct.index()];
        let cmd = self.allocate_command_buffer(pool)?;
        let free = || unsafe { self.device.free_command_buffers(pool, &[cmd]) };

        // Prior writes from any queue become visible to this buffer.
        let barriers = [vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)];
        unsafe {
            self.device.cmd_pipeline_barrier2(
                cmd,
                &vk::DependencyInfo::default().memory_barriers(&barriers),
            )
        };
        let recorded = record(&self.device, cmd).and_then(|()| {
            let host = [vk::MemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
                .dst_stage_mask(vk::PipelineStageFlags2::HOST)
                .dst_access_mask(vk::AccessFlags2::HOST_READ)];
            unsafe {
                self.device.cmd_pipeline_barrier2(
                    cmd,
                    &vk::DependencyInfo::default().memory_barriers(&host),
                );
                self.device.end_command_buffer(cmd)
            }
            .map_err(|e| self.fail("end command buffer", e))
        });
        if let Err(e) = recorded {
            free();
            return Err(e);
        }

        let fence = match unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default(), None)
        } {
            Ok(fence) => fence,
            Err(e) => {
                free();
                return Err(self.fail("create fence", e));
            }
        };

        let waits: Vec<_> = QueueKind::ALL
            .iter()
            .filter(|q| submissions.last_signal[q.index()] > 0)
            .map(|q| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(self.timelines[q.index()])
                    .value(submissions.last_signal[q.index()])
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .collect();
        let command_buffers = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(&command_buffers);

        let result = unsafe {
            self.device
                .queue_submit2(self.queues[QueueKind::Direct.index()], &[submit], fence)
        }
        .map_err(|e| self.fail("submit one-shot commands", e))
        .and_then(|()| {
            let timeout = IMMEDIATE_TIMEOUT.as_nanos() as u64;
            match unsafe { self.device.wait_for_fences(&[fence], true, timeout) } {
                Ok(()) => Ok(()),
                Err(vk::Result::TIMEOUT) => Err(RaytraceError::Timeout(IMMEDIATE_TIMEOUT, 0)),
                Err(e) => Err(self.fail("wait for one-shot commands", e)),
            }
        });

        // A timed out buffer may still execute; keep it allocated.
        if !matches!(result, Err(RaytraceError::Timeout(..))) {
            unsafe { self.device.destroy_fence(fence, None) };
            free();
        }
        result
    }

    /// Copies `size` bytes of a device local buffer through a readback buffer.
    fn read_through_staging(
        &self,
        buffer: &GpuBuffer,
        offset: u64,
        size: u64,
    ) -> RaytraceResult<Vec<u8>> {
        let staging = self.allocate_buffer(
            &BufferDescriptor::new(size, BufferUsage::COPY_DST)
                .with_label("readback")
                .with_location(MemoryLocation::GpuToCpu),
        )?;
        let (src, _) = raw_buffer(buffer)?;
        let (dst, _) = raw_buffer(&staging)?;
        self.immediate(|device, cmd| {
            let region = vk::BufferCopy {
                src_offset: offset,
                dst_offset: 0,
                size,
            };
            unsafe { device.cmd_copy_buffer(cmd, src, dst, &[region]) };
            Ok(())
        })?;
        self.read_mapped(&staging, 0, size)?.ok_or_else(|| {
            RaytraceError::ResourceCreationFailed("readback buffer is not mapped".to_string())
        })
    }
}

impl RtBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> RaytraceResult<GpuBuffer> {
        self.device_status()?;
        self.allocate_buffer(descriptor)
    }

    fn create_texture(&self, descriptor: &TextureDescriptor) -> RaytraceResult<GpuTexture> {
        self.device_status()?;
        self.allocate_texture(descriptor)
    }

    fn acceleration_structure_sizes(
        &self,
        shape: &AccelShape,
        flags: AccelBuildFlags,
    ) -> RaytraceResult<AccelSizes> {
        self.sizes_for(shape, flags)
    }

    fn create_acceleration_structure(
        &self,
        descriptor: &AccelDescriptor,
    ) -> RaytraceResult<GpuAccelerationStructure> {
        self.device_status()?;
        self.allocate_accel(descriptor)
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> RaytraceResult<()> {
        self.write_mapped(buffer, offset, data)
    }

    fn read_buffer(&self, buffer: &GpuBuffer, offset: u64, size: u64) -> RaytraceResult<Vec<u8>> {
        if offset + size > buffer.size() {
            return Err(RaytraceError::InvalidParameter(format!(
                "read of {size} bytes at {offset} exceeds buffer size {}",
                buffer.size()
            )));
        }
        if size == 0 {
            return Ok(Vec::new());
        }
        match self.read_mapped(buffer, offset, size)? {
            Some(bytes) => Ok(bytes),
            None => self.read_through_staging(buffer, offset, size),
        }
    }

    fn read_texture(&self, texture: &GpuTexture) -> RaytraceResult<Vec<u8>> {
        let descriptor = texture.descriptor().clone();
        let size = descriptor.data_size() as u64;
        let staging = self.allocate_buffer(
            &BufferDescriptor::new(size, BufferUsage::COPY_DST)
                .with_label("texture readback")
                .with_location(MemoryLocation::GpuToCpu),
        )?;
        let (image, _) = raw_texture(texture)?;
        let (dst, _) = raw_buffer(&staging)?;
        self.immediate(|device, cmd| {
            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: color_layers(),
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: descriptor.width,
                    height: descriptor.height,
                    depth: 1,
                },
            };
            unsafe {
                device.cmd_copy_image_to_buffer(
                    cmd,
                    image,
                    vk::ImageLayout::GENERAL,
                    dst,
                    &[region],
                )
            };
            Ok(())
        })?;
        self.read_mapped(&staging, 0, size)?.ok_or_else(|| {
            RaytraceError::ResourceCreationFailed("readback buffer is not mapped".to_string())
        })
    }

    fn create_deform_pipeline(&self) -> RaytraceResult<GpuPipeline> {
        self.build_deform_pipeline()
    }

    fn create_ray_pipeline(&self, programs: &RayProgramLibrary) -> RaytraceResult<GpuPipeline> {
        self.build_ray_pipeline(programs)
    }

    fn program_identifiers(&self, pipeline: &GpuPipeline) -> RaytraceResult<Vec<u8>> {
        self.group_handles(pipeline)
    }

    fn create_query_set(&self, count: u32) -> RaytraceResult<GpuQuerySet> {
        self.allocate_query_set(count)
    }

    fn read_timestamps(&self, set: &GpuQuerySet, count: u32) -> RaytraceResult<Vec<Option<u64>>> {
        let pool = raw_query_pool(set)?;
        let count = count.min(set.count());
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut data = vec![[0u64; 2]; count as usize];
        let result = unsafe {
            self.device.get_query_pool_results(
                pool,
                0,
                &mut data,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WITH_AVAILABILITY,
            )
        };
        match result {
            Ok(()) | Err(vk::Result::NOT_READY) => {}
            Err(e) => return Err(self.fail("read timestamps", e)),
        }
        // Next frame starts from unwritten queries.
        unsafe { self.device.reset_query_pool(pool, 0, set.count().max(1)) };

        let period = self.capabilities.timestamp_period as f64;
        Ok(data
            .iter()
            .map(|&[value, available]| (available != 0).then(|| (value as f64 * period) as u64))
            .collect())
    }

    fn submit(
        &self,
        queue: QueueKind,
        commands: CommandList,
        wait: Option<FenceWait>,
        signal: u64,
    ) -> RaytraceResult<()> {
        self.device_status()?;
        let mut submissions = self.submissions.lock();
        if signal <= submissions.last_signal[queue.index()] {
            return Err(RaytraceError::InvalidParameter(format!(
                "{queue} queue signal {signal} does not advance past {}",
                submissions.last_signal[queue.index()]
            )));
        }
        self.reclaim(&mut submissions)?;

        let pool = submissions.pools[queue.index()];
        let cmd = self.allocate_command_buffer(pool)?;
        let mut retained = Retained::default();
        let recorded = self
            .descriptor_pool_for(commands.commands())
            .and_then(|descriptors| {
                retained.descriptor_pool = descriptors;
                Encoder::new(self, cmd, &mut retained).record(commands.commands())
            })
            .and_then(|()| {
                unsafe { self.device.end_command_buffer(cmd) }
                    .map_err(|e| self.fail("end command buffer", e))
            });

        let mut entry = InFlight {
            queue,
            signal,
            command_buffer: cmd,
            retained,
            commands,
        };
        if let Err(e) = recorded {
            log::warn!("Failed to record {queue} submission: {e}");
            self.release(pool, &mut entry);
            return Err(e);
        }

        let waits: Vec<_> = wait
            .map(|w| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(self.timelines[w.queue.index()])
                    .value(w.value)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .into_iter()
            .collect();
        let signals = [vk::SemaphoreSubmitInfo::default()
            .semaphore(self.timelines[queue.index()])
            .value(signal)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let command_buffers = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(&command_buffers)
            .signal_semaphore_infos(&signals);

        if let Err(e) = unsafe {
            self.device
                .queue_submit2(self.queues[queue.index()], &[submit], vk::Fence::null())
        } {
            self.release(pool, &mut entry);
            return Err(self.fail("queue submit", e));
        }

        log::trace!(
            "Submitted '{}' to {queue} queue, signal {signal}",
            entry.commands.label()
        );
        submissions.last_signal[queue.index()] = signal;
        submissions.in_flight.push_back(entry);
        Ok(())
    }

    fn completed_value(&self, queue: QueueKind) -> RaytraceResult<u64> {
        self.counter(queue)
    }

    fn wait(&self, queue: QueueKind, value: u64, timeout: Duration) -> RaytraceResult<bool> {
        let semaphores = [self.timelines[queue.index()]];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.wait_semaphores(&info, nanos) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(self.fail("wait for timeline", e)),
        }
    }

    fn device_status(&self) -> RaytraceResult<()> {
        if self.lost.load(Ordering::SeqCst) {
            return Err(RaytraceError::DeviceLost);
        }
        self.counter(QueueKind::Direct).map(|_| ())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan backend");
        unsafe {
            let _ = self.device.device_wait_idle();

            let (pools, mut in_flight) = {
                let submissions = self.submissions.get_mut();
                (submissions.pools, std::mem::take(&mut submissions.in_flight))
            };
            for entry in in_flight.iter_mut() {
                self.release(pools[entry.queue.index()], entry);
            }
            drop(in_flight);

            for pool in pools {
                self.device.destroy_command_pool(pool, None);
            }
            for semaphore in self.timelines {
                self.device.destroy_semaphore(semaphore, None);
            }

            ManuallyDrop::drop(&mut self.placeholder);
            if Arc::strong_count(&self.allocator) > 1 {
                log::warn!("GPU resources outlive the Vulkan backend");
            }
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);
            if let (Some(utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger) {
                utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
