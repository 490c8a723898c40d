//! Software ray tracing backend.
//!
//! Emulates the device capability set on the CPU: three queues with their own
//! fence timelines, host-addressable buffers, storage textures, bottom- and
//! top-level acceleration structures, the deformation kernel, the shadow ray
//! programs and timestamp queries.
//!
//! Queues execute submissions in FIFO order as soon as their wait dependency
//! is satisfied. Execution happens on the submitting thread, so results are
//! deterministic. A queue can be paused to hold work back, which lets tests
//! observe cross-queue ordering.

mod execute;
mod trace;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use super::{
    CommandList, DeviceCapabilities, GpuAccelerationStructure, GpuBuffer, GpuPipeline,
    GpuQuerySet, GpuTexture, PipelineKind, RtBackend,
};
use crate::config::RayProgramLibrary;
use crate::dispatch::shader_table::PROGRAM_GROUP_COUNT;
use crate::error::{RaytraceError, RaytraceResult};
use crate::scheduler::{FenceWait, QueueKind};
use crate::types::{
    AccelBuildFlags, AccelDescriptor, AccelLevel, AccelShape, AccelSizes, BufferDescriptor,
    BufferUsage, MemoryLocation, ResourceState, TextureDescriptor,
};

pub(crate) use trace::{BottomLevel, TopInstance};

/// Marker placed in the first word of every software program identifier.
const IDENTIFIER_TAG: u32 = 0x5254_5348;

/// Encodes the program identifier of a group.
pub(crate) fn program_identifier(group: u32, size: u32) -> Vec<u8> {
    let mut id = vec![0u8; size as usize];
    id[0..4].copy_from_slice(&IDENTIFIER_TAG.to_le_bytes());
    id[4..8].copy_from_slice(&group.to_le_bytes());
    id
}

/// Decodes a program identifier back to its group index.
pub(crate) fn decode_program_identifier(bytes: &[u8]) -> Option<u32> {
    let tag = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?);
    let group = u32::from_le_bytes(bytes.get(4..8)?.try_into().ok()?);
    (tag == IDENTIFIER_TAG && group < PROGRAM_GROUP_COUNT).then_some(group)
}

// ============================================================================
// Resources
// ============================================================================

/// CPU memory standing in for a device buffer.
pub struct SoftBuffer {
    label: Option<String>,
    usage: BufferUsage,
    location: MemoryLocation,
    size: u64,
    data: RwLock<Vec<u8>>,
}

impl SoftBuffer {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub(crate) fn data(&self) -> &RwLock<Vec<u8>> {
        &self.data
    }
}

impl std::fmt::Debug for SoftBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftBuffer")
            .field("label", &self.label)
            .field("size", &self.size())
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

/// A storage texture holding four `f32` channels per texel.
pub struct SoftTexture {
    descriptor: TextureDescriptor,
    texels: RwLock<Vec<[f32; 4]>>,
    state: Mutex<ResourceState>,
}

impl SoftTexture {
    pub fn descriptor(&self) -> &TextureDescriptor {
        &self.descriptor
    }

    pub(crate) fn texels(&self) -> &RwLock<Vec<[f32; 4]>> {
        &self.texels
    }

    pub fn state(&self) -> ResourceState {
        *self.state.lock()
    }
}

impl std::fmt::Debug for SoftTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftTexture")
            .field("descriptor", &self.descriptor)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Built content of a software acceleration structure.
#[derive(Debug, Clone, Default)]
pub(crate) enum AccelContent {
    #[default]
    Empty,
    Bottom(Arc<BottomLevel>),
    Top(Arc<Vec<TopInstance>>),
}

/// Live structure counts and build counters shared by all structures of a backend.
#[derive(Debug, Default)]
struct AccelCounters {
    live_bottom: AtomicUsize,
    live_top: AtomicUsize,
    bottom_builds: AtomicU64,
    bottom_updates: AtomicU64,
    top_builds: AtomicU64,
}

pub(crate) struct SoftAccelInner {
    label: Option<String>,
    level: AccelLevel,
    size: u64,
    address: u64,
    pub(crate) content: RwLock<AccelContent>,
    counters: Arc<AccelCounters>,
}

impl Drop for SoftAccelInner {
    fn drop(&mut self) {
        let live = match self.level {
            AccelLevel::Bottom => &self.counters.live_bottom,
            AccelLevel::Top => &self.counters.live_top,
        };
        live.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Software acceleration structure.
#[derive(Clone)]
pub struct SoftAccel(Arc<SoftAccelInner>);

impl SoftAccel {
    pub fn level(&self) -> AccelLevel {
        self.0.level
    }

    pub fn address(&self) -> u64 {
        self.0.address
    }

    pub fn size(&self) -> u64 {
        self.0.size
    }

    pub(crate) fn inner(&self) -> &Arc<SoftAccelInner> {
        &self.0
    }
}

impl std::fmt::Debug for SoftAccel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftAccel")
            .field("label", &self.0.label)
            .field("level", &self.0.level)
            .field("address", &format_args!("{:#x}", self.0.address))
            .finish_non_exhaustive()
    }
}

/// Software pipeline. Programs are built into the backend, the object only
/// records which kind it is.
#[derive(Debug)]
pub struct SoftPipeline {
    kind: PipelineKind,
}

impl SoftPipeline {
    pub fn kind(&self) -> PipelineKind {
        self.kind
    }
}

/// Software timestamp queries, in nanoseconds since backend creation.
#[derive(Debug)]
pub struct SoftQuerySet {
    values: Mutex<Vec<Option<u64>>>,
}

impl SoftQuerySet {
    pub fn count(&self) -> u32 {
        self.values.lock().len() as u32
    }
}

// ============================================================================
// Queues
// ============================================================================

struct Submission {
    commands: CommandList,
    wait: Option<FenceWait>,
    signal: u64,
}

#[derive(Default)]
struct QueueState {
    completed: u64,
    last_submitted: u64,
    paused: bool,
    pending: VecDeque<Submission>,
}

/// Record of one executed submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedSubmission {
    pub queue: QueueKind,
    pub label: String,
    pub wait: Option<FenceWait>,
    pub signal: u64,
    /// Command names in execution order.
    pub commands: Vec<&'static str>,
}

#[derive(Default)]
struct SoftState {
    queues: [QueueState; 3],
    executed: Vec<ExecutedSubmission>,
    lost: Option<String>,
}

/// Acceleration structure build counters of a software backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SoftAccelStats {
    pub live_bottom: usize,
    pub live_top: usize,
    pub bottom_builds: u64,
    pub bottom_updates: u64,
    pub top_builds: u64,
}

/// Software ray tracing backend.
pub struct SoftwareBackend {
    capabilities: DeviceCapabilities,
    state: Mutex<SoftState>,
    progress: Condvar,
    counters: Arc<AccelCounters>,
    registry: Mutex<HashMap<u64, Weak<SoftAccelInner>>>,
    next_address: AtomicU64,
    allocation_limit: Mutex<Option<u64>>,
    epoch: Instant,
}

impl SoftwareBackend {
    /// Create a new software backend.
    pub fn new() -> Self {
        Self::with_capabilities(DeviceCapabilities {
            device_name: "Software Ray Tracer".to_string(),
            ..DeviceCapabilities::default()
        })
    }

    /// Create a backend reporting the given capabilities. Used to emulate
    /// devices without ray tracing support.
    pub fn with_capabilities(capabilities: DeviceCapabilities) -> Self {
        Self {
            capabilities,
            state: Mutex::new(SoftState::default()),
            progress: Condvar::new(),
            counters: Arc::new(AccelCounters::default()),
            registry: Mutex::new(HashMap::new()),
            next_address: AtomicU64::new(0x1_0000),
            allocation_limit: Mutex::new(None),
            epoch: Instant::now(),
        }
    }

    /// Holds back execution on a queue. Resuming runs everything that became ready.
    pub fn set_queue_paused(&self, queue: QueueKind, paused: bool) {
        let mut state = self.state.lock();
        state.queues[queue.index()].paused = paused;
        if !paused {
            self.pump(&mut state);
        }
    }

    /// Number of submissions waiting on a queue.
    pub fn pending_submissions(&self, queue: QueueKind) -> usize {
        self.state.lock().queues[queue.index()].pending.len()
    }

    /// Makes every later device call fail as if the device was removed.
    pub fn simulate_device_lost(&self) {
        let mut state = self.state.lock();
        state.lost = Some("device removal simulated".to_string());
        self.progress.notify_all();
    }

    /// Fails every buffer, texture or structure allocation larger than `limit` bytes.
    pub fn set_allocation_limit(&self, limit: Option<u64>) {
        *self.allocation_limit.lock() = limit;
    }

    /// All submissions executed so far, in execution order.
    pub fn executed(&self) -> Vec<ExecutedSubmission> {
        self.state.lock().executed.clone()
    }

    pub fn accel_stats(&self) -> SoftAccelStats {
        SoftAccelStats {
            live_bottom: self.counters.live_bottom.load(Ordering::Relaxed),
            live_top: self.counters.live_top.load(Ordering::Relaxed),
            bottom_builds: self.counters.bottom_builds.load(Ordering::Relaxed),
            bottom_updates: self.counters.bottom_updates.load(Ordering::Relaxed),
            top_builds: self.counters.top_builds.load(Ordering::Relaxed),
        }
    }

    fn check_allocation(&self, size: u64, what: &str) -> RaytraceResult<()> {
        if let Some(limit) = *self.allocation_limit.lock() {
            if size > limit {
                log::warn!("SoftwareBackend: {what} of {size} bytes exceeds limit {limit}");
                return Err(RaytraceError::OutOfMemory);
            }
        }
        Ok(())
    }

    fn check_lost(state: &SoftState) -> RaytraceResult<()> {
        match state.lost {
            Some(_) => Err(RaytraceError::DeviceLost),
            None => Ok(()),
        }
    }

    /// Resolves a bottom-level structure from the address in an instance row.
    pub(crate) fn resolve_address(&self, address: u64) -> Option<Arc<SoftAccelInner>> {
        self.registry.lock().get(&address).and_then(Weak::upgrade)
    }

    fn record_build(&self, level: AccelLevel, update: bool) {
        let counter = match (level, update) {
            (AccelLevel::Bottom, false) => &self.counters.bottom_builds,
            (AccelLevel::Bottom, true) => &self.counters.bottom_updates,
            (AccelLevel::Top, _) => &self.counters.top_builds,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn timestamp_now(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Executes every submission whose dependency is satisfied, until no
    /// queue can make progress.
    fn pump(&self, state: &mut SoftState) {
        loop {
            let mut progressed = false;
            for queue in QueueKind::ALL {
                while let Some(submission) = Self::take_ready(state, queue) {
                    if state.lost.is_none() {
                        if let Err(e) = self.execute(&submission.commands) {
                            log::error!(
                                "SoftwareBackend: '{}' on {queue} queue faulted: {e}",
                                submission.commands.label()
                            );
                            state.lost = Some(e.to_string());
                        }
                    }
                    log::trace!(
                        "SoftwareBackend: {queue} queue executed '{}' ({} commands), signal {}",
                        submission.commands.label(),
                        submission.commands.len(),
                        submission.signal
                    );
                    state.queues[queue.index()].completed = submission.signal;
                    state.executed.push(ExecutedSubmission {
                        queue,
                        label: submission.commands.label().to_string(),
                        wait: submission.wait,
                        signal: submission.signal,
                        commands: submission
                            .commands
                            .commands()
                            .iter()
                            .map(|c| c.name())
                            .collect(),
                    });
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        self.progress.notify_all();
    }

    fn take_ready(state: &mut SoftState, queue: QueueKind) -> Option<Submission> {
        let q = &state.queues[queue.index()];
        if q.paused {
            return None;
        }
        let ready = match q.pending.front()?.wait {
            None => true,
            Some(wait) => state.queues[wait.queue.index()].completed >= wait.value,
        };
        if ready {
            state.queues[queue.index()].pending.pop_front()
        } else {
            None
        }
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SoftwareBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareBackend")
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

impl RtBackend for SoftwareBackend {
    fn name(&self) -> &'static str {
        "software"
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> RaytraceResult<GpuBuffer> {
        log::trace!(
            "SoftwareBackend: creating buffer {:?} (size: {})",
            descriptor.label,
            descriptor.size
        );
        Self::check_lost(&self.state.lock())?;
        if descriptor.size == 0 {
            return Err(RaytraceError::InvalidParameter(
                "buffer size must be non-zero".to_string(),
            ));
        }
        self.check_allocation(descriptor.size, "buffer")?;
        Ok(GpuBuffer::Software(SoftBuffer {
            label: descriptor.label.clone(),
            usage: descriptor.usage,
            location: descriptor.location,
            size: descriptor.size,
            data: RwLock::new(vec![0; descriptor.size as usize]),
        }))
    }

    fn create_texture(&self, descriptor: &TextureDescriptor) -> RaytraceResult<GpuTexture> {
        log::trace!(
            "SoftwareBackend: creating texture {:?} ({}x{} {:?})",
            descriptor.label,
            descriptor.width,
            descriptor.height,
            descriptor.format
        );
        Self::check_lost(&self.state.lock())?;
        if descriptor.width == 0 || descriptor.height == 0 {
            return Err(RaytraceError::InvalidParameter(format!(
                "texture size {}x{} is empty",
                descriptor.width, descriptor.height
            )));
        }
        self.check_allocation(descriptor.data_size() as u64, "texture")?;
        let texel_count = descriptor.width as usize * descriptor.height as usize;
        Ok(GpuTexture::Software(SoftTexture {
            descriptor: descriptor.clone(),
            texels: RwLock::new(vec![[0.0; 4]; texel_count]),
            state: Mutex::new(ResourceState::Common),
        }))
    }

    fn acceleration_structure_sizes(
        &self,
        shape: &AccelShape,
        flags: AccelBuildFlags,
    ) -> RaytraceResult<AccelSizes> {
        let sizes = match *shape {
            AccelShape::Triangles { index_count, .. } => {
                let triangles = (index_count / 3) as u64;
                AccelSizes {
                    storage: align_up(256 + triangles * 48, 256),
                    build_scratch: align_up(256 + triangles * 32, 256),
                    update_scratch: align_up(256 + triangles * 8, 256),
                }
            }
            AccelShape::Instances { count } => AccelSizes {
                storage: align_up(256 + count as u64 * 80, 256),
                build_scratch: align_up(256 + count as u64 * 32, 256),
                update_scratch: align_up(256 + count as u64 * 8, 256),
            },
        };
        if flags.contains(AccelBuildFlags::ALLOW_UPDATE) {
            Ok(sizes)
        } else {
            Ok(AccelSizes {
                update_scratch: 0,
                ..sizes
            })
        }
    }

    fn create_acceleration_structure(
        &self,
        descriptor: &AccelDescriptor,
    ) -> RaytraceResult<GpuAccelerationStructure> {
        log::trace!(
            "SoftwareBackend: creating {:?} acceleration structure {:?} (size: {})",
            descriptor.level,
            descriptor.label,
            descriptor.size
        );
        Self::check_lost(&self.state.lock())?;
        self.check_allocation(descriptor.size, "acceleration structure")?;

        let address = self
            .next_address
            .fetch_add(align_up(descriptor.size.max(256), 256), Ordering::Relaxed);
        let live = match descriptor.level {
            AccelLevel::Bottom => &self.counters.live_bottom,
            AccelLevel::Top => &self.counters.live_top,
        };
        live.fetch_add(1, Ordering::Relaxed);

        let inner = Arc::new(SoftAccelInner {
            label: descriptor.label.clone(),
            level: descriptor.level,
            size: descriptor.size,
            address,
            content: RwLock::new(AccelContent::Empty),
            counters: Arc::clone(&self.counters),
        });
        let mut registry = self.registry.lock();
        registry.retain(|_, weak| weak.strong_count() > 0);
        registry.insert(address, Arc::downgrade(&inner));
        Ok(GpuAccelerationStructure::Software(SoftAccel(inner)))
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> RaytraceResult<()> {
        log::trace!(
            "SoftwareBackend: write_buffer offset={} len={}",
            offset,
            data.len()
        );
        let buffer = execute::soft_buffer(buffer)?;
        if buffer.location == MemoryLocation::GpuOnly {
            return Err(RaytraceError::InvalidParameter(
                "direct writes require a host visible buffer".to_string(),
            ));
        }
        execute::write_bytes(buffer, offset, data)
    }

    fn read_buffer(&self, buffer: &GpuBuffer, offset: u64, size: u64) -> RaytraceResult<Vec<u8>> {
        log::trace!("SoftwareBackend: read_buffer offset={} size={}", offset, size);
        Self::check_lost(&self.state.lock())?;
        execute::read_bytes(execute::soft_buffer(buffer)?, offset, size)
    }

    fn read_texture(&self, texture: &GpuTexture) -> RaytraceResult<Vec<u8>> {
        Self::check_lost(&self.state.lock())?;
        let texture = execute::soft_texture(texture)?;
        let format = texture.descriptor.format;
        let channels = format.channels() as usize;
        let texels = texture.texels.read();
        let mut out = Vec::with_capacity(texture.descriptor.data_size());
        for texel in texels.iter() {
            for &value in &texel[..channels] {
                format.encode_channel(value, &mut out);
            }
        }
        Ok(out)
    }

    fn create_deform_pipeline(&self) -> RaytraceResult<GpuPipeline> {
        log::trace!("SoftwareBackend: creating deform pipeline");
        Ok(GpuPipeline::Software(SoftPipeline {
            kind: PipelineKind::Deform,
        }))
    }

    fn create_ray_pipeline(&self, programs: &RayProgramLibrary) -> RaytraceResult<GpuPipeline> {
        if !self.capabilities.ray_tracing {
            return Err(RaytraceError::FeatureNotSupported(format!(
                "{} has no ray tracing support",
                self.capabilities.device_name
            )));
        }
        if !programs.spirv.is_empty() {
            log::debug!(
                "SoftwareBackend: ignoring {} words of program code, using built-in programs",
                programs.spirv.len()
            );
        }
        Ok(GpuPipeline::Software(SoftPipeline {
            kind: PipelineKind::Ray,
        }))
    }

    fn program_identifiers(&self, pipeline: &GpuPipeline) -> RaytraceResult<Vec<u8>> {
        if pipeline.kind() != PipelineKind::Ray {
            return Err(RaytraceError::InvalidParameter(
                "program identifiers require a ray pipeline".to_string(),
            ));
        }
        let size = self.capabilities.program_identifier_size;
        Ok((0..PROGRAM_GROUP_COUNT)
            .flat_map(|group| program_identifier(group, size))
            .collect())
    }

    fn create_query_set(&self, count: u32) -> RaytraceResult<GpuQuerySet> {
        Ok(GpuQuerySet::Software(SoftQuerySet {
            values: Mutex::new(vec![None; count as usize]),
        }))
    }

    fn read_timestamps(&self, set: &GpuQuerySet, count: u32) -> RaytraceResult<Vec<Option<u64>>> {
        let GpuQuerySet::Software(set) = set else {
            return Err(RaytraceError::InvalidParameter(
                "query set belongs to another backend".to_string(),
            ));
        };
        let mut values = set.values.lock();
        let n = (count as usize).min(values.len());
        let out = values[..n].to_vec();
        values.iter_mut().for_each(|v| *v = None);
        Ok(out)
    }

    fn submit(
        &self,
        queue: QueueKind,
        commands: CommandList,
        wait: Option<FenceWait>,
        signal: u64,
    ) -> RaytraceResult<()> {
        let mut state = self.state.lock();
        Self::check_lost(&state)?;
        let q = &mut state.queues[queue.index()];
        if signal <= q.last_submitted {
            return Err(RaytraceError::InvalidParameter(format!(
                "{queue} queue signal {signal} does not advance past {}",
                q.last_submitted
            )));
        }
        q.last_submitted = signal;
        q.pending.push_back(Submission {
            commands,
            wait,
            signal,
        });
        self.pump(&mut state);
        Ok(())
    }

    fn completed_value(&self, queue: QueueKind) -> RaytraceResult<u64> {
        let state = self.state.lock();
        Self::check_lost(&state)?;
        Ok(state.queues[queue.index()].completed)
    }

    fn wait(&self, queue: QueueKind, value: u64, timeout: Duration) -> RaytraceResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            Self::check_lost(&state)?;
            if state.queues[queue.index()].completed >= value {
                return Ok(true);
            }
            if self.progress.wait_until(&mut state, deadline).timed_out() {
                Self::check_lost(&state)?;
                return Ok(state.queues[queue.index()].completed >= value);
            }
        }
    }

    fn device_status(&self) -> RaytraceResult<()> {
        Self::check_lost(&self.state.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Command;

    fn host_buffer(backend: &SoftwareBackend, size: u64) -> Arc<GpuBuffer> {
        Arc::new(
            backend
                .create_buffer(
                    &BufferDescriptor::new(size, BufferUsage::COPY_DST)
                        .with_location(MemoryLocation::CpuToGpu),
                )
                .unwrap(),
        )
    }

    #[test]
    fn test_submit_executes_in_order() {
        let backend = SoftwareBackend::new();
        let buffer = host_buffer(&backend, 4);

        let mut list = CommandList::new("upload");
        list.upload(&buffer, 0, &[1, 2, 3, 4]);
        backend.submit(QueueKind::Copy, list, None, 1).unwrap();

        assert_eq!(backend.completed_value(QueueKind::Copy).unwrap(), 1);
        assert_eq!(backend.read_buffer(&buffer, 0, 4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_paused_queue_holds_dependents() {
        let backend = SoftwareBackend::new();
        let buffer = host_buffer(&backend, 4);
        backend.set_queue_paused(QueueKind::Copy, true);

        let mut upload = CommandList::new("upload");
        upload.upload(&buffer, 0, &[7, 7, 7, 7]);
        backend.submit(QueueKind::Copy, upload, None, 1).unwrap();

        let mut overwrite = CommandList::new("overwrite");
        overwrite.upload(&buffer, 0, &[9, 9, 9, 9]);
        let wait = FenceWait {
            queue: QueueKind::Copy,
            value: 1,
        };
        backend
            .submit(QueueKind::Direct, overwrite, Some(wait), 2)
            .unwrap();

        assert_eq!(backend.completed_value(QueueKind::Direct).unwrap(), 0);
        assert_eq!(backend.pending_submissions(QueueKind::Direct), 1);
        assert!(
            !backend
                .wait(QueueKind::Direct, 2, Duration::from_millis(10))
                .unwrap()
        );

        backend.set_queue_paused(QueueKind::Copy, false);
        assert!(backend.wait(QueueKind::Direct, 2, Duration::ZERO).unwrap());
        assert_eq!(backend.read_buffer(&buffer, 0, 4).unwrap(), vec![9, 9, 9, 9]);

        let order: Vec<_> = backend.executed().iter().map(|e| e.signal).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn test_wait_wakes_on_other_thread() {
        let backend = Arc::new(SoftwareBackend::new());
        backend.set_queue_paused(QueueKind::Compute, true);
        backend
            .submit(QueueKind::Compute, CommandList::new("empty"), None, 1)
            .unwrap();

        let resumer = Arc::clone(&backend);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            resumer.set_queue_paused(QueueKind::Compute, false);
        });

        assert!(
            backend
                .wait(QueueKind::Compute, 1, Duration::from_secs(5))
                .unwrap()
        );
        handle.join().unwrap();
    }

    #[test]
    fn test_signal_must_advance() {
        let backend = SoftwareBackend::new();
        backend
            .submit(QueueKind::Direct, CommandList::new("a"), None, 5)
            .unwrap();
        let err = backend
            .submit(QueueKind::Direct, CommandList::new("b"), None, 5)
            .unwrap_err();
        assert!(matches!(err, RaytraceError::InvalidParameter(_)));
    }

    #[test]
    fn test_device_lost() {
        let backend = SoftwareBackend::new();
        backend.simulate_device_lost();
        assert_eq!(backend.device_status(), Err(RaytraceError::DeviceLost));
        assert_eq!(
            backend.submit(QueueKind::Direct, CommandList::new("x"), None, 1),
            Err(RaytraceError::DeviceLost)
        );
        assert_eq!(
            backend.wait(QueueKind::Direct, 1, Duration::ZERO),
            Err(RaytraceError::DeviceLost)
        );
    }

    #[test]
    fn test_allocation_limit() {
        let backend = SoftwareBackend::new();
        backend.set_allocation_limit(Some(64));
        assert!(
            backend
                .create_buffer(&BufferDescriptor::new(64, BufferUsage::STORAGE))
                .is_ok()
        );
        assert_eq!(
            backend
                .create_buffer(&BufferDescriptor::new(65, BufferUsage::STORAGE))
                .unwrap_err(),
            RaytraceError::OutOfMemory
        );
    }

    #[test]
    fn test_live_structure_counts() {
        let backend = SoftwareBackend::new();
        let blas = backend
            .create_acceleration_structure(&AccelDescriptor::new(AccelLevel::Bottom, 256))
            .unwrap();
        let tlas = backend
            .create_acceleration_structure(&AccelDescriptor::new(AccelLevel::Top, 256))
            .unwrap();
        assert_ne!(blas.address(), tlas.address());
        assert!(backend.resolve_address(blas.address()).is_some());

        let stats = backend.accel_stats();
        assert_eq!((stats.live_bottom, stats.live_top), (1, 1));

        let address = blas.address();
        drop(blas);
        drop(tlas);
        let stats = backend.accel_stats();
        assert_eq!((stats.live_bottom, stats.live_top), (0, 0));
        assert!(backend.resolve_address(address).is_none());
    }

    #[test]
    fn test_program_identifiers_round_trip() {
        let backend = SoftwareBackend::new();
        let pipeline = backend
            .create_ray_pipeline(&RayProgramLibrary::default())
            .unwrap();
        let ids = backend.program_identifiers(&pipeline).unwrap();
        let size = backend.capabilities().program_identifier_size as usize;
        assert_eq!(ids.len(), size * PROGRAM_GROUP_COUNT as usize);
        for group in 0..PROGRAM_GROUP_COUNT {
            let start = group as usize * size;
            assert_eq!(
                decode_program_identifier(&ids[start..start + size]),
                Some(group)
            );
        }
    }

    #[test]
    fn test_no_ray_tracing_support() {
        let backend = SoftwareBackend::with_capabilities(DeviceCapabilities {
            ray_tracing: false,
            ..DeviceCapabilities::default()
        });
        let err = backend
            .create_ray_pipeline(&RayProgramLibrary::default())
            .unwrap_err();
        assert!(matches!(err, RaytraceError::FeatureNotSupported(_)));
    }

    #[test]
    fn test_timestamps_reset_after_read() {
        let backend = SoftwareBackend::new();
        let set = Arc::new(backend.create_query_set(4).unwrap());
        let mut list = CommandList::new("timestamps");
        list.push(Command::WriteTimestamp {
            set: Arc::clone(&set),
            index: 1,
        });
        backend.submit(QueueKind::Direct, list, None, 1).unwrap();

        let values = backend.read_timestamps(&set, 4).unwrap();
        assert!(values[0].is_none());
        assert!(values[1].is_some());
        assert!(backend.read_timestamps(&set, 4).unwrap()[1].is_none());
    }
}
