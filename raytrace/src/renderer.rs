//! Shadow renderer.
//!
//! A [`ShadowRenderer`] turns one camera, a light set and a list of instances
//! into a shadow mask every frame. Its calls follow a fixed bracket:
//!
//! ```text
//! begin_scene -> set_* / add_* -> end_scene -> render -> finish
//! ```
//!
//! `render` submits the stage chain, each stage waiting on the fence of the
//! previous one:
//!
//! | Stage | Queue | Waits on |
//! |-------|-------|----------|
//! | Translate | Copy | Previous frame's output |
//! | Deform | Compute | Translate |
//! | Bottom-level build | Direct | Deform |
//! | Top-level build | Direct | Bottom-level build |
//! | Ray dispatch | Direct | Top-level build |
//! | Output | Direct | Ray dispatch |
//!
//! A stage without work is not submitted and carries its predecessor's
//! fence. `begin_scene` while the previous frame is still on the device skips
//! the frame instead of blocking.
//!
//! Every call is serialized by the renderer's own lock, so one renderer may
//! be driven from several threads.

use std::sync::Arc;

use bytemuck::Zeroable;

use hardshadow_core::{
    Camera, HostTexture, InstanceId, LayerMask, LayerTable, Light, LightKind, MAX_LIGHTS,
    RenderFlags,
};

use glam::Vec3;
use parking_lot::Mutex;

use crate::accel::Tlas;
use crate::backend::{Command, CommandList, GpuBuffer, GpuTexture};
use crate::cache::PrepareInputs;
use crate::context::{Device, PipelineStats, ShadowContext};
use crate::dispatch::{RenderTargets, RootBindings};
use crate::error::{RaytraceError, RaytraceResult};
use crate::scheduler::{FenceValue, QueueKind, StageFences};
use crate::timestamp::TimestampLog;
use crate::types::{
    BufferDescriptor, BufferUsage, CameraData, LightData, RenderTargetFormat, SceneConstants,
};

/// Default distance shadow rays start off the surface.
pub const DEFAULT_SHADOW_RAY_OFFSET: f32 = 0.0001;
/// Default distance below which a hit on the receiver itself is ignored.
pub const DEFAULT_SELF_SHADOW_THRESHOLD: f32 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Recording,
    Ended,
    Rendered,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TargetRequest {
    width: u32,
    height: u32,
    format: RenderTargetFormat,
    host: Option<HostTexture>,
}

/// Device objects of one renderer, valid for one context generation.
#[derive(Debug)]
struct GpuState {
    generation: u64,
    tlas: Tlas,
    targets: Option<RenderTargets>,
    constants: Option<Arc<GpuBuffer>>,
}

#[derive(Debug)]
struct RendererState {
    phase: Phase,
    flags: RenderFlags,
    shadow_ray_offset: f32,
    self_shadow_threshold: f32,
    target: Option<TargetRequest>,
    camera: Camera,
    lights: Vec<Light>,
    instances: Vec<InstanceId>,
    layers: LayerTable,
    constants: SceneConstants,
    gpu: Option<GpuState>,
    fences: StageFences,
    timestamps: TimestampLog,
    skipped_frames: u64,
    frame_stats: PipelineStats,
}

/// Produces one shadow mask per frame for one camera and light set.
pub struct ShadowRenderer {
    context: Arc<ShadowContext>,
    state: Mutex<RendererState>,
}

fn light_data(light: &Light, layers: &LayerTable) -> LightData {
    let mut data = LightData::zeroed();
    data.light_type = light.kind.type_id();
    data.layer_mask = layers.translate(light.layer_mask).bits();
    let (position, direction) = match light.kind {
        LightKind::Directional { direction } => (Vec3::ZERO, direction),
        LightKind::Spot {
            position,
            direction,
            range,
            spot_angle,
        } => {
            data.range = range;
            data.spot_angle = spot_angle;
            (position, direction)
        }
        LightKind::Point { position, range } | LightKind::ReversePoint { position, range } => {
            data.range = range;
            (position, Vec3::ZERO)
        }
    };
    data.position = position.to_array();
    data.direction = direction.to_array();
    data
}

/// Brackets `list` with begin and end timestamps of `stage` when it does work.
fn timed(log: &mut TimestampLog, enabled: bool, stage: &str, list: CommandList) -> CommandList {
    if !enabled || list.work_len() == 0 {
        return list;
    }
    let mut timed = CommandList::new(list.label().to_string());
    log.begin(&mut timed, stage);
    timed.append(list);
    log.end(&mut timed, stage);
    timed
}

impl ShadowRenderer {
    pub(crate) fn new(context: Arc<ShadowContext>) -> Self {
        Self {
            context,
            state: Mutex::new(RendererState {
                phase: Phase::Idle,
                flags: RenderFlags::DEFAULT,
                shadow_ray_offset: DEFAULT_SHADOW_RAY_OFFSET,
                self_shadow_threshold: DEFAULT_SELF_SHADOW_THRESHOLD,
                target: None,
                camera: Camera::default(),
                lights: Vec::new(),
                instances: Vec::new(),
                layers: LayerTable::default(),
                constants: SceneConstants::zeroed(),
                gpu: None,
                fences: StageFences::default(),
                timestamps: TimestampLog::new(),
                skipped_frames: 0,
                frame_stats: PipelineStats::default(),
            }),
        }
    }

    pub fn context(&self) -> &Arc<ShadowContext> {
        &self.context
    }

    /// Starts recording a frame. Returns false, and skips the frame, while
    /// the previous frame is still in flight or the context is invalid.
    pub fn begin_scene(&self) -> bool {
        let mut state = self.state.lock();
        let Ok(device) = self.context.device() else {
            return false;
        };
        if matches!(state.phase, Phase::Rendered | Phase::Finished) {
            match device.scheduler.is_complete(state.fences.output) {
                Ok(true) => {}
                Ok(false) => {
                    state.skipped_frames += 1;
                    log::debug!(
                        "Skipping frame, fence {} still in flight ({} skipped)",
                        state.fences.output,
                        state.skipped_frames
                    );
                    return false;
                }
                Err(e) => {
                    self.fail(&mut state, &e);
                    return false;
                }
            }
        }
        state.phase = Phase::Recording;
        state.camera = Camera::default();
        state.lights.clear();
        state.instances.clear();
        true
    }

    pub fn set_render_flags(&self, flags: RenderFlags) {
        self.state.lock().flags = flags;
    }

    pub fn render_flags(&self) -> RenderFlags {
        self.state.lock().flags
    }

    pub fn set_shadow_ray_offset(&self, offset: f32) {
        self.state.lock().shadow_ray_offset = offset;
    }

    pub fn set_self_shadow_threshold(&self, threshold: f32) {
        self.state.lock().self_shadow_threshold = threshold;
    }

    /// Sets the output size and format. With `host` set, `finish` publishes
    /// the output into that host texture.
    pub fn set_render_target(
        &self,
        width: u32,
        height: u32,
        format: RenderTargetFormat,
        host: Option<HostTexture>,
    ) -> RaytraceResult<()> {
        if width == 0 || height == 0 {
            return Err(RaytraceError::InvalidParameter(format!(
                "render target size {width}x{height}"
            )));
        }
        self.state.lock().target = Some(TargetRequest {
            width,
            height,
            format,
            host,
        });
        Ok(())
    }

    pub fn set_camera(&self, camera: Camera) {
        let mut state = self.state.lock();
        if state.phase == Phase::Recording {
            state.camera = camera;
        }
    }

    fn add_light(&self, light: Light) -> RaytraceResult<()> {
        let mut state = self.state.lock();
        if state.phase != Phase::Recording {
            return Ok(());
        }
        if state.lights.len() >= MAX_LIGHTS {
            return Err(RaytraceError::InvalidParameter(format!(
                "a renderer takes at most {MAX_LIGHTS} lights"
            )));
        }
        state.lights.push(light);
        Ok(())
    }

    pub fn add_directional_light(&self, direction: Vec3, layer_mask: LayerMask) -> RaytraceResult<()> {
        self.add_light(Light::directional(direction, layer_mask))
    }

    /// Spot light with the full cone angle in degrees.
    pub fn add_spot_light(
        &self,
        position: Vec3,
        direction: Vec3,
        range: f32,
        spot_angle_degrees: f32,
        layer_mask: LayerMask,
    ) -> RaytraceResult<()> {
        self.add_light(Light::spot(position, direction, range, spot_angle_degrees, layer_mask))
    }

    pub fn add_point_light(&self, position: Vec3, range: f32, layer_mask: LayerMask) -> RaytraceResult<()> {
        self.add_light(Light::point(position, range, layer_mask))
    }

    pub fn add_reverse_point_light(
        &self,
        position: Vec3,
        range: f32,
        layer_mask: LayerMask,
    ) -> RaytraceResult<()> {
        self.add_light(Light::reverse_point(position, range, layer_mask))
    }

    pub fn add_instance(&self, instance: InstanceId) {
        let mut state = self.state.lock();
        if state.phase == Phase::Recording {
            state.instances.push(instance);
        }
    }

    /// Closes the frame description: compacts the layers in use and packs
    /// the constants of this frame.
    pub fn end_scene(&self) {
        let mut state = self.state.lock();
        if state.phase != Phase::Recording {
            return;
        }
        let scene = self.context.scene();
        let layers = LayerTable::from_layers(
            state
                .instances
                .iter()
                .filter_map(|&id| scene.instance(id).map(|i| i.layer())),
        );

        let camera = &state.camera;
        let mut constants = SceneConstants::zeroed();
        constants.camera = CameraData {
            view: camera.view.to_cols_array_2d(),
            projection: camera.projection.to_cols_array_2d(),
            position: camera.position.extend(1.0).to_array(),
            near: camera.near,
            far: camera.far,
            layer_mask: layers.translate(camera.layer_mask).bits(),
            _pad: 0,
        };
        constants.render_flags = state.flags.bits();
        constants.light_count = state.lights.len() as u32;
        constants.shadow_ray_offset = state.shadow_ray_offset;
        constants.self_shadow_threshold = state.self_shadow_threshold;
        for (slot, light) in constants.lights.iter_mut().zip(&state.lights) {
            *slot = light_data(light, &layers);
        }

        log::trace!(
            "Scene ended: {} instances, {} lights, {} layers",
            state.instances.len(),
            state.lights.len(),
            layers.len()
        );
        state.layers = layers;
        state.constants = constants;
        state.phase = Phase::Ended;
    }

    /// Submits the frame. Returns false if no ended scene was pending.
    pub fn render(&self) -> RaytraceResult<bool> {
        let mut state = self.state.lock();
        if state.phase != Phase::Ended {
            return Ok(false);
        }
        let Ok(device) = self.context.device() else {
            state.phase = Phase::Idle;
            return Ok(false);
        };
        match self.render_frame(&mut state, &device) {
            Ok(()) => {
                state.phase = Phase::Rendered;
                Ok(true)
            }
            Err(e) => {
                state.phase = Phase::Idle;
                self.fail(&mut state, &e);
                Err(e)
            }
        }
    }

    fn render_frame(&self, state: &mut RendererState, device: &Device) -> RaytraceResult<()> {
        let target = state.target.ok_or_else(|| {
            RaytraceError::InvalidParameter("no render target set".to_string())
        })?;
        let backend = device.backend().as_ref();
        let scheduler = &device.scheduler;
        let flags = state.flags;
        let timing = flags.contains(RenderFlags::DBG_TIMESTAMP);

        let generation = self.context.generation();
        if state.gpu.as_ref().is_none_or(|gpu| gpu.generation != generation) {
            log::debug!("Creating renderer device state (generation {generation})");
            state.gpu = Some(GpuState {
                generation,
                tlas: Tlas::new(device.limits),
                targets: None,
                constants: None,
            });
        }
        let Some(gpu) = state.gpu.as_mut() else {
            return Err(RaytraceError::ContextInvalid);
        };

        let targets = match gpu.targets.take() {
            Some(targets) if targets.matches(target.width, target.height, target.format) => targets,
            _ => RenderTargets::new(backend, target.width, target.height, target.format)?,
        };
        let targets = gpu.targets.insert(targets);
        let constants = match &gpu.constants {
            Some(buffer) => Arc::clone(buffer),
            None => {
                let buffer = Arc::new(backend.create_buffer(
                    &BufferDescriptor::new(
                        std::mem::size_of::<SceneConstants>() as u64,
                        BufferUsage::UNIFORM | BufferUsage::COPY_DST,
                    )
                    .with_label("scene constants"),
                )?);
                gpu.constants = Some(Arc::clone(&buffer));
                buffer
            }
        };
        if timing {
            state.timestamps.begin_frame(backend)?;
        }

        let timestamps = &mut state.timestamps;
        let mut fences = StageFences::default();

        // The cache stays locked until the bottom-level work is on the queue,
        // so a later renderer sharing a structure never builds on top of it
        // before it was submitted.
        let (instances, mut stats, stamp) = {
            let mut cache = device.cache.lock();
            let inputs = PrepareInputs {
                scheduler,
                engine: &device.deform,
                scene: self.context.scene(),
                layers: &state.layers,
                flags,
            };
            let prepared = cache.prepare(&inputs, &state.instances)?;
            fences.translate = scheduler.join(prepared.translate, state.fences.output)?;
            fences.deform = scheduler.submit(
                QueueKind::Compute,
                timed(timestamps, timing, "deform", prepared.deform),
                fences.translate,
            )?;
            fences.blas = scheduler.submit(
                QueueKind::Direct,
                timed(timestamps, timing, "blas", prepared.blas),
                fences.deform,
            )?;
            (prepared.instances, prepared.stats, cache.stamp())
        };

        let mut tlas_list = CommandList::new("build TLAS");
        let force = flags.contains(RenderFlags::DBG_FORCE_UPDATE_AS);
        if gpu
            .tlas
            .record(backend, &mut tlas_list, &instances, stamp, force)?
        {
            stats.tlas_builds += 1;
        }
        let (Some(tlas), Some(instance_data)) = (gpu.tlas.accel(), gpu.tlas.instance_data()) else {
            return Err(RaytraceError::InvalidParameter(
                "top-level structure was never built".to_string(),
            ));
        };
        let root = RootBindings {
            tlas: Arc::clone(tlas),
            instance_data: Arc::clone(instance_data),
            constants: Arc::clone(&constants),
        };

        let mut rays = CommandList::new("dispatch rays");
        rays.upload(&constants, 0, bytemuck::bytes_of(&state.constants));
        stats.ray_dispatches += device.dispatcher.record(&mut rays, targets, &root, flags) as u64;

        fences.tlas = scheduler.submit(
            QueueKind::Direct,
            timed(timestamps, timing, "tlas", tlas_list),
            fences.blas,
        )?;
        fences.rays = scheduler.submit(
            QueueKind::Direct,
            timed(timestamps, timing, "rays", rays),
            fences.tlas,
        )?;
        fences.output = fences.rays;

        log::debug!(
            "Frame submitted: fences {:?}, {} instances, {} TLAS builds",
            fences.chain().map(FenceValue::get),
            instances.len(),
            stats.tlas_builds
        );
        state.fences = fences;
        state.frame_stats = stats;
        self.context.add_stats(stats);
        Ok(())
    }

    /// Hands the output to the host texture, if any, and resolves timestamps.
    /// Returns false if no rendered frame was pending.
    pub fn finish(&self) -> RaytraceResult<bool> {
        let mut state = self.state.lock();
        if state.phase != Phase::Rendered {
            return Ok(false);
        }
        let Ok(device) = self.context.device() else {
            return Ok(false);
        };
        state.phase = Phase::Finished;
        match self.finish_frame(&mut state, &device) {
            Ok(()) => Ok(true),
            Err(e) => {
                self.fail(&mut state, &e);
                Err(e)
            }
        }
    }

    fn finish_frame(&self, state: &mut RendererState, device: &Device) -> RaytraceResult<()> {
        let scheduler = &device.scheduler;
        let output = match state.gpu.as_ref().and_then(|gpu| gpu.targets.as_ref()) {
            Some(targets) => Arc::clone(&targets.output),
            None => return Err(RaytraceError::ContextInvalid),
        };

        if let Some(host) = state.target.and_then(|t| t.host) {
            let (translated, translator) = {
                let mut cache = device.cache.lock();
                let translated = cache.translate_texture(scheduler, host)?;
                (translated, Arc::clone(cache.translator()))
            };
            let src = output.descriptor();
            let dst = translated.texture.descriptor();
            if (src.width, src.height) != (dst.width, dst.height) {
                return Err(RaytraceError::InvalidParameter(format!(
                    "host texture {} is {}x{}, output is {}x{}",
                    host.0, dst.width, dst.height, src.width, src.height
                )));
            }
            let mut copy = CommandList::new("copy shadow output");
            copy.push(Command::CopyTexture {
                src: Arc::clone(&output),
                dst: Arc::clone(&translated.texture),
            });
            let ready = scheduler.join(state.fences.rays, translated.ready)?;
            let copied = scheduler.submit(QueueKind::Direct, copy, ready)?;
            state.fences.output =
                translator.publish_texture(scheduler, &translated.texture, host, copied)?;
        }

        if state.flags.contains(RenderFlags::DBG_TIMESTAMP) {
            scheduler.wait(state.fences.rays)?;
            state.timestamps.resolve(device.backend().as_ref())?;
            log::debug!("Frame timings:\n{}", state.timestamps.text());
        }
        Ok(())
    }

    /// Records `error` on the context. Device-class errors drop the
    /// renderer's device objects.
    fn fail(&self, state: &mut RendererState, error: &RaytraceError) {
        if error.is_device_fatal() {
            state.gpu = None;
            state.fences = StageFences::default();
        }
        if !matches!(error, RaytraceError::ContextInvalid) {
            self.context.handle_error(error);
        }
    }

    /// Blocks until the current output is written, then returns its texels.
    pub fn output_bytes(&self) -> RaytraceResult<Vec<u8>> {
        let state = self.state.lock();
        let device = self.context.device()?;
        let output = state
            .gpu
            .as_ref()
            .and_then(|gpu| gpu.targets.as_ref())
            .map(|targets| Arc::clone(&targets.output))
            .ok_or_else(|| RaytraceError::InvalidParameter("nothing rendered yet".to_string()))?;
        let result = device
            .scheduler
            .wait(state.fences.rays)
            .and_then(|()| device.backend().read_texture(&output));
        if let Err(e) = &result {
            if e.is_device_fatal() {
                self.context.handle_error(e);
            }
        }
        result
    }

    /// Copies the current output into `dst`, tightly packed in the target
    /// format. Returns the number of bytes written.
    pub fn read_output(&self, dst: &mut [u8]) -> RaytraceResult<usize> {
        let bytes = self.output_bytes()?;
        let Some(dst) = dst.get_mut(..bytes.len()) else {
            return Err(RaytraceError::InvalidParameter(format!(
                "output needs {} bytes, destination holds {}",
                bytes.len(),
                dst.len()
            )));
        };
        dst.copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    /// Device texture holding the current output.
    pub fn output_texture(&self) -> Option<Arc<GpuTexture>> {
        let state = self.state.lock();
        state
            .gpu
            .as_ref()
            .and_then(|gpu| gpu.targets.as_ref())
            .map(|targets| Arc::clone(&targets.output))
    }

    /// Stage timings of the last finished frame, one `"<stage>: <ms>ms"` line each.
    pub fn timestamp_log(&self) -> String {
        self.state.lock().timestamps.text()
    }

    /// Stage fences of the last rendered frame.
    pub fn stage_fences(&self) -> StageFences {
        self.state.lock().fences
    }

    /// Frames skipped because the previous one was still in flight.
    pub fn skipped_frames(&self) -> u64 {
        self.state.lock().skipped_frames
    }

    /// Work counters of the last rendered frame.
    pub fn frame_stats(&self) -> PipelineStats {
        self.state.lock().frame_stats
    }

    /// Builds of this renderer's top-level structure in the current device generation.
    pub fn tlas_builds(&self) -> u64 {
        self.state.lock().gpu.as_ref().map_or(0, |gpu| gpu.tlas.builds())
    }
}

impl std::fmt::Debug for ShadowRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ShadowRenderer")
            .field("phase", &state.phase)
            .field("flags", &state.flags)
            .field("instances", &state.instances.len())
            .field("lights", &state.lights.len())
            .field("fences", &state.fences)
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(ShadowRenderer: Send, Sync);
