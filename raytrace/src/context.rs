//! Shadow context.
//!
//! The [`ShadowContext`] owns the ray tracing device and everything shared by
//! its renderers: the queue scheduler, the device cache, the deformation
//! engine and the ray pipeline. It is an explicitly constructed
//! reference-counted handle; dropping the last handle releases the device.
//!
//! # Architecture
//!
//! | Layer | Type | Purpose |
//! |-------|------|---------|
//! | **Context** | [`ShadowContext`] | Device lifetime, frame brackets, error state (this module) |
//! | Renderer | [`ShadowRenderer`] | Per-frame stage chain of one camera and light set |
//! | Cache | [`DeviceCache`] | Meshes, instances and translated host resources |
//! | Scheduler | [`QueueScheduler`] | Fence values and cross-queue waits |
//!
//! # Failure handling
//!
//! A context that failed to initialize stays invalid and every operation on
//! it or its renderers does nothing. A lost device or a fence timeout tears
//! the device down and invalidates the context; the host creates a new one.
//!
//! # Example
//!
//! ```ignore
//! let context = ShadowContext::new(ContextConfig::default(), scene, translator);
//! if !context.is_valid() {
//!     eprintln!("{}", context.last_error());
//! }
//! ```

use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use hardshadow_core::Scene;

use crate::accel::TlasLimits;
use crate::backend::{RtBackend, create_backend};
use crate::cache::DeviceCache;
use crate::config::ContextConfig;
use crate::deform::DeformEngine;
use crate::dispatch::RayDispatcher;
use crate::error::{ErrorState, RaytraceError, RaytraceResult};
use crate::renderer::ShadowRenderer;
use crate::scheduler::QueueScheduler;
use crate::translator::ResourceTranslator;

/// Work counters of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineStats {
    pub blas_builds: u64,
    pub blas_updates: u64,
    pub tlas_builds: u64,
    pub deform_dispatches: u64,
    pub ray_dispatches: u64,
    pub skipped_instances: u64,
}

impl AddAssign for PipelineStats {
    fn add_assign(&mut self, other: Self) {
        self.blas_builds += other.blas_builds;
        self.blas_updates += other.blas_updates;
        self.tlas_builds += other.tlas_builds;
        self.deform_dispatches += other.deform_dispatches;
        self.ray_dispatches += other.ray_dispatches;
        self.skipped_instances += other.skipped_instances;
    }
}

/// Device objects shared by every renderer of a context.
pub(crate) struct Device {
    pub scheduler: QueueScheduler,
    pub cache: Mutex<DeviceCache>,
    pub deform: DeformEngine,
    pub dispatcher: RayDispatcher,
    pub limits: TlasLimits,
}

impl Device {
    fn new(
        config: &ContextConfig,
        backend: Arc<dyn RtBackend>,
        translator: Arc<dyn ResourceTranslator>,
    ) -> RaytraceResult<Self> {
        let caps = backend.capabilities();
        if !caps.ray_tracing {
            return Err(RaytraceError::FeatureNotSupported(format!(
                "device '{}' does not support ray tracing",
                caps.device_name
            )));
        }
        let deform = DeformEngine::new(backend.as_ref());
        let dispatcher = RayDispatcher::new(backend.as_ref(), &config.ray_programs)?;
        Ok(Self {
            scheduler: QueueScheduler::new(backend, config.fence_timeout),
            cache: Mutex::new(DeviceCache::new(translator)),
            deform,
            dispatcher,
            limits: TlasLimits::from(config),
        })
    }

    pub fn backend(&self) -> &Arc<dyn RtBackend> {
        self.scheduler.backend()
    }
}

/// Explicitly owned ray tracing context shared by renderers.
pub struct ShadowContext {
    config: ContextConfig,
    scene: Arc<Scene>,
    device: RwLock<Option<Arc<Device>>>,
    errors: ErrorState,
    /// Bumped whenever device state is discarded; renderers drop theirs on mismatch.
    generation: AtomicU64,
    renderers: Mutex<Vec<Weak<ShadowRenderer>>>,
    stats: Mutex<PipelineStats>,
}

impl ShadowContext {
    /// Creates a context on the configured backend.
    ///
    /// Initialization failures are recorded: the returned context is invalid
    /// and [`last_error`](Self::last_error) says why.
    pub fn new(
        config: ContextConfig,
        scene: Arc<Scene>,
        translator: Arc<dyn ResourceTranslator>,
    ) -> Arc<Self> {
        let device = config
            .validate()
            .and_then(|()| create_backend(&config))
            .and_then(|backend| Device::new(&config, backend, translator));
        Self::assemble(config, scene, device)
    }

    /// Like [`new`](Self::new), but returns the initialization error instead
    /// of an invalid context.
    pub fn try_new(
        config: ContextConfig,
        scene: Arc<Scene>,
        translator: Arc<dyn ResourceTranslator>,
    ) -> RaytraceResult<Arc<Self>> {
        config.validate()?;
        let backend = create_backend(&config)?;
        let device = Device::new(&config, backend, translator)?;
        Ok(Self::assemble(config, scene, Ok(device)))
    }

    /// Creates a context on an existing backend.
    pub fn with_backend(
        config: ContextConfig,
        backend: Arc<dyn RtBackend>,
        scene: Arc<Scene>,
        translator: Arc<dyn ResourceTranslator>,
    ) -> Arc<Self> {
        let device = config
            .validate()
            .and_then(|()| Device::new(&config, backend, translator));
        Self::assemble(config, scene, device)
    }

    fn assemble(
        config: ContextConfig,
        scene: Arc<Scene>,
        device: RaytraceResult<Device>,
    ) -> Arc<Self> {
        let errors = ErrorState::new();
        let device = match device {
            Ok(device) => {
                log::info!(
                    "Shadow context ready on {} backend ({})",
                    device.backend().name(),
                    device.backend().capabilities().device_name
                );
                Some(Arc::new(device))
            }
            Err(e) => {
                log::error!("Shadow context initialization failed: {e}");
                errors.record(&e);
                errors.invalidate();
                None
            }
        };
        Arc::new(Self {
            config,
            scene,
            device: RwLock::new(device),
            errors,
            generation: AtomicU64::new(0),
            renderers: Mutex::new(Vec::new()),
            stats: Mutex::new(PipelineStats::default()),
        })
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn scene(&self) -> &Arc<Scene> {
        &self.scene
    }

    /// Backend of the live device.
    pub fn backend(&self) -> Option<Arc<dyn RtBackend>> {
        self.device.read().as_ref().map(|d| Arc::clone(d.backend()))
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_valid() && self.device.read().is_some()
    }

    /// Last recorded error message, empty if none.
    pub fn last_error(&self) -> String {
        self.errors.last_error()
    }

    /// Cumulative work counters since creation.
    pub fn stats(&self) -> PipelineStats {
        *self.stats.lock()
    }

    /// Number of device resets since creation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Runs `f` with the device cache. Returns `None` on an invalid context.
    pub fn with_cache<R>(&self, f: impl FnOnce(&DeviceCache) -> R) -> Option<R> {
        let device = self.device().ok()?;
        let cache = device.cache.lock();
        Some(f(&cache))
    }

    pub(crate) fn device(&self) -> RaytraceResult<Arc<Device>> {
        if !self.errors.is_valid() {
            return Err(RaytraceError::ContextInvalid);
        }
        self.device
            .read()
            .as_ref()
            .map(Arc::clone)
            .ok_or(RaytraceError::ContextInvalid)
    }

    pub(crate) fn add_stats(&self, frame: PipelineStats) {
        *self.stats.lock() += frame;
    }

    /// Creates a renderer drawing from this context's scene.
    pub fn create_renderer(self: &Arc<Self>) -> Arc<ShadowRenderer> {
        let renderer = Arc::new(ShadowRenderer::new(Arc::clone(self)));
        let mut renderers = self.renderers.lock();
        renderers.retain(|r| r.strong_count() > 0);
        renderers.push(Arc::downgrade(&renderer));
        log::debug!("Created renderer ({} live)", renderers.len());
        renderer
    }

    /// Live renderers in creation order.
    pub fn renderers(&self) -> Vec<Arc<ShadowRenderer>> {
        self.renderers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Starts a frame: applies released descriptors and host notifications
    /// to the device cache.
    pub fn frame_begin(&self) {
        let events = self.scene.drain_events();
        let Ok(device) = self.device() else {
            return;
        };
        let result = device
            .cache
            .lock()
            .begin_frame(&device.scheduler, events);
        if let Err(e) = result {
            self.handle_error(&e);
        }
    }

    /// Ends a frame: retires signaled fences and checks the device.
    pub fn frame_end(&self) {
        let Ok(device) = self.device() else {
            return;
        };
        let result = device
            .scheduler
            .retire()
            .and_then(|_| device.backend().device_status());
        match result {
            Ok(()) => log::trace!("Frame end, {} fences in flight", device.scheduler.in_flight()),
            Err(e) => self.handle_error(&e),
        }
    }

    /// Renders every renderer whose scene has ended, then finishes them.
    /// Returns the number of renderers that produced output.
    pub fn render_all(&self) -> usize {
        let renderers = self.renderers();
        let rendered: Vec<_> = renderers
            .iter()
            .filter(|r| matches!(r.render(), Ok(true)))
            .collect();
        rendered
            .iter()
            .filter(|r| matches!(r.finish(), Ok(true)))
            .count()
    }

    /// Waits for the device and discards all cached device state and the
    /// last error message. Renderers rebuild theirs on their next frame.
    pub fn clear(&self) {
        let Ok(device) = self.device() else {
            return;
        };
        if let Err(e) = device.scheduler.wait_idle() {
            self.handle_error(&e);
            return;
        }
        device.cache.lock().clear();
        self.errors.clear_message();
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Records `error`. Device-class errors tear the device down.
    pub(crate) fn handle_error(&self, error: &RaytraceError) {
        self.errors.record(error);
        if error.is_device_fatal() {
            self.teardown(error);
        } else {
            log::warn!("{error}");
        }
    }

    fn teardown(&self, reason: &RaytraceError) {
        let device = self.device.write().take();
        if device.is_some() {
            log::error!("Tearing down shadow context: {reason}");
            self.errors.invalidate();
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl std::fmt::Debug for ShadowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowContext")
            .field("valid", &self.is_valid())
            .field("generation", &self.generation())
            .field("renderers", &self.renderers.lock().len())
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(ShadowContext: Send, Sync);
