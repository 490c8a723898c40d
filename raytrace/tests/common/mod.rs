//! Common utilities for pipeline integration tests.
//!
//! This module provides shared test infrastructure that can be reused
//! across different backend implementations.

use std::sync::Arc;
use std::time::Duration;

use glam::Vec3;

use hardshadow_core::{
    Blendshape, BlendshapeFrame, Camera, InstanceId, LayerMask, MeshDescriptor, MeshId,
    RenderFlags, Scene,
};
use hardshadow_raytrace::{
    BackendKind, ContextConfig, DeviceCache, HostResources, RenderTargetFormat, RtBackend,
    ShadowContext, ShadowRenderer, SoftwareBackend, UploadTranslator,
};

/// Side length of the square test render target.
pub const TARGET_SIZE: u32 = 16;

// ============================================================================
// Backend Enumeration
// ============================================================================

/// Available ray tracing backends for testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// CPU emulation, always present.
    Software,
    /// Vulkan with the KHR ray tracing extensions.
    Vulkan,
}

impl Backend {
    /// Check if this backend is compiled in.
    pub fn is_available(&self) -> bool {
        match self {
            Backend::Software => true,
            #[cfg(feature = "vulkan-backend")]
            Backend::Vulkan => true,
            #[cfg(not(feature = "vulkan-backend"))]
            Backend::Vulkan => false,
        }
    }

    /// Get the backend name for display.
    #[allow(dead_code)]
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Software => "software",
            Backend::Vulkan => "vulkan",
        }
    }
}

// ============================================================================
// Test Context
// ============================================================================

/// A shadow context over a fresh scene, plus the host resources its
/// translator reads from.
pub struct TestContext {
    #[allow(dead_code)]
    pub backend: Backend,
    /// Set when running on the software backend, for its test hooks.
    software: Option<Arc<SoftwareBackend>>,
    #[allow(dead_code)]
    pub host: Arc<HostResources>,
    pub scene: Arc<Scene>,
    pub context: Arc<ShadowContext>,
}

impl TestContext {
    /// Create a new test context for the given backend.
    ///
    /// Returns `None` if the backend is not available.
    pub fn new(backend: Backend) -> Option<Self> {
        Self::with_config(backend, ContextConfig::new())
    }

    /// Create a test context with a custom configuration.
    pub fn with_config(backend: Backend, config: ContextConfig) -> Option<Self> {
        if !backend.is_available() {
            return None;
        }
        let _ = env_logger::builder().is_test(true).try_init();

        let host = Arc::new(HostResources::new());
        let scene = Arc::new(Scene::new());
        let translator = Arc::new(UploadTranslator::new(Arc::clone(&host)));
        let (software, context) = match backend {
            Backend::Software => {
                let software = Arc::new(SoftwareBackend::new());
                let device: Arc<dyn RtBackend> = software.clone();
                let context =
                    ShadowContext::with_backend(config, device, Arc::clone(&scene), translator);
                (Some(software), context)
            }
            Backend::Vulkan => {
                let config = config.with_backend(BackendKind::Vulkan);
                let context = ShadowContext::try_new(config, Arc::clone(&scene), translator)
                    .map_err(|e| eprintln!("Vulkan context unavailable: {e}"))
                    .ok()?;
                (None, context)
            }
        };
        if !context.is_valid() {
            eprintln!("Context invalid: {}", context.last_error());
            return None;
        }

        Some(Self {
            backend,
            software,
            host,
            scene,
            context,
        })
    }

    /// Software backend hooks, `None` on GPU backends.
    #[allow(dead_code)]
    pub fn software(&self) -> Option<&SoftwareBackend> {
        self.software.as_deref()
    }

    /// A renderer with an R32 float target of [`TARGET_SIZE`] squared.
    pub fn renderer(&self) -> Arc<ShadowRenderer> {
        let renderer = self.context.create_renderer();
        renderer
            .set_render_target(TARGET_SIZE, TARGET_SIZE, RenderTargetFormat::Rf32, None)
            .unwrap();
        renderer
    }

    /// Registers a mesh and returns its id.
    pub fn mesh(&self, descriptor: MeshDescriptor) -> MeshId {
        self.scene.create_mesh(descriptor).unwrap()
    }

    /// Registers an instance of `mesh` and returns its id.
    pub fn instance(&self, mesh: MeshId) -> InstanceId {
        self.scene.create_instance(mesh).unwrap()
    }

    /// Records, renders and finishes one scene on `renderer` inside an open
    /// frame. Returns false if the renderer skipped the frame.
    pub fn record(&self, renderer: &ShadowRenderer, instances: &[InstanceId]) -> bool {
        if !renderer.begin_scene() {
            return false;
        }
        renderer.set_camera(test_camera());
        renderer
            .add_directional_light(Vec3::NEG_Y, LayerMask::ALL)
            .unwrap();
        for &instance in instances {
            renderer.add_instance(instance);
        }
        renderer.end_scene();
        assert!(renderer.render().unwrap());
        assert!(renderer.finish().unwrap());
        true
    }

    /// Runs one whole frame with a single renderer.
    pub fn draw(&self, renderer: &ShadowRenderer, instances: &[InstanceId]) -> bool {
        self.context.frame_begin();
        let drawn = self.record(renderer, instances);
        self.context.frame_end();
        drawn
    }

    /// Runs `f` with the device cache of the context.
    #[allow(dead_code)]
    pub fn cache<R>(&self, f: impl FnOnce(&DeviceCache) -> R) -> R {
        self.context.with_cache(f).unwrap()
    }

    /// Reads the deformed vertices of `instance` as `[x, y, z, w]` rows.
    #[allow(dead_code)]
    pub fn deformed_positions(&self, instance: InstanceId) -> Vec<[f32; 4]> {
        let buffer = self.cache(|c| c.deformed_vertices(instance)).unwrap();
        let bytes = self
            .context
            .backend()
            .unwrap()
            .read_buffer(&buffer, 0, buffer.size())
            .unwrap();
        bytes
            .chunks_exact(16)
            .map(|row| {
                let mut v = [0.0; 4];
                for (dst, src) in v.iter_mut().zip(row.chunks_exact(4)) {
                    *dst = f32::from_le_bytes([src[0], src[1], src[2], src[3]]);
                }
                v
            })
            .collect()
    }
}

// ============================================================================
// Scene Helpers
// ============================================================================

/// Camera one unit above the ground, ten units back, looking at the origin.
pub fn test_camera() -> Camera {
    Camera::look_at(
        Vec3::new(0.0, 1.0, 10.0),
        Vec3::ZERO,
        std::f32::consts::FRAC_PI_3,
        1.0,
        0.1,
        100.0,
    )
}

/// Flags for scenes whose winding is not oriented toward the camera.
#[allow(dead_code)]
pub fn unculled_flags() -> RenderFlags {
    RenderFlags::DEFAULT - RenderFlags::CULL_BACK_FACES
}

/// A single triangle around `center`.
#[allow(dead_code)]
pub fn triangle(name: &str, center: Vec3) -> MeshDescriptor {
    MeshDescriptor::from_positions(
        name,
        &[
            center + Vec3::new(-1.0, 0.0, -1.0),
            center + Vec3::new(1.0, 0.0, -1.0),
            center + Vec3::new(0.0, 0.0, 1.0),
        ],
        &[0, 1, 2],
    )
}

/// A horizontal square of half extent `half` at height `y`.
#[allow(dead_code)]
pub fn quad(name: &str, half: f32, y: f32) -> MeshDescriptor {
    MeshDescriptor::from_positions(
        name,
        &[
            Vec3::new(-half, y, -half),
            Vec3::new(half, y, -half),
            Vec3::new(half, y, half),
            Vec3::new(-half, y, half),
        ],
        &[0, 1, 2, 0, 2, 3],
    )
}

/// A triangle with one blendshape lifting every vertex by one unit at weight 100.
#[allow(dead_code)]
pub fn blendshape_triangle(name: &str) -> MeshDescriptor {
    triangle(name, Vec3::ZERO).with_blendshape(Blendshape {
        name: "lift".to_string(),
        frames: vec![BlendshapeFrame {
            weight: 100.0,
            deltas: vec![Vec3::Y; 3],
        }],
    })
}

/// Decodes tightly packed R32 float texels.
#[allow(dead_code)]
pub fn decode_r32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Short fence budget for tests that provoke a timeout.
#[allow(dead_code)]
pub fn short_timeout_config() -> ContextConfig {
    ContextConfig::new().with_fence_timeout(Duration::from_millis(50))
}
