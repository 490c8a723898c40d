//! Pipeline integration tests.
//!
//! These tests drive whole frames through a [`ShadowContext`] and check the
//! work the pipeline performs: which acceleration structures are built, how
//! stages are fenced, what deformation produces and how failures surface.
//! Tests are parameterized using `rstest` to run against every backend;
//! tests that need to stall or break the device use software backend hooks.
//!
//! # Test Categories
//!
//! - **Rebuild Tests**: Structures are rebuilt exactly when their inputs change
//! - **Ordering Tests**: Stage fences never complete before their predecessors
//! - **Deformation Tests**: Blendshapes produce deterministic vertex data
//! - **Lifetime Tests**: Cache entries follow the scene's reference counts
//! - **Failure Tests**: Skipped frames, timeouts, device loss and allocation failures
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --test pipeline_tests
//!
//! # Include the Vulkan cases
//! cargo test --test pipeline_tests --features vulkan-backend
//! ```

mod common;

use std::sync::Arc;

use glam::{Mat4, Vec3};
use rstest::rstest;

use common::{
    Backend, TARGET_SIZE, TestContext, blendshape_triangle, decode_r32, quad,
    short_timeout_config, triangle, unculled_flags,
};
use hardshadow_core::{
    HostBuffer, InstanceFlags, InstanceId, MeshDescriptor, RenderFlags, VertexSource,
};
use hardshadow_raytrace::{
    ContextConfig, DeviceCapabilities, HostResources, QueueKind, RaytraceError,
    RenderTargetFormat, ShadowContext, SoftwareBackend, UploadTranslator,
};

fn software() -> TestContext {
    TestContext::new(Backend::Software).expect("software backend is always available")
}

// ============================================================================
// Rendering Tests
// ============================================================================

/// A ground plane under a floating square, lit from straight above.
///
/// The ground below the square is in shadow, the ground beside it and the
/// sky are not, and no texel is NaN.
#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_single_caster_shadow(#[case] backend: Backend) {
    let Some(ctx) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    let ground = ctx.instance(ctx.mesh(quad("ground", 10.0, 0.0)));
    let caster = ctx.instance(ctx.mesh(quad("caster", 3.0, 2.0)));
    let renderer = ctx.renderer();
    renderer.set_render_flags(unculled_flags());

    assert!(ctx.draw(&renderer, &[ground, caster]));

    let texels = decode_r32(&renderer.output_bytes().unwrap());
    assert_eq!(texels.len(), (TARGET_SIZE * TARGET_SIZE) as usize);
    assert!(texels.iter().all(|t| !t.is_nan()));

    let at = |x: u32, y: u32| texels[(y * TARGET_SIZE + x) as usize];
    let center = TARGET_SIZE / 2;
    assert_eq!(at(center, center), 1.0, "ground under the caster is shadowed");
    assert_eq!(at(0, 0), 0.0, "sky is never shadowed");
    assert_eq!(at(0, TARGET_SIZE - 1), 0.0, "ground beside the caster is lit");

    if let Some(soft) = ctx.software() {
        let stats = soft.accel_stats();
        assert_eq!(stats.live_bottom, 2);
        assert_eq!(stats.live_top, 1);
    }
    assert!(ctx.context.last_error().is_empty());
}

/// One triangle and one directional light: one bottom-level and one
/// top-level structure, and a finite output.
#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_single_triangle(#[case] backend: Backend) {
    let Some(ctx) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    let instance = ctx.instance(ctx.mesh(triangle("triangle", Vec3::ZERO)));
    let renderer = ctx.renderer();

    assert!(ctx.draw(&renderer, &[instance]));

    let stats = renderer.frame_stats();
    assert_eq!(stats.blas_builds, 1);
    assert_eq!(stats.tlas_builds, 1);
    assert_eq!(stats.ray_dispatches, 1);
    let texels = decode_r32(&renderer.output_bytes().unwrap());
    assert!(texels.iter().all(|t| t.is_finite()));

    let mut buffer = vec![0u8; (TARGET_SIZE * TARGET_SIZE * 4) as usize];
    assert_eq!(renderer.read_output(&mut buffer).unwrap(), buffer.len());
    assert!(renderer.read_output(&mut [0u8; 4]).is_err());
}

// ============================================================================
// Rebuild Tests
// ============================================================================

/// An unchanged static scene builds its structures once.
#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_static_scene_rebuild_minimality(#[case] backend: Backend) {
    let Some(ctx) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    let instances: Vec<_> = (0..3)
        .map(|i| {
            let center = Vec3::new(i as f32 * 3.0, 0.0, 0.0);
            ctx.instance(ctx.mesh(triangle(&format!("mesh {i}"), center)))
        })
        .collect();
    let renderer = ctx.renderer();

    assert!(ctx.draw(&renderer, &instances));
    let first = renderer.frame_stats();
    assert_eq!(first.blas_builds, 3);
    assert_eq!(first.tlas_builds, 1);

    for _ in 0..4 {
        assert!(ctx.draw(&renderer, &instances));
        let stats = renderer.frame_stats();
        assert_eq!(stats.blas_builds, 0);
        assert_eq!(stats.blas_updates, 0);
        assert_eq!(stats.tlas_builds, 0);
        assert_eq!(stats.ray_dispatches, 1);
    }
    assert_eq!(ctx.context.stats().blas_builds, 3);
    assert_eq!(renderer.tlas_builds(), 1);
}

/// Two renderers drawing instances of one mesh in the same frame share its
/// bottom-level structure.
#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_shared_mesh_builds_once(#[case] backend: Backend) {
    let Some(ctx) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    let mesh = ctx.mesh(triangle("shared", Vec3::ZERO));
    let a = ctx.instance(mesh);
    let b = ctx.instance(mesh);
    let first = ctx.renderer();
    let second = ctx.renderer();

    ctx.context.frame_begin();
    assert!(ctx.record(&first, &[a]));
    assert!(ctx.record(&second, &[a, b]));
    ctx.context.frame_end();

    assert_eq!(ctx.context.stats().blas_builds, 1);
    assert_eq!(first.tlas_builds(), 1);
    assert_eq!(second.tlas_builds(), 1);
    assert!(ctx.cache(|c| c.has_mesh_blas(mesh)));
    if let Some(soft) = ctx.software() {
        assert_eq!(soft.accel_stats().live_bottom, 1);
        assert_eq!(soft.accel_stats().live_top, 2);
    }
}

/// The top-level structure is rebuilt when the instance list changes by
/// order or membership, or an instance moves, and never otherwise.
#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_tlas_dirtiness(#[case] backend: Backend) {
    let Some(ctx) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    let mesh = ctx.mesh(triangle("triangle", Vec3::ZERO));
    let a = ctx.instance(mesh);
    let b = ctx.instance(mesh);
    let c = ctx.instance(mesh);
    let renderer = ctx.renderer();

    let frame = |instances: &[InstanceId]| {
        assert!(ctx.draw(&renderer, instances));
        renderer.frame_stats()
    };

    assert_eq!(frame(&[a, b]).tlas_builds, 1);
    assert_eq!(frame(&[a, b]).tlas_builds, 0, "same list");
    assert_eq!(frame(&[b, a]).tlas_builds, 1, "reordered");
    assert_eq!(frame(&[b, a, c]).tlas_builds, 1, "added");

    ctx.scene
        .set_transform(a, Mat4::from_translation(Vec3::X))
        .unwrap();
    let moved = frame(&[b, a, c]);
    assert_eq!(moved.tlas_builds, 1, "moved");
    assert_eq!(moved.blas_builds, 0, "moving never rebuilds geometry");

    ctx.scene
        .set_instance_flags(c, InstanceFlags::CAST_SHADOWS)
        .unwrap();
    assert_eq!(frame(&[b, a, c]).tlas_builds, 1, "flags changed");
    assert_eq!(frame(&[b, a, c]).tlas_builds, 0, "settled");
}

/// With the force flag every structure is rebuilt every frame.
#[test]
fn test_force_update_rebuilds_everything() {
    let ctx = software();
    let static_instance = ctx.instance(ctx.mesh(triangle("static", Vec3::ZERO)));
    let deformed = ctx.instance(ctx.mesh(blendshape_triangle("deformed")));
    let renderer = ctx.renderer();
    renderer.set_render_flags(RenderFlags::DEFAULT | RenderFlags::DBG_FORCE_UPDATE_AS);

    assert!(ctx.draw(&renderer, &[static_instance, deformed]));
    for _ in 0..2 {
        assert!(ctx.draw(&renderer, &[static_instance, deformed]));
        let stats = renderer.frame_stats();
        assert_eq!(stats.blas_builds, 1);
        assert_eq!(stats.blas_updates, 1);
        assert_eq!(stats.deform_dispatches, 1);
        assert_eq!(stats.tlas_builds, 1);
    }
}

// ============================================================================
// Ordering Tests
// ============================================================================

/// Every frame's stage chain is non-decreasing, starts after the previous
/// frame's output, and every cross-queue wait targets an earlier value.
#[test]
fn test_fence_monotonicity() {
    let ctx = software();
    let static_instance = ctx.instance(ctx.mesh(triangle("static", Vec3::ZERO)));
    let deformed = ctx.instance(ctx.mesh(blendshape_triangle("deformed")));
    let renderer = ctx.renderer();

    let mut previous = renderer.stage_fences();
    for weight in [0.0, 50.0, 100.0] {
        ctx.scene
            .set_blendshape_weights(deformed, &[weight])
            .unwrap();
        assert!(ctx.draw(&renderer, &[static_instance, deformed]));
        let fences = renderer.stage_fences();
        assert!(fences.is_monotonic(), "{fences:?}");
        assert!(fences.translate >= previous.output);
        assert!(fences.rays > previous.rays);
        previous = fences;
    }

    let executed = ctx.software().unwrap().executed();
    assert!(!executed.is_empty());
    for submission in &executed {
        if let Some(wait) = submission.wait {
            assert!(wait.value < submission.signal, "{submission:?}");
        }
    }
    assert!(executed.iter().any(|s| s.queue == QueueKind::Compute));
    assert!(executed.iter().any(|s| s.commands.contains(&"dispatch_rays")));
}

/// A frame whose predecessor is still executing is skipped, not blocked on.
#[test]
fn test_frame_skipped_while_in_flight() {
    let ctx = software();
    let instance = ctx.instance(ctx.mesh(triangle("triangle", Vec3::ZERO)));
    let renderer = ctx.renderer();
    let soft = ctx.software().unwrap();

    soft.set_queue_paused(QueueKind::Direct, true);
    assert!(ctx.draw(&renderer, &[instance]));
    assert!(soft.pending_submissions(QueueKind::Direct) > 0);

    assert!(!ctx.draw(&renderer, &[instance]));
    assert_eq!(renderer.skipped_frames(), 1);
    assert!(ctx.context.is_valid());

    soft.set_queue_paused(QueueKind::Direct, false);
    assert_eq!(soft.pending_submissions(QueueKind::Direct), 0);
    assert!(ctx.draw(&renderer, &[instance]));
    assert_eq!(renderer.skipped_frames(), 1);
}

// ============================================================================
// Deformation Tests
// ============================================================================

/// Identical inputs deform to identical bytes on independent contexts.
#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_deformation_determinism(#[case] backend: Backend) {
    let run = || {
        let ctx = TestContext::new(backend)?;
        let instance = ctx.instance(ctx.mesh(blendshape_triangle("lift")));
        ctx.scene.set_blendshape_weights(instance, &[50.0]).unwrap();
        let renderer = ctx.renderer();
        assert!(ctx.draw(&renderer, &[instance]));
        Some(ctx.deformed_positions(instance))
    };
    let (Some(a), Some(b)) = (run(), run()) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    assert_eq!(a, b);
    assert_eq!(a.len(), 3);
    assert_eq!(a[0], [-1.0, 0.5, -1.0, 1.0]);
    assert_eq!(a[2], [0.0, 0.5, 1.0, 1.0]);
}

/// Moving a blendshape weight from 0 to 100 changes the deformed vertices
/// and refits the instance's structure instead of rebuilding it.
#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_blendshape_weight_refits(#[case] backend: Backend) {
    let Some(ctx) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    let instance = ctx.instance(ctx.mesh(blendshape_triangle("lift")));
    let renderer = ctx.renderer();

    ctx.scene.set_blendshape_weights(instance, &[0.0]).unwrap();
    assert!(ctx.draw(&renderer, &[instance]));
    let first = renderer.frame_stats();
    assert_eq!(first.deform_dispatches, 1);
    assert_eq!(first.blas_builds, 1);
    let rest = ctx.deformed_positions(instance);

    ctx.scene.set_blendshape_weights(instance, &[100.0]).unwrap();
    assert!(ctx.draw(&renderer, &[instance]));
    let second = renderer.frame_stats();
    assert_eq!(second.deform_dispatches, 1);
    assert_eq!(second.blas_builds, 0);
    assert_eq!(second.blas_updates, 1);
    assert_eq!(second.tlas_builds, 1);
    let lifted = ctx.deformed_positions(instance);

    assert_ne!(rest, lifted);
    for (r, l) in rest.iter().zip(&lifted) {
        assert_eq!(l[1] - r[1], 1.0);
    }

    assert!(ctx.draw(&renderer, &[instance]));
    let idle = renderer.frame_stats();
    assert_eq!(idle.deform_dispatches, 0);
    assert_eq!(idle.blas_updates, 0);
    assert_eq!(idle.tlas_builds, 0);
}

/// Without GPU skinning a deformable mesh is traced in its rest pose.
#[test]
fn test_gpu_skinning_disabled_uses_rest_pose() {
    let ctx = software();
    let instance = ctx.instance(ctx.mesh(blendshape_triangle("lift")));
    ctx.scene.set_blendshape_weights(instance, &[100.0]).unwrap();
    let renderer = ctx.renderer();
    renderer.set_render_flags(RenderFlags::DEFAULT - RenderFlags::GPU_SKINNING);

    assert!(ctx.draw(&renderer, &[instance]));
    let stats = renderer.frame_stats();
    assert_eq!(stats.deform_dispatches, 0);
    assert_eq!(stats.blas_builds, 1);
    assert!(ctx.cache(|c| c.deformed_vertices(instance)).is_none());
}

/// A renderer without GPU skinning that draws a posed instance first in the
/// frame does not hide the pose change from a skinning renderer after it.
#[rstest]
#[case::software(Backend::Software)]
#[case::vulkan(Backend::Vulkan)]
fn test_mixed_skinning_renderers_share_pose(#[case] backend: Backend) {
    let Some(ctx) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    let instance = ctx.instance(ctx.mesh(blendshape_triangle("lift")));
    let plain = ctx.renderer();
    plain.set_render_flags(RenderFlags::DEFAULT - RenderFlags::GPU_SKINNING);
    let skinned = ctx.renderer();

    ctx.scene.set_blendshape_weights(instance, &[0.0]).unwrap();
    ctx.context.frame_begin();
    assert!(ctx.record(&plain, &[instance]));
    assert!(ctx.record(&skinned, &[instance]));
    ctx.context.frame_end();
    let rest = ctx.deformed_positions(instance);

    ctx.scene.set_blendshape_weights(instance, &[100.0]).unwrap();
    ctx.context.frame_begin();
    assert!(ctx.record(&plain, &[instance]));
    assert!(ctx.record(&skinned, &[instance]));
    ctx.context.frame_end();

    assert_eq!(plain.frame_stats().deform_dispatches, 0);
    let stats = skinned.frame_stats();
    assert_eq!(stats.deform_dispatches, 1);
    assert_eq!(stats.blas_updates, 1);
    assert_eq!(stats.tlas_builds, 1);
    let lifted = ctx.deformed_positions(instance);
    for (r, l) in rest.iter().zip(&lifted) {
        assert_eq!(l[1] - r[1], 1.0);
    }
}

/// A pose change made while GPU skinning was off is applied once skinning
/// is turned back on.
#[test]
fn test_reenabled_skinning_catches_up() {
    let ctx = software();
    let instance = ctx.instance(ctx.mesh(blendshape_triangle("lift")));
    let renderer = ctx.renderer();

    ctx.scene.set_blendshape_weights(instance, &[0.0]).unwrap();
    assert!(ctx.draw(&renderer, &[instance]));
    let rest = ctx.deformed_positions(instance);

    renderer.set_render_flags(RenderFlags::DEFAULT - RenderFlags::GPU_SKINNING);
    ctx.scene.set_blendshape_weights(instance, &[100.0]).unwrap();
    assert!(ctx.draw(&renderer, &[instance]));
    assert_eq!(renderer.frame_stats().deform_dispatches, 0);

    renderer.set_render_flags(RenderFlags::DEFAULT);
    assert!(ctx.draw(&renderer, &[instance]));
    let stats = renderer.frame_stats();
    assert_eq!(stats.deform_dispatches, 1);
    assert_eq!(stats.blas_updates, 1);
    assert_eq!(stats.tlas_builds, 1);
    let lifted = ctx.deformed_positions(instance);
    for (r, l) in rest.iter().zip(&lifted) {
        assert_eq!(l[1] - r[1], 1.0);
    }

    assert!(ctx.draw(&renderer, &[instance]));
    assert_eq!(renderer.frame_stats().deform_dispatches, 0);
}

/// Toggling blendshape weight clamping redeforms an unchanged pose.
#[test]
fn test_clamp_toggle_redeforms() {
    let ctx = software();
    let instance = ctx.instance(ctx.mesh(blendshape_triangle("lift")));
    ctx.scene.set_blendshape_weights(instance, &[150.0]).unwrap();
    let renderer = ctx.renderer();

    renderer.set_render_flags(RenderFlags::DEFAULT | RenderFlags::CLAMP_BLENDSHAPE_WEIGHTS);
    assert!(ctx.draw(&renderer, &[instance]));
    let clamped = ctx.deformed_positions(instance);
    assert_eq!(clamped[0][1], 1.0);

    assert!(ctx.draw(&renderer, &[instance]));
    assert_eq!(renderer.frame_stats().deform_dispatches, 0);

    renderer.set_render_flags(RenderFlags::DEFAULT);
    assert!(ctx.draw(&renderer, &[instance]));
    let stats = renderer.frame_stats();
    assert_eq!(stats.deform_dispatches, 1);
    assert_eq!(stats.blas_updates, 1);
    let unclamped = ctx.deformed_positions(instance);
    assert_eq!(unclamped[0][1], 1.5);
}

// ============================================================================
// Lifetime Tests
// ============================================================================

/// Cache entries disappear at the frame boundary after the scene releases
/// the last reference, and not before.
#[test]
fn test_cache_follows_scene_references() {
    let ctx = software();
    let mesh = ctx.mesh(triangle("triangle", Vec3::ZERO));
    let instance = ctx.instance(mesh);
    let renderer = ctx.renderer();

    assert!(ctx.draw(&renderer, &[instance]));
    assert!(ctx.cache(|c| c.contains_instance(instance)));
    assert!(ctx.cache(|c| c.contains_mesh(mesh)));

    ctx.scene.retain_instance(instance).unwrap();
    ctx.scene.release_instance(instance).unwrap();
    assert!(ctx.draw(&renderer, &[instance]));
    assert!(ctx.cache(|c| c.contains_instance(instance)), "still referenced");

    ctx.scene.release_instance(instance).unwrap();
    // The entry survives until the next frame boundary.
    assert!(ctx.cache(|c| c.contains_instance(instance)));
    assert!(ctx.draw(&renderer, &[]));
    assert!(!ctx.cache(|c| c.contains_instance(instance)));
    assert!(ctx.cache(|c| c.contains_mesh(mesh)), "the host still holds the mesh");

    ctx.scene.release_mesh(mesh).unwrap();
    assert!(ctx.draw(&renderer, &[]));
    assert_eq!(ctx.cache(|c| c.mesh_count()), 0);
    assert_eq!(ctx.cache(|c| c.instance_count()), 0);
}

/// Clearing the context drops every cached structure; the next frame
/// rebuilds them under a new generation.
#[test]
fn test_clear_rebuilds() {
    let ctx = software();
    let instance = ctx.instance(ctx.mesh(triangle("triangle", Vec3::ZERO)));
    let renderer = ctx.renderer();
    assert!(ctx.draw(&renderer, &[instance]));

    ctx.context.clear();
    assert!(ctx.context.is_valid());
    assert_eq!(ctx.context.generation(), 1);
    assert_eq!(ctx.cache(|c| c.mesh_count()), 0);

    assert!(ctx.draw(&renderer, &[instance]));
    let stats = renderer.frame_stats();
    assert_eq!(stats.blas_builds, 1);
    assert_eq!(stats.tlas_builds, 1);
    assert_eq!(renderer.tlas_builds(), 1);
}

// ============================================================================
// Host Resource Tests
// ============================================================================

fn host_triangle(host: &HostResources, y: f32) -> (MeshDescriptor, HostBuffer) {
    let positions: Vec<u8> = [[-1.0, y, -1.0], [1.0, y, -1.0], [0.0, y, 1.0f32]]
        .iter()
        .flatten()
        .flat_map(|v: &f32| v.to_le_bytes())
        .collect();
    let indices: Vec<u8> = [0u32, 1, 2].iter().flat_map(|i| i.to_le_bytes()).collect();
    let vertices = host.create_buffer(positions);
    let index_buffer = host.create_buffer(indices);
    let descriptor = MeshDescriptor {
        source: VertexSource::Host {
            vertices,
            indices: index_buffer,
        },
        ..triangle("host triangle", Vec3::ZERO)
    };
    (descriptor, vertices)
}

/// A host write into a translated vertex buffer rebuilds the mesh's
/// structure at the next frame.
#[test]
fn test_host_buffer_update_rebuilds() {
    let ctx = software();
    let (descriptor, vertices) = host_triangle(&ctx.host, 0.0);
    let instance = ctx.instance(ctx.mesh(descriptor));
    let renderer = ctx.renderer();

    assert!(ctx.draw(&renderer, &[instance]));
    assert_eq!(renderer.frame_stats().blas_builds, 1);
    assert_eq!(ctx.cache(|c| c.buffer_count()), 2);

    let lifted: Vec<u8> = [[-1.0, 1.0, -1.0], [1.0, 1.0, -1.0], [0.0, 1.0, 1.0f32]]
        .iter()
        .flatten()
        .flat_map(|v: &f32| v.to_le_bytes())
        .collect();
    assert!(ctx.host.update_buffer(vertices, lifted));

    assert!(ctx.draw(&renderer, &[instance]));
    let stats = renderer.frame_stats();
    assert_eq!(stats.blas_builds, 1);
    assert_eq!(stats.tlas_builds, 1);

    assert!(ctx.draw(&renderer, &[instance]));
    assert_eq!(renderer.frame_stats().blas_builds, 0);
}

/// A renderer with a host texture target publishes its output there.
#[test]
fn test_host_texture_publish() {
    let ctx = software();
    let ground = ctx.instance(ctx.mesh(quad("ground", 10.0, 0.0)));
    let caster = ctx.instance(ctx.mesh(quad("caster", 3.0, 2.0)));
    let texture = ctx
        .host
        .create_texture(TARGET_SIZE, TARGET_SIZE, RenderTargetFormat::Rf32);
    let renderer = ctx.context.create_renderer();
    renderer
        .set_render_target(TARGET_SIZE, TARGET_SIZE, RenderTargetFormat::Rf32, Some(texture))
        .unwrap();
    renderer.set_render_flags(unculled_flags());

    assert!(ctx.draw(&renderer, &[ground, caster]));

    let published = ctx.host.texture_data(texture).unwrap();
    assert_eq!(published, renderer.output_bytes().unwrap());
    assert!(decode_r32(&published).contains(&1.0));
    assert_eq!(ctx.cache(|c| c.texture_count()), 1);
}

/// A host texture of the wrong size is reported and the context survives.
#[test]
fn test_host_texture_size_mismatch() {
    let ctx = software();
    let instance = ctx.instance(ctx.mesh(triangle("triangle", Vec3::ZERO)));
    let texture = ctx.host.create_texture(4, 4, RenderTargetFormat::Rf32);
    let renderer = ctx.context.create_renderer();
    renderer
        .set_render_target(TARGET_SIZE, TARGET_SIZE, RenderTargetFormat::Rf32, Some(texture))
        .unwrap();

    ctx.context.frame_begin();
    assert!(renderer.begin_scene());
    renderer.add_instance(instance);
    renderer.end_scene();
    assert!(renderer.render().unwrap());
    assert!(matches!(
        renderer.finish(),
        Err(RaytraceError::InvalidParameter(_))
    ));
    ctx.context.frame_end();

    assert!(ctx.context.is_valid());
    assert!(ctx.context.last_error().contains("host texture"));
}

// ============================================================================
// Diagnostics Tests
// ============================================================================

/// With timestamps enabled, the finished frame reports per-stage timings.
#[test]
fn test_timestamp_log() {
    let ctx = software();
    let instance = ctx.instance(ctx.mesh(blendshape_triangle("lift")));
    let renderer = ctx.renderer();
    renderer.set_render_flags(RenderFlags::DEFAULT | RenderFlags::DBG_TIMESTAMP);

    assert!(ctx.draw(&renderer, &[instance]));
    let log = renderer.timestamp_log();
    for stage in ["deform: ", "blas: ", "tlas: ", "rays: "] {
        assert!(log.contains(stage), "{stage} missing from {log}");
    }

    // Stages without work are not timed.
    assert!(ctx.draw(&renderer, &[instance]));
    let log = renderer.timestamp_log();
    assert!(log.contains("rays: "));
    assert!(!log.contains("blas: "));
}

/// Cumulative counters add up the per-frame counters.
#[test]
fn test_context_stats() {
    let ctx = software();
    let instance = ctx.instance(ctx.mesh(triangle("triangle", Vec3::ZERO)));
    let renderer = ctx.renderer();
    for _ in 0..3 {
        assert!(ctx.draw(&renderer, &[instance]));
    }
    let stats = ctx.context.stats();
    assert_eq!(stats.blas_builds, 1);
    assert_eq!(stats.tlas_builds, 1);
    assert_eq!(stats.ray_dispatches, 3);
}

// ============================================================================
// Failure Tests
// ============================================================================

/// A device without ray tracing yields an invalid context whose renderers
/// do nothing.
#[test]
fn test_init_failure_without_ray_tracing() {
    let backend = Arc::new(SoftwareBackend::with_capabilities(DeviceCapabilities {
        device_name: "No Ray Tracing".to_string(),
        ray_tracing: false,
        ..DeviceCapabilities::default()
    }));
    let host = Arc::new(HostResources::new());
    let context = ShadowContext::with_backend(
        ContextConfig::new(),
        backend,
        Arc::new(hardshadow_core::Scene::new()),
        Arc::new(UploadTranslator::new(host)),
    );
    assert!(!context.is_valid());
    assert!(context.last_error().contains("not supported"));

    let renderer = context.create_renderer();
    context.frame_begin();
    assert!(!renderer.begin_scene());
    renderer.end_scene();
    assert!(!renderer.render().unwrap());
    context.frame_end();
    assert_eq!(context.render_all(), 0);
}

/// A fence wait that exceeds its budget invalidates the context.
#[test]
fn test_fence_timeout_invalidates() {
    let ctx = TestContext::with_config(Backend::Software, short_timeout_config()).unwrap();
    let instance = ctx.instance(ctx.mesh(triangle("triangle", Vec3::ZERO)));
    let renderer = ctx.renderer();
    let soft = ctx.software().unwrap();

    soft.set_queue_paused(QueueKind::Direct, true);
    assert!(ctx.draw(&renderer, &[instance]));
    assert!(matches!(
        renderer.output_bytes(),
        Err(RaytraceError::Timeout(..))
    ));
    assert!(!ctx.context.is_valid());
    assert!(ctx.context.last_error().contains("timed out"));
    assert_eq!(ctx.context.generation(), 1);

    soft.set_queue_paused(QueueKind::Direct, false);
    ctx.context.frame_begin();
    assert!(!renderer.begin_scene());
    ctx.context.frame_end();
}

/// A lost device is detected at the frame boundary and tears the context down.
#[test]
fn test_device_lost() {
    let ctx = software();
    let instance = ctx.instance(ctx.mesh(triangle("triangle", Vec3::ZERO)));
    let renderer = ctx.renderer();
    assert!(ctx.draw(&renderer, &[instance]));

    ctx.software().unwrap().simulate_device_lost();
    ctx.context.frame_end();

    assert!(!ctx.context.is_valid());
    assert_eq!(ctx.context.last_error(), RaytraceError::DeviceLost.to_string());
    assert!(ctx.context.backend().is_none());
    assert!(ctx.context.with_cache(|c| c.mesh_count()).is_none());
    assert!(!ctx.draw(&renderer, &[instance]));
}

/// An instance whose geometry cannot be allocated is skipped for the frame;
/// the rest of the scene still renders and the context stays valid.
#[test]
fn test_allocation_failure_skips_instance() {
    let config = ContextConfig::new()
        .with_min_tlas_instances(16)
        .with_min_scratch_size(4096)
        .with_min_tlas_size(4096);
    let ctx = TestContext::with_config(Backend::Software, config).unwrap();
    let small = ctx.instance(ctx.mesh(triangle("small", Vec3::ZERO)));
    let positions: Vec<Vec3> = (0..8192).map(|i| Vec3::new(i as f32, 0.0, 0.0)).collect();
    let large = ctx.instance(ctx.mesh(MeshDescriptor::from_positions(
        "large",
        &positions,
        &[0, 1, 2],
    )));
    let renderer = ctx.renderer();

    ctx.software().unwrap().set_allocation_limit(Some(64 * 1024));
    assert!(ctx.draw(&renderer, &[small, large]));
    let stats = renderer.frame_stats();
    assert_eq!(stats.skipped_instances, 1);
    assert_eq!(stats.blas_builds, 1);
    assert!(ctx.context.is_valid());
    assert!(ctx.cache(|c| c.contains_instance(small)));
    assert!(!ctx.cache(|c| c.contains_instance(large)));

    ctx.software().unwrap().set_allocation_limit(None);
    assert!(ctx.draw(&renderer, &[small, large]));
    let stats = renderer.frame_stats();
    assert_eq!(stats.skipped_instances, 0);
    assert_eq!(stats.blas_builds, 1);
    assert_eq!(stats.tlas_builds, 1);
}
