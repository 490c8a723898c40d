//! # Shadow Demo
//!
//! Demonstrates:
//! - Explicit context and renderer ownership
//! - Skinned, blendshape and static casters in one scene
//! - Adaptive sampling and antialiasing render flags
//! - Per-stage GPU timestamps
//!
//! Renders an animated scene headlessly and writes each frame's shadow mask
//! as a grayscale PNG.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use glam::Vec3;

use hardshadow_core::{LayerMask, RenderFlags, Scene};
use hardshadow_demos::{DemoScene, demo_camera, write_mask_png};
use hardshadow_raytrace::{
    BackendKind, ContextConfig, HostResources, RenderTargetFormat, ShadowContext, UploadTranslator,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CliBackend {
    /// Vulkan when available, otherwise software.
    Auto,
    /// CPU emulation of the ray tracing device.
    Software,
    /// Native Vulkan ray tracing.
    Vulkan,
}

impl From<CliBackend> for BackendKind {
    fn from(backend: CliBackend) -> Self {
        match backend {
            CliBackend::Auto => BackendKind::Auto,
            CliBackend::Software => BackendKind::Software,
            CliBackend::Vulkan => BackendKind::Vulkan,
        }
    }
}

/// Hardshadow headless shadow mask renderer.
#[derive(Parser, Debug)]
#[command(name = "shadow_demo", version)]
struct Args {
    /// Ray tracing backend to use.
    #[arg(long, default_value = "auto", value_enum)]
    backend: CliBackend,

    /// Render target width in pixels.
    #[arg(long, default_value = "256")]
    width: u32,

    /// Render target height in pixels.
    #[arg(long, default_value = "144")]
    height: u32,

    /// Number of frames to render.
    #[arg(long, default_value = "4")]
    frames: u32,

    /// Seconds of animation between two frames.
    #[arg(long, default_value = "0.25")]
    step: f32,

    /// Directory the PNG masks are written to.
    #[arg(long, default_value = "shadow_masks")]
    output: PathBuf,

    /// Trace at half resolution first and refine only shadow edges.
    #[arg(long)]
    adaptive: bool,

    /// Supersample shadow edges.
    #[arg(long)]
    antialias: bool,

    /// Log per-stage GPU timings.
    #[arg(long)]
    timestamps: bool,

    /// Enable API validation layers on GPU backends.
    #[arg(long)]
    validation: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    log::info!("Hardshadow shadow demo v{}", hardshadow_demos::VERSION);

    let host = Arc::new(HostResources::new());
    let scene = Arc::new(Scene::new());
    let translator = Arc::new(UploadTranslator::new(Arc::clone(&host)));
    let config = ContextConfig::new()
        .with_backend(args.backend.into())
        .with_validation(args.validation);
    let context = ShadowContext::try_new(config, Arc::clone(&scene), translator)?;
    log::info!(
        "Context ready on the {} backend",
        context.backend().map(|b| b.name()).unwrap_or("unknown")
    );

    let demo = DemoScene::build(&scene)?;
    let renderer = context.create_renderer();
    renderer.set_render_target(args.width, args.height, RenderTargetFormat::Rf32, None)?;

    let mut flags = RenderFlags::DEFAULT - RenderFlags::CULL_BACK_FACES;
    if args.adaptive {
        flags |= RenderFlags::ADAPTIVE_SAMPLING;
    }
    if args.antialias {
        flags |= RenderFlags::ANTIALIASING;
    }
    if args.timestamps {
        flags |= RenderFlags::DBG_TIMESTAMP;
    }
    renderer.set_render_flags(flags);

    std::fs::create_dir_all(&args.output)?;
    let aspect = args.width as f32 / args.height.max(1) as f32;
    let sun = Vec3::new(-0.4, -1.0, -0.3).normalize();

    for frame in 0..args.frames {
        demo.animate(&scene, frame as f32 * args.step)?;

        context.frame_begin();
        if renderer.begin_scene() {
            renderer.set_camera(demo_camera(aspect));
            renderer.add_directional_light(sun, LayerMask::ALL)?;
            for instance in demo.instances() {
                renderer.add_instance(instance);
            }
            renderer.end_scene();
            renderer.render()?;
            renderer.finish()?;
        } else {
            log::warn!("Frame {frame} skipped: {}", context.last_error());
        }
        context.frame_end();

        if !context.is_valid() {
            return Err(format!("context lost: {}", context.last_error()).into());
        }

        let bytes = renderer.output_bytes()?;
        let shade: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let shadowed = shade.iter().filter(|&&s| s > 0.0).count();
        let path = args.output.join(format!("frame_{frame:03}.png"));
        write_mask_png(&path, args.width, args.height, &shade)?;
        log::info!(
            "Frame {frame}: {shadowed} shadowed pixels, written to {}",
            path.display()
        );

        if args.timestamps {
            for line in renderer.timestamp_log().lines() {
                log::info!("  {line}");
            }
        }
    }

    let stats = context.stats();
    log::info!("Pipeline stats: {stats:?}");
    Ok(())
}
