//! # Hardshadow Demos
//!
//! Demo scenes for the Hardshadow ray traced shadow pipeline.
//!
//! ## Available Demos
//!
//! - `shadow_demo` - Renders an animated scene headlessly and writes the
//!   shadow masks as PNG images

use std::path::Path;

use glam::{Mat4, Quat, Vec3};

use hardshadow_core::{
    Blendshape, BlendshapeFrame, BoneWeight, Camera, InstanceFlags, InstanceId, MeshDescriptor,
    Scene, SceneError, SkinData,
};

/// Demos library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// A horizontal square of half extent `half` at height `y`, wound to face up.
pub fn quad(name: &str, half: f32, y: f32) -> MeshDescriptor {
    MeshDescriptor::from_positions(
        name,
        &[
            Vec3::new(-half, y, -half),
            Vec3::new(-half, y, half),
            Vec3::new(half, y, half),
            Vec3::new(half, y, -half),
        ],
        &[0, 1, 2, 0, 2, 3],
    )
}

/// A two-bone strip standing on the ground. The upper half follows bone 1.
pub fn skinned_strip(name: &str, width: f32, height: f32) -> MeshDescriptor {
    let w = width * 0.5;
    let positions = [
        Vec3::new(-w, 0.0, 0.0),
        Vec3::new(w, 0.0, 0.0),
        Vec3::new(-w, height * 0.5, 0.0),
        Vec3::new(w, height * 0.5, 0.0),
        Vec3::new(-w, height, 0.0),
        Vec3::new(w, height, 0.0),
    ];
    let indices = [0, 1, 3, 0, 3, 2, 2, 3, 5, 2, 5, 4];
    // Weights of bone 0 and bone 1 per vertex.
    let weights = [
        (1.0, 0.0),
        (1.0, 0.0),
        (0.5, 0.5),
        (0.5, 0.5),
        (0.0, 1.0),
        (0.0, 1.0),
    ];
    let skin = SkinData {
        bind_poses: vec![Mat4::IDENTITY, Mat4::from_translation(Vec3::new(0.0, -height * 0.5, 0.0))],
        bone_counts: vec![2; positions.len()],
        weights: weights
            .iter()
            .flat_map(|&(w0, w1)| {
                [
                    BoneWeight {
                        weight: w0,
                        index: 0,
                    },
                    BoneWeight {
                        weight: w1,
                        index: 1,
                    },
                ]
            })
            .collect(),
    };
    MeshDescriptor::from_positions(name, &positions, &indices).with_skin(skin)
}

/// A floating square whose single blendshape lifts it by `lift` at weight 100.
pub fn lifting_quad(name: &str, half: f32, y: f32, lift: f32) -> MeshDescriptor {
    quad(name, half, y).with_blendshape(Blendshape {
        name: "lift".to_string(),
        frames: vec![BlendshapeFrame {
            weight: 100.0,
            deltas: vec![Vec3::new(0.0, lift, 0.0); 4],
        }],
    })
}

/// Ground plane, a static caster, a skinned strip and a blendshape caster.
pub struct DemoScene {
    pub ground: InstanceId,
    pub pillar: InstanceId,
    pub strip: InstanceId,
    pub floater: InstanceId,
}

impl DemoScene {
    pub fn build(scene: &Scene) -> Result<Self, SceneError> {
        let ground_mesh = scene.create_mesh(quad("ground", 20.0, 0.0))?;
        let pillar_mesh = scene.create_mesh(quad("pillar", 1.0, 3.0))?;
        let strip_mesh = scene.create_mesh(skinned_strip("strip", 1.0, 4.0))?;
        let floater_mesh = scene.create_mesh(lifting_quad("floater", 1.5, 1.5, 2.0))?;

        let ground = scene.create_instance(ground_mesh)?;
        scene.set_instance_flags(ground, InstanceFlags::RECEIVE_SHADOWS)?;

        let pillar = scene.create_instance(pillar_mesh)?;
        scene.set_transform(pillar, Mat4::from_translation(Vec3::new(-4.0, 0.0, 0.0)))?;

        let strip = scene.create_instance(strip_mesh)?;
        scene.set_transform(strip, Mat4::from_translation(Vec3::new(0.0, 0.0, -2.0)))?;

        let floater = scene.create_instance(floater_mesh)?;
        scene.set_transform(floater, Mat4::from_translation(Vec3::new(4.0, 0.0, 0.0)))?;
        // Casts shadows without being seen by camera rays.
        scene.set_instance_flags(floater, InstanceFlags::CAST_SHADOWS | InstanceFlags::SHADOWS_ONLY)?;

        Ok(Self {
            ground,
            pillar,
            strip,
            floater,
        })
    }

    pub fn instances(&self) -> [InstanceId; 4] {
        [self.ground, self.pillar, self.strip, self.floater]
    }

    /// Poses the animated instances for time `t` in seconds.
    pub fn animate(&self, scene: &Scene, t: f32) -> Result<(), SceneError> {
        let bend = Quat::from_rotation_z((t * 1.5).sin() * 0.6);
        let upper = Mat4::from_translation(Vec3::new(0.0, 2.0, 0.0)) * Mat4::from_quat(bend);
        scene.set_bones(self.strip, &[Mat4::IDENTITY, upper])?;

        let weight = (t.sin() * 0.5 + 0.5) * 100.0;
        scene.set_blendshape_weights(self.floater, &[weight])?;

        let spin = Mat4::from_rotation_y(t * 0.5);
        scene.set_transform(
            self.pillar,
            Mat4::from_translation(Vec3::new(-4.0, 0.0, 0.0)) * spin,
        )
    }
}

/// Camera looking down at the origin from the front.
pub fn demo_camera(aspect: f32) -> Camera {
    Camera::look_at(
        Vec3::new(0.0, 8.0, 14.0),
        Vec3::ZERO,
        std::f32::consts::FRAC_PI_3,
        aspect,
        0.1,
        100.0,
    )
}

/// Writes a shade mask as an 8-bit grayscale PNG. Shadowed pixels are dark.
pub fn write_mask_png(
    path: &Path,
    width: u32,
    height: u32,
    shade: &[f32],
) -> Result<(), image::ImageError> {
    let pixels: Vec<u8> = shade
        .iter()
        .map(|s| ((1.0 - s.clamp(0.0, 1.0)) * 255.0).round() as u8)
        .collect();
    image::save_buffer(path, &pixels, width, height, image::ExtendedColorType::L8)
}
