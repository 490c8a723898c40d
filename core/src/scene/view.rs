//! Camera and light descriptions.

use glam::{Mat4, Vec3};

use crate::layer::LayerMask;
use crate::math::projection_near_far;

/// Maximum number of lights one renderer accepts per frame.
pub const MAX_LIGHTS: usize = 32;

/// The viewpoint camera rays are generated from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub view: Mat4,
    pub projection: Mat4,
    pub near: f32,
    pub far: f32,
    pub layer_mask: LayerMask,
}

impl Camera {
    /// Creates a camera, deriving the clip planes from an OpenGL-convention
    /// perspective projection. Projections without finite planes fall back to
    /// `[0.01, f32::MAX]`.
    pub fn new(position: Vec3, view: Mat4, projection: Mat4, layer_mask: LayerMask) -> Self {
        let (near, far) = projection_near_far(&projection).unwrap_or((0.01, f32::MAX));
        Self {
            position,
            view,
            projection,
            near,
            far,
            layer_mask,
        }
    }

    /// Camera looking from `eye` at `target` with a vertical field of view in radians.
    pub fn look_at(eye: Vec3, target: Vec3, fov_y: f32, aspect: f32, near: f32, far: f32) -> Self {
        let view = Mat4::look_at_rh(eye, target, Vec3::Y);
        let projection = Mat4::perspective_rh_gl(fov_y, aspect, near, far);
        Self::new(eye, view, projection, LayerMask::ALL)
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, 1.0, 1.0, 0.1, 100.0)
    }
}

/// Shape of a light.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LightKind {
    Directional {
        direction: Vec3,
    },
    Spot {
        position: Vec3,
        direction: Vec3,
        range: f32,
        /// Full cone angle in radians.
        spot_angle: f32,
    },
    Point {
        position: Vec3,
        range: f32,
    },
    /// Casts shadows away from the light position rather than toward it.
    ReversePoint {
        position: Vec3,
        range: f32,
    },
}

impl LightKind {
    /// Numeric tag shared with ray programs.
    pub fn type_id(&self) -> u32 {
        match self {
            Self::Directional { .. } => 1,
            Self::Spot { .. } => 2,
            Self::Point { .. } => 3,
            Self::ReversePoint { .. } => 4,
        }
    }
}

/// A shadow casting light.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Light {
    pub kind: LightKind,
    pub layer_mask: LayerMask,
}

impl Light {
    pub fn directional(direction: Vec3, layer_mask: LayerMask) -> Self {
        Self {
            kind: LightKind::Directional {
                direction: direction.normalize_or_zero(),
            },
            layer_mask,
        }
    }

    /// Spot light with the cone angle given in degrees.
    pub fn spot(
        position: Vec3,
        direction: Vec3,
        range: f32,
        spot_angle_degrees: f32,
        layer_mask: LayerMask,
    ) -> Self {
        Self {
            kind: LightKind::Spot {
                position,
                direction: direction.normalize_or_zero(),
                range,
                spot_angle: spot_angle_degrees.to_radians(),
            },
            layer_mask,
        }
    }

    pub fn point(position: Vec3, range: f32, layer_mask: LayerMask) -> Self {
        Self {
            kind: LightKind::Point { position, range },
            layer_mask,
        }
    }

    pub fn reverse_point(position: Vec3, range: f32, layer_mask: LayerMask) -> Self {
        Self {
            kind: LightKind::ReversePoint { position, range },
            layer_mask,
        }
    }
}
