//! Records shared with GPU programs.
//!
//! Every struct here is `#[repr(C)]` and [`Pod`] so it can be uploaded as raw
//! bytes. Field order and padding mirror the program-side declarations.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use hardshadow_core::MAX_LIGHTS;

/// Camera block of [`SceneConstants`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraData {
    pub view: [[f32; 4]; 4],
    pub projection: [[f32; 4]; 4],
    pub position: [f32; 4],
    pub near: f32,
    pub far: f32,
    pub layer_mask: u32,
    pub _pad: u32,
}

/// One light of [`SceneConstants`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LightData {
    /// 1 directional, 2 spot, 3 point, 4 reverse point.
    pub light_type: u32,
    pub layer_mask: u32,
    pub range: f32,
    /// Full cone angle in radians.
    pub spot_angle: f32,
    pub position: [f32; 3],
    pub _pad0: u32,
    pub direction: [f32; 3],
    pub _pad1: u32,
}

/// Per-renderer constants read by every ray program.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SceneConstants {
    pub camera: CameraData,
    pub render_flags: u32,
    pub light_count: u32,
    pub shadow_ray_offset: f32,
    pub self_shadow_threshold: f32,
    pub lights: [LightData; MAX_LIGHTS],
}

const_assert_eq!(std::mem::size_of::<CameraData>(), 160);
const_assert_eq!(std::mem::size_of::<LightData>(), 48);
const_assert_eq!(
    std::mem::size_of::<SceneConstants>(),
    160 + 16 + 48 * MAX_LIGHTS
);

/// Auxiliary per-instance record, indexed by the instance's custom index.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct InstanceData {
    pub instance_flags: u32,
    pub layer_mask: u32,
}

bitflags! {
    /// Which deformations the compute pass applies to a mesh.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeformFlags: u32 {
        const BLENDSHAPE = 1;
        const SKINNING = 2;
    }
}

/// Mesh-invariant parameters of the deformation pass.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct DeformMeshInfo {
    pub vertex_count: u32,
    /// Source vertex stride in 32-bit words.
    pub vertex_stride: u32,
    /// Offset of the first source vertex in 32-bit words.
    pub vertex_offset: u32,
    pub deform_flags: u32,
    pub blendshape_count: u32,
    pub _pad: [u32; 3],
}

/// One blendshape frame: where its deltas start and its normalized weight.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BlendshapeFrameInfo {
    pub delta_offset: u32,
    /// Authored weight divided by 100.
    pub weight: f32,
}

/// One blendshape channel: its range in the frame table.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct BlendshapeInfo {
    pub frame_count: u32,
    pub frame_offset: u32,
}

/// Bone influences of one vertex: a range in the weight table.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct BoneCount {
    pub weight_count: u32,
    pub weight_offset: u32,
}

/// One weighted bone influence.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BoneWeightData {
    pub weight: f32,
    pub index: u32,
}
