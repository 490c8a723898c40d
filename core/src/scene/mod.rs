//! Scene description consumed by the ray tracing pipeline.
//!
//! - [`Scene`] - Reference counted registry of meshes and instances
//! - [`MeshDescriptor`] - Geometry with optional skin and blendshapes
//! - [`MeshInstance`] - Placement, pose and shadow flags of a mesh
//! - [`Camera`] / [`Light`] - View and shadow casting lights
//! - [`SceneEvent`] - Release and update notifications for device caches

mod instance;
mod mesh;
mod registry;
mod view;

pub use instance::{InstanceSnapshot, MeshInstance};
pub use mesh::{Blendshape, BlendshapeFrame, BoneWeight, MeshDescriptor, SkinData, VertexSource};
pub use registry::{Scene, SceneEvent};
pub use view::{Camera, Light, LightKind, MAX_LIGHTS};

slotmap::new_key_type! {
    /// Generation-checked identity of a registered mesh.
    pub struct MeshId;
    /// Generation-checked identity of a registered mesh instance.
    pub struct InstanceId;
}
