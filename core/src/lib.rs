//! # Hardshadow Core
//!
//! Scene description types for the Hardshadow ray traced shadow pipeline:
//! meshes, instances, lights, the camera, layer masks and the shared scene
//! registry the host mutates between frames.

pub mod error;
pub mod flags;
pub mod layer;
pub mod math;
pub mod resource;
pub mod scene;

pub use error::SceneError;
pub use flags::{InstanceFlags, RenderFlags, UpdateFlags};
pub use layer::{LayerMask, LayerTable, MAX_LAYERS};
pub use resource::{HostBuffer, HostTexture, IndexFormat};
pub use scene::{
    Blendshape, BlendshapeFrame, BoneWeight, Camera, InstanceId, InstanceSnapshot, Light,
    LightKind, MAX_LIGHTS, MeshDescriptor, MeshId, MeshInstance, Scene, SceneEvent, SkinData,
    VertexSource,
};

/// Core library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
