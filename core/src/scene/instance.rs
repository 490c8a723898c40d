//! Mesh instance descriptors.

use std::sync::Arc;

use glam::Mat4;

use super::MeshId;
use super::mesh::MeshDescriptor;
use crate::flags::{InstanceFlags, UpdateFlags};
use crate::layer::LayerMask;

/// A placement of a mesh in the scene.
///
/// Setters record what changed in [`update_flags`](Self::update_flags); the
/// pipeline clears them once it has consumed the change.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshInstance {
    pub(crate) mesh: MeshId,
    pub(crate) transform: Mat4,
    pub(crate) bones: Vec<Mat4>,
    pub(crate) blendshape_weights: Vec<f32>,
    pub(crate) flags: InstanceFlags,
    pub(crate) layer: u32,
    pub(crate) update_flags: UpdateFlags,
}

impl MeshInstance {
    pub(crate) fn new(mesh: MeshId) -> Self {
        Self {
            mesh,
            transform: Mat4::IDENTITY,
            bones: Vec::new(),
            blendshape_weights: Vec::new(),
            flags: InstanceFlags::DEFAULT,
            layer: 0,
            update_flags: UpdateFlags::all(),
        }
    }

    pub fn mesh(&self) -> MeshId {
        self.mesh
    }

    pub fn transform(&self) -> &Mat4 {
        &self.transform
    }

    pub fn bones(&self) -> &[Mat4] {
        &self.bones
    }

    /// Blendshape weights in [0, 100], one per channel.
    pub fn blendshape_weights(&self) -> &[f32] {
        &self.blendshape_weights
    }

    pub fn flags(&self) -> InstanceFlags {
        self.flags
    }

    pub fn layer(&self) -> u32 {
        self.layer
    }

    pub fn layer_mask(&self) -> LayerMask {
        LayerMask::from_layer(self.layer)
    }

    pub fn update_flags(&self) -> UpdateFlags {
        self.update_flags
    }

    pub(crate) fn set_transform(&mut self, transform: Mat4) {
        if self.transform != transform {
            self.transform = transform;
            self.update_flags |= UpdateFlags::TRANSFORM;
        }
    }

    pub(crate) fn set_bones(&mut self, bones: &[Mat4]) {
        if self.bones != bones {
            self.bones.clear();
            self.bones.extend_from_slice(bones);
            self.update_flags |= UpdateFlags::BONES;
        }
    }

    pub(crate) fn set_blendshape_weights(&mut self, weights: &[f32]) {
        if self.blendshape_weights != weights {
            self.blendshape_weights.clear();
            self.blendshape_weights.extend_from_slice(weights);
            self.update_flags |= UpdateFlags::BLENDSHAPE;
        }
    }

    pub(crate) fn set_flags(&mut self, flags: InstanceFlags) {
        if self.flags != flags {
            self.flags = flags;
            self.update_flags |= UpdateFlags::FLAGS;
        }
    }

    pub(crate) fn set_layer(&mut self, layer: u32) {
        if self.layer != layer {
            self.layer = layer;
            self.update_flags |= UpdateFlags::FLAGS;
        }
    }
}

/// Copy of an instance taken for one render call, together with its mesh.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub mesh_id: MeshId,
    pub mesh: Arc<MeshDescriptor>,
    /// Incremented every time the mesh vertex data is replaced.
    pub mesh_version: u64,
    pub instance: MeshInstance,
}
