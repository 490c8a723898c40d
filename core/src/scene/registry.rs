//! Reference counted registry of meshes and instances.
//!
//! The registry hands out generation-checked ids. Every id carries an external
//! reference count; when the last reference is released the entry is removed and
//! a [`SceneEvent`] is queued. Device-side caches drain these events at frame
//! boundaries, so GPU state is never torn down in the middle of a frame.

use std::sync::Arc;

use glam::Mat4;
use parking_lot::RwLock;
use slotmap::SlotMap;

use super::instance::{InstanceSnapshot, MeshInstance};
use super::mesh::{MeshDescriptor, VertexSource};
use super::{InstanceId, MeshId};
use crate::error::SceneError;
use crate::flags::InstanceFlags;

/// Change notifications consumed by device-side caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneEvent {
    /// The last reference to a mesh was released.
    MeshReleased(MeshId),
    /// The last reference to an instance was released.
    InstanceReleased(InstanceId),
    /// The CPU vertex data of a mesh was replaced.
    MeshVerticesUpdated(MeshId),
}

#[derive(Debug)]
struct MeshEntry {
    descriptor: Arc<MeshDescriptor>,
    version: u64,
    refs: u32,
}

#[derive(Debug)]
struct InstanceEntry {
    instance: MeshInstance,
    refs: u32,
}

#[derive(Debug, Default)]
struct SceneInner {
    meshes: SlotMap<MeshId, MeshEntry>,
    instances: SlotMap<InstanceId, InstanceEntry>,
    events: Vec<SceneEvent>,
}

impl SceneInner {
    fn release_mesh(&mut self, id: MeshId) -> Result<(), SceneError> {
        let entry = self.meshes.get_mut(id).ok_or(SceneError::UnknownMesh)?;
        entry.refs -= 1;
        if entry.refs == 0 {
            self.meshes.remove(id);
            self.events.push(SceneEvent::MeshReleased(id));
            log::debug!("Scene: mesh {id:?} released");
        }
        Ok(())
    }

    fn instance_mut(&mut self, id: InstanceId) -> Result<&mut MeshInstance, SceneError> {
        self.instances
            .get_mut(id)
            .map(|e| &mut e.instance)
            .ok_or(SceneError::UnknownInstance)
    }
}

/// Scene registry shared between the host and the ray tracing pipeline.
#[derive(Debug, Default)]
pub struct Scene {
    inner: RwLock<SceneInner>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mesh. The caller holds the first reference.
    pub fn create_mesh(&self, descriptor: MeshDescriptor) -> Result<MeshId, SceneError> {
        descriptor.validate()?;
        let name = descriptor.name.clone();
        let id = self.inner.write().meshes.insert(MeshEntry {
            descriptor: Arc::new(descriptor),
            version: 0,
            refs: 1,
        });
        log::debug!("Scene: created mesh '{name}' as {id:?}");
        Ok(id)
    }

    pub fn mesh(&self, id: MeshId) -> Option<Arc<MeshDescriptor>> {
        self.inner
            .read()
            .meshes
            .get(id)
            .map(|e| Arc::clone(&e.descriptor))
    }

    pub fn mesh_version(&self, id: MeshId) -> Option<u64> {
        self.inner.read().meshes.get(id).map(|e| e.version)
    }

    pub fn mesh_refs(&self, id: MeshId) -> Option<u32> {
        self.inner.read().meshes.get(id).map(|e| e.refs)
    }

    pub fn retain_mesh(&self, id: MeshId) -> Result<(), SceneError> {
        let mut inner = self.inner.write();
        let entry = inner.meshes.get_mut(id).ok_or(SceneError::UnknownMesh)?;
        entry.refs += 1;
        Ok(())
    }

    pub fn release_mesh(&self, id: MeshId) -> Result<(), SceneError> {
        self.inner.write().release_mesh(id)
    }

    /// Replaces the vertex bytes of a CPU mesh. The layout must stay the same.
    pub fn replace_vertices(&self, id: MeshId, vertices: Arc<[u8]>) -> Result<(), SceneError> {
        let mut inner = self.inner.write();
        let entry = inner.meshes.get_mut(id).ok_or(SceneError::UnknownMesh)?;
        let mut descriptor = MeshDescriptor::clone(&entry.descriptor);
        match &mut descriptor.source {
            VertexSource::Cpu { vertices: old, .. } if old.len() == vertices.len() => {
                *old = vertices;
            }
            VertexSource::Cpu { vertices: old, .. } => {
                return Err(SceneError::VertexDataMismatch {
                    expected: old.len(),
                    actual: vertices.len(),
                });
            }
            VertexSource::Host { .. } => {
                return Err(SceneError::VertexDataMismatch {
                    expected: 0,
                    actual: vertices.len(),
                });
            }
        }
        entry.descriptor = Arc::new(descriptor);
        entry.version += 1;
        inner.events.push(SceneEvent::MeshVerticesUpdated(id));
        Ok(())
    }

    /// Places a mesh in the scene. The instance holds a reference to its mesh
    /// until the instance itself is released.
    pub fn create_instance(&self, mesh: MeshId) -> Result<InstanceId, SceneError> {
        let mut inner = self.inner.write();
        let entry = inner.meshes.get_mut(mesh).ok_or(SceneError::UnknownMesh)?;
        entry.refs += 1;
        let id = inner.instances.insert(InstanceEntry {
            instance: MeshInstance::new(mesh),
            refs: 1,
        });
        Ok(id)
    }

    pub fn instance(&self, id: InstanceId) -> Option<MeshInstance> {
        self.inner
            .read()
            .instances
            .get(id)
            .map(|e| e.instance.clone())
    }

    pub fn instance_refs(&self, id: InstanceId) -> Option<u32> {
        self.inner.read().instances.get(id).map(|e| e.refs)
    }

    pub fn retain_instance(&self, id: InstanceId) -> Result<(), SceneError> {
        let mut inner = self.inner.write();
        let entry = inner
            .instances
            .get_mut(id)
            .ok_or(SceneError::UnknownInstance)?;
        entry.refs += 1;
        Ok(())
    }

    pub fn release_instance(&self, id: InstanceId) -> Result<(), SceneError> {
        let mut inner = self.inner.write();
        let entry = inner
            .instances
            .get_mut(id)
            .ok_or(SceneError::UnknownInstance)?;
        entry.refs -= 1;
        if entry.refs == 0 {
            let mesh = entry.instance.mesh;
            inner.instances.remove(id);
            inner.events.push(SceneEvent::InstanceReleased(id));
            log::debug!("Scene: instance {id:?} released");
            inner.release_mesh(mesh)?;
        }
        Ok(())
    }

    pub fn set_transform(&self, id: InstanceId, transform: Mat4) -> Result<(), SceneError> {
        self.inner.write().instance_mut(id)?.set_transform(transform);
        Ok(())
    }

    pub fn set_bones(&self, id: InstanceId, bones: &[Mat4]) -> Result<(), SceneError> {
        self.inner.write().instance_mut(id)?.set_bones(bones);
        Ok(())
    }

    /// Sets blendshape weights in [0, 100], one per channel.
    pub fn set_blendshape_weights(&self, id: InstanceId, weights: &[f32]) -> Result<(), SceneError> {
        self.inner
            .write()
            .instance_mut(id)?
            .set_blendshape_weights(weights);
        Ok(())
    }

    pub fn set_instance_flags(&self, id: InstanceId, flags: InstanceFlags) -> Result<(), SceneError> {
        self.inner.write().instance_mut(id)?.set_flags(flags);
        Ok(())
    }

    pub fn set_layer(&self, id: InstanceId, layer: u32) -> Result<(), SceneError> {
        self.inner.write().instance_mut(id)?.set_layer(layer);
        Ok(())
    }

    /// Copies an instance and its mesh for one render call.
    pub fn snapshot(&self, id: InstanceId) -> Option<InstanceSnapshot> {
        let inner = self.inner.read();
        let instance = &inner.instances.get(id)?.instance;
        let mesh = inner.meshes.get(instance.mesh)?;
        Some(InstanceSnapshot {
            mesh_id: instance.mesh,
            mesh: Arc::clone(&mesh.descriptor),
            mesh_version: mesh.version,
            instance: instance.clone(),
        })
    }

    /// Marks the pending changes of an instance as consumed.
    pub fn clear_update_flags(&self, id: InstanceId) {
        if let Some(entry) = self.inner.write().instances.get_mut(id) {
            entry.instance.update_flags = Default::default();
        }
    }

    /// Takes all queued events.
    pub fn drain_events(&self) -> Vec<SceneEvent> {
        std::mem::take(&mut self.inner.write().events)
    }

    pub fn mesh_count(&self) -> usize {
        self.inner.read().meshes.len()
    }

    pub fn instance_count(&self) -> usize {
        self.inner.read().instances.len()
    }
}
