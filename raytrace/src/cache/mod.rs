//! Device-side cache of meshes, instances and translated host resources.
//!
//! Entries are created lazily the first time a renderer references them and
//! are torn down only at frame boundaries, when the scene reports that the
//! last reference to their descriptor was released. Host notifications from
//! the translator are queued and applied at the same boundary.
//!
//! | Record | Key | Owns | Evicted |
//! |--------|-----|------|---------|
//! | Mesh entry | `MeshId` | Vertex and index buffers, static BLAS, deform tables | Mesh released |
//! | Instance entry | `InstanceId` | Deformed vertices, private BLAS | Instance released |
//! | Translated buffer | `HostBuffer` | Imported or uploaded device buffer | Host release, or unused for a frame |
//! | Translated texture | `HostTexture` | Imported or uploaded device texture | Host release, or unused for a frame |
//!
//! # Change stamps
//!
//! Every BLAS (re)build and every consumed transform or flags change takes a
//! fresh value from one cache-wide counter. A renderer's TLAS remembers the
//! counter value at its last build and rebuilds when any of its instances
//! carries a newer stamp, so a BLAS built by the first renderer of a frame is
//! still observed by every later renderer, in any order.

mod prepare;

pub use prepare::{PrepareInputs, PreparedFrame};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use slotmap::SecondaryMap;

use hardshadow_core::{HostBuffer, HostTexture, InstanceId, MeshDescriptor, MeshId, SceneEvent};

use crate::accel::Blas;
use crate::backend::GpuBuffer;
use crate::deform::{InstanceDeformBuffers, MeshDeformTables};
use crate::error::RaytraceResult;
use crate::scheduler::{FenceValue, QueueScheduler};
use crate::translator::{ResourceObserver, ResourceTranslator, TranslatedBuffer, TranslatedTexture};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notification {
    BufferUpdated(HostBuffer),
    BufferReleased(HostBuffer),
    TextureReleased(HostTexture),
}

/// Collects translator notifications until the next frame boundary.
#[derive(Debug, Default)]
struct NotificationQueue {
    pending: Mutex<Vec<Notification>>,
}

impl NotificationQueue {
    fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.pending.lock())
    }
}

impl ResourceObserver for NotificationQueue {
    fn buffer_updated(&self, buffer: HostBuffer) {
        self.pending.lock().push(Notification::BufferUpdated(buffer));
    }

    fn buffer_released(&self, buffer: HostBuffer) {
        self.pending.lock().push(Notification::BufferReleased(buffer));
    }

    fn texture_released(&self, texture: HostTexture) {
        self.pending.lock().push(Notification::TextureReleased(texture));
    }
}

#[derive(Debug)]
struct BufferRecord {
    translated: TranslatedBuffer,
    last_used: u64,
}

#[derive(Debug)]
struct TextureRecord {
    translated: TranslatedTexture,
    last_used: u64,
}

/// Device state of one mesh.
#[derive(Debug)]
pub(crate) struct MeshEntry {
    pub descriptor: Arc<MeshDescriptor>,
    /// Scene version of the vertex data on the device.
    pub version: u64,
    /// Host buffers the geometry was translated from.
    pub host: Option<(HostBuffer, HostBuffer)>,
    pub vertices: Arc<GpuBuffer>,
    pub indices: Arc<GpuBuffer>,
    /// Signaled once vertices, indices and deform tables are on the device.
    pub ready: FenceValue,
    pub blas: Option<Blas>,
    pub blas_stamp: u64,
    /// Frame of the last static BLAS build.
    pub built_frame: u64,
    /// Stamp of the last change of the vertex contents.
    pub vertex_stamp: u64,
    /// Vertex contents changed and the static BLAS has not consumed it yet.
    pub vertices_updated: bool,
    pub deform: Option<Arc<MeshDeformTables>>,
    pub last_used: u64,
}

/// Device state of one mesh instance.
#[derive(Debug)]
pub(crate) struct InstanceEntry {
    pub deform: Option<InstanceDeformBuffers>,
    /// Private BLAS over the deformed vertices.
    pub blas: Option<Blas>,
    pub blas_stamp: u64,
    /// Stamp of the last consumed transform or flags change.
    pub instance_stamp: u64,
    /// Stamp of the last consumed bones, blendshape or skinned transform change.
    pub deform_input_stamp: u64,
    /// Input stamp the deformed vertices were computed from.
    pub deformed_stamp: u64,
    /// Blendshape weight clamping of the last deformation.
    pub deformed_clamp: bool,
    /// Mesh vertex stamp the deformed vertices were computed from.
    pub source_stamp: u64,
    /// Frame of the last deformation.
    pub deformed_frame: u64,
    pub last_used: u64,
}

/// Device state shared by every renderer of a context.
pub struct DeviceCache {
    translator: Arc<dyn ResourceTranslator>,
    notifications: Arc<NotificationQueue>,
    buffers: HashMap<HostBuffer, BufferRecord>,
    textures: HashMap<HostTexture, TextureRecord>,
    pub(crate) meshes: SecondaryMap<MeshId, MeshEntry>,
    pub(crate) instances: SecondaryMap<InstanceId, InstanceEntry>,
    frame: u64,
    stamp: u64,
}

impl DeviceCache {
    pub fn new(translator: Arc<dyn ResourceTranslator>) -> Self {
        Self {
            translator,
            notifications: Arc::new(NotificationQueue::default()),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            meshes: SecondaryMap::new(),
            instances: SecondaryMap::new(),
            frame: 0,
            stamp: 0,
        }
    }

    pub fn translator(&self) -> &Arc<dyn ResourceTranslator> {
        &self.translator
    }

    /// Current frame index, zero before the first frame.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Last change stamp handed out.
    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    pub(crate) fn next_stamp(&mut self) -> u64 {
        self.stamp += 1;
        self.stamp
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn contains_mesh(&self, id: MeshId) -> bool {
        self.meshes.contains_key(id)
    }

    pub fn contains_instance(&self, id: InstanceId) -> bool {
        self.instances.contains_key(id)
    }

    /// Deformed vertex buffer of an instance, once it was deformed.
    pub fn deformed_vertices(&self, id: InstanceId) -> Option<Arc<GpuBuffer>> {
        self.instances
            .get(id)
            .and_then(|entry| entry.deform.as_ref())
            .map(|deform| Arc::clone(&deform.output))
    }

    /// Whether the mesh owns a built static BLAS.
    pub fn has_mesh_blas(&self, id: MeshId) -> bool {
        self.meshes.get(id).is_some_and(|entry| entry.blas.is_some())
    }

    fn observer(&self) -> Arc<dyn ResourceObserver> {
        self.notifications.clone()
    }

    /// Starts a new frame: applies scene events and host notifications, then
    /// evicts translated records nothing used during the previous frame.
    pub fn begin_frame(
        &mut self,
        scheduler: &QueueScheduler,
        events: Vec<SceneEvent>,
    ) -> RaytraceResult<()> {
        self.frame += 1;

        for event in events {
            match event {
                SceneEvent::MeshReleased(id) => {
                    if self.meshes.remove(id).is_some() {
                        log::debug!("Evicted mesh {id:?}");
                    }
                }
                SceneEvent::InstanceReleased(id) => {
                    if self.instances.remove(id).is_some() {
                        log::debug!("Evicted instance {id:?}");
                    }
                }
                // Picked up by the version check at the next use.
                SceneEvent::MeshVerticesUpdated(id) => {
                    log::trace!("Mesh {id:?} vertices replaced");
                }
            }
        }

        for notification in self.notifications.take() {
            match notification {
                Notification::BufferUpdated(host) => self.refresh_buffer(scheduler, host)?,
                Notification::BufferReleased(host) => {
                    if self.buffers.remove(&host).is_some() {
                        log::debug!("Host buffer {} released", host.0);
                    }
                }
                Notification::TextureReleased(host) => {
                    if self.textures.remove(&host).is_some() {
                        log::debug!("Host texture {} released", host.0);
                    }
                }
            }
        }

        self.evict_unused();
        Ok(())
    }

    fn refresh_buffer(&mut self, scheduler: &QueueScheduler, host: HostBuffer) -> RaytraceResult<()> {
        let Some(record) = self.buffers.get_mut(&host) else {
            return Ok(());
        };
        let ready = match self.translator.refresh_buffer(scheduler, &record.translated) {
            Ok(ready) => ready,
            Err(e) if e.is_device_fatal() => return Err(e),
            Err(e) => {
                log::warn!("Failed to refresh host buffer {}: {e}", host.0);
                return Ok(());
            }
        };
        record.translated.ready = ready;

        let stamp = self.next_stamp();
        for (id, mesh) in self.meshes.iter_mut() {
            if let Some((vertices, indices)) = mesh.host {
                if vertices == host || indices == host {
                    mesh.ready = mesh.ready.max(ready);
                    mesh.vertices_updated = true;
                    mesh.vertex_stamp = stamp;
                    log::debug!("Mesh {id:?} geometry updated by host buffer {}", host.0);
                }
            }
        }
        Ok(())
    }

    fn evict_unused(&mut self) {
        let referenced: HashSet<HostBuffer> = self
            .meshes
            .values()
            .filter_map(|m| m.host)
            .flat_map(|(v, i)| [v, i])
            .collect();
        let frame = self.frame;
        let before = self.buffers.len() + self.textures.len();
        self.buffers
            .retain(|host, r| referenced.contains(host) || r.last_used + 1 >= frame);
        self.textures.retain(|_, r| r.last_used + 1 >= frame);
        let evicted = before - self.buffers.len() - self.textures.len();
        if evicted > 0 {
            log::debug!("Evicted {evicted} unused translated resources");
        }
    }

    /// Translates a host buffer once and returns the shared record.
    pub(crate) fn translate_buffer(
        &mut self,
        scheduler: &QueueScheduler,
        host: HostBuffer,
    ) -> RaytraceResult<TranslatedBuffer> {
        let frame = self.frame;
        if let Some(record) = self.buffers.get_mut(&host) {
            record.last_used = frame;
            return Ok(record.translated.clone());
        }
        let translated = self
            .translator
            .translate_buffer(scheduler, host, self.observer())?;
        self.buffers.insert(
            host,
            BufferRecord {
                translated: translated.clone(),
                last_used: frame,
            },
        );
        Ok(translated)
    }

    /// Translates a host texture once and returns the shared record.
    pub fn translate_texture(
        &mut self,
        scheduler: &QueueScheduler,
        host: HostTexture,
    ) -> RaytraceResult<TranslatedTexture> {
        let frame = self.frame;
        if let Some(record) = self.textures.get_mut(&host) {
            record.last_used = frame;
            return Ok(record.translated.clone());
        }
        let translated = self
            .translator
            .translate_texture(scheduler, host, self.observer())?;
        self.textures.insert(
            host,
            TextureRecord {
                translated: translated.clone(),
                last_used: frame,
            },
        );
        Ok(translated)
    }

    /// Drops every entry and record. Frame and stamp counters keep counting.
    pub fn clear(&mut self) {
        log::info!(
            "Clearing device cache ({} meshes, {} instances)",
            self.meshes.len(),
            self.instances.len()
        );
        self.buffers.clear();
        self.textures.clear();
        self.meshes.clear();
        self.instances.clear();
        self.notifications.take();
    }
}

impl std::fmt::Debug for DeviceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCache")
            .field("frame", &self.frame)
            .field("stamp", &self.stamp)
            .field("meshes", &self.meshes.len())
            .field("instances", &self.instances.len())
            .field("buffers", &self.buffers.len())
            .field("textures", &self.textures.len())
            .finish_non_exhaustive()
    }
}
