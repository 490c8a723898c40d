//! Mesh descriptors.

use std::sync::Arc;

use glam::{Mat4, Vec3};

use crate::error::SceneError;
use crate::resource::{HostBuffer, IndexFormat};

/// Where vertex and index data live.
#[derive(Debug, Clone, PartialEq)]
pub enum VertexSource {
    /// Buffers owned by the host graphics device, reached through a translator.
    Host {
        vertices: HostBuffer,
        indices: HostBuffer,
    },
    /// CPU blobs uploaded by the pipeline.
    Cpu {
        vertices: Arc<[u8]>,
        indices: Arc<[u8]>,
    },
}

/// One weighted bone influence.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoneWeight {
    pub weight: f32,
    pub index: u32,
}

/// Skinning data of a mesh.
///
/// Influences are flattened: vertex `v` uses `bone_counts[v]` consecutive
/// entries of `weights`, starting after the influences of all previous vertices.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SkinData {
    /// Mesh-space to bone-space matrix of each bone.
    pub bind_poses: Vec<Mat4>,
    pub bone_counts: Vec<u8>,
    pub weights: Vec<BoneWeight>,
}

impl SkinData {
    pub fn bone_count(&self) -> usize {
        self.bind_poses.len()
    }
}

/// One authored target of a blendshape channel.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BlendshapeFrame {
    /// Channel weight at which this frame is fully applied, in [0, 100].
    pub weight: f32,
    /// Position delta per vertex.
    pub deltas: Vec<Vec3>,
}

/// A blendshape channel with its frames sorted by ascending weight.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Blendshape {
    pub name: String,
    pub frames: Vec<BlendshapeFrame>,
}

impl Blendshape {
    /// Highest authored weight, the clamp limit of this channel.
    pub fn max_weight(&self) -> f32 {
        self.frames.last().map(|f| f.weight).unwrap_or(0.0)
    }
}

/// Immutable description of one mesh version.
///
/// Vertex positions are the first three `f32` of every vertex.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshDescriptor {
    pub name: String,
    pub source: VertexSource,
    /// Vertex stride in bytes.
    pub vertex_stride: u32,
    pub vertex_count: u32,
    /// Byte offset of the first vertex.
    pub vertex_offset: u32,
    pub index_format: IndexFormat,
    pub index_count: u32,
    /// Byte offset of the first index.
    pub index_offset: u32,
    pub skin: Option<SkinData>,
    pub blendshapes: Vec<Blendshape>,
}

impl MeshDescriptor {
    /// Describes a mesh from tightly packed CPU positions and 32-bit indices.
    pub fn from_positions(name: impl Into<String>, positions: &[Vec3], indices: &[u32]) -> Self {
        let vertices: Vec<u8> = positions
            .iter()
            .flat_map(|p| p.to_array())
            .flat_map(f32::to_le_bytes)
            .collect();
        let index_bytes: Vec<u8> = indices.iter().flat_map(|i| i.to_le_bytes()).collect();
        Self {
            name: name.into(),
            source: VertexSource::Cpu {
                vertices: vertices.into(),
                indices: index_bytes.into(),
            },
            vertex_stride: 12,
            vertex_count: positions.len() as u32,
            vertex_offset: 0,
            index_format: IndexFormat::U32,
            index_count: indices.len() as u32,
            index_offset: 0,
            skin: None,
            blendshapes: Vec::new(),
        }
    }

    pub fn with_skin(mut self, skin: SkinData) -> Self {
        self.skin = Some(skin);
        self
    }

    pub fn with_blendshape(mut self, blendshape: Blendshape) -> Self {
        self.blendshapes.push(blendshape);
        self
    }

    /// Returns true if instances of this mesh need the deformation pass.
    pub fn is_deformable(&self) -> bool {
        self.skin.is_some() || !self.blendshapes.is_empty()
    }

    /// Total size in bytes the vertex range occupies.
    pub fn vertex_bytes(&self) -> usize {
        self.vertex_offset as usize + self.vertex_count as usize * self.vertex_stride as usize
    }

    /// Total size in bytes the index range occupies.
    pub fn index_bytes(&self) -> usize {
        self.index_offset as usize + self.index_count as usize * self.index_format.stride() as usize
    }

    /// Checks the layout invariants the pipeline relies on.
    pub fn validate(&self) -> Result<(), SceneError> {
        let invalid = |msg: String| Err(SceneError::InvalidMesh(format!("{}: {msg}", self.name)));

        if self.vertex_count == 0 || self.index_count == 0 {
            return invalid("empty vertex or index range".to_string());
        }
        if self.index_count % 3 != 0 {
            return invalid(format!("index count {} is not a triangle list", self.index_count));
        }
        if self.vertex_stride < 12 || self.vertex_stride % 4 != 0 {
            return invalid(format!("unrecognized vertex stride {}", self.vertex_stride));
        }
        if self.vertex_offset % 4 != 0 {
            return invalid(format!("vertex offset {} is not 4-byte aligned", self.vertex_offset));
        }
        if let VertexSource::Cpu { vertices, indices } = &self.source {
            if vertices.len() < self.vertex_bytes() {
                return invalid(format!(
                    "vertex data holds {} bytes, layout needs {}",
                    vertices.len(),
                    self.vertex_bytes()
                ));
            }
            if indices.len() < self.index_bytes() {
                return invalid(format!(
                    "index data holds {} bytes, layout needs {}",
                    indices.len(),
                    self.index_bytes()
                ));
            }
        }

        if let Some(skin) = &self.skin {
            if skin.bone_counts.len() != self.vertex_count as usize {
                return invalid(format!(
                    "{} bone counts for {} vertices",
                    skin.bone_counts.len(),
                    self.vertex_count
                ));
            }
            let total: usize = skin.bone_counts.iter().map(|&c| c as usize).sum();
            if total != skin.weights.len() {
                return invalid(format!(
                    "bone counts reference {total} weights, {} provided",
                    skin.weights.len()
                ));
            }
            if let Some(w) = skin.weights.iter().find(|w| w.index as usize >= skin.bone_count()) {
                return invalid(format!("bone index {} out of range", w.index));
            }
        }

        for shape in &self.blendshapes {
            if shape.frames.is_empty() {
                return invalid(format!("blendshape {} has no frames", shape.name));
            }
            for frame in &shape.frames {
                if frame.deltas.len() != self.vertex_count as usize {
                    return invalid(format!(
                        "blendshape {} frame has {} deltas for {} vertices",
                        shape.name,
                        frame.deltas.len(),
                        self.vertex_count
                    ));
                }
                if frame.weight <= 0.0 {
                    return invalid(format!("blendshape {} frame weight must be positive", shape.name));
                }
            }
            if shape.frames.windows(2).any(|w| w[0].weight >= w[1].weight) {
                return invalid(format!("blendshape {} frames are not sorted by weight", shape.name));
            }
        }
        Ok(())
    }
}
