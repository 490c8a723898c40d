//! Backend-neutral command recording.
//!
//! A [`CommandList`] is an ordered list of [`Command`]s for one queue
//! submission. Commands own `Arc`s to every resource they reference, which
//! keeps those resources alive until the submission retires.

use std::sync::Arc;

use super::{GpuAccelerationStructure, GpuBuffer, GpuPipeline, GpuQuerySet, GpuTexture};
use crate::types::{
    AccelBuildFlags, AccelBuildMode, AccelInputs, BufferSlice, DeformMeshInfo, ResourceState,
};

/// Execution dependency inserted between two commands of the same list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierKind {
    /// Acceleration structure writes become visible to later builds and traversal.
    AccelerationStructure,
    /// Compute shader writes become visible to acceleration structure builds.
    ComputeToBuild,
}

/// One deformation dispatch: one invocation per vertex.
#[derive(Debug, Clone)]
pub struct DeformDispatch {
    pub pipeline: Arc<GpuPipeline>,
    pub info: DeformMeshInfo,
    /// Undeformed source vertices.
    pub source: BufferSlice,
    /// Deformed positions, one `vec4<f32>` per vertex.
    pub output: Arc<GpuBuffer>,
    pub blendshapes: Option<BlendshapeBindings>,
    pub skin: Option<SkinBindings>,
}

/// Blendshape tables of a deformation dispatch.
#[derive(Debug, Clone)]
pub struct BlendshapeBindings {
    /// `vec4<f32>` deltas ordered by blendshape, then frame, then vertex.
    pub deltas: Arc<GpuBuffer>,
    /// [`BlendshapeFrameInfo`](crate::types::BlendshapeFrameInfo) per frame.
    pub frames: Arc<GpuBuffer>,
    /// [`BlendshapeInfo`](crate::types::BlendshapeInfo) per channel.
    pub shapes: Arc<GpuBuffer>,
    /// Current normalized weight per channel.
    pub weights: Arc<GpuBuffer>,
}

/// Skinning tables of a deformation dispatch.
#[derive(Debug, Clone)]
pub struct SkinBindings {
    /// [`BoneCount`](crate::types::BoneCount) per vertex.
    pub bone_counts: Arc<GpuBuffer>,
    /// [`BoneWeightData`](crate::types::BoneWeightData), flattened.
    pub bone_weights: Arc<GpuBuffer>,
    /// Current column-major bone matrices.
    pub bone_matrices: Arc<GpuBuffer>,
}

/// An acceleration structure build or refit.
#[derive(Debug, Clone)]
pub struct AccelBuild {
    pub dst: Arc<GpuAccelerationStructure>,
    pub inputs: AccelInputs,
    pub flags: AccelBuildFlags,
    pub mode: AccelBuildMode,
    pub scratch: Arc<GpuBuffer>,
}

/// A byte range of the shader table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShaderTableRegion {
    pub offset: u64,
    pub stride: u64,
    pub size: u64,
}

/// The shader table regions bound for one dispatch.
///
/// The ray generation region covers exactly one record, which selects the
/// program the dispatch runs.
#[derive(Debug, Clone)]
pub struct ShaderTableRegions {
    pub buffer: Arc<GpuBuffer>,
    pub raygen: ShaderTableRegion,
    pub miss: ShaderTableRegion,
    pub hit: ShaderTableRegion,
}

/// Root binding set of a ray dispatch.
#[derive(Debug, Clone)]
pub struct RayBindings {
    pub tlas: Arc<GpuAccelerationStructure>,
    /// [`InstanceData`](crate::types::InstanceData) indexed by custom instance index.
    pub instance_data: Arc<GpuBuffer>,
    /// [`SceneConstants`](crate::types::SceneConstants).
    pub constants: Arc<GpuBuffer>,
    pub output: Arc<GpuTexture>,
    /// Lower resolution result read as a sampling hint.
    pub hint: Option<Arc<GpuTexture>>,
}

/// One ray dispatch over a `width` by `height` grid.
#[derive(Debug, Clone)]
pub struct RayDispatch {
    pub pipeline: Arc<GpuPipeline>,
    pub table: ShaderTableRegions,
    pub bindings: RayBindings,
    pub width: u32,
    pub height: u32,
}

/// A recorded GPU command.
#[derive(Debug, Clone)]
pub enum Command {
    /// Copy inline bytes into a buffer.
    UploadBuffer {
        dst: Arc<GpuBuffer>,
        offset: u64,
        data: Arc<[u8]>,
    },
    CopyBuffer {
        src: Arc<GpuBuffer>,
        src_offset: u64,
        dst: Arc<GpuBuffer>,
        dst_offset: u64,
        size: u64,
    },
    Deform(DeformDispatch),
    BuildAccelerationStructure(AccelBuild),
    Barrier(BarrierKind),
    TransitionTexture {
        texture: Arc<GpuTexture>,
        from: ResourceState,
        to: ResourceState,
    },
    DispatchRays(RayDispatch),
    /// Copy texels between two textures of identical size and format.
    CopyTexture {
        src: Arc<GpuTexture>,
        dst: Arc<GpuTexture>,
    },
    WriteTimestamp {
        set: Arc<GpuQuerySet>,
        index: u32,
    },
}

impl Command {
    /// Short name used in trace logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UploadBuffer { .. } => "upload_buffer",
            Self::CopyBuffer { .. } => "copy_buffer",
            Self::Deform(_) => "deform",
            Self::BuildAccelerationStructure(_) => "build_acceleration_structure",
            Self::Barrier(_) => "barrier",
            Self::TransitionTexture { .. } => "transition_texture",
            Self::DispatchRays(_) => "dispatch_rays",
            Self::CopyTexture { .. } => "copy_texture",
            Self::WriteTimestamp { .. } => "write_timestamp",
        }
    }
}

/// Ordered commands for one queue submission.
#[derive(Debug, Clone, Default)]
pub struct CommandList {
    label: String,
    commands: Vec<Command>,
}

impl CommandList {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            commands: Vec::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Appends an inline upload.
    pub fn upload(&mut self, dst: &Arc<GpuBuffer>, offset: u64, data: &[u8]) {
        self.commands.push(Command::UploadBuffer {
            dst: Arc::clone(dst),
            offset,
            data: Arc::from(data),
        });
    }

    pub fn barrier(&mut self, kind: BarrierKind) {
        self.commands.push(Command::Barrier(kind));
    }

    pub fn transition(&mut self, texture: &Arc<GpuTexture>, from: ResourceState, to: ResourceState) {
        self.commands.push(Command::TransitionTexture {
            texture: Arc::clone(texture),
            from,
            to,
        });
    }

    /// Moves every command of `other` to the end of this list.
    pub fn append(&mut self, other: CommandList) {
        self.commands.extend(other.commands);
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Number of commands that are not timestamps. A list holding only
    /// timestamps does no pipeline work.
    pub fn work_len(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| !matches!(c, Command::WriteTimestamp { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{RtBackend, SoftwareBackend};
    use crate::types::{BufferDescriptor, BufferUsage};

    #[test]
    fn test_command_list_append() {
        let backend = SoftwareBackend::new();
        let buffer = Arc::new(
            backend
                .create_buffer(&BufferDescriptor::new(16, BufferUsage::COPY_DST))
                .unwrap(),
        );

        let mut a = CommandList::new("a");
        a.upload(&buffer, 0, &[1, 2, 3, 4]);
        let mut b = CommandList::new("b");
        b.barrier(BarrierKind::AccelerationStructure);
        a.append(b);

        assert_eq!(a.len(), 2);
        assert_eq!(a.label(), "a");
        assert_eq!(a.commands()[1].name(), "barrier");
        assert_eq!(a.work_len(), 2);
    }
}
