//! Descriptors and GPU record types.

mod accel;
mod buffer;
mod gpu;
mod texture;

pub use accel::{
    AccelBuildFlags, AccelBuildMode, AccelDescriptor, AccelInputs, AccelLevel, AccelShape,
    AccelSizes, InstanceDesc, InstanceDescFlags, InstanceGeometry, InstanceMask, TriangleGeometry,
};
pub use buffer::{BufferDescriptor, BufferSlice, BufferUsage, MemoryLocation};
pub use gpu::{
    BlendshapeFrameInfo, BlendshapeInfo, BoneCount, BoneWeightData, CameraData, DeformFlags,
    DeformMeshInfo, InstanceData, LightData, SceneConstants,
};
pub use texture::{RenderTargetFormat, ResourceState, TextureDescriptor};
