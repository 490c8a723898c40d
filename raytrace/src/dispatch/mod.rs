//! Ray dispatch: direct, adaptive cascade and antialiasing resolve.
//!
//! Every dispatch variant is the same ray pipeline and root bindings with a
//! different ray generation record and output surface. Dispatches are wrapped
//! in transitions to the unordered access state and back.

pub mod shader_table;

pub use shader_table::{
    HitGroup, MissProgram, PROGRAM_GROUP_COUNT, RayGenProgram, SHADER_TABLE_CAPACITY, ShaderTable,
    ShaderTableLayout,
};

use std::sync::Arc;

use hardshadow_core::RenderFlags;

use crate::backend::{
    Command, CommandList, GpuAccelerationStructure, GpuBuffer, GpuPipeline, GpuTexture, RayBindings,
    RayDispatch, RtBackend,
};
use crate::config::RayProgramLibrary;
use crate::error::RaytraceResult;
use crate::types::{RenderTargetFormat, ResourceState, TextureDescriptor};

/// Smallest target width and height that gets an adaptive cascade.
pub const MIN_ADAPTIVE_SIZE: u32 = 128;

/// Divisors of the cascade levels, lowest resolution first.
pub const CASCADE_DIVISORS: [u32; 3] = [8, 4, 2];

/// Output surface of a renderer and the intermediate surfaces its dispatch
/// modes need.
#[derive(Debug, Clone)]
pub struct RenderTargets {
    pub width: u32,
    pub height: u32,
    pub format: RenderTargetFormat,
    pub output: Arc<GpuTexture>,
    /// 1/8, 1/4 and 1/2 resolution hints. Empty below [`MIN_ADAPTIVE_SIZE`].
    pub cascade: Vec<Arc<GpuTexture>>,
    /// Full resolution result resolved into `output` by the antialiasing pass.
    pub back_buffer: Arc<GpuTexture>,
}

impl RenderTargets {
    pub fn new(
        backend: &dyn RtBackend,
        width: u32,
        height: u32,
        format: RenderTargetFormat,
    ) -> RaytraceResult<Self> {
        let output = Arc::new(backend.create_texture(
            &TextureDescriptor::new(width, height, format).with_label("shadow output"),
        )?);
        let back_buffer = Arc::new(backend.create_texture(
            &TextureDescriptor::new(width, height, RenderTargetFormat::Rf32)
                .with_label("shadow back buffer"),
        )?);
        let mut cascade = Vec::new();
        if width >= MIN_ADAPTIVE_SIZE && height >= MIN_ADAPTIVE_SIZE {
            for divisor in CASCADE_DIVISORS {
                cascade.push(Arc::new(backend.create_texture(
                    &TextureDescriptor::new(
                        width.div_ceil(divisor),
                        height.div_ceil(divisor),
                        RenderTargetFormat::Rf32,
                    )
                    .with_label(format!("shadow cascade 1/{divisor}")),
                )?));
            }
        }
        log::debug!(
            "Render targets {}x{} {:?}, {} cascade levels",
            width,
            height,
            format,
            cascade.len()
        );
        Ok(Self {
            width,
            height,
            format,
            output,
            cascade,
            back_buffer,
        })
    }

    pub fn matches(&self, width: u32, height: u32, format: RenderTargetFormat) -> bool {
        self.width == width && self.height == height && self.format == format
    }
}

/// Resources bound at the root of every ray dispatch.
#[derive(Debug, Clone)]
pub struct RootBindings {
    pub tlas: Arc<GpuAccelerationStructure>,
    pub instance_data: Arc<GpuBuffer>,
    pub constants: Arc<GpuBuffer>,
}

/// Owns the ray pipeline and shader table and records dispatches.
pub struct RayDispatcher {
    pipeline: Arc<GpuPipeline>,
    table: ShaderTable,
}

impl RayDispatcher {
    /// Creates the ray pipeline and uploads its shader table.
    pub fn new(backend: &dyn RtBackend, programs: &RayProgramLibrary) -> RaytraceResult<Self> {
        let pipeline = backend.create_ray_pipeline(programs)?;
        // Inline root data: index of the root binding set.
        let table = ShaderTable::new(backend, &pipeline, &0u64.to_le_bytes())?;
        Ok(Self {
            pipeline: Arc::new(pipeline),
            table,
        })
    }

    pub fn shader_table(&self) -> &ShaderTable {
        &self.table
    }

    fn dispatch(
        &self,
        list: &mut CommandList,
        program: RayGenProgram,
        root: &RootBindings,
        output: &Arc<GpuTexture>,
        hint: Option<&Arc<GpuTexture>>,
    ) {
        let descriptor = output.descriptor();
        list.transition(output, ResourceState::Common, ResourceState::UnorderedAccess);
        list.push(Command::DispatchRays(RayDispatch {
            pipeline: Arc::clone(&self.pipeline),
            table: self.table.regions(program),
            bindings: RayBindings {
                tlas: Arc::clone(&root.tlas),
                instance_data: Arc::clone(&root.instance_data),
                constants: Arc::clone(&root.constants),
                output: Arc::clone(output),
                hint: hint.cloned(),
            },
            width: descriptor.width,
            height: descriptor.height,
        }));
        list.transition(output, ResourceState::UnorderedAccess, ResourceState::Common);
    }

    /// Records the dispatches for one frame. Returns the number of dispatches.
    ///
    /// Adaptive sampling runs the cascade from the lowest resolution up, each
    /// pass reading the previous one as its hint. Antialiasing renders into
    /// the back buffer and resolves into the output.
    pub fn record(
        &self,
        list: &mut CommandList,
        targets: &RenderTargets,
        root: &RootBindings,
        flags: RenderFlags,
    ) -> u32 {
        let antialias = flags.contains(RenderFlags::ANTIALIASING);
        let adaptive = flags.contains(RenderFlags::ADAPTIVE_SAMPLING) && !targets.cascade.is_empty();
        let full = if antialias {
            &targets.back_buffer
        } else {
            &targets.output
        };

        let mut count = 0;
        if adaptive {
            let mut hint: Option<&Arc<GpuTexture>> = None;
            for level in &targets.cascade {
                let program = match hint {
                    Some(_) => RayGenProgram::AdaptiveSampling,
                    None => RayGenProgram::Default,
                };
                self.dispatch(list, program, root, level, hint);
                hint = Some(level);
                count += 1;
            }
            self.dispatch(list, RayGenProgram::AdaptiveSampling, root, full, hint);
        } else {
            self.dispatch(list, RayGenProgram::Default, root, full, None);
        }
        count += 1;

        if antialias {
            self.dispatch(
                list,
                RayGenProgram::Antialiasing,
                root,
                &targets.output,
                Some(&targets.back_buffer),
            );
            count += 1;
        }
        log::debug!(
            "Recorded {} ray dispatches (adaptive: {}, antialias: {})",
            count,
            adaptive,
            antialias
        );
        count
    }
}

impl std::fmt::Debug for RayDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayDispatcher")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use crate::types::{AccelDescriptor, AccelLevel, BufferDescriptor, BufferUsage};

    fn root(backend: &SoftwareBackend) -> RootBindings {
        RootBindings {
            tlas: Arc::new(
                backend
                    .create_acceleration_structure(&AccelDescriptor::new(AccelLevel::Top, 256))
                    .unwrap(),
            ),
            instance_data: Arc::new(
                backend
                    .create_buffer(&BufferDescriptor::new(8, BufferUsage::STORAGE))
                    .unwrap(),
            ),
            constants: Arc::new(
                backend
                    .create_buffer(&BufferDescriptor::new(16, BufferUsage::UNIFORM))
                    .unwrap(),
            ),
        }
    }

    fn dispatched_programs(list: &CommandList) -> Vec<(RayGenProgram, u32)> {
        list.commands()
            .iter()
            .filter_map(|c| match c {
                Command::DispatchRays(d) => {
                    let stride = d.table.raygen.stride;
                    let program = RayGenProgram::from_group((d.table.raygen.offset / stride) as u32)?;
                    Some((program, d.width))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_small_targets_have_no_cascade() {
        let backend = SoftwareBackend::new();
        let small = RenderTargets::new(&backend, 127, 256, RenderTargetFormat::Ru8).unwrap();
        assert!(small.cascade.is_empty());
        let large = RenderTargets::new(&backend, 128, 128, RenderTargetFormat::Ru8).unwrap();
        let widths: Vec<u32> = large.cascade.iter().map(|t| t.descriptor().width).collect();
        assert_eq!(widths, vec![16, 32, 64]);
    }

    #[test]
    fn test_direct_mode() {
        let backend = SoftwareBackend::new();
        let dispatcher = RayDispatcher::new(&backend, &RayProgramLibrary::default()).unwrap();
        let targets = RenderTargets::new(&backend, 64, 64, RenderTargetFormat::Rf32).unwrap();
        let mut list = CommandList::new("rays");
        let count = dispatcher.record(&mut list, &targets, &root(&backend), RenderFlags::empty());
        assert_eq!(count, 1);
        assert_eq!(dispatched_programs(&list), vec![(RayGenProgram::Default, 64)]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_adaptive_cascade_with_resolve() {
        let backend = SoftwareBackend::new();
        let dispatcher = RayDispatcher::new(&backend, &RayProgramLibrary::default()).unwrap();
        let targets = RenderTargets::new(&backend, 256, 256, RenderTargetFormat::Rf32).unwrap();
        let mut list = CommandList::new("rays");
        let flags = RenderFlags::ADAPTIVE_SAMPLING | RenderFlags::ANTIALIASING;
        let count = dispatcher.record(&mut list, &targets, &root(&backend), flags);
        assert_eq!(count, 5);
        assert_eq!(
            dispatched_programs(&list),
            vec![
                (RayGenProgram::Default, 32),
                (RayGenProgram::AdaptiveSampling, 64),
                (RayGenProgram::AdaptiveSampling, 128),
                (RayGenProgram::AdaptiveSampling, 256),
                (RayGenProgram::Antialiasing, 256),
            ]
        );
    }

    #[test]
    fn test_adaptive_falls_back_to_direct_on_small_targets() {
        let backend = SoftwareBackend::new();
        let dispatcher = RayDispatcher::new(&backend, &RayProgramLibrary::default()).unwrap();
        let targets = RenderTargets::new(&backend, 64, 64, RenderTargetFormat::Rf32).unwrap();
        let mut list = CommandList::new("rays");
        let count = dispatcher.record(
            &mut list,
            &targets,
            &root(&backend),
            RenderFlags::ADAPTIVE_SAMPLING,
        );
        assert_eq!(count, 1);
    }
}
