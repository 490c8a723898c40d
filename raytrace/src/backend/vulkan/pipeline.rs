//! Deformation compute pipeline and ray tracing pipeline creation.

use std::ffi::CString;

use ash::vk;

use super::VulkanBackend;
use crate::backend::{GpuPipeline, PipelineKind};
use crate::config::RayProgramLibrary;
use crate::deform::{DEFORM_ENTRY_POINT, DEFORM_WGSL};
use crate::dispatch::shader_table::PROGRAM_GROUP_COUNT;
use crate::error::{RaytraceError, RaytraceResult};
use crate::types::DeformMeshInfo;

/// Storage buffer bindings of the deformation shader.
pub const DEFORM_BINDING_COUNT: u32 = 9;

/// Root bindings of the ray programs.
pub mod ray_binding {
    pub const TLAS: u32 = 0;
    pub const INSTANCE_DATA: u32 = 1;
    pub const CONSTANTS: u32 = 2;
    pub const OUTPUT: u32 = 3;
    pub const HINT: u32 = 4;
}

/// Compile WGSL to SPIR-V words with naga.
pub fn compile_wgsl(
    source: &str,
    stage: naga::ShaderStage,
    entry_point: &str,
) -> RaytraceResult<Vec<u32>> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| RaytraceError::ShaderCompilationFailed(format!("WGSL parse error: {e}")))?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    let info = validator
        .validate(&module)
        .map_err(|e| RaytraceError::ShaderCompilationFailed(format!("Validation error: {e}")))?;

    if !module
        .entry_points
        .iter()
        .any(|ep| ep.name == entry_point && ep.stage == stage)
    {
        return Err(RaytraceError::ShaderCompilationFailed(format!(
            "Entry point '{entry_point}' not found for stage {stage:?}"
        )));
    }

    let options = naga::back::spv::Options {
        lang_version: (1, 3),
        flags: naga::back::spv::WriterFlags::empty(),
        capabilities: None,
        bounds_check_policies: naga::proc::BoundsCheckPolicies::default(),
        binding_map: Default::default(),
        debug_info: None,
        zero_initialize_workgroup_memory: naga::back::spv::ZeroInitializeWorkgroupMemoryMode::None,
    };
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: stage,
        entry_point: entry_point.to_string(),
    };

    naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options))
        .map_err(|e| RaytraceError::ShaderCompilationFailed(format!("SPIR-V generation error: {e}")))
}

impl VulkanBackend {
    fn shader_module(&self, code: &[u32]) -> RaytraceResult<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe { self.device.create_shader_module(&create_info, None) }.map_err(|e| {
            RaytraceError::ShaderCompilationFailed(format!("Failed to create shader module: {e:?}"))
        })
    }

    fn set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> RaytraceResult<vk::DescriptorSetLayout> {
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
        unsafe { self.device.create_descriptor_set_layout(&create_info, None) }
            .map_err(|e| self.fail("create descriptor set layout", e))
    }

    fn pipeline_layout(
        &self,
        set_layout: vk::DescriptorSetLayout,
        push_constants: &[vk::PushConstantRange],
    ) -> RaytraceResult<vk::PipelineLayout> {
        let set_layouts = [set_layout];
        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(push_constants);
        unsafe { self.device.create_pipeline_layout(&create_info, None) }
            .map_err(|e| self.fail("create pipeline layout", e))
    }

    /// Destroys layouts of a pipeline whose creation failed half way.
    fn discard_layouts(&self, layout: vk::PipelineLayout, set_layout: vk::DescriptorSetLayout) {
        unsafe {
            self.device.destroy_pipeline_layout(layout, None);
            self.device.destroy_descriptor_set_layout(set_layout, None);
        }
    }

    pub(super) fn build_deform_pipeline(&self) -> RaytraceResult<GpuPipeline> {
        let spirv = compile_wgsl(DEFORM_WGSL, naga::ShaderStage::Compute, DEFORM_ENTRY_POINT)?;
        let module = self.shader_module(&spirv)?;

        let bindings: Vec<_> = (0..DEFORM_BINDING_COUNT)
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
            })
            .collect();
        let set_layout = match self.set_layout(&bindings) {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { self.device.destroy_shader_module(module, None) };
                return Err(e);
            }
        };
        let push_constants = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(std::mem::size_of::<DeformMeshInfo>() as u32)];
        let layout = match self.pipeline_layout(set_layout, &push_constants) {
            Ok(layout) => layout,
            Err(e) => {
                unsafe {
                    self.device.destroy_shader_module(module, None);
                    self.device.destroy_descriptor_set_layout(set_layout, None);
                }
                return Err(e);
            }
        };

        let entry = CString::new(DEFORM_ENTRY_POINT)
            .map_err(|e| RaytraceError::ShaderCompilationFailed(e.to_string()))?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entry);
        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);

        let result = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
        };
        unsafe { self.device.destroy_shader_module(module, None) };
        let pipeline = match result {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                self.discard_layouts(layout, set_layout);
                return Err(self.fail("create deform pipeline", e));
            }
        };

        log::debug!("Created deform pipeline");
        Ok(GpuPipeline::Vulkan {
            device: self.device.clone(),
            pipeline,
            layout,
            set_layout,
            kind: PipelineKind::Deform,
        })
    }

    pub(super) fn build_ray_pipeline(
        &self,
        programs: &RayProgramLibrary,
    ) -> RaytraceResult<GpuPipeline> {
        if programs.is_builtin() {
            return Err(RaytraceError::FeatureNotSupported(
                "the Vulkan backend needs compiled ray programs".to_string(),
            ));
        }

        let ray_stages = vk::ShaderStageFlags::RAYGEN_KHR
            | vk::ShaderStageFlags::MISS_KHR
            | vk::ShaderStageFlags::CLOSEST_HIT_KHR;
        let binding = |binding: u32, ty: vk::DescriptorType| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(ty)
                .descriptor_count(1)
                .stage_flags(ray_stages)
        };
        let bindings = [
            binding(ray_binding::TLAS, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR),
            binding(ray_binding::INSTANCE_DATA, vk::DescriptorType::STORAGE_BUFFER),
            binding(ray_binding::CONSTANTS, vk::DescriptorType::UNIFORM_BUFFER),
            binding(ray_binding::OUTPUT, vk::DescriptorType::STORAGE_IMAGE),
            binding(ray_binding::HINT, vk::DescriptorType::STORAGE_IMAGE),
        ];
        let set_layout = self.set_layout(&bindings)?;
        let layout = match self.pipeline_layout(set_layout, &[]) {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { self.device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(e);
            }
        };
        let module = match self.shader_module(&programs.spirv) {
            Ok(module) => module,
            Err(e) => {
                self.discard_layouts(layout, set_layout);
                return Err(e);
            }
        };

        let names = programs
            .raygen
            .iter()
            .chain(&programs.miss)
            .chain(&programs.closest_hit)
            .map(|name| CString::new(name.as_str()))
            .collect::<Result<Vec<_>, _>>();
        let names = match names {
            Ok(names) => names,
            Err(e) => {
                unsafe { self.device.destroy_shader_module(module, None) };
                self.discard_layouts(layout, set_layout);
                return Err(RaytraceError::InvalidParameter(e.to_string()));
            }
        };

        // Stage i backs group i: raygen, then miss, then closest hit.
        let raygen_count = programs.raygen.len();
        let miss_count = programs.miss.len();
        let mut stages = Vec::with_capacity(names.len());
        let mut groups = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            let (stage, general) = if i < raygen_count {
                (vk::ShaderStageFlags::RAYGEN_KHR, true)
            } else if i < raygen_count + miss_count {
                (vk::ShaderStageFlags::MISS_KHR, true)
            } else {
                (vk::ShaderStageFlags::CLOSEST_HIT_KHR, false)
            };
            stages.push(
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage)
                    .module(module)
                    .name(name),
            );
            let group = vk::RayTracingShaderGroupCreateInfoKHR::default()
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR);
            groups.push(if general {
                group
                    .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                    .general_shader(i as u32)
                    .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            } else {
                group
                    .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                    .general_shader(vk::SHADER_UNUSED_KHR)
                    .closest_hit_shader(i as u32)
            });
        }
        debug_assert_eq!(groups.len() as u32, PROGRAM_GROUP_COUNT);

        // Camera rays spawn shadow rays from their hit program.
        let create_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(2)
            .layout(layout);
        let result = unsafe {
            self.rt_loader.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[create_info],
                None,
            )
        };
        unsafe { self.device.destroy_shader_module(module, None) };
        let pipeline = match result {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                self.discard_layouts(layout, set_layout);
                return Err(self.fail("create ray tracing pipeline", e));
            }
        };

        log::debug!("Created ray tracing pipeline with {} groups", groups.len());
        Ok(GpuPipeline::Vulkan {
            device: self.device.clone(),
            pipeline,
            layout,
            set_layout,
            kind: PipelineKind::Ray,
        })
    }

    pub(super) fn group_handles(&self, pipeline: &GpuPipeline) -> RaytraceResult<Vec<u8>> {
        let GpuPipeline::Vulkan { pipeline, kind, .. } = pipeline else {
            return Err(RaytraceError::InvalidParameter(
                "pipeline belongs to another backend".to_string(),
            ));
        };
        if *kind != PipelineKind::Ray {
            return Err(RaytraceError::InvalidParameter(
                "program identifiers requested from a compute pipeline".to_string(),
            ));
        }
        let size = self.limits.shader_group_handle_size as usize * PROGRAM_GROUP_COUNT as usize;
        unsafe {
            self.rt_loader.get_ray_tracing_shader_group_handles(
                *pipeline,
                0,
                PROGRAM_GROUP_COUNT,
                size,
            )
        }
        .map_err(|e| self.fail("get shader group handles", e))
    }
}
