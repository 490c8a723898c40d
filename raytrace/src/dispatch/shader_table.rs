//! Fixed-stride shader table.
//!
//! Records are laid out as three regions: ray generation, miss, hit. Each
//! record holds a program identifier followed by the inline root data, and
//! every record of the table shares one stride.

use std::sync::Arc;

use crate::backend::{GpuBuffer, GpuPipeline, RtBackend, ShaderTableRegion, ShaderTableRegions};
use crate::error::{RaytraceError, RaytraceResult};
use crate::types::{BufferDescriptor, BufferUsage, MemoryLocation};

/// Number of program groups in the ray pipeline.
pub const PROGRAM_GROUP_COUNT: u32 = 7;

/// Number of records the table buffer is sized for.
pub const SHADER_TABLE_CAPACITY: u32 = 32;

/// Ray generation variants. Group indices 0..3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RayGenProgram {
    /// One sample per pixel.
    Default,
    /// Traces only where the lower resolution hint is not uniform.
    AdaptiveSampling,
    /// Supersamples edges of the full resolution result.
    Antialiasing,
}

impl RayGenProgram {
    pub const ALL: [Self; 3] = [Self::Default, Self::AdaptiveSampling, Self::Antialiasing];

    pub fn group(self) -> u32 {
        self as u32
    }

    pub fn from_group(group: u32) -> Option<Self> {
        Self::ALL.get(group as usize).copied()
    }
}

/// Miss programs, one per ray purpose. Group indices 3..5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MissProgram {
    Camera = 0,
    Shadow = 1,
}

impl MissProgram {
    pub const ALL: [Self; 2] = [Self::Camera, Self::Shadow];

    pub fn group(self) -> u32 {
        RayGenProgram::ALL.len() as u32 + self as u32
    }
}

/// Hit groups, one per ray purpose. Group indices 5..7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HitGroup {
    Camera = 0,
    Shadow = 1,
}

impl HitGroup {
    pub const ALL: [Self; 2] = [Self::Camera, Self::Shadow];

    pub fn group(self) -> u32 {
        (RayGenProgram::ALL.len() + MissProgram::ALL.len()) as u32 + self as u32
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    value.div_ceil(alignment) * alignment
}

/// Byte layout of the table for a given device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderTableLayout {
    pub stride: u64,
    pub raygen_offset: u64,
    pub miss_offset: u64,
    pub hit_offset: u64,
    pub size: u64,
}

impl ShaderTableLayout {
    /// Computes the layout for records of `identifier_size + inline_size` bytes.
    pub fn new(
        identifier_size: u32,
        inline_size: u32,
        record_alignment: u32,
        table_alignment: u32,
    ) -> RaytraceResult<Self> {
        let stride = align_up(
            (identifier_size + inline_size) as u64,
            record_alignment as u64,
        );
        let table_alignment = table_alignment as u64;
        let raygen_offset = 0;
        let miss_offset = align_up(
            raygen_offset + stride * RayGenProgram::ALL.len() as u64,
            table_alignment,
        );
        let hit_offset = align_up(
            miss_offset + stride * MissProgram::ALL.len() as u64,
            table_alignment,
        );
        let used = hit_offset + stride * HitGroup::ALL.len() as u64;
        let size = align_up(stride * SHADER_TABLE_CAPACITY as u64, table_alignment);
        if used > size {
            return Err(RaytraceError::InvalidParameter(format!(
                "shader table needs {used} bytes, capacity is {size}"
            )));
        }
        Ok(Self {
            stride,
            raygen_offset,
            miss_offset,
            hit_offset,
            size,
        })
    }
}

/// Shader records of one ray pipeline, uploaded once.
pub struct ShaderTable {
    buffer: Arc<GpuBuffer>,
    layout: ShaderTableLayout,
}

impl ShaderTable {
    /// Builds the table for `pipeline`. `inline_data` is copied after the
    /// identifier of every record.
    pub fn new(
        backend: &dyn RtBackend,
        pipeline: &GpuPipeline,
        inline_data: &[u8],
    ) -> RaytraceResult<Self> {
        let caps = backend.capabilities();
        let id_size = caps.program_identifier_size;
        let layout = ShaderTableLayout::new(
            id_size,
            inline_data.len() as u32,
            caps.shader_record_alignment,
            caps.shader_table_alignment,
        )?;

        let identifiers = backend.program_identifiers(pipeline)?;
        let expected = (id_size * PROGRAM_GROUP_COUNT) as usize;
        if identifiers.len() != expected {
            return Err(RaytraceError::ShaderCompilationFailed(format!(
                "pipeline reported {} identifier bytes, expected {expected}",
                identifiers.len()
            )));
        }

        let mut data = vec![0u8; layout.size as usize];
        let mut write_record = |offset: u64, group: u32| {
            let start = offset as usize;
            let id = &identifiers[(group * id_size) as usize..((group + 1) * id_size) as usize];
            data[start..start + id.len()].copy_from_slice(id);
            let inline_start = start + id.len();
            data[inline_start..inline_start + inline_data.len()].copy_from_slice(inline_data);
        };
        for program in RayGenProgram::ALL {
            write_record(
                layout.raygen_offset + program.group() as u64 * layout.stride,
                program.group(),
            );
        }
        for miss in MissProgram::ALL {
            write_record(
                layout.miss_offset + miss as u64 * layout.stride,
                miss.group(),
            );
        }
        for hit in HitGroup::ALL {
            write_record(layout.hit_offset + hit as u64 * layout.stride, hit.group());
        }

        let buffer = backend.create_buffer(
            &BufferDescriptor::new(layout.size, BufferUsage::SHADER_TABLE)
                .with_label("shader table")
                .with_location(MemoryLocation::CpuToGpu),
        )?;
        backend.write_buffer(&buffer, 0, &data)?;
        log::debug!(
            "Shader table: stride {} bytes, {} records, {} bytes",
            layout.stride,
            PROGRAM_GROUP_COUNT,
            layout.size
        );

        Ok(Self {
            buffer: Arc::new(buffer),
            layout,
        })
    }

    pub fn layout(&self) -> &ShaderTableLayout {
        &self.layout
    }

    pub fn buffer(&self) -> &Arc<GpuBuffer> {
        &self.buffer
    }

    /// Regions selecting `program` as the ray generation record.
    pub fn regions(&self, program: RayGenProgram) -> ShaderTableRegions {
        let stride = self.layout.stride;
        ShaderTableRegions {
            buffer: Arc::clone(&self.buffer),
            raygen: ShaderTableRegion {
                offset: self.layout.raygen_offset + program.group() as u64 * stride,
                stride,
                size: stride,
            },
            miss: ShaderTableRegion {
                offset: self.layout.miss_offset,
                stride,
                size: stride * MissProgram::ALL.len() as u64,
            },
            hit: ShaderTableRegion {
                offset: self.layout.hit_offset,
                stride,
                size: stride * HitGroup::ALL.len() as u64,
            },
        }
    }
}

impl std::fmt::Debug for ShaderTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderTable")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use crate::config::RayProgramLibrary;

    #[test]
    fn test_group_indices() {
        let mut groups: Vec<u32> = RayGenProgram::ALL.iter().map(|p| p.group()).collect();
        groups.extend(MissProgram::ALL.iter().map(|m| m.group()));
        groups.extend(HitGroup::ALL.iter().map(|h| h.group()));
        assert_eq!(groups, (0..PROGRAM_GROUP_COUNT).collect::<Vec<_>>());
        assert_eq!(RayGenProgram::from_group(2), Some(RayGenProgram::Antialiasing));
        assert_eq!(RayGenProgram::from_group(3), None);
    }

    #[test]
    fn test_layout_alignment() {
        let layout = ShaderTableLayout::new(32, 8, 32, 64).unwrap();
        assert_eq!(layout.stride, 64);
        assert_eq!(layout.miss_offset % 64, 0);
        assert_eq!(layout.hit_offset % 64, 0);
        assert!(layout.miss_offset >= 3 * layout.stride);
        assert!(layout.hit_offset >= layout.miss_offset + 2 * layout.stride);
    }

    #[test]
    fn test_table_records() {
        let backend = SoftwareBackend::new();
        let pipeline = backend
            .create_ray_pipeline(&RayProgramLibrary::default())
            .unwrap();
        let table = ShaderTable::new(&backend, &pipeline, &[0xAB; 8]).unwrap();
        let id_size = backend.capabilities().program_identifier_size as u64;

        let regions = table.regions(RayGenProgram::AdaptiveSampling);
        assert_eq!(regions.raygen.size, regions.raygen.stride);
        let record = backend
            .read_buffer(table.buffer(), regions.raygen.offset, id_size + 8)
            .unwrap();
        assert_eq!(
            crate::backend::software::decode_program_identifier(&record[..id_size as usize]),
            Some(RayGenProgram::AdaptiveSampling.group())
        );
        assert_eq!(&record[id_size as usize..], &[0xAB; 8]);
    }
}
