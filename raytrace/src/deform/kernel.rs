//! Reference evaluation of the deformation kernel.
//!
//! This is the per-vertex function the compute pass runs, written for the
//! CPU. The software backend executes deformation dispatches with it, and it
//! matches `deform.wgsl` operation for operation so both produce the same
//! positions for the same tables.

use glam::{Mat4, Vec3, Vec4};

use crate::types::{
    BlendshapeFrameInfo, BlendshapeInfo, BoneCount, BoneWeightData, DeformFlags, DeformMeshInfo,
};

/// Blendshape inputs of one dispatch.
#[derive(Debug, Clone, Copy)]
pub struct BlendshapeTables<'a> {
    /// Deltas ordered by blendshape, then frame, then vertex.
    pub deltas: &'a [[f32; 4]],
    pub frames: &'a [BlendshapeFrameInfo],
    pub shapes: &'a [BlendshapeInfo],
    /// Normalized channel weights.
    pub weights: &'a [f32],
}

/// Skinning inputs of one dispatch.
#[derive(Debug, Clone, Copy)]
pub struct SkinTables<'a> {
    pub bone_counts: &'a [BoneCount],
    pub bone_weights: &'a [BoneWeightData],
    /// Bone matrices already combined with bind poses and the inverse
    /// instance transform.
    pub bone_matrices: &'a [Mat4],
}

/// All inputs of one deformation dispatch.
#[derive(Debug, Clone, Copy)]
pub struct DeformTables<'a> {
    pub info: DeformMeshInfo,
    pub blendshapes: Option<BlendshapeTables<'a>>,
    pub skin: Option<SkinTables<'a>>,
}

impl DeformTables<'_> {
    fn flags(&self) -> DeformFlags {
        DeformFlags::from_bits_truncate(self.info.deform_flags)
    }
}

/// Offset of one blendshape channel at a normalized weight.
///
/// Below the first frame the first delta is scaled linearly from zero.
/// Between two frames the deltas are interpolated. Past the last frame the
/// last segment is extrapolated.
fn blendshape_offset(tables: &BlendshapeTables<'_>, shape: usize, vertex: usize) -> Vec3 {
    let Some(info) = tables.shapes.get(shape) else {
        return Vec3::ZERO;
    };
    let weight = tables.weights.get(shape).copied().unwrap_or(0.0);
    if weight == 0.0 || info.frame_count == 0 {
        return Vec3::ZERO;
    }

    let frame = |i: u32| -> Option<(f32, Vec3)> {
        let f = tables.frames.get((info.frame_offset + i) as usize)?;
        let d = tables.deltas.get(f.delta_offset as usize + vertex)?;
        Some((f.weight, Vec3::new(d[0], d[1], d[2])))
    };

    let Some((first_weight, first_delta)) = frame(0) else {
        return Vec3::ZERO;
    };
    if info.frame_count == 1 || weight <= first_weight {
        if first_weight == 0.0 {
            return Vec3::ZERO;
        }
        return first_delta * (weight / first_weight);
    }

    let mut upper = 1;
    while upper + 1 < info.frame_count {
        match frame(upper) {
            Some((w, _)) if w < weight => upper += 1,
            _ => break,
        }
    }
    let (Some((w0, d0)), Some((w1, d1))) = (frame(upper - 1), frame(upper)) else {
        return Vec3::ZERO;
    };
    let span = w1 - w0;
    if span <= 0.0 {
        return d1;
    }
    d0.lerp(d1, (weight - w0) / span)
}

/// Deforms one vertex position.
pub fn deform_vertex(tables: &DeformTables<'_>, vertex: u32, position: Vec3) -> Vec4 {
    let flags = tables.flags();
    let v = vertex as usize;
    let mut p = position;

    if flags.contains(DeformFlags::BLENDSHAPE) {
        if let Some(bs) = &tables.blendshapes {
            for shape in 0..tables.info.blendshape_count as usize {
                p += blendshape_offset(bs, shape, v);
            }
        }
    }

    if flags.contains(DeformFlags::SKINNING) {
        if let Some(skin) = &tables.skin {
            if let Some(count) = skin.bone_counts.get(v) {
                let start = count.weight_offset as usize;
                let end = start + count.weight_count as usize;
                if count.weight_count > 0 && end <= skin.bone_weights.len() {
                    let mut skinned = Vec3::ZERO;
                    for w in &skin.bone_weights[start..end] {
                        if let Some(m) = skin.bone_matrices.get(w.index as usize) {
                            skinned += m.transform_point3(p) * w.weight;
                        }
                    }
                    p = skinned;
                }
            }
        }
    }

    p.extend(1.0)
}

/// Deforms every vertex of a mesh.
///
/// `source` holds the raw vertex words; positions are the first three words
/// of each vertex, located with the stride and offset of `tables.info`.
pub fn deform_all(tables: &DeformTables<'_>, source: &[f32]) -> Vec<[f32; 4]> {
    let info = tables.info;
    (0..info.vertex_count)
        .map(|v| {
            let base = (info.vertex_offset + v * info.vertex_stride) as usize;
            let position = match source.get(base..base + 3) {
                Some(p) => Vec3::new(p[0], p[1], p[2]),
                None => Vec3::ZERO,
            };
            deform_vertex(tables, v, position).to_array()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(vertex_count: u32, flags: DeformFlags, blendshape_count: u32) -> DeformMeshInfo {
        DeformMeshInfo {
            vertex_count,
            vertex_stride: 3,
            vertex_offset: 0,
            deform_flags: flags.bits(),
            blendshape_count,
            _pad: [0; 3],
        }
    }

    #[test]
    fn test_single_frame_scales_by_weight() {
        let deltas = [[0.0, 2.0, 0.0, 0.0]];
        let frames = [BlendshapeFrameInfo {
            delta_offset: 0,
            weight: 1.0,
        }];
        let shapes = [BlendshapeInfo {
            frame_count: 1,
            frame_offset: 0,
        }];

        for (weight, expected) in [(0.0, 0.0), (0.5, 1.0), (1.0, 2.0)] {
            let weights = [weight];
            let tables = DeformTables {
                info: info(1, DeformFlags::BLENDSHAPE, 1),
                blendshapes: Some(BlendshapeTables {
                    deltas: &deltas,
                    frames: &frames,
                    shapes: &shapes,
                    weights: &weights,
                }),
                skin: None,
            };
            let out = deform_vertex(&tables, 0, Vec3::ZERO);
            assert!((out.y - expected).abs() < 1e-6, "weight {weight}");
            assert_eq!(out.w, 1.0);
        }
    }

    #[test]
    fn test_frames_interpolate() {
        // Two frames at 50% and 100%, one vertex each.
        let deltas = [[1.0, 0.0, 0.0, 0.0], [3.0, 0.0, 0.0, 0.0]];
        let frames = [
            BlendshapeFrameInfo {
                delta_offset: 0,
                weight: 0.5,
            },
            BlendshapeFrameInfo {
                delta_offset: 1,
                weight: 1.0,
            },
        ];
        let shapes = [BlendshapeInfo {
            frame_count: 2,
            frame_offset: 0,
        }];
        let weights = [0.75];
        let tables = DeformTables {
            info: info(1, DeformFlags::BLENDSHAPE, 1),
            blendshapes: Some(BlendshapeTables {
                deltas: &deltas,
                frames: &frames,
                shapes: &shapes,
                weights: &weights,
            }),
            skin: None,
        };
        let out = deform_vertex(&tables, 0, Vec3::ZERO);
        assert!((out.x - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_linear_blend_skinning() {
        let counts = [BoneCount {
            weight_count: 2,
            weight_offset: 0,
        }];
        let weights = [
            BoneWeightData {
                weight: 0.5,
                index: 0,
            },
            BoneWeightData {
                weight: 0.5,
                index: 1,
            },
        ];
        let matrices = [
            Mat4::IDENTITY,
            Mat4::from_translation(Vec3::new(0.0, 4.0, 0.0)),
        ];
        let tables = DeformTables {
            info: info(1, DeformFlags::SKINNING, 0),
            blendshapes: None,
            skin: Some(SkinTables {
                bone_counts: &counts,
                bone_weights: &weights,
                bone_matrices: &matrices,
            }),
        };
        let out = deform_vertex(&tables, 0, Vec3::X);
        assert!((out.truncate() - Vec3::new(1.0, 2.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn test_deform_all_reads_stride() {
        let mut info = info(2, DeformFlags::empty(), 0);
        info.vertex_stride = 5;
        let source = [1.0, 2.0, 3.0, 9.0, 9.0, 4.0, 5.0, 6.0, 9.0, 9.0];
        let tables = DeformTables {
            info,
            blendshapes: None,
            skin: None,
        };
        let out = deform_all(&tables, &source);
        assert_eq!(out, vec![[1.0, 2.0, 3.0, 1.0], [4.0, 5.0, 6.0, 1.0]]);
    }
}
