//! Ray traversal and the built-in shadow programs of the software backend.

use std::sync::Arc;

use glam::{Mat4, Vec2, Vec3};

use hardshadow_core::{InstanceFlags, RenderFlags};

use super::{AccelContent, SoftAccelInner};
use crate::dispatch::shader_table::RayGenProgram;
use crate::error::{RaytraceError, RaytraceResult};
use crate::types::{InstanceData, InstanceDescFlags, InstanceMask, LightData, SceneConstants};

/// Triangles of a built bottom-level structure, in object space.
#[derive(Debug, Clone)]
pub(crate) struct BottomLevel {
    pub triangles: Vec<[Vec3; 3]>,
    pub min: Vec3,
    pub max: Vec3,
    pub allow_update: bool,
}

impl BottomLevel {
    pub fn new(triangles: Vec<[Vec3; 3]>, allow_update: bool) -> Self {
        let (min, max) = triangles.iter().flatten().fold(
            (Vec3::splat(f32::INFINITY), Vec3::splat(f32::NEG_INFINITY)),
            |(min, max), p| (min.min(*p), max.max(*p)),
        );
        Self {
            triangles,
            min,
            max,
            allow_update,
        }
    }
}

/// One instance row of a built top-level structure.
#[derive(Clone)]
pub(crate) struct TopInstance {
    pub object_to_world: Mat4,
    pub custom_index: u32,
    pub mask: u8,
    pub flags: InstanceDescFlags,
    pub blas: Arc<SoftAccelInner>,
}

impl std::fmt::Debug for TopInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopInstance")
            .field("custom_index", &self.custom_index)
            .field("mask", &self.mask)
            .field("flags", &self.flags)
            .field("blas", &format_args!("{:#x}", self.blas.address))
            .finish()
    }
}

/// Instance resolved for traversal: inverse transform and current geometry.
struct ResolvedInstance {
    world_to_object: Mat4,
    custom_index: u32,
    mask: u8,
    flags: InstanceDescFlags,
    data: InstanceData,
    geometry: Arc<BottomLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cull {
    None,
    Back,
    Front,
}

#[derive(Debug, Clone, Copy)]
struct Ray {
    origin: Vec3,
    direction: Vec3,
    t_min: f32,
    t_max: f32,
}

#[derive(Debug, Clone, Copy)]
struct Hit {
    t: f32,
    instance: usize,
}

/// Möller-Trumbore intersection. Counter-clockwise triangles are front facing.
fn intersect_triangle(ray: &Ray, tri: &[Vec3; 3], cull: Cull) -> Option<(f32, bool)> {
    const EPSILON: f32 = 1e-9;
    let e1 = tri[1] - tri[0];
    let e2 = tri[2] - tri[0];
    let p = ray.direction.cross(e2);
    let det = e1.dot(p);
    if det.abs() < EPSILON {
        return None;
    }
    let front = det > 0.0;
    match cull {
        Cull::Back if !front => return None,
        Cull::Front if front => return None,
        _ => {}
    }
    let inv_det = 1.0 / det;
    let s = ray.origin - tri[0];
    let u = s.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let v = ray.direction.dot(q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(q) * inv_det;
    (t > ray.t_min && t < ray.t_max).then_some((t, front))
}

fn intersects_bounds(ray: &Ray, min: Vec3, max: Vec3) -> bool {
    let inv = ray.direction.recip();
    let t0 = (min - ray.origin) * inv;
    let t1 = (max - ray.origin) * inv;
    let near = t0.min(t1).max_element().max(ray.t_min);
    let far = t0.max(t1).min_element().min(ray.t_max);
    near <= far
}

/// Top-level structure snapshot used by one dispatch.
struct SceneView {
    instances: Vec<ResolvedInstance>,
}

impl SceneView {
    fn resolve(rows: &[TopInstance], instance_data: &[InstanceData]) -> RaytraceResult<Self> {
        let mut instances = Vec::with_capacity(rows.len());
        for row in rows {
            let geometry = match &*row.blas.content.read() {
                AccelContent::Bottom(bottom) => Arc::clone(bottom),
                _ => {
                    return Err(RaytraceError::InvalidParameter(format!(
                        "instance {} references an unbuilt bottom-level structure",
                        row.custom_index
                    )));
                }
            };
            let data = instance_data
                .get(row.custom_index as usize)
                .copied()
                .ok_or_else(|| {
                    RaytraceError::InvalidParameter(format!(
                        "no instance data for custom index {}",
                        row.custom_index
                    ))
                })?;
            instances.push(ResolvedInstance {
                world_to_object: row.object_to_world.inverse(),
                custom_index: row.custom_index,
                mask: row.mask,
                flags: row.flags,
                data,
                geometry,
            });
        }
        Ok(Self { instances })
    }

    /// Walks every candidate intersection. `visit` returns true to stop.
    fn traverse(
        &self,
        ray: &Ray,
        mask: u8,
        cull: impl Fn(&ResolvedInstance) -> Option<Cull>,
        mut visit: impl FnMut(Hit) -> bool,
    ) {
        for (index, inst) in self.instances.iter().enumerate() {
            if inst.mask & mask == 0 {
                continue;
            }
            let Some(mode) = cull(inst) else {
                continue;
            };
            let mode = if inst.flags.contains(InstanceDescFlags::TRIANGLE_CULL_DISABLE) {
                Cull::None
            } else {
                mode
            };
            let local = Ray {
                origin: inst.world_to_object.transform_point3(ray.origin),
                direction: inst.world_to_object.transform_vector3(ray.direction),
                ..*ray
            };
            if !intersects_bounds(&local, inst.geometry.min, inst.geometry.max) {
                continue;
            }
            for tri in &inst.geometry.triangles {
                if let Some((t, _)) = intersect_triangle(&local, tri, mode) {
                    if visit(Hit { t, instance: index }) {
                        return;
                    }
                }
            }
        }
    }

    fn closest_hit(
        &self,
        ray: &Ray,
        mask: u8,
        cull: impl Fn(&ResolvedInstance) -> Option<Cull>,
    ) -> Option<Hit> {
        let mut closest: Option<Hit> = None;
        self.traverse(ray, mask, cull, |hit| {
            if closest.is_none_or(|c| hit.t < c.t) {
                closest = Some(hit);
            }
            false
        });
        closest
    }

    fn any_hit(
        &self,
        ray: &Ray,
        mask: u8,
        cull: impl Fn(&ResolvedInstance) -> Option<Cull>,
        accept: impl Fn(&Hit) -> bool,
    ) -> bool {
        let mut found = false;
        self.traverse(ray, mask, cull, |hit| {
            found = accept(&hit);
            found
        });
        found
    }
}

/// Evaluates the shadow programs for one pixel sample.
struct ShadowTracer<'a> {
    scene: &'a SceneView,
    constants: &'a SceneConstants,
    inverse_view_projection: Mat4,
    render_flags: RenderFlags,
    size: Vec2,
}

impl<'a> ShadowTracer<'a> {
    fn new(scene: &'a SceneView, constants: &'a SceneConstants, width: u32, height: u32) -> Self {
        let view = Mat4::from_cols_array_2d(&constants.camera.view);
        let projection = Mat4::from_cols_array_2d(&constants.camera.projection);
        Self {
            scene,
            constants,
            inverse_view_projection: (projection * view).inverse(),
            render_flags: RenderFlags::from_bits_truncate(constants.render_flags),
            size: Vec2::new(width as f32, height as f32),
        }
    }

    fn camera_ray(&self, pixel: Vec2) -> Option<Ray> {
        let ndc = Vec2::new(
            pixel.x / self.size.x * 2.0 - 1.0,
            1.0 - pixel.y / self.size.y * 2.0,
        );
        let near = self
            .inverse_view_projection
            .project_point3(ndc.extend(-1.0));
        let far = self.inverse_view_projection.project_point3(ndc.extend(1.0));
        let span = far - near;
        let length = span.length();
        if !length.is_finite() || length <= 0.0 {
            return None;
        }
        Some(Ray {
            origin: near,
            direction: span / length,
            t_min: 0.0,
            t_max: length,
        })
    }

    fn camera_cull(&self, inst: &ResolvedInstance) -> Option<Cull> {
        if inst.data.layer_mask & self.constants.camera.layer_mask == 0 {
            return None;
        }
        let flags = InstanceFlags::from_bits_truncate(inst.data.instance_flags);
        Some(if flags.contains(InstanceFlags::CULL_FRONT) {
            Cull::Front
        } else if flags.contains(InstanceFlags::CULL_BACK)
            || self.render_flags.contains(RenderFlags::CULL_BACK_FACES)
        {
            Cull::Back
        } else {
            Cull::None
        })
    }

    fn caster_cull(&self, inst: &ResolvedInstance, light: &LightData) -> Option<Cull> {
        if inst.data.layer_mask & light.layer_mask == 0 {
            return None;
        }
        let flags = InstanceFlags::from_bits_truncate(inst.data.instance_flags);
        let cull = if flags.contains(InstanceFlags::CULL_FRONT_SHADOW) {
            Cull::Front
        } else if flags.contains(InstanceFlags::CULL_BACK_SHADOW) {
            Cull::Back
        } else {
            Cull::None
        };
        Some(match (cull, self.render_flags.contains(RenderFlags::FLIP_CASTER_FACES)) {
            (Cull::Front, true) => Cull::Back,
            (Cull::Back, true) => Cull::Front,
            (cull, _) => cull,
        })
    }

    /// Direction and length of the shadow ray toward a light, or `None` if
    /// the point is outside the light's reach.
    fn light_ray(light: &LightData, position: Vec3) -> Option<(Vec3, f32)> {
        let light_position = Vec3::from_array(light.position);
        let light_direction = Vec3::from_array(light.direction);
        match light.light_type {
            1 => Some((-light_direction, f32::MAX)),
            2 | 3 => {
                let to_light = light_position - position;
                let distance = to_light.length();
                if distance > light.range || distance <= 0.0 {
                    return None;
                }
                let direction = to_light / distance;
                if light.light_type == 2 {
                    let angle = (-direction).dot(light_direction).clamp(-1.0, 1.0).acos();
                    if angle > light.spot_angle * 0.5 {
                        return None;
                    }
                }
                Some((direction, distance))
            }
            4 => {
                let away = position - light_position;
                let distance = away.length();
                if distance > light.range || distance <= 0.0 {
                    return None;
                }
                Some((away / distance, light.range - distance))
            }
            _ => None,
        }
    }

    /// Shadow value of one sample: the fraction of reachable lights that are blocked.
    fn shade(&self, pixel: Vec2) -> f32 {
        let Some(ray) = self.camera_ray(pixel) else {
            return 0.0;
        };
        let Some(hit) = self
            .scene
            .closest_hit(&ray, InstanceMask::RECEIVER, |inst| self.camera_cull(inst))
        else {
            return 0.0;
        };

        let receiver = &self.scene.instances[hit.instance];
        let receiver_flags = InstanceFlags::from_bits_truncate(receiver.data.instance_flags);
        if !receiver_flags.contains(InstanceFlags::RECEIVE_SHADOWS) {
            return 0.0;
        }

        let offset = self.constants.shadow_ray_offset;
        let position = ray.origin + ray.direction * (hit.t - offset);
        let ignore_self = self.render_flags.contains(RenderFlags::IGNORE_SELF_SHADOW);
        let keep_drop = self.render_flags.contains(RenderFlags::KEEP_SELF_DROP_SHADOW);
        let threshold = self.constants.self_shadow_threshold;

        let mut reached = 0u32;
        let mut blocked = 0u32;
        let light_count = (self.constants.light_count as usize).min(self.constants.lights.len());
        for light in &self.constants.lights[..light_count] {
            if light.layer_mask & receiver.data.layer_mask == 0 {
                continue;
            }
            let Some((direction, t_max)) = Self::light_ray(light, position) else {
                continue;
            };
            reached += 1;
            let shadow_ray = Ray {
                origin: position,
                direction,
                t_min: 0.0,
                t_max,
            };
            let occluded = self.scene.any_hit(
                &shadow_ray,
                InstanceMask::CASTER,
                |inst| self.caster_cull(inst, light),
                |caster| {
                    let same = self.scene.instances[caster.instance].custom_index
                        == receiver.custom_index;
                    !(same && ignore_self) || (keep_drop && caster.t > threshold)
                },
            );
            if occluded {
                blocked += 1;
            }
        }
        if reached == 0 {
            0.0
        } else {
            blocked as f32 / reached as f32
        }
    }
}

/// Grid of shadow values read by the refinement programs.
pub(crate) struct Hint<'a> {
    pub texels: &'a [[f32; 4]],
    pub width: u32,
    pub height: u32,
}

impl Hint<'_> {
    fn at(&self, x: i64, y: i64) -> f32 {
        let x = x.clamp(0, self.width as i64 - 1) as usize;
        let y = y.clamp(0, self.height as i64 - 1) as usize;
        self.texels[y * self.width as usize + x][0]
    }
}

/// Inputs of one software ray dispatch.
pub(crate) struct DispatchInputs<'a> {
    pub program: RayGenProgram,
    pub rows: &'a [TopInstance],
    pub instance_data: &'a [InstanceData],
    pub constants: &'a SceneConstants,
    pub width: u32,
    pub height: u32,
    pub hint: Option<Hint<'a>>,
}

/// Runs one dispatch and writes the shadow value into every channel of `output`.
pub(crate) fn dispatch_rays(inputs: &DispatchInputs<'_>, output: &mut [[f32; 4]]) -> RaytraceResult<()> {
    let scene = SceneView::resolve(inputs.rows, inputs.instance_data)?;
    let tracer = ShadowTracer::new(&scene, inputs.constants, inputs.width, inputs.height);
    let (w, h) = (inputs.width, inputs.height);
    if output.len() < (w as usize) * (h as usize) {
        return Err(RaytraceError::InvalidParameter(format!(
            "output holds {} texels, dispatch covers {w}x{h}",
            output.len()
        )));
    }

    let hint = match (inputs.program, &inputs.hint) {
        (RayGenProgram::Default, _) => None,
        (_, Some(hint)) => Some(hint),
        (program, None) => {
            return Err(RaytraceError::InvalidParameter(format!(
                "{program:?} dispatch needs a hint texture"
            )));
        }
    };

    for y in 0..h {
        for x in 0..w {
            let center = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
            let value = match (inputs.program, hint) {
                (RayGenProgram::AdaptiveSampling, Some(hint)) => {
                    let hx = (x as u64 * hint.width as u64 / w as u64) as i64;
                    let hy = (y as u64 * hint.height as u64 / h as u64) as i64;
                    let seed = hint.at(hx, hy);
                    let uniform = (-1..=1)
                        .flat_map(|dy| (-1..=1).map(move |dx| (dx, dy)))
                        .all(|(dx, dy)| hint.at(hx + dx, hy + dy) == seed);
                    if uniform { seed } else { tracer.shade(center) }
                }
                (RayGenProgram::Antialiasing, Some(hint)) => {
                    let (xi, yi) = (x as i64, y as i64);
                    let seed = hint.at(xi, yi);
                    let edge = [(-1, 0), (1, 0), (0, -1), (0, 1)]
                        .iter()
                        .any(|&(dx, dy)| hint.at(xi + dx, yi + dy) != seed);
                    if edge {
                        let samples = [(0.25, 0.25), (0.75, 0.25), (0.25, 0.75), (0.75, 0.75)];
                        samples
                            .iter()
                            .map(|&(sx, sy)| tracer.shade(Vec2::new(x as f32 + sx, y as f32 + sy)))
                            .sum::<f32>()
                            / samples.len() as f32
                    } else {
                        seed
                    }
                }
                _ => tracer.shade(center),
            };
            output[(y * w + x) as usize] = [value; 4];
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triangle_facing() {
        let tri = [Vec3::ZERO, Vec3::X, Vec3::Y];
        // Looking down -Z at a counter-clockwise triangle: front face.
        let ray = Ray {
            origin: Vec3::new(0.25, 0.25, 1.0),
            direction: Vec3::NEG_Z,
            t_min: 0.0,
            t_max: 10.0,
        };
        assert_eq!(intersect_triangle(&ray, &tri, Cull::None), Some((1.0, true)));
        assert!(intersect_triangle(&ray, &tri, Cull::Front).is_none());
        assert!(intersect_triangle(&ray, &tri, Cull::Back).is_some());

        let behind = Ray {
            origin: Vec3::new(0.25, 0.25, -1.0),
            direction: Vec3::Z,
            ..ray
        };
        assert_eq!(
            intersect_triangle(&behind, &tri, Cull::None),
            Some((1.0, false))
        );
        assert!(intersect_triangle(&behind, &tri, Cull::Back).is_none());
    }

    #[test]
    fn test_triangle_miss_and_range() {
        let tri = [Vec3::ZERO, Vec3::X, Vec3::Y];
        let ray = Ray {
            origin: Vec3::new(0.9, 0.9, 1.0),
            direction: Vec3::NEG_Z,
            t_min: 0.0,
            t_max: 10.0,
        };
        assert!(intersect_triangle(&ray, &tri, Cull::None).is_none());

        let short = Ray {
            origin: Vec3::new(0.25, 0.25, 1.0),
            t_max: 0.5,
            ..ray
        };
        assert!(intersect_triangle(&short, &tri, Cull::None).is_none());
    }

    #[test]
    fn test_bounds() {
        let ray = Ray {
            origin: Vec3::new(0.0, 0.0, 5.0),
            direction: Vec3::NEG_Z,
            t_min: 0.0,
            t_max: 100.0,
        };
        assert!(intersects_bounds(&ray, Vec3::splat(-1.0), Vec3::splat(1.0)));
        assert!(!intersects_bounds(
            &ray,
            Vec3::new(2.0, 2.0, -1.0),
            Vec3::new(3.0, 3.0, 1.0)
        ));
    }

    #[test]
    fn test_light_reach() {
        let mut light = LightData {
            light_type: 3,
            layer_mask: 1,
            range: 5.0,
            spot_angle: 0.0,
            position: [0.0, 10.0, 0.0],
            _pad0: 0,
            direction: [0.0, -1.0, 0.0],
            _pad1: 0,
        };
        assert!(ShadowTracer::light_ray(&light, Vec3::ZERO).is_none());
        light.range = 20.0;
        let (dir, t) = ShadowTracer::light_ray(&light, Vec3::ZERO).unwrap();
        assert!((dir - Vec3::Y).length() < 1e-6);
        assert!((t - 10.0).abs() < 1e-6);

        light.light_type = 1;
        let (dir, _) = ShadowTracer::light_ray(&light, Vec3::ZERO).unwrap();
        assert!((dir - Vec3::Y).length() < 1e-6);
    }
}
