//! Math re-exports and helper functions.
//!
//! Matrices follow glam's column-vector convention: a point is transformed as
//! `m * p`, and `a * b` applies `b` first.

pub use glam;
pub use glam::{Mat4, Vec3, Vec4};

/// Row-major 3x4 affine transform as consumed by acceleration structure instances.
///
/// The projective row of `m` is dropped.
pub fn to_rows_3x4(m: &Mat4) -> [f32; 12] {
    let r = m.transpose();
    #[rustfmt::skip]
    let rows = [
        r.x_axis.x, r.x_axis.y, r.x_axis.z, r.x_axis.w,
        r.y_axis.x, r.y_axis.y, r.y_axis.z, r.y_axis.w,
        r.z_axis.x, r.z_axis.y, r.z_axis.z, r.z_axis.w,
    ];
    rows
}

/// Rebuilds a 4x4 matrix from a row-major 3x4 affine transform.
pub fn from_rows_3x4(rows: &[f32; 12]) -> Mat4 {
    #[rustfmt::skip]
    let m = Mat4::from_cols_array(&[
        rows[0], rows[4], rows[8],  0.0,
        rows[1], rows[5], rows[9],  0.0,
        rows[2], rows[6], rows[10], 0.0,
        rows[3], rows[7], rows[11], 1.0,
    ]);
    m
}

/// Near and far plane distances of an OpenGL-convention perspective projection
/// (clip depth in [-1, 1]), such as [`Mat4::perspective_rh_gl`].
///
/// Returns `None` for projections that do not encode finite planes.
pub fn projection_near_far(projection: &Mat4) -> Option<(f32, f32)> {
    let a = projection.z_axis.z;
    let b = projection.w_axis.z;
    if (a - 1.0).abs() <= f32::EPSILON || (a + 1.0).abs() <= f32::EPSILON {
        return None;
    }
    let near = (b / (a - 1.0)).abs();
    let far = (b / (a + 1.0)).abs();
    if near.is_finite() && far.is_finite() && near > 0.0 {
        Some((near, far))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_round_trip() {
        let m = Mat4::from_scale_rotation_translation(
            Vec3::new(1.0, 2.0, 3.0),
            glam::Quat::from_rotation_y(0.7),
            Vec3::new(4.0, -5.0, 6.0),
        );
        let rows = to_rows_3x4(&m);
        assert_eq!(rows[3], 4.0);
        assert_eq!(rows[7], -5.0);
        assert_eq!(rows[11], 6.0);
        assert!(from_rows_3x4(&rows).abs_diff_eq(m, 1e-6));
    }

    #[test]
    fn test_projection_near_far() {
        let proj = Mat4::perspective_rh_gl(1.0, 1.5, 0.3, 1000.0);
        let (near, far) = projection_near_far(&proj).unwrap();
        assert!((near - 0.3).abs() < 1e-4);
        assert!((far - 1000.0).abs() < 0.5);
    }
}
