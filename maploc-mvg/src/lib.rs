//! Coordinate-frame math for the localization service.
//!
//! Three frames appear throughout the system:
//!
//! - **R**, the raw reconstruction frame produced by SfM (Z vertical only
//!   after Manhattan alignment and the build-time X rotation);
//! - **G**, the canonical gravity-aligned, Y-up map frame every map is
//!   served in;
//! - **C**, the right-handed AR frame the client reports its camera pose
//!   in, column-major on the wire.
//!
//! All operations take and return homogeneous 4x4 matrices unless noted.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3};

#[derive(thiserror::Error, Debug)]
pub enum MvgError {
    #[error("matrix is not invertible")]
    NonInvertible,
    #[error("client pose must have 16 elements, got {0}")]
    BadClientPoseLength(usize),
    #[error("axis permutation {0:?} is not a permutation of (0, 1, 2)")]
    BadPermutation([usize; 3]),
}

pub type Result<T> = std::result::Result<T, MvgError>;

/// Combine a rotation block and translation into one homogeneous matrix.
pub fn homogenize(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Matrix4<f64> {
    let mut m = Matrix4::identity();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(rotation);
    m.fixed_view_mut::<3, 1>(0, 3).copy_from(translation);
    m
}

/// Split a homogeneous matrix back into its rotation block and translation.
pub fn decompose(m: &Matrix4<f64>) -> (Matrix3<f64>, Vector3<f64>) {
    (
        m.fixed_view::<3, 3>(0, 0).into_owned(),
        m.fixed_view::<3, 1>(0, 3).into_owned(),
    )
}

/// Rotation matrix from a quaternion given in (w, x, y, z) order, the
/// storage order of the reconstruction files.
pub fn rotation_from_quat_wxyz(qvec: [f64; 4]) -> Matrix3<f64> {
    UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
        qvec[0], qvec[1], qvec[2], qvec[3],
    ))
    .to_rotation_matrix()
    .into_inner()
}

pub fn quat_wxyz_from_rotation(r: &Matrix3<f64>) -> [f64; 4] {
    let q =
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(*r));
    [q.w, q.i, q.j, q.k]
}

/// Camera-in-world pose from a stored world-from-camera `(qvec, tvec)`.
pub fn camera_pose_from_model(qvec: [f64; 4], tvec: [f64; 3]) -> Result<Matrix4<f64>> {
    let world_from_camera = homogenize(&rotation_from_quat_wxyz(qvec), &Vector3::from(tvec));
    try_inverse(&world_from_camera)
}

pub fn try_inverse(m: &Matrix4<f64>) -> Result<Matrix4<f64>> {
    m.try_inverse().ok_or(MvgError::NonInvertible)
}

/// Extrinsic-xyz Euler angles of the rotation block, matching the
/// `R = Rz·Ry·Rx` composition used by the original alignment tooling.
fn euler_xyz(r: &Matrix3<f64>) -> (f64, f64, f64) {
    Rotation3::from_matrix_unchecked(*r).euler_angles()
}

fn from_euler_xyz(x: f64, y: f64, z: f64) -> Matrix3<f64> {
    Rotation3::from_euler_angles(x, y, z).into_inner()
}

/// Convert a pose from the reconstruction convention into the
/// gravity-aligned frame.
///
/// Historically this is two steps folded together: a 180 degree flip of
/// the X Euler angle (camera-forward convention change) followed by a -90
/// degree X rotation, plus an optional -90 degree Y rotation that newer
/// builds apply to face content the same way the scan app does.
pub fn hloc_to_gravity(m: &Matrix4<f64>, with_y_rotation: bool) -> Matrix4<f64> {
    let (r, t) = decompose(m);
    let (ex, ey, ez) = euler_xyz(&r);
    let flipped = homogenize(&from_euler_xyz(ex + std::f64::consts::PI, ey, ez), &t);

    let rot_x = homogenize(
        &from_euler_xyz(-std::f64::consts::FRAC_PI_2, 0.0, 0.0),
        &Vector3::zeros(),
    );
    let stage1 = rot_x * flipped;
    if with_y_rotation {
        let rot_y = homogenize(
            &from_euler_xyz(0.0, -std::f64::consts::FRAC_PI_2, 0.0),
            &Vector3::zeros(),
        );
        rot_y * stage1
    } else {
        stage1
    }
}

/// Build the external-scan alignment matrix and left-multiply it onto `m`.
///
/// Scan exports use a different axis convention than the reconstruction:
/// the Euler angles and translation of the alignment transform are
/// permuted by `permutation` (component `i` of the result is component
/// `permutation[i]` of the input) and the Y Euler angle is optionally
/// negated. The default permutation (2, 0, 1) was determined empirically
/// against Polycam exports.
pub fn apply_alignment(
    m: &Matrix4<f64>,
    alignment: &Matrix4<f64>,
    negate_y: bool,
    permutation: [usize; 3],
) -> Result<Matrix4<f64>> {
    {
        let mut seen = [false; 3];
        for &p in &permutation {
            if p > 2 || seen[p] {
                return Err(MvgError::BadPermutation(permutation));
            }
            seen[p] = true;
        }
    }
    let (r, t) = decompose(alignment);
    let e = euler_xyz(&r);
    let e = [e.0, e.1, e.2];
    let mut e2 = [
        e[permutation[0]],
        e[permutation[1]],
        e[permutation[2]],
    ];
    if negate_y {
        e2[1] = -e2[1];
    }
    let t2 = Vector3::new(
        t[permutation[0]],
        t[permutation[1]],
        t[permutation[2]],
    );
    let a = homogenize(&from_euler_xyz(e2[0], e2[1], e2[2]), &t2);
    Ok(a * m)
}

/// A camera pose reported by the AR client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientPose(pub Matrix4<f64>);

impl ClientPose {
    /// Clients flatten their matrices column-major (the transpose of how
    /// they read on paper); this parses that wire order.
    pub fn from_column_major(values: &[f64]) -> Result<ClientPose> {
        if values.len() != 16 {
            return Err(MvgError::BadClientPoseLength(values.len()));
        }
        Ok(ClientPose(Matrix4::from_column_slice(values)))
    }

    pub fn to_column_major(&self) -> Vec<f64> {
        self.0.as_slice().to_vec()
    }
}

/// Combine a localized camera pose (already in the client-facing gravity
/// frame) with the client's own camera pose to produce the transform that
/// anchors map content in the client scene:
/// `client_matrix · pose_G⁻¹`, optionally followed by a uniform metric
/// scale when the map itself is not yet metrically scaled.
pub fn fuse_with_client(
    pose_g: &Matrix4<f64>,
    client: &ClientPose,
    scale: Option<f64>,
) -> Result<Matrix4<f64>> {
    let fused = client.0 * try_inverse(pose_g)?;
    Ok(match scale {
        Some(s) => {
            let mut scale_m = Matrix4::identity();
            scale_m[(0, 0)] = s;
            scale_m[(1, 1)] = s;
            scale_m[(2, 2)] = s;
            scale_m * fused
        }
        None => fused,
    })
}

/// Flatten a matrix column-major for the wire, the inverse of
/// [`ClientPose::from_column_major`].
pub fn to_column_major_vec(m: &Matrix4<f64>) -> Vec<f64> {
    m.as_slice().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn homogenize_decompose_round_trip() {
        let r = Rotation3::from_euler_angles(0.3, -1.1, 2.0).into_inner();
        let t = Vector3::new(1.0, -2.0, 0.25);
        let (r2, t2) = decompose(&homogenize(&r, &t));
        assert_relative_eq!(r, r2, epsilon = 1e-10);
        assert_relative_eq!(t, t2, epsilon = 1e-10);
    }

    #[test]
    fn quat_round_trip() {
        let q = [0.5f64.sqrt(), 0.0, 0.5f64.sqrt(), 0.0];
        let r = rotation_from_quat_wxyz(q);
        let q2 = quat_wxyz_from_rotation(&r);
        for i in 0..4 {
            assert_relative_eq!(q[i], q2[i], epsilon = 1e-10);
        }
    }

    #[test]
    fn camera_pose_inverts_world_from_camera() {
        let qvec = quat_wxyz_from_rotation(
            &Rotation3::from_euler_angles(0.1, 0.2, 0.3).into_inner(),
        );
        let tvec = [1.0, 2.0, 3.0];
        let pose = camera_pose_from_model(qvec, tvec).unwrap();
        let wfc = homogenize(&rotation_from_quat_wxyz(qvec), &Vector3::from(tvec));
        assert_relative_eq!(pose * wfc, Matrix4::identity(), epsilon = 1e-10);
    }

    #[test]
    fn client_pose_transposes_on_ingest() {
        // Column-major flattening of a pure translation (tx, ty, tz) puts
        // the translation in elements 12..15.
        let mut col_major = vec![0.0; 16];
        col_major[0] = 1.0;
        col_major[5] = 1.0;
        col_major[10] = 1.0;
        col_major[15] = 1.0;
        col_major[12] = 7.0;
        col_major[13] = 8.0;
        col_major[14] = 9.0;
        let pose = ClientPose::from_column_major(&col_major).unwrap();
        assert_relative_eq!(pose.0[(0, 3)], 7.0);
        assert_relative_eq!(pose.0[(1, 3)], 8.0);
        assert_relative_eq!(pose.0[(2, 3)], 9.0);
        assert_eq!(pose.to_column_major(), col_major);
    }

    #[test]
    fn fuse_identity_pose_returns_client_matrix() {
        let client = ClientPose(Matrix4::new_translation(&Vector3::new(1.0, 2.0, 3.0)));
        let fused = fuse_with_client(&Matrix4::identity(), &client, None).unwrap();
        assert_relative_eq!(fused, client.0, epsilon = 1e-12);
    }

    #[test]
    fn fuse_applies_uniform_scale() {
        let client = ClientPose(Matrix4::identity());
        let pose = Matrix4::new_translation(&Vector3::new(1.0, 0.0, 0.0));
        let fused = fuse_with_client(&pose, &client, Some(2.0)).unwrap();
        assert_relative_eq!(fused[(0, 3)], -2.0, epsilon = 1e-12);
    }

    #[test]
    fn alignment_permutes_translation_components() {
        let a = Matrix4::new_translation(&Vector3::new(10.0, 20.0, 30.0));
        let out = apply_alignment(&Matrix4::identity(), &a, false, [2, 0, 1]).unwrap();
        assert_relative_eq!(out[(0, 3)], 30.0);
        assert_relative_eq!(out[(1, 3)], 10.0);
        assert_relative_eq!(out[(2, 3)], 20.0);
    }

    #[test]
    fn alignment_rejects_bad_permutation() {
        let a = Matrix4::identity();
        assert!(apply_alignment(&a, &a, false, [0, 0, 1]).is_err());
        assert!(apply_alignment(&a, &a, false, [0, 1, 3]).is_err());
    }

    #[test]
    fn hloc_to_gravity_is_rigid() {
        let m = homogenize(
            &Rotation3::from_euler_angles(0.2, 0.4, -0.6).into_inner(),
            &Vector3::new(1.0, 2.0, 3.0),
        );
        for with_y in [false, true] {
            let g = hloc_to_gravity(&m, with_y);
            let (r, _) = decompose(&g);
            assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-9);
        }
    }
}
