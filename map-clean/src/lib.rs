//! Geometric post-processing of reconstructed maps.
//!
//! Everything that turns a raw SfM reconstruction into a servable map
//! lives here: ground-level elevation, statistical outlier pruning,
//! dynamic-object masking, external-scan alignment, axis rotations, and
//! the downsampled/cropped point-cloud export.

use nalgebra::Rotation3;

mod align;
mod elevation;
mod masking;
mod outliers;
mod pointcloud;

pub use align::{alignment_matrix, apply_mesh_alignment, read_mesh_info, MeshInfo};
pub use elevation::{elevate_reconstruction, estimate_floor_shift};
pub use masking::{masked_point_ids, prune_masked_keypoints, remove_masked_points, MaskingParams};
pub use outliers::{remove_statistical_outliers, statistical_outlier_ids};
pub use pointcloud::{export_pcd, ColorPoint, PcdExportOptions};

#[derive(thiserror::Error, Debug)]
pub enum CleanError {
    #[error("reconstruction has no 3D points")]
    EmptyPointCloud,
    #[error("invalid rotation spec {0:?} (expected e.g. \"x-90\", \"y90\", \"z180\")")]
    BadRotationSpec(String),
    #[error("mesh info has {0} transform elements, expected 16")]
    BadAlignmentTransform(usize),
    #[error("{source}")]
    Model {
        #[from]
        source: colmap_model::ModelError,
    },
    #[error("{source}")]
    Mvg {
        #[from]
        source: maploc_mvg::MvgError,
    },
    #[error("{source}")]
    Store {
        #[from]
        source: feature_store::StoreError,
    },
    #[error("{source}")]
    Capability {
        #[from]
        source: maploc_models::CapabilityError,
    },
    #[error("{source}")]
    SerdeJson {
        #[from]
        source: serde_json::Error,
    },
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, CleanError>;

/// Parse a rotation spec of the form `x-90`, `y90`, `z180` (degrees) into
/// a rotation about that axis, as accepted by the map-transforms operator.
pub fn parse_rotation_spec(spec: &str) -> Result<Rotation3<f64>> {
    let bad = || CleanError::BadRotationSpec(spec.to_string());
    let mut chars = spec.chars();
    let axis = chars.next().ok_or_else(bad)?;
    let degrees: f64 = chars.as_str().parse().map_err(|_| bad())?;
    let radians = degrees.to_radians();
    Ok(match axis {
        'x' | 'X' => Rotation3::from_euler_angles(radians, 0.0, 0.0),
        'y' | 'Y' => Rotation3::from_euler_angles(0.0, radians, 0.0),
        'z' | 'Z' => Rotation3::from_euler_angles(0.0, 0.0, radians),
        _ => return Err(bad()),
    })
}

/// The fixed post-Manhattan rotation: -90 degrees about X, bringing the
/// vertical scene axis onto Y for the client-facing frame.
pub fn post_manhattan_rotation() -> Rotation3<f64> {
    Rotation3::from_euler_angles(-std::f64::consts::FRAC_PI_2, 0.0, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    #[test]
    fn rotation_specs() {
        let r = parse_rotation_spec("x-90").unwrap();
        let v = r * Vector3::new(0.0, 1.0, 0.0);
        assert_relative_eq!(v, Vector3::new(0.0, 0.0, -1.0), epsilon = 1e-12);

        let r = parse_rotation_spec("z180").unwrap();
        let v = r * Vector3::new(1.0, 0.0, 0.0);
        assert_relative_eq!(v, Vector3::new(-1.0, 0.0, 0.0), epsilon = 1e-12);

        assert!(parse_rotation_spec("").is_err());
        assert!(parse_rotation_spec("w90").is_err());
        assert!(parse_rotation_spec("x").is_err());
    }
}
