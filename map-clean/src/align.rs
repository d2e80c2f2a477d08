//! External-scan alignment.
//!
//! Polycam exports carry a `mesh_info.json` whose `alignmentTransform`
//! maps the scan into its gravity-aligned presentation frame. The matrix
//! arrives column-major; its Euler angles and translation are expressed in
//! a different axis convention than the reconstruction, so they are
//! permuted (and the Y angle optionally negated) before being applied.

use std::path::Path;

use nalgebra::Matrix4;
use serde::Deserialize;

use colmap_model::Reconstruction;
use maploc_mvg::apply_alignment;

use crate::{CleanError, Result};

/// The axis permutation determined empirically against Polycam exports.
pub const POLYCAM_AXIS_PERMUTATION: [usize; 3] = [2, 0, 1];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshInfo {
    /// Column-major flattened 4x4 transform.
    pub alignment_transform: Vec<f64>,
    #[serde(default)]
    pub y_alignment_rotation: f64,
}

pub fn read_mesh_info(path: &Path) -> Result<MeshInfo> {
    let text = std::fs::read_to_string(path)?;
    let info: MeshInfo = serde_json::from_str(&text)?;
    if info.alignment_transform.len() != 16 {
        return Err(CleanError::BadAlignmentTransform(
            info.alignment_transform.len(),
        ));
    }
    Ok(info)
}

/// The alignment transform as a matrix, parsing the column-major wire
/// order.
pub fn alignment_matrix(info: &MeshInfo) -> Matrix4<f64> {
    Matrix4::from_column_slice(&info.alignment_transform)
}

/// Apply the scan alignment to a reconstruction: permute the transform
/// into the reconstruction's axis convention, then left-multiply it onto
/// the whole model.
pub fn apply_mesh_alignment(
    model: &mut Reconstruction,
    info: &MeshInfo,
    negate_y_rotation: bool,
) -> Result<()> {
    let a = alignment_matrix(info);
    let permuted = apply_alignment(
        &Matrix4::identity(),
        &a,
        negate_y_rotation,
        POLYCAM_AXIS_PERMUTATION,
    )?;
    model.apply_transform_matrix(&permuted)?;
    Ok(())
}
