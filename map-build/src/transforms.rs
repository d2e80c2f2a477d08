//! The map-transforms operator: re-run individual post-processing steps
//! on an existing map directory, long after the original build.
//!
//! Operations are applied in a fixed order (rotate, elevate, mask, scale,
//! export) and each is idempotent except explicit rotation, which composes
//! by design. Outputs are byte-identical across repeat runs save for file
//! timestamps.

use tracing::info;

use colmap_model::Reconstruction;
use map_clean::{
    elevate_reconstruction, export_pcd, parse_rotation_spec, remove_masked_points,
    remove_statistical_outliers, MaskingParams, PcdExportOptions,
};
use maploc_models::CapabilitySet;
use maploc_types::{CleanConfig, MapDirs, ScaleRecord};

use crate::{BuildError, Result};

#[derive(Debug, Clone, Default)]
pub struct TransformOps {
    /// Axis rotation spec, e.g. `x-90`, `y90`, `z180`.
    pub rotation: Option<String>,
    pub elevate: bool,
    pub remove_outliers: bool,
    pub mask_objects: bool,
    pub apply_scale: bool,
    pub export_pcd: bool,
}

impl TransformOps {
    fn touches_model(&self) -> bool {
        self.rotation.is_some() || self.elevate || self.remove_outliers || self.mask_objects
    }
}

pub fn run_map_transforms(
    dirs: &MapDirs,
    ops: &TransformOps,
    clean: &CleanConfig,
    capabilities: &CapabilitySet,
) -> Result<()> {
    let sfm_dir = dirs.sfm_reconstruction_dir();
    let mut model = Reconstruction::read_from_dir(&sfm_dir)?;

    if let Some(spec) = &ops.rotation {
        let rotation = parse_rotation_spec(spec)?;
        model.rotate(&rotation);
        info!(spec = %spec, "rotated model");
    }
    if ops.elevate {
        let shift = elevate_reconstruction(&mut model, clean.elevation_bucket_meters)?;
        info!(shift, "elevated model");
    }
    if ops.remove_outliers {
        let pruned =
            remove_statistical_outliers(&mut model, clean.outlier_neighbors, clean.outlier_std_ratio);
        info!(pruned, "pruned outliers");
    }
    if ops.mask_objects {
        let removed = remove_masked_points(
            &mut model,
            &dirs.images_dir(),
            capabilities.segmenter.as_ref(),
            &MaskingParams {
                confidence: clean.segmentation_confidence,
                class_ids: &clean.target_class_ids,
            },
        )?;
        info!(removed, "masked dynamic objects");
    }

    if ops.touches_model() {
        model.validate()?;
        model.write_to_dir(&sfm_dir)?;
    }

    if ops.apply_scale {
        match ScaleRecord::load(dirs).map_err(BuildError::from)?.and_then(|r| r.effective_scale()) {
            Some(scale) => {
                let mut scaled = model.clone();
                scaled.scale(scale);
                scaled.write_to_dir(dirs.scaled_sfm_reconstruction_dir())?;
                info!(scale, "wrote scaled reconstruction");
            }
            None => {
                info!("no scale record; skipping scale application");
            }
        }
    }

    if ops.export_pcd {
        export_pcd(
            &model,
            &dirs.points_pcd_path(),
            &PcdExportOptions {
                voxel_size: Some(clean.voxel_size),
                crop_y_meters: clean.crop_y_meters,
            },
        )?;
    }
    Ok(())
}
