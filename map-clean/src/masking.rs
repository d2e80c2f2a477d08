//! Dynamic-object masking.
//!
//! A segmentation capability provides a per-image union mask over the
//! configured object classes. Two consumers: the model sweep deletes every
//! 3D point whose stored 2D observation lands in a mask in *any* image,
//! and the feature-layer variant prunes keypoints from the store before
//! they can ever be matched.

use std::collections::BTreeSet;
use std::path::Path;

use tracing::{debug, info, warn};

use colmap_model::Reconstruction;
use feature_store::{BlobStore, LocalFeatures};
use maploc_models::Segmenter;

use crate::Result;

pub struct MaskingParams<'a> {
    pub confidence: f32,
    pub class_ids: &'a [u32],
}

/// Collect the ids of all 3D points observed inside a mask, across every
/// image of the reconstruction. Images whose file is missing or whose
/// segmentation fails are skipped with a warning so one bad frame does not
/// abort a build.
pub fn masked_point_ids(
    model: &Reconstruction,
    images_dir: &Path,
    segmenter: &dyn Segmenter,
    params: &MaskingParams<'_>,
) -> Result<BTreeSet<u64>> {
    let mut doomed = BTreeSet::new();
    for image in model.images.values() {
        let image_path = images_dir.join(&image.name);
        let mask = match segmenter.union_mask(&image_path, params.confidence, params.class_ids) {
            Ok(Some(mask)) => mask,
            Ok(None) => continue,
            Err(e) => {
                warn!(image = %image.name, error = %e, "segmentation failed, skipping image");
                continue;
            }
        };
        let mut hits = 0usize;
        for obs in &image.observations {
            if let Some(point3d_id) = obs.point3d_id {
                if mask.contains(obs.xy[0], obs.xy[1]) {
                    doomed.insert(point3d_id);
                    hits += 1;
                }
            }
        }
        debug!(image = %image.name, hits, "masked observations");
    }
    Ok(doomed)
}

/// Delete every masked point from the model. Returns how many were
/// removed; observation slots are rewritten, ids stay stable.
pub fn remove_masked_points(
    model: &mut Reconstruction,
    images_dir: &Path,
    segmenter: &dyn Segmenter,
    params: &MaskingParams<'_>,
) -> Result<usize> {
    let doomed = masked_point_ids(model, images_dir, segmenter, params)?;
    for &id in &doomed {
        model.delete_point3d(id);
    }
    info!(removed = doomed.len(), "dynamic-object mask sweep");
    Ok(doomed.len())
}

/// Feature-layer variant: drop masked keypoints from the local-features
/// store so they are never matched. Returns the number of keypoints
/// pruned across all images.
pub fn prune_masked_keypoints(
    store: &BlobStore,
    images_dir: &Path,
    segmenter: &dyn Segmenter,
    params: &MaskingParams<'_>,
) -> Result<usize> {
    let mut pruned_total = 0usize;
    for key in store.keys()? {
        let image_path = images_dir.join(&key);
        let mask = match segmenter.union_mask(&image_path, params.confidence, params.class_ids) {
            Ok(Some(mask)) => mask,
            Ok(None) => continue,
            Err(e) => {
                warn!(image = %key, error = %e, "segmentation failed, keeping keypoints");
                continue;
            }
        };
        let features: LocalFeatures = store.get(&key)?;
        let kept = features.retain_indices(|i| {
            let [x, y] = features.keypoints[i];
            !mask.contains(f64::from(x), f64::from(y))
        });
        let pruned = features.len() - kept.len();
        if pruned > 0 {
            store.put(&key, &kept)?;
            pruned_total += pruned;
        }
    }
    info!(pruned = pruned_total, "masked keypoint pruning");
    Ok(pruned_total)
}
