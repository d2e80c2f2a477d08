//! Metric scale estimation from posed queries.
//!
//! Each posed query pairs an image with the client-frame camera pose
//! captured at the same moment. Localizing every query against the map
//! gives reconstruction-frame camera centers; every unordered pair of
//! queries then contributes one sample, the ratio of client-frame to
//! reconstruction-frame distance. The full sample vector is persisted and
//! the median is the effective scale, so a minority of mis-localized
//! pairs cannot skew it.

use std::path::PathBuf;

use nalgebra::Vector3;
use tracing::{info, warn};

use map_cache::CacheSnapshot;
use maploc_localize::localize_pose;
use maploc_mvg::ClientPose;
use maploc_types::{LocalizeConfig, MapName, PosedQueryRecord, ScaleRecord};

use crate::{BuildError, Result};

/// One localized posed query: both camera centers.
struct PosedSample {
    reconstruction_center: Vector3<f64>,
    client_center: Vector3<f64>,
}

/// Estimate the map scale from its `images_with_pose` directory, persist
/// the sample vector, and return the median. `Ok(None)` (with a logged
/// warning) when no valid sample could be formed; callers treat that as
/// scale 1.0.
pub fn estimate_map_scale(
    snapshot: &CacheSnapshot,
    map: &MapName,
    config: &LocalizeConfig,
) -> Result<Option<f64>> {
    let entry = snapshot.map(map)?;
    let posed_root = entry.dirs.posed_queries_dir();
    if !posed_root.is_dir() {
        warn!(map = %map, "no posed queries; scale left at 1.0");
        return Ok(None);
    }

    let mut query_dirs: Vec<PathBuf> = std::fs::read_dir(&posed_root)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    query_dirs.sort();

    let mut samples_in: Vec<PosedSample> = Vec::new();
    for dir in &query_dirs {
        let Some(image_path) = find_query_image(dir) else {
            warn!(dir = %dir.display(), "posed query has no image");
            continue;
        };
        let record = match PosedQueryRecord::load_from_dir(dir) {
            Ok(r) => r,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "unreadable pose record");
                continue;
            }
        };
        let client = match ClientPose::from_column_major(&record.client_pose_col_major) {
            Ok(c) => c,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "bad client pose");
                continue;
            }
        };
        // A failed localization just drops this query from the pairing.
        let pose = match localize_pose(snapshot, &entry, &image_path, config) {
            Ok(p) => p,
            Err(kind) => {
                warn!(dir = %dir.display(), ?kind, "posed query did not localize");
                continue;
            }
        };
        samples_in.push(PosedSample {
            reconstruction_center: pose.camera_pose.fixed_view::<3, 1>(0, 3).into_owned(),
            client_center: client.0.fixed_view::<3, 1>(0, 3).into_owned(),
        });
    }

    let mut scales = Vec::new();
    for i in 0..samples_in.len() {
        for j in (i + 1)..samples_in.len() {
            let d_r =
                (samples_in[i].reconstruction_center - samples_in[j].reconstruction_center).norm();
            let d_c = (samples_in[i].client_center - samples_in[j].client_center).norm();
            if d_r <= f64::EPSILON {
                continue;
            }
            scales.push(d_c / d_r);
        }
    }

    if scales.is_empty() {
        warn!(map = %map, "no valid scale samples; scale left at 1.0");
        return Ok(None);
    }

    let record = ScaleRecord::new(scales);
    record.save(&entry.dirs).map_err(BuildError::from)?;
    let median = record.effective_scale();
    info!(map = %map, samples = record.samples.len(), ?median, "estimated map scale");
    Ok(median)
}

fn find_query_image(dir: &std::path::Path) -> Option<PathBuf> {
    let preferred = dir.join("query_image.png");
    if preferred.is_file() {
        return Some(preferred);
    }
    crate::sources::list_images(dir).ok()?.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;

    use colmap_model::{Camera, Image, Observation, Point3D, Reconstruction, TrackElement};
    use feature_store::{GlobalDescriptor, LocalFeatures, PairMatches};
    use map_cache::MapCache;
    use maploc_models::{
        CapabilityError, CapabilitySet, FeatureMatcher, GlobalDescriptorExtractor,
        LocalFeatureExtractor, PnpRequest, PnpSolution, PnpSolver, SegmentationMask, Segmenter,
    };
    use maploc_types::MapDirs;

    type CapResult<T> = std::result::Result<T, CapabilityError>;

    /// Encodes the query's x offset in the image file contents, so every
    /// posed query localizes to a controlled camera center.
    struct FileDrivenLocal;
    impl LocalFeatureExtractor for FileDrivenLocal {
        fn extract_local(&self, path: &Path) -> CapResult<LocalFeatures> {
            let x: f32 = std::fs::read_to_string(path)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0.0);
            Ok(LocalFeatures {
                keypoints: (0..8).map(|i| [x, i as f32]).collect(),
                descriptor_dim: 1,
                descriptors: vec![0.0; 8],
                scores: vec![1.0; 8],
                image_size: [640, 480],
            })
        }
    }

    struct FixedGlobal;
    impl GlobalDescriptorExtractor for FixedGlobal {
        fn extract_global(&self, _p: &Path) -> CapResult<GlobalDescriptor> {
            Ok(GlobalDescriptor {
                values: vec![1.0, 0.0],
            })
        }
    }

    struct IdentityMatcher;
    impl FeatureMatcher for IdentityMatcher {
        fn match_pair(&self, a: &LocalFeatures, b: &LocalFeatures) -> CapResult<PairMatches> {
            let n = a.len().min(b.len());
            Ok(PairMatches {
                indices: (0..n as u32).map(|i| (i, i)).collect(),
                scores: vec![1.0; n],
            })
        }
    }

    /// Pose translation taken from the first 2D point's x coordinate; the
    /// camera center becomes (-x, 0, 0) under the identity rotation.
    struct OffsetPnp;
    impl PnpSolver for OffsetPnp {
        fn solve(&self, request: &PnpRequest) -> CapResult<Option<PnpSolution>> {
            if request.points2d.len() < 4 {
                return Ok(None);
            }
            Ok(Some(PnpSolution {
                qvec: [1.0, 0.0, 0.0, 0.0],
                tvec: [request.points2d[0][0], 0.0, 0.0],
                num_inliers: request.points2d.len() as u32,
                inlier_mask: vec![true; request.points2d.len()],
            }))
        }
    }

    struct NoSegmenter;
    impl Segmenter for NoSegmenter {
        fn union_mask(&self, _p: &Path, _c: f32, _i: &[u32]) -> CapResult<Option<SegmentationMask>> {
            Ok(None)
        }
    }

    fn capabilities() -> CapabilitySet {
        CapabilitySet {
            local: Arc::new(FileDrivenLocal),
            global: Arc::new(FixedGlobal),
            matcher: Arc::new(IdentityMatcher),
            pnp: Arc::new(OffsetPnp),
            segmenter: Arc::new(NoSegmenter),
        }
    }

    fn write_map(root: &Path) -> MapName {
        let name = MapName::new("scaled").unwrap();
        let dirs = MapDirs::new(root, &name);
        let (features, descriptors, _) =
            feature_store::open_map_stores(&dirs.hloc_dir()).unwrap();
        descriptors
            .put("db0.jpg", &GlobalDescriptor { values: vec![1.0, 0.0] })
            .unwrap();
        features
            .put(
                "db0.jpg",
                &LocalFeatures {
                    keypoints: (0..8).map(|i| [0.0, i as f32]).collect(),
                    descriptor_dim: 1,
                    descriptors: vec![0.0; 8],
                    scores: vec![1.0; 8],
                    image_size: [640, 480],
                },
            )
            .unwrap();

        let mut model = Reconstruction::default();
        model
            .cameras
            .insert(1, Camera::pinhole(1, 640, 480, 500.0, 500.0, 320.0, 240.0));
        let observations: Vec<Observation> = (0..8)
            .map(|i| Observation {
                xy: [0.0, i as f64],
                point3d_id: Some(i as u64 + 1),
            })
            .collect();
        for i in 0..8u64 {
            model.points3d.insert(
                i + 1,
                Point3D {
                    xyz: [i as f64, 0.0, 1.0],
                    rgb: [0, 0, 0],
                    error: 0.1,
                    track: vec![TrackElement {
                        image_id: 1,
                        point2d_idx: i as u32,
                    }],
                },
            );
        }
        model.images.insert(
            1,
            Image {
                id: 1,
                qvec: [1.0, 0.0, 0.0, 0.0],
                tvec: [0.0, 0.0, 0.0],
                camera_id: 1,
                name: "db0.jpg".into(),
                observations,
            },
        );
        model.write_to_dir(dirs.sfm_reconstruction_dir()).unwrap();
        name
    }

    fn write_posed_query(root: &Path, map: &MapName, idx: usize, recon_x: f64, client_x: f64) {
        let dirs = MapDirs::new(root, map);
        let dir = dirs.posed_queries_dir().join(format!("q{idx}"));
        std::fs::create_dir_all(&dir).unwrap();
        // The mock pipeline turns file contents x into camera center -x.
        std::fs::write(dir.join("query_image.png"), format!("{}", -recon_x)).unwrap();
        let mut pose = vec![0.0f64; 16];
        pose[0] = 1.0;
        pose[5] = 1.0;
        pose[10] = 1.0;
        pose[15] = 1.0;
        pose[12] = client_x; // column-major translation x
        PosedQueryRecord::new(pose).unwrap().save_to_dir(&dir).unwrap();
    }

    #[test]
    fn synthetic_pairs_yield_median_scale_two() {
        let tmp = tempfile::tempdir().unwrap();
        let name = write_map(tmp.path());
        // Reconstruction centers 0, 0.5, 1.0, 1.5 m; client 0, 1, 2, 3 m.
        for (i, (rx, cx)) in [(0.0, 0.0), (0.5, 1.0), (1.0, 2.0), (1.5, 3.0)]
            .iter()
            .enumerate()
        {
            write_posed_query(tmp.path(), &name, i, *rx, *cx);
        }
        let cache = MapCache::load(tmp.path(), capabilities()).unwrap();
        let snapshot = cache.snapshot();
        let median = estimate_map_scale(&snapshot, &name, &LocalizeConfig::default())
            .unwrap()
            .expect("samples expected");
        approx::assert_relative_eq!(median, 2.0, epsilon = 1e-9);

        // The full sample vector was persisted.
        let dirs = MapDirs::new(tmp.path(), &name);
        let record = ScaleRecord::load(&dirs).unwrap().unwrap();
        assert_eq!(record.samples.len(), 6);
        assert!(record.samples.iter().all(|s| (s - 2.0).abs() < 1e-9));
    }

    #[test]
    fn no_posed_queries_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let name = write_map(tmp.path());
        let cache = MapCache::load(tmp.path(), capabilities()).unwrap();
        let median =
            estimate_map_scale(&cache.snapshot(), &name, &LocalizeConfig::default()).unwrap();
        assert!(median.is_none());
    }

    #[test]
    fn coincident_queries_contribute_no_sample() {
        let tmp = tempfile::tempdir().unwrap();
        let name = write_map(tmp.path());
        write_posed_query(tmp.path(), &name, 0, 1.0, 2.0);
        write_posed_query(tmp.path(), &name, 1, 1.0, 2.5);
        let cache = MapCache::load(tmp.path(), capabilities()).unwrap();
        let median =
            estimate_map_scale(&cache.snapshot(), &name, &LocalizeConfig::default()).unwrap();
        assert!(median.is_none());
    }
}
