//! End-to-end build of a Kiri-style capture: real files on disk, mock
//! model capabilities, and a stand-in triangulator script. Exercises the
//! whole stage sequence without any of the heavyweight external tools.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use colmap_model::Reconstruction;
use feature_store::{GlobalDescriptor, LocalFeatures, PairMatches};
use map_build::{run_build, BuildContext, CaptureSource};
use maploc_models::{
    CapabilityError, CapabilitySet, FeatureMatcher, GlobalDescriptorExtractor,
    LocalFeatureExtractor, PnpRequest, PnpSolution, PnpSolver, SegmentationMask, Segmenter,
};
use maploc_types::{BuildConfig, CleanConfig, MapDirs, MapName};

type CapResult<T> = std::result::Result<T, CapabilityError>;

struct GridLocal;
impl LocalFeatureExtractor for GridLocal {
    fn extract_local(&self, _p: &Path) -> CapResult<LocalFeatures> {
        Ok(LocalFeatures {
            keypoints: (0..6).map(|i| [i as f32 * 3.0, i as f32]).collect(),
            descriptor_dim: 2,
            descriptors: vec![0.25; 12],
            scores: vec![0.9; 6],
            image_size: [8, 8],
        })
    }
}

struct HashGlobal;
impl GlobalDescriptorExtractor for HashGlobal {
    fn extract_global(&self, p: &Path) -> CapResult<GlobalDescriptor> {
        // Distinct but deterministic per file name.
        let h = p
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.bytes().map(u32::from).sum::<u32>())
            .unwrap_or(0);
        Ok(GlobalDescriptor {
            values: vec![1.0, (h % 7) as f32 / 7.0],
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

struct NoPnp;
impl PnpSolver for NoPnp {
    fn solve(&self, _request: &PnpRequest) -> CapResult<Option<PnpSolution>> {
        Ok(None)
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
        local: Arc::new(GridLocal),
        global: Arc::new(HashGlobal),
        matcher: Arc::new(IdentityMatcher),
        pnp: Arc::new(NoPnp),
        segmenter: Arc::new(NoSegmenter),
    }
}

/// A triangulator stand-in: copies the prior model to the output and adds
/// a block of 3D points so post-processing has geometry to work with.
fn write_fake_triangulator(dir: &Path) -> String {
    let script = dir.join("fake-triangulate.sh");
    let body = r##"#!/bin/sh
prior=""; out=""
while [ $# -gt 0 ]; do
  case "$1" in
    --prior) prior="$2"; shift ;;
    --output) out="$2"; shift ;;
  esac
  shift
done
mkdir -p "$out"
cp "$prior"/cameras.txt "$prior"/images.txt "$out"/
{
  echo "# synthetic points"
  i=1
  for x in 0 1 2 3; do
    for y in 0 1 2 3; do
      echo "$i $x.0 $y.0 1.5 120 130 140 0.4"
      i=$((i+1))
    done
  done
} > "$out"/points3D.txt
"##;
    std::fs::write(&script, body).unwrap();
    let mut perms = std::fs::metadata(&script).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script, perms).unwrap();
    script.display().to_string()
}

fn frame(name: &str, tx: f64) -> serde_json::Value {
    serde_json::json!({
        "file_path": format!("images/{name}"),
        "transform_matrix": [
            [1.0, 0.0, 0.0, tx],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 2.0],
            [0.0, 0.0, 0.0, 1.0]
        ]
    })
}

#[test]
fn kiri_capture_builds_a_servable_map() {
    let tmp = tempfile::tempdir().unwrap();
    let data_root = tmp.path().join("map_data");
    let name = MapName::new("office").unwrap();
    let dirs = MapDirs::new(&data_root, &name);

    // Kiri export: images plus transforms.json with one shared camera.
    let scan = tmp.path().join("kiri_export");
    let scan_images = scan.join("images");
    std::fs::create_dir_all(&scan_images).unwrap();
    let names = ["f1.png", "f2.png", "f3.png"];
    for n in &names {
        image::RgbImage::from_pixel(8, 8, image::Rgb([200, 60, 20]))
            .save(scan_images.join(n))
            .unwrap();
    }
    let transforms = serde_json::json!({
        "camera_model": "OPENCV",
        "w": 8, "h": 8,
        "fl_x": 10.0, "fl_y": 10.0, "cx": 4.0, "cy": 4.0,
        "k1": 0.0, "k2": 0.0, "p1": 0.0, "p2": 0.0,
        "frames": [frame("f1.png", 0.0), frame("f2.png", 0.5), frame("f3.png", 1.0)]
    });
    std::fs::write(scan.join("transforms.json"), transforms.to_string()).unwrap();

    let mut config = BuildConfig {
        data_root: data_root.clone(),
        clean: CleanConfig {
            manhattan_align: false,
            mask_objects: false,
            remove_outliers: false,
            crop_y_meters: 0.0,
            ..CleanConfig::default()
        },
        ..BuildConfig::default()
    };
    config.tools.triangulator = vec![write_fake_triangulator(tmp.path())];

    std::fs::create_dir_all(dirs.root()).unwrap();
    // The pipeline expects the flat images under the map root for Kiri
    // scans handed over as directories.
    let ctx = BuildContext {
        dirs: MapDirs::new(&data_root, &name),
        config,
        capabilities: capabilities(),
        abort: map_build::BuildAbort::new(),
    };
    run_build(&ctx, &CaptureSource::Kiri { dir: scan.clone() }).unwrap();

    // Stores hold one record per image.
    let (features, descriptors, matches) =
        feature_store::open_map_stores(&dirs.hloc_dir()).unwrap();
    assert_eq!(features.keys().unwrap().len(), 3);
    assert_eq!(descriptors.keys().unwrap().len(), 3);
    assert!(matches.contains("f1.png", "f2.png"));
    assert!(matches.contains("f2.png", "f3.png"));

    // The reconstruction is valid, elevated, and exported.
    let model = Reconstruction::read_from_dir(dirs.sfm_reconstruction_dir()).unwrap();
    assert_eq!(model.images.len(), 3);
    assert_eq!(model.points3d.len(), 16);
    let min_z = model
        .points3d
        .values()
        .map(|p| p.xyz[2])
        .fold(f64::INFINITY, f64::min);
    assert!(min_z.abs() < 1e-9, "floor at {min_z}");
    assert!(dirs.points_pcd_path().is_file());

    // Thumbnails and the build log exist.
    assert!(dirs.thumbnails_dir().join("f1.png").is_file());
    let log = std::fs::read_to_string(dirs.log_path()).unwrap();
    assert!(log.contains("==> features"));
    assert!(log.contains("==> triangulation"));
    assert!(log.contains("==> build complete"));
}
