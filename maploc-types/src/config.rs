//! Pipeline and service configuration.
//!
//! All knobs carry serde defaults so an empty TOML file is a valid config.
//! Behavioral differences that used to be hidden in near-duplicate copies
//! of the pipeline (y-rotation negation, ceiling crop height, scale
//! application) are explicit fields here.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// COCO class ids treated as dynamic objects when masking. People,
/// vehicles, animals and portable furniture/electronics.
pub const DEFAULT_TARGET_CLASS_IDS: &[u32] = &[
    0, 1, 2, 3, 5, 7, 14, 15, 16, 24, 25, 26, 28, 36, 39, 40, 41, 42, 43, 44, 45, 56, 63, 64, 65,
    66, 67,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BuildConfig {
    /// Root under which every map directory lives.
    pub data_root: PathBuf,
    /// Percentage of video frames to extract, of the estimated total.
    pub frame_ratio_percent: f64,
    /// Covisible neighbors proposed per image for unknown-pose inputs.
    pub covisibility_pairs: usize,
    pub clean: CleanConfig,
    pub tools: ToolConfig,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            data_root: PathBuf::from("data/map_data"),
            frame_ratio_percent: 25.0,
            covisibility_pairs: 20,
            clean: CleanConfig::default(),
            tools: ToolConfig::default(),
        }
    }
}

impl BuildConfig {
    pub fn from_toml_path(path: &Path) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

/// Geometry post-processing knobs (spec'd superset of the historical
/// pipeline variants).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CleanConfig {
    /// Run the external Manhattan-world orientation aligner, then the fixed
    /// -90 degree X rotation that brings the vertical axis to Y.
    pub manhattan_align: bool,
    /// Negate the Y Euler angle of the external alignment transform.
    pub negate_y_rotation: bool,
    /// Meters cropped off the top of the exported point cloud.
    pub crop_y_meters: f64,
    /// Apply the stored metric scale, writing `scaled_sfm_reconstruction`.
    pub apply_scale: bool,
    /// Shift the model so the dominant floor level sits at zero.
    pub elevate: bool,
    /// Delete 3D points observed inside dynamic-object segmentation masks.
    pub mask_objects: bool,
    /// Run the statistical outlier filter over the triangulated points.
    pub remove_outliers: bool,
    pub voxel_size: f64,
    pub outlier_neighbors: usize,
    pub outlier_std_ratio: f64,
    /// XY bucket edge length used when estimating the floor level.
    pub elevation_bucket_meters: f64,
    /// Segmentation confidence threshold for masking.
    pub segmentation_confidence: f32,
    /// COCO class ids considered dynamic.
    pub target_class_ids: Vec<u32>,
}

impl Default for CleanConfig {
    fn default() -> Self {
        CleanConfig {
            manhattan_align: true,
            negate_y_rotation: false,
            crop_y_meters: 0.33,
            apply_scale: true,
            elevate: true,
            mask_objects: false,
            remove_outliers: true,
            voxel_size: 0.08,
            outlier_neighbors: 100,
            outlier_std_ratio: 1.5,
            elevation_bucket_meters: 0.5,
            segmentation_confidence: 0.40,
            target_class_ids: DEFAULT_TARGET_CLASS_IDS.to_vec(),
        }
    }
}

/// Argv prefixes for every external invocation. Deployments substitute
/// wrappers (container entrypoints, GPU pinning scripts) without code
/// changes. Always argv lists, never shell strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ToolConfig {
    pub ffprobe: Vec<String>,
    pub ns_process_data: Vec<String>,
    pub colmap: Vec<String>,
    /// Sidecar commands implementing the model capabilities.
    pub local_features: Vec<String>,
    pub global_descriptor: Vec<String>,
    pub matcher: Vec<String>,
    pub pnp: Vec<String>,
    pub segmenter: Vec<String>,
    /// Sidecar wrapping COLMAP point triangulation against a prior or
    /// reference model, fed from the feature/match stores.
    pub triangulator: Vec<String>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        let one = |s: &str| vec![s.to_string()];
        ToolConfig {
            ffprobe: one("ffprobe"),
            ns_process_data: one("ns-process-data"),
            colmap: one("colmap"),
            local_features: vec!["maploc-sidecar".into(), "local-features".into()],
            global_descriptor: vec!["maploc-sidecar".into(), "global-descriptor".into()],
            matcher: vec!["maploc-sidecar".into(), "match".into()],
            pnp: vec!["maploc-sidecar".into(), "pnp".into()],
            segmenter: vec!["maploc-sidecar".into(), "segment".into()],
            triangulator: vec!["maploc-sidecar".into(), "triangulate".into()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LocalizeConfig {
    /// Candidates retrieved by global-descriptor similarity.
    pub retrieval_top_k: usize,
    /// RANSAC maximum reprojection error in pixels.
    pub max_reproj_error: f64,
    pub refine_focal_length: bool,
    pub refine_extra_params: bool,
    /// Apply the -90 degree Y rotation when converting poses into the
    /// client-facing gravity frame (newer scan pipelines expect it).
    pub gravity_y_rotation: bool,
    /// Soft per-stage budget; exceeded stages return a soft failure.
    pub stage_budget_secs: Option<u64>,
}

impl Default for LocalizeConfig {
    fn default() -> Self {
        LocalizeConfig {
            retrieval_top_k: 10,
            max_reproj_error: 12.0,
            refine_focal_length: true,
            refine_extra_params: true,
            gravity_y_rotation: true,
            stage_budget_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct JobsConfig {
    pub max_retries: u32,
    pub retry_backoff_secs: u64,
    pub hard_timeout_secs: u64,
    pub warn_timeout_secs: u64,
    /// Concurrent worker processes across all maps.
    pub worker_slots: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        JobsConfig {
            max_retries: 3,
            retry_backoff_secs: 60,
            hard_timeout_secs: 600,
            warn_timeout_secs: 540,
            worker_slots: 1,
        }
    }
}
