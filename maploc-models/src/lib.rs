//! Model capabilities behind trait objects.
//!
//! The neural models (local-feature extractor, global-descriptor
//! extractor, matcher, segmenter) and the PnP solver are external to this
//! system: they are *capabilities* with defined inputs and outputs. Each
//! capability is a small trait; production wiring uses process-backed
//! adapters that exchange CBOR/PNG files with configured sidecar commands,
//! and tests substitute deterministic implementations. The set of loaded
//! capabilities is an explicit [`CapabilitySet`] passed around by handle —
//! there is no runtime lookup by model name.

use std::path::Path;
use std::sync::Arc;

use feature_store::{GlobalDescriptor, LocalFeatures, PairMatches};
use serde::{Deserialize, Serialize};

use maploc_types::ToolConfig;

mod mask;
mod sidecar;

pub use mask::SegmentationMask;
pub use sidecar::{
    SidecarGlobalExtractor, SidecarLocalExtractor, SidecarMatcher, SidecarPnpSolver,
    SidecarSegmenter,
};

#[derive(thiserror::Error, Debug)]
pub enum CapabilityError {
    #[error("{capability} capability failed: {message}")]
    Failed {
        capability: &'static str,
        message: String,
    },
    #[error("sidecar produced no output file")]
    MissingSidecarOutput,
    #[error("{source}")]
    Runner {
        #[from]
        source: proc_runner::RunnerError,
    },
    #[error("{source}")]
    Store {
        #[from]
        source: feature_store::StoreError,
    },
    #[error("{source}")]
    Cbor {
        #[from]
        source: serde_cbor::Error,
    },
    #[error("image error: {source}")]
    Image {
        #[from]
        source: image::ImageError,
    },
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, CapabilityError>;

pub trait LocalFeatureExtractor: Send + Sync {
    /// Detect keypoints and compute descriptors for one image file.
    fn extract_local(&self, image_path: &Path) -> Result<LocalFeatures>;
}

pub trait GlobalDescriptorExtractor: Send + Sync {
    /// Compute the image-level retrieval descriptor for one image file.
    fn extract_global(&self, image_path: &Path) -> Result<GlobalDescriptor>;
}

pub trait FeatureMatcher: Send + Sync {
    /// Match two feature sets; indices are (first, second).
    fn match_pair(&self, first: &LocalFeatures, second: &LocalFeatures) -> Result<PairMatches>;
}

/// Pinhole-style camera handed to the PnP solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PnpCamera {
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub params: Vec<f64>,
}

impl PnpCamera {
    /// Infer a camera from image dimensions alone: pinhole, focal length
    /// 1.2x the larger dimension, principal point at the center.
    pub fn infer_from_size(width: u32, height: u32) -> PnpCamera {
        let focal = 1.2 * f64::from(width.max(height));
        PnpCamera {
            model: "PINHOLE".to_string(),
            width,
            height,
            params: vec![
                focal,
                focal,
                f64::from(width) / 2.0,
                f64::from(height) / 2.0,
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PnpRequest {
    pub camera: PnpCamera,
    /// 2D pixel coordinates, one entry per correspondence.
    pub points2d: Vec<[f64; 2]>,
    /// Matching 3D world points.
    pub points3d: Vec<[f64; 3]>,
    pub max_reproj_error: f64,
    pub refine_focal_length: bool,
    pub refine_extra_params: bool,
}

/// A solved pose in the reconstruction convention (world-from-camera).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PnpSolution {
    pub qvec: [f64; 4],
    pub tvec: [f64; 3],
    pub num_inliers: u32,
    pub inlier_mask: Vec<bool>,
}

pub trait PnpSolver: Send + Sync {
    /// Solve camera pose from 2D-3D correspondences with RANSAC.
    /// `Ok(None)` means RANSAC rejected the problem (soft failure).
    fn solve(&self, request: &PnpRequest) -> Result<Option<PnpSolution>>;
}

pub trait Segmenter: Send + Sync {
    /// Union mask of the requested classes above the confidence threshold,
    /// or `None` when nothing was detected.
    fn union_mask(
        &self,
        image_path: &Path,
        confidence: f32,
        class_ids: &[u32],
    ) -> Result<Option<SegmentationMask>>;
}

/// All loaded capabilities, shared process-wide through the map cache.
#[derive(Clone)]
pub struct CapabilitySet {
    pub local: Arc<dyn LocalFeatureExtractor>,
    pub global: Arc<dyn GlobalDescriptorExtractor>,
    pub matcher: Arc<dyn FeatureMatcher>,
    pub pnp: Arc<dyn PnpSolver>,
    pub segmenter: Arc<dyn Segmenter>,
}

impl CapabilitySet {
    /// Production wiring: every capability backed by its configured
    /// sidecar command.
    pub fn from_tools(tools: &ToolConfig) -> CapabilitySet {
        CapabilitySet {
            local: Arc::new(SidecarLocalExtractor::new(tools.local_features.clone())),
            global: Arc::new(SidecarGlobalExtractor::new(tools.global_descriptor.clone())),
            matcher: Arc::new(SidecarMatcher::new(tools.matcher.clone())),
            pnp: Arc::new(SidecarPnpSolver::new(tools.pnp.clone())),
            segmenter: Arc::new(SidecarSegmenter::new(tools.segmenter.clone())),
        }
    }
}

/// Placeholder capability that fails every call. Used where a capability
/// set is structurally required but no sidecars are configured (tests,
/// metadata-only tooling).
struct UnconfiguredCapability;

fn unconfigured_err(capability: &'static str) -> CapabilityError {
    CapabilityError::Failed {
        capability,
        message: "capability not configured".to_string(),
    }
}

impl LocalFeatureExtractor for UnconfiguredCapability {
    fn extract_local(&self, _image_path: &Path) -> Result<LocalFeatures> {
        Err(unconfigured_err("local-features"))
    }
}

impl GlobalDescriptorExtractor for UnconfiguredCapability {
    fn extract_global(&self, _image_path: &Path) -> Result<GlobalDescriptor> {
        Err(unconfigured_err("global-descriptor"))
    }
}

impl FeatureMatcher for UnconfiguredCapability {
    fn match_pair(&self, _first: &LocalFeatures, _second: &LocalFeatures) -> Result<PairMatches> {
        Err(unconfigured_err("matcher"))
    }
}

impl PnpSolver for UnconfiguredCapability {
    fn solve(&self, _request: &PnpRequest) -> Result<Option<PnpSolution>> {
        Err(unconfigured_err("pnp"))
    }
}

impl Segmenter for UnconfiguredCapability {
    fn union_mask(
        &self,
        _image_path: &Path,
        _confidence: f32,
        _class_ids: &[u32],
    ) -> Result<Option<SegmentationMask>> {
        Err(unconfigured_err("segmenter"))
    }
}

impl CapabilitySet {
    pub fn unconfigured() -> CapabilitySet {
        let stub = Arc::new(UnconfiguredCapability);
        CapabilitySet {
            local: stub.clone(),
            global: stub.clone(),
            matcher: stub.clone(),
            pnp: stub.clone(),
            segmenter: stub,
        }
    }
}

impl std::fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CapabilitySet { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inferred_camera_matches_convention() {
        let cam = PnpCamera::infer_from_size(640, 480);
        assert_eq!(cam.model, "PINHOLE");
        approx::assert_relative_eq!(cam.params[0], 768.0);
        approx::assert_relative_eq!(cam.params[1], 768.0);
        approx::assert_relative_eq!(cam.params[2], 320.0);
        approx::assert_relative_eq!(cam.params[3], 240.0);
    }
}
