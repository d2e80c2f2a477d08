//! Process-backed capability adapters.
//!
//! Each adapter runs a configured sidecar command through `proc-runner`,
//! handing inputs and collecting outputs as files in a scratch directory.
//! The exchange formats are CBOR for feature data and 8-bit gray PNG for
//! masks. Sidecar commands are argv prefixes from the tool config; the
//! adapter appends its own arguments.

use std::path::{Path, PathBuf};

use feature_store::{GlobalDescriptor, LocalFeatures, PairMatches};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    CapabilityError, FeatureMatcher, GlobalDescriptorExtractor, LocalFeatureExtractor, PnpRequest,
    PnpSolution, PnpSolver, Result, SegmentationMask, Segmenter,
};

fn scratch_dir() -> Result<tempfile::TempDir> {
    Ok(tempfile::Builder::new().prefix("maploc-sidecar").tempdir()?)
}

fn run_to_cbor<T: DeserializeOwned>(argv: Vec<String>, output_path: &Path) -> Result<T> {
    proc_runner::run_logged(&argv, None)?;
    let f = match std::fs::File::open(output_path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CapabilityError::MissingSidecarOutput);
        }
        Err(e) => return Err(e.into()),
    };
    Ok(serde_cbor::from_reader(f)?)
}

fn write_cbor<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_cbor::to_vec(value)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

fn with_args(prefix: &[String], rest: &[(&str, &str)]) -> Vec<String> {
    let mut argv = prefix.to_vec();
    for (flag, value) in rest {
        argv.push(flag.to_string());
        argv.push(value.to_string());
    }
    argv
}

pub struct SidecarLocalExtractor {
    argv: Vec<String>,
}

impl SidecarLocalExtractor {
    pub fn new(argv: Vec<String>) -> Self {
        SidecarLocalExtractor { argv }
    }
}

impl LocalFeatureExtractor for SidecarLocalExtractor {
    fn extract_local(&self, image_path: &Path) -> Result<LocalFeatures> {
        let scratch = scratch_dir()?;
        let out: PathBuf = scratch.path().join("features.cbor");
        let argv = with_args(
            &self.argv,
            &[
                ("--image", &image_path.display().to_string()),
                ("--output", &out.display().to_string()),
            ],
        );
        let features: LocalFeatures = run_to_cbor(argv, &out)?;
        features
            .check(&image_path.display().to_string())
            .map_err(|e| CapabilityError::Failed {
                capability: "local-features",
                message: e.to_string(),
            })?;
        Ok(features)
    }
}

pub struct SidecarGlobalExtractor {
    argv: Vec<String>,
}

impl SidecarGlobalExtractor {
    pub fn new(argv: Vec<String>) -> Self {
        SidecarGlobalExtractor { argv }
    }
}

impl GlobalDescriptorExtractor for SidecarGlobalExtractor {
    fn extract_global(&self, image_path: &Path) -> Result<GlobalDescriptor> {
        let scratch = scratch_dir()?;
        let out = scratch.path().join("descriptor.cbor");
        let argv = with_args(
            &self.argv,
            &[
                ("--image", &image_path.display().to_string()),
                ("--output", &out.display().to_string()),
            ],
        );
        run_to_cbor(argv, &out)
    }
}

pub struct SidecarMatcher {
    argv: Vec<String>,
}

impl SidecarMatcher {
    pub fn new(argv: Vec<String>) -> Self {
        SidecarMatcher { argv }
    }
}

impl FeatureMatcher for SidecarMatcher {
    fn match_pair(&self, first: &LocalFeatures, second: &LocalFeatures) -> Result<PairMatches> {
        let scratch = scratch_dir()?;
        let first_path = scratch.path().join("first.cbor");
        let second_path = scratch.path().join("second.cbor");
        let out = scratch.path().join("matches.cbor");
        write_cbor(&first_path, first)?;
        write_cbor(&second_path, second)?;
        let argv = with_args(
            &self.argv,
            &[
                ("--first", &first_path.display().to_string()),
                ("--second", &second_path.display().to_string()),
                ("--output", &out.display().to_string()),
            ],
        );
        run_to_cbor(argv, &out)
    }
}

pub struct SidecarPnpSolver {
    argv: Vec<String>,
}

impl SidecarPnpSolver {
    pub fn new(argv: Vec<String>) -> Self {
        SidecarPnpSolver { argv }
    }
}

impl PnpSolver for SidecarPnpSolver {
    fn solve(&self, request: &PnpRequest) -> Result<Option<PnpSolution>> {
        let scratch = scratch_dir()?;
        let request_path = scratch.path().join("request.cbor");
        let out = scratch.path().join("solution.cbor");
        write_cbor(&request_path, request)?;
        let argv = with_args(
            &self.argv,
            &[
                ("--request", &request_path.display().to_string()),
                ("--output", &out.display().to_string()),
            ],
        );
        // The solver writes `null` when RANSAC rejects; that is a soft
        // failure, not an error.
        run_to_cbor(argv, &out)
    }
}

pub struct SidecarSegmenter {
    argv: Vec<String>,
}

impl SidecarSegmenter {
    pub fn new(argv: Vec<String>) -> Self {
        SidecarSegmenter { argv }
    }
}

impl Segmenter for SidecarSegmenter {
    fn union_mask(
        &self,
        image_path: &Path,
        confidence: f32,
        class_ids: &[u32],
    ) -> Result<Option<SegmentationMask>> {
        let scratch = scratch_dir()?;
        let out = scratch.path().join("mask.png");
        let classes = class_ids
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let argv = with_args(
            &self.argv,
            &[
                ("--image", &image_path.display().to_string()),
                ("--confidence", &confidence.to_string()),
                ("--classes", &classes),
                ("--output", &out.display().to_string()),
            ],
        );
        proc_runner::run_logged(&argv, None)?;
        if !out.is_file() {
            // No detections: the sidecar writes nothing.
            return Ok(None);
        }
        let img = image::open(&out)?.into_luma8();
        let mask = SegmentationMask::from_luma(&img);
        Ok(if mask.masked_pixel_count() == 0 {
            None
        } else {
            Some(mask)
        })
    }
}
