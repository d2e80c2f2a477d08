//! Map construction: capture-source ingestion through feature extraction,
//! matching, triangulation and geometric post-processing.
//!
//! A build is strictly sequential. Stages log a banner into the per-map
//! `log.txt`, external tools are driven through `proc-runner`, and an
//! abort flag is checked between stages so a cancelled job stops at the
//! next boundary, leaving partial artifacts (and the log explaining them)
//! in place.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod pairs;
pub mod pipeline;
pub mod scale;
pub mod sources;
pub mod transforms;

pub use pipeline::{run_build, BuildContext};
pub use sources::CaptureSource;

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("build aborted")]
    Aborted,
    #[error("missing input: {0}")]
    MissingInput(String),
    #[error("video has no usable video stream")]
    NoVideoStream,
    #[error("unsupported camera model {0:?} in transforms.json")]
    UnsupportedTransformsCamera(String),
    #[error("stage {stage} failed: {source}")]
    Stage {
        stage: &'static str,
        source: Box<BuildError>,
    },
    #[error("{source}")]
    Runner {
        #[from]
        source: proc_runner::RunnerError,
    },
    #[error("{source}")]
    Model {
        #[from]
        source: colmap_model::ModelError,
    },
    #[error("{source}")]
    Clean {
        #[from]
        source: map_clean::CleanError,
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
    Mvg {
        #[from]
        source: maploc_mvg::MvgError,
    },
    #[error("{source}")]
    Types {
        #[from]
        source: maploc_types::Error,
    },
    #[error("{source}")]
    Cache {
        #[from]
        source: map_cache::CacheError,
    },
    #[error("{source}")]
    SerdeJson {
        #[from]
        source: serde_json::Error,
    },
    #[error("zip error: {source}")]
    Zip {
        #[from]
        source: zip::result::ZipError,
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

impl BuildError {
    fn at_stage(self, stage: &'static str) -> BuildError {
        match self {
            // Don't re-wrap aborts or already-tagged errors.
            BuildError::Aborted | BuildError::Stage { .. } => self,
            other => BuildError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;

/// Cooperative cancellation flag for builds, checked between stages.
#[derive(Debug, Clone, Default)]
pub struct BuildAbort(Arc<AtomicBool>);

impl BuildAbort {
    pub fn new() -> BuildAbort {
        BuildAbort::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_aborted() {
            Err(BuildError::Aborted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_flag_trips_check() {
        let abort = BuildAbort::new();
        abort.check().unwrap();
        abort.abort();
        assert!(matches!(abort.check(), Err(BuildError::Aborted)));
    }

    #[test]
    fn stage_wrapping_preserves_abort() {
        let err = BuildError::Aborted.at_stage("features");
        assert!(matches!(err, BuildError::Aborted));
        let err = BuildError::MissingInput("x".into()).at_stage("prepare");
        assert!(matches!(err, BuildError::Stage { stage: "prepare", .. }));
    }
}
