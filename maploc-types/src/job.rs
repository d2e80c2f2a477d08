//! Build-job descriptors and lifecycle states.
//!
//! A job descriptor is the entire contract between the controller and a
//! worker process: plain serde data, no shared memory. In-memory controller
//! state is regenerable from the queue and the per-map log file.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::MapName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// What kind of capture source the build starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Video,
    Images,
    Polycam,
    Kiri,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Retrying,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// Everything a worker process needs to run one build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: JobId,
    pub map: MapName,
    pub kind: JobKind,
    /// Capture input: the video file, image directory, or scan archive dir.
    pub source_path: PathBuf,
    /// Frame extraction ratio, only meaningful for video sources.
    #[serde(default)]
    pub frame_ratio_percent: Option<f64>,
    /// Path of the TOML build config the worker should load; defaults apply
    /// when absent.
    #[serde(default)]
    pub config_path: Option<PathBuf>,
}

/// Controller-side view of a job, returned by status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: JobId,
    pub map: MapName,
    pub kind: JobKind,
    pub state: JobState,
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub log_path: PathBuf,
    /// Byte offset readers should resume log tailing from.
    pub log_offset: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_round_trips_through_json() {
        let d = JobDescriptor {
            id: JobId(7),
            map: MapName::new("atrium").unwrap(),
            kind: JobKind::Polycam,
            source_path: PathBuf::from("/tmp/polycam_data"),
            frame_ratio_percent: None,
            config_path: None,
        };
        let text = serde_json::to_string(&d).unwrap();
        let back: JobDescriptor = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id, d.id);
        assert_eq!(back.map, d.map);
        assert_eq!(back.kind, JobKind::Polycam);
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Retrying.is_terminal());
        assert!(!JobState::Queued.is_terminal());
    }
}
