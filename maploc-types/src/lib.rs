//! Shared vocabulary types for the maploc visual localization service.
//!
//! Everything that more than one crate needs to agree on lives here: the
//! on-disk map directory layout, pipeline configuration, job descriptors,
//! localization response shapes, and the client-facing metadata formats.

use serde::{Deserialize, Serialize};

pub mod capabilities;
pub mod config;
pub mod job;
pub mod layout;
pub mod scale;
pub mod waypoints;

pub use capabilities::CapabilitiesResponse;
pub use config::{BuildConfig, CleanConfig, JobsConfig, LocalizeConfig, ToolConfig};
pub use job::{JobDescriptor, JobId, JobKind, JobState};
pub use layout::MapDirs;
pub use scale::{PosedQueryRecord, ScaleRecord};
pub use waypoints::Waypoint;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid map name {0:?}")]
    InvalidMapName(String),
    #[error("map {0:?} not found")]
    MapNotFound(String),
    #[error("unsupported scale record version {0}")]
    UnsupportedScaleVersion(u32),
    #[error("malformed posed-query record: {0}")]
    MalformedPosedQuery(String),
    #[error("malformed waypoint row {row}: {reason}")]
    MalformedWaypointRow { row: usize, reason: String },
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("{source}")]
    Csv {
        #[from]
        source: csv::Error,
    },
    #[error("{source}")]
    SerdeJson {
        #[from]
        source: serde_json::Error,
    },
    #[error("{source}")]
    SerdeCbor {
        #[from]
        source: serde_cbor::Error,
    },
    #[error("pickle error: {source}")]
    Pickle {
        #[from]
        source: serde_pickle::Error,
    },
    #[error("{source}")]
    TomlDe {
        #[from]
        source: toml::de::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Name of a map, unique per deployment. Doubles as its directory name, so
/// path separators and relative components are rejected.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MapName(String);

impl MapName {
    pub fn new<S: Into<String>>(name: S) -> Result<Self> {
        let name = name.into();
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
            || name.contains('\0')
        {
            return Err(Error::InvalidMapName(name));
        }
        Ok(MapName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MapName {
    type Error = Error;
    fn try_from(value: String) -> Result<Self> {
        MapName::new(value)
    }
}

impl From<MapName> for String {
    fn from(value: MapName) -> String {
        value.0
    }
}

impl std::fmt::Display for MapName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Why a localization attempt did not produce a pose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalizeFailureKind {
    /// Feature or descriptor extraction raised; hard failure for this query.
    Extraction,
    /// Retrieval returned no candidate images.
    NoCandidates,
    /// No local-feature matches against any candidate.
    NoMatches,
    /// PnP could not solve (too few correspondences or RANSAC rejected).
    Pnp,
}

/// Wire shape of a localization answer. Errors inside the localizer are
/// mapped into `success: false` here; they never cross the query boundary
/// as a Rust error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalizeResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<LocalizeFailureKind>,
    /// Camera-in-world pose in the gravity-aligned map frame, row-major 4x4.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pose: Option<[[f64; 4]; 4]>,
    /// AR-scene transform in the client frame, column-major flattened, only
    /// present when the query carried a client pose.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arscene_pose: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_inliers: Option<u32>,
    /// Inliers over matched query keypoints, in [0, 1].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl LocalizeResponse {
    pub fn failure(kind: LocalizeFailureKind) -> Self {
        LocalizeResponse {
            success: false,
            kind: Some(kind),
            pose: None,
            arscene_pose: None,
            num_inliers: None,
            confidence: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_name_rejects_path_components() {
        assert!(MapName::new("lobby").is_ok());
        assert!(MapName::new("floor-2_west").is_ok());
        for bad in ["", ".", "..", "a/b", "a\\b", "x\0y"] {
            assert!(MapName::new(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn failure_response_serializes_kind() {
        let r = LocalizeResponse::failure(LocalizeFailureKind::NoCandidates);
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, r#"{"success":false,"kind":"no_candidates"}"#);
    }
}
