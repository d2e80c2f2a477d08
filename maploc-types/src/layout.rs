//! On-disk layout of a single map directory.
//!
//! Everything a map owns lives under `data/map_data/<name>/`. Builders are
//! the single writer; the localizer and metadata readers only ever read.

use std::path::{Path, PathBuf};

use crate::MapName;

pub const IMAGES_DIRNAME: &str = "images";
pub const THUMBNAILS_DIRNAME: &str = "images_8";
pub const HLOC_DIRNAME: &str = "hloc_data";
pub const SFM_DIRNAME: &str = "sfm_reconstruction";
pub const SCALED_SFM_DIRNAME: &str = "scaled_sfm_reconstruction";
pub const POLYCAM_DIRNAME: &str = "polycam_data";
pub const POSED_QUERIES_DIRNAME: &str = "images_with_pose";
pub const POINTS_PCD_FILENAME: &str = "points.pcd";
pub const LOG_FILENAME: &str = "log.txt";
pub const SCALE_CBOR_FILENAME: &str = "scale.cbor";
pub const SCALE_PICKLE_FILENAME: &str = "scale.pkl";
pub const WAYPOINTS_FILENAME: &str = "waypoints_graph.csv";
pub const CAPABILITIES_FILENAME: &str = "capabilities.json";
pub const LOCALIZATION_URL_FILENAME: &str = "localization_url.txt";

/// Resolved paths for one map directory.
#[derive(Debug, Clone)]
pub struct MapDirs {
    root: PathBuf,
}

impl MapDirs {
    pub fn new<P: AsRef<Path>>(data_root: P, name: &MapName) -> Self {
        MapDirs {
            root: data_root.as_ref().join(name.as_str()),
        }
    }

    /// A map directory rooted at an explicit path (used by the transforms
    /// operator, which is handed a directory rather than a name).
    pub fn at_root<P: Into<PathBuf>>(root: P) -> Self {
        MapDirs { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join(IMAGES_DIRNAME)
    }

    pub fn thumbnails_dir(&self) -> PathBuf {
        self.root.join(THUMBNAILS_DIRNAME)
    }

    pub fn hloc_dir(&self) -> PathBuf {
        self.root.join(HLOC_DIRNAME)
    }

    pub fn sfm_reconstruction_dir(&self) -> PathBuf {
        self.hloc_dir().join(SFM_DIRNAME)
    }

    pub fn scaled_sfm_reconstruction_dir(&self) -> PathBuf {
        self.hloc_dir().join(SCALED_SFM_DIRNAME)
    }

    /// The reconstruction queries should run against: the metric-scaled one
    /// when a previous scale application produced it, the base one otherwise.
    pub fn preferred_reconstruction_dir(&self) -> PathBuf {
        let scaled = self.scaled_sfm_reconstruction_dir();
        if scaled.is_dir() {
            scaled
        } else {
            self.sfm_reconstruction_dir()
        }
    }

    pub fn polycam_dir(&self) -> PathBuf {
        self.root.join(POLYCAM_DIRNAME)
    }

    pub fn posed_queries_dir(&self) -> PathBuf {
        self.root.join(POSED_QUERIES_DIRNAME)
    }

    pub fn points_pcd_path(&self) -> PathBuf {
        self.hloc_dir().join(POINTS_PCD_FILENAME)
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join(LOG_FILENAME)
    }

    pub fn scale_cbor_path(&self) -> PathBuf {
        self.root.join(SCALE_CBOR_FILENAME)
    }

    pub fn scale_pickle_path(&self) -> PathBuf {
        self.root.join(SCALE_PICKLE_FILENAME)
    }

    pub fn waypoints_path(&self) -> PathBuf {
        self.root.join(WAYPOINTS_FILENAME)
    }

    pub fn capabilities_path(&self) -> PathBuf {
        self.root.join(CAPABILITIES_FILENAME)
    }

    pub fn localization_url_path(&self) -> PathBuf {
        self.root.join(LOCALIZATION_URL_FILENAME)
    }
}

/// Enumerate the map directories under a data root. Non-directories are
/// skipped silently; the caller decides what a valid map is by trying to
/// load it.
pub fn list_map_names<P: AsRef<Path>>(data_root: P) -> crate::Result<Vec<MapName>> {
    let mut names = Vec::new();
    let rd = match std::fs::read_dir(data_root.as_ref()) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e.into()),
    };
    for entry in rd {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(s) = entry.file_name().to_str() {
            if let Ok(name) = MapName::new(s) {
                names.push(name);
            }
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferred_reconstruction_falls_back_to_base() {
        let tmp = tempfile::tempdir().unwrap();
        let name = MapName::new("lab").unwrap();
        let dirs = MapDirs::new(tmp.path(), &name);
        assert_eq!(dirs.preferred_reconstruction_dir(), dirs.sfm_reconstruction_dir());
        std::fs::create_dir_all(dirs.scaled_sfm_reconstruction_dir()).unwrap();
        assert_eq!(
            dirs.preferred_reconstruction_dir(),
            dirs.scaled_sfm_reconstruction_dir()
        );
    }

    #[test]
    fn list_maps_skips_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("atrium")).unwrap();
        std::fs::write(tmp.path().join("stray.txt"), b"x").unwrap();
        let names = list_map_names(tmp.path()).unwrap();
        assert_eq!(names, vec![MapName::new("atrium").unwrap()]);
    }
}
