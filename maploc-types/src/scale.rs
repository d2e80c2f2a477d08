//! Metric-scale records and posed-query metadata.
//!
//! The scale of a map is a vector of pair-wise samples; the effective scale
//! is their median, recomputed on demand so a later localization fix can
//! shift it. The canonical on-disk form is a versioned CBOR record;
//! `scale.pkl` files written by earlier deployments are still readable and
//! are migrated to CBOR on the next write.

use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, MapDirs, Result};

const SCALE_RECORD_VERSION: u32 = 1;
const POSED_QUERY_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleRecord {
    pub version: u32,
    pub samples: Vec<f64>,
}

impl ScaleRecord {
    pub fn new(samples: Vec<f64>) -> Self {
        ScaleRecord {
            version: SCALE_RECORD_VERSION,
            samples,
        }
    }

    /// Median of the samples; `None` when there are no valid samples.
    pub fn effective_scale(&self) -> Option<f64> {
        median(&self.samples)
    }

    /// Load the scale record for a map, preferring the CBOR form and
    /// falling back to the legacy pickle. `Ok(None)` when neither exists.
    pub fn load(dirs: &MapDirs) -> Result<Option<ScaleRecord>> {
        let cbor_path = dirs.scale_cbor_path();
        if cbor_path.is_file() {
            let f = std::fs::File::open(&cbor_path)?;
            let record: ScaleRecord = serde_cbor::from_reader(f)?;
            if record.version != SCALE_RECORD_VERSION {
                return Err(Error::UnsupportedScaleVersion(record.version));
            }
            return Ok(Some(record));
        }
        let pkl_path = dirs.scale_pickle_path();
        if pkl_path.is_file() {
            let samples = read_legacy_pickle_samples(&pkl_path)?;
            return Ok(Some(ScaleRecord::new(samples)));
        }
        Ok(None)
    }

    pub fn save(&self, dirs: &MapDirs) -> Result<()> {
        let bytes = serde_cbor::to_vec(self)?;
        std::fs::write(dirs.scale_cbor_path(), bytes)?;
        Ok(())
    }
}

/// The oldest files pickled a bare float, newer ones a list of samples.
#[derive(Deserialize)]
#[serde(untagged)]
enum LegacyScalePickle {
    Samples(Vec<f64>),
    Single(f64),
}

fn read_legacy_pickle_samples(path: &Path) -> Result<Vec<f64>> {
    let mut buf = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut buf)?;
    let parsed: LegacyScalePickle =
        serde_pickle::from_slice(&buf, serde_pickle::DeOptions::new())?;
    Ok(match parsed {
        LegacyScalePickle::Samples(v) => v,
        LegacyScalePickle::Single(s) => vec![s],
    })
}

fn median(samples: &[f64]) -> Option<f64> {
    let mut vals: Vec<f64> = samples.iter().copied().filter(|v| v.is_finite()).collect();
    if vals.is_empty() {
        return None;
    }
    vals.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = vals.len();
    Some(if n % 2 == 1 {
        vals[n / 2]
    } else {
        0.5 * (vals[n / 2 - 1] + vals[n / 2])
    })
}

/// One posed query: an image plus the client-frame camera pose captured at
/// the same instant, stored column-major as the client reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PosedQueryRecord {
    pub version: u32,
    /// Column-major flattened 4x4 client camera pose.
    pub client_pose_col_major: Vec<f64>,
}

impl PosedQueryRecord {
    pub fn new(client_pose_col_major: Vec<f64>) -> Result<Self> {
        if client_pose_col_major.len() != 16 {
            return Err(Error::MalformedPosedQuery(format!(
                "expected 16 pose elements, got {}",
                client_pose_col_major.len()
            )));
        }
        Ok(PosedQueryRecord {
            version: POSED_QUERY_VERSION,
            client_pose_col_major,
        })
    }

    /// Read a posed-query directory entry: `pose.cbor` preferred,
    /// `location_data.pkl` accepted for old installations.
    pub fn load_from_dir(dir: &Path) -> Result<PosedQueryRecord> {
        let cbor_path = dir.join("pose.cbor");
        if cbor_path.is_file() {
            let f = std::fs::File::open(&cbor_path)?;
            let record: PosedQueryRecord = serde_cbor::from_reader(f)?;
            if record.client_pose_col_major.len() != 16 {
                return Err(Error::MalformedPosedQuery(
                    "pose.cbor does not hold a 4x4 matrix".into(),
                ));
            }
            return Ok(record);
        }
        let pkl_path = dir.join("location_data.pkl");
        if pkl_path.is_file() {
            return read_legacy_location_data(&pkl_path);
        }
        Err(Error::MalformedPosedQuery(format!(
            "no pose record in {}",
            dir.display()
        )))
    }

    pub fn save_to_dir(&self, dir: &Path) -> Result<()> {
        let bytes = serde_cbor::to_vec(self)?;
        std::fs::write(dir.join("pose.cbor"), bytes)?;
        Ok(())
    }
}

/// Clients serialized the matrix either flat or as four rows.
#[derive(Deserialize)]
#[serde(untagged)]
enum LegacyMatrix {
    Flat(Vec<f64>),
    Rows(Vec<Vec<f64>>),
}

#[derive(Deserialize)]
struct LegacyLocationData {
    aframe_camera_matrix_world: LegacyMatrix,
}

fn read_legacy_location_data(path: &Path) -> Result<PosedQueryRecord> {
    let mut buf = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut buf)?;
    let parsed: LegacyLocationData =
        serde_pickle::from_slice(&buf, serde_pickle::DeOptions::new())?;
    let flat = match parsed.aframe_camera_matrix_world {
        LegacyMatrix::Flat(v) => v,
        LegacyMatrix::Rows(rows) => rows.into_iter().flatten().collect(),
    };
    PosedQueryRecord::new(flat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MapName;

    #[test]
    fn median_of_samples() {
        assert_eq!(median(&[2.0, 2.0, 2.0]), Some(2.0));
        assert_eq!(median(&[1.0, 3.0]), Some(2.0));
        assert_eq!(median(&[5.0, 1.0, 3.0]), Some(3.0));
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[f64::NAN]), None);
    }

    #[test]
    fn cbor_round_trip_and_legacy_pickle() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = MapDirs::new(tmp.path(), &MapName::new("m").unwrap());
        std::fs::create_dir_all(dirs.root()).unwrap();

        // No record at all.
        assert!(ScaleRecord::load(&dirs).unwrap().is_none());

        // Legacy pickle with a list of samples.
        let pickled = serde_pickle::to_vec(
            &vec![2.0f64, 2.1, 1.9],
            serde_pickle::SerOptions::new(),
        )
        .unwrap();
        std::fs::write(dirs.scale_pickle_path(), pickled).unwrap();
        let record = ScaleRecord::load(&dirs).unwrap().unwrap();
        assert_eq!(record.samples.len(), 3);
        assert!((record.effective_scale().unwrap() - 2.0).abs() < 1e-12);

        // Once saved as CBOR, the CBOR form wins.
        ScaleRecord::new(vec![4.0]).save(&dirs).unwrap();
        let record = ScaleRecord::load(&dirs).unwrap().unwrap();
        assert_eq!(record.samples, vec![4.0]);
    }

    #[test]
    fn posed_query_legacy_shapes() {
        let tmp = tempfile::tempdir().unwrap();
        let flat: Vec<f64> = (0..16).map(|i| i as f64).collect();

        // Modern CBOR record.
        PosedQueryRecord::new(flat.clone())
            .unwrap()
            .save_to_dir(tmp.path())
            .unwrap();
        let back = PosedQueryRecord::load_from_dir(tmp.path()).unwrap();
        assert_eq!(back.client_pose_col_major, flat);

        // Legacy pickle dict with nested rows.
        let tmp2 = tempfile::tempdir().unwrap();
        let mut dict = std::collections::BTreeMap::new();
        let rows: Vec<Vec<f64>> = flat.chunks(4).map(|c| c.to_vec()).collect();
        dict.insert("aframe_camera_matrix_world".to_string(), rows);
        let pickled = serde_pickle::to_vec(&dict, serde_pickle::SerOptions::new()).unwrap();
        std::fs::write(tmp2.path().join("location_data.pkl"), pickled).unwrap();
        let back = PosedQueryRecord::load_from_dir(tmp2.path()).unwrap();
        assert_eq!(back.client_pose_col_major, flat);
    }
}
