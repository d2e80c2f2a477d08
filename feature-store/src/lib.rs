//! Keyed binary stores for per-image features, global descriptors and
//! pair-wise matches, plus the in-memory retrieval index built from the
//! descriptor store.
//!
//! Each table is a directory of CBOR records keyed by image name. The
//! build job is the single writer; the localizer only reads. Records are
//! installed by rename so a reader never observes a half-written blob.

use std::path::{Path, PathBuf};

use nalgebra::DMatrix;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub const LOCAL_FEATURES_STORE: &str = "local_features.store";
pub const GLOBAL_DESCRIPTORS_STORE: &str = "global_descriptors.store";
pub const MATCHES_STORE: &str = "matches.store";

const RECORD_EXT: &str = "cbor";

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("invalid store key {0:?}")]
    InvalidKey(String),
    #[error("no record for key {0:?}")]
    MissingKey(String),
    #[error("record {key:?} is inconsistent: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("descriptor store is empty")]
    EmptyDescriptorStore,
    #[error("descriptor for {key:?} has dimension {got}, expected {want}")]
    DimensionMismatch {
        key: String,
        want: usize,
        got: usize,
    },
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("{source}")]
    Cbor {
        #[from]
        source: serde_cbor::Error,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Image names are flat file names; anything that could escape the store
/// directory is rejected up front.
fn check_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key == "."
        || key == ".."
        || key.contains('/')
        || key.contains('\\')
        || key.contains('\0')
    {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// A directory of CBOR records.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn open<P: Into<PathBuf>>(root: P) -> Result<BlobStore> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(BlobStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.{RECORD_EXT}"))
    }

    pub fn contains(&self, key: &str) -> bool {
        check_key(key).is_ok() && self.record_path(key).is_file()
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        check_key(key)?;
        let bytes = serde_cbor::to_vec(value)?;
        let final_path = self.record_path(key);
        let tmp_path = self.root.join(format!("{key}.{RECORD_EXT}.tmp"));
        std::fs::write(&tmp_path, bytes)?;
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        check_key(key)?;
        let path = self.record_path(key);
        let f = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::MissingKey(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_cbor::from_reader(f)?)
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        check_key(key)?;
        match std::fs::remove_file(self.record_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All record keys, sorted.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(&format!(".{RECORD_EXT}")) {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Local features of one image: keypoints (N x 2), descriptors (D x N,
/// column per keypoint), detection scores (N) and the image size the
/// keypoints are expressed in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalFeatures {
    pub keypoints: Vec<[f32; 2]>,
    pub descriptor_dim: usize,
    /// Column-major D x N block: descriptor `i` is
    /// `descriptors[i*descriptor_dim..(i+1)*descriptor_dim]`.
    pub descriptors: Vec<f32>,
    pub scores: Vec<f32>,
    pub image_size: [u32; 2],
}

impl LocalFeatures {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn descriptor(&self, i: usize) -> &[f32] {
        &self.descriptors[i * self.descriptor_dim..(i + 1) * self.descriptor_dim]
    }

    pub fn check(&self, key: &str) -> Result<()> {
        let n = self.keypoints.len();
        if self.scores.len() != n || self.descriptors.len() != n * self.descriptor_dim {
            return Err(StoreError::Corrupt {
                key: key.to_string(),
                reason: format!(
                    "{} keypoints, {} scores, {} descriptor values (dim {})",
                    n,
                    self.scores.len(),
                    self.descriptors.len(),
                    self.descriptor_dim
                ),
            });
        }
        Ok(())
    }

    /// Keep only the keypoints whose index satisfies the predicate,
    /// dropping the matching descriptor columns and scores.
    pub fn retain_indices<F: FnMut(usize) -> bool>(&self, mut keep: F) -> LocalFeatures {
        let mut out = LocalFeatures {
            keypoints: Vec::new(),
            descriptor_dim: self.descriptor_dim,
            descriptors: Vec::new(),
            scores: Vec::new(),
            image_size: self.image_size,
        };
        for i in 0..self.len() {
            if keep(i) {
                out.keypoints.push(self.keypoints[i]);
                out.descriptors.extend_from_slice(self.descriptor(i));
                out.scores.push(self.scores[i]);
            }
        }
        out
    }
}

/// Global descriptor of one image; unit norm by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalDescriptor {
    pub values: Vec<f32>,
}

/// Matches between an unordered image pair: index pairs into the two
/// feature sets plus per-match scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairMatches {
    pub indices: Vec<(u32, u32)>,
    pub scores: Vec<f32>,
}

impl PairMatches {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    fn swapped(&self) -> PairMatches {
        PairMatches {
            indices: self.indices.iter().map(|&(a, b)| (b, a)).collect(),
            scores: self.scores.clone(),
        }
    }
}

/// Key normalization for unordered pairs: the record is stored under the
/// lexicographically smaller name first.
fn pair_key(a: &str, b: &str) -> (String, bool) {
    if a <= b {
        (format!("{a}={b}"), false)
    } else {
        (format!("{b}={a}"), true)
    }
}

#[derive(Debug, Clone)]
pub struct MatchStore {
    store: BlobStore,
}

impl MatchStore {
    pub fn open<P: Into<PathBuf>>(root: P) -> Result<MatchStore> {
        Ok(MatchStore {
            store: BlobStore::open(root)?,
        })
    }

    pub fn put(&self, a: &str, b: &str, matches: &PairMatches) -> Result<()> {
        check_key(a)?;
        check_key(b)?;
        let (key, swapped) = pair_key(a, b);
        let record = if swapped {
            matches.swapped()
        } else {
            matches.clone()
        };
        self.store.put(&key, &record)
    }

    /// Matches oriented so that the first index refers to `a`.
    pub fn get(&self, a: &str, b: &str) -> Result<PairMatches> {
        check_key(a)?;
        check_key(b)?;
        let (key, swapped) = pair_key(a, b);
        let record: PairMatches = self.store.get(&key)?;
        Ok(if swapped { record.swapped() } else { record })
    }

    pub fn contains(&self, a: &str, b: &str) -> bool {
        let (key, _) = pair_key(a, b);
        self.store.contains(&key)
    }
}

/// The per-map retrieval index: descriptor rows in fixed image-name order
/// plus the parallel name vector. Rebuilt from the store after every
/// successful build and swapped in atomically by the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalDescriptorIndex {
    pub names: Vec<String>,
    /// N x D, row `i` is the (renormalized) descriptor of `names[i]`.
    pub matrix: DMatrix<f32>,
}

impl GlobalDescriptorIndex {
    pub fn load(store: &BlobStore) -> Result<GlobalDescriptorIndex> {
        let names = store.keys()?;
        if names.is_empty() {
            return Err(StoreError::EmptyDescriptorStore);
        }
        let mut dim = None;
        let mut rows: Vec<Vec<f32>> = Vec::with_capacity(names.len());
        for name in &names {
            let record: GlobalDescriptor = store.get(name)?;
            let want = *dim.get_or_insert(record.values.len());
            if record.values.len() != want {
                return Err(StoreError::DimensionMismatch {
                    key: name.clone(),
                    want,
                    got: record.values.len(),
                });
            }
            rows.push(record.values);
        }
        let dim = dim.unwrap_or(0);
        let mut matrix = DMatrix::zeros(names.len(), dim);
        for (i, row) in rows.iter().enumerate() {
            let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            let inv = if norm > 0.0 { 1.0 / norm } else { 0.0 };
            for (j, &v) in row.iter().enumerate() {
                matrix[(i, j)] = v * inv;
            }
        }
        Ok(GlobalDescriptorIndex { names, matrix })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Open the three standard tables under a map's `hloc_data` directory.
pub fn open_map_stores(hloc_dir: &Path) -> Result<(BlobStore, BlobStore, MatchStore)> {
    Ok((
        BlobStore::open(hloc_dir.join(LOCAL_FEATURES_STORE))?,
        BlobStore::open(hloc_dir.join(GLOBAL_DESCRIPTORS_STORE))?,
        MatchStore::open(hloc_dir.join(MATCHES_STORE))?,
    ))
}
