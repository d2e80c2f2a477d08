//! Reader, writer and editor for COLMAP sparse reconstruction models.
//!
//! The on-disk layout is the standard COLMAP triple — `cameras`, `images`,
//! `points3D` — in binary (canonical) or text form. Poses follow the COLMAP
//! convention throughout: the stored `(qvec, tvec)` maps world points into
//! the camera frame; the camera pose in the world is its inverse.
//!
//! Edits never renumber: deleting a 3D point rewrites the observation slot
//! of every image that tracked it back to "unobserved".

use std::collections::BTreeMap;
use std::path::Path;

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

mod binary;
mod text;

pub use binary::{read_binary_model, write_binary_model};
pub use text::{read_text_model, write_text_model};

/// Sentinel written to disk for an observation without a 3D point.
pub const UNOBSERVED_SENTINEL: i64 = -1;

#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    #[error("unknown camera model id {0}")]
    UnknownCameraModelId(i32),
    #[error("unknown camera model {0:?}")]
    UnknownCameraModelName(String),
    #[error("camera {camera_id} has {got} params, model {model:?} needs {want}")]
    WrongParamCount {
        camera_id: u32,
        model: CameraModel,
        want: usize,
        got: usize,
    },
    #[error("premature end of file in {0}")]
    PrematureFileEnd(&'static str),
    #[error("no reconstruction found in {0}")]
    NoModelFiles(String),
    #[error("parse error in {file} line {line}: {reason}")]
    Parse {
        file: &'static str,
        line: usize,
        reason: String,
    },
    #[error("image {image_id} observation {obs_index} references missing point3D {point3d_id}")]
    UnknownPoint {
        image_id: u32,
        obs_index: usize,
        point3d_id: u64,
    },
    #[error("point3D {point3d_id} track entry ({image_id}, {obs_index}) does not match the image observation")]
    TrackMismatch {
        point3d_id: u64,
        image_id: u32,
        obs_index: usize,
    },
    #[error("image {image_id} references missing camera {camera_id}")]
    UnknownCamera { image_id: u32, camera_id: u32 },
    #[error("transform matrix is not a uniform similarity (det {det})")]
    NotASimilarity { det: f64 },
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ModelError>;

/// Camera models supported by the pipeline. Everything the capture sources
/// produce is either an undistorted pinhole or the OpenCV radial-tangential
/// model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraModel {
    Pinhole,
    OpenCv,
}

impl CameraModel {
    pub fn model_id(&self) -> i32 {
        match self {
            CameraModel::Pinhole => 1,
            CameraModel::OpenCv => 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CameraModel::Pinhole => "PINHOLE",
            CameraModel::OpenCv => "OPENCV",
        }
    }

    pub fn num_params(&self) -> usize {
        match self {
            CameraModel::Pinhole => 4,
            CameraModel::OpenCv => 8,
        }
    }

    pub fn from_model_id(id: i32) -> Result<Self> {
        match id {
            1 => Ok(CameraModel::Pinhole),
            4 => Ok(CameraModel::OpenCv),
            other => Err(ModelError::UnknownCameraModelId(other)),
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "PINHOLE" => Ok(CameraModel::Pinhole),
            "OPENCV" => Ok(CameraModel::OpenCv),
            other => Err(ModelError::UnknownCameraModelName(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub id: u32,
    pub model: CameraModel,
    pub width: u64,
    pub height: u64,
    /// `fx fy cx cy` for PINHOLE; `fx fy cx cy k1 k2 p1 p2` for OPENCV.
    pub params: Vec<f64>,
}

impl Camera {
    pub fn pinhole(id: u32, width: u64, height: u64, fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Camera {
            id,
            model: CameraModel::Pinhole,
            width,
            height,
            params: vec![fx, fy, cx, cy],
        }
    }

    fn check_params(&self) -> Result<()> {
        let want = self.model.num_params();
        if self.params.len() != want {
            return Err(ModelError::WrongParamCount {
                camera_id: self.id,
                model: self.model,
                want,
                got: self.params.len(),
            });
        }
        Ok(())
    }
}

/// One 2D keypoint observation in an image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub xy: [f64; 2],
    pub point3d_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub id: u32,
    /// World-from-camera rotation, quaternion in (w, x, y, z) order.
    pub qvec: [f64; 4],
    /// World-from-camera translation.
    pub tvec: [f64; 3],
    pub camera_id: u32,
    pub name: String,
    pub observations: Vec<Observation>,
}

impl Image {
    pub fn rotation(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
            self.qvec[0],
            self.qvec[1],
            self.qvec[2],
            self.qvec[3],
        ))
    }

    pub fn set_rotation(&mut self, q: &UnitQuaternion<f64>) {
        self.qvec = [q.w, q.i, q.j, q.k];
    }

    /// Camera center in world coordinates: `-Rᵀ t`.
    pub fn camera_center(&self) -> Vector3<f64> {
        let r: Rotation3<f64> = self.rotation().to_rotation_matrix();
        let t = Vector3::from(self.tvec);
        -(r.transpose() * t)
    }

    /// Ids of the 3D points this image observes.
    pub fn observed_point_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.observations.iter().filter_map(|o| o.point3d_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackElement {
    pub image_id: u32,
    pub point2d_idx: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Point3D {
    pub xyz: [f64; 3],
    pub rgb: [u8; 3],
    pub error: f64,
    pub track: Vec<TrackElement>,
}

/// A full sparse reconstruction: three flat id-keyed maps. Ids are weak
/// references between the maps; the deletion sweep keeps them consistent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconstruction {
    pub cameras: BTreeMap<u32, Camera>,
    pub images: BTreeMap<u32, Image>,
    pub points3d: BTreeMap<u64, Point3D>,
}

impl Reconstruction {
    /// Read a model directory, preferring the binary form when both exist.
    pub fn read_from_dir<P: AsRef<Path>>(dir: P) -> Result<Reconstruction> {
        let dir = dir.as_ref();
        let model = if dir.join("cameras.bin").is_file() {
            read_binary_model(dir)?
        } else if dir.join("cameras.txt").is_file() {
            read_text_model(dir)?
        } else {
            return Err(ModelError::NoModelFiles(dir.display().to_string()));
        };
        model.validate()?;
        Ok(model)
    }

    /// Write the binary form (canonical).
    pub fn write_to_dir<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        std::fs::create_dir_all(dir.as_ref())?;
        write_binary_model(self, dir.as_ref())
    }

    /// Enforce the referential invariants, naming the first violation.
    pub fn validate(&self) -> Result<()> {
        for (&image_id, image) in &self.images {
            if !self.cameras.contains_key(&image.camera_id) {
                return Err(ModelError::UnknownCamera {
                    image_id,
                    camera_id: image.camera_id,
                });
            }
            for (obs_index, obs) in image.observations.iter().enumerate() {
                if let Some(point3d_id) = obs.point3d_id {
                    if !self.points3d.contains_key(&point3d_id) {
                        return Err(ModelError::UnknownPoint {
                            image_id,
                            obs_index,
                            point3d_id,
                        });
                    }
                }
            }
        }
        for (&point3d_id, point) in &self.points3d {
            for el in &point.track {
                let image = self.images.get(&el.image_id).ok_or({
                    ModelError::TrackMismatch {
                        point3d_id,
                        image_id: el.image_id,
                        obs_index: el.point2d_idx as usize,
                    }
                })?;
                let obs = image.observations.get(el.point2d_idx as usize);
                if obs.and_then(|o| o.point3d_id) != Some(point3d_id) {
                    return Err(ModelError::TrackMismatch {
                        point3d_id,
                        image_id: el.image_id,
                        obs_index: el.point2d_idx as usize,
                    });
                }
            }
        }
        for camera in self.cameras.values() {
            camera.check_params()?;
        }
        Ok(())
    }

    /// Delete one 3D point, rewriting every tracking observation to the
    /// unobserved sentinel. No id is renumbered.
    pub fn delete_point3d(&mut self, point3d_id: u64) {
        let Some(point) = self.points3d.remove(&point3d_id) else {
            return;
        };
        for el in point.track {
            if let Some(image) = self.images.get_mut(&el.image_id) {
                if let Some(obs) = image.observations.get_mut(el.point2d_idx as usize) {
                    if obs.point3d_id == Some(point3d_id) {
                        obs.point3d_id = None;
                    }
                }
            }
        }
    }

    /// Keep only the points whose id satisfies the predicate; the rest are
    /// swept with [`Reconstruction::delete_point3d`] semantics.
    pub fn retain_points<F: FnMut(u64) -> bool>(&mut self, mut keep: F) {
        let doomed: Vec<u64> = self
            .points3d
            .keys()
            .copied()
            .filter(|&id| !keep(id))
            .collect();
        for id in doomed {
            self.delete_point3d(id);
        }
    }

    /// Apply a world-frame similarity: points become `s·Q·x + d`, poses are
    /// updated so every projection is preserved.
    pub fn apply_world_similarity(&mut self, scale: f64, q: &Rotation3<f64>, d: &Vector3<f64>) {
        for point in self.points3d.values_mut() {
            let x = Vector3::from(point.xyz);
            let x2 = scale * (q * x) + d;
            point.xyz = [x2.x, x2.y, x2.z];
        }
        for image in self.images.values_mut() {
            let r_old: Rotation3<f64> = image.rotation().to_rotation_matrix();
            let r_new = r_old * q.inverse();
            let t_old = Vector3::from(image.tvec);
            let t_new = scale * t_old - r_new * d;
            image.set_rotation(&UnitQuaternion::from_rotation_matrix(&r_new));
            image.tvec = [t_new.x, t_new.y, t_new.z];
        }
    }

    /// Rotate the world frame by `q` about the origin.
    pub fn rotate(&mut self, q: &Rotation3<f64>) {
        self.apply_world_similarity(1.0, q, &Vector3::zeros());
    }

    /// Pure world translation (used by ground elevation).
    pub fn translate(&mut self, d: &Vector3<f64>) {
        self.apply_world_similarity(1.0, &Rotation3::identity(), d);
    }

    /// Uniform metric scaling: multiplies every tvec and point position.
    pub fn scale(&mut self, s: f64) {
        self.apply_world_similarity(s, &Rotation3::identity(), &Vector3::zeros());
    }

    /// Apply a 4x4 transform, which must be a uniform similarity. The
    /// rotation block may carry a uniform scale; reflections and
    /// anisotropic scales are rejected.
    pub fn apply_transform_matrix(&mut self, m: &nalgebra::Matrix4<f64>) -> Result<()> {
        let a: Matrix3<f64> = m.fixed_view::<3, 3>(0, 0).into_owned();
        let det = a.determinant();
        if det <= 0.0 {
            return Err(ModelError::NotASimilarity { det });
        }
        let s = det.cbrt();
        let q = a / s;
        // Orthonormality check: Q Qᵀ should be the identity.
        let dev = (q * q.transpose() - Matrix3::identity()).norm();
        if dev > 1e-6 {
            return Err(ModelError::NotASimilarity { det });
        }
        let rot = Rotation3::from_matrix_unchecked(q);
        let d = Vector3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)]);
        self.apply_world_similarity(s, &rot, &d);
        Ok(())
    }

    /// Map from image name to image id.
    pub fn name_index(&self) -> BTreeMap<&str, u32> {
        self.images
            .iter()
            .map(|(&id, im)| (im.name.as_str(), id))
            .collect()
    }
}
