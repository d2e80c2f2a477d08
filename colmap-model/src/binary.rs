//! Binary COLMAP model files (`cameras.bin`, `images.bin`, `points3D.bin`).
//!
//! Little-endian throughout, matching the reference implementation.

use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{
    Camera, CameraModel, Image, ModelError, Observation, Point3D, Reconstruction, Result,
    TrackElement, UNOBSERVED_SENTINEL,
};

pub fn read_binary_model(dir: &Path) -> Result<Reconstruction> {
    let cameras = read_cameras_bin(&mut open(dir, "cameras.bin")?)?;
    let images = read_images_bin(&mut open(dir, "images.bin")?)?;
    let points3d = read_points3d_bin(&mut open(dir, "points3D.bin")?)?;
    Ok(Reconstruction {
        cameras,
        images,
        points3d,
    })
}

pub fn write_binary_model(model: &Reconstruction, dir: &Path) -> Result<()> {
    write_cameras_bin(model, &mut create(dir, "cameras.bin")?)?;
    write_images_bin(model, &mut create(dir, "images.bin")?)?;
    write_points3d_bin(model, &mut create(dir, "points3D.bin")?)?;
    Ok(())
}

fn open(dir: &Path, name: &str) -> Result<BufReader<std::fs::File>> {
    Ok(BufReader::new(std::fs::File::open(dir.join(name))?))
}

fn create(dir: &Path, name: &str) -> Result<BufWriter<std::fs::File>> {
    Ok(BufWriter::new(std::fs::File::create(dir.join(name))?))
}

fn read_cameras_bin<R: Read>(r: &mut R) -> Result<BTreeMap<u32, Camera>> {
    let num_cameras = r.read_u64::<LittleEndian>()?;
    let mut cameras = BTreeMap::new();
    for _ in 0..num_cameras {
        let id = r.read_i32::<LittleEndian>()? as u32;
        let model = CameraModel::from_model_id(r.read_i32::<LittleEndian>()?)?;
        let width = r.read_u64::<LittleEndian>()?;
        let height = r.read_u64::<LittleEndian>()?;
        let mut params = Vec::with_capacity(model.num_params());
        for _ in 0..model.num_params() {
            params.push(r.read_f64::<LittleEndian>()?);
        }
        cameras.insert(
            id,
            Camera {
                id,
                model,
                width,
                height,
                params,
            },
        );
    }
    Ok(cameras)
}

fn write_cameras_bin<W: Write>(model: &Reconstruction, w: &mut W) -> Result<()> {
    w.write_u64::<LittleEndian>(model.cameras.len() as u64)?;
    for camera in model.cameras.values() {
        w.write_i32::<LittleEndian>(camera.id as i32)?;
        w.write_i32::<LittleEndian>(camera.model.model_id())?;
        w.write_u64::<LittleEndian>(camera.width)?;
        w.write_u64::<LittleEndian>(camera.height)?;
        for &p in &camera.params {
            w.write_f64::<LittleEndian>(p)?;
        }
    }
    Ok(())
}

fn read_images_bin<R: Read>(r: &mut R) -> Result<BTreeMap<u32, Image>> {
    let num_images = r.read_u64::<LittleEndian>()?;
    let mut images = BTreeMap::new();
    for _ in 0..num_images {
        let id = r.read_i32::<LittleEndian>()? as u32;
        let mut qvec = [0.0; 4];
        for q in &mut qvec {
            *q = r.read_f64::<LittleEndian>()?;
        }
        let mut tvec = [0.0; 3];
        for t in &mut tvec {
            *t = r.read_f64::<LittleEndian>()?;
        }
        let camera_id = r.read_i32::<LittleEndian>()? as u32;
        let name = read_nul_terminated(r)?;
        let num_points2d = r.read_u64::<LittleEndian>()?;
        let mut observations = Vec::with_capacity(num_points2d as usize);
        for _ in 0..num_points2d {
            let x = r.read_f64::<LittleEndian>()?;
            let y = r.read_f64::<LittleEndian>()?;
            let raw_id = r.read_i64::<LittleEndian>()?;
            let point3d_id = if raw_id == UNOBSERVED_SENTINEL {
                None
            } else {
                Some(raw_id as u64)
            };
            observations.push(Observation {
                xy: [x, y],
                point3d_id,
            });
        }
        images.insert(
            id,
            Image {
                id,
                qvec,
                tvec,
                camera_id,
                name,
                observations,
            },
        );
    }
    Ok(images)
}

fn write_images_bin<W: Write>(model: &Reconstruction, w: &mut W) -> Result<()> {
    w.write_u64::<LittleEndian>(model.images.len() as u64)?;
    for image in model.images.values() {
        w.write_i32::<LittleEndian>(image.id as i32)?;
        for &q in &image.qvec {
            w.write_f64::<LittleEndian>(q)?;
        }
        for &t in &image.tvec {
            w.write_f64::<LittleEndian>(t)?;
        }
        w.write_i32::<LittleEndian>(image.camera_id as i32)?;
        w.write_all(image.name.as_bytes())?;
        w.write_all(&[0u8])?;
        w.write_u64::<LittleEndian>(image.observations.len() as u64)?;
        for obs in &image.observations {
            w.write_f64::<LittleEndian>(obs.xy[0])?;
            w.write_f64::<LittleEndian>(obs.xy[1])?;
            let raw_id = match obs.point3d_id {
                Some(id) => id as i64,
                None => UNOBSERVED_SENTINEL,
            };
            w.write_i64::<LittleEndian>(raw_id)?;
        }
    }
    Ok(())
}

fn read_points3d_bin<R: Read>(r: &mut R) -> Result<BTreeMap<u64, Point3D>> {
    let num_points = r.read_u64::<LittleEndian>()?;
    let mut points = BTreeMap::new();
    for _ in 0..num_points {
        let id = r.read_u64::<LittleEndian>()?;
        let mut xyz = [0.0; 3];
        for v in &mut xyz {
            *v = r.read_f64::<LittleEndian>()?;
        }
        let mut rgb = [0u8; 3];
        r.read_exact(&mut rgb)?;
        let error = r.read_f64::<LittleEndian>()?;
        let track_len = r.read_u64::<LittleEndian>()?;
        let mut track = Vec::with_capacity(track_len as usize);
        for _ in 0..track_len {
            let image_id = r.read_i32::<LittleEndian>()? as u32;
            let point2d_idx = r.read_i32::<LittleEndian>()? as u32;
            track.push(TrackElement {
                image_id,
                point2d_idx,
            });
        }
        points.insert(
            id,
            Point3D {
                xyz,
                rgb,
                error,
                track,
            },
        );
    }
    Ok(points)
}

fn write_points3d_bin<W: Write>(model: &Reconstruction, w: &mut W) -> Result<()> {
    w.write_u64::<LittleEndian>(model.points3d.len() as u64)?;
    for (&id, point) in &model.points3d {
        w.write_u64::<LittleEndian>(id)?;
        for &v in &point.xyz {
            w.write_f64::<LittleEndian>(v)?;
        }
        w.write_all(&point.rgb)?;
        w.write_f64::<LittleEndian>(point.error)?;
        w.write_u64::<LittleEndian>(point.track.len() as u64)?;
        for el in &point.track {
            w.write_i32::<LittleEndian>(el.image_id as i32)?;
            w.write_i32::<LittleEndian>(el.point2d_idx as i32)?;
        }
    }
    Ok(())
}

fn read_nul_terminated<R: Read>(r: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let mut b = [0u8; 1];
        match r.read_exact(&mut b) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ModelError::PrematureFileEnd("images.bin"));
            }
            Err(e) => return Err(e.into()),
        }
        if b[0] == 0 {
            break;
        }
        bytes.push(b[0]);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::sample_model;

    #[test]
    fn binary_round_trip_is_exact() {
        let tmp = tempfile::tempdir().unwrap();
        let model = sample_model();
        model.write_to_dir(tmp.path()).unwrap();
        let back = Reconstruction::read_from_dir(tmp.path()).unwrap();
        assert_eq!(back, model);
    }

    #[test]
    fn empty_model_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let model = Reconstruction::default();
        model.write_to_dir(tmp.path()).unwrap();
        let back = read_binary_model(tmp.path()).unwrap();
        assert_eq!(back, model);
    }

    #[test]
    fn truncated_images_file_is_a_structured_error() {
        let tmp = tempfile::tempdir().unwrap();
        let model = sample_model();
        model.write_to_dir(tmp.path()).unwrap();
        // Chop the images file mid-record.
        let path = tmp.path().join("images.bin");
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        assert!(read_binary_model(tmp.path()).is_err());
    }
}
