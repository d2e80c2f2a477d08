//! Text COLMAP model files, for inspection and for capture sources that
//! hand-author a prior model (`cameras.txt` / `images.txt` / `points3D.txt`).

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::{
    Camera, CameraModel, Image, ModelError, Observation, Point3D, Reconstruction, Result,
    TrackElement,
};

pub fn read_text_model(dir: &Path) -> Result<Reconstruction> {
    Ok(Reconstruction {
        cameras: read_cameras_txt(dir)?,
        images: read_images_txt(dir)?,
        points3d: read_points3d_txt(dir)?,
    })
}

pub fn write_text_model(model: &Reconstruction, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    write_cameras_txt(model, dir)?;
    write_images_txt(model, dir)?;
    write_points3d_txt(model, dir)?;
    Ok(())
}

fn content_lines(dir: &Path, name: &'static str) -> Result<Vec<(usize, String)>> {
    let f = std::fs::File::open(dir.join(name))?;
    let mut out = Vec::new();
    for (idx, line) in BufReader::new(f).lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        out.push((idx + 1, trimmed.to_string()));
    }
    Ok(out)
}

fn parse<T: std::str::FromStr>(
    tok: Option<&str>,
    file: &'static str,
    line: usize,
    what: &str,
) -> Result<T> {
    tok.and_then(|t| t.parse().ok()).ok_or_else(|| ModelError::Parse {
        file,
        line,
        reason: format!("missing or invalid {what}"),
    })
}

fn read_cameras_txt(dir: &Path) -> Result<BTreeMap<u32, Camera>> {
    const FILE: &str = "cameras.txt";
    let mut cameras = BTreeMap::new();
    for (line_no, line) in content_lines(dir, FILE)? {
        let mut toks = line.split_whitespace();
        let id: u32 = parse(toks.next(), FILE, line_no, "camera id")?;
        let model_name: String = parse(toks.next(), FILE, line_no, "model name")?;
        let model = CameraModel::from_name(&model_name)?;
        let width: u64 = parse(toks.next(), FILE, line_no, "width")?;
        let height: u64 = parse(toks.next(), FILE, line_no, "height")?;
        let params: Vec<f64> = toks
            .map(|t| {
                t.parse().map_err(|_| ModelError::Parse {
                    file: FILE,
                    line: line_no,
                    reason: format!("bad param {t:?}"),
                })
            })
            .collect::<Result<_>>()?;
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

fn write_cameras_txt(model: &Reconstruction, dir: &Path) -> Result<()> {
    let mut w = BufWriter::new(std::fs::File::create(dir.join("cameras.txt"))?);
    writeln!(w, "# Camera list with one line of data per camera:")?;
    writeln!(w, "#   CAMERA_ID, MODEL, WIDTH, HEIGHT, PARAMS[]")?;
    writeln!(w, "# Number of cameras: {}", model.cameras.len())?;
    for camera in model.cameras.values() {
        write!(
            w,
            "{} {} {} {}",
            camera.id,
            camera.model.name(),
            camera.width,
            camera.height
        )?;
        for p in &camera.params {
            write!(w, " {p}")?;
        }
        writeln!(w)?;
    }
    Ok(())
}

fn read_images_txt(dir: &Path) -> Result<BTreeMap<u32, Image>> {
    const FILE: &str = "images.txt";
    // images.txt uses two content lines per image; the observation line may
    // legitimately be empty, so blank-line skipping has to be pose-aware.
    let f = std::fs::File::open(dir.join(FILE))?;
    let mut images = BTreeMap::new();
    let mut pending: Option<(usize, String)> = None;
    for (idx, line) in BufReader::new(f).lines().enumerate() {
        let line = line?;
        let trimmed = line.trim().to_string();
        if trimmed.starts_with('#') {
            continue;
        }
        match pending.take() {
            None => {
                if trimmed.is_empty() {
                    continue;
                }
                pending = Some((idx + 1, trimmed));
            }
            Some((pose_line_no, pose_line)) => {
                let image = parse_image_pair(&pose_line, pose_line_no, &trimmed)?;
                images.insert(image.id, image);
            }
        }
    }
    if let Some((pose_line_no, pose_line)) = pending {
        // Final image with a missing (EOF) observation line.
        let image = parse_image_pair(&pose_line, pose_line_no, "")?;
        images.insert(image.id, image);
    }
    Ok(images)
}

fn parse_image_pair(pose_line: &str, line_no: usize, obs_line: &str) -> Result<Image> {
    const FILE: &str = "images.txt";
    let mut toks = pose_line.split_whitespace();
    let id: u32 = parse(toks.next(), FILE, line_no, "image id")?;
    let mut qvec = [0.0; 4];
    for (i, q) in qvec.iter_mut().enumerate() {
        *q = parse(toks.next(), FILE, line_no, &format!("qvec[{i}]"))?;
    }
    let mut tvec = [0.0; 3];
    for (i, t) in tvec.iter_mut().enumerate() {
        *t = parse(toks.next(), FILE, line_no, &format!("tvec[{i}]"))?;
    }
    let camera_id: u32 = parse(toks.next(), FILE, line_no, "camera id")?;
    let name: String = parse(toks.next(), FILE, line_no, "image name")?;

    let obs_toks: Vec<&str> = obs_line.split_whitespace().collect();
    if obs_toks.len() % 3 != 0 {
        return Err(ModelError::Parse {
            file: FILE,
            line: line_no + 1,
            reason: "observations are not (x, y, point3d_id) triples".to_string(),
        });
    }
    let mut observations = Vec::with_capacity(obs_toks.len() / 3);
    for chunk in obs_toks.chunks_exact(3) {
        let x: f64 = parse(Some(chunk[0]), FILE, line_no + 1, "obs x")?;
        let y: f64 = parse(Some(chunk[1]), FILE, line_no + 1, "obs y")?;
        let raw: i64 = parse(Some(chunk[2]), FILE, line_no + 1, "obs point3d id")?;
        observations.push(Observation {
            xy: [x, y],
            point3d_id: if raw < 0 { None } else { Some(raw as u64) },
        });
    }
    Ok(Image {
        id,
        qvec,
        tvec,
        camera_id,
        name,
        observations,
    })
}

fn write_images_txt(model: &Reconstruction, dir: &Path) -> Result<()> {
    let mut w = BufWriter::new(std::fs::File::create(dir.join("images.txt"))?);
    writeln!(w, "# Image list with two lines of data per image:")?;
    writeln!(
        w,
        "#   IMAGE_ID, QW, QX, QY, QZ, TX, TY, TZ, CAMERA_ID, NAME"
    )?;
    writeln!(w, "#   POINTS2D[] as (X, Y, POINT3D_ID)")?;
    writeln!(w, "# Number of images: {}", model.images.len())?;
    for image in model.images.values() {
        write!(w, "{}", image.id)?;
        for q in &image.qvec {
            write!(w, " {q}")?;
        }
        for t in &image.tvec {
            write!(w, " {t}")?;
        }
        writeln!(w, " {} {}", image.camera_id, image.name)?;
        let mut first = true;
        for obs in &image.observations {
            if !first {
                write!(w, " ")?;
            }
            first = false;
            let raw = obs.point3d_id.map(|v| v as i64).unwrap_or(-1);
            write!(w, "{} {} {}", obs.xy[0], obs.xy[1], raw)?;
        }
        writeln!(w)?;
    }
    Ok(())
}

fn read_points3d_txt(dir: &Path) -> Result<BTreeMap<u64, Point3D>> {
    const FILE: &str = "points3D.txt";
    let mut points = BTreeMap::new();
    for (line_no, line) in content_lines(dir, FILE)? {
        let mut toks = line.split_whitespace();
        let id: u64 = parse(toks.next(), FILE, line_no, "point id")?;
        let mut xyz = [0.0; 3];
        for (i, v) in xyz.iter_mut().enumerate() {
            *v = parse(toks.next(), FILE, line_no, &format!("xyz[{i}]"))?;
        }
        let mut rgb = [0u8; 3];
        for (i, v) in rgb.iter_mut().enumerate() {
            *v = parse(toks.next(), FILE, line_no, &format!("rgb[{i}]"))?;
        }
        let error: f64 = parse(toks.next(), FILE, line_no, "error")?;
        let rest: Vec<&str> = toks.collect();
        if rest.len() % 2 != 0 {
            return Err(ModelError::Parse {
                file: FILE,
                line: line_no,
                reason: "track is not (image_id, point2d_idx) pairs".to_string(),
            });
        }
        let mut track = Vec::with_capacity(rest.len() / 2);
        for chunk in rest.chunks_exact(2) {
            track.push(TrackElement {
                image_id: parse(Some(chunk[0]), FILE, line_no, "track image id")?,
                point2d_idx: parse(Some(chunk[1]), FILE, line_no, "track obs index")?,
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

fn write_points3d_txt(model: &Reconstruction, dir: &Path) -> Result<()> {
    let mut w = BufWriter::new(std::fs::File::create(dir.join("points3D.txt"))?);
    writeln!(
        w,
        "# 3D point list with one line of data per point:"
    )?;
    writeln!(
        w,
        "#   POINT3D_ID, X, Y, Z, R, G, B, ERROR, TRACK[] as (IMAGE_ID, POINT2D_IDX)"
    )?;
    writeln!(w, "# Number of points: {}", model.points3d.len())?;
    for (&id, point) in &model.points3d {
        write!(
            w,
            "{} {} {} {} {} {} {} {}",
            id,
            point.xyz[0],
            point.xyz[1],
            point.xyz[2],
            point.rgb[0],
            point.rgb[1],
            point.rgb[2],
            point.error
        )?;
        for el in &point.track {
            write!(w, " {} {}", el.image_id, el.point2d_idx)?;
        }
        writeln!(w)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::sample_model;

    #[test]
    fn text_round_trip_is_exact() {
        let tmp = tempfile::tempdir().unwrap();
        let model = sample_model();
        write_text_model(&model, tmp.path()).unwrap();
        let back = read_text_model(tmp.path()).unwrap();
        assert_eq!(back, model);
    }

    #[test]
    fn image_without_observations_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let mut model = sample_model();
        model.points3d.clear();
        for image in model.images.values_mut() {
            image.observations.clear();
        }
        write_text_model(&model, tmp.path()).unwrap();
        let back = read_text_model(tmp.path()).unwrap();
        assert_eq!(back, model);
    }

    #[test]
    fn reader_prefers_binary_when_both_exist() {
        let tmp = tempfile::tempdir().unwrap();
        let model = sample_model();
        model.write_to_dir(tmp.path()).unwrap();
        let mut tampered = model.clone();
        tampered.points3d.get_mut(&5).unwrap().xyz = [9.0, 9.0, 9.0];
        write_text_model(&tampered, tmp.path()).unwrap();
        let back = Reconstruction::read_from_dir(tmp.path()).unwrap();
        assert_eq!(back, model);
    }
}
