//! Capture-source ingestion.
//!
//! Four kinds of input reach the builder: a walkthrough video, a plain
//! image directory, a Polycam export, or a Kiri Engine export. Each is
//! normalized into a flat `images/` directory plus, when the source
//! carries poses, a prior COLMAP model with known extrinsics and no
//! points.

use std::io::Read;
use std::path::{Path, PathBuf};

use nalgebra::Matrix4;
use serde::Deserialize;
use tracing::info;

use colmap_model::{Camera, CameraModel, Image, Reconstruction};
use maploc_mvg::quat_wxyz_from_rotation;
use maploc_types::MapDirs;

use crate::{BuildError, Result};

/// What a build starts from.
#[derive(Debug, Clone)]
pub enum CaptureSource {
    Video {
        path: PathBuf,
        frame_ratio_percent: f64,
    },
    Images {
        dir: PathBuf,
    },
    Polycam {
        dir: PathBuf,
    },
    Kiri {
        dir: PathBuf,
    },
}

/// Ingestion result handed to the rest of the pipeline.
#[derive(Debug)]
pub struct PreparedInput {
    pub images_dir: PathBuf,
    /// Present for all sources; video/images get it from the bundled
    /// COLMAP run inside `ns-process-data`, scan sources from their pose
    /// files.
    pub prior_model_dir: PathBuf,
    /// Scan sources carry trusted poses: triangulate with fixed cameras
    /// and skip covisibility ranking in favor of exhaustive pairs.
    pub known_poses: bool,
}

/// `ns-process-data`-style `transforms.json`.
#[derive(Debug, Deserialize)]
struct TransformsJson {
    #[serde(default)]
    camera_model: Option<String>,
    #[serde(default)]
    w: Option<u64>,
    #[serde(default)]
    h: Option<u64>,
    #[serde(default)]
    fl_x: Option<f64>,
    #[serde(default)]
    fl_y: Option<f64>,
    #[serde(default)]
    cx: Option<f64>,
    #[serde(default)]
    cy: Option<f64>,
    #[serde(default)]
    k1: Option<f64>,
    #[serde(default)]
    k2: Option<f64>,
    #[serde(default)]
    p1: Option<f64>,
    #[serde(default)]
    p2: Option<f64>,
    frames: Vec<TransformsFrame>,
}

#[derive(Debug, Deserialize)]
struct TransformsFrame {
    file_path: String,
    transform_matrix: Vec<Vec<f64>>,
    #[serde(default)]
    w: Option<u64>,
    #[serde(default)]
    h: Option<u64>,
    #[serde(default)]
    fl_x: Option<f64>,
    #[serde(default)]
    fl_y: Option<f64>,
    #[serde(default)]
    cx: Option<f64>,
    #[serde(default)]
    cy: Option<f64>,
}

/// Probe a video with ffprobe and estimate how many frames to extract at
/// the requested ratio of the stream's total.
pub fn estimate_frame_target(
    ffprobe: &[String],
    video_path: &Path,
    ratio_percent: f64,
    log_path: &Path,
) -> Result<u64> {
    let mut argv = ffprobe.to_vec();
    argv.extend(
        [
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=avg_frame_rate,duration",
            "-of",
            "json",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    argv.push(video_path.display().to_string());
    let out = proc_runner::run_logged(&argv, Some(log_path))?;

    #[derive(Deserialize)]
    struct Probe {
        streams: Vec<ProbeStream>,
    }
    #[derive(Deserialize)]
    struct ProbeStream {
        avg_frame_rate: Option<String>,
        duration: Option<String>,
    }
    let probe: Probe = serde_json::from_str(&out.stdout)?;
    let stream = probe.streams.first().ok_or(BuildError::NoVideoStream)?;
    let rate = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rational)
        .ok_or(BuildError::NoVideoStream)?;
    let duration: f64 = stream
        .duration
        .as_deref()
        .and_then(|d| d.parse().ok())
        .ok_or(BuildError::NoVideoStream)?;

    let estimate = duration * rate;
    let target = (estimate * ratio_percent / 100.0).min(estimate).max(1.0) as u64;
    info!(target, estimate, "estimated frame extraction target");
    Ok(target)
}

fn parse_rational(s: &str) -> Option<f64> {
    let (num, den) = s.split_once('/')?;
    let num: f64 = num.parse().ok()?;
    let den: f64 = den.parse().ok()?;
    if den == 0.0 {
        return None;
    }
    Some(num / den)
}

/// Run `ns-process-data` for video/images sources: extracts frames and
/// produces the RootSIFT prior model under `colmap/sparse/0`.
pub fn prepare_with_ns_process(
    tools: &maploc_types::ToolConfig,
    source: &CaptureSource,
    dirs: &MapDirs,
    log_path: &Path,
) -> Result<PreparedInput> {
    // ns-process-data writes `images/` and `colmap/` under the map root,
    // satisfying the per-map directory contract directly.
    let ns_dir = dirs.root().to_path_buf();
    let mut argv = tools.ns_process_data.clone();
    match source {
        CaptureSource::Video {
            path,
            frame_ratio_percent,
        } => {
            let target =
                estimate_frame_target(&tools.ffprobe, path, *frame_ratio_percent, log_path)?;
            argv.extend([
                "video".to_string(),
                "--data".to_string(),
                path.display().to_string(),
                "--output-dir".to_string(),
                ns_dir.display().to_string(),
                "--num-frames-target".to_string(),
                target.to_string(),
            ]);
        }
        CaptureSource::Images { dir } => {
            argv.extend([
                "images".to_string(),
                "--data".to_string(),
                dir.display().to_string(),
                "--output-dir".to_string(),
                ns_dir.display().to_string(),
            ]);
        }
        other => {
            return Err(BuildError::MissingInput(format!(
                "ns-process-data cannot ingest {other:?}"
            )));
        }
    }
    proc_runner::run_logged(&argv, Some(log_path))?;

    let images_dir = ns_dir.join("images");
    if !images_dir.is_dir() {
        return Err(BuildError::MissingInput(format!(
            "{} was not produced",
            images_dir.display()
        )));
    }
    Ok(PreparedInput {
        images_dir,
        prior_model_dir: ns_dir.join("colmap").join("sparse").join("0"),
        known_poses: false,
    })
}

/// Build the known-pose prior model for a scan export carrying a
/// `transforms.json`. `per_frame_cameras` distinguishes Polycam (each
/// frame has its own pinhole intrinsics) from Kiri (one shared OPENCV
/// camera).
pub fn prepare_from_transforms(
    scan_dir: &Path,
    images_dir: &Path,
    prior_model_dir: &Path,
    per_frame_cameras: bool,
) -> Result<PreparedInput> {
    let transforms_path = scan_dir.join("transforms.json");
    if !transforms_path.is_file() {
        return Err(BuildError::MissingInput(
            transforms_path.display().to_string(),
        ));
    }
    let transforms: TransformsJson =
        serde_json::from_str(&std::fs::read_to_string(&transforms_path)?)?;

    let mut model = Reconstruction::default();

    // Deterministic image ids: frames sorted by file name.
    let mut frames: Vec<&TransformsFrame> = transforms.frames.iter().collect();
    frames.sort_by_key(|f| frame_name(f));

    if !per_frame_cameras {
        let camera_model = transforms.camera_model.as_deref().unwrap_or("OPENCV");
        if camera_model != "OPENCV" {
            return Err(BuildError::UnsupportedTransformsCamera(
                camera_model.to_string(),
            ));
        }
        let missing =
            || BuildError::MissingInput("transforms.json camera intrinsics".to_string());
        model.cameras.insert(
            1,
            Camera {
                id: 1,
                model: CameraModel::OpenCv,
                width: transforms.w.ok_or_else(missing)?,
                height: transforms.h.ok_or_else(missing)?,
                params: vec![
                    transforms.fl_x.ok_or_else(missing)?,
                    transforms.fl_y.ok_or_else(missing)?,
                    transforms.cx.ok_or_else(missing)?,
                    transforms.cy.ok_or_else(missing)?,
                    transforms.k1.unwrap_or(0.0),
                    transforms.k2.unwrap_or(0.0),
                    transforms.p1.unwrap_or(0.0),
                    transforms.p2.unwrap_or(0.0),
                ],
            },
        );
    }

    for (idx, frame) in frames.iter().enumerate() {
        let image_id = idx as u32 + 1;
        let camera_id = if per_frame_cameras {
            let missing = || {
                BuildError::MissingInput(format!(
                    "per-frame intrinsics for {}",
                    frame.file_path
                ))
            };
            model.cameras.insert(
                image_id,
                Camera::pinhole(
                    image_id,
                    frame.w.ok_or_else(missing)?,
                    frame.h.ok_or_else(missing)?,
                    frame.fl_x.ok_or_else(missing)?,
                    frame.fl_y.ok_or_else(missing)?,
                    frame.cx.ok_or_else(missing)?,
                    frame.cy.ok_or_else(missing)?,
                ),
            );
            image_id
        } else {
            1
        };

        let (qvec, tvec) = world_from_camera(&frame.transform_matrix)?;
        model.images.insert(
            image_id,
            Image {
                id: image_id,
                qvec,
                tvec,
                camera_id,
                name: frame_name(frame),
                observations: vec![],
            },
        );
    }

    std::fs::create_dir_all(prior_model_dir)?;
    colmap_model::write_text_model(&model, prior_model_dir)?;
    info!(
        frames = model.images.len(),
        "wrote known-pose prior model"
    );

    Ok(PreparedInput {
        images_dir: images_dir.to_path_buf(),
        prior_model_dir: prior_model_dir.to_path_buf(),
        known_poses: true,
    })
}

fn frame_name(frame: &TransformsFrame) -> String {
    frame
        .file_path
        .rsplit('/')
        .next()
        .unwrap_or(&frame.file_path)
        .to_string()
}

/// Convert a `transform_matrix` (camera-to-world, OpenGL-style axes) into
/// the stored world-from-camera `(qvec, tvec)`: negate the Y/Z basis
/// columns, then invert.
fn world_from_camera(rows: &[Vec<f64>]) -> Result<([f64; 4], [f64; 3])> {
    if rows.len() != 4 || rows.iter().any(|r| r.len() != 4) {
        return Err(BuildError::MissingInput(
            "transform_matrix is not 4x4".to_string(),
        ));
    }
    let mut c2w = Matrix4::zeros();
    for (i, row) in rows.iter().enumerate() {
        for (j, &v) in row.iter().enumerate() {
            c2w[(i, j)] = v;
        }
    }
    for i in 0..3 {
        c2w[(i, 1)] = -c2w[(i, 1)];
        c2w[(i, 2)] = -c2w[(i, 2)];
    }
    let w2c = c2w
        .try_inverse()
        .ok_or_else(|| BuildError::MissingInput("singular transform_matrix".to_string()))?;
    let r = w2c.fixed_view::<3, 3>(0, 0).into_owned();
    let qvec = quat_wxyz_from_rotation(&r);
    let tvec = [w2c[(0, 3)], w2c[(1, 3)], w2c[(2, 3)]];
    Ok((qvec, tvec))
}

/// Unpack an uploaded scan archive into the map's scan directory. Entries
/// escaping the target directory are rejected.
pub fn unpack_archive(archive_path: &Path, target_dir: &Path) -> Result<usize> {
    let file = std::fs::File::open(archive_path)?;
    let mut zip = zip::ZipArchive::new(file)?;
    std::fs::create_dir_all(target_dir)?;
    let mut count = 0usize;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(rel) = entry.enclosed_name() else {
            continue;
        };
        let out_path = target_dir.join(rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        std::fs::write(&out_path, bytes)?;
        count += 1;
    }
    Ok(count)
}

/// The image files of a directory in sorted order.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        if matches!(ext.as_deref(), Some("jpg" | "jpeg" | "png")) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}
