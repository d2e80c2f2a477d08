//! Point-cloud export: axis swap, voxel downsample, ceiling crop, and the
//! PCD v0.7 writer.

use std::io::{BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use tracing::info;

use colmap_model::Reconstruction;

use crate::{CleanError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorPoint {
    pub xyz: [f64; 3],
    pub rgb: [u8; 3],
}

#[derive(Debug, Clone)]
pub struct PcdExportOptions {
    /// Voxel edge length for downsampling; `None` disables it.
    pub voxel_size: Option<f64>,
    /// Meters cropped off the top of the Y axis-aligned bounding box; zero
    /// or negative disables the crop.
    pub crop_y_meters: f64,
}

impl Default for PcdExportOptions {
    fn default() -> Self {
        PcdExportOptions {
            voxel_size: Some(0.08),
            crop_y_meters: 0.33,
        }
    }
}

/// Export the reconstruction's points as a PCD file. The reconstruction
/// frame keeps Z vertical; the export swaps Y and Z so Y is up for the
/// renderers consuming it.
pub fn export_pcd(model: &Reconstruction, path: &Path, options: &PcdExportOptions) -> Result<usize> {
    let mut points: Vec<ColorPoint> = model
        .points3d
        .values()
        .map(|p| ColorPoint {
            xyz: [p.xyz[0], p.xyz[2], p.xyz[1]],
            rgb: p.rgb,
        })
        .collect();
    if points.is_empty() {
        return Err(CleanError::EmptyPointCloud);
    }

    if let Some(voxel) = options.voxel_size {
        if voxel > 0.0 {
            points = voxel_downsample(&points, voxel);
        }
    }
    if options.crop_y_meters > 0.0 {
        points = crop_ceiling(&points, options.crop_y_meters);
    }

    write_pcd(&points, path)?;
    info!(count = points.len(), path = %path.display(), "wrote point cloud");
    Ok(points.len())
}

/// Average position and color per occupied voxel, in voxel-key order so
/// the output is deterministic.
pub fn voxel_downsample(points: &[ColorPoint], voxel_size: f64) -> Vec<ColorPoint> {
    use std::collections::BTreeMap;
    #[derive(Default)]
    struct Acc {
        pos: [f64; 3],
        rgb: [f64; 3],
        count: usize,
    }
    let mut voxels: BTreeMap<(i64, i64, i64), Acc> = BTreeMap::new();
    for p in points {
        let key = (
            (p.xyz[0] / voxel_size).floor() as i64,
            (p.xyz[1] / voxel_size).floor() as i64,
            (p.xyz[2] / voxel_size).floor() as i64,
        );
        let acc = voxels.entry(key).or_default();
        for a in 0..3 {
            acc.pos[a] += p.xyz[a];
            acc.rgb[a] += f64::from(p.rgb[a]);
        }
        acc.count += 1;
    }
    voxels
        .into_values()
        .map(|acc| {
            let n = acc.count as f64;
            ColorPoint {
                xyz: [acc.pos[0] / n, acc.pos[1] / n, acc.pos[2] / n],
                rgb: [
                    (acc.rgb[0] / n).round() as u8,
                    (acc.rgb[1] / n).round() as u8,
                    (acc.rgb[2] / n).round() as u8,
                ],
            }
        })
        .collect()
}

/// Drop everything in the top `crop_y` meters of the bounding box (the
/// ceiling, in the Y-up export frame).
pub fn crop_ceiling(points: &[ColorPoint], crop_y: f64) -> Vec<ColorPoint> {
    let max_y = points
        .iter()
        .map(|p| p.xyz[1])
        .fold(f64::NEG_INFINITY, f64::max);
    let cutoff = max_y - crop_y;
    points
        .iter()
        .filter(|p| p.xyz[1] <= cutoff)
        .copied()
        .collect()
}

/// Binary little-endian PCD v0.7, fields `x y z rgb` with the color packed
/// into the float's bit pattern as renderers expect.
fn write_pcd(points: &[ColorPoint], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut w = BufWriter::new(std::fs::File::create(path)?);
    write!(
        w,
        "# .PCD v0.7 - Point Cloud Data file format\n\
         VERSION 0.7\n\
         FIELDS x y z rgb\n\
         SIZE 4 4 4 4\n\
         TYPE F F F F\n\
         COUNT 1 1 1 1\n\
         WIDTH {n}\n\
         HEIGHT 1\n\
         VIEWPOINT 0 0 0 1 0 0 0\n\
         POINTS {n}\n\
         DATA binary\n",
        n = points.len()
    )?;
    for p in points {
        w.write_f32::<LittleEndian>(p.xyz[0] as f32)?;
        w.write_f32::<LittleEndian>(p.xyz[1] as f32)?;
        w.write_f32::<LittleEndian>(p.xyz[2] as f32)?;
        let packed: u32 = (u32::from(p.rgb[0]) << 16)
            | (u32::from(p.rgb[1]) << 8)
            | u32::from(p.rgb[2]);
        w.write_u32::<LittleEndian>(packed)?;
    }
    Ok(())
}
