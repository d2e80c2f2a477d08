//! Ground-level estimation and elevation.
//!
//! The floor of an indoor reconstruction is found by bucketing point XY
//! into a coarse grid, taking the minimum Z of each occupied bucket, and
//! taking the mode of those minima: single low outliers pull one bucket
//! down, but the floor dominates the histogram. The model is then shifted
//! so the mode sits at Z = 0 — a pure world translation, so all pairwise
//! point distances are untouched.

use nalgebra::Vector3;
use tracing::info;

use colmap_model::Reconstruction;

use crate::{CleanError, Result};

/// Estimate the Z shift that brings the dominant floor level to zero.
pub fn estimate_floor_shift(points: &[[f64; 3]], bucket_meters: f64) -> Result<f64> {
    if points.is_empty() {
        return Err(CleanError::EmptyPointCloud);
    }
    let min_zs = bucket_min_zs(points, bucket_meters);
    let most_likely_z = histogram_mode(&min_zs);
    Ok(-most_likely_z)
}

/// Shift the whole model (points and camera poses) by the estimated floor
/// offset and return it.
pub fn elevate_reconstruction(model: &mut Reconstruction, bucket_meters: f64) -> Result<f64> {
    let points: Vec<[f64; 3]> = model.points3d.values().map(|p| p.xyz).collect();
    let shift = estimate_floor_shift(&points, bucket_meters)?;
    info!(shift, "elevating reconstruction to ground level");
    model.translate(&Vector3::new(0.0, 0.0, shift));
    Ok(shift)
}

fn bucket_min_zs(points: &[[f64; 3]], bucket_meters: f64) -> Vec<f64> {
    let xmin = points.iter().map(|p| p[0]).fold(f64::INFINITY, f64::min);
    let ymin = points.iter().map(|p| p[1]).fold(f64::INFINITY, f64::min);

    let mut minima = std::collections::BTreeMap::<(i64, i64), f64>::new();
    for p in points {
        let bx = ((p[0] - xmin) / bucket_meters).floor() as i64;
        let by = ((p[1] - ymin) / bucket_meters).floor() as i64;
        minima
            .entry((bx, by))
            .and_modify(|z| *z = z.min(p[2]))
            .or_insert(p[2]);
    }
    minima.into_values().collect()
}

/// Mode of a sample via a histogram with automatic bin width: the larger
/// bin count of the Sturges and Freedman-Diaconis rules, matching the
/// histogram the original floor estimation was tuned against.
fn histogram_mode(samples: &[f64]) -> f64 {
    debug_assert!(!samples.is_empty());
    let mut sorted: Vec<f64> = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = sorted.len();
    let min = sorted[0];
    let max = sorted[n - 1];
    let range = max - min;
    if n == 1 || range <= 0.0 {
        return min;
    }

    let sturges_width = range / ((n as f64).log2() + 1.0).ceil();
    let iqr = percentile(&sorted, 75.0) - percentile(&sorted, 25.0);
    let fd_width = 2.0 * iqr / (n as f64).cbrt();
    let width = if fd_width > 0.0 {
        fd_width.min(sturges_width)
    } else {
        sturges_width
    };

    let num_bins = ((range / width).ceil() as usize).max(1);
    let bin_width = range / num_bins as f64;
    let mut counts = vec![0usize; num_bins];
    for &z in &sorted {
        let mut idx = ((z - min) / bin_width) as usize;
        if idx >= num_bins {
            idx = num_bins - 1;
        }
        counts[idx] += 1;
    }
    let best = counts
        .iter()
        .enumerate()
        .max_by_key(|&(_, c)| *c)
        .map(|(i, _)| i)
        .unwrap_or(0);
    min + (best as f64 + 0.5) * bin_width
}

fn percentile(sorted: &[f64], pct: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let rank = pct / 100.0 * (n - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use colmap_model::{Camera, Image, Point3D, Reconstruction};

    fn model_with_zs(zs: &[f64]) -> Reconstruction {
        let mut model = Reconstruction::default();
        model
            .cameras
            .insert(1, Camera::pinhole(1, 640, 480, 500.0, 500.0, 320.0, 240.0));
        model.images.insert(
            1,
            Image {
                id: 1,
                qvec: [1.0, 0.0, 0.0, 0.0],
                tvec: [0.0, 0.0, 0.0],
                camera_id: 1,
                name: "a.jpg".to_string(),
                observations: vec![],
            },
        );
        for (i, &z) in zs.iter().enumerate() {
            model.points3d.insert(
                i as u64 + 1,
                Point3D {
                    // All XY inside one 0.5 m bucket.
                    xyz: [0.1, 0.1, z],
                    rgb: [0, 0, 0],
                    error: 0.0,
                    track: vec![],
                },
            );
        }
        model
    }

    #[test]
    fn single_bucket_mode_is_its_minimum() {
        let zs = [-0.01, 0.0, 0.01, 1.0, 1.0, 1.0];
        let mut model = model_with_zs(&zs);
        let shift = elevate_reconstruction(&mut model, 0.5).unwrap();
        // One bucket, one minimum: the mode is -0.01 exactly.
        assert_relative_eq!(shift, 0.01, epsilon = 1e-12);
        let z0 = model.points3d[&1].xyz[2];
        assert_relative_eq!(z0, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn floor_mode_wins_over_a_single_pit() {
        // Many buckets bottoming out near 0, one pit at -2.
        let mut points = Vec::new();
        for i in 0..20 {
            for j in 0..20 {
                let x = i as f64 * 0.5 + 0.1;
                let y = j as f64 * 0.5 + 0.1;
                let z = ((i * 20 + j) % 7) as f64 * 0.004;
                points.push([x, y, z]);
            }
        }
        points.push([0.1, 0.1, -2.0]);
        let shift = estimate_floor_shift(&points, 0.5).unwrap();
        // The dominant floor is near zero, so the shift is small.
        assert!(shift.abs() < 0.25, "shift {shift}");
    }

    #[test]
    fn elevation_is_a_pure_z_translation() {
        let zs = [0.2, 0.5, 0.9, 0.2, 0.2];
        let mut model = model_with_zs(&zs);
        let before: Vec<[f64; 3]> = model.points3d.values().map(|p| p.xyz).collect();
        elevate_reconstruction(&mut model, 0.5).unwrap();
        let after: Vec<[f64; 3]> = model.points3d.values().map(|p| p.xyz).collect();
        for (a, b) in before.iter().zip(after.iter()) {
            assert_relative_eq!(a[0], b[0], epsilon = 1e-12);
            assert_relative_eq!(a[1], b[1], epsilon = 1e-12);
        }
        // Pairwise deltas are invariant.
        let dz_before = before[1][2] - before[0][2];
        let dz_after = after[1][2] - after[0][2];
        assert_relative_eq!(dz_before, dz_after, epsilon = 1e-12);
    }

    #[test]
    fn empty_model_is_an_error() {
        let mut model = model_with_zs(&[]);
        assert!(matches!(
            elevate_reconstruction(&mut model, 0.5),
            Err(CleanError::EmptyPointCloud)
        ));
    }
}
