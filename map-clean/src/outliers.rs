//! Statistical outlier removal.
//!
//! For every point, the mean distance to its k nearest neighbors is
//! computed; points whose mean distance exceeds the population mean by
//! more than `std_ratio` standard deviations are pruned. Removed point
//! ids propagate to image observations through the model's deletion sweep.

use std::collections::BTreeMap;

use tracing::info;

use colmap_model::Reconstruction;

/// Ids of the points classified as outliers. Deterministic for a given
/// input.
pub fn statistical_outlier_ids(
    points: &BTreeMap<u64, [f64; 3]>,
    k_neighbors: usize,
    std_ratio: f64,
) -> Vec<u64> {
    let n = points.len();
    if n < 2 || k_neighbors == 0 {
        return Vec::new();
    }
    let ids: Vec<u64> = points.keys().copied().collect();
    let xyz: Vec<[f64; 3]> = points.values().copied().collect();
    let k = k_neighbors.min(n - 1);

    let index = GridIndex::build(&xyz, k);
    let mean_dists: Vec<f64> = (0..n).map(|i| index.mean_knn_distance(&xyz, i, k)).collect();

    let mean: f64 = mean_dists.iter().sum::<f64>() / n as f64;
    let var: f64 = mean_dists.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n as f64;
    let threshold = mean + std_ratio * var.sqrt();

    let removed: Vec<u64> = mean_dists
        .iter()
        .enumerate()
        .filter(|(_, &d)| d > threshold)
        .map(|(i, _)| ids[i])
        .collect();
    info!(
        total = n,
        pruned = removed.len(),
        "statistical outlier filter"
    );
    removed
}

/// Prune outliers in place, returning how many points were removed.
pub fn remove_statistical_outliers(
    model: &mut Reconstruction,
    k_neighbors: usize,
    std_ratio: f64,
) -> usize {
    let points: BTreeMap<u64, [f64; 3]> =
        model.points3d.iter().map(|(&id, p)| (id, p.xyz)).collect();
    let removed = statistical_outlier_ids(&points, k_neighbors, std_ratio);
    for &id in &removed {
        model.delete_point3d(id);
    }
    removed.len()
}

/// Uniform-grid spatial index for k-nearest-neighbor queries over a point
/// soup. Cell size is chosen so a cell holds a few points on average;
/// queries expand shells of cells until k neighbors cannot be beaten by
/// anything further out.
struct GridIndex {
    cell_size: f64,
    origin: [f64; 3],
    cells: BTreeMap<(i64, i64, i64), Vec<usize>>,
}

impl GridIndex {
    fn build(points: &[[f64; 3]], k: usize) -> GridIndex {
        let mut min = [f64::INFINITY; 3];
        let mut max = [f64::NEG_INFINITY; 3];
        for p in points {
            for a in 0..3 {
                min[a] = min[a].min(p[a]);
                max[a] = max[a].max(p[a]);
            }
        }
        let extent: f64 = (0..3).map(|a| (max[a] - min[a]).max(1e-9)).product();
        // Aim for roughly k points per cell so one shell usually suffices.
        let target_cells = (points.len() as f64 / (k as f64).max(1.0)).max(1.0);
        let cell_size = (extent / target_cells).cbrt().max(1e-9);

        let mut cells: BTreeMap<(i64, i64, i64), Vec<usize>> = BTreeMap::new();
        for (i, p) in points.iter().enumerate() {
            cells.entry(Self::key(p, &min, cell_size)).or_default().push(i);
        }
        GridIndex {
            cell_size,
            origin: min,
            cells,
        }
    }

    fn key(p: &[f64; 3], origin: &[f64; 3], cell_size: f64) -> (i64, i64, i64) {
        (
            ((p[0] - origin[0]) / cell_size).floor() as i64,
            ((p[1] - origin[1]) / cell_size).floor() as i64,
            ((p[2] - origin[2]) / cell_size).floor() as i64,
        )
    }

    fn mean_knn_distance(&self, points: &[[f64; 3]], query: usize, k: usize) -> f64 {
        let p = points[query];
        let center = Self::key(&p, &self.origin, self.cell_size);
        // Max-heap of the k best squared distances seen so far.
        let mut best: std::collections::BinaryHeap<HeapDist> =
            std::collections::BinaryHeap::new();

        let mut ring = 0i64;
        loop {
            for &(cx, cy, cz) in shell(center, ring).iter() {
                if let Some(indices) = self.cells.get(&(cx, cy, cz)) {
                    for &j in indices {
                        if j == query {
                            continue;
                        }
                        let q = points[j];
                        let d2 = (p[0] - q[0]).powi(2)
                            + (p[1] - q[1]).powi(2)
                            + (p[2] - q[2]).powi(2);
                        if best.len() < k {
                            best.push(HeapDist(d2));
                        } else if let Some(&HeapDist(worst)) = best.peek() {
                            if d2 < worst {
                                best.pop();
                                best.push(HeapDist(d2));
                            }
                        }
                    }
                }
            }
            // Anything beyond `ring` cells is at least this far away.
            let ring_floor_dist = ring as f64 * self.cell_size;
            let have_k = best.len() >= k;
            let worst = best.peek().map(|&HeapDist(d2)| d2.sqrt()).unwrap_or(f64::INFINITY);
            if have_k && worst <= ring_floor_dist {
                break;
            }
            ring += 1;
            // Degenerate safety valve: every point visited.
            if ring as usize > self.cells.len() + 2 {
                break;
            }
        }

        let found = best.len().max(1);
        best.into_iter().map(|HeapDist(d2)| d2.sqrt()).sum::<f64>() / found as f64
    }
}

/// Cells on the surface of the cube shell at Chebyshev radius `r`.
fn shell(center: (i64, i64, i64), r: i64) -> Vec<(i64, i64, i64)> {
    let (cx, cy, cz) = center;
    if r == 0 {
        return vec![center];
    }
    let mut out = Vec::new();
    for dx in -r..=r {
        for dy in -r..=r {
            for dz in -r..=r {
                if dx.abs().max(dy.abs()).max(dz.abs()) == r {
                    out.push((cx + dx, cy + dy, cz + dz));
                }
            }
        }
    }
    out
}

/// f64 wrapper usable in a BinaryHeap; distances are always finite here.
#[derive(PartialEq)]
struct HeapDist(f64);

impl Eq for HeapDist {}

impl PartialOrd for HeapDist {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapDist {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(std::cmp::Ordering::Equal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_with_outliers() -> BTreeMap<u64, [f64; 3]> {
        let mut points = BTreeMap::new();
        let mut id = 1u64;
        // Dense 5x5x5 lattice, 0.1 m pitch.
        for i in 0..5 {
            for j in 0..5 {
                for k in 0..5 {
                    points.insert(
                        id,
                        [i as f64 * 0.1, j as f64 * 0.1, k as f64 * 0.1],
                    );
                    id += 1;
                }
            }
        }
        // Two far-away strays.
        points.insert(1000, [10.0, 10.0, 10.0]);
        points.insert(1001, [-8.0, 4.0, -6.0]);
        points
    }

    #[test]
    fn strays_are_pruned_lattice_kept() {
        let points = cluster_with_outliers();
        let removed = statistical_outlier_ids(&points, 10, 1.5);
        assert!(removed.contains(&1000));
        assert!(removed.contains(&1001));
        assert!(removed.len() <= 4, "over-pruned: {removed:?}");
    }

    #[test]
    fn second_pass_removes_nothing_new() {
        // Genuine outliers sit many deviations out; once they are gone the
        // lattice's own corner-vs-interior spread stays under the
        // threshold and repeated passes are a fixed point.
        let mut points = cluster_with_outliers();
        let first = statistical_outlier_ids(&points, 10, 5.0);
        assert_eq!(first.len(), 2);
        for id in &first {
            points.remove(id);
        }
        let second = statistical_outlier_ids(&points, 10, 5.0);
        assert!(second.is_empty(), "second pass removed {second:?}");
        let third = statistical_outlier_ids(&points, 10, 5.0);
        assert!(third.is_empty());
    }

    #[test]
    fn tiny_inputs_are_left_alone() {
        let mut points = BTreeMap::new();
        points.insert(1, [0.0, 0.0, 0.0]);
        assert!(statistical_outlier_ids(&points, 100, 1.5).is_empty());
        points.insert(2, [1.0, 0.0, 0.0]);
        // Two points are each other's neighborhood; nothing can be an
        // outlier relative to a zero-variance population.
        assert!(statistical_outlier_ids(&points, 100, 1.5).is_empty());
    }

    #[test]
    fn removal_sweeps_observations() {
        use colmap_model::{Camera, Image, Observation, Point3D, Reconstruction, TrackElement};
        let mut model = Reconstruction::default();
        model
            .cameras
            .insert(1, Camera::pinhole(1, 64, 48, 50.0, 50.0, 32.0, 24.0));
        let points = cluster_with_outliers();
        let mut observations = Vec::new();
        for (idx, (&id, &xyz)) in points.iter().enumerate() {
            observations.push(Observation {
                xy: [idx as f64, idx as f64],
                point3d_id: Some(id),
            });
            model.points3d.insert(
                id,
                Point3D {
                    xyz,
                    rgb: [0, 0, 0],
                    error: 0.0,
                    track: vec![TrackElement {
                        image_id: 1,
                        point2d_idx: idx as u32,
                    }],
                },
            );
        }
        model.images.insert(
            1,
            Image {
                id: 1,
                qvec: [1.0, 0.0, 0.0, 0.0],
                tvec: [0.0, 0.0, 0.0],
                camera_id: 1,
                name: "a.jpg".into(),
                observations,
            },
        );
        model.validate().unwrap();
        let removed = remove_statistical_outliers(&mut model, 10, 1.5);
        assert!(removed >= 2);
        model.validate().unwrap();
        let unobserved = model.images[&1]
            .observations
            .iter()
            .filter(|o| o.point3d_id.is_none())
            .count();
        assert_eq!(unobserved, removed);
    }
}
