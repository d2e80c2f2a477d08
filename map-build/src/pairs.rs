//! Match-pair proposal.
//!
//! Unknown-pose inputs rank candidate pairs by covisibility in the prior
//! model: for every image, the N neighbors sharing the most 3D points.
//! Known-pose inputs match exhaustively — the pose prior makes
//! triangulation cheap enough that recall wins.

use std::collections::BTreeMap;

use itertools::Itertools;

use colmap_model::Reconstruction;

/// Directed covisibility ranking, deduplicated to unordered pairs. Ties
/// break toward the larger shared-point count, then the smaller neighbor
/// image id.
pub fn covisibility_pairs(model: &Reconstruction, num_matched: usize) -> Vec<(String, String)> {
    // Shared-point counts per unordered id pair.
    let mut shared: BTreeMap<(u32, u32), usize> = BTreeMap::new();
    for point in model.points3d.values() {
        let mut ids: Vec<u32> = point.track.iter().map(|el| el.image_id).collect();
        ids.sort_unstable();
        ids.dedup();
        for (&a, &b) in ids.iter().tuple_combinations() {
            *shared.entry((a, b)).or_insert(0) += 1;
        }
    }

    let mut neighbors: BTreeMap<u32, Vec<(usize, u32)>> = BTreeMap::new();
    for (&(a, b), &count) in &shared {
        neighbors.entry(a).or_default().push((count, b));
        neighbors.entry(b).or_default().push((count, a));
    }

    let mut out = Vec::new();
    let mut emitted: std::collections::BTreeSet<(u32, u32)> = std::collections::BTreeSet::new();
    for (&image_id, list) in neighbors.iter_mut() {
        list.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        for &(_, neighbor_id) in list.iter().take(num_matched) {
            let key = (
                image_id.min(neighbor_id),
                image_id.max(neighbor_id),
            );
            if emitted.insert(key) {
                let a = &model.images[&key.0].name;
                let b = &model.images[&key.1].name;
                out.push((a.clone(), b.clone()));
            }
        }
    }
    out
}

/// All unordered pairs of the given image names, in sorted order.
pub fn exhaustive_pairs(names: &[String]) -> Vec<(String, String)> {
    let mut sorted: Vec<&String> = names.iter().collect();
    sorted.sort();
    sorted
        .iter()
        .tuple_combinations()
        .map(|(a, b)| ((*a).clone(), (*b).clone()))
        .collect()
}

/// Write the proposed pairs in the conventional one-pair-per-line text
/// form for external tools and debugging.
pub fn write_pairs_file(
    pairs: &[(String, String)],
    path: &std::path::Path,
) -> std::io::Result<()> {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::io::BufWriter::new(std::fs::File::create(path)?);
    for (a, b) in pairs {
        writeln!(f, "{a} {b}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use colmap_model::{Camera, Image, Observation, Point3D, TrackElement};

    /// Three images: 1 and 2 share two points, 2 and 3 share one.
    fn covis_model() -> Reconstruction {
        let mut model = Reconstruction::default();
        model
            .cameras
            .insert(1, Camera::pinhole(1, 64, 48, 50.0, 50.0, 32.0, 24.0));
        for (id, name) in [(1u32, "a.jpg"), (2, "b.jpg"), (3, "c.jpg")] {
            model.images.insert(
                id,
                Image {
                    id,
                    qvec: [1.0, 0.0, 0.0, 0.0],
                    tvec: [0.0, 0.0, 0.0],
                    camera_id: 1,
                    name: name.to_string(),
                    observations: vec![
                        Observation {
                            xy: [0.0, 0.0],
                            point3d_id: None,
                        };
                        3
                    ],
                },
            );
        }
        let mut add_point = |pid: u64, tracks: &[(u32, u32)]| {
            for &(image_id, idx) in tracks {
                model
                    .images
                    .get_mut(&image_id)
                    .unwrap()
                    .observations[idx as usize]
                    .point3d_id = Some(pid);
            }
            model.points3d.insert(
                pid,
                Point3D {
                    xyz: [0.0, 0.0, 0.0],
                    rgb: [0, 0, 0],
                    error: 0.0,
                    track: tracks
                        .iter()
                        .map(|&(image_id, point2d_idx)| TrackElement {
                            image_id,
                            point2d_idx,
                        })
                        .collect(),
                },
            );
        };
        add_point(10, &[(1, 0), (2, 0)]);
        add_point(11, &[(1, 1), (2, 1)]);
        add_point(12, &[(2, 2), (3, 0)]);
        model.validate().unwrap();
        model
    }

    #[test]
    fn covisibility_ranks_by_shared_points() {
        let model = covis_model();
        let pairs = covisibility_pairs(&model, 1);
        // Image 1's best neighbor is 2 (2 shared), image 2's best is 1
        // (tie-break toward smaller id over image 3), image 3's best is 2.
        assert_eq!(
            pairs,
            vec![
                ("a.jpg".to_string(), "b.jpg".to_string()),
                ("b.jpg".to_string(), "c.jpg".to_string()),
            ]
        );
    }

    #[test]
    fn covisibility_with_large_n_emits_all_covisible_pairs() {
        let model = covis_model();
        let pairs = covisibility_pairs(&model, 20);
        assert_eq!(pairs.len(), 2); // (1,2) and (2,3); 1 and 3 never covisible
    }

    #[test]
    fn exhaustive_covers_all_unordered_pairs() {
        let names: Vec<String> = ["c.jpg", "a.jpg", "b.jpg"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let pairs = exhaustive_pairs(&names);
        assert_eq!(
            pairs,
            vec![
                ("a.jpg".to_string(), "b.jpg".to_string()),
                ("a.jpg".to_string(), "c.jpg".to_string()),
                ("b.jpg".to_string(), "c.jpg".to_string()),
            ]
        );
    }
}
