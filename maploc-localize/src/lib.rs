//! Hierarchical localization against a cached map.
//!
//! A query runs extract → retrieve → match → PnP against an immutable
//! cache snapshot taken at entry. Every failure inside the query is mapped
//! to the `{success: false, kind}` response shape — nothing from the
//! pipeline is thrown across the query boundary except a cache miss for
//! the map itself, which the caller turns into its own not-found answer.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use nalgebra::Matrix4;
use tracing::{debug, info, warn};

use colmap_model::Reconstruction;
use feature_store::{BlobStore, LocalFeatures, MatchStore, PairMatches, LOCAL_FEATURES_STORE};
use map_cache::{CacheSnapshot, MapEntry};
use maploc_models::{PnpCamera, PnpRequest};
use maploc_mvg::{camera_pose_from_model, fuse_with_client, hloc_to_gravity, ClientPose};
use maploc_types::{
    LocalizeConfig, LocalizeFailureKind, LocalizeResponse, MapName, ScaleRecord,
};

mod retrieval;

pub use retrieval::retrieve_top_k;

#[derive(thiserror::Error, Debug)]
pub enum LocalizeError {
    #[error("{source}")]
    Cache {
        #[from]
        source: map_cache::CacheError,
    },
}

pub type Result<T> = std::result::Result<T, LocalizeError>;

/// A successful pose estimate in the reconstruction frame, before any
/// client-frame conversion.
#[derive(Debug, Clone)]
pub struct LocalizedPose {
    /// Camera-in-world pose (the inverse of the stored world-from-camera).
    pub camera_pose: Matrix4<f64>,
    pub num_inliers: u32,
    /// Inliers over matched query keypoints, clamped to [0, 1].
    pub confidence: f64,
    /// Whether the metric-scaled reconstruction answered the query.
    pub used_scaled_reconstruction: bool,
}

/// Localize a query image against a map, producing the wire response.
/// A missing map is the only hard error; everything else becomes a
/// `{success: false, kind}` payload.
pub fn localize(
    snapshot: &CacheSnapshot,
    map: &MapName,
    image_path: &Path,
    client_pose_col_major: Option<&[f64]>,
    config: &LocalizeConfig,
) -> Result<LocalizeResponse> {
    let entry = snapshot.map(map)?;
    let pose = match localize_pose(snapshot, &entry, image_path, config) {
        Ok(pose) => pose,
        Err(kind) => return Ok(LocalizeResponse::failure(kind)),
    };

    let mut response = LocalizeResponse {
        success: true,
        kind: None,
        pose: Some(matrix_rows(&pose.camera_pose)),
        arscene_pose: None,
        num_inliers: Some(pose.num_inliers),
        confidence: Some(pose.confidence),
    };

    if let Some(raw) = client_pose_col_major {
        match ClientPose::from_column_major(raw) {
            Ok(client) => {
                let pose_g = hloc_to_gravity(&pose.camera_pose, config.gravity_y_rotation);
                // A map that already answered from the scaled reconstruction
                // is metric; otherwise fall back to the stored scale record.
                let scale = if pose.used_scaled_reconstruction {
                    None
                } else {
                    ScaleRecord::load(&entry.dirs)
                        .ok()
                        .flatten()
                        .and_then(|r| r.effective_scale())
                };
                match fuse_with_client(&pose_g, &client, scale) {
                    Ok(fused) => {
                        response.arscene_pose = Some(maploc_mvg::to_column_major_vec(&fused));
                    }
                    Err(e) => {
                        warn!(error = %e, "client-pose fusion failed; returning map pose only");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "ignoring malformed client pose");
            }
        }
    }

    Ok(response)
}

/// The pose-estimation core shared by queries and the scale estimator.
pub fn localize_pose(
    snapshot: &CacheSnapshot,
    entry: &Arc<MapEntry>,
    image_path: &Path,
    config: &LocalizeConfig,
) -> std::result::Result<LocalizedPose, LocalizeFailureKind> {
    let capabilities = snapshot.capabilities();
    // There is no hard ceiling on a query; a soft per-stage budget turns a
    // stalled stage into the soft failure of that stage.
    let started = std::time::Instant::now();
    let over_budget = |kind: LocalizeFailureKind| {
        if let Some(budget) = config.stage_budget_secs {
            if started.elapsed().as_secs() > budget {
                warn!(?kind, budget, "stage budget exceeded");
                return Err(kind);
            }
        }
        Ok(())
    };

    // Stage 1: features and global descriptor for the query image.
    let query_features = capabilities
        .local
        .extract_local(image_path)
        .map_err(|e| {
            warn!(error = %e, "local feature extraction failed");
            LocalizeFailureKind::Extraction
        })?;
    let query_descriptor = capabilities
        .global
        .extract_global(image_path)
        .map_err(|e| {
            warn!(error = %e, "global descriptor extraction failed");
            LocalizeFailureKind::Extraction
        })?;
    over_budget(LocalizeFailureKind::Extraction)?;

    // Stage 2: candidate retrieval.
    let top = retrieve_top_k(
        &entry.descriptor_index,
        &query_descriptor.values,
        config.retrieval_top_k,
    );
    if top.is_empty() {
        return Err(LocalizeFailureKind::NoCandidates);
    }
    debug!(candidates = top.len(), "retrieved candidates");

    // Stage 3: local matching against each candidate's stored features.
    let features_store = BlobStore::open(entry.dirs.hloc_dir().join(LOCAL_FEATURES_STORE))
        .map_err(|e| {
            warn!(error = %e, "feature store unavailable");
            LocalizeFailureKind::NoMatches
        })?;
    let query_name = image_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("query")
        .to_string();
    let match_store = image_path
        .parent()
        .and_then(|dir| MatchStore::open(dir.join("query_matches.store")).ok());

    let mut candidate_matches: Vec<(String, PairMatches)> = Vec::new();
    for &(row, score) in &top {
        let name = &entry.descriptor_index.names[row];
        let db_features: LocalFeatures = match features_store.get(name) {
            Ok(f) => f,
            Err(e) => {
                warn!(candidate = %name, error = %e, "no stored features, skipping candidate");
                continue;
            }
        };
        let matches = capabilities
            .matcher
            .match_pair(&query_features, &db_features)
            .map_err(|e| {
                warn!(candidate = %name, error = %e, "matcher failed");
                LocalizeFailureKind::Extraction
            })?;
        debug!(candidate = %name, score, matches = matches.len(), "matched candidate");
        if let Some(store) = &match_store {
            if let Err(e) = store.put(&query_name, name, &matches) {
                warn!(error = %e, "could not persist query matches");
            }
        }
        if !matches.is_empty() {
            candidate_matches.push((name.clone(), matches));
        }
    }
    if candidate_matches.is_empty() {
        return Err(LocalizeFailureKind::NoMatches);
    }
    over_budget(LocalizeFailureKind::NoMatches)?;

    // Stage 4: gather 2D-3D correspondences from the candidates' observed
    // points and solve PnP.
    let model = Reconstruction::read_from_dir(entry.dirs.preferred_reconstruction_dir())
        .map_err(|e| {
            warn!(error = %e, "could not read reconstruction");
            LocalizeFailureKind::Pnp
        })?;
    let used_scaled_reconstruction =
        entry.dirs.preferred_reconstruction_dir() != entry.dirs.sfm_reconstruction_dir();
    let name_index = model.name_index();

    let mut points2d = Vec::new();
    let mut points3d = Vec::new();
    let mut matched_query_indices = BTreeSet::new();
    for (name, matches) in &candidate_matches {
        let Some(&image_id) = name_index.get(name.as_str()) else {
            continue;
        };
        let image = &model.images[&image_id];
        for &(q_idx, db_idx) in &matches.indices {
            matched_query_indices.insert(q_idx);
            let Some(obs) = image.observations.get(db_idx as usize) else {
                continue;
            };
            let Some(point3d_id) = obs.point3d_id else {
                continue;
            };
            let Some(point) = model.points3d.get(&point3d_id) else {
                continue;
            };
            let Some(kp) = query_features.keypoints.get(q_idx as usize) else {
                continue;
            };
            points2d.push([f64::from(kp[0]), f64::from(kp[1])]);
            points3d.push(point.xyz);
        }
    }
    if points2d.len() < 4 {
        debug!(correspondences = points2d.len(), "too few correspondences for PnP");
        return Err(LocalizeFailureKind::Pnp);
    }

    let request = PnpRequest {
        camera: PnpCamera::infer_from_size(
            query_features.image_size[0],
            query_features.image_size[1],
        ),
        points2d,
        points3d,
        max_reproj_error: config.max_reproj_error,
        refine_focal_length: config.refine_focal_length,
        refine_extra_params: config.refine_extra_params,
    };
    let solution = capabilities
        .pnp
        .solve(&request)
        .map_err(|e| {
            warn!(error = %e, "PnP solver failed");
            LocalizeFailureKind::Pnp
        })?
        .ok_or(LocalizeFailureKind::Pnp)?;

    let camera_pose = camera_pose_from_model(solution.qvec, solution.tvec).map_err(|e| {
        warn!(error = %e, "estimated pose is degenerate");
        LocalizeFailureKind::Pnp
    })?;

    let matched = matched_query_indices.len().max(1);
    let confidence = (f64::from(solution.num_inliers) / matched as f64).clamp(0.0, 1.0);
    info!(
        inliers = solution.num_inliers,
        matched, confidence, "localized query"
    );

    Ok(LocalizedPose {
        camera_pose,
        num_inliers: solution.num_inliers,
        confidence,
        used_scaled_reconstruction,
    })
}

fn matrix_rows(m: &Matrix4<f64>) -> [[f64; 4]; 4] {
    let mut out = [[0.0; 4]; 4];
    for r in 0..4 {
        for c in 0..4 {
            out[r][c] = m[(r, c)];
        }
    }
    out
}
