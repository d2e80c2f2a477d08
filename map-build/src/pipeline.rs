//! The build pipeline: strictly sequential stages from capture source to
//! servable map.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use colmap_model::Reconstruction;
use feature_store::{open_map_stores, MatchStore};
use map_clean::{
    elevate_reconstruction, export_pcd, post_manhattan_rotation, prune_masked_keypoints,
    read_mesh_info, remove_masked_points, remove_statistical_outliers, MaskingParams,
    PcdExportOptions,
};
use maploc_models::CapabilitySet;
use maploc_types::{BuildConfig, MapDirs, ScaleRecord};
use proc_runner::append_log_line;

use crate::sources::{
    list_images, prepare_from_transforms, prepare_with_ns_process, CaptureSource, PreparedInput,
};
use crate::{pairs, BuildAbort, BuildError, Result};

pub struct BuildContext {
    pub dirs: MapDirs,
    pub config: BuildConfig,
    pub capabilities: CapabilitySet,
    pub abort: BuildAbort,
}

impl BuildContext {
    fn log(&self) -> PathBuf {
        self.dirs.log_path()
    }

    fn stage<T>(&self, name: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.abort.check()?;
        let _ = append_log_line(&self.log(), &format!("==> {name}"));
        match f() {
            Ok(v) => Ok(v),
            Err(e) => {
                let _ = append_log_line(&self.log(), &format!("==> {name} FAILED: {e}"));
                Err(e.at_stage(name))
            }
        }
    }
}

/// Run a complete build. On success the map directory satisfies the
/// serving contract; the caller (job controller) triggers the cache
/// reload.
pub fn run_build(ctx: &BuildContext, source: &CaptureSource) -> Result<()> {
    let prepared = ctx.stage("prepare", || prepare(ctx, source))?;
    ctx.stage("thumbnails", || {
        write_thumbnails(&prepared.images_dir, &ctx.dirs.thumbnails_dir());
        Ok(())
    })?;
    ctx.stage("features", || extract_features(ctx, &prepared.images_dir))?;
    if ctx.config.clean.mask_objects {
        ctx.stage("keypoint-masking", || {
            let (features, _, _) = open_map_stores(&ctx.dirs.hloc_dir())?;
            prune_masked_keypoints(
                &features,
                &prepared.images_dir,
                ctx.capabilities.segmenter.as_ref(),
                &masking_params(&ctx.config),
            )?;
            Ok(())
        })?;
    }
    let proposed = ctx.stage("pairs", || propose_pairs(ctx, &prepared))?;
    ctx.stage("matching", || match_pairs(ctx, &proposed))?;
    ctx.stage("triangulation", || triangulate(ctx, &prepared, &proposed))?;
    ctx.stage("post-process", || post_process(ctx, &prepared.images_dir))?;
    let _ = append_log_line(&ctx.log(), "==> build complete");
    Ok(())
}

fn prepare(ctx: &BuildContext, source: &CaptureSource) -> Result<PreparedInput> {
    match source {
        CaptureSource::Video { .. } | CaptureSource::Images { .. } => {
            prepare_with_ns_process(&ctx.config.tools, source, &ctx.dirs, &ctx.log())
        }
        CaptureSource::Polycam { dir } => {
            // Flatten keyframes into images/ + transforms.json first.
            let mut argv = ctx.config.tools.ns_process_data.clone();
            argv.extend([
                "polycam".to_string(),
                "--data".to_string(),
                dir.display().to_string(),
                "--output-dir".to_string(),
                ctx.dirs.root().display().to_string(),
            ]);
            proc_runner::run_logged(&argv, Some(&ctx.log()))?;
            prepare_from_transforms(
                ctx.dirs.root(),
                &ctx.dirs.images_dir(),
                &ctx.dirs.root().join("colmap_known_poses").join("sparse").join("0"),
                true,
            )
        }
        CaptureSource::Kiri { dir } => {
            let images_dir = if dir.join("images").is_dir() {
                dir.join("images")
            } else {
                dir.clone()
            };
            prepare_from_transforms(
                dir,
                &images_dir,
                &ctx.dirs.root().join("colmap_known_poses").join("sparse").join("0"),
                false,
            )
        }
    }
}

/// Best-effort 1/8-scale thumbnails; a failed frame is skipped.
fn write_thumbnails(images_dir: &Path, thumbs_dir: &Path) {
    let Ok(images) = list_images(images_dir) else {
        return;
    };
    if std::fs::create_dir_all(thumbs_dir).is_err() {
        return;
    }
    for path in images {
        let Some(name) = path.file_name() else {
            continue;
        };
        let out = thumbs_dir.join(name);
        if out.exists() {
            continue;
        }
        match image::open(&path) {
            Ok(img) => {
                let (w, h) = (img.width().max(8) / 8, img.height().max(8) / 8);
                let thumb = img.thumbnail(w, h);
                if let Err(e) = thumb.save(&out) {
                    warn!(image = %path.display(), error = %e, "thumbnail save failed");
                }
            }
            Err(e) => warn!(image = %path.display(), error = %e, "thumbnail decode failed"),
        }
    }
}

fn extract_features(ctx: &BuildContext, images_dir: &Path) -> Result<()> {
    let (features, descriptors, _) = open_map_stores(&ctx.dirs.hloc_dir())?;
    let images = list_images(images_dir)?;
    if images.is_empty() {
        return Err(BuildError::MissingInput(format!(
            "no images in {}",
            images_dir.display()
        )));
    }
    info!(count = images.len(), "extracting features");
    for path in &images {
        ctx.abort.check()?;
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if features.contains(name) && descriptors.contains(name) {
            continue;
        }
        let local = ctx.capabilities.local.extract_local(path)?;
        features.put(name, &local)?;
        let global = ctx.capabilities.global.extract_global(path)?;
        descriptors.put(name, &global)?;
    }
    let _ = append_log_line(
        &ctx.log(),
        &format!("extracted features for {} images", images.len()),
    );
    Ok(())
}

fn propose_pairs(ctx: &BuildContext, prepared: &PreparedInput) -> Result<Vec<(String, String)>> {
    let proposed = if prepared.known_poses {
        let names: Vec<String> = list_images(&prepared.images_dir)?
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(String::from))
            .collect();
        pairs::exhaustive_pairs(&names)
    } else {
        let prior = Reconstruction::read_from_dir(&prepared.prior_model_dir)?;
        pairs::covisibility_pairs(&prior, ctx.config.covisibility_pairs)
    };
    pairs::write_pairs_file(&proposed, &ctx.dirs.hloc_dir().join("sfm-pairs.txt"))?;
    let _ = append_log_line(&ctx.log(), &format!("proposed {} pairs", proposed.len()));
    Ok(proposed)
}

fn match_pairs(ctx: &BuildContext, proposed: &[(String, String)]) -> Result<()> {
    let (features, _, matches) = open_map_stores(&ctx.dirs.hloc_dir())?;
    let mut matched = 0usize;
    for (a, b) in proposed {
        ctx.abort.check()?;
        if matches.contains(a, b) {
            continue;
        }
        let fa = features.get(a)?;
        let fb = features.get(b)?;
        let m = ctx.capabilities.matcher.match_pair(&fa, &fb)?;
        matches.put(a, b, &m)?;
        matched += 1;
    }
    let _ = append_log_line(&ctx.log(), &format!("matched {matched} new pairs"));
    Ok(())
}

/// Images with zero correspondences cannot constrain triangulation and
/// are dropped from the known-pose prior.
fn drop_unmatched_images(
    prior: &mut Reconstruction,
    proposed: &[(String, String)],
    matches: &MatchStore,
) -> usize {
    let mut matched_names: BTreeSet<&str> = BTreeSet::new();
    for (a, b) in proposed {
        if let Ok(m) = matches.get(a, b) {
            if !m.is_empty() {
                matched_names.insert(a);
                matched_names.insert(b);
            }
        }
    }
    let doomed: Vec<u32> = prior
        .images
        .values()
        .filter(|im| !matched_names.contains(im.name.as_str()))
        .map(|im| im.id)
        .collect();
    for id in &doomed {
        prior.images.remove(id);
    }
    doomed.len()
}

fn triangulate(
    ctx: &BuildContext,
    prepared: &PreparedInput,
    proposed: &[(String, String)],
) -> Result<()> {
    let hloc = ctx.dirs.hloc_dir();
    let sfm_dir = ctx.dirs.sfm_reconstruction_dir();

    let prior_dir = if prepared.known_poses {
        let (_, _, matches) = open_map_stores(&hloc)?;
        let mut prior = Reconstruction::read_from_dir(&prepared.prior_model_dir)?;
        let dropped = drop_unmatched_images(&mut prior, proposed, &matches);
        if dropped > 0 {
            let _ = append_log_line(
                &ctx.log(),
                &format!("dropped {dropped} images with no correspondences"),
            );
        }
        let filtered_dir = ctx.dirs.root().join("colmap_known_poses").join("sparse").join("1");
        std::fs::create_dir_all(&filtered_dir)?;
        colmap_model::write_text_model(&prior, &filtered_dir)?;
        filtered_dir
    } else {
        prepared.prior_model_dir.clone()
    };

    let mut argv = ctx.config.tools.triangulator.clone();
    argv.extend([
        "--images".to_string(),
        prepared.images_dir.display().to_string(),
        "--prior".to_string(),
        prior_dir.display().to_string(),
        "--features".to_string(),
        hloc.join(feature_store::LOCAL_FEATURES_STORE).display().to_string(),
        "--matches".to_string(),
        hloc.join(feature_store::MATCHES_STORE).display().to_string(),
        "--pairs".to_string(),
        hloc.join("sfm-pairs.txt").display().to_string(),
        "--output".to_string(),
        sfm_dir.display().to_string(),
    ]);
    if !prepared.known_poses {
        // Unknown-pose inputs triangulate against the reference model
        // rather than holding the poses fixed.
        argv.extend([
            "--reference".to_string(),
            prepared.prior_model_dir.display().to_string(),
        ]);
    }
    proc_runner::run_logged(&argv, Some(&ctx.log()))?;

    // The triangulator must have produced a valid reconstruction.
    Reconstruction::read_from_dir(&sfm_dir)?;
    Ok(())
}

fn masking_params(config: &BuildConfig) -> MaskingParams<'_> {
    MaskingParams {
        confidence: config.clean.segmentation_confidence,
        class_ids: &config.clean.target_class_ids,
    }
}

/// Geometric post-processing over the triangulated model, then the
/// derived artifacts (scaled model, point cloud).
pub fn post_process(ctx: &BuildContext, images_dir: &Path) -> Result<()> {
    let sfm_dir = ctx.dirs.sfm_reconstruction_dir();
    let clean = &ctx.config.clean;

    if clean.manhattan_align {
        let mut argv = ctx.config.tools.colmap.clone();
        argv.extend([
            "model_orientation_aligner".to_string(),
            "--image_path".to_string(),
            images_dir.display().to_string(),
            "--input_path".to_string(),
            sfm_dir.display().to_string(),
            "--output_path".to_string(),
            sfm_dir.display().to_string(),
            "--method".to_string(),
            "MANHATTAN-WORLD".to_string(),
        ]);
        proc_runner::run_logged(&argv, Some(&ctx.log()))?;
    }

    let mut model = Reconstruction::read_from_dir(&sfm_dir)?;

    if clean.manhattan_align {
        model.rotate(&post_manhattan_rotation());
    }

    let mesh_info_path = ctx.dirs.polycam_dir().join("mesh_info.json");
    if mesh_info_path.is_file() {
        let info = read_mesh_info(&mesh_info_path)?;
        map_clean::apply_mesh_alignment(&mut model, &info, clean.negate_y_rotation)?;
        let _ = append_log_line(&ctx.log(), "applied scan alignment transform");
    }

    if clean.elevate {
        let shift = elevate_reconstruction(&mut model, clean.elevation_bucket_meters)?;
        let _ = append_log_line(&ctx.log(), &format!("elevated by {shift:.4} m"));
    }

    if clean.remove_outliers {
        let pruned = remove_statistical_outliers(
            &mut model,
            clean.outlier_neighbors,
            clean.outlier_std_ratio,
        );
        let _ = append_log_line(&ctx.log(), &format!("pruned {pruned} outlier points"));
    }

    if clean.mask_objects {
        let removed = remove_masked_points(
            &mut model,
            images_dir,
            ctx.capabilities.segmenter.as_ref(),
            &masking_params(&ctx.config),
        )?;
        let _ = append_log_line(&ctx.log(), &format!("masked out {removed} dynamic points"));
    }

    model.validate()?;
    model.write_to_dir(&sfm_dir)?;

    if clean.apply_scale {
        if let Some(scale) = ScaleRecord::load(&ctx.dirs)?.and_then(|r| r.effective_scale()) {
            let mut scaled = model.clone();
            scaled.scale(scale);
            scaled.write_to_dir(ctx.dirs.scaled_sfm_reconstruction_dir())?;
            let _ = append_log_line(&ctx.log(), &format!("applied metric scale {scale:.4}"));
        }
    }

    export_pcd(
        &model,
        &ctx.dirs.points_pcd_path(),
        &PcdExportOptions {
            voxel_size: Some(clean.voxel_size),
            crop_y_meters: clean.crop_y_meters,
        },
    )?;
    Ok(())
}
