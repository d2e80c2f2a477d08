//! The `maploc` command line: map building, localization queries, and the
//! post-hoc map-transform operations, plus the `worker` entry point the
//! job controller spawns as a separate process.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use tracing::info;

use map_build::{run_build, BuildContext, CaptureSource};
use map_cache::MapCache;
use maploc_jobs::JobController;
use maploc_models::CapabilitySet;
use maploc_types::{
    BuildConfig, JobDescriptor, JobId, JobKind, LocalizeConfig, MapDirs, MapName,
};

#[derive(Parser)]
#[command(name = "maploc", about = "Visual localization maps for indoor spaces")]
struct Cli {
    /// Root directory holding all map data.
    #[arg(long, default_value = "data/map_data", global = true)]
    data_root: PathBuf,
    /// Optional TOML build configuration.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build (or rebuild) a map from a capture source.
    BuildMap {
        #[arg(long)]
        name: String,
        #[arg(long, value_enum)]
        kind: KindArg,
        /// Video file, image directory, or scan export directory.
        #[arg(long)]
        source: PathBuf,
        /// Percentage of video frames to extract.
        #[arg(long)]
        frame_ratio: Option<f64>,
        /// Run through the job controller in a worker process, streaming
        /// the build log, instead of building in-process.
        #[arg(long)]
        background: bool,
    },
    /// Worker entry point: run one build described by a job descriptor.
    Worker {
        descriptor: PathBuf,
    },
    /// Localize a query image against a map, printing the JSON response.
    Localize {
        #[arg(long)]
        name: String,
        #[arg(long)]
        image: PathBuf,
        /// Client camera pose as a JSON array of 16 column-major floats.
        #[arg(long)]
        client_pose: Option<String>,
        #[arg(long, default_value_t = 10)]
        top_k: usize,
    },
    /// Re-run individual post-processing operations on an existing map.
    MapTransform {
        #[arg(long)]
        name: String,
        /// Rotation spec such as `x-90`, `y90`, `z180`.
        #[arg(long)]
        rotation: Option<String>,
        #[arg(long)]
        elevate: bool,
        #[arg(long)]
        remove_outliers: bool,
        #[arg(long)]
        mask_objects: bool,
        #[arg(long)]
        apply_scale: bool,
        #[arg(long)]
        export_pcd: bool,
    },
    /// Estimate the metric scale of a map from its posed queries.
    GetScale {
        #[arg(long)]
        name: String,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum KindArg {
    Video,
    Images,
    Polycam,
    Kiri,
}

impl From<KindArg> for JobKind {
    fn from(value: KindArg) -> JobKind {
        match value {
            KindArg::Video => JobKind::Video,
            KindArg::Images => JobKind::Images,
            KindArg::Polycam => JobKind::Polycam,
            KindArg::Kiri => JobKind::Kiri,
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::{
        fmt::{self, format, time},
        prelude::*,
        EnvFilter,
    };
    let evt_fmt = format().with_timer(time::Uptime::default()).compact();
    let fmt_layer = fmt::layer().event_format(evt_fmt);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .init();
}

fn load_config(path: &Option<PathBuf>, data_root: &PathBuf) -> color_eyre::Result<BuildConfig> {
    let mut config = match path {
        Some(path) => BuildConfig::from_toml_path(path)
            .wrap_err_with(|| format!("loading config {}", path.display()))?,
        None => BuildConfig::default(),
    };
    config.data_root = data_root.clone();
    Ok(config)
}

fn capture_source(kind: JobKind, source: PathBuf, frame_ratio: Option<f64>, config: &BuildConfig) -> CaptureSource {
    match kind {
        JobKind::Video => CaptureSource::Video {
            path: source,
            frame_ratio_percent: frame_ratio.unwrap_or(config.frame_ratio_percent),
        },
        JobKind::Images => CaptureSource::Images { dir: source },
        JobKind::Polycam => CaptureSource::Polycam { dir: source },
        JobKind::Kiri => CaptureSource::Kiri { dir: source },
    }
}

/// Submit the build to a job controller backed by `maploc worker` child
/// processes and stream the log until it finishes.
async fn build_in_background(
    config: BuildConfig,
    config_path: Option<PathBuf>,
    name: MapName,
    kind: JobKind,
    source: PathBuf,
    frame_ratio: Option<f64>,
) -> color_eyre::Result<()> {
    let capabilities = CapabilitySet::from_tools(&config.tools);
    let cache = Arc::new(MapCache::load(&config.data_root, capabilities)?);
    let worker_exe = std::env::current_exe()?;
    let controller = JobController::new(
        maploc_types::JobsConfig::default(),
        config.data_root.clone(),
        cache,
        vec![worker_exe.display().to_string(), "worker".to_string()],
    );

    let id = controller.submit(JobDescriptor {
        id: JobId(0),
        map: name.clone(),
        kind,
        source_path: source,
        frame_ratio_percent: frame_ratio,
        config_path,
    });
    info!(%id, map = %name, "submitted build");

    let mut offset = 0u64;
    loop {
        let (text, next_offset) = controller.log_tail(&name, offset)?;
        if !text.is_empty() {
            print!("{text}");
        }
        offset = next_offset;
        let status = controller.status(id)?;
        if status.state.is_terminal() {
            let (text, _) = controller.log_tail(&name, offset)?;
            print!("{text}");
            info!(%id, state = ?status.state, "build ended");
            if status.state != maploc_types::JobState::Succeeded {
                return Err(eyre!("build {id} failed; see {}", status.log_path.display()));
            }
            return Ok(());
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
}

fn build_once(
    config: BuildConfig,
    name: &MapName,
    source: CaptureSource,
) -> color_eyre::Result<()> {
    let dirs = MapDirs::new(&config.data_root, name);
    std::fs::create_dir_all(dirs.root())?;
    let capabilities = CapabilitySet::from_tools(&config.tools);
    let ctx = BuildContext {
        dirs,
        config,
        capabilities,
        abort: map_build::BuildAbort::new(),
    };
    run_build(&ctx, &source)?;
    info!(map = %name, "build finished");
    Ok(())
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli.config, &cli.data_root)?;

    match cli.command {
        Command::BuildMap {
            name,
            kind,
            source,
            frame_ratio,
            background,
        } => {
            let name = MapName::new(name)?;
            let kind: JobKind = kind.into();
            if background {
                return build_in_background(
                    config,
                    cli.config.clone(),
                    name,
                    kind,
                    source,
                    frame_ratio,
                )
                .await;
            }
            let source = capture_source(kind, source, frame_ratio, &config);
            build_once(config, &name, source)
        }
        Command::Worker { descriptor } => {
            let text = std::fs::read_to_string(&descriptor)
                .wrap_err_with(|| format!("reading {}", descriptor.display()))?;
            let job: JobDescriptor = serde_json::from_str(&text)?;
            let config = load_config(&job.config_path, &cli.data_root)?;
            info!(id = %job.id, map = %job.map, "worker starting");
            let source = capture_source(
                job.kind,
                job.source_path.clone(),
                job.frame_ratio_percent,
                &config,
            );
            build_once(config, &job.map, source)
        }
        Command::Localize {
            name,
            image,
            client_pose,
            top_k,
        } => {
            let name = MapName::new(name)?;
            let capabilities = CapabilitySet::from_tools(&config.tools);
            let cache = MapCache::load(&config.data_root, capabilities)?;
            let client: Option<Vec<f64>> = client_pose
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .wrap_err("client pose must be a JSON array of 16 numbers")?;
            let localize_config = LocalizeConfig {
                retrieval_top_k: top_k,
                ..LocalizeConfig::default()
            };
            let response = maploc_localize::localize(
                &cache.snapshot(),
                &name,
                &image,
                client.as_deref(),
                &localize_config,
            )?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            if !response.success {
                return Err(eyre!("localization failed"));
            }
            Ok(())
        }
        Command::MapTransform {
            name,
            rotation,
            elevate,
            remove_outliers,
            mask_objects,
            apply_scale,
            export_pcd,
        } => {
            let name = MapName::new(name)?;
            let dirs = MapDirs::new(&config.data_root, &name);
            let capabilities = CapabilitySet::from_tools(&config.tools);
            let ops = map_build::transforms::TransformOps {
                rotation,
                elevate,
                remove_outliers,
                mask_objects,
                apply_scale,
                export_pcd,
            };
            map_build::transforms::run_map_transforms(&dirs, &ops, &config.clean, &capabilities)?;
            info!(map = %name, "map transforms applied");
            Ok(())
        }
        Command::GetScale { name } => {
            let name = MapName::new(name)?;
            let capabilities = CapabilitySet::from_tools(&config.tools);
            let cache = MapCache::load(&config.data_root, capabilities)?;
            let median = map_build::scale::estimate_map_scale(
                &cache.snapshot(),
                &name,
                &LocalizeConfig::default(),
            )?;
            match median {
                Some(scale) => println!("{scale}"),
                None => println!("1.0"),
            }
            Ok(())
        }
    }
}
