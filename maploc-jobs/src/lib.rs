//! Background build orchestration.
//!
//! Builds run in worker *processes*, not threads: a native-code crash in
//! COLMAP or a model sidecar must never take the serving process down, and
//! spawn-style process creation means a worker inherits no mutable state.
//! The controller hands each worker a plain JSON job descriptor, tees its
//! output into the per-map log, serializes builds per map, retries with
//! backoff under the same job id, and reloads the shared cache when a
//! build succeeds.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use map_cache::MapCache;
use maploc_types::{JobDescriptor, JobId, JobState, JobsConfig, MapDirs, MapName};

#[derive(thiserror::Error, Debug)]
pub enum JobError {
    #[error("unknown job {0}")]
    UnknownJob(JobId),
    #[error("{source}")]
    Runner {
        #[from]
        source: proc_runner::RunnerError,
    },
    #[error("{source}")]
    SerdeJson {
        #[from]
        source: serde_json::Error,
    },
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, JobError>;

pub use maploc_types::job::JobStatus;

struct JobSlot {
    descriptor: JobDescriptor,
    state: JobState,
    attempt: u32,
    started_at: Option<chrono::DateTime<Utc>>,
    ended_at: Option<chrono::DateTime<Utc>>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ControllerState {
    next_id: u64,
    jobs: BTreeMap<JobId, JobSlot>,
    /// Jobs waiting behind a running build of the same map.
    queues: BTreeMap<MapName, VecDeque<JobId>>,
    running: BTreeMap<MapName, JobId>,
}

pub struct JobController {
    config: JobsConfig,
    data_root: PathBuf,
    cache: Arc<MapCache>,
    /// Command prefix for workers, e.g. `["maploc", "worker"]`; the
    /// descriptor path is appended.
    worker_argv: Vec<String>,
    /// Global cap on concurrently running worker processes.
    slots: Arc<tokio::sync::Semaphore>,
    state: Mutex<ControllerState>,
}

impl JobController {
    pub fn new(
        config: JobsConfig,
        data_root: PathBuf,
        cache: Arc<MapCache>,
        worker_argv: Vec<String>,
    ) -> Arc<JobController> {
        let slots = Arc::new(tokio::sync::Semaphore::new(config.worker_slots.max(1)));
        Arc::new(JobController {
            config,
            data_root,
            cache,
            worker_argv,
            slots,
            state: Mutex::new(ControllerState::default()),
        })
    }

    /// Fire-and-forget submission. The job starts immediately unless a
    /// build of the same map is already running, in which case it queues
    /// behind it.
    pub fn submit(self: &Arc<Self>, mut descriptor: JobDescriptor) -> JobId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = JobId(state.next_id);
        descriptor.id = id;
        let map = descriptor.map.clone();
        state.jobs.insert(
            id,
            JobSlot {
                descriptor,
                state: JobState::Queued,
                attempt: 0,
                started_at: None,
                ended_at: None,
                cancel: CancellationToken::new(),
            },
        );
        let start_now = !state.running.contains_key(&map);
        if start_now {
            state.running.insert(map.clone(), id);
        } else {
            state.queues.entry(map.clone()).or_default().push_back(id);
            info!(%id, %map, "queued behind running build");
        }
        drop(state);
        if start_now {
            self.spawn_driver(id);
        }
        id
    }

    pub fn status(&self, id: JobId) -> Result<JobStatus> {
        let state = self.state.lock();
        let slot = state.jobs.get(&id).ok_or(JobError::UnknownJob(id))?;
        let log_path = MapDirs::new(&self.data_root, &slot.descriptor.map).log_path();
        let log_offset = std::fs::metadata(&log_path).map(|m| m.len()).unwrap_or(0);
        Ok(JobStatus {
            id,
            map: slot.descriptor.map.clone(),
            kind: slot.descriptor.kind,
            state: slot.state,
            attempt: slot.attempt,
            started_at: slot.started_at,
            ended_at: slot.ended_at,
            log_path,
            log_offset,
        })
    }

    /// Read new log output for a map from a byte offset.
    pub fn log_tail(&self, map: &MapName, offset: u64) -> Result<(String, u64)> {
        let log_path = MapDirs::new(&self.data_root, map).log_path();
        Ok(proc_runner::read_log_from(&log_path, offset)?)
    }

    /// Best-effort cancellation: the worker process is killed and the job
    /// ends in `failed` without retries.
    pub fn cancel(&self, id: JobId) -> Result<()> {
        let state = self.state.lock();
        let slot = state.jobs.get(&id).ok_or(JobError::UnknownJob(id))?;
        slot.cancel.cancel();
        Ok(())
    }

    /// Block until the job reaches a terminal state (test and CLI helper).
    pub async fn wait(&self, id: JobId) -> Result<JobStatus> {
        loop {
            let status = self.status(id)?;
            if status.state.is_terminal() {
                return Ok(status);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    fn spawn_driver(self: &Arc<Self>, id: JobId) {
        let controller = self.clone();
        tokio::spawn(async move {
            controller.drive(id).await;
        });
    }

    async fn drive(self: Arc<Self>, id: JobId) {
        let (descriptor, cancel) = {
            let mut state = self.state.lock();
            let slot = match state.jobs.get_mut(&id) {
                Some(slot) => slot,
                None => return,
            };
            slot.started_at = Some(Utc::now());
            (slot.descriptor.clone(), slot.cancel.clone())
        };
        let map = descriptor.map.clone();
        let dirs = MapDirs::new(&self.data_root, &map);

        // Hold a worker slot for the whole retry sequence.
        let _permit = match self.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        // The first run plus up to `max_retries` retries, all under the
        // same job id.
        let total_attempts = self.config.max_retries + 1;
        let mut succeeded = false;
        for attempt in 1..=total_attempts {
            {
                let mut state = self.state.lock();
                if let Some(slot) = state.jobs.get_mut(&id) {
                    slot.state = JobState::Running;
                    slot.attempt = attempt;
                }
            }
            match self.run_worker_once(&descriptor, &dirs, &cancel).await {
                Ok(()) => {
                    succeeded = true;
                    break;
                }
                Err(e) if cancel.is_cancelled() => {
                    warn!(%id, %map, error = %e, "build cancelled");
                    break;
                }
                Err(e) => {
                    error!(%id, %map, attempt, error = %e, "build attempt failed");
                    if attempt < total_attempts {
                        {
                            let mut state = self.state.lock();
                            if let Some(slot) = state.jobs.get_mut(&id) {
                                slot.state = JobState::Retrying;
                            }
                        }
                        tokio::time::sleep(Duration::from_secs(self.config.retry_backoff_secs))
                            .await;
                    }
                }
            }
        }

        if succeeded {
            // Publish the rebuilt map before reporting success.
            let cache = self.cache.clone();
            let reload_map = map.clone();
            let reload =
                tokio::task::spawn_blocking(move || cache.reload(&reload_map)).await;
            match reload {
                Ok(Ok(())) => info!(%id, %map, "cache reloaded after build"),
                Ok(Err(e)) => warn!(%id, %map, error = %e, "cache reload failed"),
                Err(e) => warn!(%id, %map, error = %e, "cache reload panicked"),
            }
        }

        let next = {
            let mut state = self.state.lock();
            if let Some(slot) = state.jobs.get_mut(&id) {
                slot.state = if succeeded {
                    JobState::Succeeded
                } else {
                    JobState::Failed
                };
                slot.ended_at = Some(Utc::now());
            }
            let next = state.queues.get_mut(&map).and_then(|q| q.pop_front());
            match next {
                Some(next_id) => {
                    state.running.insert(map.clone(), next_id);
                    Some(next_id)
                }
                None => {
                    state.running.remove(&map);
                    None
                }
            }
        };
        if let Some(next_id) = next {
            self.spawn_driver(next_id);
        }
    }

    /// One worker-process execution: write the descriptor, spawn, tee
    /// output to the map log, enforce the timeout ceiling.
    async fn run_worker_once(
        &self,
        descriptor: &JobDescriptor,
        dirs: &MapDirs,
        cancel: &CancellationToken,
    ) -> Result<()> {
        std::fs::create_dir_all(dirs.root())?;
        let descriptor_path = dirs.root().join(format!("{}.json", descriptor.id));
        std::fs::write(&descriptor_path, serde_json::to_vec_pretty(descriptor)?)?;

        let log_path = dirs.log_path();
        proc_runner::append_log_line(
            &log_path,
            &format!(
                "=== {} attempt starting (kind {:?}) ===",
                descriptor.id, descriptor.kind
            ),
        )?;
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let (program, args) = self
            .worker_argv
            .split_first()
            .ok_or(proc_runner::RunnerError::EmptyCommand)
            .map_err(JobError::from)?;
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .arg(&descriptor_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file.try_clone()?))
            .stderr(Stdio::from(log_file))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| proc_runner::RunnerError::Spawn {
                program: program.clone(),
                source,
            })
            .map_err(JobError::from)?;

        let start = tokio::time::Instant::now();
        let hard_deadline = start + Duration::from_secs(self.config.hard_timeout_secs);
        let warn_deadline = start
            + Duration::from_secs(
                self.config.warn_timeout_secs.min(self.config.hard_timeout_secs),
            );
        let mut warned = false;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                () = cancel.cancelled() => {
                    let _ = child.kill().await;
                    proc_runner::append_log_line(&log_path, "=== build cancelled ===")?;
                    return Err(JobError::Runner {
                        source: proc_runner::RunnerError::NonZeroExit {
                            program: program.clone(),
                            status: "cancelled".to_string(),
                            stderr_tail: String::new(),
                        },
                    });
                }
                () = tokio::time::sleep_until(warn_deadline), if !warned => {
                    warned = true;
                    warn!(map = %descriptor.map, "build approaching timeout ceiling");
                    proc_runner::append_log_line(&log_path, "=== build nearing timeout ===")?;
                }
                () = tokio::time::sleep_until(hard_deadline) => {
                    let _ = child.kill().await;
                    proc_runner::append_log_line(&log_path, "=== build timed out ===")?;
                    return Err(JobError::Runner {
                        source: proc_runner::RunnerError::NonZeroExit {
                            program: program.clone(),
                            status: "timeout".to_string(),
                            stderr_tail: String::new(),
                        },
                    });
                }
            }
        };

        if !status.success() {
            proc_runner::append_log_line(
                &log_path,
                &format!("=== worker exited with {status} ==="),
            )?;
            return Err(JobError::Runner {
                source: proc_runner::RunnerError::NonZeroExit {
                    program: program.clone(),
                    status: status.to_string(),
                    stderr_tail: String::new(),
                },
            });
        }
        proc_runner::append_log_line(&log_path, "=== worker finished ===")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maploc_models::CapabilitySet;
    use maploc_types::JobKind;

    fn controller(
        root: &std::path::Path,
        worker_argv: &[&str],
        config: JobsConfig,
    ) -> Arc<JobController> {
        let cache =
            Arc::new(MapCache::load(root, CapabilitySet::unconfigured()).unwrap());
        JobController::new(
            config,
            root.to_path_buf(),
            cache,
            worker_argv.iter().map(|s| s.to_string()).collect(),
        )
    }

    fn descriptor(map: &str) -> JobDescriptor {
        JobDescriptor {
            id: JobId(0),
            map: MapName::new(map).unwrap(),
            kind: JobKind::Images,
            source_path: PathBuf::from("/nonexistent"),
            frame_ratio_percent: None,
            config_path: None,
        }
    }

    fn fast_config() -> JobsConfig {
        JobsConfig {
            max_retries: 3,
            retry_backoff_secs: 0,
            hard_timeout_secs: 10,
            warn_timeout_secs: 9,
            worker_slots: 1,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn successful_worker_completes_job() {
        let tmp = tempfile::tempdir().unwrap();
        let ctl = controller(tmp.path(), &["true"], fast_config());
        let id = ctl.submit(descriptor("lobby"));
        let status = ctl.wait(id).await.unwrap();
        assert_eq!(status.state, JobState::Succeeded);
        assert_eq!(status.attempt, 1);
        assert!(status.started_at.is_some() && status.ended_at.is_some());
        // The log carries the attempt banner and is tailable by offset.
        let (text, _) = ctl.log_tail(&MapName::new("lobby").unwrap(), 0).unwrap();
        assert!(text.contains("attempt starting"));
        assert!(text.contains("worker finished"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failing_worker_retries_then_fails_under_same_id() {
        let tmp = tempfile::tempdir().unwrap();
        let ctl = controller(tmp.path(), &["false"], fast_config());
        let id = ctl.submit(descriptor("lobby"));
        let status = ctl.wait(id).await.unwrap();
        assert_eq!(status.state, JobState::Failed);
        // Initial run plus three retries.
        assert_eq!(status.attempt, 4);
        assert_eq!(status.id, id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_submission_for_same_map_queues() {
        let tmp = tempfile::tempdir().unwrap();
        let ctl = controller(tmp.path(), &["sh", "-c", "sleep 0.3"], fast_config());
        let first = ctl.submit(descriptor("lobby"));
        let second = ctl.submit(descriptor("lobby"));
        // While the first runs, the second stays queued.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ctl.status(first).unwrap().state, JobState::Running);
        assert_eq!(ctl.status(second).unwrap().state, JobState::Queued);
        let s2 = ctl.wait(second).await.unwrap();
        assert_eq!(s2.state, JobState::Succeeded);
        let s1 = ctl.status(first).unwrap();
        assert!(s1.ended_at.unwrap() <= s2.started_at.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn builds_of_different_maps_run_independently() {
        let tmp = tempfile::tempdir().unwrap();
        let ctl = controller(tmp.path(), &["true"], fast_config());
        let a = ctl.submit(descriptor("map-a"));
        let b = ctl.submit(descriptor("map-b"));
        assert_eq!(ctl.wait(a).await.unwrap().state, JobState::Succeeded);
        assert_eq!(ctl.wait(b).await.unwrap().state, JobState::Succeeded);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn timeout_kills_the_worker() {
        let tmp = tempfile::tempdir().unwrap();
        let config = JobsConfig {
            max_retries: 1,
            retry_backoff_secs: 0,
            hard_timeout_secs: 1,
            warn_timeout_secs: 1,
            worker_slots: 1,
        };
        let ctl = controller(tmp.path(), &["sh", "-c", "sleep 30"], config);
        let id = ctl.submit(descriptor("lobby"));
        let status = ctl.wait(id).await.unwrap();
        assert_eq!(status.state, JobState::Failed);
        let (text, _) = ctl.log_tail(&MapName::new("lobby").unwrap(), 0).unwrap();
        assert!(text.contains("timed out"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_ends_without_retries() {
        let tmp = tempfile::tempdir().unwrap();
        let ctl = controller(tmp.path(), &["sh", "-c", "sleep 30"], fast_config());
        let id = ctl.submit(descriptor("lobby"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        ctl.cancel(id).unwrap();
        let status = ctl.wait(id).await.unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.attempt, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_job_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let ctl = controller(tmp.path(), &["true"], fast_config());
        assert!(matches!(
            ctl.status(JobId(99)),
            Err(JobError::UnknownJob(_))
        ));
    }
}
