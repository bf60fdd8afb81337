use async_trait::async_trait;
use chrono::Utc;
use log::{error, info, trace, warn};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::error::AutoscanError;
use crate::filter::Filterer;
use crate::processor::Processor;
use crate::rewrite::{Rewrite, Rewriter};
use crate::scan::Scan;
use crate::triggers::drive::diff::{postprocess, DriveDiff};
use crate::triggers::drive::limiter::AccountLimiter;
use crate::triggers::drive::paths::{project_paths, Paths};
use crate::triggers::drive::store::MirrorStore;
use crate::triggers::PathSet;
use crate::utils::dir_name;

pub mod diff;
pub mod engine;
pub mod limiter;
pub mod paths;
pub mod store;

/// A partial sync may fail five times in a row before its job is removed
/// from the scheduler.
const MAX_SYNC_ATTEMPTS: u32 = 5;

/// Sync failures classified for the retry ladder. Everything except `Fatal`
/// counts a strike; `Fatal` stops the drive's job immediately.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("data anomaly: {0}")]
    DataAnomaly(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("network: {0}")]
    Network(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Other(#[from] AutoscanError),
}

/// A hook receives the mutable diff of one partial sync before the mirror
/// transaction commits.
pub type Hook<'a> = Box<dyn FnMut(&mut DriveDiff) -> Result<(), AutoscanError> + Send + 'a>;

/// The change-feed engine behind the drive trigger. The daemon only consumes
/// this surface, so the engine stays swappable and mockable.
#[async_trait]
pub trait SyncEngine: Send + Sync {
    /// Enumerates the drive's entire contents into the mirror. Potentially
    /// hours; unbounded pages.
    async fn full_sync(&self, drive_id: &str) -> Result<(), SyncError>;

    /// Pulls the next change-feed delta, runs the hooks on the resulting
    /// diff, then commits mirror rows and page token together.
    async fn partial_sync(&self, drive_id: &str, hooks: &mut [Hook<'_>]) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriveConfig {
    pub account: PathBuf,
    pub database: PathBuf,
    #[serde(default = "default_cron")]
    pub cron: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub verbosity: Option<String>,
    #[serde(default)]
    pub rewrite: Vec<Rewrite>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub drives: Vec<DriveEntry>,
}

fn default_cron() -> String {
    "*/5 * * * *".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriveEntry {
    pub id: String,
    #[serde(default)]
    pub rewrite: Vec<Rewrite>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobState {
    Idle,
    Running,
    Failed(u32),
    Stopped,
}

pub(crate) enum JobOutcome {
    Continue,
    Stop,
}

pub(crate) struct SyncJob {
    drive_id: String,
    rewriter: Rewriter,
    filterer: Filterer,
    priority: i32,
    full_sync: bool,
    attempts: u32,
    errors: Vec<String>,
    state: JobState,
}

pub struct DriveDaemon {
    engine: Arc<dyn SyncEngine>,
    store: Arc<MirrorStore>,
    limiter: Arc<AccountLimiter>,
    processor: Arc<Processor>,
}

impl DriveDaemon {
    /// Wires one cron-driven sync job per configured drive. Jobs whose
    /// mirror has no page token start in full-sync mode and switch to
    /// deltas once the initial enumeration lands.
    pub fn spawn(
        config: DriveConfig,
        engine: Arc<dyn SyncEngine>,
        store: Arc<MirrorStore>,
        limiter: Arc<AccountLimiter>,
        processor: Arc<Processor>,
    ) -> Result<(), AutoscanError> {
        let schedule = parse_cron(&config.cron)?;
        let filterer = Filterer::new(&config.include, &config.exclude)?;

        let daemon = Arc::new(Self {
            engine,
            store,
            limiter,
            processor,
        });

        for drive in &config.drives {
            let mut rewrites = drive.rewrite.clone();
            rewrites.extend(config.rewrite.iter().cloned());

            let full_sync = daemon.store.page_token(&drive.id)?.is_none();
            if full_sync {
                info!("Full sync pending for drive: {}", drive.id);
            }

            let job = SyncJob {
                drive_id: drive.id.clone(),
                rewriter: Rewriter::new(&rewrites)?,
                filterer: filterer.clone(),
                priority: config.priority,
                full_sync,
                attempts: 0,
                errors: Vec::new(),
                state: JobState::Idle,
            };

            let daemon = Arc::clone(&daemon);
            let schedule = schedule.clone();
            tokio::spawn(async move { daemon.run_job(schedule, job).await });
        }

        Ok(())
    }

    /// Sleeping until the next cron tick and then awaiting the run means
    /// ticks firing mid-run are simply missed, so one job never overlaps
    /// itself.
    async fn run_job(&self, schedule: cron::Schedule, mut job: SyncJob) {
        info!("Drive sync job scheduled: {}", job.drive_id);

        loop {
            let now = Utc::now();
            let Some(next) = schedule.after(&now).next() else {
                break;
            };

            let wait = (next - now).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            if matches!(self.run_once(&mut job).await, JobOutcome::Stop) {
                break;
            }
        }

        info!("Drive sync job removed: {}", job.drive_id);
    }

    pub(crate) async fn run_once(&self, job: &mut SyncJob) -> JobOutcome {
        let _permit = self.limiter.acquire_sync().await;
        job.state = JobState::Running;

        let was_full = job.full_sync;
        match self.sync_drive(job).await {
            Ok(scans) => {
                if was_full {
                    job.full_sync = false;
                    info!("Finished full sync: {}", job.drive_id);
                }

                job.attempts = 0;
                job.errors.clear();
                job.state = JobState::Idle;

                if scans > 0 {
                    trace!("Moved {scans} scans to processor: {}", job.drive_id);
                }

                JobOutcome::Continue
            }
            Err(SyncError::Fatal(msg)) => {
                error!("Drive sync failed fatally: {}: {msg}", job.drive_id);
                job.state = JobState::Stopped;
                JobOutcome::Stop
            }
            Err(err) => {
                job.attempts += 1;
                job.errors.push(err.to_string());
                warn!(
                    "Drive sync failed (attempt {}/{}): {}: {err}",
                    job.attempts, MAX_SYNC_ATTEMPTS, job.drive_id
                );

                if job.attempts >= MAX_SYNC_ATTEMPTS {
                    error!(
                        "Removing drive sync job after {} consecutive failures: {}",
                        job.attempts, job.drive_id
                    );
                    job.state = JobState::Stopped;
                    return JobOutcome::Stop;
                }

                job.state = JobState::Failed(job.attempts);
                JobOutcome::Continue
            }
        }
    }

    /// One sync pass: a pending full sync runs alone; otherwise the partial
    /// sync runs with the post-process and path-projection hooks wired in,
    /// and the projected paths are submitted as scans.
    async fn sync_drive(&self, job: &SyncJob) -> Result<usize, SyncError> {
        if job.full_sync {
            let start = std::time::Instant::now();
            info!("Starting full sync: {}", job.drive_id);
            self.engine.full_sync(&job.drive_id).await?;
            info!(
                "Full sync finished in {:.2?}: {}",
                start.elapsed(),
                job.drive_id
            );
            return Ok(0);
        }

        let mut paths = Paths::default();

        {
            let store_pp = Arc::clone(&self.store);
            let drive_pp = job.drive_id.clone();
            let store_paths = Arc::clone(&self.store);
            let drive_paths = job.drive_id.clone();
            let paths_out = &mut paths;

            let mut hooks: Vec<Hook<'_>> = vec![
                Box::new(move |diff| postprocess(&store_pp, &drive_pp, diff)),
                Box::new(move |diff| {
                    *paths_out = project_paths(&store_paths, &drive_paths, diff)?;
                    Ok(())
                }),
            ];

            self.engine.partial_sync(&job.drive_id, &mut hooks).await?;
        }

        trace!(
            "Partial sync finished: {}: {} added, {} changed, {} removed",
            job.drive_id,
            paths.added.len(),
            paths.changed.len(),
            paths.removed.len()
        );

        let scans = scan_tasks(job, &paths);
        let count = scans.len();
        if count > 0 {
            self.processor.submit(scans).map_err(SyncError::Other)?;
        }

        Ok(count)
    }
}

/// One scan per unique containing directory, rewritten and filtered.
fn scan_tasks(job: &SyncJob, paths: &Paths) -> Vec<Scan> {
    let mut folders = PathSet::new();

    for path in paths
        .added
        .iter()
        .chain(paths.changed.iter())
        .chain(paths.removed.iter())
    {
        let folder = dir_name(&job.rewriter.rewrite(path));
        if !job.filterer.is_allowed(&folder) {
            continue;
        }

        folders.push(folder);
    }

    let now = Utc::now();
    folders
        .into_paths()
        .into_iter()
        .map(|folder| Scan {
            folder,
            priority: job.priority,
            time: now,
        })
        .collect()
}

/// The config surface takes classic five-field cron expressions; the parser
/// wants a seconds column, so one is prepended.
fn parse_cron(expression: &str) -> Result<cron::Schedule, AutoscanError> {
    let expression = expression.trim();
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_owned()
    };

    normalized
        .parse()
        .map_err(|err| AutoscanError::Config(format!("invalid cron {expression:?}: {err}")))
}
