//! Daemon startup and scheduling for the peak normaliser
//!
//! Provides the batch pass (sweep orphans, scan, filter, execute) and the watch loop
//! that feeds stable arrivals into the same bounded executor.

use crate::change::{assess, CandidatePolicy, ChangeDecision};
use crate::cleanup::{cleanup_orphans, CleanupReport};
use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::job_executor::{FileOutcome, JobExecutor, JobSettings};
use crate::plan::PlanError;
use crate::scan::scan_libraries;
use crate::startup::{run_startup_checks, StartupError};
use crate::state::{FingerprintStore, SharedStore};
use crate::tools::{FfmpegTools, MediaTools};
use crate::watcher::{ArrivalFilter, LibraryWatcher, WatchError, WatcherTiming};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Capacity of the queue between the watcher and the dispatcher
const DISPATCH_QUEUE_CAPACITY: usize = 256;

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Codec table could not be resolved
    #[error("Invalid codec policy: {0}")]
    Plan(#[from] PlanError),

    /// Filesystem watcher could not start
    #[error("Watcher error: {0}")]
    Watch(#[from] WatchError),
}

/// Result for one dispatched file
#[derive(Debug)]
pub struct FileResult {
    pub path: PathBuf,
    pub outcome: FileOutcome,
}

/// What a batch pass did
#[derive(Debug, Default)]
pub struct RunSummary {
    pub cleanup: CleanupReport,
    /// Video files found under the roots
    pub scanned: usize,
    /// Left out by extension, sample, or size rules
    pub excluded: usize,
    /// Already recorded with matching content
    pub unchanged: usize,
    /// Skipped because a watcher job already holds the path
    pub in_flight: usize,
    pub results: Vec<FileResult>,
}

impl RunSummary {
    fn count(&self, pred: impl Fn(&FileOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }

    pub fn normalized(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Normalized { .. }))
    }

    pub fn already_normalized(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::AlreadyNormalized { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Failed(_)))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Cancelled))
    }
}

/// Paths currently being worked on
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    paths: Arc<Mutex<HashSet<PathBuf>>>,
}

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims `path`; `None` if it is already claimed.
    pub fn claim(&self, path: &Path) -> Option<InFlightGuard> {
        if !self.lock().insert(path.to_path_buf()) {
            return None;
        }
        Some(InFlightGuard {
            set: self.clone(),
            path: path.to_path_buf(),
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Releases the claim on drop
#[derive(Debug)]
pub struct InFlightGuard {
    set: InFlight,
    path: PathBuf,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.path);
    }
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived concurrency plan
    pub concurrency_plan: ConcurrencyPlan,
    store: SharedStore,
    executor: Arc<JobExecutor>,
    policy: CandidatePolicy,
    in_flight: InFlight,
    shutdown_tx: watch::Sender<bool>,
}

impl Daemon {
    /// Initialize the daemon, running startup checks first
    ///
    /// 1. Run startup checks (configuration, ffprobe, ffmpeg version)
    /// 2. Derive concurrency plan
    /// 3. Load the fingerprint store and build the executor
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Self::new_without_checks(config)
    }

    /// Initialize the daemon without running startup checks
    ///
    /// Useful when ffmpeg is not installed yet or checks were explicitly skipped.
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        let concurrency_plan = derive_plan(&config);
        let tools = FfmpegTools::new(
            concurrency_plan.threads_per_job,
            Duration::from_secs(config.timeouts.subprocess_secs),
        );
        Self::build(config, concurrency_plan, Arc::new(tools))
    }

    /// Initialize the daemon around a given [`MediaTools`] implementation
    pub fn with_tools(config: Config, tools: Arc<dyn MediaTools>) -> Result<Self, DaemonError> {
        let concurrency_plan = derive_plan(&config);
        Self::build(config, concurrency_plan, tools)
    }

    fn build(
        config: Config,
        concurrency_plan: ConcurrencyPlan,
        tools: Arc<dyn MediaTools>,
    ) -> Result<Self, DaemonError> {
        let settings = JobSettings::from_config(&config)?;
        let store: SharedStore = Arc::new(FingerprintStore::load(&config.library.state_file));
        let executor = Arc::new(JobExecutor::new(
            concurrency_plan.workers,
            tools,
            Arc::clone(&store),
            settings,
        ));
        let policy = CandidatePolicy::new(
            &config.library,
            &config.samples,
            config.fingerprint.block_bytes(),
        );
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            workers = concurrency_plan.workers,
            threads_per_job = concurrency_plan.threads_per_job,
            records = store.len(),
            "daemon initialised"
        );

        Ok(Self {
            config,
            concurrency_plan,
            store,
            executor,
            policy,
            in_flight: InFlight::default(),
            shutdown_tx,
        })
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn executor(&self) -> &Arc<JobExecutor> {
        &self.executor
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Stop dispatching. Subprocesses already running finish on their own.
    pub fn shutdown(&self) {
        info!("shutdown requested, no new files will start");
        self.executor.cancel();
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn orphan_max_age(&self) -> Option<Duration> {
        match self.config.cleanup.orphan_max_age_hours {
            0 => None,
            hours => Some(Duration::from_secs(hours.saturating_mul(3600))),
        }
    }

    /// Remove temporary outputs left behind by interrupted runs
    pub async fn sweep_orphans(&self) -> CleanupReport {
        let roots = self.config.library.roots.clone();
        let max_age = self.orphan_max_age();
        match tokio::task::spawn_blocking(move || cleanup_orphans(&roots, max_age)).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "orphan sweep task failed");
                CleanupReport::default()
            }
        }
    }

    /// Scan all roots and run change detection on every video file
    async fn collect_candidates(&self) -> Vec<(PathBuf, ChangeDecision)> {
        let roots = self.config.library.roots.clone();
        let store = Arc::clone(&self.store);
        let policy = self.policy.clone();

        let scanned = tokio::task::spawn_blocking(move || {
            scan_libraries(&roots, &policy.video_extensions)
                .into_iter()
                .map(|candidate| {
                    let decision = assess(&candidate.path, &store, &policy);
                    (candidate.path, decision)
                })
                .collect::<Vec<_>>()
        })
        .await;

        scanned.unwrap_or_else(|e| {
            warn!(error = %e, "scan task failed");
            Vec::new()
        })
    }

    /// One full pass: orphan sweep, scan, change filter, bounded execution
    pub async fn run_batch(&self) -> RunSummary {
        let mut summary = RunSummary {
            cleanup: self.sweep_orphans().await,
            ..RunSummary::default()
        };

        let candidates = self.collect_candidates().await;
        summary.scanned = candidates.len();

        let mut jobs = JoinSet::new();
        for (path, decision) in candidates {
            match decision {
                ChangeDecision::Excluded(reason) => {
                    debug!(path = %path.display(), ?reason, "excluded");
                    summary.excluded += 1;
                }
                ChangeDecision::Unchanged | ChangeDecision::SignatureRefreshed => {
                    summary.unchanged += 1;
                }
                ChangeDecision::New | ChangeDecision::Changed => {
                    let Some(guard) = self.in_flight.claim(&path) else {
                        summary.in_flight += 1;
                        continue;
                    };
                    let executor = Arc::clone(&self.executor);
                    jobs.spawn(async move {
                        let outcome = executor.execute(&path).await;
                        drop(guard);
                        FileResult { path, outcome }
                    });
                }
            }
        }

        info!(
            scanned = summary.scanned,
            queued = jobs.len(),
            excluded = summary.excluded,
            unchanged = summary.unchanged,
            "scan complete"
        );

        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok(result) => summary.results.push(result),
                Err(e) => warn!(error = %e, "job task failed"),
            }
        }

        info!(
            normalised = summary.normalized(),
            already_normalised = summary.already_normalized(),
            failed = summary.failed(),
            cancelled = summary.cancelled(),
            orphans_removed = summary.cleanup.removed.len(),
            "batch complete"
        );

        summary
    }

    /// Watch the roots and normalise stable arrivals until shutdown
    ///
    /// With `initial_scan`, a batch pass runs first; otherwise only the orphan sweep.
    pub async fn run_watch(&self, initial_scan: bool) -> Result<(), DaemonError> {
        if initial_scan {
            self.run_batch().await;
        } else {
            self.sweep_orphans().await;
        }

        let watcher = LibraryWatcher::start(&self.config.library.roots)?;
        let (dispatch_tx, mut dispatch_rx) = mpsc::channel(DISPATCH_QUEUE_CAPACITY);
        let watch_task = tokio::spawn(watcher.run(
            ArrivalFilter::new(self.policy.clone()),
            WatcherTiming::from(&self.config.watcher),
            dispatch_tx,
            self.shutdown_tx.subscribe(),
        ));

        let mut shutdown = self.shutdown_tx.subscribe();
        let mut jobs = JoinSet::new();

        while !*shutdown.borrow() {
            tokio::select! {
                arrival = dispatch_rx.recv() => {
                    let Some(path) = arrival else { break };
                    self.dispatch_arrival(path, &mut jobs);
                }
                Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "job task failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        drop(dispatch_rx);
        if let Err(e) = watch_task.await {
            warn!(error = %e, "watcher task failed");
        }
        while let Some(joined) = jobs.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "job task failed");
            }
        }

        info!("watch stopped");
        Ok(())
    }

    /// Re-check a stable arrival against a fresh store and execute it if needed
    fn dispatch_arrival(&self, path: PathBuf, jobs: &mut JoinSet<()>) {
        let Some(guard) = self.in_flight.claim(&path) else {
            debug!(path = %path.display(), "already in flight");
            return;
        };

        let store = Arc::clone(&self.store);
        let policy = self.policy.clone();
        let executor = Arc::clone(&self.executor);

        jobs.spawn(async move {
            let check_path = path.clone();
            let decision = tokio::task::spawn_blocking(move || {
                // Another process may have run a batch since we last read the store.
                store.reload();
                assess(&check_path, &store, &policy)
            })
            .await;

            match decision {
                Ok(decision) if decision.needs_processing() => {
                    executor.execute(&path).await;
                }
                Ok(decision) => {
                    debug!(path = %path.display(), ?decision, "arrival needs no work");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "change check failed"),
            }
            drop(guard);
        });
    }
}
