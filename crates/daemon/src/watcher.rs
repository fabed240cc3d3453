//! Filesystem watcher for library roots.
//!
//! Arrivals (file creation, rename into the tree) are captured from `notify` and held
//! in a [`PendingSet`] keyed by path with their first-seen time. A separate sweep task
//! checks entries older than the minimum wait for write-stability and dispatches the
//! stable ones. Stability checks sleep, so they never run on the intake task.
//!
//! Per path: Unseen -> Pending -> Stable -> Dispatched, or Pending -> Discarded when
//! the file vanishes or stays pending longer than `max_pending`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::change::CandidatePolicy;
use crate::config::WatcherConfig;
use crate::publish::is_temp_artifact;
use crate::scan::is_video_file;
use crate::stability::{check_stability, StabilityResult};

/// Capacity of the channel bridging `notify` callbacks into tokio.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Error type for watcher setup
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to create filesystem watcher: {0}")]
    Create(#[source] notify::Error),

    #[error("failed to watch {}: {source}", .root.display())]
    Watch {
        root: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("no library root could be watched")]
    NoRoots,
}

/// Watch timing, resolved from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherTiming {
    pub sweep_interval: Duration,
    pub min_wait: Duration,
    pub stability_interval: Duration,
    pub max_pending: Duration,
}

impl From<&WatcherConfig> for WatcherTiming {
    fn from(cfg: &WatcherConfig) -> Self {
        Self {
            sweep_interval: Duration::from_secs(cfg.sweep_interval_secs.max(1)),
            min_wait: Duration::from_secs(cfg.min_wait_secs),
            stability_interval: Duration::from_secs(cfg.stability_interval_secs),
            max_pending: Duration::from_secs(cfg.max_pending_secs),
        }
    }
}

/// Paths awaiting a stability verdict, with the time they were first seen.
#[derive(Debug, Default)]
pub struct PendingSet {
    entries: HashMap<PathBuf, Instant>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an arrival. A path already pending keeps its first-seen time.
    ///
    /// Returns `true` if the path was not pending before.
    pub fn observe(&mut self, path: PathBuf, now: Instant) -> bool {
        let mut inserted = false;
        self.entries.entry(path).or_insert_with(|| {
            inserted = true;
            now
        });
        inserted
    }

    /// Paths pending for at least `min_wait`, oldest first.
    pub fn due(&self, now: Instant, min_wait: Duration) -> Vec<PathBuf> {
        let mut due: Vec<(&PathBuf, &Instant)> = self
            .entries
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) >= min_wait)
            .collect();
        due.sort_by_key(|(_, seen)| **seen);
        due.into_iter().map(|(p, _)| p.clone()).collect()
    }

    /// Removes a path, returning when it was first seen.
    pub fn resolve(&mut self, path: &Path) -> Option<Instant> {
        self.entries.remove(path)
    }

    /// Drops and returns paths pending for longer than `max_pending`.
    pub fn expire(&mut self, now: Instant, max_pending: Duration) -> Vec<PathBuf> {
        let expired: Vec<PathBuf> = self
            .entries
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > max_pending)
            .map(|(p, _)| p.clone())
            .collect();
        for path in &expired {
            self.entries.remove(path);
        }
        expired
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Paths an event brings into the tree: creations and rename destinations.
pub fn arrival_paths(event: &Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(_) => event.paths.clone(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths.clone(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.get(1).cloned().into_iter().collect()
        }
        // Backends that cannot pair renames report each side; keep what exists now.
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => {
            event.paths.iter().filter(|p| p.exists()).cloned().collect()
        }
        _ => Vec::new(),
    }
}

/// Cheap checks applied when an arrival is first seen.
///
/// Size-based sample rules are left to change detection at dispatch, since a file
/// that just appeared is usually still growing.
#[derive(Debug, Clone)]
pub struct ArrivalFilter {
    policy: CandidatePolicy,
}

impl ArrivalFilter {
    pub fn new(policy: CandidatePolicy) -> Self {
        Self { policy }
    }

    pub fn qualifies(&self, path: &Path) -> bool {
        !path.is_dir()
            && is_video_file(path, &self.policy.video_extensions)
            && !is_temp_artifact(path)
            && !self.policy.has_sample_name(path)
    }
}

fn lock(pending: &Mutex<PendingSet>) -> MutexGuard<'_, PendingSet> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Recursive watch over the library roots, bridged into a tokio channel.
pub struct LibraryWatcher {
    /// Dropping the watcher stops event delivery.
    _watcher: RecommendedWatcher,
    events: mpsc::Receiver<Event>,
    roots: Vec<PathBuf>,
}

impl LibraryWatcher {
    /// Starts watching every existing root. Missing roots are warned and skipped.
    pub fn start(roots: &[PathBuf]) -> Result<Self, WatchError> {
        let (tx, events) = mpsc::channel::<Event>(EVENT_CHANNEL_CAPACITY);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if tx.try_send(event).is_err() {
                        warn!("watcher channel full or closed, event dropped");
                    }
                }
                Err(e) => warn!(error = %e, "filesystem watcher error"),
            },
            notify::Config::default(),
        )
        .map_err(WatchError::Create)?;

        let mut watched = Vec::new();
        for root in roots {
            if !root.is_dir() {
                warn!(root = %root.display(), "library root missing, not watched");
                continue;
            }
            watcher
                .watch(root, RecursiveMode::Recursive)
                .map_err(|source| WatchError::Watch {
                    root: root.clone(),
                    source,
                })?;
            watched.push(root.clone());
        }

        if watched.is_empty() {
            return Err(WatchError::NoRoots);
        }

        Ok(Self {
            _watcher: watcher,
            events,
            roots: watched,
        })
    }

    /// Roots actually being watched.
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Runs intake and sweep until `shutdown` flips to true or events stop.
    ///
    /// Stable paths are sent to `dispatch`.
    pub async fn run(
        mut self,
        filter: ArrivalFilter,
        timing: WatcherTiming,
        dispatch: mpsc::Sender<PathBuf>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let pending = Arc::new(Mutex::new(PendingSet::new()));
        let sweeper = tokio::spawn(run_sweeper(
            Arc::clone(&pending),
            timing,
            dispatch,
            shutdown.clone(),
        ));

        for root in &self.roots {
            info!(root = %root.display(), "watching");
        }

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    for path in arrival_paths(&event) {
                        if filter.qualifies(&path) && lock(&pending).observe(path.clone(), Instant::now()) {
                            debug!(path = %path.display(), "arrival pending");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        sweeper.abort();
    }
}

/// Checks due entries every `sweep_interval` and dispatches the stable ones.
pub async fn run_sweeper(
    pending: Arc<Mutex<PendingSet>>,
    timing: WatcherTiming,
    dispatch: mpsc::Sender<PathBuf>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(timing.sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }

        if !sweep(&pending, &timing, &dispatch).await {
            return;
        }
    }
}

/// One sweep pass. Returns `false` once the dispatch channel is closed.
pub async fn sweep(
    pending: &Mutex<PendingSet>,
    timing: &WatcherTiming,
    dispatch: &mpsc::Sender<PathBuf>,
) -> bool {
    let due = {
        let mut set = lock(pending);
        let now = Instant::now();
        for path in set.expire(now, timing.max_pending) {
            warn!(path = %path.display(), "never became stable, discarded");
        }
        set.due(now, timing.min_wait)
    };

    for path in due {
        match check_stability(&path, timing.stability_interval).await {
            StabilityResult::Stable => {
                lock(pending).resolve(&path);
                debug!(path = %path.display(), "stable, dispatching");
                if dispatch.send(path).await.is_err() {
                    return false;
                }
            }
            gone if gone.is_gone() => {
                lock(pending).resolve(&path);
                debug!(path = %path.display(), "vanished while pending");
            }
            other => {
                debug!(path = %path.display(), state = ?other, "not yet stable");
            }
        }
    }
    true
}
