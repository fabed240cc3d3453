//! Publisher module for swapping a finished temporary output over the original.
//!
//! Each attempt runs: remove stale backup (or pick a unique backup name), rename
//! original -> backup, rename temp -> original, then best-effort delete of the backup.
//! If the second rename fails the original is restored from the backup before the
//! attempt is retried, so the original path is never left empty by a failed swap.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SwapConfig;

/// Marker inserted before the extension of in-progress outputs.
pub const TEMP_MARKER: &str = ".normalised.tmp";

/// Suffix appended to the full file name of the backup.
pub const BACKUP_SUFFIX: &str = ".bak";

/// Upper bound on a single backoff delay.
pub const MAX_SWAP_DELAY: Duration = Duration::from_secs(60);

/// Errors that can occur while publishing.
#[derive(Debug, Error)]
pub enum SwapError {
    /// The temporary output disappeared, nothing left to publish.
    #[error("Temporary output missing: {}", .0.display())]
    TempMissing(PathBuf),

    /// The original is gone but a backup exists; refusing to touch the backup.
    #[error("Original missing while backup exists at {}", .0.display())]
    OriginalMissing(PathBuf),

    /// Every attempt failed; original and temp are both intact.
    #[error("Swap failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: io::Error,
    },

    /// The original was moved aside and could not be moved back.
    #[error("Could not restore original from backup {}: {source}", .backup.display())]
    RestoreFailed {
        backup: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: f64,
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based), capped at
    /// [`MAX_SWAP_DELAY`].
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.factor.max(1.0).powi(exp);
        if !secs.is_finite() || secs >= MAX_SWAP_DELAY.as_secs_f64() {
            return MAX_SWAP_DELAY;
        }
        Duration::from_secs_f64(secs)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&SwapConfig::default())
    }
}

impl From<&SwapConfig> for RetryPolicy {
    fn from(cfg: &SwapConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            factor: cfg.backoff_factor,
        }
    }
}

/// Result of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Backup that could not be deleted after the swap.
    pub retained_backup: Option<PathBuf>,
    /// Attempt on which the swap succeeded (1-based).
    pub attempts: u32,
}

/// Filesystem operations used by the publisher.
pub trait SwapFs {
    fn exists(&self, path: &Path) -> bool;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
}

/// The real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealFs;

impl SwapFs for RealFs {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }
}

/// `/dir/film.mkv` -> `/dir/film.normalised.tmp.mkv`
pub fn temp_output_path(original: &Path) -> PathBuf {
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match original.extension() {
        Some(ext) => format!("{}{}.{}", stem, TEMP_MARKER, ext.to_string_lossy()),
        None => format!("{}{}", stem, TEMP_MARKER),
    };
    original.with_file_name(name)
}

/// `/dir/film.mkv` -> `/dir/film.mkv.bak`
pub fn backup_path(original: &Path) -> PathBuf {
    let mut backup = original.as_os_str().to_owned();
    backup.push(BACKUP_SUFFIX);
    PathBuf::from(backup)
}

/// Generates a fallback backup path by appending Unix epoch seconds.
///
/// Used when a stale backup at the fixed path cannot be removed.
pub fn unique_backup_path(original: &Path) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut backup = backup_path(original).into_os_string();
    backup.push(format!(".{}", timestamp));
    PathBuf::from(backup)
}

/// True for in-progress outputs (ours or orphaned by an interrupted run).
pub fn is_temp_artifact(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().contains(TEMP_MARKER))
        .unwrap_or(false)
}

enum AttemptError {
    /// Nothing changed on disk; safe to retry.
    Transient(io::Error),
    /// The original now lives only at the backup path.
    Fatal(SwapError),
}

fn swap_once(
    fs: &dyn SwapFs,
    original: &Path,
    tmp: &Path,
    backup: &Path,
) -> Result<(), AttemptError> {
    fs.rename(original, backup)
        .map_err(AttemptError::Transient)?;

    if let Err(e) = fs.rename(tmp, original) {
        if let Err(restore_err) = fs.rename(backup, original) {
            return Err(AttemptError::Fatal(SwapError::RestoreFailed {
                backup: backup.to_path_buf(),
                source: restore_err,
            }));
        }
        return Err(AttemptError::Transient(e));
    }

    Ok(())
}

/// Publishes `tmp` over `original` on the real filesystem, sleeping between attempts.
pub fn publish(original: &Path, tmp: &Path, policy: &RetryPolicy) -> Result<PublishOutcome, SwapError> {
    publish_with(&RealFs, original, tmp, policy, &mut std::thread::sleep)
}

/// Publishes with injectable filesystem and sleep.
pub fn publish_with(
    fs: &dyn SwapFs,
    original: &Path,
    tmp: &Path,
    policy: &RetryPolicy,
    sleep: &mut dyn FnMut(Duration),
) -> Result<PublishOutcome, SwapError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut backup = backup_path(original);

    let mut attempt = 0;
    loop {
        attempt += 1;
        if !fs.exists(tmp) {
            return Err(SwapError::TempMissing(tmp.to_path_buf()));
        }

        if fs.exists(&backup) {
            if !fs.exists(original) {
                return Err(SwapError::OriginalMissing(backup));
            }
            if let Err(e) = fs.remove_file(&backup) {
                let unique = unique_backup_path(original);
                debug!(stale = %backup.display(), fallback = %unique.display(), error = %e,
                    "stale backup not removable, using unique backup name");
                backup = unique;
            }
        }

        match swap_once(fs, original, tmp, &backup) {
            Ok(()) => {
                let retained_backup = match fs.remove_file(&backup) {
                    Ok(()) => None,
                    Err(e) => {
                        info!(backup = %backup.display(), error = %e,
                            "backup retained (could not auto-delete)");
                        Some(backup)
                    }
                };
                return Ok(PublishOutcome {
                    retained_backup,
                    attempts: attempt,
                });
            }
            Err(AttemptError::Fatal(e)) => return Err(e),
            Err(AttemptError::Transient(e)) => {
                if !fs.exists(tmp) {
                    return Err(SwapError::TempMissing(tmp.to_path_buf()));
                }
                if attempt >= max_attempts {
                    warn!(original = %original.display(), attempts = attempt, error = %e,
                        "swap failed, temporary output retained");
                    return Err(SwapError::Exhausted {
                        attempts: attempt,
                        source: e,
                    });
                }
                let delay = policy.delay_after(attempt);
                debug!(attempt, ?delay, error = %e, "swap attempt failed, backing off");
                sleep(delay);
            }
        }
    }
}
