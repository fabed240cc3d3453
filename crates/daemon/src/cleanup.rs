//! Orphan cleaner: removes temporary outputs left behind by interrupted runs.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::publish::is_temp_artifact;

/// What a sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    /// Orphans younger than the age limit.
    pub kept: usize,
    pub failed: usize,
}

/// Deletes every temporary artifact under `roots`.
///
/// With `max_age` set, only artifacts whose mtime is older than it are removed;
/// `None` removes all of them. Missing roots are skipped.
pub fn cleanup_orphans(roots: &[PathBuf], max_age: Option<Duration>) -> CleanupReport {
    let mut report = CleanupReport::default();
    let now = SystemTime::now();

    for root in roots.iter().filter(|r| r.is_dir()) {
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() || !is_temp_artifact(entry.path()) {
                continue;
            }

            if let Some(max_age) = max_age {
                let age = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .and_then(|mtime| now.duration_since(mtime).ok())
                    .unwrap_or_default();
                if age < max_age {
                    report.kept += 1;
                    continue;
                }
            }

            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    info!(path = %entry.path().display(), "removed orphaned temporary output");
                    report.removed.push(entry.into_path());
                }
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "could not remove orphan");
                    report.failed += 1;
                }
            }
        }
    }

    report
}
