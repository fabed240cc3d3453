//! Stability checking module for verifying files are not being written to.
//!
//! Before a watched arrival is dispatched, we verify it's stable: openable, non-empty,
//! and the same size across two checks separated by the stability interval.

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;

/// Result of a stability check on a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityResult {
    /// File size remained unchanged during the stability window.
    Stable,
    /// File size changed during the stability window.
    Unstable {
        /// Size when first checked.
        initial_size: u64,
        /// Size after waiting.
        current_size: u64,
    },
    /// File has no content yet.
    Empty,
    /// File exists but cannot be opened (a writer holds it).
    Locked,
    /// File is gone.
    Vanished,
}

impl StabilityResult {
    /// Whether the pending entry should be dropped without dispatch.
    pub fn is_gone(&self) -> bool {
        matches!(self, StabilityResult::Vanished)
    }
}

async fn probe_size(path: &Path) -> Result<u64, StabilityResult> {
    match tokio::fs::File::open(path).await {
        Ok(file) => file
            .metadata()
            .await
            .map(|m| m.len())
            .map_err(|_| StabilityResult::Locked),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(StabilityResult::Vanished),
        Err(_) => Err(StabilityResult::Locked),
    }
}

/// Check if a file is stable by comparing its size before and after `interval`.
pub async fn check_stability(path: &Path, interval: Duration) -> StabilityResult {
    let initial_size = match probe_size(path).await {
        Ok(0) => return StabilityResult::Empty,
        Ok(size) => size,
        Err(result) => return result,
    };

    sleep(interval).await;

    match probe_size(path).await {
        Ok(current_size) => compare_sizes(initial_size, current_size),
        Err(result) => result,
    }
}

/// Compare two file sizes and return the appropriate StabilityResult.
///
/// This is a pure function extracted for property testing.
#[inline]
pub fn compare_sizes(initial_size: u64, current_size: u64) -> StabilityResult {
    if initial_size == current_size {
        StabilityResult::Stable
    } else {
        StabilityResult::Unstable {
            initial_size,
            current_size,
        }
    }
}
