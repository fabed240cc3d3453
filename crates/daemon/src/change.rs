//! Fast change detection.
//!
//! A candidate is checked in increasing order of cost: extension and sample rules,
//! then the stat-only signature against the store, and only when that differs the
//! sampled quick fingerprint. A fingerprint match means a metadata-only touch; the
//! stored signature is refreshed so the next run is stat-only again.

use std::io;
use std::path::Path;
use tracing::{debug, warn};

use crate::config::{LibraryConfig, SamplesConfig};
use crate::fingerprint::{quick_fingerprint, signature_from_metadata};
use crate::scan::is_video_file;
use crate::state::FingerprintStore;

/// Why a file was left out before any store lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExclusionReason {
    NotVideo,
    SampleName,
    BelowMinimumSize { size: u64, min_bytes: u64 },
    Missing,
}

/// Outcome of change detection for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeDecision {
    Excluded(ExclusionReason),
    /// No record in the store.
    New,
    /// Signature matches the record.
    Unchanged,
    /// Signature drifted but content matches; the record was updated.
    SignatureRefreshed,
    /// Content differs from the record.
    Changed,
}

impl ChangeDecision {
    pub fn needs_processing(&self) -> bool {
        matches!(self, ChangeDecision::New | ChangeDecision::Changed)
    }
}

/// Rules applied before the store is consulted.
#[derive(Debug, Clone)]
pub struct CandidatePolicy {
    pub video_extensions: Vec<String>,
    pub samples: SamplesConfig,
    pub block_bytes: u64,
}

impl CandidatePolicy {
    pub fn new(library: &LibraryConfig, samples: &SamplesConfig, block_bytes: u64) -> Self {
        Self {
            video_extensions: library.video_extensions.clone(),
            samples: samples.clone(),
            block_bytes,
        }
    }

    /// True if the file name carries a sample token (case-insensitive).
    pub fn has_sample_name(&self, path: &Path) -> bool {
        if !self.samples.enabled {
            return false;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        self.samples
            .name_tokens
            .iter()
            .any(|token| name.contains(&token.to_lowercase()))
    }

    fn exclusion(&self, path: &Path, size: u64) -> Option<ExclusionReason> {
        if !is_video_file(path, &self.video_extensions) {
            return Some(ExclusionReason::NotVideo);
        }
        if !self.samples.enabled {
            return None;
        }
        if self.has_sample_name(path) {
            return Some(ExclusionReason::SampleName);
        }
        if size < self.samples.min_bytes {
            return Some(ExclusionReason::BelowMinimumSize {
                size,
                min_bytes: self.samples.min_bytes,
            });
        }
        None
    }
}

/// Decides whether `path` needs processing, hashing with `fingerprint` only on drift.
pub fn assess_with<F>(
    path: &Path,
    store: &FingerprintStore,
    policy: &CandidatePolicy,
    fingerprint: F,
) -> ChangeDecision
where
    F: FnOnce(&Path) -> io::Result<String>,
{
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return ChangeDecision::Excluded(ExclusionReason::Missing),
    };

    if let Some(reason) = policy.exclusion(path, metadata.len()) {
        return ChangeDecision::Excluded(reason);
    }

    let Some(record) = store.get(path) else {
        return ChangeDecision::New;
    };

    let signature = signature_from_metadata(&metadata);
    if record.signature == signature {
        return ChangeDecision::Unchanged;
    }

    let current = match fingerprint(path) {
        Ok(fp) => fp,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "quick fingerprint failed, treating as changed");
            return ChangeDecision::Changed;
        }
    };

    if current != record.quick_fingerprint {
        return ChangeDecision::Changed;
    }

    if let Err(e) = store.refresh_signature(path, signature) {
        warn!(path = %path.display(), error = %e, "could not save refreshed signature");
    }
    ChangeDecision::SignatureRefreshed
}

/// Decides whether `path` needs processing.
pub fn assess(path: &Path, store: &FingerprintStore, policy: &CandidatePolicy) -> ChangeDecision {
    assess_with(path, store, policy, |p| quick_fingerprint(p, policy.block_bytes))
}

/// `true` when the file is new or its content changed.
pub fn should_process(path: &Path, store: &FingerprintStore, policy: &CandidatePolicy) -> bool {
    assess(path, store, policy).needs_processing()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::file_signature;
    use crate::state::ProcessingRecord;
    use std::fs;
    use std::path::PathBuf;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    const BLOCK: u64 = 16;

    fn policy(min_bytes: u64) -> CandidatePolicy {
        CandidatePolicy {
            video_extensions: LibraryConfig::default().video_extensions,
            samples: SamplesConfig {
                min_bytes,
                ..SamplesConfig::default()
            },
            block_bytes: BLOCK,
        }
    }

    fn setup(name: &str, bytes: &[u8]) -> (TempDir, FingerprintStore, PathBuf) {
        let dir = TempDir::new().unwrap();
        let store = FingerprintStore::load(dir.path().join("state.json"));
        let path = dir.path().join(name);
        fs::write(&path, bytes).unwrap();
        (dir, store, path)
    }

    fn record_current(store: &FingerprintStore, path: &Path) {
        let record = ProcessingRecord::new(
            file_signature(path).unwrap(),
            quick_fingerprint(path, BLOCK).unwrap(),
        );
        store.upsert(path, record).unwrap();
    }

    fn touch_mtime(path: &Path) {
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();
    }

    fn no_read(_: &Path) -> io::Result<String> {
        panic!("content must not be read when the signature matches");
    }

    #[test]
    fn test_new_file_needs_processing() {
        let (_dir, store, path) = setup("film.mkv", &[7u8; 200]);
        assert_eq!(assess(&path, &store, &policy(10)), ChangeDecision::New);
        assert!(should_process(&path, &store, &policy(10)));
    }

    #[test]
    fn test_matching_signature_skips_without_reading() {
        let (_dir, store, path) = setup("film.mkv", &[7u8; 200]);
        record_current(&store, &path);

        let decision = assess_with(&path, &store, &policy(10), no_read);
        assert_eq!(decision, ChangeDecision::Unchanged);
    }

    #[test]
    fn test_metadata_touch_refreshes_signature() {
        let (_dir, store, path) = setup("film.mkv", &[7u8; 200]);
        record_current(&store, &path);
        let old_sig = store.get(&path).unwrap().signature;

        touch_mtime(&path);

        assert_eq!(
            assess(&path, &store, &policy(10)),
            ChangeDecision::SignatureRefreshed
        );
        let refreshed = store.get(&path).unwrap();
        assert_ne!(refreshed.signature, old_sig);
        assert_eq!(refreshed.signature, file_signature(&path).unwrap());

        // Next pass is stat-only again.
        assert_eq!(
            assess_with(&path, &store, &policy(10), no_read),
            ChangeDecision::Unchanged
        );
    }

    #[test]
    fn test_content_change_needs_processing() {
        let (_dir, store, path) = setup("film.mkv", &[7u8; 200]);
        record_current(&store, &path);

        fs::write(&path, [9u8; 300]).unwrap();

        assert_eq!(assess(&path, &store, &policy(10)), ChangeDecision::Changed);
    }

    #[test]
    fn test_small_sample_excluded_regardless_of_content() {
        let (_dir, store, path) = setup("Movie.Sample.mkv", &[1u8; 64]);

        let decision = assess_with(&path, &store, &policy(1024), no_read);

        assert_eq!(decision, ChangeDecision::Excluded(ExclusionReason::SampleName));
        assert!(!decision.needs_processing());
        assert!(store.is_empty());
    }

    #[test]
    fn test_undersized_and_non_video_excluded() {
        let (dir, store, path) = setup("film.mkv", &[1u8; 64]);
        assert_eq!(
            assess(&path, &store, &policy(1024)),
            ChangeDecision::Excluded(ExclusionReason::BelowMinimumSize {
                size: 64,
                min_bytes: 1024
            })
        );

        let srt = dir.path().join("film.srt");
        fs::write(&srt, [1u8; 2048]).unwrap();
        assert_eq!(
            assess(&srt, &store, &policy(10)),
            ChangeDecision::Excluded(ExclusionReason::NotVideo)
        );

        assert_eq!(
            assess(&dir.path().join("gone.mkv"), &store, &policy(10)),
            ChangeDecision::Excluded(ExclusionReason::Missing)
        );
    }

    #[test]
    fn test_sample_rules_can_be_disabled() {
        let (_dir, store, path) = setup("trailer.mkv", &[1u8; 64]);
        let mut p = policy(1024);
        p.samples.enabled = false;

        assert!(!p.has_sample_name(&path));
        assert_eq!(assess(&path, &store, &p), ChangeDecision::New);
    }
}
