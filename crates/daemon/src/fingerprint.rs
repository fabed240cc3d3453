//! Cheap file identity: the stat-only signature and the sampled quick fingerprint.
//!
//! The signature (`<size>-<mtime ns>`) detects any touch of a file for the cost of a stat
//! call. The quick fingerprint hashes three bounded blocks (head, middle, tail) with
//! SHA-256 and keeps the first 32 hex characters, so multi-gigabyte files are identified
//! by reading at most three blocks.

use sha2::{Digest, Sha256};
use std::fs::{File, Metadata};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Default sampled block size (4 MiB).
pub const DEFAULT_BLOCK_BYTES: u64 = 4 * 1024 * 1024;

/// Number of hex characters kept from the digest.
pub const FINGERPRINT_HEX_LEN: usize = 32;

/// A byte range `[start, start + len)` read into the fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleRange {
    pub start: u64,
    pub len: u64,
}

/// Builds the signature string from already-fetched metadata.
pub fn signature_from_metadata(metadata: &Metadata) -> String {
    let mtime_ns = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{}-{}", metadata.len(), mtime_ns)
}

/// Stats `path` and returns its signature.
pub fn file_signature(path: &Path) -> io::Result<String> {
    let metadata = std::fs::metadata(path)?;
    Ok(signature_from_metadata(&metadata))
}

/// Computes the head/middle/tail ranges for a file of `size` bytes.
///
/// Ranges are clamped to the file and may overlap on files smaller than three blocks.
pub fn sample_ranges(size: u64, block_bytes: u64) -> [SampleRange; 3] {
    let block = block_bytes.max(1);

    let head = SampleRange {
        start: 0,
        len: block.min(size),
    };

    let mid_start = (size / 2).saturating_sub(block / 2);
    let middle = SampleRange {
        start: mid_start,
        len: block.min(size - mid_start),
    };

    let tail_start = size.saturating_sub(block);
    let tail = SampleRange {
        start: tail_start,
        len: block.min(size - tail_start),
    };

    [head, middle, tail]
}

/// Hashes the three sampled blocks of `path`.
///
/// Empty files fingerprint to 32 zeros.
pub fn quick_fingerprint(path: &Path, block_bytes: u64) -> io::Result<String> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    if size == 0 {
        return Ok("0".repeat(FINGERPRINT_HEX_LEN));
    }

    let mut hasher = Sha256::new();
    let mut buf = Vec::new();
    for range in sample_ranges(size, block_bytes) {
        file.seek(SeekFrom::Start(range.start))?;
        buf.clear();
        (&mut file).take(range.len).read_to_end(&mut buf)?;
        hasher.update(&buf);
    }

    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(FINGERPRINT_HEX_LEN);
    Ok(digest)
}
