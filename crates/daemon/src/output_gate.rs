//! Output Gate Module
//!
//! Post-transcode validation ensuring the output exists and is large enough to be a
//! plausible media file rather than a truncated or header-only write.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Result of the output gate check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutputGateResult {
    /// Output is plausible
    Accept,
    /// Output is missing or too small
    Reject { output_bytes: u64, min_bytes: u64 },
}

/// Check if an output of `output_bytes` passes the gate.
///
/// Returns `Reject` if `output_bytes <= min_bytes`, otherwise `Accept`.
pub fn check_output_size(output_bytes: u64, min_bytes: u64) -> OutputGateResult {
    if output_bytes > min_bytes {
        OutputGateResult::Accept
    } else {
        OutputGateResult::Reject {
            output_bytes,
            min_bytes,
        }
    }
}

/// Stat `path` and run the gate; a missing file is rejected as zero bytes.
pub fn inspect_output(path: &Path, min_bytes: u64) -> OutputGateResult {
    let output_bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    check_output_size(output_bytes, min_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    // Property: an output is accepted exactly when it exceeds the minimum.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_output_gate_threshold(output_bytes: u64, min_bytes: u64) {
            match check_output_size(output_bytes, min_bytes) {
                OutputGateResult::Accept => prop_assert!(output_bytes > min_bytes),
                OutputGateResult::Reject { output_bytes: out, min_bytes: min } => {
                    prop_assert!(output_bytes <= min_bytes);
                    prop_assert_eq!(out, output_bytes);
                    prop_assert_eq!(min, min_bytes);
                }
            }
        }
    }

    #[test]
    fn test_inspect_output_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("film.normalised.tmp.mkv");

        assert_eq!(
            inspect_output(&path, 1024),
            OutputGateResult::Reject { output_bytes: 0, min_bytes: 1024 }
        );

        std::fs::write(&path, vec![0u8; 100]).unwrap();
        assert!(matches!(inspect_output(&path, 1024), OutputGateResult::Reject { output_bytes: 100, .. }));

        std::fs::write(&path, vec![0u8; 2048]).unwrap();
        assert_eq!(inspect_output(&path, 1024), OutputGateResult::Accept);
    }
}
