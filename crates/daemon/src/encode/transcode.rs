//! Transcode module
//!
//! Builds the ffmpeg command that rewrites a file with gain applied to one audio
//! output position, and drives the single compatibility fallback that drops subtitle
//! streams when ffmpeg reports a known subtitle/container failure.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::output_gate::{inspect_output, OutputGateResult};
use crate::plan::{AudioDirective, NormalizationPlan};
use crate::tools::MediaTools;

/// Lowercased fragments of ffmpeg diagnostics that indicate a subtitle or container
/// incompatibility fixable by dropping subtitle streams.
pub const COMPATIBILITY_SIGNATURES: &[&str] = &[
    "subtitle",
    "srt",
    "binding an input stream",
    "codec 0 is not supported",
    "could not write header",
    "function not implemented",
    "incorrect codec parameters",
];

const DIAGNOSTIC_KEYWORDS: &[&str] = &[
    "error",
    "invalid",
    "cannot",
    "failed",
    "encoder",
    "decoder",
    "permission",
    "not supported",
    "could not",
];

/// Error type for transcode operations
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// ffmpeg exited with a failure status
    #[error("ffmpeg failed (exit code {code:?}): {diagnostic}")]
    Failed {
        code: Option<i32>,
        /// Summary of the meaningful stderr lines
        diagnostic: String,
        /// The diagnostic matched a compatibility signature
        incompatible: bool,
    },

    /// ffmpeg did not finish in time
    #[error("ffmpeg timed out after {0:?}")]
    Timeout(Duration),

    /// ffmpeg reported success but the output is missing or implausibly small
    #[error("invalid output: {0}")]
    InvalidOutput(String),

    /// IO error while running ffmpeg
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TranscodeError {
    /// Builds a `Failed` error from the exit code and full stderr
    pub fn from_failure(code: Option<i32>, stderr: &str) -> Self {
        TranscodeError::Failed {
            code,
            diagnostic: summarize_diagnostic(stderr),
            incompatible: matches_compatibility_signature(stderr),
        }
    }

    /// Whether a later run may succeed without any change to the file
    pub fn is_retryable(&self) -> bool {
        matches!(self, TranscodeError::Timeout(_) | TranscodeError::Io(_))
    }

    /// Whether dropping subtitle streams may fix the failure
    pub fn is_compatibility_failure(&self) -> bool {
        matches!(self, TranscodeError::Failed { incompatible: true, .. })
    }
}

/// One transcode attempt
#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    pub source: PathBuf,
    pub output: PathBuf,
    pub plan: NormalizationPlan,
    /// Relocate the index for progressive playback on mp4-family containers
    pub faststart: bool,
}

/// Result of a successful transcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscodeOutcome {
    /// The fallback without subtitles was used
    pub subtitles_dropped: bool,
}

fn extension_lowercase(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Build the ffmpeg transcode command
///
/// Only the main audio stream is re-encoded; the gain filter targets its audio-order
/// position. Everything else is stream-copied.
pub fn build_transcode_command(request: &TranscodeRequest, threads: u32) -> Command {
    let plan = &request.plan;
    let mut cmd = Command::new("ffmpeg");

    cmd.args(["-hide_banner", "-threads"])
        .arg(threads.max(1).to_string())
        .arg("-y")
        .arg("-i")
        .arg(&request.source);

    if plan.include_subtitles {
        cmd.args(["-map", "0"]);
    } else {
        cmd.args(["-map", "0:v?", "-map", "0:a"]);
    }

    cmd.arg(format!("-filter:a:{}", plan.main_audio_order))
        .arg(plan.gain_filter());

    cmd.args(["-c:v", "copy", "-c:d", "copy"]);
    if plan.include_subtitles {
        cmd.args(["-c:s", "copy"]);
    }

    for (order, directive) in plan.audio.iter().enumerate() {
        match directive {
            AudioDirective::Copy => {
                cmd.arg(format!("-c:a:{}", order)).arg("copy");
            }
            AudioDirective::Encode(choice) => {
                cmd.arg(format!("-c:a:{}", order)).arg(choice.encoder);
                if let Some(bitrate) = &choice.bitrate {
                    cmd.arg(format!("-b:a:{}", order)).arg(bitrate);
                }
            }
        }
    }

    let ext = extension_lowercase(&request.output);
    if ext == "m4v" {
        cmd.args(["-f", "mp4"]);
    }
    if request.faststart && matches!(ext.as_str(), "mp4" | "m4v" | "mov") {
        cmd.args(["-movflags", "+faststart"]);
    }

    cmd.arg("-nostats").arg(&request.output);

    cmd
}

/// True if the diagnostic summary of `stderr` carries a known compatibility
/// signature (case-insensitive)
///
/// Only the summarized error lines are searched. The input/output stream listing
/// names subtitle codecs on every file that has them and says nothing about why
/// ffmpeg failed.
pub fn matches_compatibility_signature(stderr: &str) -> bool {
    let summary = summarize_diagnostic(stderr).to_lowercase();
    COMPATIBILITY_SIGNATURES.iter().any(|sig| summary.contains(sig))
}

/// Lines ffmpeg prints to describe its inputs and outputs rather than a failure
fn is_stream_listing(line: &str) -> bool {
    const PREFIXES: &[&str] = &[
        "Input #",
        "Output #",
        "Stream #",
        "Duration:",
        "Metadata:",
        "Chapters:",
        "Chapter #",
    ];
    if PREFIXES.iter().any(|p| line.starts_with(p)) {
        return true;
    }
    // Container and stream tags: "title           : English SDH"
    match line.split_once(':') {
        Some((key, _)) => {
            let name = key.trim_end();
            name.len() < key.len() && !name.is_empty() && !name.contains(char::is_whitespace)
        }
        None => false,
    }
}

/// Reduce ffmpeg stderr to the lines worth logging
///
/// Stream listing lines are ignored. Of the rest, the last three lines carrying an
/// error keyword, else the last five lines.
pub fn summarize_diagnostic(stderr: &str) -> String {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !is_stream_listing(l))
        .collect();

    let meaningful: Vec<&str> = lines
        .iter()
        .copied()
        .filter(|l| {
            let lower = l.to_lowercase();
            !lower.contains("conversion failed")
                && DIAGNOSTIC_KEYWORDS.iter().any(|k| lower.contains(k))
        })
        .collect();

    let chosen = if meaningful.is_empty() {
        &lines[lines.len().saturating_sub(5)..]
    } else {
        &meaningful[meaningful.len().saturating_sub(3)..]
    };
    chosen.join(" | ")
}

/// Run the transcode, retrying once without subtitles on a compatibility failure
///
/// A failed attempt's partial output is deleted before the retry. The final output is
/// checked against `min_output_bytes`.
pub async fn transcode_with_fallback(
    tools: &dyn MediaTools,
    request: &TranscodeRequest,
    min_output_bytes: u64,
) -> Result<TranscodeOutcome, TranscodeError> {
    let mut subtitles_dropped = false;

    if let Err(e) = tools.transcode(request).await {
        if !(e.is_compatibility_failure() && request.plan.include_subtitles) {
            return Err(e);
        }

        warn!(error = %e, "transcode incompatible, retrying without subtitles");
        remove_partial_output(&request.output);

        let retry = TranscodeRequest {
            plan: request.plan.without_subtitles(),
            ..request.clone()
        };
        tools.transcode(&retry).await?;
        subtitles_dropped = true;
    }

    match inspect_output(&request.output, min_output_bytes) {
        OutputGateResult::Accept => Ok(TranscodeOutcome { subtitles_dropped }),
        OutputGateResult::Reject {
            output_bytes,
            min_bytes,
        } => Err(TranscodeError::InvalidOutput(format!(
            "{} is {} bytes (minimum {})",
            request.output.display(),
            output_bytes,
            min_bytes
        ))),
    }
}

/// Best-effort removal of a partial output
pub fn remove_partial_output(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "could not remove partial output"),
    }
}
