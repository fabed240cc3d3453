//! Peak measurement module
//!
//! Builds the ffmpeg `volumedetect` analysis pass for one audio stream and parses the
//! reported `max_volume` from its diagnostic output.

use regex::Regex;
use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

static MAX_VOLUME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)max_volume:\s*([-+]?inf|[-+]?\d+(?:\.\d+)?)\s*dB")
        .expect("max_volume pattern is a valid regex")
});

/// Error type for peak measurement
#[derive(Debug, Error)]
pub enum MeasureError {
    /// ffmpeg exited with a failure status
    #[error("volumedetect failed: {0}")]
    Failed(String),

    /// ffmpeg ran but reported no max_volume reading
    #[error("no max_volume reading in ffmpeg output")]
    NoReading,

    /// The stream is silent (`-inf dB`), no gain can be derived
    #[error("audio stream has no signal")]
    NoSignal,

    /// Analysis did not finish in time
    #[error("volumedetect timed out after {0:?}")]
    Timeout(Duration),

    /// IO error while running ffmpeg
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Measured maximum sample peak of one stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PeakLevel {
    /// Peak in dBFS
    Dbfs(f64),
    /// Silence or an undetectable signal (`-inf dB`)
    NoSignal,
}

/// Build the analysis command for the stream at absolute index `abs_index`
pub fn build_volumedetect_command(src: &Path, abs_index: u32, threads: u32) -> Command {
    let mut cmd = Command::new("ffmpeg");

    cmd.args(["-hide_banner", "-threads"])
        .arg(threads.max(1).to_string())
        .arg("-y")
        .arg("-i")
        .arg(src);

    cmd.arg("-map").arg(format!("0:{}", abs_index));
    cmd.args(["-af", "volumedetect", "-f", "null", "-"]);

    cmd
}

/// Parse the last `max_volume` reading from ffmpeg diagnostic text
///
/// Returns `None` when the text carries no reading.
pub fn parse_max_volume(text: &str) -> Option<PeakLevel> {
    let value = MAX_VOLUME_RE.captures_iter(text).last()?.get(1)?.as_str();

    if value.to_ascii_lowercase().ends_with("inf") {
        return Some(PeakLevel::NoSignal);
    }
    value.parse::<f64>().ok().map(PeakLevel::Dbfs)
}
