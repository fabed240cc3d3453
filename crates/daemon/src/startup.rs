//! Startup checks module
//!
//! Preflight checks run before any file is touched:
//! - ffprobe and ffmpeg are available
//! - ffmpeg version is 4.0 or newer
//! - at least one library root is configured (missing ones are warned)
//! - the codec downgrade table only names known codecs

use crate::config::Config;
use crate::plan::CodecPolicy;
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// Oldest ffmpeg major version whose volumedetect and stream mapping we rely on
pub const MIN_FFMPEG_MAJOR: u32 = 4;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: &'static str, reason: String },

    #[error("FFmpeg version requirement not met: {0}")]
    FfmpegVersion(String),

    #[error("no library roots configured")]
    NoRoots,

    #[error("invalid codec table: {0}")]
    CodecTable(String),
}

/// Run `<tool> -version` and return its stdout
///
/// # Errors
/// Fails when the tool cannot be spawned or exits unsuccessfully.
pub fn check_tool_available(tool: &'static str) -> Result<String, StartupError> {
    let output = Command::new(tool)
        .arg("-version")
        .output()
        .map_err(|e| StartupError::ToolUnavailable {
            tool,
            reason: format!("{} -version failed; is it installed and in PATH? Error: {}", tool, e),
        })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            tool,
            reason: format!("{} -version exited with {}", tool, output.status),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1 ..."
/// - N-prefixed: "ffmpeg version n6.1-... ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');

    // Major version ends at the first '.' or '-'
    let major_str = version_str.split(['.', '-']).next()?;

    major_str.parse().ok()
}

/// Check that the parsed ffmpeg major version meets [`MIN_FFMPEG_MAJOR`]
pub fn check_ffmpeg_version(version_output: &str) -> Result<u32, StartupError> {
    let major = parse_ffmpeg_version(version_output).ok_or_else(|| {
        StartupError::FfmpegVersion(format!(
            "Could not parse FFmpeg version from output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ))
    })?;

    if major < MIN_FFMPEG_MAJOR {
        return Err(StartupError::FfmpegVersion(format!(
            "FFmpeg {}.x or newer required, got: {}",
            MIN_FFMPEG_MAJOR, major
        )));
    }

    Ok(major)
}

/// Check the library roots: at least one configured, missing ones warned
pub fn check_roots(cfg: &Config) -> Result<(), StartupError> {
    if cfg.library.roots.is_empty() {
        return Err(StartupError::NoRoots);
    }

    for root in &cfg.library.roots {
        if !root.is_dir() {
            warn!(root = %root.display(), "library root does not exist");
        }
    }

    Ok(())
}

/// Check that every downgrade entry names known codecs
pub fn check_codec_table(cfg: &Config) -> Result<(), StartupError> {
    CodecPolicy::from_config(&cfg.normalize)
        .map(|_| ())
        .map_err(|e| StartupError::CodecTable(e.to_string()))
}

/// Checks that need no external tools
pub fn check_configuration(cfg: &Config) -> Result<(), StartupError> {
    check_roots(cfg)?;
    check_codec_table(cfg)?;
    Ok(())
}

/// Run all startup checks in order
///
/// 1. Configuration (roots, codec table)
/// 2. ffprobe availability
/// 3. ffmpeg availability and version
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_configuration(cfg)?;
    check_tool_available("ffprobe")?;
    let version_output = check_tool_available("ffmpeg")?;
    let major = check_ffmpeg_version(&version_output)?;
    info!(ffmpeg_major = major, "startup checks passed");
    Ok(())
}
