//! External tool adapters.
//!
//! [`run_tool`] runs one ffprobe/ffmpeg invocation with a hard timeout. [`MediaTools`]
//! is the seam the workflow talks to; [`FfmpegTools`] is the production implementation.

use async_trait::async_trait;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::encode::transcode::{
    build_transcode_command, summarize_diagnostic, TranscodeError, TranscodeRequest,
};
use crate::encode::volumedetect::{build_volumedetect_command, parse_max_volume, MeasureError, PeakLevel};
use crate::probe::{build_ffprobe_command, parse_ffprobe_output, ProbeError, StreamMetadata};

/// Captured result of a finished subprocess.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Error type for subprocess execution.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to run tool: {0}")]
    Io(#[from] std::io::Error),

    #[error("tool timed out after {0:?}")]
    Timeout(Duration),
}

/// Runs `command` to completion, killing it if `timeout` elapses.
pub async fn run_tool(command: std::process::Command, timeout: Duration) -> Result<ToolOutput, ToolError> {
    let mut cmd = tokio::process::Command::from(command);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn()?;
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output?;
            Ok(ToolOutput {
                status: output.status,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
        // Dropping the wait future drops the child, which kills it.
        Err(_) => Err(ToolError::Timeout(timeout)),
    }
}

/// Operations the per-file workflow needs from the external tools.
#[async_trait]
pub trait MediaTools: Send + Sync {
    /// Reads the stream layout of `path`.
    async fn inspect(&self, path: &Path) -> Result<StreamMetadata, ProbeError>;

    /// Measures the maximum sample peak of the stream at absolute index `abs_index`.
    async fn measure_peak(&self, path: &Path, abs_index: u32) -> Result<PeakLevel, MeasureError>;

    /// Runs one transcode attempt.
    async fn transcode(&self, request: &TranscodeRequest) -> Result<(), TranscodeError>;
}

/// `ffprobe`/`ffmpeg` from `PATH`.
#[derive(Debug, Clone)]
pub struct FfmpegTools {
    pub threads_per_job: u32,
    pub timeout: Duration,
}

impl FfmpegTools {
    pub fn new(threads_per_job: u32, timeout: Duration) -> Self {
        Self {
            threads_per_job,
            timeout,
        }
    }
}

#[async_trait]
impl MediaTools for FfmpegTools {
    async fn inspect(&self, path: &Path) -> Result<StreamMetadata, ProbeError> {
        let output = run_tool(build_ffprobe_command(path), self.timeout)
            .await
            .map_err(|e| match e {
                ToolError::Io(io) => ProbeError::Io(io),
                ToolError::Timeout(t) => ProbeError::Timeout(t),
            })?;

        if !output.status.success() {
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                output.stderr.trim()
            )));
        }

        parse_ffprobe_output(&output.stdout)
    }

    async fn measure_peak(&self, path: &Path, abs_index: u32) -> Result<PeakLevel, MeasureError> {
        let cmd = build_volumedetect_command(path, abs_index, self.threads_per_job);
        let output = run_tool(cmd, self.timeout).await.map_err(|e| match e {
            ToolError::Io(io) => MeasureError::Io(io),
            ToolError::Timeout(t) => MeasureError::Timeout(t),
        })?;

        if !output.status.success() {
            return Err(MeasureError::Failed(summarize_diagnostic(&output.stderr)));
        }

        parse_max_volume(&output.stderr).ok_or(MeasureError::NoReading)
    }

    async fn transcode(&self, request: &TranscodeRequest) -> Result<(), TranscodeError> {
        let cmd = build_transcode_command(request, self.threads_per_job);
        debug!(command = ?cmd, "running ffmpeg");

        let output = run_tool(cmd, self.timeout).await.map_err(|e| match e {
            ToolError::Io(io) => TranscodeError::Io(io),
            ToolError::Timeout(t) => TranscodeError::Timeout(t),
        })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(TranscodeError::from_failure(output.status.code(), &output.stderr))
        }
    }
}
