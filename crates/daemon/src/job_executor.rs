//! Job executor module
//!
//! Runs the per-file workflow (inspect, measure, plan, transcode, publish, record) with
//! concurrency limited by a semaphore. Every file yields a [`FileOutcome`]; failures in
//! one file never affect another.

use crate::config::Config;
use crate::encode::transcode::{
    remove_partial_output, transcode_with_fallback, TranscodeError, TranscodeRequest,
};
use crate::encode::volumedetect::MeasureError;
use crate::fingerprint::{file_signature, quick_fingerprint};
use crate::plan::{
    decide_gain, measured_dbfs, select_main_audio, CodecPolicy, GainDecision, NormalizationPlan,
    PlanError,
};
use crate::probe::ProbeError;
use crate::publish::{publish, temp_output_path, RetryPolicy, SwapError};
use crate::state::{ProcessingRecord, SharedStore};
use crate::tools::MediaTools;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Error type for one file's workflow
#[derive(Debug, Error)]
pub enum JobError {
    /// ffprobe failed or returned unusable output
    #[error("Inspection failed: {0}")]
    Inspection(#[from] ProbeError),

    /// The file has no audio stream
    #[error("No audio stream")]
    NoAudioStream,

    /// Peak could not be measured
    #[error("Measurement failed: {0}")]
    Measurement(#[from] MeasureError),

    /// Plan could not be built
    #[error("Planning failed: {0}")]
    Plan(PlanError),

    /// ffmpeg failed, timed out, or produced an invalid output
    #[error("Transcode failed: {0}")]
    Transcode(#[from] TranscodeError),

    /// Publishing the output over the original failed
    #[error("Swap failed: {0}")]
    Swap(#[from] SwapError),

    /// Filesystem error outside the stages above
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PlanError> for JobError {
    fn from(e: PlanError) -> Self {
        match e {
            PlanError::NoAudioStream => JobError::NoAudioStream,
            other => JobError::Plan(other),
        }
    }
}

impl JobError {
    /// Stage the job was in when it failed
    pub fn stage(&self) -> JobStage {
        match self {
            JobError::Inspection(_) => JobStage::Inspecting,
            JobError::NoAudioStream | JobError::Plan(_) => JobStage::Planning,
            JobError::Measurement(_) => JobStage::Measuring,
            JobError::Transcode(_) => JobStage::Transcoding,
            JobError::Swap(_) => JobStage::Publishing,
            JobError::Io(_) => JobStage::Recording,
        }
    }

    /// Whether the failure looks transient rather than a property of the file
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::Inspection(e) => matches!(e, ProbeError::Timeout(_) | ProbeError::Io(_)),
            JobError::Measurement(e) => matches!(e, MeasureError::Timeout(_) | MeasureError::Io(_)),
            JobError::Transcode(e) => e.is_retryable(),
            JobError::Swap(e) => matches!(e, SwapError::Exhausted { .. }),
            JobError::Io(_) => true,
            JobError::NoAudioStream | JobError::Plan(_) => false,
        }
    }
}

/// Pipeline stage, used for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Inspecting,
    Measuring,
    Planning,
    Transcoding,
    Publishing,
    Recording,
}

impl JobStage {
    pub fn as_str(&self) -> &str {
        match self {
            JobStage::Inspecting => "inspecting",
            JobStage::Measuring => "measuring",
            JobStage::Planning => "planning",
            JobStage::Transcoding => "transcoding",
            JobStage::Publishing => "publishing",
            JobStage::Recording => "recording",
        }
    }
}

/// Result of running the workflow on one file
#[derive(Debug)]
pub enum FileOutcome {
    /// Gain applied and published
    Normalized {
        gain_db: f64,
        subtitles_dropped: bool,
        retained_backup: Option<PathBuf>,
    },
    /// Gain below epsilon; recorded without transcoding
    AlreadyNormalized { peak_dbfs: f64, gain_db: f64 },
    /// Not started because the executor was cancelled
    Cancelled,
    /// Workflow failed; the store was not updated
    Failed(JobError),
}

impl FileOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            FileOutcome::Normalized { .. } | FileOutcome::AlreadyNormalized { .. }
        )
    }
}

/// Settings the workflow needs, resolved once from configuration
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub target_peak_dbfs: f64,
    pub epsilon_db: f64,
    pub faststart: bool,
    pub min_output_bytes: u64,
    pub block_bytes: u64,
    pub retry: RetryPolicy,
    pub codecs: CodecPolicy,
}

impl JobSettings {
    /// Fails if the downgrade table names an unknown codec
    pub fn from_config(cfg: &Config) -> Result<Self, PlanError> {
        Ok(Self {
            target_peak_dbfs: cfg.normalize.target_peak_dbfs,
            epsilon_db: cfg.normalize.epsilon_db,
            faststart: cfg.normalize.faststart,
            min_output_bytes: cfg.normalize.min_output_bytes,
            block_bytes: cfg.fingerprint.block_bytes(),
            retry: RetryPolicy::from(&cfg.swap),
            codecs: CodecPolicy::from_config(&cfg.normalize)?,
        })
    }
}

/// Job executor that runs the per-file workflow with concurrency limiting
///
/// Uses a tokio Semaphore so at most `workers` files are in the workflow at once.
pub struct JobExecutor {
    /// Semaphore for limiting concurrent jobs
    semaphore: Arc<Semaphore>,
    workers: u32,
    tools: Arc<dyn MediaTools>,
    store: SharedStore,
    settings: JobSettings,
    /// Set once no further jobs may start
    cancelled: AtomicBool,
}

impl JobExecutor {
    pub fn new(workers: u32, tools: Arc<dyn MediaTools>, store: SharedStore, settings: JobSettings) -> Self {
        let workers = workers.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(workers as usize)),
            workers,
            tools,
            store,
            settings,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn workers(&self) -> u32 {
        self.workers
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    /// Acquire a permit for job execution
    ///
    /// Waits until a permit is available; `None` once the executor is cancelled.
    pub async fn acquire_permit(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().acquire_owned().await.ok()
    }

    /// Stop starting new jobs. Jobs already past their permit run to completion.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.semaphore.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Execute the workflow for one file
    pub async fn execute(&self, path: &Path) -> FileOutcome {
        let job_id = Uuid::new_v4();
        let file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let span = info_span!("job", id = %job_id, file = %file);

        async {
            let Some(_permit) = self.acquire_permit().await else {
                return FileOutcome::Cancelled;
            };
            if self.is_cancelled() {
                return FileOutcome::Cancelled;
            }

            let outcome = match self.run(path).await {
                Ok(outcome) => outcome,
                Err(e) => FileOutcome::Failed(e),
            };

            match &outcome {
                FileOutcome::Normalized {
                    gain_db,
                    subtitles_dropped,
                    retained_backup,
                } => info!(
                    gain = %format!("{:+.2}dB", gain_db),
                    subtitles_dropped,
                    backup_retained = retained_backup.is_some(),
                    "normalised"
                ),
                FileOutcome::AlreadyNormalized { peak_dbfs, .. } => {
                    info!(peak_dbfs, "already normalised, recorded")
                }
                FileOutcome::Failed(e) => {
                    warn!(
                        stage = e.stage().as_str(),
                        retryable = e.is_retryable(),
                        error = %e,
                        "failed, will retry next run"
                    )
                }
                FileOutcome::Cancelled => {}
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn run(&self, path: &Path) -> Result<FileOutcome, JobError> {
        let settings = &self.settings;

        let meta = self.tools.inspect(path).await?;
        let main = select_main_audio(&meta)?;

        let level = self.tools.measure_peak(path, main.index).await?;
        let peak_dbfs = measured_dbfs(level).ok_or(MeasureError::NoSignal)?;

        let gain_db = match decide_gain(settings.target_peak_dbfs, peak_dbfs, settings.epsilon_db) {
            GainDecision::AlreadyNormalized { gain_db } => {
                self.record_completion(path).await?;
                return Ok(FileOutcome::AlreadyNormalized { peak_dbfs, gain_db });
            }
            GainDecision::Apply { gain_db } => gain_db,
        };

        let plan = NormalizationPlan::build(&meta, main, peak_dbfs, gain_db, &settings.codecs)?;
        let tmp = temp_output_path(path);
        let request = TranscodeRequest {
            source: path.to_path_buf(),
            output: tmp.clone(),
            plan,
            faststart: settings.faststart,
        };

        let transcoded =
            match transcode_with_fallback(self.tools.as_ref(), &request, settings.min_output_bytes).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    remove_partial_output(&tmp);
                    return Err(e.into());
                }
            };

        // The temporary output is kept on swap failure for recovery.
        let original = path.to_path_buf();
        let policy = settings.retry.clone();
        let published = tokio::task::spawn_blocking(move || publish(&original, &tmp, &policy))
            .await
            .map_err(std::io::Error::other)??;

        self.record_after_publish(path).await;

        Ok(FileOutcome::Normalized {
            gain_db,
            subtitles_dropped: transcoded.subtitles_dropped,
            retained_backup: published.retained_backup,
        })
    }

    /// Records a published file. The file is already normalised, so a failure here
    /// only costs a re-measure on the next run.
    async fn record_after_publish(&self, path: &Path) {
        if let Err(e) = self.record_completion(path).await {
            warn!(error = %e, "published but could not record completion");
        }
    }

    /// Writes the current signature and fingerprint of `path` to the store
    async fn record_completion(&self, path: &Path) -> Result<(), JobError> {
        let path = path.to_path_buf();
        let store = Arc::clone(&self.store);
        let block_bytes = self.settings.block_bytes;

        tokio::task::spawn_blocking(move || {
            let record = ProcessingRecord::new(file_signature(&path)?, quick_fingerprint(&path, block_bytes)?);
            if let Err(e) = store.upsert(&path, record) {
                warn!(state = %store.path().display(), error = %e, "could not save state");
            }
            Ok::<(), std::io::Error>(())
        })
        .await
        .map_err(std::io::Error::other)??;

        Ok(())
    }
}
