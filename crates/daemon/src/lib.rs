//! Peak normaliser
//!
//! Incremental audio peak normalisation for video libraries: change detection against
//! a fingerprint store, ffprobe/ffmpeg planning and transcoding, atomic publishing,
//! and a batch scheduler plus filesystem watcher.

pub mod change;
pub mod cleanup;
pub mod concurrency;
pub mod daemon;
pub mod encode;
pub mod fingerprint;
pub mod job_executor;
pub mod output_gate;
pub mod plan;
pub mod probe;
pub mod publish;
pub mod scan;
pub mod stability;
pub mod startup;
pub mod state;
pub mod tools;
pub mod watcher;

pub use peaknorm_config as config;
pub use peaknorm_config::{Config, ConfigError};
pub use change::{assess, should_process, CandidatePolicy, ChangeDecision, ExclusionReason};
pub use cleanup::{cleanup_orphans, CleanupReport};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use daemon::{Daemon, DaemonError, FileResult, RunSummary};
pub use encode::{MeasureError, PeakLevel, TranscodeError, TranscodeRequest};
pub use fingerprint::{file_signature, quick_fingerprint};
pub use job_executor::{FileOutcome, JobError, JobExecutor, JobSettings};
pub use plan::{AudioCodec, CodecPolicy, NormalizationPlan, PlanError};
pub use probe::{ProbeError, StreamInfo, StreamKind, StreamMetadata};
pub use publish::{publish, PublishOutcome, RetryPolicy, SwapError};
pub use startup::{parse_ffmpeg_version, run_startup_checks, StartupError};
pub use state::{FingerprintStore, ProcessingRecord, SharedStore};
pub use tools::{FfmpegTools, MediaTools};
pub use watcher::{LibraryWatcher, WatchError, WatcherTiming};
