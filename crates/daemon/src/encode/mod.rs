//! ffmpeg invocations: the volumedetect analysis pass and the gain transcode

pub mod transcode;
pub mod volumedetect;

pub use transcode::{
    build_transcode_command, transcode_with_fallback, TranscodeError, TranscodeOutcome,
    TranscodeRequest,
};
pub use volumedetect::{build_volumedetect_command, parse_max_volume, MeasureError, PeakLevel};
