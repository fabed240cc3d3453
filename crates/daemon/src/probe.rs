//! Probe module for reading the stream layout of a video file.
//!
//! This module builds the ffprobe invocation and parses its JSON output into
//! [`StreamMetadata`], including the audio-order mapping used to address audio
//! streams by their per-type position.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use thiserror::Error;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// ffprobe did not finish in time.
    #[error("ffprobe timed out after {0:?}")]
    Timeout(Duration),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stream type as reported by `codec_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    Data,
    Attachment,
    Other,
}

impl StreamKind {
    fn from_codec_type(codec_type: &str) -> Self {
        match codec_type {
            "video" => StreamKind::Video,
            "audio" => StreamKind::Audio,
            "subtitle" => StreamKind::Subtitle,
            "data" => StreamKind::Data,
            "attachment" => StreamKind::Attachment,
            _ => StreamKind::Other,
        }
    }
}

/// One stream descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Absolute index in the container.
    pub index: u32,
    pub kind: StreamKind,
    /// Codec name (e.g., "aac", "truehd", "dts"); empty if unknown.
    pub codec_name: String,
    /// `disposition.default == 1`.
    pub is_default: bool,
    pub bitrate_bps: Option<u64>,
}

/// Result of inspecting one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Streams in container order.
    pub streams: Vec<StreamInfo>,
    /// Container duration, if reported.
    pub duration_secs: Option<f64>,
}

impl StreamMetadata {
    /// Audio streams in container order.
    pub fn audio_streams(&self) -> impl Iterator<Item = &StreamInfo> {
        self.streams.iter().filter(|s| s.kind == StreamKind::Audio)
    }

    /// Absolute stream index -> 0-based position among audio streams.
    pub fn audio_order_map(&self) -> HashMap<u32, usize> {
        self.audio_streams()
            .enumerate()
            .map(|(order, stream)| (stream.index, order))
            .collect()
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub index: Option<u32>,
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub bit_rate: Option<String>,
        pub disposition: Option<Disposition>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Disposition {
        #[serde(default)]
        pub default: u8,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Builds `ffprobe -v error -print_format json -show_streams -show_format <path>`.
pub fn build_ffprobe_command(path: &Path) -> Command {
    let mut cmd = Command::new("ffprobe");
    cmd.args([
        "-v",
        "error",
        "-print_format",
        "json",
        "-show_streams",
        "-show_format",
    ])
    .arg(path);
    cmd
}

/// Parses ffprobe JSON output into [`StreamMetadata`].
pub fn parse_ffprobe_output(json_str: &str) -> Result<StreamMetadata, ProbeError> {
    if json_str.trim().is_empty() {
        return Err(ProbeError::ParseError("empty ffprobe output".to_string()));
    }

    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let mut streams = Vec::new();
    for stream in ffprobe.streams.unwrap_or_default() {
        let index = stream.index.ok_or_else(|| {
            ProbeError::ParseError("stream without index in ffprobe output".to_string())
        })?;

        streams.push(StreamInfo {
            index,
            kind: StreamKind::from_codec_type(stream.codec_type.as_deref().unwrap_or("")),
            codec_name: stream.codec_name.unwrap_or_default(),
            is_default: stream.disposition.map(|d| d.default == 1).unwrap_or(false),
            bitrate_bps: stream.bit_rate.as_ref().and_then(|br| br.parse::<u64>().ok()),
        });
    }

    let duration_secs = ffprobe
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok());

    Ok(StreamMetadata {
        streams,
        duration_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stream(index: u32, kind: StreamKind) -> StreamInfo {
        StreamInfo {
            index,
            kind,
            codec_name: String::new(),
            is_default: false,
            bitrate_bps: None,
        }
    }

    // Property: audio order positions are dense, ordered, and only cover audio streams.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_audio_order_map_is_dense(kinds in prop::collection::vec(0u8..4, 0..12)) {
            let streams: Vec<StreamInfo> = kinds
                .iter()
                .enumerate()
                .map(|(i, k)| {
                    let kind = match k {
                        0 => StreamKind::Video,
                        1 => StreamKind::Audio,
                        2 => StreamKind::Subtitle,
                        _ => StreamKind::Data,
                    };
                    stream(i as u32, kind)
                })
                .collect();
            let meta = StreamMetadata { streams, duration_secs: None };
            let map = meta.audio_order_map();

            let audio: Vec<u32> = meta.audio_streams().map(|s| s.index).collect();
            prop_assert_eq!(map.len(), audio.len());
            for (order, index) in audio.iter().enumerate() {
                prop_assert_eq!(map[index], order);
            }
        }
    }

    #[test]
    fn test_build_ffprobe_command() {
        let cmd = build_ffprobe_command(Path::new("/media/film.mkv"));
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(cmd.get_program(), "ffprobe");
        assert_eq!(
            args,
            vec![
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
                "/media/film.mkv"
            ]
        );
    }

    #[test]
    fn test_parse_ffprobe_output_mixed_streams() {
        let json = r#"{
            "streams": [
                {"index": 0, "codec_type": "video", "codec_name": "hevc", "bit_rate": "25000000"},
                {"index": 1, "codec_type": "audio", "codec_name": "truehd",
                 "disposition": {"default": 0, "forced": 0}},
                {"index": 2, "codec_type": "audio", "codec_name": "ac3", "bit_rate": "640000",
                 "disposition": {"default": 1}},
                {"index": 3, "codec_type": "subtitle", "codec_name": "subrip"},
                {"index": 4, "codec_type": "attachment"}
            ],
            "format": {"duration": "7200.5", "size": "22548578304"}
        }"#;

        let meta = parse_ffprobe_output(json).expect("Should parse valid JSON");

        assert_eq!(meta.streams.len(), 5);
        assert_eq!(meta.streams[0].kind, StreamKind::Video);
        assert_eq!(meta.streams[0].bitrate_bps, Some(25_000_000));
        assert!(!meta.streams[1].is_default);
        assert!(meta.streams[2].is_default);
        assert_eq!(meta.streams[2].codec_name, "ac3");
        assert_eq!(meta.streams[4].kind, StreamKind::Attachment);
        assert_eq!(meta.streams[3].kind, StreamKind::Subtitle);
        assert!((meta.duration_secs.unwrap() - 7200.5).abs() < 0.001);

        let order = meta.audio_order_map();
        assert_eq!(order[&1], 0);
        assert_eq!(order[&2], 1);
        assert!(!order.contains_key(&3));
    }

    #[test]
    fn test_parse_ffprobe_output_missing_optional_fields() {
        let json = r#"{"streams": [{"index": 0, "codec_type": "audio"}]}"#;

        let meta = parse_ffprobe_output(json).expect("Should parse with missing fields");
        assert_eq!(meta.streams[0].codec_name, "");
        assert!(meta.streams[0].bitrate_bps.is_none());
        assert!(meta.duration_secs.is_none());
    }

    #[test]
    fn test_parse_ffprobe_output_rejects_unusable_output() {
        assert!(matches!(parse_ffprobe_output(""), Err(ProbeError::ParseError(_))));
        assert!(matches!(parse_ffprobe_output("  \n"), Err(ProbeError::ParseError(_))));
        assert!(matches!(parse_ffprobe_output("[1, 2]"), Err(ProbeError::ParseError(_))));
        assert!(matches!(
            parse_ffprobe_output(r#"{"streams": [{"codec_type": "audio"}]}"#),
            Err(ProbeError::ParseError(_))
        ));
    }
}
