//! Normalization planner
//!
//! Selects the main audio stream, decides the gain, and resolves the encoder for the
//! re-encoded stream from an explicit codec table plus the configured downgrade map.

use std::collections::BTreeMap;
use thiserror::Error;

use crate::config::NormalizeConfig;
use crate::encode::volumedetect::PeakLevel;
use crate::probe::{StreamInfo, StreamMetadata};

/// Error type for planning
#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    /// No audio stream in the file
    #[error("no audio stream")]
    NoAudioStream,

    /// The main audio stream has no audio-order position
    #[error("stream {0} is missing from the audio order map")]
    MissingAudioOrder(u32),

    /// Downgrade table names a codec with no known encoder
    #[error("unknown codec in downgrade table: {0}")]
    UnknownCodec(String),
}

/// Audio codecs with a known encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AudioCodec {
    Ac3,
    Eac3,
    Aac,
    Mp3,
    Opus,
    Flac,
    Dts,
    TrueHd,
    Alac,
    PcmS16le,
    PcmS24le,
}

impl AudioCodec {
    pub const ALL: [AudioCodec; 11] = [
        AudioCodec::Ac3,
        AudioCodec::Eac3,
        AudioCodec::Aac,
        AudioCodec::Mp3,
        AudioCodec::Opus,
        AudioCodec::Flac,
        AudioCodec::Dts,
        AudioCodec::TrueHd,
        AudioCodec::Alac,
        AudioCodec::PcmS16le,
        AudioCodec::PcmS24le,
    ];

    /// Codec used when the source codec has no known encoder
    pub const FALLBACK: AudioCodec = AudioCodec::Aac;

    /// Looks up a codec by its ffprobe name (case-insensitive).
    pub fn from_codec_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|c| c.codec_name() == name)
    }

    /// ffprobe codec name
    pub fn codec_name(self) -> &'static str {
        match self {
            AudioCodec::Ac3 => "ac3",
            AudioCodec::Eac3 => "eac3",
            AudioCodec::Aac => "aac",
            AudioCodec::Mp3 => "mp3",
            AudioCodec::Opus => "opus",
            AudioCodec::Flac => "flac",
            AudioCodec::Dts => "dts",
            AudioCodec::TrueHd => "truehd",
            AudioCodec::Alac => "alac",
            AudioCodec::PcmS16le => "pcm_s16le",
            AudioCodec::PcmS24le => "pcm_s24le",
        }
    }

    /// ffmpeg encoder name
    pub fn encoder(self) -> &'static str {
        match self {
            AudioCodec::Mp3 => "libmp3lame",
            AudioCodec::Opus => "libopus",
            AudioCodec::Dts => "dca",
            other => other.codec_name(),
        }
    }

    /// Lossless and PCM targets take no bitrate argument
    pub fn is_lossless(self) -> bool {
        matches!(
            self,
            AudioCodec::Flac
                | AudioCodec::Alac
                | AudioCodec::TrueHd
                | AudioCodec::PcmS16le
                | AudioCodec::PcmS24le
        )
    }
}

/// Encoder directive for the re-encoded stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderChoice {
    pub encoder: &'static str,
    /// `None` for lossless targets
    pub bitrate: Option<String>,
}

/// Validated codec policy: downgrade map plus lossy bitrate
#[derive(Debug, Clone, PartialEq)]
pub struct CodecPolicy {
    downgrade: BTreeMap<AudioCodec, AudioCodec>,
    lossy_bitrate: String,
}

impl CodecPolicy {
    /// Builds the policy, rejecting downgrade entries that name unknown codecs
    pub fn from_config(cfg: &NormalizeConfig) -> Result<Self, PlanError> {
        let mut downgrade = BTreeMap::new();
        for (from, to) in &cfg.downgrade {
            let from_codec = AudioCodec::from_codec_name(from)
                .ok_or_else(|| PlanError::UnknownCodec(from.clone()))?;
            let to_codec =
                AudioCodec::from_codec_name(to).ok_or_else(|| PlanError::UnknownCodec(to.clone()))?;
            downgrade.insert(from_codec, to_codec);
        }

        Ok(Self {
            downgrade,
            lossy_bitrate: cfg.audio_bitrate.clone(),
        })
    }

    /// Resolves the encoder for a source codec name
    ///
    /// Downgrades apply first; unknown codecs fall back to [`AudioCodec::FALLBACK`].
    pub fn choose(&self, codec_name: &str) -> EncoderChoice {
        let source = AudioCodec::from_codec_name(codec_name).unwrap_or(AudioCodec::FALLBACK);
        let target = self.downgrade.get(&source).copied().unwrap_or(source);

        EncoderChoice {
            encoder: target.encoder(),
            bitrate: (!target.is_lossless()).then(|| self.lossy_bitrate.clone()),
        }
    }
}

/// Picks the first default audio stream, else the first audio stream
pub fn select_main_audio(meta: &StreamMetadata) -> Result<&StreamInfo, PlanError> {
    meta.audio_streams()
        .find(|s| s.is_default)
        .or_else(|| meta.audio_streams().next())
        .ok_or(PlanError::NoAudioStream)
}

/// Outcome of the gain decision
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GainDecision {
    /// Gain at or below epsilon: record completion, do not transcode
    AlreadyNormalized { gain_db: f64 },
    /// Gain to apply to the main stream
    Apply { gain_db: f64 },
}

/// Gain = target - measured, applied only when it exceeds `epsilon_db`
pub fn decide_gain(target_peak_dbfs: f64, measured_peak_dbfs: f64, epsilon_db: f64) -> GainDecision {
    let gain_db = target_peak_dbfs - measured_peak_dbfs;
    if gain_db <= epsilon_db {
        GainDecision::AlreadyNormalized { gain_db }
    } else {
        GainDecision::Apply { gain_db }
    }
}

/// Per-audio-stream directive in the output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioDirective {
    Copy,
    Encode(EncoderChoice),
}

/// Everything the transcode needs
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationPlan {
    pub main_audio_index: u32,
    /// Output position of the main stream among audio streams
    pub main_audio_order: usize,
    pub measured_peak_dbfs: f64,
    pub gain_db: f64,
    /// Directives indexed by audio order
    pub audio: Vec<AudioDirective>,
    pub include_subtitles: bool,
}

impl NormalizationPlan {
    /// Builds the plan for a measured stream that needs gain
    pub fn build(
        meta: &StreamMetadata,
        main: &StreamInfo,
        measured_peak_dbfs: f64,
        gain_db: f64,
        policy: &CodecPolicy,
    ) -> Result<Self, PlanError> {
        let order = meta.audio_order_map();
        let main_audio_order = *order
            .get(&main.index)
            .ok_or(PlanError::MissingAudioOrder(main.index))?;

        let audio = meta
            .audio_streams()
            .map(|s| {
                if s.index == main.index {
                    AudioDirective::Encode(policy.choose(&s.codec_name))
                } else {
                    AudioDirective::Copy
                }
            })
            .collect();

        Ok(Self {
            main_audio_index: main.index,
            main_audio_order,
            measured_peak_dbfs,
            gain_db,
            audio,
            include_subtitles: true,
        })
    }

    /// Same plan with subtitle streams excluded from the map
    pub fn without_subtitles(&self) -> Self {
        Self {
            include_subtitles: false,
            ..self.clone()
        }
    }

    /// `volume=+2.90dB`
    pub fn gain_filter(&self) -> String {
        format!("volume={:+.2}dB", self.gain_db)
    }
}

/// Converts a measured level into a dBFS value, or `None` for no signal
pub fn measured_dbfs(level: PeakLevel) -> Option<f64> {
    match level {
        PeakLevel::Dbfs(db) => Some(db),
        PeakLevel::NoSignal => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::StreamKind;
    use proptest::prelude::*;

    fn audio(index: u32, codec: &str, is_default: bool) -> StreamInfo {
        StreamInfo {
            index,
            kind: StreamKind::Audio,
            codec_name: codec.to_string(),
            is_default,
            bitrate_bps: None,
        }
    }

    fn other(index: u32, kind: StreamKind) -> StreamInfo {
        StreamInfo {
            index,
            kind,
            codec_name: String::new(),
            is_default: false,
            bitrate_bps: None,
        }
    }

    fn meta(streams: Vec<StreamInfo>) -> StreamMetadata {
        StreamMetadata {
            streams,
            duration_secs: Some(60.0),
        }
    }

    fn policy() -> CodecPolicy {
        CodecPolicy::from_config(&NormalizeConfig::default()).unwrap()
    }

    // Property: a transcode is planned exactly when gain exceeds epsilon.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_gain_decision_threshold(
            target in -3.0f64..0.0,
            measured in -60.0f64..0.0,
            epsilon in 0.0f64..1.0,
        ) {
            let gain = target - measured;
            match decide_gain(target, measured, epsilon) {
                GainDecision::Apply { gain_db } => {
                    prop_assert!(gain_db > epsilon);
                    prop_assert!((gain_db - gain).abs() < 1e-9);
                }
                GainDecision::AlreadyNormalized { gain_db } => {
                    prop_assert!(gain_db <= epsilon);
                }
            }
        }
    }

    #[test]
    fn test_decide_gain_examples() {
        match decide_gain(-0.1, -3.0, 0.05) {
            GainDecision::Apply { gain_db } => assert!((gain_db - 2.9).abs() < 1e-9),
            other => panic!("expected Apply, got {:?}", other),
        }
        assert!(matches!(
            decide_gain(-0.1, -0.05, 0.05),
            GainDecision::AlreadyNormalized { .. }
        ));
    }

    #[test]
    fn test_select_main_audio_prefers_default() {
        let m = meta(vec![
            other(0, StreamKind::Video),
            audio(1, "ac3", false),
            audio(2, "dts", true),
            audio(3, "aac", true),
        ]);
        assert_eq!(select_main_audio(&m).unwrap().index, 2);
    }

    #[test]
    fn test_select_main_audio_falls_back_to_first() {
        let m = meta(vec![other(0, StreamKind::Video), audio(3, "ac3", false), audio(4, "aac", false)]);
        assert_eq!(select_main_audio(&m).unwrap().index, 3);
    }

    #[test]
    fn test_select_main_audio_none() {
        let m = meta(vec![other(0, StreamKind::Video), other(1, StreamKind::Subtitle)]);
        assert_eq!(select_main_audio(&m), Err(PlanError::NoAudioStream));
    }

    #[test]
    fn test_codec_choice_preserves_downgrades_and_falls_back() {
        let p = policy();

        assert_eq!(
            p.choose("ac3"),
            EncoderChoice { encoder: "ac3", bitrate: Some("192k".into()) }
        );
        assert_eq!(p.choose("mp3").encoder, "libmp3lame");
        assert_eq!(p.choose("flac"), EncoderChoice { encoder: "flac", bitrate: None });
        assert_eq!(p.choose("pcm_s24le").bitrate, None);
        // dts and truehd downgrade to ac3 by default
        assert_eq!(p.choose("dts").encoder, "ac3");
        assert_eq!(p.choose("TrueHD").encoder, "ac3");
        assert_eq!(
            p.choose("wmav2"),
            EncoderChoice { encoder: "aac", bitrate: Some("192k".into()) }
        );
    }

    #[test]
    fn test_policy_without_downgrades_keeps_lossless() {
        let cfg = NormalizeConfig {
            downgrade: BTreeMap::new(),
            ..NormalizeConfig::default()
        };
        let p = CodecPolicy::from_config(&cfg).unwrap();
        assert_eq!(p.choose("truehd"), EncoderChoice { encoder: "truehd", bitrate: None });
        assert_eq!(p.choose("dts").encoder, "dca");
    }

    #[test]
    fn test_policy_rejects_unknown_codec() {
        let mut cfg = NormalizeConfig::default();
        cfg.downgrade.insert("dts".into(), "vorbis2000".into());
        assert_eq!(
            CodecPolicy::from_config(&cfg),
            Err(PlanError::UnknownCodec("vorbis2000".into()))
        );
    }

    #[test]
    fn test_every_codec_round_trips_by_name() {
        for codec in AudioCodec::ALL {
            assert_eq!(AudioCodec::from_codec_name(codec.codec_name()), Some(codec));
        }
    }

    #[test]
    fn test_plan_targets_audio_order_not_absolute_index() {
        let m = meta(vec![
            other(0, StreamKind::Video),
            other(1, StreamKind::Subtitle),
            audio(2, "aac", false),
            audio(3, "ac3", true),
        ]);
        let main = select_main_audio(&m).unwrap();
        let plan = NormalizationPlan::build(&m, main, -3.0, 2.9, &policy()).unwrap();

        assert_eq!(plan.main_audio_index, 3);
        assert_eq!(plan.main_audio_order, 1);
        assert_eq!(plan.audio[0], AudioDirective::Copy);
        assert!(matches!(plan.audio[1], AudioDirective::Encode(ref c) if c.encoder == "ac3"));
        assert!(plan.include_subtitles);
        assert_eq!(plan.gain_filter(), "volume=+2.90dB");
        assert!(!plan.without_subtitles().include_subtitles);
    }

    #[test]
    fn test_plan_copies_every_other_audio_stream() {
        let m = meta(vec![
            other(0, StreamKind::Video),
            audio(1, "aac", true),
            audio(2, "ac3", false),
            audio(3, "dts", false),
        ]);
        let main = select_main_audio(&m).unwrap();
        let plan = NormalizationPlan::build(&m, main, -6.0, 5.9, &policy()).unwrap();

        assert_eq!(plan.main_audio_order, 0);
        assert_eq!(plan.audio.len(), 3);
        assert_eq!(&plan.audio[1..], &[AudioDirective::Copy, AudioDirective::Copy]);
        assert_eq!(plan.gain_filter(), "volume=+5.90dB");
    }

    #[test]
    fn test_measured_dbfs() {
        assert_eq!(measured_dbfs(PeakLevel::Dbfs(-3.0)), Some(-3.0));
        assert_eq!(measured_dbfs(PeakLevel::NoSignal), None);
    }
}
