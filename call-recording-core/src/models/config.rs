use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::audio_models::AudioFormat;
use super::error::RecordingError;
use crate::processing::wav_format::MAX_WAV_FILE_SIZE;

/// Codec requested for the recording file.
///
/// Only `PcmWav` is encoded as requested. The compressed codecs are accepted
/// so existing call configurations load, but the output is written as PCM WAV
/// and the sidecar records both the requested and the actual codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AudioCodec {
    PcmWav,
    Mp3,
    Aac,
    Opus,
}

impl AudioCodec {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PcmWav => "PCM_WAV",
            Self::Mp3 => "MP3",
            Self::Aac => "AAC",
            Self::Opus => "OPUS",
        }
    }

    /// Whether the codec is written as requested.
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::PcmWav)
    }

    /// The codec the file actually ends up in.
    pub fn effective(&self) -> AudioCodec {
        AudioCodec::PcmWav
    }

    /// File extension of the written output, without the dot.
    pub fn file_extension(&self) -> &'static str {
        match self.effective() {
            Self::PcmWav => "wav",
            Self::Mp3 => "mp3",
            Self::Aac => "m4a",
            Self::Opus => "opus",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordingQuality {
    Low,
    Medium,
    High,
    Lossless,
}

/// Options for a single recording.
///
/// Loadable from JSON; missing fields fall back to `Default`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecordingOptions {
    pub codec: AudioCodec,

    /// Output sample rate in Hz (default: 8000, narrowband telephony).
    pub sample_rate: u32,

    /// Output channel count (default: 1).
    pub channels: u16,

    /// PCM bit depth of the output file (default: 16). Valid: 8, 16, 24, 32.
    pub bits_per_sample: u16,

    /// Nominal bit rate in bits per second, used for compressed codecs.
    pub bit_rate: u32,

    pub output_directory: PathBuf,

    /// See `RecordingFileManager::generate_file_name` for placeholders.
    pub file_name_template: String,

    pub auto_start: bool,

    /// When false, only the incoming legs are written.
    pub record_both_parties: bool,

    #[serde(with = "duration_secs")]
    pub max_duration: Duration,

    /// Maximum output file size in bytes, header included.
    pub max_file_size: u64,

    pub quality: RecordingQuality,
    pub enable_noise_reduction: bool,
    pub enable_normalization: bool,
}

impl RecordingOptions {
    pub fn validate(&self) -> Result<(), RecordingError> {
        if !(1..=192_000).contains(&self.sample_rate) {
            return Err(RecordingError::Configuration(format!(
                "sample rate out of range: {}",
                self.sample_rate
            )));
        }
        if !(1..=8).contains(&self.channels) {
            return Err(RecordingError::Configuration(format!(
                "unsupported channel count: {}",
                self.channels
            )));
        }
        if !(1..=320_000).contains(&self.bit_rate) {
            return Err(RecordingError::Configuration(format!(
                "bit rate out of range: {}",
                self.bit_rate
            )));
        }
        if ![8, 16, 24, 32].contains(&self.bits_per_sample) {
            return Err(RecordingError::Configuration(format!(
                "unsupported bit depth: {}",
                self.bits_per_sample
            )));
        }
        if self.output_directory.as_os_str().is_empty() {
            return Err(RecordingError::Configuration("output directory is empty".into()));
        }
        if self.file_name_template.trim().is_empty() {
            return Err(RecordingError::Configuration("file name template is empty".into()));
        }
        if self.max_duration.is_zero() {
            return Err(RecordingError::Configuration("max duration must be positive".into()));
        }
        if self.max_file_size == 0 {
            return Err(RecordingError::Configuration("max file size must be positive".into()));
        }
        if self.max_file_size > MAX_WAV_FILE_SIZE {
            return Err(RecordingError::Configuration(format!(
                "max file size {} exceeds the WAV limit of {} bytes",
                self.max_file_size, MAX_WAV_FILE_SIZE
            )));
        }
        Ok(())
    }

    /// PCM format the recording file is written in.
    pub fn target_format(&self) -> AudioFormat {
        AudioFormat::pcm(self.sample_rate, self.channels, self.bits_per_sample)
    }
}

impl Default for RecordingOptions {
    fn default() -> Self {
        Self {
            codec: AudioCodec::PcmWav,
            sample_rate: 8000,
            channels: 1,
            bits_per_sample: 16,
            bit_rate: 128_000,
            output_directory: PathBuf::from("recordings"),
            file_name_template: "call_{timestamp}_{caller}_{callee}".into(),
            auto_start: false,
            record_both_parties: true,
            max_duration: Duration::from_secs(4 * 60 * 60),
            max_file_size: 2 * 1024 * 1024 * 1024,
            quality: RecordingQuality::High,
            enable_noise_reduction: false,
            enable_normalization: false,
        }
    }
}

/// Who the recorded call is between, plus free-form annotations for the sidecar.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CallInfo {
    pub caller_number: String,
    pub callee_number: String,
    pub notes: Option<String>,
    pub tags: Vec<String>,
}

impl CallInfo {
    pub fn new(caller_number: impl Into<String>, callee_number: impl Into<String>) -> Self {
        Self {
            caller_number: caller_number.into(),
            callee_number: callee_number.into(),
            ..Default::default()
        }
    }
}

/// Serde adapter storing a `Duration` as fractional seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::error::RecordingErrorCode;

    #[test]
    fn defaults_are_valid() {
        assert!(RecordingOptions::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let cases = [
            RecordingOptions { sample_rate: 0, ..Default::default() },
            RecordingOptions { sample_rate: 192_001, ..Default::default() },
            RecordingOptions { channels: 9, ..Default::default() },
            RecordingOptions { bit_rate: 320_001, ..Default::default() },
            RecordingOptions { bits_per_sample: 12, ..Default::default() },
            RecordingOptions { output_directory: PathBuf::new(), ..Default::default() },
            RecordingOptions { file_name_template: "  ".into(), ..Default::default() },
            RecordingOptions { max_duration: Duration::ZERO, ..Default::default() },
            RecordingOptions { max_file_size: 0, ..Default::default() },
            RecordingOptions { max_file_size: 6 * 1024 * 1024 * 1024, ..Default::default() },
        ];
        for options in cases {
            let err = options.validate().unwrap_err();
            assert_eq!(err.code(), RecordingErrorCode::ConfigurationError);
        }
    }

    #[test]
    fn file_size_limit_fits_a_riff_header() {
        let at_limit = RecordingOptions {
            max_file_size: MAX_WAV_FILE_SIZE,
            ..Default::default()
        };
        assert!(at_limit.validate().is_ok());

        let over = RecordingOptions {
            max_file_size: MAX_WAV_FILE_SIZE + 1,
            ..Default::default()
        };
        assert!(matches!(over.validate(), Err(RecordingError::Configuration(_))));
    }

    #[test]
    fn compressed_codecs_are_written_as_wav() {
        for codec in [AudioCodec::Mp3, AudioCodec::Aac, AudioCodec::Opus] {
            assert!(!codec.is_supported());
            assert_eq!(codec.file_extension(), "wav");
        }
        assert_eq!(AudioCodec::PcmWav.file_extension(), "wav");
    }

    #[test]
    fn loads_partial_json() {
        let json = r#"{"sampleRate": 16000, "codec": "PCM_WAV", "maxDuration": 90.5}"#;
        let options: RecordingOptions = serde_json::from_str(json).unwrap();
        assert_eq!(options.sample_rate, 16000);
        assert_eq!(options.channels, 1);
        assert_eq!(options.max_duration, Duration::from_millis(90_500));
        assert_eq!(options.target_format(), AudioFormat::pcm(16000, 1, 16));
    }
}
