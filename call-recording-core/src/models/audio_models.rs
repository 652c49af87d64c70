use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Encoding of the individual samples in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SampleFormat {
    /// Linear PCM. 8-bit is unsigned (WAV convention), wider widths are signed.
    Pcm,
    /// G.711 A-law, one byte per sample.
    Alaw,
    /// G.711 u-law, one byte per sample.
    Ulaw,
    /// 32-bit IEEE float in `[-1.0, 1.0]`.
    Float,
}

impl SampleFormat {
    pub fn is_companded(&self) -> bool {
        matches!(self, Self::Alaw | Self::Ulaw)
    }
}

/// Shape of the audio carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub sample_format: SampleFormat,
}

impl AudioFormat {
    pub fn pcm(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample,
            sample_format: SampleFormat::Pcm,
        }
    }

    pub fn alaw(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: 8,
            sample_format: SampleFormat::Alaw,
        }
    }

    pub fn ulaw(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: 8,
            sample_format: SampleFormat::Ulaw,
        }
    }

    pub fn float(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        }
    }

    /// Bytes needed to store one sample of one channel.
    pub fn bytes_per_sample(&self) -> usize {
        (self.bits_per_sample as usize).div_ceil(8)
    }

    /// Bytes per interleaved frame (one sample for every channel).
    pub fn block_align(&self) -> usize {
        self.channels as usize * self.bytes_per_sample()
    }

    pub fn byte_rate(&self) -> u64 {
        self.sample_rate as u64 * self.block_align() as u64
    }

    /// Two formats are compatible iff every field matches.
    pub fn is_compatible(&self, other: &AudioFormat) -> bool {
        self == other
    }

    /// Playback duration of `byte_len` bytes in this format.
    pub fn duration_of(&self, byte_len: usize) -> Duration {
        let rate = self.byte_rate();
        if rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(byte_len as f64 / rate as f64)
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} {}Hz {}ch {}bit",
            self.sample_format, self.sample_rate, self.channels, self.bits_per_sample
        )
    }
}

/// The call leg a frame was captured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AudioSource {
    RtpIncoming,
    RtpOutgoing,
    WebRtcIncoming,
    WebRtcOutgoing,
    Mixed,
}

impl AudioSource {
    /// Every source, including the synthetic mixed one.
    pub const ALL: [AudioSource; 5] = [
        Self::RtpIncoming,
        Self::RtpOutgoing,
        Self::WebRtcIncoming,
        Self::WebRtcOutgoing,
        Self::Mixed,
    ];

    /// The four real call legs.
    pub const LEGS: [AudioSource; 4] = [
        Self::RtpIncoming,
        Self::RtpOutgoing,
        Self::WebRtcIncoming,
        Self::WebRtcOutgoing,
    ];

    pub fn is_incoming(&self) -> bool {
        matches!(self, Self::RtpIncoming | Self::WebRtcIncoming)
    }

    pub fn is_outgoing(&self) -> bool {
        matches!(self, Self::RtpOutgoing | Self::WebRtcOutgoing)
    }
}

/// One timestamped, sequenced chunk of raw audio from a single source leg.
///
/// Frames are immutable. The payload is shared behind an `Arc` so a frame can
/// be cloned cheaply into a monitor while the original moves down the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    data: Arc<[u8]>,
    format: AudioFormat,
    timestamp: DateTime<Utc>,
    source: AudioSource,
    sequence_number: u32,
}

impl AudioFrame {
    pub fn new(
        data: impl Into<Arc<[u8]>>,
        format: AudioFormat,
        timestamp: DateTime<Utc>,
        source: AudioSource,
        sequence_number: u32,
    ) -> Self {
        Self {
            data: data.into(),
            format,
            timestamp,
            source,
            sequence_number,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> AudioSource {
        self.source
    }

    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    /// Number of interleaved sample frames in the payload.
    pub fn sample_frames(&self) -> usize {
        match self.format.block_align() {
            0 => 0,
            align => self.data.len() / align,
        }
    }

    pub fn duration(&self) -> Duration {
        self.format.duration_of(self.data.len())
    }

    /// Same timing and identity, new payload and format.
    pub fn with_data(&self, data: Vec<u8>, format: AudioFormat) -> Self {
        Self {
            data: data.into(),
            format,
            timestamp: self.timestamp,
            source: self.source,
            sequence_number: self.sequence_number,
        }
    }

    /// Same payload, relabeled source.
    pub fn with_source(&self, source: AudioSource) -> Self {
        Self {
            data: Arc::clone(&self.data),
            format: self.format,
            timestamp: self.timestamp,
            source,
            sequence_number: self.sequence_number,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_sizes() {
        let format = AudioFormat::pcm(8000, 2, 16);
        assert_eq!(format.bytes_per_sample(), 2);
        assert_eq!(format.block_align(), 4);
        assert_eq!(format.byte_rate(), 32000);

        let g711 = AudioFormat::alaw(8000, 1);
        assert_eq!(g711.block_align(), 1);
        assert_eq!(g711.byte_rate(), 8000);
    }

    #[test]
    fn compatibility_requires_every_field() {
        let a = AudioFormat::pcm(8000, 1, 16);
        assert!(a.is_compatible(&AudioFormat::pcm(8000, 1, 16)));
        assert!(!a.is_compatible(&AudioFormat::pcm(16000, 1, 16)));
        assert!(!a.is_compatible(&AudioFormat::pcm(8000, 2, 16)));
        assert!(!a.is_compatible(&AudioFormat::pcm(8000, 1, 8)));
        assert!(!AudioFormat::alaw(8000, 1).is_compatible(&AudioFormat::ulaw(8000, 1)));
    }

    #[test]
    fn frame_duration_follows_format() {
        let frame = AudioFrame::new(
            vec![0u8; 320],
            AudioFormat::pcm(8000, 1, 16),
            Utc::now(),
            AudioSource::RtpIncoming,
            7,
        );
        assert_eq!(frame.sample_frames(), 160);
        assert!((frame.duration().as_secs_f64() - 0.020).abs() < 1e-9);
    }

    #[test]
    fn with_source_keeps_payload() {
        let frame = AudioFrame::new(
            vec![1u8, 2, 3, 4],
            AudioFormat::pcm(8000, 1, 16),
            Utc::now(),
            AudioSource::WebRtcOutgoing,
            3,
        );
        let mixed = frame.with_source(AudioSource::Mixed);
        assert_eq!(mixed.source(), AudioSource::Mixed);
        assert_eq!(mixed.data(), frame.data());
        assert_eq!(mixed.sequence_number(), 3);
    }

    #[test]
    fn legs_are_incoming_or_outgoing() {
        for leg in AudioSource::LEGS {
            assert!(leg.is_incoming() ^ leg.is_outgoing());
        }
        assert!(!AudioSource::Mixed.is_incoming());
        assert!(!AudioSource::Mixed.is_outgoing());
    }
}
