use log::warn;

use crate::models::audio_models::{AudioFrame, AudioSource, SampleFormat};
use crate::processing::converter::{read_pcm, rounded_average, write_pcm};
use crate::processing::g711;

/// Combines simultaneous frames from several call legs into one frame.
///
/// Stateless. All inputs must share a format; the output keeps that format and
/// is labeled `AudioSource::Mixed`.
///
/// Mixing rules by encoding:
/// - linear PCM (8/16/24/32-bit): average in the native width, rounded, clamped
/// - A-law / u-law: decode to linear, average, re-encode
/// - float: average as `f32`
/// - other PCM widths: per-byte average
#[derive(Debug, Clone, Copy, Default)]
pub struct AudioMixer;

impl AudioMixer {
    pub fn new() -> Self {
        Self
    }

    pub fn mix_frames(&self, frames: &[AudioFrame]) -> Option<AudioFrame> {
        let first = match frames {
            [] => return None,
            [single] => return Some(single.with_source(AudioSource::Mixed)),
            [first, ..] => first,
        };

        let format = *first.format();
        if let Some(other) = frames.iter().find(|f| !f.format().is_compatible(&format)) {
            warn!(
                "Cannot mix incompatible formats: {} ({:?}) vs {} ({:?})",
                format,
                first.source(),
                other.format(),
                other.source()
            );
            return None;
        }

        let sample_bytes = format.bytes_per_sample().max(1);
        let shortest = frames.iter().map(|f| f.len()).min().unwrap_or(0);
        let len = shortest - shortest % sample_bytes;
        let inputs: Vec<&[u8]> = frames.iter().map(|f| &f.data()[..len]).collect();

        let data = match (format.sample_format, format.bits_per_sample) {
            (SampleFormat::Pcm, 8 | 16 | 24 | 32) => mix_linear(&inputs, sample_bytes),
            (SampleFormat::Alaw, _) => mix_companded(&inputs, g711::alaw_to_linear, g711::linear_to_alaw),
            (SampleFormat::Ulaw, _) => mix_companded(&inputs, g711::ulaw_to_linear, g711::linear_to_ulaw),
            (SampleFormat::Float, 32) => mix_float(&inputs),
            _ => mix_bytes(&inputs, len),
        };

        let timestamp = frames.iter().map(|f| f.timestamp()).max().unwrap_or(first.timestamp());
        let sequence = frames.iter().map(|f| f.sequence_number()).max().unwrap_or(0);

        Some(AudioFrame::new(data, format, timestamp, AudioSource::Mixed, sequence))
    }

    /// RMS level of normalized samples (0.0–1.0 for full-scale audio).
    pub fn rms_level(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
        (sum_sq / samples.len() as f32).sqrt()
    }
}

fn mix_linear(inputs: &[&[u8]], sample_bytes: usize) -> Vec<u8> {
    let decoded: Vec<Vec<i32>> = inputs.iter().map(|d| read_pcm(d, sample_bytes)).collect();
    let count = decoded.len() as i64;
    let samples = decoded.first().map_or(0, Vec::len);

    let mixed: Vec<i32> = (0..samples)
        .map(|i| {
            let sum: i64 = decoded.iter().map(|d| d[i] as i64).sum();
            rounded_average(sum, count) as i32
        })
        .collect();
    write_pcm(&mixed, sample_bytes)
}

fn mix_companded(inputs: &[&[u8]], decode: fn(u8) -> i16, encode: fn(i16) -> u8) -> Vec<u8> {
    let count = inputs.len() as i64;
    let len = inputs.first().map_or(0, |d| d.len());

    (0..len)
        .map(|i| {
            let sum: i64 = inputs.iter().map(|d| decode(d[i]) as i64).sum();
            encode(rounded_average(sum, count) as i16)
        })
        .collect()
}

fn mix_float(inputs: &[&[u8]]) -> Vec<u8> {
    let count = inputs.len() as f32;
    let len = inputs.first().map_or(0, |d| d.len());
    let mut out = Vec::with_capacity(len);

    for offset in (0..len).step_by(4) {
        let sum: f32 = inputs
            .iter()
            .map(|d| f32::from_le_bytes([d[offset], d[offset + 1], d[offset + 2], d[offset + 3]]))
            .sum();
        out.extend_from_slice(&(sum / count).to_le_bytes());
    }
    out
}

fn mix_bytes(inputs: &[&[u8]], len: usize) -> Vec<u8> {
    let count = inputs.len() as i64;
    (0..len)
        .map(|i| {
            let sum: i64 = inputs.iter().map(|d| d[i] as i64).sum();
            rounded_average(sum, count) as u8
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::audio_models::AudioFormat;
    use chrono::{Duration, Utc};

    fn frame(data: Vec<u8>, format: AudioFormat, source: AudioSource, seq: u32) -> AudioFrame {
        AudioFrame::new(data, format, Utc::now(), source, seq)
    }

    fn pcm16(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn to_i16(data: &[u8]) -> Vec<i16> {
        data.chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn empty_input_mixes_to_nothing() {
        assert!(AudioMixer::new().mix_frames(&[]).is_none());
    }

    #[test]
    fn single_frame_is_relabeled() {
        let input = frame(pcm16(&[1, 2]), AudioFormat::pcm(8000, 1, 16), AudioSource::RtpIncoming, 7);
        let mixed = AudioMixer::new().mix_frames(std::slice::from_ref(&input)).unwrap();

        assert_eq!(mixed.source(), AudioSource::Mixed);
        assert_eq!(mixed.data(), input.data());
        assert_eq!(mixed.sequence_number(), 7);
    }

    #[test]
    fn pcm16_average_is_rounded_and_clamped() {
        let format = AudioFormat::pcm(8000, 1, 16);
        let a = frame(pcm16(&[100, -200, 32767, -32768]), format, AudioSource::RtpIncoming, 3);
        let b = frame(pcm16(&[201, -201, 32767, -32768]), format, AudioSource::WebRtcIncoming, 9);

        let mixed = AudioMixer::new().mix_frames(&[a, b]).unwrap();
        assert_eq!(to_i16(mixed.data()), vec![151, -201, 32767, -32768]);
        assert_eq!(mixed.sequence_number(), 9);
        assert_eq!(mixed.source(), AudioSource::Mixed);
    }

    #[test]
    fn output_is_trimmed_to_shortest_frame() {
        let format = AudioFormat::pcm(8000, 1, 16);
        let a = frame(pcm16(&[10, 20, 30]), format, AudioSource::RtpIncoming, 1);
        let mut short = pcm16(&[30]);
        short.push(0xAB); // half a sample
        let b = frame(short, format, AudioSource::RtpOutgoing, 1);

        let mixed = AudioMixer::new().mix_frames(&[a, b]).unwrap();
        assert_eq!(to_i16(mixed.data()), vec![20]);
    }

    #[test]
    fn incompatible_formats_are_rejected() {
        let a = frame(pcm16(&[1]), AudioFormat::pcm(8000, 1, 16), AudioSource::RtpIncoming, 1);
        let b = frame(pcm16(&[1]), AudioFormat::pcm(16000, 1, 16), AudioSource::WebRtcIncoming, 1);
        assert!(AudioMixer::new().mix_frames(&[a, b]).is_none());
    }

    #[test]
    fn latest_timestamp_wins() {
        let format = AudioFormat::pcm(8000, 1, 16);
        let now = Utc::now();
        let later = now + Duration::milliseconds(20);
        let a = AudioFrame::new(pcm16(&[0]), format, later, AudioSource::RtpIncoming, 1);
        let b = AudioFrame::new(pcm16(&[0]), format, now, AudioSource::WebRtcIncoming, 1);

        assert_eq!(AudioMixer::new().mix_frames(&[a, b]).unwrap().timestamp(), later);
    }

    #[test]
    fn unsigned_eight_bit_mixes_around_midpoint() {
        let format = AudioFormat::pcm(8000, 1, 8);
        let a = frame(vec![0, 255], format, AudioSource::RtpIncoming, 1);
        let b = frame(vec![128, 255], format, AudioSource::WebRtcIncoming, 1);

        let mixed = AudioMixer::new().mix_frames(&[a, b]).unwrap();
        assert_eq!(mixed.data(), &[64, 255]);
    }

    #[test]
    fn ulaw_silence_stays_silent() {
        let format = AudioFormat::ulaw(8000, 1);
        let a = frame(vec![0xFF; 4], format, AudioSource::RtpIncoming, 1);
        let b = frame(vec![0xFF; 4], format, AudioSource::WebRtcIncoming, 1);

        let mixed = AudioMixer::new().mix_frames(&[a, b]).unwrap();
        assert_eq!(mixed.data(), &[0xFF; 4]);
    }

    #[test]
    fn alaw_mix_is_linear_average() {
        let format = AudioFormat::alaw(8000, 1);
        let loud = g711::linear_to_alaw(8000);
        let quiet = g711::linear_to_alaw(-8000);
        let a = frame(vec![loud], format, AudioSource::RtpIncoming, 1);
        let b = frame(vec![quiet], format, AudioSource::WebRtcIncoming, 1);

        let mixed = AudioMixer::new().mix_frames(&[a, b]).unwrap();
        assert!(g711::alaw_to_linear(mixed.data()[0]).abs() <= 8);
    }

    #[test]
    fn float_frames_average() {
        let format = AudioFormat::float(8000, 1);
        let bytes = |v: &[f32]| v.iter().flat_map(|s| s.to_le_bytes()).collect::<Vec<u8>>();
        let a = frame(bytes(&[0.5, -1.0]), format, AudioSource::RtpIncoming, 1);
        let b = frame(bytes(&[0.25, 1.0]), format, AudioSource::WebRtcIncoming, 1);

        let mixed = AudioMixer::new().mix_frames(&[a, b]).unwrap();
        let out: Vec<f32> = mixed
            .data()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        approx::assert_abs_diff_eq!(out[0], 0.375, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(out[1], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn odd_pcm_width_falls_back_to_byte_average() {
        let format = AudioFormat::pcm(8000, 1, 12);
        let a = frame(vec![10, 20], format, AudioSource::RtpIncoming, 1);
        let b = frame(vec![11, 40], format, AudioSource::WebRtcIncoming, 1);

        let mixed = AudioMixer::new().mix_frames(&[a, b]).unwrap();
        assert_eq!(mixed.data(), &[11, 30]);
    }

    #[test]
    fn rms_level_of_normalized_samples() {
        assert_eq!(AudioMixer::rms_level(&[]), 0.0);
        approx::assert_abs_diff_eq!(AudioMixer::rms_level(&[1.0, -1.0, 1.0]), 1.0, epsilon = 1e-6);
    }
}
