use std::borrow::Cow;

use crate::models::audio_models::{AudioFormat, AudioFrame, SampleFormat};
use crate::processing::g711;

/// Signed range of a linear PCM sample stored in `bytes` bytes.
pub(crate) fn pcm_range(bytes: usize) -> (i64, i64) {
    let bits = (bytes * 8) as u32;
    (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
}

/// Reads interleaved linear PCM into signed samples. 8-bit PCM is unsigned on disk.
pub(crate) fn read_pcm(data: &[u8], bytes: usize) -> Vec<i32> {
    match bytes {
        1 => data.iter().map(|&b| b as i32 - 128).collect(),
        2 => data
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as i32)
            .collect(),
        3 => data
            .chunks_exact(3)
            // Place the 24 bits in the top of an i32 and shift back down to sign-extend.
            .map(|c| i32::from_le_bytes([0, c[0], c[1], c[2]]) >> 8)
            .collect(),
        4 => data
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        _ => Vec::new(),
    }
}

/// Writes signed samples as little-endian linear PCM, clamping to the width.
pub(crate) fn write_pcm(samples: &[i32], bytes: usize) -> Vec<u8> {
    let (min, max) = pcm_range(bytes);
    let mut out = Vec::with_capacity(samples.len() * bytes);
    for &sample in samples {
        let value = (sample as i64).clamp(min, max);
        match bytes {
            1 => out.push((value + 128) as u8),
            2 => out.extend_from_slice(&(value as i16).to_le_bytes()),
            3 => out.extend_from_slice(&(value as i32).to_le_bytes()[..3]),
            _ => out.extend_from_slice(&(value as i32).to_le_bytes()),
        }
    }
    out
}

/// `sum / count` rounded half away from zero.
pub(crate) fn rounded_average(sum: i64, count: i64) -> i64 {
    (sum as f64 / count as f64).round() as i64
}

fn is_linear_width(bits: u16) -> bool {
    matches!(bits, 8 | 16 | 24 | 32)
}

/// Pure sample transforms between `AudioFormat`s.
///
/// Conversion runs: decode to linear → bit depth → channels → resample → encode.
/// Companded and float targets are produced from 16-bit linear samples. Every
/// stage returns `None` on input it cannot handle and that aborts the whole
/// conversion.
#[derive(Debug, Clone, Copy, Default)]
pub struct AudioFormatConverter;

impl AudioFormatConverter {
    pub fn new() -> Self {
        Self
    }

    /// Converts `frame` to `target`. Returns the same frame, borrowed, when the
    /// formats are already compatible.
    pub fn convert_format<'a>(
        &self,
        frame: &'a AudioFrame,
        target: &AudioFormat,
    ) -> Option<Cow<'a, AudioFrame>> {
        let source = frame.format();
        if source.is_compatible(target) {
            return Some(Cow::Borrowed(frame));
        }
        if target.channels == 0 || target.sample_rate == 0 || source.sample_rate == 0 {
            return None;
        }

        let linear_bits = match target.sample_format {
            SampleFormat::Pcm => target.bits_per_sample,
            SampleFormat::Alaw | SampleFormat::Ulaw if target.bits_per_sample == 8 => 16,
            SampleFormat::Float if target.bits_per_sample == 32 => 16,
            _ => return None,
        };

        let (samples, bits) = Self::convert_sample_format(frame.data(), source)?;
        let samples = Self::convert_bit_depth(&samples, bits, linear_bits)?;
        let samples = Self::convert_channels(&samples, source.channels, target.channels)?;
        let samples = Self::resample(
            &samples,
            target.channels,
            source.sample_rate,
            target.sample_rate,
        )?;
        let data = Self::encode_from_linear(&samples, linear_bits, target.sample_format)?;

        Some(Cow::Owned(frame.with_data(data, *target)))
    }

    /// Sample-format stage: decodes any supported encoding to linear samples.
    ///
    /// Returns the samples and their bit depth. Companded and float input
    /// decodes to 16-bit.
    pub fn convert_sample_format(data: &[u8], format: &AudioFormat) -> Option<(Vec<i32>, u16)> {
        if format.channels == 0 || data.len() % format.block_align().max(1) != 0 {
            return None;
        }
        match format.sample_format {
            SampleFormat::Pcm => {
                if !is_linear_width(format.bits_per_sample) {
                    return None;
                }
                Some((read_pcm(data, format.bytes_per_sample()), format.bits_per_sample))
            }
            SampleFormat::Alaw => Some((
                g711::decode_alaw(data).into_iter().map(i32::from).collect(),
                16,
            )),
            SampleFormat::Ulaw => Some((
                g711::decode_ulaw(data).into_iter().map(i32::from).collect(),
                16,
            )),
            SampleFormat::Float => {
                if format.bits_per_sample != 32 {
                    return None;
                }
                let samples = data
                    .chunks_exact(4)
                    .map(|c| {
                        let value = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                        (value.clamp(-1.0, 1.0) * i16::MAX as f32) as i32
                    })
                    .collect();
                Some((samples, 16))
            }
        }
    }

    /// Final stage: encodes linear samples of `bits` depth into `sample_format`.
    pub fn encode_from_linear(
        samples: &[i32],
        bits: u16,
        sample_format: SampleFormat,
    ) -> Option<Vec<u8>> {
        match sample_format {
            SampleFormat::Pcm if is_linear_width(bits) => {
                Some(write_pcm(samples, bits as usize / 8))
            }
            SampleFormat::Alaw | SampleFormat::Ulaw | SampleFormat::Float if bits == 16 => {
                let clamped = samples
                    .iter()
                    .map(|&s| s.clamp(i16::MIN as i32, i16::MAX as i32) as i16);
                Some(match sample_format {
                    SampleFormat::Alaw => clamped.map(g711::linear_to_alaw).collect(),
                    SampleFormat::Ulaw => clamped.map(g711::linear_to_ulaw).collect(),
                    _ => clamped
                        .flat_map(|s| (s as f32 / 32768.0).to_le_bytes())
                        .collect(),
                })
            }
            _ => None,
        }
    }

    /// Bit-depth stage: arithmetic shift by the depth delta, clamped to the target width.
    pub fn convert_bit_depth(samples: &[i32], from_bits: u16, to_bits: u16) -> Option<Vec<i32>> {
        if !is_linear_width(from_bits) || !is_linear_width(to_bits) {
            return None;
        }
        if from_bits == to_bits {
            return Some(samples.to_vec());
        }

        let (min, max) = pcm_range(to_bits as usize / 8);
        let shift = to_bits as i32 - from_bits as i32;
        Some(
            samples
                .iter()
                .map(|&s| {
                    let value = s as i64;
                    let shifted = if shift > 0 {
                        value << shift
                    } else {
                        value >> -shift
                    };
                    shifted.clamp(min, max) as i32
                })
                .collect(),
        )
    }

    /// Channel stage.
    ///
    /// Mono→stereo duplicates, stereo→mono averages. Any other N→M mapping keeps
    /// the first min(N, M) channels and fills extra outputs from channel 0.
    pub fn convert_channels(samples: &[i32], from: u16, to: u16) -> Option<Vec<i32>> {
        if from == 0 || to == 0 {
            return None;
        }
        if from == to {
            return Some(samples.to_vec());
        }

        let from = from as usize;
        let to = to as usize;
        let frames = samples.len() / from;
        let mut out = Vec::with_capacity(frames * to);

        for frame in samples.chunks_exact(from) {
            match (from, to) {
                (1, 2) => {
                    out.push(frame[0]);
                    out.push(frame[0]);
                }
                (2, 1) => {
                    let sum = frame[0] as i64 + frame[1] as i64;
                    out.push(rounded_average(sum, 2) as i32);
                }
                _ => {
                    for ch in 0..to {
                        out.push(if ch < from { frame[ch] } else { frame[0] });
                    }
                }
            }
        }
        Some(out)
    }

    /// Resampling stage: linear interpolation over interleaved samples.
    ///
    /// Each output frame maps to a fractional input position and interpolates
    /// between the floor and ceiling input frames per channel. Returns the input
    /// unchanged when the rates match.
    pub fn resample(
        samples: &[i32],
        channels: u16,
        from_rate: u32,
        to_rate: u32,
    ) -> Option<Vec<i32>> {
        if channels == 0 || from_rate == 0 || to_rate == 0 {
            return None;
        }
        if from_rate == to_rate {
            return Some(samples.to_vec());
        }

        let channels = channels as usize;
        let in_frames = samples.len() / channels;
        if in_frames == 0 {
            return Some(Vec::new());
        }

        let out_frames = (in_frames as u64 * to_rate as u64 / from_rate as u64) as usize;
        let step = from_rate as f64 / to_rate as f64;
        let last = in_frames - 1;

        let mut out = Vec::with_capacity(out_frames * channels);
        for i in 0..out_frames {
            let position = i as f64 * step;
            let index = (position.floor() as usize).min(last);
            let next = (index + 1).min(last);
            let fraction = position - index as f64;

            for ch in 0..channels {
                let a = samples[index * channels + ch] as f64;
                let b = samples[next * channels + ch] as f64;
                out.push((a + (b - a) * fraction).round() as i32);
            }
        }
        Some(out)
    }

    /// Resamples a whole frame, borrowing it back unchanged when the rates match.
    pub fn resample_frame<'a>(&self, frame: &'a AudioFrame, to_rate: u32) -> Option<Cow<'a, AudioFrame>> {
        let mut target = *frame.format();
        target.sample_rate = to_rate;
        self.convert_format(frame, &target)
    }
}
