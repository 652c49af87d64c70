//! WAV file format utilities.
//!
//! Generates standard 44-byte RIFF WAV headers, patches their size fields once
//! recording completes, and parses headers back for validation.

use crate::models::audio_models::AudioFormat;
use crate::models::error::{RecordingError, Result};

/// Size of the standard WAV RIFF header in bytes.
pub const WAV_HEADER_SIZE: usize = 44;

/// Largest file a RIFF header can describe (`u32::MAX` chunk size plus the 8-byte preamble).
pub const MAX_WAV_FILE_SIZE: u64 = u32::MAX as u64 + 8;

/// Offset of the RIFF chunk size (`file_size - 8`).
pub const RIFF_SIZE_OFFSET: u64 = 4;

/// Offset of the data chunk size.
pub const DATA_SIZE_OFFSET: u64 = 40;

const PCM_FORMAT_CODE: u16 = 1;

/// Generate a 44-byte WAV RIFF header for linear PCM.
///
/// Layout:
/// ```text
/// [0-3]    "RIFF"
/// [4-7]    file size - 8 (36 + data_size)
/// [8-11]   "WAVE"
/// [12-15]  "fmt "
/// [16-19]  16 (PCM format chunk size)
/// [20-21]  1 (PCM format code)
/// [22-23]  channels
/// [24-27]  sample_rate
/// [28-31]  byte_rate
/// [32-33]  block_align
/// [34-35]  bits_per_sample
/// [36-39]  "data"
/// [40-43]  data_size
/// ```
pub fn generate_wav_header(format: &AudioFormat, data_size: u32) -> [u8; WAV_HEADER_SIZE] {
    let chunk_size = 36u32.saturating_add(data_size);

    let mut header = [0u8; WAV_HEADER_SIZE];

    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&chunk_size.to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");

    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&PCM_FORMAT_CODE.to_le_bytes());
    header[22..24].copy_from_slice(&format.channels.to_le_bytes());
    header[24..28].copy_from_slice(&format.sample_rate.to_le_bytes());
    header[28..32].copy_from_slice(&(format.byte_rate() as u32).to_le_bytes());
    header[32..34].copy_from_slice(&(format.block_align() as u16).to_le_bytes());
    header[34..36].copy_from_slice(&format.bits_per_sample.to_le_bytes());

    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&data_size.to_le_bytes());

    header
}

/// RIFF chunk size field for a file of `total_file_size` bytes.
pub fn riff_size(total_file_size: u64) -> u32 {
    total_file_size.saturating_sub(8).min(u32::MAX as u64) as u32
}

/// Patch the file-size field at offset 4 (RIFF chunk size = file_size - 8).
pub fn patch_file_size(header: &mut [u8], total_file_size: u64) {
    header[4..8].copy_from_slice(&riff_size(total_file_size).to_le_bytes());
}

/// Patch the data-size field at offset 40.
pub fn patch_data_size(header: &mut [u8], data_size: u64) {
    let data_size_u32 = data_size.min(u32::MAX as u64) as u32;
    header[40..44].copy_from_slice(&data_size_u32.to_le_bytes());
}

/// Parsed view of a canonical WAV header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    pub riff_size: u32,
    pub format_code: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub byte_rate: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
    pub data_size: u32,
}

impl WavHeader {
    /// Parses the first 44 bytes of a file.
    ///
    /// Accepts only the canonical layout this crate writes: `RIFF`/`WAVE`, a
    /// 16-byte `fmt ` chunk at offset 12 and the `data` chunk at offset 36.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < WAV_HEADER_SIZE {
            return Err(RecordingError::InvalidFormat(format!(
                "header too short: {} bytes",
                bytes.len()
            )));
        }
        if &bytes[0..4] != b"RIFF" {
            return Err(RecordingError::InvalidFormat("missing RIFF marker".into()));
        }
        if &bytes[8..12] != b"WAVE" {
            return Err(RecordingError::InvalidFormat("missing WAVE marker".into()));
        }
        if &bytes[12..16] != b"fmt " {
            return Err(RecordingError::InvalidFormat("missing fmt chunk".into()));
        }
        if &bytes[36..40] != b"data" {
            return Err(RecordingError::InvalidFormat("missing data chunk".into()));
        }

        let u16_at = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);

        Ok(Self {
            riff_size: u32_at(4),
            format_code: u16_at(20),
            channels: u16_at(22),
            sample_rate: u32_at(24),
            byte_rate: u32_at(28),
            block_align: u16_at(32),
            bits_per_sample: u16_at(34),
            data_size: u32_at(40),
        })
    }

    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat::pcm(self.sample_rate, self.channels, self.bits_per_sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_44_bytes() {
        let header = generate_wav_header(&AudioFormat::pcm(8000, 1, 16), 0);
        assert_eq!(header.len(), 44);
    }

    #[test]
    fn header_riff_magic() {
        let header = generate_wav_header(&AudioFormat::pcm(8000, 1, 16), 0);
        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(&header[8..12], b"WAVE");
        assert_eq!(&header[12..16], b"fmt ");
        assert_eq!(&header[36..40], b"data");
    }

    #[test]
    fn header_48khz_stereo_16bit() {
        let header = generate_wav_header(&AudioFormat::pcm(48000, 2, 16), 9600);
        let parsed = WavHeader::parse(&header).unwrap();

        assert_eq!(parsed.format_code, 1);
        assert_eq!(parsed.channels, 2);
        assert_eq!(parsed.sample_rate, 48000);
        assert_eq!(parsed.byte_rate, 192000); // 48000 * 2 * 16/8
        assert_eq!(parsed.block_align, 4);
        assert_eq!(parsed.bits_per_sample, 16);
        assert_eq!(parsed.data_size, 9600);
        assert_eq!(parsed.riff_size, 36 + 9600);
        assert_eq!(parsed.audio_format(), AudioFormat::pcm(48000, 2, 16));
    }

    #[test]
    fn narrowband_mono_rates() {
        let parsed = WavHeader::parse(&generate_wav_header(&AudioFormat::pcm(8000, 1, 16), 0)).unwrap();
        assert_eq!(parsed.byte_rate, 16000);
        assert_eq!(parsed.block_align, 2);
        assert_eq!(parsed.riff_size, 36);
    }

    #[test]
    fn patch_sizes() {
        let mut header = generate_wav_header(&AudioFormat::pcm(8000, 1, 16), 0);

        patch_data_size(&mut header, 8000);
        patch_file_size(&mut header, 8000 + 44);

        let parsed = WavHeader::parse(&header).unwrap();
        assert_eq!(parsed.data_size, 8000);
        assert_eq!(parsed.riff_size, 8000 + 36);
    }

    #[test]
    fn parse_rejects_damaged_headers() {
        let good = generate_wav_header(&AudioFormat::pcm(8000, 1, 16), 0);

        assert!(WavHeader::parse(&good[..20]).is_err());

        for (offset, name) in [(0, "RIFF"), (8, "WAVE"), (12, "fmt "), (36, "data")] {
            let mut bad = good;
            bad[offset] = b'X';
            assert!(WavHeader::parse(&bad).is_err(), "{} not checked", name);
        }
    }
}
