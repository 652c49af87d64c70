use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{error, info, warn};

use crate::models::audio_models::{AudioFormat, AudioFrame};
use crate::models::error::{RecordingError, Result};
use crate::processing::converter::AudioFormatConverter;
use crate::processing::wav_format::{self, WavHeader, MAX_WAV_FILE_SIZE, WAV_HEADER_SIZE};
use crate::storage::streaming_encoder::StreamingAudioEncoder;

/// Allowed gap between the RIFF size declared in the header and the real file size.
const RIFF_SIZE_TOLERANCE: u64 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    Missing,
    Empty,
    TooSmall(u64),
    InvalidHeader(String),
    SizeMismatch { declared: u64, actual: u64 },
    Unreadable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub path: PathBuf,
    pub file_size: u64,
    pub header: Option<WavHeader>,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Post-write check that a recording is not empty or truncated, plus
/// reconstruction of a broken file from frames still held in memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroByteFileDetector {
    converter: AudioFormatConverter,
}

impl ZeroByteFileDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self, path: &Path) -> ValidationReport {
        let mut report = ValidationReport {
            path: path.to_path_buf(),
            file_size: 0,
            header: None,
            issues: Vec::new(),
        };

        let size = match fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) | Err(_) => {
                report.issues.push(ValidationIssue::Missing);
                return report;
            }
        };
        report.file_size = size;

        if size == 0 {
            report.issues.push(ValidationIssue::Empty);
            return report;
        }
        if size < WAV_HEADER_SIZE as u64 {
            report.issues.push(ValidationIssue::TooSmall(size));
            return report;
        }
        if !is_wav(path) {
            return report;
        }

        let mut header = [0u8; WAV_HEADER_SIZE];
        if let Err(e) = File::open(path).and_then(|mut f| f.read_exact(&mut header)) {
            report.issues.push(ValidationIssue::Unreadable(e.to_string()));
            return report;
        }

        match WavHeader::parse(&header) {
            Ok(parsed) => {
                let declared = parsed.riff_size as u64 + 8;
                if declared.abs_diff(size) > RIFF_SIZE_TOLERANCE {
                    report.issues.push(ValidationIssue::SizeMismatch {
                        declared,
                        actual: size,
                    });
                }
                report.header = Some(parsed);
            }
            Err(e) => report.issues.push(ValidationIssue::InvalidHeader(e.to_string())),
        }
        report
    }

    /// Rewrite the size fields of a WAV header to match the file on disk.
    ///
    /// Only the header is touched; the audio data stays as written.
    pub fn repair_header(&self, path: &Path) -> Result<ValidationReport> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| RecordingError::io("failed to open recording for repair", e))?;
        let size = file
            .metadata()
            .map_err(|e| RecordingError::io("failed to stat recording", e))?
            .len();
        if size > MAX_WAV_FILE_SIZE {
            return Err(RecordingError::Storage(format!(
                "{} is {} bytes, larger than a WAV header can describe",
                path.display(),
                size
            )));
        }

        let mut header = [0u8; WAV_HEADER_SIZE];
        file.read_exact(&mut header)
            .map_err(|e| RecordingError::io("failed to read header", e))?;
        WavHeader::parse(&header)?;

        wav_format::patch_file_size(&mut header, size);
        wav_format::patch_data_size(&mut header, size - WAV_HEADER_SIZE as u64);
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.write_all(&header))
            .and_then(|_| file.sync_all())
            .map_err(|e| RecordingError::io("failed to rewrite header", e))?;
        drop(file);

        let report = self.validate(path);
        if !report.is_valid() {
            return Err(RecordingError::Storage(format!(
                "header repair left {} invalid: {:?}",
                path.display(),
                report.issues
            )));
        }
        info!("Repaired header of {} ({} bytes)", path.display(), size);
        Ok(report)
    }

    /// Rebuild `path` from `frames`.
    ///
    /// Writes a fresh header plus the converted, concatenated frames to a
    /// temporary file, swaps it in while keeping a backup of the original,
    /// and restores the backup if the rebuilt file does not validate.
    /// Refuses when the file on disk already holds more audio than `frames`.
    pub fn recover_from_buffer(
        &self,
        path: &Path,
        frames: &[AudioFrame],
        target_format: &AudioFormat,
    ) -> Result<ValidationReport> {
        let format = StreamingAudioEncoder::output_format_for(target_format);

        let mut data = Vec::new();
        for frame in frames {
            match self.converter.convert_format(frame, &format) {
                Some(converted) => data.extend_from_slice(converted.data()),
                None => warn!(
                    "Skipping frame {} from {:?}: cannot convert {} to {}",
                    frame.sequence_number(),
                    frame.source(),
                    frame.format(),
                    format
                ),
            }
        }
        if data.is_empty() {
            return Err(RecordingError::Storage(format!(
                "nothing to recover for {}",
                path.display()
            )));
        }

        let existing = fs::metadata(path)
            .map(|m| m.len().saturating_sub(WAV_HEADER_SIZE as u64))
            .unwrap_or(0);
        if existing > data.len() as u64 {
            return Err(RecordingError::Storage(format!(
                "{} holds {} audio bytes, only {} buffered",
                path.display(),
                existing,
                data.len()
            )));
        }

        let temp = sibling(path, "recovering");
        let backup = sibling(path, "bak");

        let data_size = data.len().min(u32::MAX as usize) as u32;
        write_file(&temp, &wav_format::generate_wav_header(&format, data_size), &data)
            .map_err(|e| RecordingError::io("failed to write recovered file", e))?;

        let had_original = path.exists();
        if had_original {
            fs::rename(path, &backup).map_err(|e| RecordingError::io("failed to back up original", e))?;
        }
        if let Err(e) = fs::rename(&temp, path) {
            if had_original {
                let _ = fs::rename(&backup, path);
            }
            return Err(RecordingError::io("failed to move recovered file into place", e));
        }

        let report = self.validate(path);
        if !report.is_valid() {
            error!("Recovered file {} is still invalid: {:?}", path.display(), report.issues);
            if had_original {
                fs::rename(&backup, path).map_err(|e| RecordingError::io("failed to restore backup", e))?;
            }
            return Err(RecordingError::Storage(format!(
                "recovered file failed validation: {:?}",
                report.issues
            )));
        }

        if had_original {
            let _ = fs::remove_file(&backup);
        }
        info!(
            "Recovered {} from {} buffered frames ({} bytes)",
            path.display(),
            frames.len(),
            data.len()
        );
        Ok(report)
    }
}

fn is_wav(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("wav"))
}

/// `call.wav` → `call.wav.<suffix>`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn write_file(path: &Path, header: &[u8], data: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(header)?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::audio_models::AudioSource;
    use chrono::Utc;

    fn frames(count: u32) -> Vec<AudioFrame> {
        (0..count)
            .map(|seq| {
                AudioFrame::new(
                    vec![0x22u8; 160],
                    AudioFormat::pcm(8000, 1, 16),
                    Utc::now(),
                    AudioSource::RtpIncoming,
                    seq,
                )
            })
            .collect()
    }

    #[test]
    fn missing_and_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let detector = ZeroByteFileDetector::new();

        let missing = detector.validate(&dir.path().join("nope.wav"));
        assert_eq!(missing.issues, vec![ValidationIssue::Missing]);

        let empty = dir.path().join("empty.wav");
        fs::write(&empty, b"").unwrap();
        assert_eq!(detector.validate(&empty).issues, vec![ValidationIssue::Empty]);

        let tiny = dir.path().join("tiny.wav");
        fs::write(&tiny, [0u8; 10]).unwrap();
        assert_eq!(detector.validate(&tiny).issues, vec![ValidationIssue::TooSmall(10)]);
    }

    #[test]
    fn well_formed_wav_passes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.wav");
        let format = AudioFormat::pcm(8000, 1, 16);
        write_file(&path, &wav_format::generate_wav_header(&format, 320), &[0u8; 320]).unwrap();

        let report = ZeroByteFileDetector::new().validate(&path);
        assert!(report.is_valid(), "{:?}", report.issues);
        assert_eq!(report.file_size, 364);
        assert_eq!(report.header.map(|h| h.data_size), Some(320));
    }

    #[test]
    fn garbage_header_is_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.wav");
        fs::write(&path, vec![0x5Au8; 100]).unwrap();

        let report = ZeroByteFileDetector::new().validate(&path);
        assert!(matches!(report.issues[..], [ValidationIssue::InvalidHeader(_)]));
    }

    #[test]
    fn unpatched_header_is_a_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truncated.wav");
        let format = AudioFormat::pcm(8000, 1, 16);
        write_file(&path, &wav_format::generate_wav_header(&format, 0), &[0u8; 1600]).unwrap();

        let report = ZeroByteFileDetector::new().validate(&path);
        assert_eq!(
            report.issues,
            vec![ValidationIssue::SizeMismatch {
                declared: 44,
                actual: 1644
            }]
        );
    }

    #[test]
    fn non_wav_files_only_need_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("call.opus");
        fs::write(&path, vec![1u8; 64]).unwrap();
        assert!(ZeroByteFileDetector::new().validate(&path).is_valid());
    }

    #[test]
    fn recover_rebuilds_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("call.wav");
        fs::write(&path, b"").unwrap();

        let detector = ZeroByteFileDetector::new();
        let report = detector
            .recover_from_buffer(&path, &frames(10), &AudioFormat::pcm(8000, 1, 16))
            .unwrap();

        assert!(report.is_valid());
        assert_eq!(fs::metadata(&path).unwrap().len(), 44 + 1600);
        assert!(!sibling(&path, "bak").exists());
        assert!(!sibling(&path, "recovering").exists());
    }

    #[test]
    fn recover_converts_to_target_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.wav");

        let report = ZeroByteFileDetector::new()
            .recover_from_buffer(&path, &frames(2), &AudioFormat::pcm(16000, 2, 16))
            .unwrap();

        let header = report.header.unwrap();
        assert_eq!(header.sample_rate, 16000);
        assert_eq!(header.channels, 2);
        assert_eq!(header.data_size, 2 * 160 * 2 * 2);
    }

    #[test]
    fn recover_never_shrinks_a_longer_recording() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.wav");
        let format = AudioFormat::pcm(8000, 1, 16);
        // Header claims 1600 bytes, file holds 16000.
        write_file(&path, &wav_format::generate_wav_header(&format, 1600), &[0x11u8; 16000]).unwrap();

        let detector = ZeroByteFileDetector::new();
        assert!(!detector.validate(&path).is_valid());
        assert!(detector.recover_from_buffer(&path, &frames(10), &format).is_err());
        assert_eq!(fs::metadata(&path).unwrap().len(), 44 + 16000);
    }

    #[test]
    fn repair_header_keeps_audio() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unpatched.wav");
        let format = AudioFormat::pcm(8000, 1, 16);
        write_file(&path, &wav_format::generate_wav_header(&format, 0), &[0x33u8; 1600]).unwrap();

        let report = ZeroByteFileDetector::new().repair_header(&path).unwrap();
        assert!(report.is_valid());
        assert_eq!(report.header.map(|h| h.data_size), Some(1600));

        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 44 + 1600);
        assert!(bytes[44..].iter().all(|&b| b == 0x33));
    }

    #[test]
    fn oversized_wav_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.wav");
        let format = AudioFormat::pcm(48000, 2, 32);
        let total = 5 * 1024 * 1024 * 1024u64;

        let mut header = wav_format::generate_wav_header(&format, 0);
        wav_format::patch_file_size(&mut header, total);
        wav_format::patch_data_size(&mut header, total - 44);
        let file = File::create(&path).unwrap();
        (&file).write_all(&header).unwrap();
        file.set_len(total).unwrap();
        drop(file);

        let detector = ZeroByteFileDetector::new();
        let report = detector.validate(&path);
        assert!(matches!(report.issues[..], [ValidationIssue::SizeMismatch { .. }]));

        assert!(detector.repair_header(&path).is_err());
        assert!(detector.recover_from_buffer(&path, &frames(10), &format).is_err());
        assert_eq!(fs::metadata(&path).unwrap().len(), total);
    }

    #[test]
    fn recover_without_frames_keeps_original() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keep.wav");
        fs::write(&path, b"original").unwrap();

        assert!(ZeroByteFileDetector::new()
            .recover_from_buffer(&path, &[], &AudioFormat::pcm(8000, 1, 16))
            .is_err());
        assert_eq!(fs::read(&path).unwrap(), b"original");
    }
}
