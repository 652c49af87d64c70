use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use sha2::{Digest, Sha256};

use crate::models::audio_models::{AudioFormat, AudioFrame, SampleFormat};
use crate::models::error::{RecordingError, Result};
use crate::processing::converter::AudioFormatConverter;
use crate::processing::wav_format::{self, DATA_SIZE_OFFSET, RIFF_SIZE_OFFSET, WAV_HEADER_SIZE};
use crate::traits::delegates::{DelegateSet, EncoderDelegate};

/// What a finalized recording file contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingSummary {
    pub path: PathBuf,
    pub format: AudioFormat,
    pub data_bytes: u64,
    pub file_size: u64,
    /// Lowercase hex SHA-256 of the finished file.
    pub checksum: String,
}

impl EncodingSummary {
    pub fn duration(&self) -> Duration {
        self.format.duration_of(self.data_bytes as usize)
    }
}

/// Incremental WAV writer.
///
/// `initialize` writes a 44-byte header declaring zero data, `write_frame`
/// appends PCM converted to the output format, and `finalize` patches the
/// RIFF size at offset 4 and the data size at offset 40. Between those calls
/// the file on disk is a valid but incomplete WAV.
///
/// ```text
/// [44-byte WAV header]
/// [little-endian PCM data...]
/// ```
///
/// Not synchronized; the owner serializes writes.
pub struct StreamingAudioEncoder {
    converter: AudioFormatConverter,
    delegates: DelegateSet<dyn EncoderDelegate>,
    file: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    input_format: Option<AudioFormat>,
    output_format: Option<AudioFormat>,
    data_bytes: u64,
    frames_written: u64,
}

impl StreamingAudioEncoder {
    pub fn new() -> Self {
        Self {
            converter: AudioFormatConverter::new(),
            delegates: DelegateSet::new(),
            file: None,
            path: None,
            input_format: None,
            output_format: None,
            data_bytes: 0,
            frames_written: 0,
        }
    }

    pub fn add_delegate(&self, delegate: Arc<dyn EncoderDelegate>) {
        self.delegates.add(delegate);
    }

    /// PCM format written for `input`. Companded and float input is widened to 16-bit.
    pub fn output_format_for(input: &AudioFormat) -> AudioFormat {
        match (input.sample_format, input.bits_per_sample) {
            (SampleFormat::Pcm, 8 | 16 | 24 | 32) => *input,
            _ => AudioFormat::pcm(input.sample_rate, input.channels, 16),
        }
    }

    /// Create the output file and write the placeholder header.
    pub fn initialize(&mut self, input_format: AudioFormat, output_path: &Path) -> Result<()> {
        if self.file.is_some() {
            return Err(self.report(RecordingError::Initialization(
                "encoder is already initialized".into(),
            )));
        }
        if input_format.channels == 0 || input_format.sample_rate == 0 {
            return Err(self.report(RecordingError::Initialization(format!(
                "unusable input format: {}",
                input_format
            ))));
        }

        let output_format = Self::output_format_for(&input_format);
        match Self::create(output_path, &output_format) {
            Ok(file) => {
                self.file = Some(file);
                self.path = Some(output_path.to_path_buf());
                self.input_format = Some(input_format);
                self.output_format = Some(output_format);
                self.data_bytes = 0;
                self.frames_written = 0;
                info!(
                    "Encoder initialized: {} -> {} at {}",
                    input_format,
                    output_format,
                    output_path.display()
                );
                Ok(())
            }
            Err(e) => Err(self.report(RecordingError::Initialization(format!(
                "failed to create {}: {}",
                output_path.display(),
                e
            )))),
        }
    }

    /// Append one frame, converting it to the output format first if needed.
    ///
    /// A failure leaves the stream open so later frames can still be written.
    pub fn write_frame(&mut self, frame: &AudioFrame) -> Result<()> {
        let Some(output_format) = self.output_format else {
            return Err(self.report(RecordingError::Encoding("encoder is not initialized".into())));
        };
        if self.file.is_none() {
            return Err(self.report(RecordingError::Encoding("encoder is finalized".into())));
        }

        let Some(converted) = self.converter.convert_format(frame, &output_format) else {
            return Err(self.report(RecordingError::Encoding(format!(
                "cannot convert {} to {}",
                frame.format(),
                output_format
            ))));
        };

        let write = match self.file.as_mut() {
            Some(file) => file.write_all(converted.data()),
            None => Ok(()),
        };
        if let Err(e) = write {
            // Keep the I/O kind so a full or read-only disk reaches its own recovery.
            return Err(self.report(RecordingError::io("write failed", e)));
        }

        self.data_bytes += converted.len() as u64;
        self.frames_written += 1;

        let (bytes, duration) = (self.data_bytes, self.duration());
        self.delegates
            .notify(|d| d.on_encoding_progress(bytes, duration));
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        let flushed = match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        };
        flushed.map_err(|e| self.report(RecordingError::io("flush failed", e)))
    }

    /// Patch the header sizes, sync, close, and checksum the finished file.
    pub fn finalize(&mut self) -> Result<EncodingSummary> {
        let (Some(writer), Some(path), Some(format)) =
            (self.file.take(), self.path.clone(), self.output_format)
        else {
            return Err(self.report(RecordingError::Encoding("encoder is not open".into())));
        };

        let result = Self::close(writer, self.data_bytes).and_then(|file_size| {
            let checksum = sha256_file(&path)?;
            Ok((file_size, checksum))
        });

        match result {
            Ok((file_size, checksum)) => {
                info!(
                    "Finalized {}: {} data bytes, {} frames",
                    path.display(),
                    self.data_bytes,
                    self.frames_written
                );
                Ok(EncodingSummary {
                    path,
                    format,
                    data_bytes: self.data_bytes,
                    file_size,
                    checksum,
                })
            }
            Err(e) => Err(self.report(RecordingError::Encoding(format!(
                "failed to finalize {}: {}",
                path.display(),
                e
            )))),
        }
    }

    /// Close the file without patching the header, e.g. before deleting it.
    pub fn discard(&mut self) {
        if let Some(path) = &self.path {
            debug!("Discarding encoder output {}", path.display());
        }
        self.file = None;
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Audio bytes written, header excluded.
    pub fn bytes_written(&self) -> u64 {
        self.data_bytes
    }

    pub fn file_size(&self) -> u64 {
        WAV_HEADER_SIZE as u64 + self.data_bytes
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn duration(&self) -> Duration {
        self.output_format
            .map(|f| f.duration_of(self.data_bytes as usize))
            .unwrap_or_default()
    }

    pub fn input_format(&self) -> Option<AudioFormat> {
        self.input_format
    }

    pub fn output_format(&self) -> Option<AudioFormat> {
        self.output_format
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn create(path: &Path, format: &AudioFormat) -> io::Result<BufWriter<File>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(&wav_format::generate_wav_header(format, 0))?;
        file.flush()?;
        Ok(file)
    }

    /// Returns the final file size.
    fn close(writer: BufWriter<File>, data_bytes: u64) -> Result<u64> {
        let mut file = writer.into_inner().map_err(|e| e.into_error())?;
        patch_header(&mut file, data_bytes)?;
        file.sync_all()?;
        Ok(WAV_HEADER_SIZE as u64 + data_bytes)
    }

    fn report(&self, error: RecordingError) -> RecordingError {
        warn!("Encoder error: {}", error);
        self.delegates.notify(|d| d.on_encoding_error(&error));
        error
    }
}

impl Default for StreamingAudioEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StreamingAudioEncoder {
    fn drop(&mut self) {
        let Some(writer) = self.file.take() else {
            return;
        };
        match Self::close(writer, self.data_bytes) {
            Ok(_) => debug!("Patched header of un-finalized recording on drop"),
            Err(e) => warn!("Failed to patch header on drop: {}", e),
        }
    }
}

fn patch_header(file: &mut File, data_bytes: u64) -> io::Result<()> {
    let file_size = WAV_HEADER_SIZE as u64 + data_bytes;
    let data_size = data_bytes.min(u32::MAX as u64) as u32;

    file.seek(SeekFrom::Start(RIFF_SIZE_OFFSET))?;
    file.write_all(&wav_format::riff_size(file_size).to_le_bytes())?;
    file.seek(SeekFrom::Start(DATA_SIZE_OFFSET))?;
    file.write_all(&data_size.to_le_bytes())?;
    file.flush()
}

/// Compute SHA-256 hex digest of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| RecordingError::io("failed to open file for checksum", e))?;
    let mut hasher = Sha256::new();
    io::copy(&mut BufReader::new(file), &mut hasher)
        .map_err(|e| RecordingError::io("failed to read file for checksum", e))?;
    Ok(hex_encode(&hasher.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
