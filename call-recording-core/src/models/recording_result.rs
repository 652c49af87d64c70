use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::{CallInfo, RecordingOptions, RecordingQuality};

/// Result of a recording that stopped cleanly.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingResult {
    pub file_path: PathBuf,
    pub duration: Duration,
    pub file_size: u64,
    pub metadata: RecordingMetadata,
    pub checksum: String,
}

/// Sidecar metadata written beside every finished recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingMetadata {
    pub id: String,
    pub caller_number: String,
    pub callee_number: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: f64,
    /// Codec the file is actually encoded with.
    pub audio_codec: String,
    /// Codec the recording was configured with, when it differs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_codec: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
    pub file_size: u64,
    pub quality: RecordingQuality,
    pub checksum: String,
    pub notes: Option<String>,
    pub tags: Vec<String>,
}

impl RecordingMetadata {
    pub fn new(
        options: &RecordingOptions,
        call: &CallInfo,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        duration: Duration,
        file_size: u64,
        checksum: &str,
    ) -> Self {
        let effective = options.codec.effective();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            caller_number: call.caller_number.clone(),
            callee_number: call.callee_number.clone(),
            start_time,
            end_time,
            duration_seconds: duration.as_secs_f64(),
            audio_codec: effective.name().to_string(),
            requested_codec: (effective != options.codec).then(|| options.codec.name().to_string()),
            sample_rate: options.sample_rate,
            channels: options.channels,
            file_size,
            quality: options.quality,
            checksum: checksum.to_string(),
            notes: call.notes.clone(),
            tags: call.tags.clone(),
        }
    }
}

/// Periodic progress report for an active recording.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordingProgress {
    pub duration: Duration,
    pub bytes_recorded: u64,
    pub audio_level_db: f64,
}
