use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::quality::AudioQuality;

/// A condition currently degrading the recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HealthIssue {
    DataFlowInterrupted,
    FrameLoss,
    BufferNearFull,
    BufferOverflow,
    EncoderFailing,
    EncoderErrors,
    LowDiskSpace,
    WriteFailures,
    FileSystemNotWritable,
}

impl HealthIssue {
    /// Issues that make the recording unhealthy rather than merely degraded.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::DataFlowInterrupted | Self::EncoderFailing | Self::LowDiskSpace | Self::FileSystemNotWritable
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BufferUsageInfo {
    pub current_size: usize,
    pub max_size: usize,
    pub overflow_count: u64,
}

impl BufferUsageInfo {
    pub fn usage_percent(&self) -> f64 {
        if self.max_size == 0 {
            return 0.0;
        }
        self.current_size as f64 / self.max_size as f64 * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EncoderHealthInfo {
    pub is_working: bool,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub average_encode_time: Duration,
}

impl Default for EncoderHealthInfo {
    fn default() -> Self {
        Self {
            is_working: true,
            failure_count: 0,
            consecutive_failures: 0,
            average_encode_time: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FileSystemHealthInfo {
    pub available_bytes: u64,
    pub total_bytes: u64,
    pub write_failures: u64,
    pub is_writable: bool,
}

impl FileSystemHealthInfo {
    pub fn available_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.available_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}

impl Default for FileSystemHealthInfo {
    fn default() -> Self {
        Self {
            available_bytes: 0,
            total_bytes: 0,
            write_failures: 0,
            is_writable: true,
        }
    }
}

/// Aggregate health of the recording pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingHealthStatus {
    pub is_healthy: bool,
    pub is_data_flowing: bool,
    pub bytes_written: u64,
    pub last_data_received: Option<DateTime<Utc>>,
    pub issues: Vec<HealthIssue>,
    pub quality: AudioQuality,
    pub frames_received: u64,
    pub frames_lost: u64,
    pub buffer: BufferUsageInfo,
    pub encoder: EncoderHealthInfo,
    pub file_system: FileSystemHealthInfo,
    pub last_check: Option<DateTime<Utc>>,
}

impl RecordingHealthStatus {
    pub fn new() -> Self {
        Self {
            is_healthy: true,
            is_data_flowing: false,
            bytes_written: 0,
            last_data_received: None,
            issues: Vec::new(),
            quality: AudioQuality::Unknown,
            frames_received: 0,
            frames_lost: 0,
            buffer: BufferUsageInfo::default(),
            encoder: EncoderHealthInfo::default(),
            file_system: FileSystemHealthInfo::default(),
            last_check: None,
        }
    }

    pub fn has_issue(&self, issue: HealthIssue) -> bool {
        self.issues.contains(&issue)
    }

    /// Percentage of expected frames that never arrived.
    pub fn frame_loss_percent(&self) -> f64 {
        let expected = self.frames_received + self.frames_lost;
        if expected == 0 {
            return 0.0;
        }
        self.frames_lost as f64 / expected as f64 * 100.0
    }

    /// Whether `other` differs in a way listeners care about.
    pub fn differs_materially(&self, other: &RecordingHealthStatus) -> bool {
        self.is_healthy != other.is_healthy
            || self.quality != other.quality
            || self.issues != other.issues
    }
}

impl Default for RecordingHealthStatus {
    fn default() -> Self {
        Self::new()
    }
}
