use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::audio_models::AudioSource;

/// Five-band result of the 100-point quality score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QualityLevel {
    Critical,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl QualityLevel {
    pub fn from_score(score: u32) -> Self {
        match score {
            90.. => Self::Excellent,
            75..=89 => Self::Good,
            60..=74 => Self::Fair,
            40..=59 => Self::Poor,
            _ => Self::Critical,
        }
    }
}

/// Coarse quality reported in health snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AudioQuality {
    Unknown,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl From<QualityLevel> for AudioQuality {
    fn from(level: QualityLevel) -> Self {
        match level {
            QualityLevel::Excellent => Self::Excellent,
            QualityLevel::Good => Self::Good,
            QualityLevel::Fair => Self::Fair,
            QualityLevel::Poor | QualityLevel::Critical => Self::Poor,
        }
    }
}

/// Deduction-based 100-point score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityScore {
    deducted: u32,
}

impl QualityScore {
    pub const MAX: u32 = 100;

    pub fn new() -> Self {
        Self { deducted: 0 }
    }

    pub fn deduct(&mut self, points: u32) {
        self.deducted = self.deducted.saturating_add(points);
    }

    /// Deducts `critical_points` above `critical`, else `warning_points` above `warning`.
    /// Returns the points taken.
    pub fn deduct_tiered(
        &mut self,
        value: f64,
        warning: f64,
        critical: f64,
        warning_points: u32,
        critical_points: u32,
    ) -> u32 {
        let points = if value > critical {
            critical_points
        } else if value > warning {
            warning_points
        } else {
            0
        };
        self.deduct(points);
        points
    }

    pub fn value(&self) -> u32 {
        Self::MAX.saturating_sub(self.deducted)
    }

    pub fn level(&self) -> QualityLevel {
        QualityLevel::from_score(self.value())
    }
}

impl Default for QualityScore {
    fn default() -> Self {
        Self::new()
    }
}

/// Limits used to score a stream. Warning values trigger quality warnings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QualityThresholds {
    pub latency_warning_ms: f64,
    pub latency_critical_ms: f64,
    pub packet_loss_warning_percent: f64,
    pub packet_loss_critical_percent: f64,
    pub jitter_warning_ms: f64,
    pub jitter_critical_ms: f64,
    pub max_interruptions: u64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            latency_warning_ms: 150.0,
            latency_critical_ms: 300.0,
            packet_loss_warning_percent: 1.0,
            packet_loss_critical_percent: 5.0,
            jitter_warning_ms: 30.0,
            jitter_critical_ms: 100.0,
            max_interruptions: 5,
        }
    }
}

/// Raw running statistics for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioStreamStats {
    pub source: AudioSource,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub average_latency_ms: f64,
    pub packet_loss_percent: f64,
    pub jitter_ms: f64,
    pub audio_level_db: f64,
    pub interruptions: u64,
    pub underflows: u64,
    pub overflows: u64,
    pub first_frame_at: Option<DateTime<Utc>>,
    pub last_frame_at: Option<DateTime<Utc>>,
}

impl AudioStreamStats {
    pub fn new(source: AudioSource) -> Self {
        Self {
            source,
            total_frames: 0,
            total_bytes: 0,
            average_latency_ms: 0.0,
            packet_loss_percent: 0.0,
            jitter_ms: 0.0,
            audio_level_db: SILENCE_DB,
            interruptions: 0,
            underflows: 0,
            overflows: 0,
            first_frame_at: None,
            last_frame_at: None,
        }
    }

    pub fn has_data(&self) -> bool {
        self.total_frames > 0
    }
}

/// Floor used for the level of digital silence.
pub const SILENCE_DB: f64 = -96.0;

/// A threshold a stream is currently exceeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QualityIssue {
    HighLatency,
    PacketLoss,
    HighJitter,
    FrequentInterruptions,
}

/// Scored view of one source at the time of the last quality check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioQualityMetrics {
    pub source: AudioSource,
    pub score: u32,
    pub level: QualityLevel,
    pub latency_ms: f64,
    pub packet_loss_percent: f64,
    pub jitter_ms: f64,
    pub audio_level_db: f64,
    pub interruptions: u64,
    pub issues: Vec<QualityIssue>,
    pub measured_at: DateTime<Utc>,
}

impl AudioQualityMetrics {
    /// Scores `stats` against `thresholds`.
    pub fn evaluate(
        stats: &AudioStreamStats,
        thresholds: &QualityThresholds,
        now: DateTime<Utc>,
    ) -> Self {
        let mut score = QualityScore::new();
        let mut issues = Vec::new();

        if score.deduct_tiered(
            stats.average_latency_ms,
            thresholds.latency_warning_ms,
            thresholds.latency_critical_ms,
            20,
            40,
        ) > 0
        {
            issues.push(QualityIssue::HighLatency);
        }
        if score.deduct_tiered(
            stats.packet_loss_percent,
            thresholds.packet_loss_warning_percent,
            thresholds.packet_loss_critical_percent,
            15,
            30,
        ) > 0
        {
            issues.push(QualityIssue::PacketLoss);
        }
        if score.deduct_tiered(
            stats.jitter_ms,
            thresholds.jitter_warning_ms,
            thresholds.jitter_critical_ms,
            10,
            20,
        ) > 0
        {
            issues.push(QualityIssue::HighJitter);
        }
        if stats.interruptions > thresholds.max_interruptions {
            score.deduct(10);
            issues.push(QualityIssue::FrequentInterruptions);
        }

        Self {
            source: stats.source,
            score: score.value(),
            level: score.level(),
            latency_ms: stats.average_latency_ms,
            packet_loss_percent: stats.packet_loss_percent,
            jitter_ms: stats.jitter_ms,
            audio_level_db: stats.audio_level_db,
            interruptions: stats.interruptions,
            issues,
            measured_at: now,
        }
    }
}

/// Emitted when a metric crosses its warning threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityWarning {
    pub source: AudioSource,
    pub issue: QualityIssue,
    pub value: f64,
    pub threshold: f64,
    pub raised_at: DateTime<Utc>,
}

pub(crate) fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_bands() {
        assert_eq!(QualityLevel::from_score(100), QualityLevel::Excellent);
        assert_eq!(QualityLevel::from_score(90), QualityLevel::Excellent);
        assert_eq!(QualityLevel::from_score(89), QualityLevel::Good);
        assert_eq!(QualityLevel::from_score(75), QualityLevel::Good);
        assert_eq!(QualityLevel::from_score(60), QualityLevel::Fair);
        assert_eq!(QualityLevel::from_score(40), QualityLevel::Poor);
        assert_eq!(QualityLevel::from_score(39), QualityLevel::Critical);
        assert_eq!(QualityLevel::from_score(0), QualityLevel::Critical);
    }

    #[test]
    fn clean_stream_is_excellent() {
        let mut stats = AudioStreamStats::new(AudioSource::RtpIncoming);
        stats.total_frames = 100;
        stats.average_latency_ms = 40.0;

        let metrics = AudioQualityMetrics::evaluate(&stats, &QualityThresholds::default(), Utc::now());
        assert_eq!(metrics.score, 100);
        assert_eq!(metrics.level, QualityLevel::Excellent);
        assert!(metrics.issues.is_empty());
    }

    #[test]
    fn deductions_accumulate() {
        let mut stats = AudioStreamStats::new(AudioSource::WebRtcIncoming);
        stats.average_latency_ms = 350.0; // -40
        stats.packet_loss_percent = 2.0; // -15
        stats.jitter_ms = 35.0; // -10
        stats.interruptions = 6; // -10

        let metrics = AudioQualityMetrics::evaluate(&stats, &QualityThresholds::default(), Utc::now());
        assert_eq!(metrics.score, 25);
        assert_eq!(metrics.level, QualityLevel::Critical);
        assert_eq!(metrics.issues.len(), 4);
    }

    #[test]
    fn critical_maps_to_poor_health() {
        assert_eq!(AudioQuality::from(QualityLevel::Critical), AudioQuality::Poor);
        assert_eq!(AudioQuality::from(QualityLevel::Good), AudioQuality::Good);
    }
}
