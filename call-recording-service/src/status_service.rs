//! System-wide recording status.
//!
//! Folds the recorder state, its pipeline health and the ingress bridge into
//! one verdict for dashboards and alerting.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use call_recording_core::models::config::duration_secs;
use call_recording_core::{
    AudioQuality, AudioRecordingManager, DelegateSet, HealthIssue, PeriodicTask, RecordingError, RecordingHealthStatus,
    RecordingState, RecordingStatus, Result,
};

use crate::audio_bridge::{AudioBridge, BridgeStatistics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OverallHealth {
    /// Nothing has been recorded or received yet.
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StatusIssueKind {
    RecordingError,
    BridgeInactive,
    NoDataFlow,
    FrameLoss,
    BufferPressure,
    EncoderFailure,
    LowDiskSpace,
    FileSystemError,
    PoorQuality,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusIssue {
    pub kind: StatusIssueKind,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemRecordingStatus {
    pub overall: OverallHealth,
    pub state: RecordingState,
    pub is_recording: bool,
    pub bridge_active: bool,
    pub data_flowing: bool,
    pub quality: AudioQuality,
    pub issues: Vec<StatusIssue>,
    pub checked_at: DateTime<Utc>,
}

impl SystemRecordingStatus {
    pub fn issue_kinds(&self) -> BTreeSet<StatusIssueKind> {
        self.issues.iter().map(|i| i.kind).collect()
    }

    pub fn has_issue(&self, kind: StatusIssueKind) -> bool {
        self.issues.iter().any(|i| i.kind == kind)
    }

    fn differs_materially(&self, other: &SystemRecordingStatus) -> bool {
        self.overall != other.overall || self.issue_kinds() != other.issue_kinds()
    }
}

pub trait StatusDelegate: Send + Sync {
    /// Called when the overall verdict or the set of issue kinds changes.
    fn on_system_status_changed(&self, _status: &SystemRecordingStatus) {}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StatusServiceConfig {
    #[serde(with = "duration_secs")]
    pub check_interval: Duration,
}

impl Default for StatusServiceConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
        }
    }
}

impl StatusServiceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.check_interval.is_zero() {
            return Err(RecordingError::Configuration("status check interval must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct ServiceState {
    last: Option<SystemRecordingStatus>,
    /// Bridge overflows already reported to the data-flow monitor.
    overflows_reported: u64,
}

struct StatusShared {
    config: StatusServiceConfig,
    manager: Arc<AudioRecordingManager>,
    bridge: Arc<AudioBridge>,
    state: Mutex<ServiceState>,
    delegates: DelegateSet<dyn StatusDelegate>,
}

pub struct RecordingStatusService {
    shared: Arc<StatusShared>,
    task: Mutex<Option<PeriodicTask>>,
}

impl RecordingStatusService {
    pub fn new(config: StatusServiceConfig, manager: Arc<AudioRecordingManager>, bridge: Arc<AudioBridge>) -> Self {
        Self {
            shared: Arc::new(StatusShared {
                config,
                manager,
                bridge,
                state: Mutex::new(ServiceState::default()),
                delegates: DelegateSet::new(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn add_delegate(&self, delegate: Arc<dyn StatusDelegate>) {
        self.shared.delegates.add(delegate);
    }

    /// Evaluate now and notify delegates if the verdict changed.
    pub fn check_status(&self, now: DateTime<Utc>) -> SystemRecordingStatus {
        self.shared.check_status(now)
    }

    pub fn last_status(&self) -> Option<SystemRecordingStatus> {
        self.shared.state.lock().last.clone()
    }

    pub fn start_monitoring(&self) -> Result<()> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Ok(());
        }
        let weak: Weak<StatusShared> = Arc::downgrade(&self.shared);
        *task = Some(PeriodicTask::spawn("status-check", self.shared.config.check_interval, move || {
            if let Some(shared) = weak.upgrade() {
                shared.check_status(Utc::now());
            }
        })?);
        log::info!("Status monitoring started");
        Ok(())
    }

    pub fn stop_monitoring(&self) {
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            task.stop();
            log::info!("Status monitoring stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.task.lock().is_some()
    }
}

impl Drop for RecordingStatusService {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

impl StatusShared {
    fn check_status(&self, now: DateTime<Utc>) -> SystemRecordingStatus {
        let bridge = self.bridge.statistics_at(now);
        self.push_buffer_state(&bridge);

        let status = self.manager.status();
        let health = self.manager.health();
        let loss_critical = self.manager.data_flow_monitor().config().loss_critical_percent;
        let current = evaluate(&status, &health, &bridge, loss_critical, now);

        let changed = {
            let mut state = self.state.lock();
            let changed = state.last.as_ref().map_or(true, |last| last.differs_materially(&current));
            state.last = Some(current.clone());
            changed
        };

        if changed {
            log::info!(
                "System recording status: {:?} ({} issues)",
                current.overall,
                current.issues.len()
            );
            self.delegates.notify(|d| d.on_system_status_changed(&current));
        }
        current
    }

    /// Report ingress buffer pressure to the pipeline health monitor.
    fn push_buffer_state(&self, bridge: &BridgeStatistics) {
        let monitor = self.manager.data_flow_monitor();
        monitor.record_buffer_usage(bridge.buffer.current_size, bridge.buffer.max_size);

        let new_overflows = {
            let mut state = self.state.lock();
            let delta = bridge.buffer.overflow_count.saturating_sub(state.overflows_reported);
            state.overflows_reported = bridge.buffer.overflow_count;
            delta
        };
        for _ in 0..new_overflows {
            monitor.record_buffer_overflow();
        }
    }
}

fn evaluate(
    status: &RecordingStatus,
    health: &RecordingHealthStatus,
    bridge: &BridgeStatistics,
    loss_critical_percent: f64,
    now: DateTime<Utc>,
) -> SystemRecordingStatus {
    let mut issues = Vec::new();
    let mut issue = |kind, severity, message: String| issues.push(StatusIssue { kind, severity, message });

    if status.state == RecordingState::Error {
        let message = status.error_message.clone().unwrap_or_else(|| "recording failed".into());
        issue(StatusIssueKind::RecordingError, Severity::Critical, message);
    }

    let is_recording = status.state == RecordingState::Recording;
    if is_recording && !bridge.is_active {
        issue(
            StatusIssueKind::BridgeInactive,
            Severity::Warning,
            "no audio reached the bridge recently".into(),
        );
    }

    // Pipeline health only describes the recording in progress.
    if status.state.is_active() {
        if is_recording && health.has_issue(HealthIssue::DataFlowInterrupted) {
            issue(StatusIssueKind::NoDataFlow, Severity::Critical, "recorder receives no audio".into());
        }
        if health.has_issue(HealthIssue::FrameLoss) {
            let loss = health.frame_loss_percent();
            let severity = if loss >= loss_critical_percent {
                Severity::Critical
            } else {
                Severity::Warning
            };
            issue(StatusIssueKind::FrameLoss, severity, format!("{:.1}% of frames lost", loss));
        }
        if health.has_issue(HealthIssue::BufferNearFull) || health.has_issue(HealthIssue::BufferOverflow) {
            issue(
                StatusIssueKind::BufferPressure,
                Severity::Warning,
                format!("ingress buffer at {:.0}%", health.buffer.usage_percent()),
            );
        }
        if health.has_issue(HealthIssue::EncoderFailing) {
            issue(StatusIssueKind::EncoderFailure, Severity::Critical, "encoder is failing".into());
        } else if health.has_issue(HealthIssue::EncoderErrors) {
            issue(
                StatusIssueKind::EncoderFailure,
                Severity::Warning,
                format!("{} encoder errors", health.encoder.failure_count),
            );
        }
        if health.has_issue(HealthIssue::LowDiskSpace) {
            issue(
                StatusIssueKind::LowDiskSpace,
                Severity::Critical,
                format!("{} bytes free", health.file_system.available_bytes),
            );
        }
        if health.has_issue(HealthIssue::FileSystemNotWritable) {
            issue(
                StatusIssueKind::FileSystemError,
                Severity::Critical,
                "output directory is not writable".into(),
            );
        } else if health.has_issue(HealthIssue::WriteFailures) {
            issue(
                StatusIssueKind::FileSystemError,
                Severity::Warning,
                format!("{} write failures", health.file_system.write_failures),
            );
        }
        if health.quality == AudioQuality::Poor {
            issue(StatusIssueKind::PoorQuality, Severity::Warning, "audio quality is poor".into());
        }
    }

    let overall = if issues.iter().any(|i| i.severity == Severity::Critical) {
        OverallHealth::Unhealthy
    } else if !issues.is_empty() {
        OverallHealth::Degraded
    } else if status.state == RecordingState::Idle && bridge.frames_received == 0 {
        OverallHealth::Unknown
    } else {
        OverallHealth::Healthy
    };

    SystemRecordingStatus {
        overall,
        state: status.state,
        is_recording,
        bridge_active: bridge.is_active,
        data_flowing: health.is_data_flowing,
        quality: health.quality,
        issues,
        checked_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use call_recording_core::models::health::BufferUsageInfo;
    use std::collections::BTreeMap;

    fn bridge_stats(active: bool) -> BridgeStatistics {
        BridgeStatistics {
            sources: BTreeMap::new(),
            frames_received: u64::from(active),
            frames_forwarded: 0,
            frames_dropped: 0,
            frames_without_sink: 0,
            buffer: BufferUsageInfo::default(),
            last_data_received: None,
            is_active: active,
        }
    }

    fn recording() -> RecordingStatus {
        RecordingStatus {
            state: RecordingState::Recording,
            ..RecordingStatus::new()
        }
    }

    #[test]
    fn idle_system_is_unknown() {
        let status = evaluate(
            &RecordingStatus::new(),
            &RecordingHealthStatus::new(),
            &bridge_stats(false),
            5.0,
            Utc::now(),
        );
        assert_eq!(status.overall, OverallHealth::Unknown);
        assert!(status.issues.is_empty());
    }

    #[test]
    fn clean_recording_is_healthy() {
        let status = evaluate(&recording(), &RecordingHealthStatus::new(), &bridge_stats(true), 5.0, Utc::now());
        assert_eq!(status.overall, OverallHealth::Healthy);
        assert!(status.is_recording);
    }

    #[test]
    fn inactive_bridge_degrades() {
        let status = evaluate(&recording(), &RecordingHealthStatus::new(), &bridge_stats(false), 5.0, Utc::now());
        assert_eq!(status.overall, OverallHealth::Degraded);
        assert!(status.has_issue(StatusIssueKind::BridgeInactive));
    }

    #[test]
    fn frame_loss_severity_follows_the_critical_threshold() {
        let mut health = RecordingHealthStatus::new();
        health.issues.push(HealthIssue::FrameLoss);
        health.frames_received = 98;
        health.frames_lost = 2;

        let status = evaluate(&recording(), &health, &bridge_stats(true), 5.0, Utc::now());
        assert_eq!(status.overall, OverallHealth::Degraded);

        health.frames_received = 90;
        health.frames_lost = 10;
        let status = evaluate(&recording(), &health, &bridge_stats(true), 5.0, Utc::now());
        assert_eq!(status.overall, OverallHealth::Unhealthy);
        assert_eq!(status.issues[0].severity, Severity::Critical);
    }

    #[test]
    fn recording_error_is_critical() {
        let mut status = RecordingStatus::new();
        status.fail(&RecordingError::PermissionDenied("/recordings".into()), Utc::now());

        let result = evaluate(&status, &RecordingHealthStatus::new(), &bridge_stats(false), 5.0, Utc::now());
        assert_eq!(result.overall, OverallHealth::Unhealthy);
        assert_eq!(result.issue_kinds(), BTreeSet::from([StatusIssueKind::RecordingError]));
        assert!(result.issues[0].message.contains("/recordings"));
    }

    #[test]
    fn stale_health_is_ignored_after_the_recording() {
        let mut health = RecordingHealthStatus::new();
        health.issues.push(HealthIssue::DataFlowInterrupted);
        let completed = RecordingStatus {
            state: RecordingState::Completed,
            ..RecordingStatus::new()
        };
        let status = evaluate(&completed, &health, &bridge_stats(false), 5.0, Utc::now());
        assert_eq!(status.overall, OverallHealth::Healthy);
    }
}
