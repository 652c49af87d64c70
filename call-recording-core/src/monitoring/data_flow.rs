use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::models::audio_models::AudioSource;
use crate::models::config::duration_secs;
use crate::models::error::{RecordingError, Result};
use crate::models::health::{
    BufferUsageInfo, EncoderHealthInfo, FileSystemHealthInfo, HealthIssue, RecordingHealthStatus,
};
use crate::models::quality::{AudioQuality, QualityScore};
use crate::session::timer::PeriodicTask;
use crate::traits::delegates::{DelegateSet, HealthDelegate};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DataFlowConfig {
    #[serde(with = "duration_secs")]
    pub no_data_timeout: Duration,

    #[serde(with = "duration_secs")]
    pub check_interval: Duration,

    pub buffer_near_full_percent: f64,

    /// Free space below this share of the volume counts as low.
    pub low_space_percent: f64,

    /// Free space below this many bytes counts as low.
    pub low_space_bytes: u64,

    pub loss_warning_percent: f64,
    pub loss_critical_percent: f64,

    /// Sequence jumps larger than this are a stream restart, not loss.
    pub sequence_reset_jump: u32,

    pub encoder_failure_threshold: u32,
}

impl Default for DataFlowConfig {
    fn default() -> Self {
        Self {
            no_data_timeout: Duration::from_secs(5),
            check_interval: Duration::from_secs(1),
            buffer_near_full_percent: 80.0,
            low_space_percent: 10.0,
            low_space_bytes: 100 * 1024 * 1024,
            loss_warning_percent: 1.0,
            loss_critical_percent: 5.0,
            sequence_reset_jump: 1000,
            encoder_failure_threshold: 3,
        }
    }
}

impl DataFlowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.no_data_timeout.is_zero() || self.check_interval.is_zero() {
            return Err(RecordingError::Configuration(
                "data flow timeout and check interval must be positive".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.buffer_near_full_percent) {
            return Err(RecordingError::Configuration(format!(
                "buffer near-full threshold {} is not a percentage",
                self.buffer_near_full_percent
            )));
        }
        if self.encoder_failure_threshold == 0 {
            return Err(RecordingError::Configuration(
                "encoder failure threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

struct FlowState {
    started_at: Option<DateTime<Utc>>,
    last_data: Option<DateTime<Utc>>,
    interruption_reported: bool,
    frames_received: u64,
    frames_lost: u64,
    bytes_received: u64,
    bytes_written: u64,
    sequences: HashMap<AudioSource, u32>,
    buffer: BufferUsageInfo,
    encoder: EncoderHealthInfo,
    file_system: FileSystemHealthInfo,
    file_system_known: bool,
    // Counter values at the previous check, so only new events raise issues.
    checked_overflows: u64,
    checked_encoder_failures: u64,
    checked_write_failures: u64,
    health: RecordingHealthStatus,
}

impl FlowState {
    fn new() -> Self {
        Self {
            started_at: None,
            last_data: None,
            interruption_reported: false,
            frames_received: 0,
            frames_lost: 0,
            bytes_received: 0,
            bytes_written: 0,
            sequences: HashMap::new(),
            buffer: BufferUsageInfo::default(),
            encoder: EncoderHealthInfo::default(),
            file_system: FileSystemHealthInfo::default(),
            file_system_known: false,
            checked_overflows: 0,
            checked_encoder_failures: 0,
            checked_write_failures: 0,
            health: RecordingHealthStatus::new(),
        }
    }

    fn fill_counters(&self, health: &mut RecordingHealthStatus) {
        health.bytes_written = self.bytes_written;
        health.last_data_received = self.last_data;
        health.frames_received = self.frames_received;
        health.frames_lost = self.frames_lost;
        health.buffer = self.buffer;
        health.encoder = self.encoder;
        health.file_system = self.file_system;
    }
}

struct FlowShared {
    config: DataFlowConfig,
    state: Mutex<FlowState>,
    delegates: DelegateSet<dyn HealthDelegate>,
}

/// Liveness and pipeline health tracking.
///
/// Recorders only update counters. `check_health` (called by the periodic
/// task or directly) derives the issue set and the score, and is the only
/// place that notifies delegates.
pub struct AudioDataFlowMonitor {
    shared: Arc<FlowShared>,
    task: Mutex<Option<PeriodicTask>>,
}

impl AudioDataFlowMonitor {
    pub fn new(config: DataFlowConfig) -> Self {
        Self {
            shared: Arc::new(FlowShared {
                config,
                state: Mutex::new(FlowState::new()),
                delegates: DelegateSet::new(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DataFlowConfig {
        &self.shared.config
    }

    pub fn add_delegate(&self, delegate: Arc<dyn HealthDelegate>) {
        self.shared.delegates.add(delegate);
    }

    pub fn record_frame(&self, source: AudioSource, sequence: u32, bytes: usize) {
        self.record_frame_at(source, sequence, bytes, Utc::now());
    }

    pub fn record_frame_at(&self, source: AudioSource, sequence: u32, bytes: usize, now: DateTime<Utc>) {
        let reset_jump = self.shared.config.sequence_reset_jump;
        let mut state = self.shared.state.lock();

        state.last_data = Some(now);
        state.interruption_reported = false;
        state.frames_received += 1;
        state.bytes_received += bytes as u64;

        if let Some(previous) = state.sequences.insert(source, sequence) {
            if sequence > previous {
                let jump = sequence - previous;
                if jump > 1 && jump <= reset_jump {
                    state.frames_lost += u64::from(jump - 1);
                }
            }
        }
    }

    /// Payload bytes seen by `record_frame`, before conversion.
    pub fn bytes_received(&self) -> u64 {
        self.shared.state.lock().bytes_received
    }

    pub fn record_data_written(&self, bytes: u64) {
        self.shared.state.lock().bytes_written += bytes;
    }

    pub fn record_buffer_usage(&self, current: usize, max: usize) {
        let mut state = self.shared.state.lock();
        state.buffer.current_size = current;
        state.buffer.max_size = max;
    }

    pub fn record_buffer_overflow(&self) {
        self.shared.state.lock().buffer.overflow_count += 1;
    }

    pub fn record_encode(&self, elapsed: Duration, success: bool) {
        let threshold = self.shared.config.encoder_failure_threshold;
        let mut state = self.shared.state.lock();
        let encoder = &mut state.encoder;

        if success {
            encoder.consecutive_failures = 0;
            encoder.is_working = true;
            encoder.average_encode_time = if encoder.average_encode_time.is_zero() {
                elapsed
            } else {
                encoder.average_encode_time.mul_f64(0.9) + elapsed.mul_f64(0.1)
            };
        } else {
            encoder.failure_count += 1;
            encoder.consecutive_failures += 1;
            if encoder.consecutive_failures >= threshold {
                encoder.is_working = false;
            }
        }
    }

    pub fn record_write_failure(&self) {
        self.shared.state.lock().file_system.write_failures += 1;
    }

    pub fn update_file_system(&self, available_bytes: u64, total_bytes: u64, is_writable: bool) {
        let mut state = self.shared.state.lock();
        state.file_system.available_bytes = available_bytes;
        state.file_system.total_bytes = total_bytes;
        state.file_system.is_writable = is_writable;
        state.file_system_known = true;
    }

    pub fn check_health(&self, now: DateTime<Utc>) -> RecordingHealthStatus {
        self.shared.check_health(now)
    }

    /// Result of the last check, with live counters.
    pub fn health(&self) -> RecordingHealthStatus {
        let state = self.shared.state.lock();
        let mut health = state.health.clone();
        state.fill_counters(&mut health);
        health
    }

    pub fn is_data_flowing(&self) -> bool {
        self.shared.state.lock().health.is_data_flowing
    }

    pub fn start_monitoring(&self) -> Result<()> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Ok(());
        }
        {
            let mut state = self.shared.state.lock();
            state.started_at.get_or_insert_with(Utc::now);
        }

        let shared = Arc::clone(&self.shared);
        *task = Some(PeriodicTask::spawn(
            "health-check",
            self.shared.config.check_interval,
            move || {
                shared.check_health(Utc::now());
            },
        )?);
        log::info!("Data flow monitoring started");
        Ok(())
    }

    pub fn stop_monitoring(&self) {
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            task.stop();
            log::info!("Data flow monitoring stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.task.lock().is_some()
    }

    pub fn reset(&self) {
        *self.shared.state.lock() = FlowState::new();
    }
}

impl Drop for AudioDataFlowMonitor {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

impl FlowShared {
    fn check_health(&self, now: DateTime<Utc>) -> RecordingHealthStatus {
        let config = &self.config;
        let mut interrupted: Option<(Option<DateTime<Utc>>, Duration)> = None;

        let (health, changed) = {
            let mut state = self.state.lock();
            let mut issues = Vec::new();
            let mut score = QualityScore::new();

            let reference = state.last_data.or(state.started_at);
            let silence = reference
                .and_then(|r| (now - r).to_std().ok())
                .unwrap_or_default();
            let timed_out = reference.is_some() && silence > config.no_data_timeout;
            let is_data_flowing = state.last_data.is_some() && !timed_out;

            if timed_out {
                issues.push(HealthIssue::DataFlowInterrupted);
                score.deduct(40);
                if !state.interruption_reported {
                    state.interruption_reported = true;
                    interrupted = Some((state.last_data, silence));
                }
            }

            let expected = state.frames_received + state.frames_lost;
            let loss = if expected == 0 {
                0.0
            } else {
                state.frames_lost as f64 / expected as f64 * 100.0
            };
            if score.deduct_tiered(loss, config.loss_warning_percent, config.loss_critical_percent, 15, 30) > 0 {
                issues.push(HealthIssue::FrameLoss);
            }

            if state.buffer.max_size > 0 && state.buffer.usage_percent() >= config.buffer_near_full_percent {
                issues.push(HealthIssue::BufferNearFull);
                score.deduct(10);
            }
            if state.buffer.overflow_count > state.checked_overflows {
                issues.push(HealthIssue::BufferOverflow);
                score.deduct(15);
            }

            if !state.encoder.is_working {
                issues.push(HealthIssue::EncoderFailing);
                score.deduct(30);
            } else if state.encoder.failure_count > state.checked_encoder_failures {
                issues.push(HealthIssue::EncoderErrors);
                score.deduct(10);
            }

            let fs = state.file_system;
            if state.file_system_known
                && fs.total_bytes > 0
                && (fs.available_percent() < config.low_space_percent
                    || fs.available_bytes < config.low_space_bytes)
            {
                issues.push(HealthIssue::LowDiskSpace);
                score.deduct(15);
            }
            if fs.write_failures > state.checked_write_failures {
                issues.push(HealthIssue::WriteFailures);
                score.deduct(15);
            }
            if !fs.is_writable {
                issues.push(HealthIssue::FileSystemNotWritable);
                score.deduct(40);
            }

            state.checked_overflows = state.buffer.overflow_count;
            state.checked_encoder_failures = state.encoder.failure_count;
            state.checked_write_failures = fs.write_failures;

            let mut health = RecordingHealthStatus::new();
            state.fill_counters(&mut health);
            health.is_healthy = !issues.iter().any(HealthIssue::is_critical);
            health.is_data_flowing = is_data_flowing;
            health.quality = if state.frames_received == 0 {
                AudioQuality::Unknown
            } else {
                AudioQuality::from(score.level())
            };
            health.issues = issues;
            health.last_check = Some(now);

            let changed = state.health.differs_materially(&health);
            state.health = health.clone();
            (health, changed)
        };

        if let Some((last_data, silence)) = interrupted {
            log::warn!("No audio data for {:?} (last at {:?})", silence, last_data);
            self.delegates
                .notify(|d| d.on_data_flow_interrupted(last_data, silence));
        }
        if changed {
            log::info!(
                "Recording health changed: healthy={}, quality={:?}, issues={:?}",
                health.is_healthy,
                health.quality,
                health.issues
            );
            self.delegates.notify(|d| d.on_health_changed(&health));
        }
        health
    }
}
