use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::models::audio_models::{AudioFormat, AudioFrame, AudioSource};
use crate::models::config::{duration_secs, CallInfo, RecordingOptions};
use crate::models::error::{RecordingError, RecordingErrorCode, Result};
use crate::models::health::RecordingHealthStatus;
use crate::models::quality::{AudioQuality, SILENCE_DB};
use crate::models::recording_result::{RecordingMetadata, RecordingProgress, RecordingResult};
use crate::models::state::{RecordingState, RecordingStatus};
use crate::monitoring::data_flow::{AudioDataFlowMonitor, DataFlowConfig};
use crate::monitoring::quality_monitor::{audio_level_db, AudioQualityMonitor, QualityMonitorConfig};
use crate::processing::converter::AudioFormatConverter;
use crate::processing::mixer::AudioMixer;
use crate::processing::wav_format::WAV_HEADER_SIZE;
use crate::recovery::recovery_manager::{
    AudioErrorRecoveryManager, NetworkFault, RecoveryActions, RecoveryConfig, RoutingFault, StreamFault,
};
use crate::session::timer::PeriodicTask;
use crate::storage::file_manager::{DiskSpaceProvider, FileManagerConfig, RecordingFileManager, SystemDiskSpace};
use crate::storage::streaming_encoder::{sha256_file, StreamingAudioEncoder};
use crate::storage::validator::ZeroByteFileDetector;
use crate::traits::capture_provider::{CaptureProvider, FrameCallback};
use crate::traits::delegates::{
    DelegateSet, EncoderDelegate, HealthDelegate, QualityDelegate, RecordingDelegate, RecoveryDelegate,
    StorageDelegate,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManagerConfig {
    pub quality: QualityMonitorConfig,
    pub data_flow: DataFlowConfig,
    pub recovery: RecoveryConfig,
    pub file_manager: FileManagerConfig,

    #[serde(with = "duration_secs")]
    pub progress_interval: Duration,

    /// Frames one leg may queue while waiting for the other legs before
    /// mixing proceeds without them.
    pub max_pending_per_leg: usize,

    /// Most recent written frames kept for rebuilding a damaged file.
    pub recovery_buffer_frames: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            quality: QualityMonitorConfig::default(),
            data_flow: DataFlowConfig::default(),
            recovery: RecoveryConfig::default(),
            file_manager: FileManagerConfig::default(),
            progress_interval: Duration::from_secs(1),
            max_pending_per_leg: 5,
            // One minute of 20 ms frames.
            recovery_buffer_frames: 3000,
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<()> {
        self.quality.validate()?;
        self.data_flow.validate()?;
        self.recovery.validate()?;
        self.file_manager.validate()?;
        if self.progress_interval.is_zero() {
            return Err(RecordingError::Configuration("progress interval must be positive".into()));
        }
        if self.max_pending_per_leg == 0 {
            return Err(RecordingError::Configuration("max pending frames per leg must be positive".into()));
        }
        Ok(())
    }
}

/// One recording from start to stop.
struct Session {
    options: RecordingOptions,
    call: CallInfo,
    target_format: AudioFormat,
    file_path: PathBuf,
    encoder: StreamingAudioEncoder,
    started_at: DateTime<Utc>,
    started: Instant,
    paused_total: Duration,
    paused_at: Option<Instant>,
    /// Converted frames per leg, waiting for the other legs.
    pending: BTreeMap<AudioSource, VecDeque<AudioFrame>>,
    recent: VecDeque<AudioFrame>,
    audio_level_db: f64,
    limit_reached: bool,
}

impl Session {
    fn active_duration(&self) -> Duration {
        let paused = self.paused_total + self.paused_at.map(|p| p.elapsed()).unwrap_or_default();
        self.started.elapsed().saturating_sub(paused)
    }

    /// Queue `frame` and return the groups that are ready to be written.
    ///
    /// A group is formed once every known leg has a frame queued, or when one
    /// leg has fallen `max_pending` frames behind the others.
    fn enqueue(&mut self, frame: AudioFrame, max_pending: usize) -> Aligned {
        self.pending.entry(frame.source()).or_default().push_back(frame);

        let mut aligned = Aligned::default();
        loop {
            let all_ready = self.pending.values().all(|q| !q.is_empty());
            let overdue = self.pending.values().any(|q| q.len() > max_pending);
            if !all_ready && !overdue {
                break;
            }
            if !all_ready {
                for (source, queue) in &self.pending {
                    let list = if queue.is_empty() {
                        &mut aligned.missing
                    } else if queue.len() > max_pending {
                        &mut aligned.overflowed
                    } else {
                        continue;
                    };
                    if !list.contains(source) {
                        list.push(*source);
                    }
                }
            }
            aligned
                .groups
                .push(self.pending.values_mut().filter_map(VecDeque::pop_front).collect());
        }
        aligned
    }

    /// Every queued frame, grouped the same way, for the final flush.
    fn drain_pending(&mut self) -> Vec<Vec<AudioFrame>> {
        let mut groups = Vec::new();
        loop {
            let group: Vec<AudioFrame> = self.pending.values_mut().filter_map(VecDeque::pop_front).collect();
            if group.is_empty() {
                break;
            }
            groups.push(group);
        }
        groups
    }

    fn remember(&mut self, frame: AudioFrame, limit: usize) {
        if limit == 0 {
            return;
        }
        if self.recent.len() == limit {
            self.recent.pop_front();
        }
        self.recent.push_back(frame);
    }
}

/// Result of queueing one frame.
#[derive(Default)]
struct Aligned {
    groups: Vec<Vec<AudioFrame>>,
    /// Legs absent from an overdue group.
    missing: Vec<AudioSource>,
    /// Legs that ran past the pending limit waiting for the others.
    overflowed: Vec<AudioSource>,
}

struct Pipeline {
    status: RecordingStatus,
    session: Option<Session>,
    last_recording: Option<RecordingResult>,
    /// Capture is being stopped; frames still in flight are accepted.
    draining: bool,
    disposed: bool,
}

/// Work found under the pipeline lock that must run after releasing it.
enum Followup {
    AutoStop(&'static str),
    Encoding(RecordingErrorCode),
    Stream(StreamFault),
    Routing(AudioSource),
}

struct ManagerShared {
    config: ManagerConfig,
    capture: Arc<dyn CaptureProvider>,
    file_manager: RecordingFileManager,
    quality: AudioQualityMonitor,
    data_flow: AudioDataFlowMonitor,
    recovery: AudioErrorRecoveryManager,
    converter: AudioFormatConverter,
    mixer: AudioMixer,
    detector: ZeroByteFileDetector,
    pipeline: Mutex<Pipeline>,
    progress: Mutex<Option<PeriodicTask>>,
    delegates: DelegateSet<dyn RecordingDelegate>,
    encoder_delegates: Arc<DelegateSet<dyn EncoderDelegate>>,
    weak_self: Weak<ManagerShared>,
}

/// Orchestrates one call recording at a time.
///
/// ```text
/// [CaptureProvider] → process_frame → convert → align legs → [AudioMixer]
///                                                               ↓
///        [quality / data-flow monitors] ← ─ ─ ─ ─ ─ ─ ─ [StreamingAudioEncoder] → file
/// ```
///
/// State lives behind a single pipeline lock together with the encoder.
/// Capture, monitors and the progress timer run on their own threads and
/// only hold a weak reference back to the manager.
pub struct AudioRecordingManager {
    shared: Arc<ManagerShared>,
}

impl AudioRecordingManager {
    pub fn new(capture: Arc<dyn CaptureProvider>, config: ManagerConfig) -> Self {
        Self::with_disk_space(capture, config, Arc::new(SystemDiskSpace))
    }

    pub fn with_disk_space(
        capture: Arc<dyn CaptureProvider>,
        config: ManagerConfig,
        disk: Arc<dyn DiskSpaceProvider>,
    ) -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<ManagerShared>| {
            let recovery = AudioErrorRecoveryManager::new(config.recovery.clone());
            let actions: Weak<dyn RecoveryActions> = weak.clone();
            recovery.set_actions(actions);

            let data_flow = AudioDataFlowMonitor::new(config.data_flow.clone());
            data_flow.add_delegate(Arc::new(InterruptionRecovery { shared: weak.clone() }));

            ManagerShared {
                file_manager: RecordingFileManager::with_disk_space(config.file_manager.clone(), disk),
                quality: AudioQualityMonitor::new(config.quality.clone()),
                data_flow,
                recovery,
                converter: AudioFormatConverter::new(),
                mixer: AudioMixer::new(),
                detector: ZeroByteFileDetector::new(),
                pipeline: Mutex::new(Pipeline {
                    status: RecordingStatus::new(),
                    session: None,
                    last_recording: None,
                    draining: false,
                    disposed: false,
                }),
                progress: Mutex::new(None),
                delegates: DelegateSet::new(),
                encoder_delegates: Arc::new(DelegateSet::new()),
                weak_self: weak.clone(),
                capture,
                config,
            }
        });
        Self { shared }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    pub fn add_delegate(&self, delegate: Arc<dyn RecordingDelegate>) {
        self.shared.delegates.add(delegate);
    }

    pub fn add_encoder_delegate(&self, delegate: Arc<dyn EncoderDelegate>) {
        self.shared.encoder_delegates.add(delegate);
    }

    pub fn add_quality_delegate(&self, delegate: Arc<dyn QualityDelegate>) {
        self.shared.quality.add_delegate(delegate);
    }

    pub fn add_health_delegate(&self, delegate: Arc<dyn HealthDelegate>) {
        self.shared.data_flow.add_delegate(delegate);
    }

    pub fn add_storage_delegate(&self, delegate: Arc<dyn StorageDelegate>) {
        self.shared.file_manager.add_delegate(delegate);
    }

    pub fn add_recovery_delegate(&self, delegate: Arc<dyn RecoveryDelegate>) {
        self.shared.recovery.add_delegate(delegate);
    }

    /// Start a recording. Returns `Ok(false)` without side effects when the
    /// current state does not allow starting.
    pub fn start_recording(&self, options: RecordingOptions, call: CallInfo) -> Result<bool> {
        self.shared.start_recording(options, call)
    }

    pub fn stop_recording(&self) -> Result<bool> {
        self.shared.stop_recording()
    }

    pub fn pause_recording(&self) -> Result<bool> {
        self.shared.pause_recording()
    }

    pub fn resume_recording(&self) -> Result<bool> {
        self.shared.resume_recording()
    }

    pub fn cancel_recording(&self) -> Result<bool> {
        self.shared.cancel_recording()
    }

    /// Feed one captured frame. Ignored unless recording.
    pub fn process_frame(&self, frame: AudioFrame) {
        self.shared.process_frame(frame);
    }

    pub fn status(&self) -> RecordingStatus {
        self.shared.pipeline.lock().status.clone()
    }

    pub fn is_recording(&self) -> bool {
        self.shared.pipeline.lock().status.state == RecordingState::Recording
    }

    pub fn last_recording(&self) -> Option<RecordingResult> {
        self.shared.pipeline.lock().last_recording.clone()
    }

    /// Data-flow health, with quality folded in from the quality monitor.
    pub fn health(&self) -> RecordingHealthStatus {
        let mut health = self.shared.data_flow.health();
        health.quality = match (health.quality, self.shared.quality.overall_quality()) {
            (AudioQuality::Unknown, q) | (q, AudioQuality::Unknown) => q,
            (a, b) => a.min(b),
        };
        health
    }

    pub fn quality_monitor(&self) -> &AudioQualityMonitor {
        &self.shared.quality
    }

    pub fn data_flow_monitor(&self) -> &AudioDataFlowMonitor {
        &self.shared.data_flow
    }

    pub fn recovery_manager(&self) -> &AudioErrorRecoveryManager {
        &self.shared.recovery
    }

    pub fn file_manager(&self) -> &RecordingFileManager {
        &self.shared.file_manager
    }

    /// Finish any active recording and release background threads.
    ///
    /// Idempotent. Every other operation fails with `Disposed` afterwards.
    pub fn shutdown(&self) -> Result<()> {
        self.shared.shutdown()
    }
}

impl Drop for AudioRecordingManager {
    fn drop(&mut self) {
        if let Err(e) = self.shared.shutdown() {
            warn!("Shutdown on drop failed: {}", e);
        }
    }
}

impl ManagerShared {
    fn start_recording(&self, options: RecordingOptions, call: CallInfo) -> Result<bool> {
        let status = {
            let mut pipeline = self.pipeline.lock();
            if pipeline.disposed {
                return Err(RecordingError::Disposed("recording manager"));
            }
            if !pipeline.status.can_start() {
                debug!("Ignoring start in state {:?}", pipeline.status.state);
                return Ok(false);
            }
            pipeline.status.begin(Utc::now());
            pipeline.status.clone()
        };
        self.publish(&status);

        let session = match self.open_session(options, call) {
            Ok(session) => session,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };
        let path = session.file_path.clone();

        {
            let mut pipeline = self.pipeline.lock();
            if pipeline.status.state != RecordingState::Starting {
                drop(pipeline);
                info!("Recording cancelled while starting");
                self.discard_session(session);
                return Ok(false);
            }
            pipeline.status.current_file_path = Some(path.clone());
            pipeline.session = Some(session);
        }

        if let Err(e) = self.start_background() {
            self.abort_start();
            self.fail(&e);
            return Err(e);
        }

        let status = {
            let mut pipeline = self.pipeline.lock();
            if pipeline.status.state != RecordingState::Starting {
                None
            } else {
                pipeline.status.state = RecordingState::Recording;
                Some(pipeline.status.clone())
            }
        };
        let Some(status) = status else {
            // Cancelled while capture was starting; the cancel owns the teardown
            // but may have run before capture was up.
            self.stop_background();
            return Ok(false);
        };

        info!("Recording started: {}", path.display());
        self.publish(&status);
        Ok(true)
    }

    fn open_session(&self, options: RecordingOptions, call: CallInfo) -> Result<Session> {
        options.validate()?;
        if !options.codec.is_supported() {
            warn!(
                "{} encoding is not available; recording as {}",
                options.codec.name(),
                options.codec.effective().name()
            );
        }

        self.quality.reset();
        self.data_flow.reset();

        let dir = options.output_directory.clone();
        let space = self.file_manager.ensure_space(&dir)?;
        self.data_flow.update_file_system(space.available, space.total, true);

        let now = Utc::now();
        let name = self.file_manager.generate_file_name(&options, &call, now);
        let path = self.file_manager.ensure_unique_file_name(&dir, &name)?;
        self.file_manager.create_recording_file(&path)?;

        let target_format = options.target_format();
        let mut encoder = StreamingAudioEncoder::new();
        encoder.add_delegate(self.encoder_delegates.clone());
        if let Err(e) = encoder.initialize(target_format, &path) {
            if let Err(cleanup) = self.file_manager.delete_recording(&path) {
                warn!("Failed to remove {}: {}", path.display(), cleanup);
            }
            return Err(e);
        }

        Ok(Session {
            options,
            call,
            target_format,
            file_path: path,
            encoder,
            started_at: now,
            started: Instant::now(),
            paused_total: Duration::ZERO,
            paused_at: None,
            pending: BTreeMap::new(),
            recent: VecDeque::new(),
            audio_level_db: SILENCE_DB,
            limit_reached: false,
        })
    }

    fn start_background(&self) -> Result<()> {
        self.quality.start_monitoring()?;
        self.data_flow.start_monitoring()?;

        let weak = self.weak_self.clone();
        let task = PeriodicTask::spawn("recording-progress", self.config.progress_interval, move || {
            if let Some(shared) = weak.upgrade() {
                shared.progress_tick();
            }
        })?;
        *self.progress.lock() = Some(task);

        self.capture.start(self.frame_callback())
    }

    fn stop_background(&self) {
        if let Err(e) = self.capture.stop() {
            warn!("Failed to stop capture: {}", e);
        }
        let task = self.progress.lock().take();
        if let Some(mut task) = task {
            task.stop();
        }
        self.quality.stop_monitoring();
        self.data_flow.stop_monitoring();
    }

    fn abort_start(&self) {
        self.stop_background();
        let session = self.pipeline.lock().session.take();
        if let Some(session) = session {
            self.discard_session(session);
        }
    }

    fn discard_session(&self, mut session: Session) {
        session.encoder.discard();
        if let Err(e) = self.file_manager.delete_recording(&session.file_path) {
            warn!("Failed to delete {}: {}", session.file_path.display(), e);
        }
    }

    fn frame_callback(&self) -> FrameCallback {
        let weak = self.weak_self.clone();
        Arc::new(move |frame: AudioFrame| {
            if let Some(shared) = weak.upgrade() {
                shared.process_frame(frame);
            }
        })
    }

    fn stop_recording(&self) -> Result<bool> {
        let status = {
            let mut pipeline = self.pipeline.lock();
            if pipeline.disposed {
                return Err(RecordingError::Disposed("recording manager"));
            }
            if !pipeline.status.can_stop() {
                debug!("Ignoring stop in state {:?}", pipeline.status.state);
                return Ok(false);
            }
            if let Some(session) = pipeline.session.as_mut() {
                if let Some(paused_at) = session.paused_at.take() {
                    session.paused_total += paused_at.elapsed();
                }
            }
            pipeline.status.state = RecordingState::Stopping;
            pipeline.draining = true;
            pipeline.status.clone()
        };
        self.publish(&status);

        self.recovery.interrupt();
        self.stop_background();

        let session = {
            let mut pipeline = self.pipeline.lock();
            pipeline.draining = false;
            pipeline.session.take()
        };
        let Some(mut session) = session else {
            let e = RecordingError::Unknown("no active session to stop".into());
            self.fail(&e);
            return Err(e);
        };

        for group in session.drain_pending() {
            if let Err(e) = self.write_group(&mut session, group) {
                warn!("Dropping buffered audio during stop: {}", e);
            }
        }

        match self.finish_session(session) {
            Ok(result) => {
                let status = {
                    let mut pipeline = self.pipeline.lock();
                    pipeline.status.state = RecordingState::Completed;
                    pipeline.status.end_time = Some(result.metadata.end_time);
                    pipeline.status.bytes_recorded = result.file_size.saturating_sub(WAV_HEADER_SIZE as u64);
                    pipeline.last_recording = Some(result.clone());
                    pipeline.status.clone()
                };
                info!(
                    "Recording completed: {} ({:.1} s, {} bytes)",
                    result.file_path.display(),
                    result.duration.as_secs_f64(),
                    result.file_size
                );
                self.publish(&status);
                self.delegates.notify(|d| d.on_recording_finished(&result));
                Ok(true)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn finish_session(&self, mut session: Session) -> Result<RecordingResult> {
        let summary = session.encoder.finalize()?;
        let path = summary.path.clone();

        let mut checksum = summary.checksum;
        let report = self.detector.validate(&path);
        if !report.is_valid() {
            warn!("Recording {} failed validation: {:?}", path.display(), report.issues);
            match self.repair_recording(&mut session, &path) {
                Ok(()) => checksum = sha256_file(&path)?,
                Err(e) => error!("Keeping {} as written: {}", path.display(), e),
            }
        }

        let file_size = fs::metadata(&path)
            .map_err(|e| RecordingError::io("failed to stat recording", e))?
            .len();
        let duration = session.active_duration();
        let metadata = RecordingMetadata::new(
            &session.options,
            &session.call,
            session.started_at,
            Utc::now(),
            duration,
            file_size,
            &checksum,
        );
        self.file_manager.write_metadata(&metadata, &path)?;

        Ok(RecordingResult {
            file_path: path,
            duration,
            file_size,
            metadata,
            checksum,
        })
    }

    /// Rebuild from the recent frames when they hold more audio than the
    /// file, otherwise fix the header sizes in place.
    fn repair_recording(&self, session: &mut Session, path: &Path) -> Result<()> {
        let frames: Vec<AudioFrame> = session.recent.drain(..).collect();
        match self.detector.recover_from_buffer(path, &frames, &session.target_format) {
            Ok(_) => Ok(()),
            Err(e) => {
                info!("Not rebuilding {} from buffer: {}", path.display(), e);
                self.detector.repair_header(path).map(|_| ())
            }
        }
    }

    fn pause_recording(&self) -> Result<bool> {
        let status = {
            let mut pipeline = self.pipeline.lock();
            if pipeline.disposed {
                return Err(RecordingError::Disposed("recording manager"));
            }
            if !pipeline.status.can_pause() {
                return Ok(false);
            }
            if let Some(session) = pipeline.session.as_mut() {
                session.paused_at = Some(Instant::now());
            }
            pipeline.status.state = RecordingState::Paused;
            pipeline.status.clone()
        };
        info!("Recording paused");
        self.publish(&status);
        Ok(true)
    }

    fn resume_recording(&self) -> Result<bool> {
        let status = {
            let mut pipeline = self.pipeline.lock();
            if pipeline.disposed {
                return Err(RecordingError::Disposed("recording manager"));
            }
            if !pipeline.status.can_resume() {
                return Ok(false);
            }
            if let Some(session) = pipeline.session.as_mut() {
                if let Some(paused_at) = session.paused_at.take() {
                    session.paused_total += paused_at.elapsed();
                }
            }
            pipeline.status.state = RecordingState::Recording;
            pipeline.status.clone()
        };
        info!("Recording resumed");
        self.publish(&status);
        Ok(true)
    }

    fn cancel_recording(&self) -> Result<bool> {
        let (status, session) = {
            let mut pipeline = self.pipeline.lock();
            if pipeline.disposed {
                return Err(RecordingError::Disposed("recording manager"));
            }
            if !pipeline.status.state.can_cancel() {
                return Ok(false);
            }
            pipeline.status.state = RecordingState::Cancelled;
            pipeline.status.end_time = Some(Utc::now());
            (pipeline.status.clone(), pipeline.session.take())
        };
        self.publish(&status);

        self.recovery.interrupt();
        self.stop_background();
        if let Some(session) = session {
            info!("Recording cancelled: {}", session.file_path.display());
            self.discard_session(session);
        }
        Ok(true)
    }

    fn shutdown(&self) -> Result<()> {
        let state = {
            let pipeline = self.pipeline.lock();
            if pipeline.disposed {
                return Ok(());
            }
            pipeline.status.state
        };

        let finished = if state.can_stop() {
            self.stop_recording().map(|_| ())
        } else if state.can_cancel() {
            self.cancel_recording().map(|_| ())
        } else {
            Ok(())
        };

        self.pipeline.lock().disposed = true;
        self.recovery.interrupt();
        self.stop_background();
        info!("Recording manager shut down");
        finished
    }

    fn fail(&self, error: &RecordingError) {
        error!("Recording failed: {}", error);
        let (status, session) = {
            let mut pipeline = self.pipeline.lock();
            pipeline.status.fail(error, Utc::now());
            pipeline.draining = false;
            (pipeline.status.clone(), pipeline.session.take())
        };
        if let Some(mut session) = session {
            session.encoder.discard();
        }
        self.delegates.notify(|d| d.on_error(error));
        self.publish(&status);
    }

    fn publish(&self, status: &RecordingStatus) {
        debug!("Recording state: {:?}", status.state);
        self.delegates.notify(|d| d.on_status_changed(status));
    }

    fn process_frame(&self, frame: AudioFrame) {
        let now = Utc::now();
        let mut followups = Vec::new();

        {
            let mut guard = self.pipeline.lock();
            let pipeline = &mut *guard;
            let accepting = pipeline.status.state == RecordingState::Recording || pipeline.draining;
            if !accepting {
                return;
            }
            let Some(session) = pipeline.session.as_mut() else {
                return;
            };
            if session.limit_reached {
                return;
            }
            if !session.options.record_both_parties && frame.source().is_outgoing() {
                return;
            }

            self.quality.record_frame_at(&frame, now);
            self.data_flow
                .record_frame_at(frame.source(), frame.sequence_number(), frame.len(), now);

            if session.active_duration() >= session.options.max_duration {
                session.limit_reached = true;
                followups.push(Followup::AutoStop("maximum duration reached"));
            } else {
                let converted = self
                    .converter
                    .convert_format(&frame, &session.target_format)
                    .map(|c| c.into_owned());
                match converted {
                    Some(converted) => {
                        let aligned = session.enqueue(converted, self.config.max_pending_per_leg);
                        for &source in &aligned.overflowed {
                            self.quality.record_overflow(source);
                        }
                        for &source in &aligned.missing {
                            self.quality.record_underflow(source);
                        }
                        followups.extend(aligned.missing.into_iter().map(Followup::Routing));
                        for group in aligned.groups {
                            let size = group.iter().map(AudioFrame::len).max().unwrap_or(0) as u64;
                            if session.encoder.file_size() + size > session.options.max_file_size {
                                session.limit_reached = true;
                                followups.push(Followup::AutoStop("maximum file size reached"));
                                break;
                            }
                            if let Err(e) = self.write_group(session, group) {
                                followups.push(Followup::Encoding(e.code()));
                            }
                        }
                    }
                    None => {
                        warn!(
                            "Dropping frame {} from {:?}: cannot convert {} to {}",
                            frame.sequence_number(),
                            frame.source(),
                            frame.format(),
                            session.target_format
                        );
                        followups.push(Followup::Stream(StreamFault::FormatMismatch));
                    }
                }
            }
            pipeline.status.bytes_recorded = session.encoder.bytes_written();
        }

        for followup in followups {
            match followup {
                Followup::AutoStop(reason) => {
                    info!("Stopping recording: {}", reason);
                    if let Err(e) = self.stop_recording() {
                        error!("Automatic stop failed: {}", e);
                    }
                }
                Followup::Encoding(code) => {
                    self.recovery.recover_from_encoding_error(code);
                }
                Followup::Stream(fault) => {
                    self.recovery.recover_from_stream_error(fault);
                }
                Followup::Routing(source) => {
                    self.recovery
                        .recover_from_routing_error(RoutingFault::SourceUnavailable, source);
                }
            }
        }
    }

    /// Mix a group of aligned frames and write the result.
    fn write_group(&self, session: &mut Session, mut group: Vec<AudioFrame>) -> Result<()> {
        let frame = if group.len() == 1 {
            group.swap_remove(0)
        } else {
            match self.mixer.mix_frames(&group) {
                Some(mixed) => mixed,
                None => group.swap_remove(0),
            }
        };

        let started = Instant::now();
        let before = session.encoder.bytes_written();
        match session.encoder.write_frame(&frame) {
            Ok(()) => {
                self.data_flow.record_encode(started.elapsed(), true);
                self.data_flow
                    .record_data_written(session.encoder.bytes_written() - before);
                if let Some(level) = audio_level_db(&frame) {
                    session.audio_level_db = level;
                }
                session.remember(frame, self.config.recovery_buffer_frames);
                Ok(())
            }
            Err(e) => {
                self.data_flow.record_encode(started.elapsed(), false);
                self.data_flow.record_write_failure();
                Err(e)
            }
        }
    }

    fn progress_tick(&self) {
        let snapshot = {
            let pipeline = self.pipeline.lock();
            match (&pipeline.session, pipeline.status.state) {
                (Some(session), RecordingState::Recording) => Some((
                    RecordingProgress {
                        duration: session.active_duration(),
                        bytes_recorded: session.encoder.bytes_written(),
                        audio_level_db: session.audio_level_db,
                    },
                    session.options.max_duration,
                    session.options.output_directory.clone(),
                )),
                _ => None,
            }
        };
        let Some((progress, max_duration, dir)) = snapshot else {
            return;
        };

        match self.file_manager.check_disk_space(&dir) {
            Ok(space) => self.data_flow.update_file_system(space.available, space.total, true),
            Err(e) => debug!("Disk space query failed: {}", e),
        }

        self.delegates.notify(|d| d.on_progress(&progress));

        if progress.duration >= max_duration {
            info!("Stopping recording: maximum duration reached");
            if let Err(e) = self.stop_recording() {
                error!("Automatic stop failed: {}", e);
            }
        }
    }

    fn with_session<T>(&self, f: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
        let mut pipeline = self.pipeline.lock();
        match pipeline.session.as_mut() {
            Some(session) => f(session),
            None => Err(RecordingError::Unknown("no active recording".into())),
        }
    }

    fn output_directory(&self) -> Result<PathBuf> {
        self.with_session(|s| Ok(s.options.output_directory.clone()))
    }
}

impl RecoveryActions for ManagerShared {
    fn reinitialize_encoder(&self) -> Result<()> {
        self.with_session(|session| {
            if session.encoder.is_open() {
                session.encoder.flush()
            } else {
                let path = session.file_path.clone();
                session.encoder.initialize(session.target_format, &path)
            }
        })
    }

    fn free_disk_space(&self) -> Result<()> {
        let dir = self.output_directory()?;
        let config = self.file_manager.config();
        if config.auto_cleanup {
            self.file_manager.cleanup_old_recordings(&dir, config.retention)?;
        } else {
            debug!("Automatic cleanup disabled, re-checking space in {}", dir.display());
        }
        let space = self.file_manager.ensure_space(&dir)?;
        self.data_flow.update_file_system(space.available, space.total, true);
        Ok(())
    }

    fn check_output_writable(&self) -> Result<()> {
        let dir = self.output_directory()?;
        let writable = self.file_manager.is_writable(&dir);
        if let Ok(space) = self.file_manager.check_disk_space(&dir) {
            self.data_flow.update_file_system(space.available, space.total, writable);
        }
        if writable {
            Ok(())
        } else {
            Err(RecordingError::PermissionDenied(format!("{} is not writable", dir.display())))
        }
    }

    fn flush_encoder(&self) -> Result<()> {
        self.with_session(|session| session.encoder.flush())
    }

    fn reset_buffers(&self) -> Result<()> {
        self.with_session(|session| {
            let dropped: usize = session.pending.values().map(VecDeque::len).sum();
            session.pending.clear();
            debug!("Reset leg buffers, dropped {} frames", dropped);
            Ok(())
        })
    }

    fn reconfigure_format(&self) -> Result<()> {
        // Frames are converted one by one, so only queued legs need dropping.
        self.reset_buffers()
    }

    fn restart_capture(&self) -> Result<()> {
        if !self.capture.is_available() {
            return Err(RecordingError::Initialization("capture provider unavailable".into()));
        }
        self.capture.stop()?;
        self.capture.start(self.frame_callback())
    }

    fn reroute_source(&self, source: AudioSource) -> Result<()> {
        if !self.capture.sources().contains(&source) {
            return Err(RecordingError::Network(format!("{:?} is not provided by capture", source)));
        }
        // Stop waiting on the silent leg; it rejoins with its next frame.
        self.with_session(|session| {
            if session.pending.get(&source).is_some_and(VecDeque::is_empty) {
                session.pending.remove(&source);
            }
            Ok(())
        })
    }

    fn is_network_available(&self) -> bool {
        let state = self.pipeline.lock().status.state;
        if state != RecordingState::Recording {
            return true;
        }
        let timeout = self.config.data_flow.no_data_timeout;
        self.data_flow
            .health()
            .last_data_received
            .and_then(|last| (Utc::now() - last).to_std().ok())
            .is_some_and(|silence| silence < timeout)
    }
}

/// Routes data-flow interruptions to network recovery.
struct InterruptionRecovery {
    shared: Weak<ManagerShared>,
}

impl HealthDelegate for InterruptionRecovery {
    fn on_data_flow_interrupted(&self, _last_data: Option<DateTime<Utc>>, _silence: Duration) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if shared.pipeline.lock().status.state == RecordingState::Recording {
            shared.recovery.recover_from_network_error(NetworkFault::Interruption);
        }
    }
}
