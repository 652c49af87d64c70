use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::models::audio_models::{AudioFrame, AudioSource};
use crate::models::config::duration_secs;
use crate::models::error::{RecordingError, Result};
use crate::models::quality::{
    millis, AudioQuality, AudioQualityMetrics, AudioStreamStats, QualityIssue, QualityThresholds,
    QualityWarning, SILENCE_DB,
};
use crate::processing::converter::AudioFormatConverter;
use crate::processing::mixer::AudioMixer;
use crate::session::timer::PeriodicTask;
use crate::traits::delegates::{DelegateSet, QualityDelegate};

/// Weight of the newest sample in every moving average.
const EMA_WEIGHT: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QualityMonitorConfig {
    pub thresholds: QualityThresholds,

    /// A gap longer than this between two frames of one source is an interruption.
    #[serde(with = "duration_secs")]
    pub interruption_gap: Duration,

    #[serde(with = "duration_secs")]
    pub loss_window: Duration,

    /// Frames per second a healthy source delivers (50 for 20 ms packetization).
    pub expected_frame_rate: f64,

    #[serde(with = "duration_secs")]
    pub stats_interval: Duration,

    #[serde(with = "duration_secs")]
    pub quality_check_interval: Duration,

    /// Arrival timestamps kept per source for loss estimation.
    pub max_timestamps: usize,
}

impl Default for QualityMonitorConfig {
    fn default() -> Self {
        Self {
            thresholds: QualityThresholds::default(),
            interruption_gap: Duration::from_millis(100),
            loss_window: Duration::from_secs(5),
            expected_frame_rate: 50.0,
            stats_interval: Duration::from_secs(1),
            quality_check_interval: Duration::from_secs(5),
            max_timestamps: 1000,
        }
    }
}

impl QualityMonitorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.expected_frame_rate <= 0.0 {
            return Err(RecordingError::Configuration("expected frame rate must be positive".into()));
        }
        if self.stats_interval.is_zero() || self.quality_check_interval.is_zero() {
            return Err(RecordingError::Configuration("monitor intervals must be positive".into()));
        }
        if self.max_timestamps == 0 {
            return Err(RecordingError::Configuration("timestamp queue bound must be positive".into()));
        }
        Ok(())
    }
}

/// Level of a frame in dBFS, or `None` for formats that cannot be decoded.
pub fn audio_level_db(frame: &AudioFrame) -> Option<f64> {
    let (samples, bits) = AudioFormatConverter::convert_sample_format(frame.data(), frame.format())?;
    if samples.is_empty() {
        return Some(SILENCE_DB);
    }
    let full_scale = (1u64 << (bits - 1)) as f32;
    let normalized: Vec<f32> = samples.iter().map(|&s| s as f32 / full_scale).collect();
    let rms = AudioMixer::rms_level(&normalized) as f64;
    if rms <= 0.0 {
        return Some(SILENCE_DB);
    }
    Some((20.0 * rms.log10()).max(SILENCE_DB))
}

struct SourceState {
    stats: AudioStreamStats,
    metrics: Option<AudioQualityMetrics>,
    arrivals: VecDeque<DateTime<Utc>>,
    active_issues: HashSet<QualityIssue>,
}

impl SourceState {
    fn new(source: AudioSource) -> Self {
        Self {
            stats: AudioStreamStats::new(source),
            metrics: None,
            arrivals: VecDeque::new(),
            active_issues: HashSet::new(),
        }
    }
}

struct QualityShared {
    config: QualityMonitorConfig,
    sources: Mutex<BTreeMap<AudioSource, SourceState>>,
    delegates: DelegateSet<dyn QualityDelegate>,
}

/// Per-source latency, jitter, loss and level tracking with periodic scoring.
///
/// Two periodic tasks drive it while monitoring: a statistics tick that
/// refreshes the loss estimate, and a quality tick that scores every source
/// with data and notifies delegates.
pub struct AudioQualityMonitor {
    shared: Arc<QualityShared>,
    tasks: Mutex<Vec<PeriodicTask>>,
}

impl AudioQualityMonitor {
    pub fn new(config: QualityMonitorConfig) -> Self {
        let sources = AudioSource::ALL
            .iter()
            .map(|&s| (s, SourceState::new(s)))
            .collect();
        Self {
            shared: Arc::new(QualityShared {
                config,
                sources: Mutex::new(sources),
                delegates: DelegateSet::new(),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &QualityMonitorConfig {
        &self.shared.config
    }

    pub fn add_delegate(&self, delegate: Arc<dyn QualityDelegate>) {
        self.shared.delegates.add(delegate);
    }

    pub fn record_frame(&self, frame: &AudioFrame) {
        self.record_frame_at(frame, Utc::now());
    }

    pub fn record_frame_at(&self, frame: &AudioFrame, now: DateTime<Utc>) {
        let config = &self.shared.config;
        let latency_ms = (now - frame.timestamp())
            .to_std()
            .map(millis)
            .unwrap_or(0.0);
        let level_db = audio_level_db(frame);

        let mut sources = self.shared.sources.lock();
        let state = sources
            .entry(frame.source())
            .or_insert_with(|| SourceState::new(frame.source()));
        let stats = &mut state.stats;

        if let Some(last) = stats.last_frame_at {
            let gap = (now - last).to_std().unwrap_or_default();
            if gap > config.interruption_gap {
                stats.interruptions += 1;
            }
        }

        if stats.total_frames == 0 {
            stats.average_latency_ms = latency_ms;
            stats.jitter_ms = 0.0;
            if let Some(db) = level_db {
                stats.audio_level_db = db;
            }
            stats.first_frame_at = Some(now);
        } else {
            let deviation = (latency_ms - stats.average_latency_ms).abs();
            stats.jitter_ms = ema(stats.jitter_ms, deviation);
            stats.average_latency_ms = ema(stats.average_latency_ms, latency_ms);
            if let Some(db) = level_db {
                stats.audio_level_db = ema(stats.audio_level_db, db);
            }
        }

        stats.total_frames += 1;
        stats.total_bytes += frame.len() as u64;
        stats.last_frame_at = Some(now);

        state.arrivals.push_back(now);
        while state.arrivals.len() > config.max_timestamps {
            state.arrivals.pop_front();
        }
    }

    pub fn record_underflow(&self, source: AudioSource) {
        if let Some(state) = self.shared.sources.lock().get_mut(&source) {
            state.stats.underflows += 1;
        }
    }

    pub fn record_overflow(&self, source: AudioSource) {
        if let Some(state) = self.shared.sources.lock().get_mut(&source) {
            state.stats.overflows += 1;
        }
    }

    /// Refresh the windowed loss estimate of every source.
    pub fn update_statistics(&self, now: DateTime<Utc>) {
        self.shared.update_statistics(now);
    }

    /// Score every source that has received frames and notify delegates.
    pub fn check_quality(&self, now: DateTime<Utc>) -> Vec<AudioQualityMetrics> {
        self.shared.check_quality(now)
    }

    pub fn start_monitoring(&self) -> Result<()> {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Ok(());
        }

        let stats = Arc::clone(&self.shared);
        tasks.push(PeriodicTask::spawn(
            "quality-stats",
            self.shared.config.stats_interval,
            move || stats.update_statistics(Utc::now()),
        )?);

        let quality = Arc::clone(&self.shared);
        tasks.push(PeriodicTask::spawn(
            "quality-check",
            self.shared.config.quality_check_interval,
            move || {
                quality.check_quality(Utc::now());
            },
        )?);

        log::info!("Quality monitoring started");
        Ok(())
    }

    pub fn stop_monitoring(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        for task in &mut tasks {
            task.stop();
        }
        log::info!("Quality monitoring stopped");
    }

    pub fn is_monitoring(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    pub fn reset(&self) {
        let mut sources = self.shared.sources.lock();
        for (source, state) in sources.iter_mut() {
            *state = SourceState::new(*source);
        }
    }

    pub fn reset_source(&self, source: AudioSource) {
        self.shared
            .sources
            .lock()
            .insert(source, SourceState::new(source));
    }

    pub fn stream_stats(&self, source: AudioSource) -> AudioStreamStats {
        self.shared
            .sources
            .lock()
            .get(&source)
            .map(|s| s.stats.clone())
            .unwrap_or_else(|| AudioStreamStats::new(source))
    }

    pub fn all_stats(&self) -> Vec<AudioStreamStats> {
        self.shared
            .sources
            .lock()
            .values()
            .map(|s| s.stats.clone())
            .collect()
    }

    pub fn metrics(&self, source: AudioSource) -> Option<AudioQualityMetrics> {
        self.shared
            .sources
            .lock()
            .get(&source)
            .and_then(|s| s.metrics.clone())
    }

    /// Worst quality across scored sources; `Unknown` before the first check.
    pub fn overall_quality(&self) -> AudioQuality {
        self.shared
            .sources
            .lock()
            .values()
            .filter_map(|s| s.metrics.as_ref().map(|m| m.level))
            .min()
            .map(AudioQuality::from)
            .unwrap_or(AudioQuality::Unknown)
    }
}

impl Drop for AudioQualityMonitor {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

impl QualityShared {
    fn update_statistics(&self, now: DateTime<Utc>) {
        let window = self.config.loss_window;
        let cutoff = now - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(5));

        let mut sources = self.sources.lock();
        for state in sources.values_mut() {
            let Some(first) = state.stats.first_frame_at else {
                continue;
            };
            while state.arrivals.front().is_some_and(|&t| t < cutoff) {
                state.arrivals.pop_front();
            }

            let since_first = (now - first).to_std().unwrap_or_default();
            let span = since_first.min(window).as_secs_f64();
            let expected = self.config.expected_frame_rate * span;
            state.stats.packet_loss_percent = if expected < 1.0 {
                0.0
            } else {
                let received = state.arrivals.len() as f64;
                (expected - received).max(0.0) / expected * 100.0
            };
        }
    }

    fn check_quality(&self, now: DateTime<Utc>) -> Vec<AudioQualityMetrics> {
        let thresholds = &self.config.thresholds;
        let mut scored = Vec::new();
        let mut warnings = Vec::new();

        {
            let mut sources = self.sources.lock();
            for state in sources.values_mut() {
                if !state.stats.has_data() {
                    continue;
                }
                let metrics = AudioQualityMetrics::evaluate(&state.stats, thresholds, now);

                for issue in &metrics.issues {
                    if state.active_issues.contains(issue) {
                        continue;
                    }
                    let (value, threshold) = match issue {
                        QualityIssue::HighLatency => (metrics.latency_ms, thresholds.latency_warning_ms),
                        QualityIssue::PacketLoss => {
                            (metrics.packet_loss_percent, thresholds.packet_loss_warning_percent)
                        }
                        QualityIssue::HighJitter => (metrics.jitter_ms, thresholds.jitter_warning_ms),
                        QualityIssue::FrequentInterruptions => {
                            (metrics.interruptions as f64, thresholds.max_interruptions as f64)
                        }
                    };
                    warnings.push(QualityWarning {
                        source: metrics.source,
                        issue: *issue,
                        value,
                        threshold,
                        raised_at: now,
                    });
                }

                state.active_issues = metrics.issues.iter().copied().collect();
                state.metrics = Some(metrics.clone());
                scored.push(metrics);
            }
        }

        for warning in &warnings {
            log::warn!(
                "Quality warning for {:?}: {:?} at {:.1} (threshold {:.1})",
                warning.source,
                warning.issue,
                warning.value,
                warning.threshold
            );
        }
        for metrics in &scored {
            self.delegates.notify(|d| d.on_quality_changed(metrics));
        }
        for warning in &warnings {
            self.delegates.notify(|d| d.on_quality_warning(warning));
        }
        scored
    }
}

fn ema(average: f64, sample: f64) -> f64 {
    average * (1.0 - EMA_WEIGHT) + sample * EMA_WEIGHT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::audio_models::AudioFormat;
    use crate::models::quality::QualityLevel;
    use approx::assert_abs_diff_eq;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn ms(n: i64) -> chrono::Duration {
        chrono::Duration::milliseconds(n)
    }

    fn frame_sent_at(source: AudioSource, sent: DateTime<Utc>, sample: i16) -> AudioFrame {
        let data: Vec<u8> = std::iter::repeat(sample.to_le_bytes()).take(160).flatten().collect();
        AudioFrame::new(data, AudioFormat::pcm(8000, 1, 16), sent, source, 0)
    }

    #[derive(Default)]
    struct Events {
        changed: Mutex<Vec<AudioQualityMetrics>>,
        warnings: Mutex<Vec<QualityWarning>>,
    }

    impl QualityDelegate for Events {
        fn on_quality_changed(&self, metrics: &AudioQualityMetrics) {
            self.changed.lock().push(metrics.clone());
        }

        fn on_quality_warning(&self, warning: &QualityWarning) {
            self.warnings.lock().push(warning.clone());
        }
    }

    #[test]
    fn every_source_starts_empty() {
        let monitor = AudioQualityMonitor::new(QualityMonitorConfig::default());
        let stats = monitor.all_stats();
        assert_eq!(stats.len(), AudioSource::ALL.len());
        assert!(stats.iter().all(|s| !s.has_data()));
        assert_eq!(monitor.overall_quality(), AudioQuality::Unknown);
    }

    #[test]
    fn latency_and_jitter_moving_averages() {
        let monitor = AudioQualityMonitor::new(QualityMonitorConfig::default());
        let source = AudioSource::RtpIncoming;

        let now = t0();
        monitor.record_frame_at(&frame_sent_at(source, now - ms(100), 0), now);
        let later = now + ms(20);
        monitor.record_frame_at(&frame_sent_at(source, later - ms(200), 0), later);

        let stats = monitor.stream_stats(source);
        assert_eq!(stats.total_frames, 2);
        assert_eq!(stats.total_bytes, 640);
        assert_abs_diff_eq!(stats.average_latency_ms, 110.0, epsilon = 1e-9);
        assert_abs_diff_eq!(stats.jitter_ms, 10.0, epsilon = 1e-9);
    }

    #[test]
    fn frames_from_the_future_have_zero_latency() {
        let monitor = AudioQualityMonitor::new(QualityMonitorConfig::default());
        let now = t0();
        monitor.record_frame_at(&frame_sent_at(AudioSource::WebRtcIncoming, now + ms(50), 0), now);
        assert_eq!(monitor.stream_stats(AudioSource::WebRtcIncoming).average_latency_ms, 0.0);
    }

    #[test]
    fn gaps_count_as_interruptions() {
        let monitor = AudioQualityMonitor::new(QualityMonitorConfig::default());
        let source = AudioSource::WebRtcIncoming;
        for offset in [0, 20, 300, 320] {
            let at = t0() + ms(offset);
            monitor.record_frame_at(&frame_sent_at(source, at, 0), at);
        }
        assert_eq!(monitor.stream_stats(source).interruptions, 1);
    }

    #[test]
    fn level_tracks_signal_power() {
        let monitor = AudioQualityMonitor::new(QualityMonitorConfig::default());
        let now = t0();
        monitor.record_frame_at(&frame_sent_at(AudioSource::RtpIncoming, now, 0), now);
        monitor.record_frame_at(&frame_sent_at(AudioSource::RtpOutgoing, now, 16384), now);

        assert_eq!(monitor.stream_stats(AudioSource::RtpIncoming).audio_level_db, SILENCE_DB);
        assert_abs_diff_eq!(
            monitor.stream_stats(AudioSource::RtpOutgoing).audio_level_db,
            -6.02,
            epsilon = 0.01
        );
    }

    #[test]
    fn loss_estimate_over_window() {
        let monitor = AudioQualityMonitor::new(QualityMonitorConfig::default());
        let source = AudioSource::RtpIncoming;
        for i in 0..250 {
            if i % 10 == 0 {
                continue;
            }
            let at = t0() + ms(i * 20);
            monitor.record_frame_at(&frame_sent_at(source, at, 0), at);
        }

        monitor.update_statistics(t0() + ms(5000));
        let loss = monitor.stream_stats(source).packet_loss_percent;
        assert!((9.0..10.5).contains(&loss), "loss {}", loss);
    }

    #[test]
    fn no_loss_estimate_until_a_frame_is_expected() {
        let monitor = AudioQualityMonitor::new(QualityMonitorConfig::default());
        let now = t0();
        monitor.record_frame_at(&frame_sent_at(AudioSource::RtpIncoming, now, 0), now);
        monitor.update_statistics(now + ms(10));
        assert_eq!(monitor.stream_stats(AudioSource::RtpIncoming).packet_loss_percent, 0.0);
    }

    #[test]
    fn clean_source_scores_excellent() {
        let monitor = AudioQualityMonitor::new(QualityMonitorConfig::default());
        let events = Arc::new(Events::default());
        monitor.add_delegate(events.clone());

        for i in 0..50 {
            let at = t0() + ms(i * 20);
            monitor.record_frame_at(&frame_sent_at(AudioSource::RtpIncoming, at - ms(20), 0), at);
        }
        monitor.update_statistics(t0() + ms(1000));
        let scored = monitor.check_quality(t0() + ms(1000));

        assert_eq!(scored.len(), 1);
        assert_eq!(scored[0].score, 100);
        assert_eq!(scored[0].level, QualityLevel::Excellent);
        assert_eq!(monitor.overall_quality(), AudioQuality::Excellent);
        assert_eq!(events.changed.lock().len(), 1);
        assert!(events.warnings.lock().is_empty());
        assert!(monitor.metrics(AudioSource::WebRtcIncoming).is_none());
    }

    #[test]
    fn warnings_fire_on_crossing_only() {
        let monitor = AudioQualityMonitor::new(QualityMonitorConfig::default());
        let events = Arc::new(Events::default());
        monitor.add_delegate(events.clone());

        let now = t0();
        monitor.record_frame_at(&frame_sent_at(AudioSource::WebRtcIncoming, now - ms(200), 0), now);

        monitor.check_quality(now);
        monitor.check_quality(now + ms(10));

        let warnings = events.warnings.lock();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].issue, QualityIssue::HighLatency);
        assert_abs_diff_eq!(warnings[0].threshold, 150.0);
        assert_eq!(events.changed.lock().len(), 2);
        assert_eq!(
            monitor.metrics(AudioSource::WebRtcIncoming).map(|m| m.score),
            Some(80)
        );
    }

    #[test]
    fn reset_clears_statistics() {
        let monitor = AudioQualityMonitor::new(QualityMonitorConfig::default());
        let now = t0();
        monitor.record_frame_at(&frame_sent_at(AudioSource::RtpIncoming, now, 0), now);
        monitor.record_frame_at(&frame_sent_at(AudioSource::RtpOutgoing, now, 0), now);
        monitor.record_overflow(AudioSource::RtpIncoming);

        monitor.reset_source(AudioSource::RtpIncoming);
        assert!(!monitor.stream_stats(AudioSource::RtpIncoming).has_data());
        assert!(monitor.stream_stats(AudioSource::RtpOutgoing).has_data());

        monitor.reset();
        assert!(monitor.all_stats().iter().all(|s| !s.has_data()));
    }

    #[test]
    fn periodic_checks_run_while_monitoring() {
        let monitor = AudioQualityMonitor::new(QualityMonitorConfig {
            stats_interval: Duration::from_millis(10),
            quality_check_interval: Duration::from_millis(10),
            ..Default::default()
        });
        let events = Arc::new(Events::default());
        monitor.add_delegate(events.clone());
        monitor.record_frame(&frame_sent_at(AudioSource::RtpIncoming, Utc::now(), 0));

        monitor.start_monitoring().unwrap();
        assert!(monitor.is_monitoring());
        std::thread::sleep(Duration::from_millis(100));
        monitor.stop_monitoring();

        assert!(!monitor.is_monitoring());
        assert!(!events.changed.lock().is_empty());
    }
}
