//! Records a synthetic two-party call.
//!
//! Usage: `call-recorder-demo [options.json] [seconds]`
//!
//! Options JSON uses the camelCase field names of `RecordingOptions`; missing
//! fields keep their defaults. Set `RUST_LOG=info` to follow the pipeline.

use std::f64::consts::TAU;
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;

use call_recording_core::{
    AudioFormat, AudioRecordingManager, AudioSource, CallInfo, ManagerConfig, RecordingDelegate, RecordingError,
    RecordingOptions, RecordingProgress, RecordingResult, RecordingStatus, Result,
};
use call_recording_service::{
    AudioBridge, BridgeConfig, RecordingStatusService, StatusDelegate, StatusServiceConfig, SystemRecordingStatus,
};

const FRAME: Duration = Duration::from_millis(20);

struct ConsoleDelegate;

impl RecordingDelegate for ConsoleDelegate {
    fn on_status_changed(&self, status: &RecordingStatus) {
        log::info!("state → {:?}", status.state);
    }

    fn on_progress(&self, progress: &RecordingProgress) {
        log::info!(
            "{:.1} s, {} bytes, {:.1} dB",
            progress.duration.as_secs_f64(),
            progress.bytes_recorded,
            progress.audio_level_db
        );
    }

    fn on_error(&self, error: &RecordingError) {
        log::error!("[{}] {}", error.code(), error);
    }

    fn on_recording_finished(&self, result: &RecordingResult) {
        log::info!("finished: {}", result.file_path.display());
    }
}

impl StatusDelegate for ConsoleDelegate {
    fn on_system_status_changed(&self, status: &SystemRecordingStatus) {
        log::info!("system {:?}, issues {:?}", status.overall, status.issue_kinds());
    }
}

/// One 20 ms frame of a sine tone as 16-bit little-endian PCM.
fn tone(format: &AudioFormat, frequency: f64, amplitude: f64, frame_index: u64) -> Vec<u8> {
    let samples = (format.sample_rate as u64 * FRAME.as_millis() as u64 / 1000) as usize;
    let offset = frame_index * samples as u64;
    (0..samples)
        .flat_map(|i| {
            let t = (offset + i as u64) as f64 / format.sample_rate as f64;
            let value = (amplitude * (TAU * frequency * t).sin() * i16::MAX as f64) as i16;
            value.to_le_bytes()
        })
        .collect()
}

fn load_options(path: Option<&str>) -> Result<RecordingOptions> {
    let Some(path) = path else {
        return Ok(RecordingOptions::default());
    };
    let json = fs::read_to_string(path).map_err(|e| RecordingError::io("failed to read options", e))?;
    serde_json::from_str(&json).map_err(|e| RecordingError::Configuration(format!("{}: {}", path, e)))
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = load_options(args.first().map(String::as_str))?;
    let seconds: u64 = match args.get(1) {
        Some(s) => s
            .parse()
            .map_err(|_| RecordingError::Configuration(format!("invalid duration: {}", s)))?,
        None => 3,
    };

    let bridge = Arc::new(AudioBridge::new(BridgeConfig::default()));
    let manager = Arc::new(AudioRecordingManager::new(bridge.clone(), ManagerConfig::default()));
    let console = Arc::new(ConsoleDelegate);
    manager.add_delegate(console.clone());

    let status = RecordingStatusService::new(
        StatusServiceConfig {
            check_interval: Duration::from_secs(1),
        },
        manager.clone(),
        bridge.clone(),
    );
    status.add_delegate(console);
    status.start_monitoring()?;

    let format = AudioFormat::pcm(8000, 1, 16);
    manager.start_recording(options, CallInfo::new("+15550000001", "+15550000002"))?;

    let frames = seconds * 1000 / FRAME.as_millis() as u64;
    let started = Instant::now();
    for index in 0..frames {
        bridge.forward_audio_data(AudioSource::RtpIncoming, &tone(&format, 440.0, 0.5, index), format);
        bridge.forward_audio_data(AudioSource::RtpOutgoing, &tone(&format, 660.0, 0.25, index), format);

        let due = started + FRAME * (index as u32 + 1);
        if let Some(wait) = due.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }

    manager.stop_recording()?;
    let summary = status.check_status(Utc::now());
    status.stop_monitoring();

    if let Some(result) = manager.last_recording() {
        let json = serde_json::to_string_pretty(&result.metadata)
            .map_err(|e| RecordingError::Unknown(format!("failed to render metadata: {}", e)))?;
        println!("{}", json);
    }
    log::info!("final system status: {:?}", summary.overall);
    manager.shutdown()
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        log::error!("call-recorder-demo failed: {}", e);
        std::process::exit(1);
    }
}
