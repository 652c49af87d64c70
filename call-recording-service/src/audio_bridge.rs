//! Ingress bridge between the call legs and the recorder.
//!
//! Media threads hand raw payloads to `forward_audio_data`, which only copies
//! the bytes into a frame and queues it. A pump thread owned by the bridge
//! drains the queue into the recorder's frame callback, so a slow disk never
//! stalls the RTP or WebRTC receive path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};

use call_recording_core::models::config::duration_secs;
use call_recording_core::models::health::BufferUsageInfo;
use call_recording_core::processing::frame_buffer::FrameBufferConfig;
use call_recording_core::{
    AudioFormat, AudioFrame, AudioSource, CaptureProvider, FrameBuffer, FrameCallback, RecordingError, Result,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BridgeConfig {
    pub buffer: FrameBufferConfig,

    /// The bridge counts as active while data arrived within this window.
    #[serde(with = "duration_secs")]
    pub liveness_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            buffer: FrameBufferConfig::default(),
            liveness_timeout: Duration::from_secs(2),
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<()> {
        self.buffer.validate()?;
        if self.liveness_timeout.is_zero() {
            return Err(RecordingError::Configuration("liveness timeout must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatistics {
    pub frames: u64,
    pub bytes: u64,
    pub last_sequence: Option<u32>,
}

/// Snapshot of what the bridge has seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatistics {
    pub sources: BTreeMap<AudioSource, SourceStatistics>,
    pub frames_received: u64,
    pub frames_forwarded: u64,
    /// Dropped by the ingress buffer on overflow.
    pub frames_dropped: u64,
    /// Arrived while no recorder was attached.
    pub frames_without_sink: u64,
    pub buffer: BufferUsageInfo,
    pub last_data_received: Option<DateTime<Utc>>,
    pub is_active: bool,
}

#[derive(Default)]
struct Counters {
    sources: BTreeMap<AudioSource, SourceStatistics>,
    next_sequence: BTreeMap<AudioSource, u32>,
    frames_received: u64,
    frames_forwarded: u64,
    frames_without_sink: u64,
    last_data: Option<DateTime<Utc>>,
}

struct Ingress {
    buffer: FrameBuffer,
    running: bool,
}

struct BridgeShared {
    config: BridgeConfig,
    ingress: Mutex<Ingress>,
    wake: Condvar,
    sink: RwLock<Option<FrameCallback>>,
    counters: Mutex<Counters>,
}

/// Receives audio from the call legs and feeds the recorder.
pub struct AudioBridge {
    shared: Arc<BridgeShared>,
    pump: Mutex<Option<thread::JoinHandle<()>>>,
}

impl AudioBridge {
    pub fn new(config: BridgeConfig) -> Self {
        let buffer = FrameBuffer::new(config.buffer);
        Self {
            shared: Arc::new(BridgeShared {
                config,
                ingress: Mutex::new(Ingress { buffer, running: false }),
                wake: Condvar::new(),
                sink: RwLock::new(None),
                counters: Mutex::new(Counters::default()),
            }),
            pump: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    /// Queue a raw payload from `source`. Never blocks on the recorder.
    ///
    /// The frame gets the next per-source sequence number and the current time.
    pub fn forward_audio_data(&self, source: AudioSource, data: &[u8], format: AudioFormat) {
        if data.is_empty() {
            log::debug!("Ignoring empty payload from {:?}", source);
            return;
        }

        let sequence = {
            let mut counters = self.shared.counters.lock();
            let next = counters.next_sequence.entry(source).or_insert(0);
            let sequence = *next;
            *next = next.wrapping_add(1);
            sequence
        };

        let frame = AudioFrame::new(data.to_vec(), format, Utc::now(), source, sequence);
        self.forward_frame(frame);
    }

    /// Queue a frame built by the caller, keeping its sequence number and timestamp.
    pub fn forward_frame(&self, frame: AudioFrame) {
        {
            let mut counters = self.shared.counters.lock();
            counters.frames_received += 1;
            counters.last_data = Some(Utc::now());
            let stats = counters.sources.entry(frame.source()).or_default();
            stats.frames += 1;
            stats.bytes += frame.len() as u64;
            stats.last_sequence = Some(frame.sequence_number());
        }

        let mut ingress = self.shared.ingress.lock();
        if !ingress.running {
            drop(ingress);
            self.shared.counters.lock().frames_without_sink += 1;
            return;
        }
        ingress.buffer.push(frame);
        drop(ingress);
        self.shared.wake.notify_one();
    }

    pub fn statistics(&self) -> BridgeStatistics {
        self.statistics_at(Utc::now())
    }

    pub fn statistics_at(&self, now: DateTime<Utc>) -> BridgeStatistics {
        let (buffer, frames_dropped) = {
            let ingress = self.shared.ingress.lock();
            (ingress.buffer.usage(), ingress.buffer.dropped_frames())
        };
        let counters = self.shared.counters.lock();
        let is_active = counters
            .last_data
            .map(|last| (now - last).to_std().unwrap_or(Duration::ZERO))
            .is_some_and(|silence| silence <= self.shared.config.liveness_timeout);

        BridgeStatistics {
            sources: counters.sources.clone(),
            frames_received: counters.frames_received,
            frames_forwarded: counters.frames_forwarded,
            frames_dropped,
            frames_without_sink: counters.frames_without_sink,
            buffer,
            last_data_received: counters.last_data,
            is_active,
        }
    }

    /// Forget per-source counters and sequence numbers.
    pub fn reset_statistics(&self) {
        *self.shared.counters.lock() = Counters::default();
    }

    pub fn is_running(&self) -> bool {
        self.shared.ingress.lock().running
    }
}

impl CaptureProvider for AudioBridge {
    fn is_available(&self) -> bool {
        true
    }

    fn start(&self, callback: FrameCallback) -> Result<()> {
        *self.shared.sink.write() = Some(callback);

        let mut pump = self.pump.lock();
        {
            let mut ingress = self.shared.ingress.lock();
            if ingress.running {
                log::debug!("Audio bridge already running; sink replaced");
                return Ok(());
            }
            ingress.buffer.clear();
            ingress.running = true;
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("audio-bridge-pump".into())
            .spawn(move || pump_loop(&shared))
            .map_err(|e| {
                self.shared.ingress.lock().running = false;
                RecordingError::Initialization(format!("failed to spawn bridge pump: {}", e))
            })?;
        *pump = Some(handle);

        log::info!("Audio bridge started");
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let handle = self.pump.lock().take();
        {
            let mut ingress = self.shared.ingress.lock();
            if !ingress.running && handle.is_none() {
                return Ok(());
            }
            ingress.running = false;
        }
        self.shared.wake.notify_all();

        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // Stopped from inside the sink; the pump exits after this frame.
                *self.shared.sink.write() = None;
                return Ok(());
            }
            if handle.join().is_err() {
                log::error!("Audio bridge pump panicked");
            }
        }
        *self.shared.sink.write() = None;

        log::info!("Audio bridge stopped");
        Ok(())
    }

    fn sources(&self) -> Vec<AudioSource> {
        AudioSource::LEGS.to_vec()
    }
}

impl Drop for AudioBridge {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Deliver queued frames until stopped, then deliver what is left.
fn pump_loop(shared: &BridgeShared) {
    loop {
        let batch = {
            let mut ingress = shared.ingress.lock();
            while ingress.running && ingress.buffer.is_empty() {
                shared.wake.wait(&mut ingress);
            }
            if ingress.buffer.is_empty() {
                break;
            }
            ingress.buffer.drain()
        };

        let sink = shared.sink.read().clone();
        let Some(sink) = sink else {
            shared.counters.lock().frames_without_sink += batch.len() as u64;
            continue;
        };
        let delivered = batch.len() as u64;
        for frame in batch {
            sink(frame);
        }
        shared.counters.lock().frames_forwarded += delivered;
    }
    log::debug!("Audio bridge pump exiting");
}
