//! # call-recording-core
//!
//! Call audio recording pipeline.
//!
//! Takes frames from the call legs (RTP or WebRTC, each direction), converts
//! them to one target format, mixes the legs, and streams the result into a
//! WAV file with a JSON metadata sidecar. Quality and data-flow monitors watch
//! the stream while it records, and a recovery manager reacts to faults.
//! The frame source plugs in through the `CaptureProvider` trait.
//!
//! ## Architecture
//!
//! ```text
//! call-recording-core (this crate)
//! ├── traits/       ← CaptureProvider, delegate traits, DelegateSet
//! ├── models/       ← RecordingError, RecordingState, RecordingOptions, AudioFrame, health, quality
//! ├── processing/   ← G.711, AudioFormatConverter, AudioMixer, FrameBuffer, WAV header
//! ├── monitoring/   ← AudioQualityMonitor, AudioDataFlowMonitor
//! ├── recovery/     ← AudioErrorRecoveryManager
//! ├── session/      ← AudioRecordingManager (orchestrator), PeriodicTask
//! └── storage/      ← StreamingAudioEncoder, RecordingFileManager, validator, metadata
//! ```

pub mod models;
pub mod monitoring;
pub mod processing;
pub mod recovery;
pub mod session;
pub mod storage;
pub mod traits;

// Re-export key types at crate root for convenience.
pub use models::audio_models::{AudioFormat, AudioFrame, AudioSource, SampleFormat};
pub use models::config::{AudioCodec, CallInfo, RecordingOptions, RecordingQuality};
pub use models::error::{RecordingError, RecordingErrorCode, Result};
pub use models::health::{HealthIssue, RecordingHealthStatus};
pub use models::quality::{AudioQuality, AudioQualityMetrics, QualityLevel};
pub use models::recording_result::{RecordingMetadata, RecordingProgress, RecordingResult};
pub use models::state::{RecordingState, RecordingStatus};
pub use monitoring::data_flow::AudioDataFlowMonitor;
pub use monitoring::quality_monitor::AudioQualityMonitor;
pub use processing::converter::AudioFormatConverter;
pub use processing::frame_buffer::FrameBuffer;
pub use processing::mixer::AudioMixer;
pub use recovery::recovery_manager::AudioErrorRecoveryManager;
pub use session::manager::{AudioRecordingManager, ManagerConfig};
pub use session::timer::PeriodicTask;
pub use storage::file_manager::RecordingFileManager;
pub use storage::streaming_encoder::StreamingAudioEncoder;
pub use storage::validator::ZeroByteFileDetector;
pub use traits::capture_provider::{CaptureProvider, FrameCallback};
pub use traits::delegates::{DelegateSet, RecordingDelegate};
