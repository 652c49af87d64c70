//! # call-recording-service
//!
//! Runtime glue around `call-recording-core`.
//!
//! Provides:
//! - `AudioBridge`: ingress for call-leg audio, implements `CaptureProvider`
//! - `RecordingStatusService`: system-wide health verdict over the recorder and the bridge
//!
//! ## Usage
//! ```ignore
//! use std::sync::Arc;
//! use call_recording_core::{AudioRecordingManager, ManagerConfig};
//! use call_recording_service::{AudioBridge, BridgeConfig};
//!
//! let bridge = Arc::new(AudioBridge::new(BridgeConfig::default()));
//! let manager = AudioRecordingManager::new(bridge.clone(), ManagerConfig::default());
//! manager.start_recording(options, call)?;
//! bridge.forward_audio_data(AudioSource::RtpIncoming, &payload, format);
//! ```

pub mod audio_bridge;
pub mod status_service;

pub use audio_bridge::{AudioBridge, BridgeConfig, BridgeStatistics};
pub use status_service::{
    OverallHealth, RecordingStatusService, Severity, StatusDelegate, StatusIssue, StatusIssueKind,
    StatusServiceConfig, SystemRecordingStatus,
};
