use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{RecordingError, RecordingErrorCode};

/// Recording state machine.
///
/// State transitions:
/// ```text
/// idle/completed/cancelled/error → starting → recording ↔ paused
///                                      ↓          ↓         ↓
///                                    error     stopping → completed / error
///            starting/recording/paused → cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordingState {
    Idle,
    Starting,
    Recording,
    Paused,
    Stopping,
    Completed,
    Cancelled,
    Error,
}

impl RecordingState {
    /// Idle, Completed and Error accept a new recording. Cancelled does too,
    /// since a cancelled session leaves nothing behind to finish.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Idle | Self::Completed | Self::Cancelled | Self::Error)
    }

    pub fn can_stop(&self) -> bool {
        matches!(self, Self::Recording | Self::Paused)
    }

    pub fn can_pause(&self) -> bool {
        matches!(self, Self::Recording)
    }

    pub fn can_resume(&self) -> bool {
        matches!(self, Self::Paused)
    }

    pub fn can_cancel(&self) -> bool {
        matches!(self, Self::Starting | Self::Recording | Self::Paused)
    }

    /// Whether a recording file is open.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Recording | Self::Paused | Self::Stopping)
    }
}

/// Snapshot of the recording state plus what the current recording has produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingStatus {
    pub state: RecordingState,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub bytes_recorded: u64,
    pub current_file_path: Option<PathBuf>,
    pub error_code: Option<RecordingErrorCode>,
    pub error_message: Option<String>,
}

impl RecordingStatus {
    pub fn new() -> Self {
        Self {
            state: RecordingState::Idle,
            start_time: None,
            end_time: None,
            bytes_recorded: 0,
            current_file_path: None,
            error_code: None,
            error_message: None,
        }
    }

    pub fn can_start(&self) -> bool {
        self.state.can_start()
    }

    pub fn can_stop(&self) -> bool {
        self.state.can_stop()
    }

    pub fn can_pause(&self) -> bool {
        self.state.can_pause()
    }

    pub fn can_resume(&self) -> bool {
        self.state.can_resume()
    }

    /// Clears everything left over from the previous recording.
    pub fn begin(&mut self, now: DateTime<Utc>) {
        *self = Self {
            state: RecordingState::Starting,
            start_time: Some(now),
            ..Self::new()
        };
    }

    pub fn fail(&mut self, error: &RecordingError, now: DateTime<Utc>) {
        self.state = RecordingState::Error;
        self.end_time = Some(now);
        self.error_code = Some(error.code());
        self.error_message = Some(error.to_string());
    }
}

impl Default for RecordingStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards() {
        use RecordingState::*;

        for state in [Idle, Completed, Cancelled, Error] {
            assert!(state.can_start(), "{:?}", state);
        }
        for state in [Starting, Recording, Paused, Stopping] {
            assert!(!state.can_start(), "{:?}", state);
        }

        assert!(Recording.can_stop());
        assert!(Paused.can_stop());
        assert!(!Idle.can_stop());

        assert!(Recording.can_pause());
        assert!(!Paused.can_pause());
        assert!(!Idle.can_pause());

        assert!(Paused.can_resume());
        assert!(!Recording.can_resume());
    }

    #[test]
    fn fail_records_code_and_message() {
        let mut status = RecordingStatus::new();
        status.begin(Utc::now());
        status.fail(&RecordingError::Storage("disk gone".into()), Utc::now());

        assert_eq!(status.state, RecordingState::Error);
        assert_eq!(status.error_code, Some(RecordingErrorCode::StorageFailed));
        assert!(status.error_message.unwrap().contains("disk gone"));
        assert!(status.end_time.is_some());
    }

    #[test]
    fn begin_resets_previous_recording() {
        let mut status = RecordingStatus::new();
        status.bytes_recorded = 1234;
        status.current_file_path = Some(PathBuf::from("/tmp/x.wav"));
        status.error_code = Some(RecordingErrorCode::Unknown);

        status.begin(Utc::now());
        assert_eq!(status.state, RecordingState::Starting);
        assert_eq!(status.bytes_recorded, 0);
        assert!(status.current_file_path.is_none());
        assert!(status.error_code.is_none());
    }
}
