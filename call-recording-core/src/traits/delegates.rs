//! Event delegates.
//!
//! Every method has a no-op default so listeners implement only what they
//! need. Methods are called from whichever thread produced the event: frame
//! ingress, a periodic task, or the API caller. Encoder events fire while the
//! recorder holds its pipeline lock, so encoder listeners must not call back
//! into the manager. All other events fire with no component lock held.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::models::error::RecordingError;
use crate::models::health::RecordingHealthStatus;
use crate::models::quality::{AudioQualityMetrics, QualityWarning};
use crate::models::recording_result::{RecordingProgress, RecordingResult};
use crate::models::state::RecordingStatus;
use crate::recovery::recovery_manager::RecoveryAttempt;
use crate::storage::file_manager::StorageWarning;

pub trait RecordingDelegate: Send + Sync {
    fn on_status_changed(&self, _status: &RecordingStatus) {}

    fn on_progress(&self, _progress: &RecordingProgress) {}

    fn on_error(&self, _error: &RecordingError) {}

    /// Called once the file is finalized and its sidecar written.
    fn on_recording_finished(&self, _result: &RecordingResult) {}
}

pub trait EncoderDelegate: Send + Sync {
    /// `bytes_written` counts audio data only, header excluded.
    fn on_encoding_progress(&self, _bytes_written: u64, _duration: Duration) {}

    fn on_encoding_error(&self, _error: &RecordingError) {}
}

pub trait QualityDelegate: Send + Sync {
    fn on_quality_changed(&self, _metrics: &AudioQualityMetrics) {}

    fn on_quality_warning(&self, _warning: &QualityWarning) {}
}

pub trait HealthDelegate: Send + Sync {
    fn on_health_changed(&self, _health: &RecordingHealthStatus) {}

    /// Raised once per interruption, when no data arrived for longer than the timeout.
    fn on_data_flow_interrupted(&self, _last_data: Option<DateTime<Utc>>, _silence: Duration) {}
}

pub trait StorageDelegate: Send + Sync {
    fn on_storage_warning(&self, _warning: &StorageWarning) {}

    fn on_file_created(&self, _path: &Path) {}

    fn on_file_deleted(&self, _path: &Path) {}
}

pub trait RecoveryDelegate: Send + Sync {
    fn on_recovery_attempted(&self, _attempt: &RecoveryAttempt) {}
}

/// Registered listeners for one delegate trait.
///
/// Notification iterates a snapshot, so listeners may register or remove
/// delegates from inside a callback.
pub struct DelegateSet<D: ?Sized> {
    delegates: RwLock<Vec<Arc<D>>>,
}

impl<D: ?Sized> DelegateSet<D> {
    pub fn new() -> Self {
        Self {
            delegates: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, delegate: Arc<D>) {
        self.delegates.write().push(delegate);
    }

    /// Removes `delegate` by identity. Returns whether it was registered.
    pub fn remove(&self, delegate: &Arc<D>) -> bool {
        let mut delegates = self.delegates.write();
        let before = delegates.len();
        delegates.retain(|d| !Arc::ptr_eq(d, delegate));
        delegates.len() != before
    }

    pub fn clear(&self) {
        self.delegates.write().clear();
    }

    pub fn len(&self) -> usize {
        self.delegates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.delegates.read().is_empty()
    }

    pub fn notify(&self, event: impl Fn(&D)) {
        let snapshot = self.delegates.read().clone();
        for delegate in &snapshot {
            event(delegate);
        }
    }
}

/// Lets a set stand in as a single encoder listener, so one registration can
/// follow the recorder across per-recording encoders.
impl EncoderDelegate for DelegateSet<dyn EncoderDelegate> {
    fn on_encoding_progress(&self, bytes_written: u64, duration: Duration) {
        self.notify(|d| d.on_encoding_progress(bytes_written, duration));
    }

    fn on_encoding_error(&self, error: &RecordingError) {
        self.notify(|d| d.on_encoding_error(error));
    }
}

impl<D: ?Sized> Default for DelegateSet<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collecting {
        errors: Mutex<Vec<String>>,
    }

    impl RecordingDelegate for Collecting {
        fn on_error(&self, error: &RecordingError) {
            self.errors.lock().push(error.to_string());
        }
    }

    #[test]
    fn notifies_every_registered_delegate() {
        let set: DelegateSet<dyn RecordingDelegate> = DelegateSet::new();
        let a = Arc::new(Collecting::default());
        let b = Arc::new(Collecting::default());
        set.add(a.clone());
        set.add(b.clone());

        set.notify(|d| d.on_error(&RecordingError::Timeout("rtp".into())));

        assert_eq!(a.errors.lock().len(), 1);
        assert_eq!(b.errors.lock().len(), 1);
    }

    #[test]
    fn remove_by_identity() {
        let set: DelegateSet<dyn RecordingDelegate> = DelegateSet::new();
        let a: Arc<dyn RecordingDelegate> = Arc::new(Collecting::default());
        let b: Arc<dyn RecordingDelegate> = Arc::new(Collecting::default());
        set.add(a.clone());
        set.add(b.clone());

        assert!(set.remove(&a));
        assert!(!set.remove(&a));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn default_methods_are_no_ops() {
        struct Silent;
        impl QualityDelegate for Silent {}

        let set: DelegateSet<dyn QualityDelegate> = DelegateSet::default();
        set.add(Arc::new(Silent));
        set.notify(|d| {
            d.on_quality_warning(&QualityWarning {
                source: crate::models::audio_models::AudioSource::RtpIncoming,
                issue: crate::models::quality::QualityIssue::HighJitter,
                value: 40.0,
                threshold: 30.0,
                raised_at: Utc::now(),
            })
        });
        assert!(!set.is_empty());
    }
}
