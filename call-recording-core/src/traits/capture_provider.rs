use std::sync::Arc;

use crate::models::audio_models::{AudioFrame, AudioSource};
use crate::models::error::Result;

/// Sink invoked for every frame a provider delivers.
///
/// Called on the provider's delivery thread; keep work minimal.
pub type FrameCallback = Arc<dyn Fn(AudioFrame) + Send + Sync + 'static>;

/// A source of call audio the recorder can attach to.
///
/// Implemented by the ingress bridge that receives frames from the call legs.
/// `start` and `stop` take `&self`; implementations keep their own
/// synchronization so one provider can be shared with status reporting.
pub trait CaptureProvider: Send + Sync {
    /// Whether frames can currently be delivered.
    fn is_available(&self) -> bool;

    /// Begin delivering frames to `callback`. Replaces any previous sink.
    fn start(&self, callback: FrameCallback) -> Result<()>;

    /// Stop delivery. Frames already accepted are delivered before this returns.
    fn stop(&self) -> Result<()>;

    /// Sources this provider can deliver.
    fn sources(&self) -> Vec<AudioSource>;
}
