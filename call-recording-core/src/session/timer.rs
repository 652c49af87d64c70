use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::models::error::{RecordingError, Result};

/// A named background thread that runs `tick` every `interval`.
///
/// `stop` wakes the thread, lets an in-flight tick finish and joins it.
/// Stopping twice, or dropping after a stop, is a no-op.
pub struct PeriodicTask {
    name: String,
    signal: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let signal = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_signal = Arc::clone(&signal);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let (stopped, wake) = &*thread_signal;
                let mut guard = stopped.lock();
                let mut next = Instant::now() + interval;

                while !*guard {
                    wake.wait_until(&mut guard, next);
                    if *guard {
                        break;
                    }
                    if Instant::now() >= next {
                        MutexGuard::unlocked(&mut guard, &mut tick);
                        next += interval;
                        let now = Instant::now();
                        if next < now {
                            // Fell behind; skip the missed ticks.
                            next = now + interval;
                        }
                    }
                }
            })
            .map_err(|e| RecordingError::Initialization(format!("failed to spawn {}: {}", name, e)))?;

        debug!("Started periodic task {} every {:?}", name, interval);
        Ok(Self {
            name: name.to_string(),
            signal,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        {
            let (stopped, wake) = &*self.signal;
            *stopped.lock() = true;
            wake.notify_all();
        }

        // A tick that stops its own task cannot join itself.
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("Periodic task {} panicked", self.name);
        } else {
            debug!("Stopped periodic task {}", self.name);
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}
