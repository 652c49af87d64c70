use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::models::audio_models::AudioSource;
use crate::models::config::duration_secs;
use crate::models::error::{RecordingError, RecordingErrorCode, Result};
use crate::traits::delegates::{DelegateSet, RecoveryDelegate};

/// Attempts kept for `recent_attempts`.
const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamFault {
    BufferOverflow,
    BufferUnderflow,
    FormatMismatch,
    DeviceError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoutingFault {
    SourceUnavailable,
    RouteLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkFault {
    ConnectionLost,
    Interruption,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecoveryOutcome {
    Recovered,
    Failed,
    /// The same fault was handled less than `min_recovery_interval` ago.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub key: String,
    pub outcome: RecoveryOutcome,
    pub attempted_at: DateTime<Utc>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecoveryCounters {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub skipped: u64,
}

impl RecoveryCounters {
    fn record(&mut self, outcome: RecoveryOutcome) {
        match outcome {
            RecoveryOutcome::Recovered => self.successes += 1,
            RecoveryOutcome::Failed => self.failures += 1,
            RecoveryOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.successes as f64 / self.attempts as f64
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecoveryStatistics {
    pub total: RecoveryCounters,
    pub by_key: BTreeMap<String, RecoveryCounters>,
}

/// Operations recovery strategies need from the recording pipeline.
pub trait RecoveryActions: Send + Sync {
    fn reinitialize_encoder(&self) -> Result<()>;

    fn free_disk_space(&self) -> Result<()>;

    fn check_output_writable(&self) -> Result<()>;

    fn flush_encoder(&self) -> Result<()>;

    fn reset_buffers(&self) -> Result<()>;

    fn reconfigure_format(&self) -> Result<()>;

    fn restart_capture(&self) -> Result<()>;

    fn reroute_source(&self, source: AudioSource) -> Result<()>;

    fn is_network_available(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecoveryConfig {
    /// Cooldown per fault key.
    #[serde(with = "duration_secs")]
    pub min_recovery_interval: Duration,

    /// Pause before reinitializing after an initialization failure.
    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,

    #[serde(with = "duration_secs")]
    pub network_poll_interval: Duration,

    #[serde(with = "duration_secs")]
    pub network_timeout: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            min_recovery_interval: Duration::from_secs(5),
            retry_delay: Duration::from_millis(100),
            network_poll_interval: Duration::from_millis(500),
            network_timeout: Duration::from_secs(10),
        }
    }
}

impl RecoveryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.network_poll_interval.is_zero() {
            return Err(RecordingError::Configuration(
                "network poll interval must be positive".into(),
            ));
        }
        if self.network_timeout < self.network_poll_interval {
            return Err(RecordingError::Configuration(format!(
                "network timeout {:?} is shorter than the poll interval {:?}",
                self.network_timeout, self.network_poll_interval
            )));
        }
        Ok(())
    }
}

#[derive(Default)]
struct Ledger {
    last_attempt: HashMap<String, Instant>,
    statistics: RecoveryStatistics,
    history: VecDeque<RecoveryAttempt>,
}

/// Categorized fault recovery with per-fault cooldown.
///
/// Every entry point builds a `"<category>:<kind>"` key. A key seen less than
/// `min_recovery_interval` ago is skipped; otherwise one attempt is recorded
/// and the matching strategy runs against the registered `RecoveryActions`.
/// Strategies run without holding the ledger lock and may block (retry delay,
/// network polling); `interrupt` wakes any pending wait.
pub struct AudioErrorRecoveryManager {
    config: RecoveryConfig,
    actions: RwLock<Option<Weak<dyn RecoveryActions>>>,
    ledger: Mutex<Ledger>,
    delegates: DelegateSet<dyn RecoveryDelegate>,
    // Bumped by `interrupt` to cut waits short.
    generation: Mutex<u64>,
    wake: Condvar,
}

impl AudioErrorRecoveryManager {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            actions: RwLock::new(None),
            ledger: Mutex::new(Ledger::default()),
            delegates: DelegateSet::new(),
            generation: Mutex::new(0),
            wake: Condvar::new(),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn set_actions(&self, actions: Weak<dyn RecoveryActions>) {
        *self.actions.write() = Some(actions);
    }

    pub fn add_delegate(&self, delegate: Arc<dyn RecoveryDelegate>) {
        self.delegates.add(delegate);
    }

    pub fn recover_from_encoding_error(&self, code: RecordingErrorCode) -> RecoveryOutcome {
        let key = format!("encoding:{}", code);
        self.attempt(key, |actions| match code {
            RecordingErrorCode::InitializationFailed => {
                if !self.wait(self.config.retry_delay) {
                    return Err(RecordingError::Unknown("recovery interrupted".into()));
                }
                actions.reinitialize_encoder()
            }
            RecordingErrorCode::InsufficientSpace => actions.free_disk_space(),
            RecordingErrorCode::StorageFailed | RecordingErrorCode::PermissionDenied => {
                actions.check_output_writable()
            }
            RecordingErrorCode::EncodingFailed => actions.flush_encoder().or_else(|e| {
                debug!("Flush failed ({}), reinitializing encoder", e);
                actions.reinitialize_encoder()
            }),
            other => Err(RecordingError::Unknown(format!("no recovery strategy for {}", other))),
        })
    }

    pub fn recover_from_routing_error(&self, fault: RoutingFault, source: AudioSource) -> RecoveryOutcome {
        let key = format!("routing:{:?}", fault);
        self.attempt(key, |actions| match fault {
            RoutingFault::SourceUnavailable | RoutingFault::RouteLost => actions.reroute_source(source),
        })
    }

    pub fn recover_from_stream_error(&self, fault: StreamFault) -> RecoveryOutcome {
        let key = format!("stream:{:?}", fault);
        self.attempt(key, |actions| match fault {
            StreamFault::BufferOverflow | StreamFault::BufferUnderflow => actions.reset_buffers(),
            StreamFault::FormatMismatch => actions.reconfigure_format(),
            StreamFault::DeviceError => actions.restart_capture(),
        })
    }

    pub fn recover_from_network_error(&self, fault: NetworkFault) -> RecoveryOutcome {
        let key = format!("network:{:?}", fault);
        self.attempt(key, |actions| self.await_network(actions))
    }

    /// Wakes strategies blocked in a retry delay or network poll; they fail.
    pub fn interrupt(&self) {
        *self.generation.lock() += 1;
        self.wake.notify_all();
    }

    pub fn statistics(&self) -> RecoveryStatistics {
        self.ledger.lock().statistics.clone()
    }

    /// Most recent attempts, oldest first.
    pub fn recent_attempts(&self) -> Vec<RecoveryAttempt> {
        self.ledger.lock().history.iter().cloned().collect()
    }

    /// Forget cooldowns, counters and history.
    pub fn reset(&self) {
        *self.ledger.lock() = Ledger::default();
    }

    fn attempt<F>(&self, key: String, strategy: F) -> RecoveryOutcome
    where
        F: FnOnce(&dyn RecoveryActions) -> Result<()>,
    {
        {
            let mut ledger = self.ledger.lock();
            let cooling = ledger
                .last_attempt
                .get(&key)
                .is_some_and(|last| last.elapsed() < self.config.min_recovery_interval);
            if cooling {
                ledger.statistics.total.record(RecoveryOutcome::Skipped);
                ledger.statistics.by_key.entry(key.clone()).or_default().record(RecoveryOutcome::Skipped);
                debug!("Skipping recovery for {}: attempted recently", key);
                return RecoveryOutcome::Skipped;
            }

            ledger.last_attempt.insert(key.clone(), Instant::now());
            ledger.statistics.total.attempts += 1;
            ledger.statistics.by_key.entry(key.clone()).or_default().attempts += 1;
        }

        info!("Attempting recovery for {}", key);
        let actions = self.actions.read().as_ref().and_then(Weak::upgrade);
        let result = match actions {
            Some(actions) => strategy(actions.as_ref()),
            None => Err(RecordingError::Unknown("no recovery actions registered".into())),
        };

        let (outcome, message) = match result {
            Ok(()) => {
                info!("Recovered from {}", key);
                (RecoveryOutcome::Recovered, None)
            }
            Err(e) => {
                warn!("Recovery for {} failed: {}", key, e);
                (RecoveryOutcome::Failed, Some(e.to_string()))
            }
        };

        let attempt = RecoveryAttempt {
            key,
            outcome,
            attempted_at: Utc::now(),
            message,
        };
        {
            let mut ledger = self.ledger.lock();
            ledger.statistics.total.record(outcome);
            ledger
                .statistics
                .by_key
                .entry(attempt.key.clone())
                .or_default()
                .record(outcome);
            if ledger.history.len() == HISTORY_LIMIT {
                ledger.history.pop_front();
            }
            ledger.history.push_back(attempt.clone());
        }

        self.delegates.notify(|d| d.on_recovery_attempted(&attempt));
        outcome
    }

    fn await_network(&self, actions: &dyn RecoveryActions) -> Result<()> {
        let deadline = Instant::now() + self.config.network_timeout;
        let mut generation = self.generation.lock();
        let started = *generation;

        loop {
            let available = parking_lot::MutexGuard::unlocked(&mut generation, || actions.is_network_available());
            if available {
                return Ok(());
            }
            if *generation != started {
                return Err(RecordingError::Network("recovery interrupted".into()));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(RecordingError::Timeout(format!(
                    "network unavailable after {:?}",
                    self.config.network_timeout
                )));
            }
            let next = (now + self.config.network_poll_interval).min(deadline);
            self.wake.wait_until(&mut generation, next);
            if *generation != started {
                return Err(RecordingError::Network("recovery interrupted".into()));
            }
        }
    }

    /// Sleeps for `delay` unless interrupted. Returns false when interrupted.
    fn wait(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let mut generation = self.generation.lock();
        let started = *generation;
        while *generation == started {
            if self.wake.wait_until(&mut generation, deadline).timed_out() {
                break;
            }
        }
        *generation == started
    }
}

impl fmt::Debug for AudioErrorRecoveryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioErrorRecoveryManager")
            .field("config", &self.config)
            .field("statistics", &self.statistics())
            .finish()
    }
}
