//! Confirms a file is readable before its contents are sent.
//!
//! Watchers report creation and modification as soon as the OS notices
//! them, often while the writer still holds the file open. Sending at that
//! point would ship partial content, so the gate probes the file and waits
//! out lock contention before handing the record to the dispatcher.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::sync::change::ChangeRecord;
use crate::sync::dispatch::{ChangeDispatcher, ErrorReporter};
use crate::sync::error::{Result, SyncError};

/// Checks whether a file can be opened for reading.
pub trait ReadProbe: Send + Sync {
    fn probe(&self, path: &Path) -> io::Result<()>;
}

/// Probes by opening the file read-only and closing it again.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsProbe;

impl ReadProbe for FsProbe {
    fn probe(&self, path: &Path) -> io::Result<()> {
        File::open(path).map(drop)
    }
}

/// How a failed probe is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFailure {
    /// Held by another writer; retry later.
    Locked,
    /// Anything else, including the file having vanished.
    Unexpected,
}

impl ProbeFailure {
    pub fn classify(err: &io::Error) -> Self {
        if err.kind() == io::ErrorKind::PermissionDenied || is_sharing_violation(err) {
            ProbeFailure::Locked
        } else {
            ProbeFailure::Unexpected
        }
    }
}

#[cfg(windows)]
fn is_sharing_violation(err: &io::Error) -> bool {
    // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
    matches!(err.raw_os_error(), Some(32) | Some(33))
}

#[cfg(not(windows))]
fn is_sharing_violation(_err: &io::Error) -> bool {
    false
}

/// Delay schedule for lock retries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Wait before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single wait.
    pub max_delay: Duration,
    /// Growth factor applied per retry. `1.0` keeps the delay fixed.
    pub multiplier: f64,
    /// Total probes before giving up. `None` retries until cancelled.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_attempts: Some(40),
        }
    }
}

impl RetryPolicy {
    /// Same delay every time.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Wait after the `retry`-th failed probe (zero based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay)
        }
    }

    /// Whether another probe may follow `attempts` failed ones.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

/// Waits until a file is readable, then emits its change record.
///
/// Cheap to clone; each readiness check runs as its own task holding a
/// clone, and all of them observe the same cancellation token.
#[derive(Clone)]
pub struct ReadinessGate {
    probe: Arc<dyn ReadProbe>,
    policy: RetryPolicy,
    dispatcher: Arc<dyn ChangeDispatcher>,
    reporter: Arc<dyn ErrorReporter>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ReadinessGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessGate")
            .field("policy", &self.policy)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ReadinessGate {
    pub fn new(
        probe: Arc<dyn ReadProbe>,
        policy: RetryPolicy,
        dispatcher: Arc<dyn ChangeDispatcher>,
        reporter: Arc<dyn ErrorReporter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            probe,
            policy,
            dispatcher,
            reporter,
            cancel,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Probe `path` until it opens, retrying only while it is locked.
    ///
    /// Returns the number of probes it took.
    pub async fn await_readable(&self, path: &Path) -> Result<u32> {
        let mut attempts = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled {
                    path: path.to_path_buf(),
                });
            }

            attempts += 1;
            let err = match self.probe.probe(path) {
                Ok(()) => return Ok(attempts),
                Err(err) => err,
            };

            let failure = match ProbeFailure::classify(&err) {
                ProbeFailure::Locked => SyncError::TransientLock {
                    path: path.to_path_buf(),
                    source: err,
                },
                ProbeFailure::Unexpected => SyncError::UnexpectedIo {
                    path: path.to_path_buf(),
                    source: err,
                },
            };
            if !failure.is_transient() {
                return Err(failure);
            }
            if !self.policy.allows_retry(attempts) {
                return Err(SyncError::RetriesExhausted {
                    path: path.to_path_buf(),
                    attempts,
                });
            }

            let delay = self.policy.delay_for(attempts - 1);
            debug!(
                error = %failure,
                attempts,
                delay_ms = delay.as_millis() as u64,
                "waiting before retry"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(SyncError::Cancelled { path: path.to_path_buf() });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Wait for `path` to become readable, then dispatch the record built by
    /// `build`.
    ///
    /// Failures are reported through the error reporter before being
    /// returned; cancellation is only logged.
    pub async fn await_readable_then_emit<F>(&self, path: PathBuf, build: F) -> Result<()>
    where
        F: FnOnce() -> ChangeRecord + Send,
    {
        match self.await_readable(&path).await {
            Ok(attempts) => {
                let record = build();
                debug!(change = %record.change, attempts, "file ready, dispatching");
                self.dispatcher.submit(record);
                Ok(())
            }
            Err(err @ SyncError::Cancelled { .. }) => {
                debug!(path = %path.display(), "readiness check cancelled");
                Err(err)
            }
            Err(err) => {
                self.reporter.report(&err);
                Err(err)
            }
        }
    }
}
