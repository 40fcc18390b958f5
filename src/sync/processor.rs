//! Turns raw watcher notifications into change records.
//!
//! For every notification the processor drops directory events, derives the
//! root-relative change, checks the echo registry, and forwards genuine
//! changes. Deletes and moves are dispatched on the calling thread. Adds and
//! modifies go through a [`ReadinessGate`] on a spawned task, so the
//! watcher's delivery thread never waits on file I/O.
//!
//! Because of that split, a delete that follows a slow add for the same path
//! can reach the dispatcher first.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::sync::change::{ChangeDescriptor, ChangeRecord};
use crate::sync::dispatch::{ChangeDispatcher, ErrorReporter, TracingReporter};
use crate::sync::error::{Result, SyncError};
use crate::sync::exclude::ExcludePatterns;
use crate::sync::readiness::{FsProbe, ReadProbe, ReadinessGate, RetryPolicy};
use crate::sync::suppression::EchoSuppressionRegistry;

/// What the watcher observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

/// A raw filesystem notification with absolute paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub is_directory: bool,
    pub path: PathBuf,
    /// Destination of a move.
    pub dest_path: Option<PathBuf>,
}

impl Notification {
    pub fn new(kind: NotificationKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            is_directory: false,
            path: path.into(),
            dest_path: None,
        }
    }

    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self::new(NotificationKind::Created, path)
    }

    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self::new(NotificationKind::Modified, path)
    }

    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self::new(NotificationKind::Deleted, path)
    }

    pub fn moved(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            dest_path: Some(to.into()),
            ..Self::new(NotificationKind::Moved, from)
        }
    }

    /// Mark the notification as concerning a directory.
    pub fn directory(mut self) -> Self {
        self.is_directory = true;
        self
    }
}

/// How a notification was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    IgnoredDirectory,
    Excluded,
    /// Matched a registered echo and was swallowed.
    Suppressed,
    /// Sent to the dispatcher on the calling thread.
    Dispatched,
    /// Handed to a readiness check; dispatch happens later, if at all.
    Deferred,
    /// Could not be classified (outside the root, bad path, missing move
    /// destination).
    Rejected,
}

/// Running counters, updated from every thread the processor touches.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    directories_ignored: AtomicU64,
    excluded: AtomicU64,
    suppressed: AtomicU64,
    dispatched: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`ProcessorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub directories_ignored: u64,
    pub excluded: u64,
    pub suppressed: u64,
    pub dispatched: u64,
    pub failed: u64,
}

impl ProcessorStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            directories_ignored: self.directories_ignored.load(Ordering::Relaxed),
            excluded: self.excluded.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Builder for [`ChangeEventProcessor`].
pub struct ProcessorBuilder {
    root: PathBuf,
    registry: EchoSuppressionRegistry,
    dispatcher: Arc<dyn ChangeDispatcher>,
    reporter: Arc<dyn ErrorReporter>,
    probe: Arc<dyn ReadProbe>,
    policy: RetryPolicy,
    excludes: ExcludePatterns,
    runtime: Option<Handle>,
}

impl ProcessorBuilder {
    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn probe(mut self, probe: Arc<dyn ReadProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn excludes(mut self, excludes: ExcludePatterns) -> Self {
        self.excludes = excludes;
        self
    }

    /// Runtime that readiness checks are spawned on. Defaults to the runtime
    /// `build` is called from.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<ChangeEventProcessor> {
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current()?,
        };
        let cancel = CancellationToken::new();
        let gate = ReadinessGate::new(
            self.probe,
            self.policy,
            Arc::clone(&self.dispatcher),
            self.reporter,
            cancel.clone(),
        );

        Ok(ChangeEventProcessor {
            root: self.root,
            registry: self.registry,
            excludes: self.excludes,
            dispatcher: self.dispatcher,
            gate,
            runtime,
            tasks: TaskTracker::new(),
            cancel,
            stats: Arc::new(ProcessorStats::default()),
        })
    }
}

/// Classifies notifications, swallows expected echoes and forwards the rest.
pub struct ChangeEventProcessor {
    root: PathBuf,
    registry: EchoSuppressionRegistry,
    excludes: ExcludePatterns,
    dispatcher: Arc<dyn ChangeDispatcher>,
    gate: ReadinessGate,
    runtime: Handle,
    tasks: TaskTracker,
    cancel: CancellationToken,
    stats: Arc<ProcessorStats>,
}

impl fmt::Debug for ChangeEventProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeEventProcessor")
            .field("root", &self.root)
            .field("excludes", &self.excludes.patterns())
            .field("gate", &self.gate)
            .field("pending_checks", &self.tasks.len())
            .finish()
    }
}

impl ChangeEventProcessor {
    /// Start building a processor for the tree under `root`.
    ///
    /// `registry` must be the same instance handed to whatever writes
    /// hub-originated changes to disk.
    pub fn builder(
        root: impl Into<PathBuf>,
        registry: EchoSuppressionRegistry,
        dispatcher: Arc<dyn ChangeDispatcher>,
    ) -> ProcessorBuilder {
        ProcessorBuilder {
            root: root.into(),
            registry,
            dispatcher,
            reporter: Arc::new(TracingReporter),
            probe: Arc::new(FsProbe),
            policy: RetryPolicy::default(),
            excludes: ExcludePatterns::default(),
            runtime: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry(&self) -> &EchoSuppressionRegistry {
        &self.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Readiness checks still running.
    /// Runtime that readiness checks run on.
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn pending_checks(&self) -> usize {
        self.tasks.len()
    }

    /// Entry point for the watcher. Never blocks on file I/O and never fails.
    pub fn handle(&self, notification: Notification) {
        let _ = self.process(notification);
    }

    /// Like [`handle`](Self::handle), reporting what happened.
    pub fn process(&self, notification: Notification) -> Outcome {
        if notification.is_directory {
            debug!(
                kind = ?notification.kind,
                path = %notification.path.display(),
                "ignoring directory event"
            );
            ProcessorStats::bump(&self.stats.directories_ignored);
            return Outcome::IgnoredDirectory;
        }

        let change = match self.describe(&notification) {
            Ok(Some(change)) => change,
            Ok(None) => {
                debug!(path = %notification.path.display(), "excluded path, ignoring");
                ProcessorStats::bump(&self.stats.excluded);
                return Outcome::Excluded;
            }
            Err(err) => {
                warn!("dropping notification: {err}");
                return Outcome::Rejected;
            }
        };

        if self.registry.try_consume(&change.key()) {
            debug!(change = %change, "suppressed echo of our own write");
            ProcessorStats::bump(&self.stats.suppressed);
            return Outcome::Suppressed;
        }

        info!(change = %change, "local change detected");

        if change.kind().carries_content() {
            self.defer(absolute_target(&notification), change);
            Outcome::Deferred
        } else {
            self.dispatcher.submit(ChangeRecord::new(change));
            ProcessorStats::bump(&self.stats.dispatched);
            Outcome::Dispatched
        }
    }

    /// Cancel outstanding readiness checks and wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        debug!(root = %self.root.display(), "change processor stopped");
    }

    /// Wait until every readiness check spawned so far has completed. After
    /// [`shutdown`](Self::shutdown) the tracker stays closed.
    pub async fn settle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        if !self.cancel.is_cancelled() {
            self.tasks.reopen();
        }
    }

    /// Build the descriptor for a file notification. `Ok(None)` means the
    /// change touches excluded paths only.
    fn describe(&self, notification: &Notification) -> Result<Option<ChangeDescriptor>> {
        let change = match notification.kind {
            NotificationKind::Created => ChangeDescriptor::Add {
                path: self.relative(&notification.path)?,
            },
            NotificationKind::Modified => ChangeDescriptor::Modify {
                path: self.relative(&notification.path)?,
            },
            NotificationKind::Deleted => ChangeDescriptor::Delete {
                path: self.relative(&notification.path)?,
            },
            NotificationKind::Moved => return self.describe_move(notification),
        };

        if self.excludes.is_excluded(change.path()) {
            return Ok(None);
        }
        Ok(Some(change))
    }

    /// A rename that crosses the root or the exclusion boundary looks like a
    /// plain add or delete from the hub's side.
    fn describe_move(&self, notification: &Notification) -> Result<Option<ChangeDescriptor>> {
        let dest = notification
            .dest_path
            .as_deref()
            .ok_or_else(|| SyncError::MissingDestination {
                path: notification.path.clone(),
            })?;

        let from = self.side(&notification.path)?;
        let to = self.side(dest)?;

        let change = match (from, to) {
            (Side::Tracked(old_path), Side::Tracked(new_path)) => {
                ChangeDescriptor::Move { old_path, new_path }
            }
            (_, Side::Tracked(path)) => ChangeDescriptor::Add { path },
            (Side::Tracked(path), _) => ChangeDescriptor::Delete { path },
            (Side::Outside, Side::Outside) => {
                return Err(SyncError::OutsideRoot {
                    path: notification.path.clone(),
                    root: self.root.clone(),
                })
            }
            _ => return Ok(None),
        };
        Ok(Some(change))
    }

    fn side(&self, path: &Path) -> Result<Side> {
        match self.relative(path) {
            Ok(relative) if self.excludes.is_excluded(&relative) => Ok(Side::Excluded),
            Ok(relative) => Ok(Side::Tracked(relative)),
            Err(SyncError::OutsideRoot { .. }) => Ok(Side::Outside),
            Err(err) => Err(err),
        }
    }

    /// Strip the watch root and join the remaining components with `/`.
    fn relative(&self, path: &Path) -> Result<String> {
        let outside = || SyncError::OutsideRoot {
            path: path.to_path_buf(),
            root: self.root.clone(),
        };
        let stripped = path.strip_prefix(&self.root).map_err(|_| outside())?;

        let mut parts = Vec::new();
        for component in stripped.components() {
            match component {
                Component::Normal(part) => {
                    let part = part.to_str().ok_or_else(|| SyncError::NonUtf8Path {
                        path: path.to_path_buf(),
                    })?;
                    parts.push(part);
                }
                Component::CurDir => {}
                _ => return Err(outside()),
            }
        }

        if parts.is_empty() {
            return Err(outside());
        }
        Ok(parts.join("/"))
    }

    fn defer(&self, target: PathBuf, change: ChangeDescriptor) {
        let gate = self.gate.clone();
        let stats = Arc::clone(&self.stats);
        let detected_at = Utc::now();

        self.tasks.spawn_on(
            async move {
                let build = move || ChangeRecord {
                    change,
                    detected_at,
                };
                match gate.await_readable_then_emit(target, build).await {
                    Ok(()) => ProcessorStats::bump(&stats.dispatched),
                    Err(SyncError::Cancelled { .. }) => {}
                    Err(_) => ProcessorStats::bump(&stats.failed),
                }
            },
            &self.runtime,
        );
    }
}

/// Where one end of a move landed.
enum Side {
    Tracked(String),
    Excluded,
    Outside,
}

/// File whose readiness decides when an add or modify can be sent.
fn absolute_target(notification: &Notification) -> PathBuf {
    match (&notification.kind, &notification.dest_path) {
        (NotificationKind::Moved, Some(dest)) => dest.clone(),
        _ => notification.path.clone(),
    }
}
