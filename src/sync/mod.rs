//! Local change propagation.
//!
//! Classifies filesystem notifications, swallows the echoes of our own
//! writes, and hands genuine changes to the outbound dispatcher once the
//! file is safe to read.

pub mod change;
pub mod dispatch;
pub mod error;
pub mod exclude;
pub mod processor;
pub mod readiness;
pub mod suppression;
pub mod watcher;

pub use change::{ChangeDescriptor, ChangeKind, ChangeRecord, SuppressionKey};
pub use dispatch::{ChangeDispatcher, ChannelDispatcher, ErrorReporter, TracingReporter};
pub use error::{Result, SyncError};
pub use exclude::{ExcludePatterns, DEFAULT_EXCLUDES};
pub use processor::{
    ChangeEventProcessor, Notification, NotificationKind, Outcome, ProcessorBuilder,
    ProcessorStats, StatsSnapshot,
};
pub use readiness::{FsProbe, ProbeFailure, ReadProbe, ReadinessGate, RetryPolicy};
pub use suppression::{EchoSuppressionRegistry, DEFAULT_ECHO_TTL};
pub use watcher::{EventTranslator, FileWatcher, RENAME_PAIR_WINDOW};
