//! Outbound boundaries: where confirmed changes and failures are handed off.

use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::sync::change::ChangeRecord;
use crate::sync::error::SyncError;

/// Receives confirmed local changes for transmission to the hub.
///
/// Fire-and-forget: the implementation owns delivery, retries and reporting
/// transport failures.
pub trait ChangeDispatcher: Send + Sync {
    fn submit(&self, record: ChangeRecord);
}

/// Forwards records into a tokio channel drained by the transport layer.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    sender: mpsc::UnboundedSender<ChangeRecord>,
}

impl ChannelDispatcher {
    pub fn new(sender: mpsc::UnboundedSender<ChangeRecord>) -> Self {
        Self { sender }
    }

    /// Create a dispatcher together with the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ChangeRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl ChangeDispatcher for ChannelDispatcher {
    fn submit(&self, record: ChangeRecord) {
        if let Err(err) = self.sender.send(record) {
            warn!(change = %err.0.change, "dispatch channel closed, dropping change");
        }
    }
}

/// Surfaces failures that happen away from the caller, such as a readiness
/// check running on a background task.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &SyncError);
}

/// Reports failures through `tracing` at error level.
#[derive(Debug)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, err: &SyncError) {
        match err.path() {
            Some(path) => error!(path = %path.display(), "{err}"),
            None => error!("{err}"),
        }
    }
}
