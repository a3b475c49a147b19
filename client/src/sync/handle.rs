//! Public handle to a running settings instance.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tally_engine::{FieldName, InstanceId, SettingsDocument, Timestamp};
use tokio::sync::{mpsc, oneshot, watch};

use crate::{
    broadcast::TransportKind,
    error::{Result, SyncError},
};

/// Observable sync state of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub online: bool,
    /// A remote exchange is in flight
    pub syncing: bool,
    /// Number of fields waiting for reconciliation
    pub pending: usize,
    pub last_reconciled: Timestamp,
    pub last_error: Option<String>,
    pub transport: TransportKind,
}

/// Requests from handles to the instance event loop.
#[derive(Debug)]
pub(crate) enum Command {
    RecordChange {
        field: FieldName,
        value: Value,
        reply: oneshot::Sender<Result<Timestamp>>,
    },
    SetReachable(bool),
    RequestSync,
    Reset {
        reply: oneshot::Sender<()>,
    },
    Barrier {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to one settings instance.
///
/// Cheap to clone. Reads are served from the latest published document and
/// never wait on the event loop; writes are queued to it.
#[derive(Debug, Clone)]
pub struct SettingsHandle {
    instance: InstanceId,
    commands: mpsc::UnboundedSender<Command>,
    document: watch::Receiver<SettingsDocument>,
    status: watch::Receiver<SyncStatus>,
}

impl SettingsHandle {
    pub(crate) fn new(
        instance: InstanceId,
        commands: mpsc::UnboundedSender<Command>,
        document: watch::Receiver<SettingsDocument>,
        status: watch::Receiver<SyncStatus>,
    ) -> Self {
        Self {
            instance,
            commands,
            document,
            status,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance
    }

    /// Record a local change.
    ///
    /// Invalid changes are rejected here and never reach the pending set.
    /// Returns the timestamp the field was stamped with.
    pub async fn record_change(&self, field: impl Into<FieldName>, value: Value) -> Result<Timestamp> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RecordChange {
            field: field.into(),
            value,
            reply,
        })?;
        rx.await.map_err(|_| SyncError::Closed)?
    }

    /// Current value of a field.
    pub fn get_field(&self, field: &str) -> Option<Value> {
        self.document.borrow().get(field).cloned()
    }

    /// Current document.
    pub fn snapshot(&self) -> SettingsDocument {
        self.document.borrow().clone()
    }

    /// Observe document changes.
    pub fn subscribe(&self) -> watch::Receiver<SettingsDocument> {
        self.document.clone()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Observe sync status changes.
    pub fn status_updates(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Report the environment's reachability signal.
    pub fn set_reachable(&self, reachable: bool) -> Result<()> {
        self.send(Command::SetReachable(reachable))
    }

    /// Reconcile now instead of waiting for the debounce gate.
    pub fn request_sync(&self) -> Result<()> {
        self.send(Command::RequestSync)
    }

    /// Put every field back to its default.
    pub async fn reset_to_defaults(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reset { reply })?;
        rx.await.map_err(|_| SyncError::Closed)
    }

    /// Wait until every command sent before this one has been handled.
    pub async fn barrier(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Barrier { reply })?;
        rx.await.map_err(|_| SyncError::Closed)
    }

    /// Stop the instance.
    ///
    /// Pending changes, including any in flight, are written to the offline
    /// backup first.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply })?;
        rx.await.map_err(|_| SyncError::Closed)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| SyncError::Closed)
    }
}
