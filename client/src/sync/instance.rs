//! The per-instance event loop.
//!
//! All instance state lives in one task and is only touched there. The loop
//! multiplexes handle commands, the in-flight remote exchange, the debounce
//! deadline, the keepalive interval, the broadcast inbox and storage change
//! notifications. The remote exchange is a boxed future polled by the loop,
//! so local edits keep being handled while it is suspended.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tally_engine::{
    BroadcastMessage, ConnectivityMonitor, FieldName, FieldSnapshot, InstanceId, LocalStore,
    OfflineBackup, OfflineCause, PendingChangeSet, PersistedDocument, ReconcileResponse,
    Reconciler, Resolution, Schema, SettingsDocument, TieBreak, Timestamp, Transition, Trigger,
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, mpsc, watch},
    time::{self, Instant, Interval, MissedTickBehavior},
};

use super::handle::{Command, SyncStatus};
use crate::{
    broadcast::{Broadcaster, Inbox},
    clock::Clock,
    config::SyncConfig,
    debounce::{self, DebounceGate},
    error::{Result, TransportError},
    remote::RemoteAuthority,
    storage::{keys, DurableStorage, StorageEvent},
};

type Exchange = BoxFuture<'static, ExchangeResult>;

enum ExchangeResult {
    Fetch(std::result::Result<FieldSnapshot, TransportError>),
    Reconcile(std::result::Result<ReconcileResponse, TransportError>),
}

enum StorageNotice {
    Changed(StorageEvent),
    Lagged,
}

/// Durable state read at startup.
pub(crate) struct Restored {
    pub store: LocalStore,
    pub backup: OfflineBackup,
}

/// Load the document and offline backup, falling back to defaults.
pub(crate) fn restore(instance: &str, schema: Schema, storage: &dyn DurableStorage) -> Restored {
    let store = match storage.get(keys::DOCUMENT) {
        Ok(Some(bytes)) => match PersistedDocument::from_bytes(&bytes)
            .and_then(|persisted| persisted.into_store(schema.clone()))
        {
            Ok((store, repairs)) => {
                for repair in repairs {
                    tracing::warn!(
                        instance = %instance,
                        field = %repair.field,
                        error = %repair.error,
                        "Repaired persisted field"
                    );
                }
                store
            }
            Err(e) => {
                tracing::warn!(instance = %instance, error = %e, "Discarding unreadable settings document");
                LocalStore::new(schema)
            }
        },
        Ok(None) => LocalStore::new(schema),
        Err(e) => {
            tracing::warn!(instance = %instance, error = %e, "Failed to read settings document");
            LocalStore::new(schema)
        }
    };

    let backup = match storage.get(keys::PENDING) {
        Ok(Some(bytes)) => OfflineBackup::from_bytes(&bytes).unwrap_or_else(|e| {
            tracing::warn!(instance = %instance, error = %e, "Discarding unreadable offline backup");
            OfflineBackup::new()
        }),
        Ok(None) => OfflineBackup::new(),
        Err(e) => {
            tracing::warn!(instance = %instance, error = %e, "Failed to read offline backup");
            OfflineBackup::new()
        }
    };

    Restored { store, backup }
}

pub(crate) struct Instance<R> {
    id: InstanceId,
    config: SyncConfig,
    remote: Arc<R>,
    storage: Arc<dyn DurableStorage>,
    broadcaster: Arc<dyn Broadcaster>,
    clock: Arc<dyn Clock>,

    store: LocalStore,
    pending: PendingChangeSet,
    backup: OfflineBackup,
    reconciler: Reconciler,
    connectivity: ConnectivityMonitor,
    debounce: DebounceGate,
    keepalive: Option<Interval>,
    exchange: Option<Exchange>,
    last_error: Option<String>,

    commands: mpsc::UnboundedReceiver<Command>,
    inbox: Inbox,
    storage_events: broadcast::Receiver<StorageEvent>,
    document_tx: watch::Sender<SettingsDocument>,
    status_tx: watch::Sender<SyncStatus>,
}

/// Everything an instance is built from.
pub(crate) struct Parts<R> {
    pub id: InstanceId,
    pub config: SyncConfig,
    pub remote: Arc<R>,
    pub storage: Arc<dyn DurableStorage>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub clock: Arc<dyn Clock>,
    pub restored: Restored,
    pub reachable: bool,
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub document_tx: watch::Sender<SettingsDocument>,
    pub status_tx: watch::Sender<SyncStatus>,
}

impl<R: RemoteAuthority> Instance<R> {
    pub(crate) fn new(parts: Parts<R>) -> Self {
        let Parts {
            id,
            config,
            remote,
            storage,
            broadcaster,
            clock,
            restored,
            reachable,
            commands,
            document_tx,
            status_tx,
        } = parts;

        let inbox = broadcaster.subscribe(&id);
        let storage_events = storage.subscribe();
        let keepalive = config.keepalive.map(|period| {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        Self {
            reconciler: Reconciler::new(config.max_conflict_rounds, reachable),
            connectivity: ConnectivityMonitor::new(reachable),
            debounce: DebounceGate::new(config.debounce),
            store: restored.store,
            backup: restored.backup,
            pending: PendingChangeSet::new(),
            keepalive,
            exchange: None,
            last_error: None,
            id,
            config,
            remote,
            storage,
            broadcaster,
            clock,
            commands,
            inbox,
            storage_events,
            document_tx,
            status_tx,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::info!(
            instance = %self.id,
            online = self.connectivity.is_online(),
            transport = %self.broadcaster.kind(),
            backed_up = self.backup.len(),
            "Settings instance started"
        );

        self.startup();
        self.notify();

        loop {
            let deadline = self.debounce.deadline();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                result = next_exchange(&mut self.exchange) => self.finish_exchange(result),
                _ = debounce::sleep_until(deadline) => self.debounce_fired(),
                _ = next_tick(&mut self.keepalive) => self.keepalive_tick(),
                Some(message) = self.inbox.recv() => {
                    self.merge_sibling(message.document(), "broadcast");
                }
                notice = next_storage_event(&mut self.storage_events) => self.storage_notice(notice),
            }

            self.notify();
        }

        tracing::info!(instance = %self.id, "Settings instance stopped");
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::RecordChange {
                field,
                value,
                reply,
            } => {
                let _ = reply.send(self.record_change(field, value));
            }
            Command::SetReachable(reachable) => {
                let transition = self.connectivity.observe(reachable);
                self.apply_transition(transition);
            }
            Command::RequestSync => self.request_sync(),
            Command::Reset { reply } => {
                self.reset();
                let _ = reply.send(());
            }
            Command::Barrier { reply } => {
                let _ = reply.send(());
            }
            // Handled by the loop
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn record_change(&mut self, field: FieldName, value: Value) -> Result<Timestamp> {
        let now = self.clock.now_millis();
        let timestamp = self.store.record(&field, value.clone(), now).map_err(|e| {
            tracing::debug!(instance = %self.id, field = %field, error = %e, "Rejected change");
            e
        })?;

        tracing::debug!(instance = %self.id, field = %field, timestamp, "Recorded change");

        self.pending.record(field, value);
        self.persist_document();
        self.publish();
        self.debounce.arm();
        Ok(timestamp)
    }

    fn request_sync(&mut self) {
        if !self.connectivity.is_online() {
            match self.connectivity.retry_after_failure() {
                Some(transition) => self.apply_transition(Some(transition)),
                None => tracing::debug!(instance = %self.id, "Manual sync skipped while offline"),
            }
            return;
        }
        self.debounce.cancel();
        self.attempt(Trigger::Manual);
    }

    fn reset(&mut self) {
        let now = self.clock.now_millis();
        let fields = self.store.reset(now);
        for field in &fields {
            if let Some(value) = self.store.get_field(field) {
                self.pending.record(field.clone(), value.clone());
            }
        }

        tracing::info!(instance = %self.id, fields = fields.len(), "Settings reset to defaults");

        self.persist_document();
        self.publish();
        self.debounce.arm();
    }

    fn shutdown(&mut self) {
        // An exchange cut short counts as failed: its changes go back to pending
        if self.exchange.take().is_some() && self.reconciler.is_in_flight() {
            self.reconciler.failed(&mut self.pending, &self.store);
        }
        self.debounce.cancel();
        self.sync_backup(None);
        self.broadcaster.unsubscribe(&self.id);
    }

    // ========================================================================
    // Connectivity
    // ========================================================================

    fn apply_transition(&mut self, transition: Option<Transition>) {
        match transition {
            Some(Transition::WentOnline) => {
                tracing::info!(instance = %self.id, "Connection restored");
                self.reconciler.set_online(true);
                // The immediate attempt carries whatever the gate was holding
                self.debounce.cancel();
                self.attempt(Trigger::Reconnect);
            }
            Some(Transition::WentOffline(cause)) => self.went_offline(cause),
            None => {}
        }
    }

    fn went_offline(&mut self, cause: OfflineCause) {
        tracing::info!(
            instance = %self.id,
            cause = ?cause,
            pending = self.pending.len(),
            "Connection lost"
        );
        self.reconciler.set_online(false);
        self.sync_backup(None);
    }

    // ========================================================================
    // Timers
    // ========================================================================

    fn debounce_fired(&mut self) {
        if !self.debounce.fire(Instant::now()) {
            return;
        }

        if self.connectivity.is_online() {
            self.attempt(Trigger::Debounce);
        } else {
            tracing::debug!(
                instance = %self.id,
                pending = self.pending.len(),
                "Offline, backing up pending changes"
            );
            self.sync_backup(None);
        }
    }

    fn keepalive_tick(&mut self) {
        if self.debounce.is_armed() || self.exchange.is_some() {
            tracing::trace!(instance = %self.id, "Keepalive skipped");
            return;
        }

        if self.connectivity.is_online() {
            self.attempt(Trigger::Keepalive);
        } else if let Some(transition) = self.connectivity.retry_after_failure() {
            tracing::debug!(instance = %self.id, "Probing remote authority");
            self.apply_transition(Some(transition));
        }
    }

    // ========================================================================
    // Remote exchange
    // ========================================================================

    fn startup(&mut self) {
        if !self.connectivity.is_online() {
            return;
        }

        if self.config.sync_on_start {
            tracing::debug!(instance = %self.id, "Fetching remote snapshot");
            let remote = self.remote.clone();
            let timeout = self.config.timeout;
            self.exchange = Some(
                async move {
                    let result = match time::timeout(timeout, remote.snapshot()).await {
                        Ok(result) => result,
                        Err(_) => Err(TransportError::Timeout(timeout)),
                    };
                    ExchangeResult::Fetch(result)
                }
                .boxed(),
            );
        } else if !self.backup.is_empty() {
            self.attempt(Trigger::Startup);
        }
    }

    fn attempt(&mut self, trigger: Trigger) {
        if self.exchange.is_some() {
            tracing::debug!(instance = %self.id, trigger = %trigger, "Exchange in flight, trigger ignored");
            return;
        }
        if !self.connectivity.is_online() {
            return;
        }

        let Some(submission) =
            self.reconciler
                .begin(trigger, &mut self.pending, &mut self.backup, &mut self.store)
        else {
            return;
        };
        // Backed-up changes from an earlier run may have moved the document
        if submission.restored.changed() {
            self.persist_document();
            self.publish();
        }
        if !submission.superseded.is_empty() {
            tracing::debug!(
                instance = %self.id,
                fields = submission.superseded.len(),
                "Released superseded backup entries"
            );
            self.sync_backup(Some(&submission.superseded));
        }
        let request = submission.request;

        tracing::info!(
            instance = %self.id,
            trigger = %trigger,
            fields = request.changes.len(),
            cursor = request.cursor,
            "Reconciling with remote authority"
        );

        let remote = self.remote.clone();
        let timeout = self.config.timeout;
        self.exchange = Some(
            async move {
                let result = match time::timeout(timeout, remote.reconcile(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout(timeout)),
                };
                ExchangeResult::Reconcile(result)
            }
            .boxed(),
        );
    }

    fn finish_exchange(&mut self, result: ExchangeResult) {
        match result {
            ExchangeResult::Fetch(Ok(snapshot)) => self.fetched(snapshot),
            ExchangeResult::Reconcile(Ok(ReconcileResponse::Accepted)) => self.accepted(),
            ExchangeResult::Reconcile(Ok(ReconcileResponse::Conflict { snapshot })) => {
                self.conflicted(snapshot)
            }
            ExchangeResult::Fetch(Err(e)) | ExchangeResult::Reconcile(Err(e)) => self.failed(e),
        }
    }

    fn fetched(&mut self, snapshot: FieldSnapshot) {
        self.reconciler.observe_remote(&snapshot);
        let report = self.store.merge(&snapshot, TieBreak::RemoteWins);
        self.pending.discard(&report.adopted);
        self.last_error = None;

        tracing::info!(
            instance = %self.id,
            adopted = report.adopted.len(),
            rejected = report.rejected.len(),
            "Merged remote snapshot"
        );

        if report.changed() {
            self.persist_document();
            self.publish();
        }

        if !self.pending.is_empty() || !self.backup.is_empty() {
            self.attempt(Trigger::Startup);
        }
    }

    fn accepted(&mut self) {
        let now = self.clock.now_millis();
        let acknowledged = self.reconciler.accepted(now);
        self.last_error = None;

        tracing::info!(
            instance = %self.id,
            fields = acknowledged.len(),
            "Changes accepted by remote authority"
        );

        self.sync_backup(Some(&acknowledged));
        if !acknowledged.is_empty() {
            self.publish();
        }
        self.follow_up();
    }

    fn conflicted(&mut self, snapshot: FieldSnapshot) {
        let now = self.clock.now_millis();
        let outcome = self
            .reconciler
            .conflict(now, &snapshot, &mut self.pending, &mut self.store);
        self.last_error = None;

        for conflict in &outcome.report.conflicts {
            let kept = match conflict.resolution {
                Resolution::LocalWins => "local",
                Resolution::RemoteWins => "remote",
            };
            tracing::info!(
                instance = %self.id,
                field = %conflict.field,
                local = %conflict.local.value,
                remote = %conflict.remote.value,
                kept,
                "Conflict resolved"
            );
        }
        for field in &outcome.report.rejected {
            tracing::warn!(instance = %self.id, field = %field, "Rejected invalid remote value");
        }

        self.sync_backup(Some(&outcome.acknowledged));
        if outcome.report.changed() {
            self.persist_document();
        }
        self.publish();

        if outcome.retry_now() {
            self.attempt(Trigger::Resubmit);
        } else if outcome.exhausted {
            tracing::warn!(
                instance = %self.id,
                fields = outcome.resubmit.len(),
                "Conflict rounds exhausted, changes stay pending"
            );
            self.sync_backup(None);
        } else {
            self.follow_up();
        }
    }

    /// Edits made while an exchange was in flight may have had their debounce
    /// trigger ignored; give them a fresh quiet period.
    fn follow_up(&mut self) {
        if !self.pending.is_empty() && !self.debounce.is_armed() {
            self.debounce.arm();
        }
    }

    fn failed(&mut self, error: TransportError) {
        tracing::warn!(instance = %self.id, error = %error, "Remote exchange failed");
        self.last_error = Some(error.to_string());

        let restored = self.reconciler.failed(&mut self.pending, &self.store);
        self.backup.absorb(&restored);

        match self.connectivity.transport_failed() {
            Some(transition) => self.apply_transition(Some(transition)),
            // Already offline: still make sure the changes are durable
            None => self.sync_backup(None),
        }
    }

    // ========================================================================
    // Siblings
    // ========================================================================

    fn merge_sibling(&mut self, document: &SettingsDocument, source: &'static str) {
        let report = self
            .store
            .merge(&document.to_snapshot(), TieBreak::GreaterValue);
        if !report.changed() {
            return;
        }

        // A sibling's newer value supersedes our own unsent one
        self.pending.discard(&report.adopted);

        tracing::debug!(
            instance = %self.id,
            source,
            fields = ?report.adopted,
            "Merged sibling state"
        );
    }

    fn storage_notice(&mut self, notice: StorageNotice) {
        match notice {
            StorageNotice::Changed(event) => {
                if event.origin == self.id || event.key != keys::DOCUMENT {
                    return;
                }
                self.reload_document();
            }
            StorageNotice::Lagged => self.reload_document(),
        }
    }

    fn reload_document(&mut self) {
        let bytes = match self.storage.get(keys::DOCUMENT) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(instance = %self.id, error = %e, "Failed to read settings document");
                return;
            }
        };

        match PersistedDocument::from_bytes(&bytes).and_then(|p| p.check(self.store.schema()).map(|_| p)) {
            Ok(persisted) => self.merge_sibling(&persisted.document, "storage"),
            Err(e) => {
                tracing::warn!(instance = %self.id, error = %e, "Ignoring unreadable settings document")
            }
        }
    }

    // ========================================================================
    // Durability and observers
    // ========================================================================

    fn persist_document(&self) {
        let result = PersistedDocument::from_store(&self.store)
            .to_bytes()
            .map_err(Into::into)
            .and_then(|bytes| self.storage.set(&self.id, keys::DOCUMENT, bytes));
        if let Err(e) = result {
            tracing::warn!(instance = %self.id, error = %e, "Failed to persist settings document");
        }
    }

    /// Fold pending changes into the offline backup and write it out.
    ///
    /// The backup record is shared by every instance using the storage, so
    /// the stored copy is merged in first. `acknowledged` entries are
    /// released.
    fn sync_backup(&mut self, acknowledged: Option<&FieldSnapshot>) {
        match self.storage.get(keys::PENDING) {
            Ok(Some(bytes)) => match OfflineBackup::from_bytes(&bytes) {
                Ok(stored) => {
                    self.backup.absorb(stored.entries());
                }
                Err(e) => {
                    tracing::warn!(instance = %self.id, error = %e, "Overwriting unreadable offline backup")
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(instance = %self.id, error = %e, "Failed to read offline backup")
            }
        }

        let local: FieldSnapshot = self
            .pending
            .iter()
            .filter_map(|(field, _)| {
                self.store
                    .document()
                    .stamped(field)
                    .map(|stamped| (field.clone(), stamped))
            })
            .collect();
        self.backup.absorb(&local);

        if let Some(acknowledged) = acknowledged {
            self.backup.release(acknowledged);
        }

        let result = self
            .backup
            .to_bytes()
            .map_err(Into::into)
            .and_then(|bytes| self.storage.set(&self.id, keys::PENDING, bytes));
        if let Err(e) = result {
            tracing::warn!(instance = %self.id, error = %e, "Failed to persist offline backup");
        }
    }

    fn publish(&self) {
        let message = BroadcastMessage::snapshot_update(self.store.snapshot());
        let recipients = self.broadcaster.publish(&self.id, &message);
        tracing::trace!(instance = %self.id, recipients, "Published document");
    }

    fn notify(&mut self) {
        let document = self.store.document();
        self.document_tx.send_if_modified(|current| {
            if current != document {
                *current = document.clone();
                true
            } else {
                false
            }
        });

        let status = SyncStatus {
            online: self.connectivity.is_online(),
            syncing: self.exchange.is_some(),
            pending: self.pending.len(),
            last_reconciled: self.reconciler.cursor().last_reconciled,
            last_error: self.last_error.clone(),
            transport: self.broadcaster.kind(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }
}

/// Resolve when the in-flight exchange completes; pend forever if none.
async fn next_exchange(slot: &mut Option<Exchange>) -> ExchangeResult {
    match slot {
        Some(exchange) => {
            let result = exchange.await;
            *slot = None;
            result
        }
        None => std::future::pending().await,
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn next_storage_event(events: &mut broadcast::Receiver<StorageEvent>) -> StorageNotice {
    match events.recv().await {
        Ok(event) => StorageNotice::Changed(event),
        Err(RecvError::Lagged(_)) => StorageNotice::Lagged,
        // The instance holds the storage, so the sender outlives it
        Err(RecvError::Closed) => std::future::pending().await,
    }
}
