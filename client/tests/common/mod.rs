//! Shared helpers for client integration tests.

#![allow(dead_code)]

use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::Value;
use tally_client::{
    ChannelHub, Clock, ManualClock, MemoryStorage, RemoteAuthority, SettingsHandle, SyncBuilder,
    SyncConfig, SyncStatus, TransportError,
};
use tally_engine::{FieldSnapshot, ReconcileRequest, ReconcileResponse, StampedValue};

/// Give up on a wait after this much (virtual) time.
const WAIT_LIMIT: Duration = Duration::from_secs(120);

#[derive(Default)]
struct AuthorityState {
    document: FieldSnapshot,
    requests: Vec<ReconcileRequest>,
    snapshot_calls: usize,
    unreachable: bool,
    delay: Option<Duration>,
}

/// In-memory remote authority.
///
/// Accepts changes only from clients whose cursor has caught up with its
/// newest write, stamping accepted values with the shared test clock.
#[derive(Clone)]
pub struct FakeAuthority {
    state: Arc<Mutex<AuthorityState>>,
    clock: Arc<ManualClock>,
}

impl FakeAuthority {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            state: Arc::default(),
            clock,
        }
    }

    pub fn seed(&self, field: &str, value: Value, timestamp: u64) {
        self.state
            .lock()
            .unwrap()
            .document
            .insert(field.to_string(), StampedValue::new(value, timestamp));
    }

    pub fn value(&self, field: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .document
            .get(field)
            .map(|s| s.value.clone())
    }

    pub fn requests(&self) -> Vec<ReconcileRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Requests that carried at least one change.
    pub fn content_requests(&self) -> Vec<ReconcileRequest> {
        self.requests()
            .into_iter()
            .filter(|r| !r.changes.is_empty())
            .collect()
    }

    pub fn snapshot_calls(&self) -> usize {
        self.state.lock().unwrap().snapshot_calls
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    /// Delay every response by `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().unwrap().delay = delay;
    }

    async fn respond_after_delay(&self) -> Result<(), TransportError> {
        let (delay, unreachable) = {
            let state = self.state.lock().unwrap();
            (state.delay, state.unreachable)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if unreachable {
            return Err(TransportError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

impl RemoteAuthority for FakeAuthority {
    fn reconcile(
        &self,
        request: ReconcileRequest,
    ) -> impl Future<Output = Result<ReconcileResponse, TransportError>> + Send {
        async move {
            self.state.lock().unwrap().requests.push(request.clone());
            self.respond_after_delay().await?;

            let now = self.clock.now_millis();
            let mut state = self.state.lock().unwrap();
            let high_water = state.document.values().map(|s| s.timestamp).max().unwrap_or(0);
            if request.cursor < high_water {
                return Ok(ReconcileResponse::Conflict {
                    snapshot: state.document.clone(),
                });
            }
            for (field, value) in request.changes {
                state.document.insert(field, StampedValue::new(value, now));
            }
            Ok(ReconcileResponse::Accepted)
        }
    }

    fn snapshot(&self) -> impl Future<Output = Result<FieldSnapshot, TransportError>> + Send {
        async move {
            self.state.lock().unwrap().snapshot_calls += 1;
            self.respond_after_delay().await?;
            Ok(self.state.lock().unwrap().document.clone())
        }
    }
}

/// A shared clock and authority, plus one device's storage and hub.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub authority: FakeAuthority,
    pub storage: Arc<MemoryStorage>,
    pub hub: Arc<ChannelHub>,
}

impl Harness {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(1_000));
        Self {
            authority: FakeAuthority::new(clock.clone()),
            clock,
            storage: MemoryStorage::new_shared(),
            hub: ChannelHub::new_shared(),
        }
    }

    /// Quiet defaults: no keepalive, no startup fetch.
    pub fn config() -> SyncConfig {
        SyncConfig {
            keepalive: None,
            sync_on_start: false,
            ..SyncConfig::default()
        }
    }

    /// An instance on this harness's device (shared storage and hub).
    pub fn tab(&self, id: &str) -> SyncBuilder<FakeAuthority> {
        SyncBuilder::new(self.authority.clone(), self.storage.clone())
            .channel_hub(self.hub.clone())
            .clock(self.clock.clone())
            .instance_id(id)
            .config(Self::config())
    }

    /// An instance on a separate device: own storage, no hub.
    pub fn device(&self, id: &str) -> SyncBuilder<FakeAuthority> {
        SyncBuilder::new(self.authority.clone(), MemoryStorage::new_shared())
            .clock(self.clock.clone())
            .instance_id(id)
            .config(Self::config())
    }
}

/// Wait until the instance's status satisfies `predicate`.
pub async fn wait_for_status(
    handle: &SettingsHandle,
    predicate: impl Fn(&SyncStatus) -> bool,
) -> SyncStatus {
    let mut updates = handle.status_updates();
    let status = tokio::time::timeout(WAIT_LIMIT, updates.wait_for(|s| predicate(s)))
        .await
        .expect("timed out waiting for status")
        .expect("instance stopped")
        .clone();
    status
}

/// Wait until `field` holds `value` on the instance.
pub async fn wait_for_value(handle: &SettingsHandle, field: &str, value: Value) {
    let mut document = handle.subscribe();
    tokio::time::timeout(WAIT_LIMIT, document.wait_for(|d| d.get(field) == Some(&value)))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {} = {}", field, value))
        .expect("instance stopped");
}
