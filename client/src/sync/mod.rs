//! Settings instances.
//!
//! A [`SyncBuilder`] wires one instance together from its collaborators and
//! spawns its event loop; the returned [`SettingsHandle`] is the only way to
//! talk to it.

mod handle;
mod instance;

pub use handle::{SettingsHandle, SyncStatus};

use std::sync::Arc;

use tally_engine::{InstanceId, Schema};
use tokio::sync::{mpsc, watch};

use crate::{
    broadcast::{self, ChannelHub},
    clock::{Clock, SystemClock},
    config::SyncConfig,
    remote::RemoteAuthority,
    storage::DurableStorage,
};
use instance::{Instance, Parts};

/// Builds and spawns a settings instance.
pub struct SyncBuilder<R> {
    remote: R,
    storage: Arc<dyn DurableStorage>,
    config: SyncConfig,
    schema: Schema,
    hub: Option<Arc<ChannelHub>>,
    clock: Arc<dyn Clock>,
    instance_id: Option<InstanceId>,
    reachable: bool,
}

impl<R: RemoteAuthority> SyncBuilder<R> {
    pub fn new(remote: R, storage: Arc<dyn DurableStorage>) -> Self {
        Self {
            remote,
            storage,
            config: SyncConfig::default(),
            schema: Schema::finance(),
            hub: None,
            clock: Arc::new(SystemClock),
            instance_id: None,
            reachable: true,
        }
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    /// Make a live channel hub available to transport selection.
    pub fn channel_hub(mut self, hub: Arc<ChannelHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a fixed instance id instead of a random one.
    pub fn instance_id(mut self, id: impl Into<InstanceId>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    /// The environment's reachability signal at startup.
    pub fn reachable(mut self, reachable: bool) -> Self {
        self.reachable = reachable;
        self
    }

    /// Load durable state and start the instance's event loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self) -> SettingsHandle {
        let id = self
            .instance_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let restored = instance::restore(&id, self.schema, self.storage.as_ref());
        let broadcaster = broadcast::select(self.config.transport, self.hub, self.storage.clone());

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (document_tx, document_rx) = watch::channel(restored.store.snapshot());
        let (status_tx, status_rx) = watch::channel(SyncStatus {
            online: self.reachable,
            syncing: false,
            pending: 0,
            last_reconciled: 0,
            last_error: None,
            transport: broadcaster.kind(),
        });

        let instance = Instance::new(Parts {
            id: id.clone(),
            config: self.config,
            remote: Arc::new(self.remote),
            storage: self.storage,
            broadcaster,
            clock: self.clock,
            restored,
            reachable: self.reachable,
            commands,
            document_tx,
            status_tx,
        });
        tokio::spawn(instance.run());

        SettingsHandle::new(id, commands_tx, document_rx, status_rx)
    }
}
