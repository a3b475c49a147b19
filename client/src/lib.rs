//! # Tally Client
//!
//! The async runtime around [`tally_engine`]: keeps every open instance of
//! the application and the remote authority converging on one settings
//! document.
//!
//! Each instance runs as a single tokio task that owns its replica. Local
//! edits are validated and persisted immediately, debounced, and reconciled
//! with the remote authority; sibling instances learn about each other's
//! state through a [`Broadcaster`](broadcast::Broadcaster) and shared
//! durable storage.
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tally_client::{HttpAuthority, MemoryStorage, SyncBuilder};
//!
//! # async fn example() -> Result<(), tally_client::SyncError> {
//! let storage = MemoryStorage::new_shared();
//! let settings = SyncBuilder::new(HttpAuthority::new("https://api.tally.app"), storage).spawn();
//!
//! settings.record_change("theme", json!("dark")).await?;
//! assert_eq!(settings.get_field("theme"), Some(json!("dark")));
//! # Ok(())
//! # }
//! ```

pub mod broadcast;
pub mod clock;
pub mod config;
pub mod debounce;
pub mod error;
pub mod remote;
pub mod storage;
pub mod sync;

pub use broadcast::{Broadcaster, ChannelHub, StorageBroadcaster, TransportKind};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, SyncConfig, TransportPreference};
pub use error::{StorageError, SyncError, TransportError};
pub use remote::{HttpAuthority, RemoteAuthority};
pub use storage::{DurableStorage, FileStorage, MemoryStorage, StorageEvent};
pub use sync::{SettingsHandle, SyncBuilder, SyncStatus};
