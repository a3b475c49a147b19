//! File-backed storage: one file per key.
//!
//! Each file holds the id of the instance that wrote it on the first line,
//! followed by the stored bytes. Other processes sharing the directory are
//! noticed by [`FileStorage::watch`], which polls for contents it has not
//! seen and announces them with the recorded origin.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use dashmap::DashMap;
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

use super::{DurableStorage, StorageEvent, EVENT_CAPACITY};
use crate::error::StorageError;

const SUFFIX: &str = ".entry";

/// Storage that survives process restarts.
///
/// Writes go to a temporary file first and are renamed into place, so a
/// crash never leaves a half-written key.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    events: broadcast::Sender<StorageEvent>,
    /// Last file contents seen per key, our own writes included
    seen: DashMap<String, Vec<u8>>,
}

impl FileStorage {
    /// Open (and create if needed) a storage directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let storage = Self {
            dir,
            events,
            seen: DashMap::new(),
        };
        // What is already on disk is not news
        storage.scan(false)?;
        Ok(storage)
    }

    /// Open a storage wrapped in Arc for sharing.
    pub fn open_shared(dir: impl Into<PathBuf>) -> Result<Arc<Self>, StorageError> {
        Self::open(dir).map(Arc::new)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Poll the directory every `period` for writes made by other processes.
    ///
    /// The task stops once the storage is dropped.
    pub fn watch(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(storage) = weak.upgrade() else {
                    break;
                };
                let dir = storage.dir.clone();
                match tokio::task::spawn_blocking(move || storage.poll()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(dir = %dir.display(), error = %e, "Storage poll failed")
                    }
                    Err(e) => {
                        tracing::warn!(dir = %dir.display(), error = %e, "Storage poll task failed")
                    }
                }
            }
        })
    }

    /// Announce every key whose file changed since it was last seen.
    ///
    /// Returns the number of events sent.
    pub fn poll(&self) -> Result<usize, StorageError> {
        self.scan(true)
    }

    fn scan(&self, announce: bool) -> Result<usize, StorageError> {
        let mut announced = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(key) = name
                .to_str()
                .and_then(|name| name.strip_suffix(SUFFIX))
                .filter(|key| !key.starts_with('.'))
            else {
                continue;
            };

            let raw = match fs::read(entry.path()) {
                Ok(raw) => raw,
                // Replaced or removed between listing and reading
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if self.seen.get(key).is_some_and(|seen| *seen == raw) {
                continue;
            }

            let (origin, _) = decode(&raw);
            let event = StorageEvent {
                key: key.to_string(),
                origin: origin.to_string(),
            };
            self.seen.insert(key.to_string(), raw);

            if announce {
                tracing::trace!(key = %event.key, origin = %event.origin, "Storage file changed on disk");
                let _ = self.events.send(event);
                announced += 1;
            }
        }
        Ok(announced)
    }

    fn path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
            && !key.starts_with('.');
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{}{}", key, SUFFIX)))
    }
}

/// Split a file into the writer's id and the stored bytes.
fn decode(raw: &[u8]) -> (&str, &[u8]) {
    match raw.iter().position(|&b| b == b'\n') {
        Some(newline) => (
            std::str::from_utf8(&raw[..newline]).unwrap_or_default(),
            &raw[newline + 1..],
        ),
        None => ("", raw),
    }
}

fn encode(origin: &str, bytes: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(origin.len() + 1 + bytes.len());
    raw.extend_from_slice(origin.as_bytes());
    raw.push(b'\n');
    raw.extend_from_slice(bytes);
    raw
}

impl DurableStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.path(key)?) {
            Ok(raw) => Ok(Some(decode(&raw).1.to_vec())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, origin: &str, key: &str, bytes: Vec<u8>) -> Result<bool, StorageError> {
        if origin.contains('\n') {
            return Err(StorageError::InvalidKey(origin.to_string()));
        }
        let path = self.path(key)?;
        if self.get(key)?.as_deref() == Some(bytes.as_slice()) {
            return Ok(false);
        }

        let raw = encode(origin, &bytes);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", key, uuid::Uuid::new_v4()));
        fs::write(&tmp, &raw)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        self.seen.insert(key.to_string(), raw);

        tracing::trace!(key = %key, origin = %origin, path = %path.display(), "Storage file written");

        let _ = self.events.send(StorageEvent {
            key: key.to_string(),
            origin: origin.to_string(),
        });
        Ok(true)
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}
