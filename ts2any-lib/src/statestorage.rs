//! Durable key→bytes state storage
//!
//! The streamer checkpoints small binary blobs (sink context, known tables)
//! under fixed names. Encoders registered with the manager are invoked at
//! checkpoint time so subsystems do not need to push state eagerly.

use crate::buffer::{BufferReader, BufferWriter};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Produces the current encoded state of a subsystem at checkpoint time
pub type StateEncoder = Box<dyn Fn() -> Result<Vec<u8>> + Send + Sync>;

/// Backend holding named binary state blobs
#[async_trait]
pub trait StateStorage: Send + Sync {
    /// Load all previously persisted entries
    async fn load(&self) -> Result<HashMap<String, Vec<u8>>>;

    /// Persist the full set of entries
    async fn save(&self, entries: &HashMap<String, Vec<u8>>) -> Result<()>;
}

/// In-memory backend for tests and ephemeral deployments
#[derive(Debug, Default)]
pub struct MemoryStateStorage {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStateStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: HashMap<String, Vec<u8>>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }
}

#[async_trait]
impl StateStorage for MemoryStateStorage {
    async fn load(&self) -> Result<HashMap<String, Vec<u8>>> {
        Ok(self.entries.lock().unwrap().clone())
    }

    async fn save(&self, entries: &HashMap<String, Vec<u8>>) -> Result<()> {
        *self.entries.lock().unwrap() = entries.clone();
        Ok(())
    }
}

/// File-backed backend. The on-disk layout reuses the state wire format:
/// `u32 count || [string name || u32 len || bytes]*`, big-endian.
#[derive(Debug)]
pub struct FileStateStorage {
    path: PathBuf,
}

impl FileStateStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StateStorage for FileStateStorage {
    async fn load(&self) -> Result<HashMap<String, Vec<u8>>> {
        let payload = match tokio::fs::read(&self.path).await {
            Ok(payload) => payload,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state file at {}, starting fresh", self.path.display());
                return Ok(HashMap::new());
            }
            Err(err) => return Err(err.into()),
        };

        let mut reader = BufferReader::new(&payload);
        let count = reader.read_u32()?;
        let mut entries = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let name = reader.read_string()?;
            let length = reader.read_u32()? as usize;
            let value = reader.read_bytes(length)?;
            entries.insert(name, value);
        }
        Ok(entries)
    }

    async fn save(&self, entries: &HashMap<String, Vec<u8>>) -> Result<()> {
        let mut writer = BufferWriter::with_capacity(256);
        writer.put_u32(entries.len() as u32);
        for (name, value) in entries {
            writer.put_string(name);
            writer.put_u32(value.len() as u32);
            writer.put_bytes(value);
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        // Write-then-rename keeps the previous checkpoint intact on crash.
        let staging = self.path.with_extension("tmp");
        tokio::fs::write(&staging, writer.into_vec()).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl<S: StateStorage> StateStorage for Arc<S> {
    async fn load(&self) -> Result<HashMap<String, Vec<u8>>> {
        (**self).load().await
    }

    async fn save(&self, entries: &HashMap<String, Vec<u8>>) -> Result<()> {
        (**self).save(entries).await
    }
}

/// Front door for state access: cached entries plus encoder callbacks
pub struct StateStorageManager {
    storage: Box<dyn StateStorage>,
    entries: Mutex<HashMap<String, Vec<u8>>>,
    encoders: Mutex<HashMap<String, StateEncoder>>,
}

impl StateStorageManager {
    pub fn new(storage: Box<dyn StateStorage>) -> Self {
        Self {
            storage,
            entries: Mutex::new(HashMap::new()),
            encoders: Mutex::new(HashMap::new()),
        }
    }

    /// Load persisted entries into the cache
    pub async fn start(&self) -> Result<()> {
        let loaded = self.storage.load().await?;
        info!("Loaded {} durable state entries", loaded.len());
        *self.entries.lock().unwrap() = loaded;
        Ok(())
    }

    /// Run encoders and persist the final state
    pub async fn stop(&self) -> Result<()> {
        self.checkpoint().await
    }

    pub fn encoded_state(&self, name: &str) -> Option<Vec<u8>> {
        self.entries.lock().unwrap().get(name).cloned()
    }

    pub fn set_encoded_state(&self, name: impl Into<String>, state: Vec<u8>) {
        self.entries.lock().unwrap().insert(name.into(), state);
    }

    /// Register an encoder invoked at every checkpoint under `name`
    pub fn register_state_encoder(&self, name: impl Into<String>, encoder: StateEncoder) {
        self.encoders.lock().unwrap().insert(name.into(), encoder);
    }

    /// Invoke all registered encoders and persist the result
    pub async fn checkpoint(&self) -> Result<()> {
        {
            let encoders = self.encoders.lock().unwrap();
            let mut entries = self.entries.lock().unwrap();
            for (name, encoder) in encoders.iter() {
                entries.insert(name.clone(), encoder()?);
            }
        }
        let snapshot = self.entries.lock().unwrap().clone();
        self.storage.save(&snapshot).await
    }
}
