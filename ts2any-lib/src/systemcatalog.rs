//! Runtime registry of discovered tables and chunks
//!
//! Loaded from the side channel at startup and kept current by catalog
//! events flowing through the dispatcher. The chunk→hypertable mapping is
//! what turns chunk-level WAL traffic into hypertable-scoped events.

use crate::catalog::{BaseTable, Chunk, Hypertable, SystemEntity, TrackedTable};
use crate::error::Result;
use crate::handlers::{
    ChunkSnapshotEventHandler, ReplicationEventHandler, SystemCatalogEventHandler,
};
use crate::sidechannel::SideChannel;
use crate::types::Lsn;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

#[derive(Default)]
struct CatalogState {
    hypertables: HashMap<i32, Arc<Hypertable>>,
    hypertable_ids_by_name: HashMap<String, i32>,
    chunks: HashMap<i32, Arc<Chunk>>,
    chunk_ids_by_name: HashMap<String, i32>,
    vanilla_tables: HashMap<String, Arc<BaseTable>>,
    snapshotted_chunks: HashSet<i32>,
}

pub struct SystemCatalog {
    state: Mutex<CatalogState>,
}

impl SystemCatalog {
    /// Load the current catalog through the side channel
    pub async fn load(side_channel: &dyn SideChannel) -> Result<Self> {
        let mut state = CatalogState::default();

        for hypertable in side_channel.get_all_hypertables().await? {
            let hypertable = Arc::new(hypertable);
            state
                .hypertable_ids_by_name
                .insert(hypertable.canonical_name(), hypertable.id());
            state.hypertables.insert(hypertable.id(), hypertable);
        }
        for chunk in side_channel.get_all_chunks().await? {
            let chunk = Arc::new(chunk);
            state
                .chunk_ids_by_name
                .insert(chunk.canonical_name(), chunk.id());
            state.chunks.insert(chunk.id(), chunk);
        }
        for table in side_channel.get_all_vanilla_tables().await? {
            let table = Arc::new(table);
            state
                .vanilla_tables
                .insert(table.canonical_name(), table);
        }

        info!(
            "System catalog loaded: {} hypertables, {} chunks, {} vanilla tables",
            state.hypertables.len(),
            state.chunks.len(),
            state.vanilla_tables.len()
        );
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    /// Empty catalog, for tests
    pub fn empty() -> Self {
        Self {
            state: Mutex::new(CatalogState::default()),
        }
    }

    pub fn hypertables(&self) -> Vec<Arc<Hypertable>> {
        self.state.lock().unwrap().hypertables.values().cloned().collect()
    }

    pub fn vanilla_tables(&self) -> Vec<Arc<BaseTable>> {
        self.state
            .lock()
            .unwrap()
            .vanilla_tables
            .values()
            .cloned()
            .collect()
    }

    pub fn all_chunk_entities(&self) -> Vec<SystemEntity> {
        self.state
            .lock()
            .unwrap()
            .chunks
            .values()
            .map(|chunk| chunk.entity().clone())
            .collect()
    }

    pub fn all_vanilla_entities(&self) -> Vec<SystemEntity> {
        self.state
            .lock()
            .unwrap()
            .vanilla_tables
            .values()
            .map(|table| table.entity().clone())
            .collect()
    }

    pub fn hypertable_by_id(&self, id: i32) -> Option<Arc<Hypertable>> {
        self.state.lock().unwrap().hypertables.get(&id).cloned()
    }

    pub fn chunk_by_entity(&self, entity: &SystemEntity) -> Option<Arc<Chunk>> {
        let state = self.state.lock().unwrap();
        let id = state.chunk_ids_by_name.get(&entity.canonical_name())?;
        state.chunks.get(id).cloned()
    }

    /// Resolve a relation seen on the WAL to the table events should be
    /// attributed to: chunks map to their owning hypertable, everything
    /// else to itself.
    pub fn resolve_tracked_table(
        &self,
        entity: &SystemEntity,
    ) -> Option<(TrackedTable, Option<Chunk>)> {
        let state = self.state.lock().unwrap();
        let canonical_name = entity.canonical_name();

        if let Some(chunk_id) = state.chunk_ids_by_name.get(&canonical_name) {
            let chunk = state.chunks.get(chunk_id)?;
            let hypertable = state.hypertables.get(&chunk.hypertable_id())?;
            return Some((
                TrackedTable::Hypertable(Arc::clone(hypertable)),
                Some(chunk.as_ref().clone()),
            ));
        }

        if let Some(id) = state.hypertable_ids_by_name.get(&canonical_name) {
            let hypertable = state.hypertables.get(id)?;
            return Some((TrackedTable::Hypertable(Arc::clone(hypertable)), None));
        }

        state
            .vanilla_tables
            .get(&canonical_name)
            .map(|table| (TrackedTable::Vanilla(Arc::clone(table)), None))
    }

    pub fn register_chunk(&self, chunk: Arc<Chunk>) {
        let mut state = self.state.lock().unwrap();
        state
            .chunk_ids_by_name
            .insert(chunk.canonical_name(), chunk.id());
        state.chunks.insert(chunk.id(), chunk);
    }

    pub fn remove_chunk(&self, chunk_id: i32) {
        let mut state = self.state.lock().unwrap();
        if let Some(chunk) = state.chunks.remove(&chunk_id) {
            state.chunk_ids_by_name.remove(&chunk.canonical_name());
            state.snapshotted_chunks.remove(&chunk_id);
            debug!("Removed chunk {} from catalog", chunk.canonical_name());
        }
    }

    pub fn mark_chunk_snapshotted(&self, chunk_id: i32) {
        self.state.lock().unwrap().snapshotted_chunks.insert(chunk_id);
    }

    pub fn is_chunk_snapshotted(&self, chunk_id: i32) -> bool {
        self.state
            .lock()
            .unwrap()
            .snapshotted_chunks
            .contains(&chunk_id)
    }

    pub fn register_hypertable(&self, hypertable: Arc<Hypertable>) {
        let mut state = self.state.lock().unwrap();
        state
            .hypertable_ids_by_name
            .insert(hypertable.canonical_name(), hypertable.id());
        state.hypertables.insert(hypertable.id(), hypertable);
    }

    pub fn remove_hypertable(&self, hypertable_id: i32) {
        let mut state = self.state.lock().unwrap();
        if let Some(hypertable) = state.hypertables.remove(&hypertable_id) {
            state
                .hypertable_ids_by_name
                .remove(&hypertable.canonical_name());
            // Orphaned chunks go with their hypertable.
            let orphaned: Vec<i32> = state
                .chunks
                .values()
                .filter(|chunk| chunk.hypertable_id() == hypertable_id)
                .map(|chunk| chunk.id())
                .collect();
            for chunk_id in orphaned {
                if let Some(chunk) = state.chunks.remove(&chunk_id) {
                    state.chunk_ids_by_name.remove(&chunk.canonical_name());
                }
            }
        }
    }

    /// The handler keeping this catalog current, for dispatcher registration
    pub fn new_handler(self: &Arc<Self>) -> Arc<dyn ReplicationEventHandler> {
        Arc::new(SystemCatalogHandler {
            catalog: Arc::clone(self),
        })
    }
}

struct SystemCatalogHandler {
    catalog: Arc<SystemCatalog>,
}

#[async_trait]
impl ReplicationEventHandler for SystemCatalogHandler {
    fn as_system_catalog_handler(&self) -> Option<&dyn SystemCatalogEventHandler> {
        Some(self)
    }

    fn as_chunk_snapshot_handler(&self) -> Option<&dyn ChunkSnapshotEventHandler> {
        Some(self)
    }
}

#[async_trait]
impl ChunkSnapshotEventHandler for SystemCatalogHandler {
    async fn on_chunk_snapshot_started(
        &self,
        _hypertable: &Hypertable,
        chunk: &Chunk,
    ) -> Result<()> {
        debug!("Snapshot of chunk {} started", chunk.canonical_name());
        Ok(())
    }

    async fn on_chunk_snapshot_finished(
        &self,
        _hypertable: &Hypertable,
        chunk: &Chunk,
        _snapshot_lsn: Lsn,
    ) -> Result<()> {
        self.catalog.mark_chunk_snapshotted(chunk.id());
        Ok(())
    }
}

#[async_trait]
impl SystemCatalogEventHandler for SystemCatalogHandler {
    async fn on_hypertable_added(&self, hypertable: Arc<Hypertable>) -> Result<()> {
        self.catalog.register_hypertable(hypertable);
        Ok(())
    }

    async fn on_hypertable_deleted(&self, hypertable: Arc<Hypertable>) -> Result<()> {
        self.catalog.remove_hypertable(hypertable.id());
        Ok(())
    }

    async fn on_chunk_added(&self, chunk: Arc<Chunk>) -> Result<()> {
        self.catalog.register_chunk(chunk);
        Ok(())
    }

    async fn on_chunk_deleted(&self, chunk: Arc<Chunk>) -> Result<()> {
        self.catalog.remove_chunk(chunk.id());
        Ok(())
    }
}
