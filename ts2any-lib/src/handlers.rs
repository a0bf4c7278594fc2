//! Replication event handler capabilities
//!
//! Handlers register with the dispatcher and declare capabilities by
//! returning themselves from the matching `as_*` accessor. The notificator
//! walks the handler list and invokes only the capable ones, so a handler
//! implements exactly the traits for the events it cares about.

use crate::catalog::{Chunk, Hypertable, SystemEntity, TrackedTable};
use crate::error::Result;
use crate::types::{LogicalMessage, Lsn, XLogData};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Raw column values keyed by column name
pub type RowValues = HashMap<String, Value>;

/// Transaction boundary metadata
#[derive(Debug, Clone, Copy)]
pub struct TransactionBoundary {
    pub transaction_id: u32,
    pub commit_time: DateTime<Utc>,
    pub final_lsn: Lsn,
}

/// Relation metadata announced ahead of row events
#[derive(Debug, Clone)]
pub struct RelationMetadata {
    pub relation_oid: u32,
    pub entity: SystemEntity,
}

/// Base capability every registered handler carries
#[async_trait]
pub trait ReplicationEventHandler: Send + Sync {
    fn as_system_catalog_handler(&self) -> Option<&dyn SystemCatalogEventHandler> {
        None
    }

    fn as_compression_handler(&self) -> Option<&dyn CompressionEventHandler> {
        None
    }

    fn as_hypertable_handler(&self) -> Option<&dyn HypertableEventHandler> {
        None
    }

    fn as_logical_handler(&self) -> Option<&dyn LogicalEventHandler> {
        None
    }

    fn as_chunk_snapshot_handler(&self) -> Option<&dyn ChunkSnapshotEventHandler> {
        None
    }

    async fn on_relation_event(&self, _xld: XLogData, _relation: &RelationMetadata) -> Result<()> {
        Ok(())
    }
}

/// Catalog discovery notifications
#[async_trait]
pub trait SystemCatalogEventHandler: Send + Sync {
    async fn on_hypertable_added(&self, _hypertable: Arc<Hypertable>) -> Result<()> {
        Ok(())
    }

    async fn on_hypertable_deleted(&self, _hypertable: Arc<Hypertable>) -> Result<()> {
        Ok(())
    }

    async fn on_chunk_added(&self, _chunk: Arc<Chunk>) -> Result<()> {
        Ok(())
    }

    async fn on_chunk_deleted(&self, _chunk: Arc<Chunk>) -> Result<()> {
        Ok(())
    }
}

/// Chunk compression lifecycle notifications
#[async_trait]
pub trait CompressionEventHandler: Send + Sync {
    async fn on_chunk_compressed(
        &self,
        xld: XLogData,
        table: &TrackedTable,
        chunk: Option<&Chunk>,
    ) -> Result<()>;

    async fn on_chunk_decompressed(
        &self,
        xld: XLogData,
        table: &TrackedTable,
        chunk: Option<&Chunk>,
    ) -> Result<()>;
}

/// Row-level change notifications
#[async_trait]
pub trait HypertableEventHandler: Send + Sync {
    async fn on_read_event(
        &self,
        lsn: Lsn,
        table: &TrackedTable,
        chunk: Option<&Chunk>,
        new_values: RowValues,
    ) -> Result<()>;

    async fn on_insert_event(
        &self,
        xld: XLogData,
        table: &TrackedTable,
        chunk: Option<&Chunk>,
        new_values: RowValues,
    ) -> Result<()>;

    async fn on_update_event(
        &self,
        xld: XLogData,
        table: &TrackedTable,
        chunk: Option<&Chunk>,
        old_values: Option<RowValues>,
        new_values: RowValues,
    ) -> Result<()>;

    async fn on_delete_event(
        &self,
        xld: XLogData,
        table: &TrackedTable,
        chunk: Option<&Chunk>,
        old_values: RowValues,
        tombstone: bool,
    ) -> Result<()>;

    async fn on_truncate_event(&self, xld: XLogData, table: &TrackedTable) -> Result<()>;
}

/// Transaction and logical message notifications
#[async_trait]
pub trait LogicalEventHandler: Send + Sync {
    async fn on_begin_event(&self, _xld: XLogData, _begin: TransactionBoundary) -> Result<()> {
        Ok(())
    }

    async fn on_commit_event(&self, _xld: XLogData, _commit: TransactionBoundary) -> Result<()> {
        Ok(())
    }

    async fn on_message_event(&self, _xld: XLogData, _message: &LogicalMessage) -> Result<()> {
        Ok(())
    }

    async fn on_type_event(&self, _xld: XLogData, _type_oid: u32) -> Result<()> {
        Ok(())
    }

    async fn on_origin_event(&self, _xld: XLogData, _origin: &str) -> Result<()> {
        Ok(())
    }
}

/// Snapshot progress notifications
#[async_trait]
pub trait ChunkSnapshotEventHandler: Send + Sync {
    async fn on_chunk_snapshot_started(&self, hypertable: &Hypertable, chunk: &Chunk)
        -> Result<()>;

    async fn on_chunk_snapshot_finished(
        &self,
        hypertable: &Hypertable,
        chunk: &Chunk,
        snapshot_lsn: Lsn,
    ) -> Result<()>;
}
