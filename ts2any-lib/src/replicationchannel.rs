//! Replication channel: decoded WAL events into dispatched notifications
//!
//! The WAL decoder itself lives behind [`WalEventSource`]; this module owns
//! everything that happens after decoding: slot preflight, publication
//! bootstrap, resolving relations against the system catalog, chunk
//! discovery from TimescaleDB catalog traffic, and forwarding typed events
//! into the dispatcher in WAL order.

use crate::catalog::{
    Chunk, SystemEntity, TIMESCALEDB_CATALOG_SCHEMA,
};
use crate::dispatcher::{
    task, CompressionEvent, Dispatcher, HypertableEvent, LogicalEvent, SystemCatalogEvent,
};
use crate::error::{Result, StreamerError};
use crate::handlers::{RelationMetadata, RowValues, TransactionBoundary};
use crate::monitoring::metrics;
use crate::replicationcontext::{LsnAcknowledger, ReplicationContext};
use crate::sidechannel::SideChannel;
use crate::snapshotter::Snapshotter;
use crate::systemcatalog::SystemCatalog;
use crate::tablefilter::TableFilter;
use crate::types::{LogicalMessage, Lsn, XLogData};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Decoded logical replication traffic as delivered by the upstream source
#[derive(Debug, Clone)]
pub enum ReplicationMessage {
    Begin {
        transaction_id: u32,
        commit_time: DateTime<Utc>,
        final_lsn: Lsn,
    },
    Commit {
        commit_time: DateTime<Utc>,
        commit_lsn: Lsn,
        end_lsn: Lsn,
    },
    Relation {
        relation_oid: u32,
        entity: SystemEntity,
    },
    Type {
        type_oid: u32,
    },
    Origin {
        name: String,
    },
    Insert {
        entity: SystemEntity,
        new_values: RowValues,
    },
    Update {
        entity: SystemEntity,
        old_values: Option<RowValues>,
        new_values: RowValues,
    },
    Delete {
        entity: SystemEntity,
        old_values: RowValues,
    },
    Truncate {
        entities: Vec<SystemEntity>,
    },
    Message(LogicalMessage),
    ChunkCompressed {
        chunk: SystemEntity,
    },
    ChunkDecompressed {
        chunk: SystemEntity,
    },
}

impl ReplicationMessage {
    fn kind(&self) -> &'static str {
        match self {
            ReplicationMessage::Begin { .. } => "begin",
            ReplicationMessage::Commit { .. } => "commit",
            ReplicationMessage::Relation { .. } => "relation",
            ReplicationMessage::Type { .. } => "type",
            ReplicationMessage::Origin { .. } => "origin",
            ReplicationMessage::Insert { .. } => "insert",
            ReplicationMessage::Update { .. } => "update",
            ReplicationMessage::Delete { .. } => "delete",
            ReplicationMessage::Truncate { .. } => "truncate",
            ReplicationMessage::Message(_) => "message",
            ReplicationMessage::ChunkCompressed { .. } => "chunk_compressed",
            ReplicationMessage::ChunkDecompressed { .. } => "chunk_decompressed",
        }
    }
}

/// The external WAL decoder seam. Implementations are handles in the style
/// of an actor: `&self` methods, internally serialized.
#[async_trait]
pub trait WalEventSource: Send + Sync {
    async fn start(
        &self,
        slot_name: &str,
        publication: &str,
        start_lsn: Option<Lsn>,
    ) -> Result<()>;

    /// Next decoded event, `None` once the stream ends
    async fn next_event(&self) -> Result<Option<(XLogData, ReplicationMessage)>>;

    async fn acknowledge(&self, lsn: Lsn) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

/// Replication channel boundary consumed by the supervisor
#[async_trait]
pub trait ReplicationChannel: Send + Sync {
    async fn start_replication_channel(&self, initial_tables: Vec<SystemEntity>) -> Result<()>;

    async fn stop_replication_channel(&self) -> Result<()>;
}

/// Channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub publication_name: String,
    pub slot_name: String,
    /// Emit a value-less tombstone after every delete
    pub tombstones: bool,
}

struct ChannelShared {
    dispatcher: Arc<Dispatcher>,
    catalog: Arc<SystemCatalog>,
    context: Arc<ReplicationContext>,
    table_filter: Arc<TableFilter>,
    side_channel: Arc<dyn SideChannel>,
    snapshotter: Arc<Snapshotter>,
    config: ChannelConfig,
}

/// Default channel implementation over a [`WalEventSource`]
pub struct StreamingReplicationChannel {
    shared: Arc<ChannelShared>,
    source: Arc<dyn WalEventSource>,
    shutdown: CancellationToken,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingReplicationChannel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ChannelConfig,
        dispatcher: Arc<Dispatcher>,
        catalog: Arc<SystemCatalog>,
        context: Arc<ReplicationContext>,
        table_filter: Arc<TableFilter>,
        side_channel: Arc<dyn SideChannel>,
        snapshotter: Arc<Snapshotter>,
        source: Arc<dyn WalEventSource>,
    ) -> Self {
        Self {
            shared: Arc::new(ChannelShared {
                dispatcher,
                catalog,
                context,
                table_filter,
                side_channel,
                snapshotter,
                config,
            }),
            source,
            shutdown: CancellationToken::new(),
            forwarder: Mutex::new(None),
        }
    }

    /// Slot preflight: an existing slot must have a restart point, a
    /// missing slot is created. Returns the position to resume from.
    async fn preflight_slot(&self) -> Result<Option<Lsn>> {
        let slot_name = &self.shared.config.slot_name;
        match self.shared.side_channel.read_replication_slot(slot_name).await? {
            Some(slot) => {
                if slot.restart_lsn.is_none() {
                    return Err(StreamerError::NoRestartPoint(slot_name.clone()));
                }
                Ok(slot.confirmed_flush_lsn)
            }
            None => {
                self.shared
                    .side_channel
                    .create_replication_slot(slot_name)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn bootstrap_publication(&self, initial_tables: &[SystemEntity]) -> Result<()> {
        let publication = &self.shared.config.publication_name;
        if !self.shared.side_channel.publication_exists(publication).await? {
            self.shared.side_channel.create_publication(publication).await?;
        }
        self.shared
            .side_channel
            .attach_tables_to_publication(publication, initial_tables)
            .await
    }
}

#[async_trait]
impl ReplicationChannel for StreamingReplicationChannel {
    async fn start_replication_channel(&self, initial_tables: Vec<SystemEntity>) -> Result<()> {
        let start_lsn = self.preflight_slot().await?;
        self.bootstrap_publication(&initial_tables).await?;

        self.shared.context.set_acknowledger(Arc::new(SourceAcknowledger {
            source: Arc::clone(&self.source),
        }));

        self.source
            .start(
                &self.shared.config.slot_name,
                &self.shared.config.publication_name,
                start_lsn,
            )
            .await?;
        info!(
            "Replication channel started with {} initial tables",
            initial_tables.len()
        );

        let shared = Arc::clone(&self.shared);
        let source = Arc::clone(&self.source);
        let shutdown = self.shutdown.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = source.next_event() => next,
                };
                match next {
                    Ok(Some((xld, message))) => {
                        if let Err(err) = forward_event(&shared, xld, message).await {
                            error!("Failed to forward replication event: {}", err);
                        }
                    }
                    Ok(None) => {
                        info!("Replication stream ended");
                        break;
                    }
                    Err(err) => {
                        error!("Replication stream failed: {}", err);
                        break;
                    }
                }
            }
        });
        *self.forwarder.lock().unwrap() = Some(forwarder);
        Ok(())
    }

    async fn stop_replication_channel(&self) -> Result<()> {
        self.shutdown.cancel();
        let forwarder = self.forwarder.lock().unwrap().take();
        if let Some(forwarder) = forwarder {
            let _ = forwarder.await;
        }
        self.source.stop().await
    }
}

/// Queue-backed [`WalEventSource`] for embedding: an external decoder
/// pushes decoded events through the [`WalEventInjector`] handle, the
/// channel drains them in order. Acknowledged positions are observable,
/// which also makes this the test double of choice.
pub struct QueuedWalEventSource {
    event_rx: tokio::sync::Mutex<mpsc::Receiver<(XLogData, ReplicationMessage)>>,
    last_acknowledged: AtomicU64,
    acknowledged: Mutex<Vec<Lsn>>,
}

/// Producer side of a [`QueuedWalEventSource`]
#[derive(Clone)]
pub struct WalEventInjector {
    event_tx: mpsc::Sender<(XLogData, ReplicationMessage)>,
}

impl WalEventInjector {
    /// Push one decoded event; blocks when the channel is saturated
    pub async fn inject(&self, xld: XLogData, message: ReplicationMessage) -> Result<()> {
        self.event_tx
            .send((xld, message))
            .await
            .map_err(|_| StreamerError::fatal("replication channel is gone"))
    }
}

impl QueuedWalEventSource {
    pub fn new(capacity: usize) -> (Arc<Self>, WalEventInjector) {
        let (event_tx, event_rx) = mpsc::channel(capacity.max(1));
        (
            Arc::new(Self {
                event_rx: tokio::sync::Mutex::new(event_rx),
                last_acknowledged: AtomicU64::new(0),
                acknowledged: Mutex::new(Vec::new()),
            }),
            WalEventInjector { event_tx },
        )
    }

    /// Highest LSN the pipeline has acknowledged
    pub fn last_acknowledged(&self) -> Lsn {
        Lsn::new(self.last_acknowledged.load(Ordering::SeqCst))
    }

    /// Every acknowledgement in arrival order
    pub fn acknowledgements(&self) -> Vec<Lsn> {
        self.acknowledged.lock().unwrap().clone()
    }
}

#[async_trait]
impl WalEventSource for QueuedWalEventSource {
    async fn start(
        &self,
        slot_name: &str,
        publication: &str,
        start_lsn: Option<Lsn>,
    ) -> Result<()> {
        info!(
            slot = slot_name,
            publication = publication,
            start_lsn = ?start_lsn,
            "Queued WAL event source ready; waiting for an attached decoder"
        );
        Ok(())
    }

    async fn next_event(&self) -> Result<Option<(XLogData, ReplicationMessage)>> {
        Ok(self.event_rx.lock().await.recv().await)
    }

    async fn acknowledge(&self, lsn: Lsn) -> Result<()> {
        self.last_acknowledged.fetch_max(lsn.0, Ordering::SeqCst);
        self.acknowledged.lock().unwrap().push(lsn);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.event_rx.lock().await.close();
        Ok(())
    }
}

struct SourceAcknowledger {
    source: Arc<dyn WalEventSource>,
}

#[async_trait]
impl LsnAcknowledger for SourceAcknowledger {
    async fn acknowledge(&self, lsn: Lsn) -> Result<()> {
        self.source.acknowledge(lsn).await
    }
}

/// Route one decoded event. Row events resolve against the catalog and go
/// to the dispatcher; TimescaleDB catalog traffic mutates discovery state;
/// everything untracked is acknowledged and dropped.
async fn forward_event(
    shared: &Arc<ChannelShared>,
    xld: XLogData,
    message: ReplicationMessage,
) -> Result<()> {
    metrics::EVENTS_RECEIVED_BY_KIND
        .with_label_values(&[message.kind()])
        .inc();

    match message {
        ReplicationMessage::Begin {
            transaction_id,
            commit_time,
            final_lsn,
        } => {
            let boundary = TransactionBoundary {
                transaction_id,
                commit_time,
                final_lsn,
            };
            shared
                .dispatcher
                .enqueue(task(move |n| async move {
                    n.notify_logical_handlers(&LogicalEvent::Begin { xld, boundary })
                        .await;
                }))
                .await
        }
        ReplicationMessage::Commit {
            commit_time,
            commit_lsn,
            end_lsn: _,
        } => {
            let boundary = TransactionBoundary {
                transaction_id: 0,
                commit_time,
                final_lsn: commit_lsn,
            };
            shared
                .dispatcher
                .enqueue(task(move |n| async move {
                    n.notify_logical_handlers(&LogicalEvent::Commit { xld, boundary })
                        .await;
                }))
                .await
        }
        ReplicationMessage::Relation {
            relation_oid,
            entity,
        } => {
            let relation = RelationMetadata {
                relation_oid,
                entity,
            };
            shared
                .dispatcher
                .enqueue(task(move |n| async move {
                    n.notify_base_handlers(xld, &relation).await;
                }))
                .await
        }
        ReplicationMessage::Type { type_oid } => {
            shared
                .dispatcher
                .enqueue(task(move |n| async move {
                    n.notify_logical_handlers(&LogicalEvent::Type { xld, type_oid })
                        .await;
                }))
                .await
        }
        ReplicationMessage::Origin { name } => {
            shared
                .dispatcher
                .enqueue(task(move |n| async move {
                    n.notify_logical_handlers(&LogicalEvent::Origin { xld, origin: name })
                        .await;
                }))
                .await
        }
        ReplicationMessage::Message(message) => {
            shared
                .dispatcher
                .enqueue(task(move |n| async move {
                    n.notify_logical_handlers(&LogicalEvent::Message { xld, message })
                        .await;
                }))
                .await
        }
        ReplicationMessage::Insert { entity, new_values } => {
            if is_chunk_catalog_table(&entity) {
                return on_chunk_catalog_insert(shared, xld, &new_values).await;
            }
            forward_row_event(shared, xld, entity, |table, chunk| HypertableEvent::Insert {
                xld,
                table,
                chunk,
                new_values,
            })
            .await
        }
        ReplicationMessage::Update {
            entity,
            old_values,
            new_values,
        } => {
            if is_chunk_catalog_table(&entity) {
                return on_chunk_catalog_update(shared, xld, old_values.as_ref(), &new_values)
                    .await;
            }
            forward_row_event(shared, xld, entity, |table, chunk| HypertableEvent::Update {
                xld,
                table,
                chunk,
                old_values,
                new_values,
            })
            .await
        }
        ReplicationMessage::Delete { entity, old_values } => {
            if is_chunk_catalog_table(&entity) {
                return on_chunk_catalog_delete(shared, xld, &old_values).await;
            }
            let tombstones = shared.config.tombstones;
            forward_row_event(shared, xld, entity, move |table, chunk| {
                HypertableEvent::Delete {
                    xld,
                    table,
                    chunk,
                    old_values,
                    tombstone: tombstones,
                }
            })
            .await
        }
        ReplicationMessage::Truncate { entities } => {
            for entity in entities {
                forward_row_event(shared, xld, entity, |table, _| HypertableEvent::Truncate {
                    xld,
                    table,
                })
                .await?;
            }
            Ok(())
        }
        ReplicationMessage::ChunkCompressed { chunk } => {
            forward_compression_event(shared, xld, &chunk, true).await
        }
        ReplicationMessage::ChunkDecompressed { chunk } => {
            forward_compression_event(shared, xld, &chunk, false).await
        }
    }
}

/// Resolve and dispatch one row event; untracked or filtered relations are
/// acknowledged without dispatch.
async fn forward_row_event<F>(
    shared: &Arc<ChannelShared>,
    xld: XLogData,
    entity: SystemEntity,
    build: F,
) -> Result<()>
where
    F: FnOnce(crate::catalog::TrackedTable, Option<Chunk>) -> HypertableEvent,
{
    let Some((table, chunk)) = shared.catalog.resolve_tracked_table(&entity) else {
        debug!("Dropping event for untracked relation {}", entity);
        return shared.context.acknowledge_processed(xld).await;
    };
    if !shared.table_filter.enabled(&table) {
        return shared.context.acknowledge_processed(xld).await;
    }

    let event = build(table, chunk);
    shared
        .dispatcher
        .enqueue(task(move |n| async move {
            n.notify_hypertable_handlers(&event).await;
        }))
        .await
}

async fn forward_compression_event(
    shared: &Arc<ChannelShared>,
    xld: XLogData,
    chunk_entity: &SystemEntity,
    compressed: bool,
) -> Result<()> {
    let Some((table, chunk)) = shared.catalog.resolve_tracked_table(chunk_entity) else {
        return shared.context.acknowledge_processed(xld).await;
    };
    if !shared.table_filter.enabled(&table) {
        return shared.context.acknowledge_processed(xld).await;
    }

    let event = if compressed {
        CompressionEvent::Compressed { xld, table, chunk }
    } else {
        CompressionEvent::Decompressed { xld, table, chunk }
    };
    shared
        .dispatcher
        .enqueue(task(move |n| async move {
            n.notify_compression_handlers(&event).await;
        }))
        .await
}

fn is_chunk_catalog_table(entity: &SystemEntity) -> bool {
    entity.schema_name() == TIMESCALEDB_CATALOG_SCHEMA && entity.table_name() == "chunk"
}

fn text_value(values: &RowValues, key: &str) -> Option<String> {
    match values.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(if *b { "t" } else { "f" }.to_string()),
        _ => None,
    }
}

fn int_value(values: &RowValues, key: &str) -> Option<i32> {
    text_value(values, key).and_then(|s| s.parse().ok())
}

fn bool_value(values: &RowValues, key: &str) -> bool {
    matches!(text_value(values, key).as_deref(), Some("t") | Some("true"))
}

fn chunk_from_catalog_row(values: &RowValues) -> Option<Chunk> {
    Some(Chunk::new(
        int_value(values, "id")?,
        int_value(values, "hypertable_id")?,
        SystemEntity::new(
            text_value(values, "schema_name")?,
            text_value(values, "table_name")?,
        ),
        int_value(values, "status").unwrap_or(0) & 1 == 1,
        bool_value(values, "dropped"),
    ))
}

/// A new chunk appeared: register it, widen the publication, and kick off
/// its snapshot.
async fn on_chunk_catalog_insert(
    shared: &Arc<ChannelShared>,
    xld: XLogData,
    new_values: &RowValues,
) -> Result<()> {
    let Some(chunk) = chunk_from_catalog_row(new_values) else {
        warn!("Unparseable chunk catalog row, skipping");
        return shared.context.acknowledge_processed(xld).await;
    };
    if chunk.is_dropped() {
        return shared.context.acknowledge_processed(xld).await;
    }

    let chunk = Arc::new(chunk);
    info!("Discovered new chunk {}", chunk.canonical_name());
    shared.catalog.register_chunk(Arc::clone(&chunk));

    if let Err(err) = shared
        .side_channel
        .attach_tables_to_publication(
            &shared.config.publication_name,
            &[chunk.entity().clone()],
        )
        .await
    {
        warn!(
            "Failed to attach chunk {} to publication: {}",
            chunk.canonical_name(),
            err
        );
    }

    if let Some(hypertable) = shared.catalog.hypertable_by_id(chunk.hypertable_id()) {
        shared
            .snapshotter
            .request_chunk_snapshot(hypertable, Arc::clone(&chunk))
            .await;
    }

    let event = SystemCatalogEvent::ChunkAdded(chunk);
    shared
        .dispatcher
        .enqueue(task(move |n| async move {
            n.notify_system_catalog_handlers(&event).await;
        }))
        .await?;
    shared.context.acknowledge_processed(xld).await
}

/// A chunk catalog update flips the compressed status bit when TimescaleDB
/// compresses or decompresses the chunk.
async fn on_chunk_catalog_update(
    shared: &Arc<ChannelShared>,
    xld: XLogData,
    old_values: Option<&RowValues>,
    new_values: &RowValues,
) -> Result<()> {
    let Some(new_chunk) = chunk_from_catalog_row(new_values) else {
        return shared.context.acknowledge_processed(xld).await;
    };

    let was_compressed = old_values
        .and_then(|values| int_value(values, "status"))
        .map(|status| status & 1 == 1)
        .unwrap_or_else(|| {
            shared
                .catalog
                .chunk_by_entity(new_chunk.entity())
                .map(|chunk| chunk.is_compressed())
                .unwrap_or(false)
        });

    shared.catalog.register_chunk(Arc::new(new_chunk.clone()));

    match (was_compressed, new_chunk.is_compressed()) {
        (false, true) => {
            forward_compression_event(shared, xld, new_chunk.entity(), true).await
        }
        (true, false) => {
            forward_compression_event(shared, xld, new_chunk.entity(), false).await
        }
        _ => shared.context.acknowledge_processed(xld).await,
    }
}

async fn on_chunk_catalog_delete(
    shared: &Arc<ChannelShared>,
    xld: XLogData,
    old_values: &RowValues,
) -> Result<()> {
    // Under DEFAULT replica identity only the key columns arrive; the id is
    // always among them.
    if let Some(chunk_id) = int_value(old_values, "id") {
        info!("Chunk id {} removed upstream", chunk_id);
        shared.catalog.remove_chunk(chunk_id);
        if let Some(chunk) = chunk_from_catalog_row(old_values) {
            let event = SystemCatalogEvent::ChunkDeleted(Arc::new(chunk));
            shared
                .dispatcher
                .enqueue(task(move |n| async move {
                    n.notify_system_catalog_handlers(&event).await;
                }))
                .await?;
        }
    }
    shared.context.acknowledge_processed(xld).await
}
