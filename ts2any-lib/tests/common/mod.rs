//! Shared test utilities for ts2any-lib integration tests
//!
//! Provides a recording sink, a scripted side channel, and a fully wired
//! pipeline harness driving events through the queued WAL source exactly
//! the way the production wiring does.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use ts2any_lib::catalog::{
    BaseTable, Chunk, Column, Hypertable, ReplicaIdentity, SystemEntity,
    TIMESCALEDB_INTERNAL_SCHEMA,
};
use ts2any_lib::dispatcher::Dispatcher;
use ts2any_lib::error::{Result, StreamerError};
use ts2any_lib::eventemitter::EventEmitter;
use ts2any_lib::eventfilter::AcceptAllFilter;
use ts2any_lib::handlers::RowValues;
use ts2any_lib::replicationchannel::{
    ChannelConfig, QueuedWalEventSource, ReplicationChannel, StreamingReplicationChannel,
    WalEventInjector,
};
use ts2any_lib::replicationcontext::ReplicationContext;
use ts2any_lib::retry::RetryConfig;
use ts2any_lib::schema::Struct;
use ts2any_lib::sidechannel::{ReplicationSlotInfo, SideChannel, SystemInformation};
use ts2any_lib::sink::{Sink, SinkContext};
use ts2any_lib::snapshotter::{Snapshotter, SnapshotterConfig};
use ts2any_lib::statestorage::{MemoryStateStorage, StateStorageManager};
use ts2any_lib::systemcatalog::SystemCatalog;
use ts2any_lib::tablefilter::TableFilter;
use ts2any_lib::topic::{DebeziumNamingStrategy, NameGenerator};
use ts2any_lib::transactionmonitor::TransactionMonitor;
use ts2any_lib::types::{Lsn, XLogData};

/// One recorded sink emission
#[derive(Debug, Clone)]
pub struct SinkCall {
    pub topic: String,
    pub key: Struct,
    pub value: Struct,
    pub server_time: DateTime<Utc>,
}

/// Sink recording every successful emission, optionally failing the first
/// N attempts with a retryable error.
#[derive(Debug, Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
    attempts: AtomicUsize,
    failures_remaining: AtomicU32,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(times: u32) -> Arc<Self> {
        let sink = Self::default();
        sink.failures_remaining.store(times, Ordering::SeqCst);
        Arc::new(sink)
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn emit(
        &self,
        _context: &SinkContext,
        server_time: DateTime<Utc>,
        topic: &str,
        key: Struct,
        value: Struct,
    ) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(StreamerError::sink("scripted failure"));
        }
        self.calls.lock().unwrap().push(SinkCall {
            topic: topic.to_string(),
            key,
            value,
            server_time,
        });
        Ok(())
    }
}

/// Scripted side channel serving a small fixed catalog:
/// - hypertable `public.metrics` (id 1, PK `id`) with one chunk
/// - vanilla table `public.users` (PK `id`)
pub struct MockSideChannel {
    pub system_information: Mutex<SystemInformation>,
    pub slot: Mutex<Option<ReplicationSlotInfo>>,
    pub published: Mutex<Vec<SystemEntity>>,
    pub attached: Mutex<Vec<SystemEntity>>,
    pub snapshot_rows: Mutex<Vec<RowValues>>,
}

impl MockSideChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            system_information: Mutex::new(SystemInformation {
                database_name: "tsdb".into(),
                system_id: "7000000000000000001".into(),
                timeline: 1,
                postgres_version: 150_004,
                postgres_version_text: "15.4".into(),
                timescale_version: "2.11.2".into(),
                wal_level: "logical".into(),
            }),
            slot: Mutex::new(Some(ReplicationSlotInfo {
                slot_name: "ts2any_slot".into(),
                plugin: "pgoutput".into(),
                restart_lsn: Some(Lsn::new(10)),
                confirmed_flush_lsn: Some(Lsn::new(10)),
            })),
            published: Mutex::new(Vec::new()),
            attached: Mutex::new(Vec::new()),
            snapshot_rows: Mutex::new(Vec::new()),
        })
    }

    pub fn metrics_hypertable() -> Hypertable {
        Hypertable::new(
            1,
            SystemEntity::new("public", "metrics"),
            "tsdb",
            None,
            None,
            ReplicaIdentity::Default,
            vec![
                Column::new("id", ts2any_lib::types::oids::INT4, false, true, true),
                Column::new("v", ts2any_lib::types::oids::FLOAT8, true, false, false),
            ],
        )
    }

    pub fn metrics_chunk() -> Chunk {
        Chunk::new(
            11,
            1,
            SystemEntity::new(TIMESCALEDB_INTERNAL_SCHEMA, "_hyper_1_1_chunk"),
            false,
            false,
        )
    }

    pub fn users_table() -> BaseTable {
        BaseTable::new(
            SystemEntity::new("public", "users"),
            "tsdb",
            ReplicaIdentity::Default,
            vec![
                Column::new("id", ts2any_lib::types::oids::INT8, false, true, true),
                Column::new("name", ts2any_lib::types::oids::TEXT, true, false, false),
            ],
        )
    }

    pub fn attached_entities(&self) -> Vec<SystemEntity> {
        self.attached.lock().unwrap().clone()
    }
}

#[async_trait]
impl SideChannel for MockSideChannel {
    async fn read_system_information(&self) -> Result<SystemInformation> {
        Ok(self.system_information.lock().unwrap().clone())
    }

    async fn get_all_hypertables(&self) -> Result<Vec<Hypertable>> {
        Ok(vec![Self::metrics_hypertable()])
    }

    async fn get_all_chunks(&self) -> Result<Vec<Chunk>> {
        Ok(vec![Self::metrics_chunk()])
    }

    async fn get_all_vanilla_tables(&self) -> Result<Vec<BaseTable>> {
        Ok(vec![Self::users_table()])
    }

    async fn read_published_tables(&self, _publication: &str) -> Result<Vec<SystemEntity>> {
        Ok(self.published.lock().unwrap().clone())
    }

    async fn create_publication(&self, _publication: &str) -> Result<()> {
        Ok(())
    }

    async fn publication_exists(&self, _publication: &str) -> Result<bool> {
        Ok(true)
    }

    async fn attach_tables_to_publication(
        &self,
        _publication: &str,
        entities: &[SystemEntity],
    ) -> Result<()> {
        self.attached.lock().unwrap().extend_from_slice(entities);
        Ok(())
    }

    async fn read_replication_slot(&self, _slot_name: &str) -> Result<Option<ReplicationSlotInfo>> {
        Ok(self.slot.lock().unwrap().clone())
    }

    async fn create_replication_slot(&self, _slot_name: &str) -> Result<()> {
        Ok(())
    }

    async fn snapshot_table(
        &self,
        _entity: &SystemEntity,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RowValues>> {
        let rows = self.snapshot_rows.lock().unwrap();
        let start = (offset as usize).min(rows.len());
        let end = (start + limit as usize).min(rows.len());
        Ok(rows[start..end].to_vec())
    }
}

/// Harness knobs
pub struct HarnessOptions {
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    pub accepted_by_default: bool,
    pub tombstones: bool,
    pub sink_failures: u32,
    pub initial_state: HashMap<String, Vec<u8>>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            includes: vec!["public.*".to_string()],
            excludes: Vec::new(),
            accepted_by_default: false,
            tombstones: false,
            sink_failures: 0,
            initial_state: HashMap::new(),
        }
    }
}

/// Fully wired pipeline over mocks
pub struct TestHarness {
    pub dispatcher: Arc<Dispatcher>,
    pub catalog: Arc<SystemCatalog>,
    pub context: Arc<ReplicationContext>,
    pub emitter: Arc<EventEmitter>,
    pub sink: Arc<RecordingSink>,
    pub side_channel: Arc<MockSideChannel>,
    pub source: Arc<QueuedWalEventSource>,
    pub injector: WalEventInjector,
    pub channel: Arc<StreamingReplicationChannel>,
    pub state: Arc<StateStorageManager>,
    pub snapshotter: Arc<Snapshotter>,
}

impl TestHarness {
    pub async fn start(options: HarnessOptions) -> Self {
        let side_channel = MockSideChannel::new();
        let sink = if options.sink_failures > 0 {
            RecordingSink::failing(options.sink_failures)
        } else {
            RecordingSink::new()
        };

        let state = Arc::new(StateStorageManager::new(Box::new(
            MemoryStateStorage::with_entries(options.initial_state),
        )));
        state.start().await.unwrap();

        let table_filter = Arc::new(
            TableFilter::new(
                &options.excludes,
                &options.includes,
                options.accepted_by_default,
            )
            .unwrap(),
        );

        let context = Arc::new(ReplicationContext::new(
            NameGenerator::new("prefix", Box::new(DebeziumNamingStrategy)),
            side_channel.clone() as Arc<dyn SideChannel>,
            Arc::clone(&state),
        ));
        context.start().await.unwrap();

        let dispatcher = Arc::new(Dispatcher::new(256));
        dispatcher.start();

        let catalog = Arc::new(SystemCatalog::load(side_channel.as_ref()).await.unwrap());
        dispatcher.register_handler(catalog.new_handler());

        let transaction_monitor = Arc::new(TransactionMonitor::new());
        dispatcher.register_handler(
            Arc::clone(&transaction_monitor) as Arc<dyn ts2any_lib::handlers::ReplicationEventHandler>
        );

        let retry_config = RetryConfig {
            max_retries: 8,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 1.0,
            jitter: false,
        };
        let emitter = Arc::new(EventEmitter::new(
            Arc::clone(&context),
            Arc::clone(&transaction_monitor),
            sink.clone() as Arc<dyn Sink>,
            Arc::new(AcceptAllFilter),
            retry_config,
        ));
        emitter.start().await.unwrap();
        dispatcher.register_handler(emitter.new_handler());

        let snapshotter = Arc::new(Snapshotter::new(
            SnapshotterConfig {
                workers: 1,
                batch_size: 100,
            },
            side_channel.clone() as Arc<dyn SideChannel>,
            Arc::clone(&dispatcher),
        ));
        snapshotter.start();

        let (source, injector) = QueuedWalEventSource::new(256);
        let channel = Arc::new(StreamingReplicationChannel::new(
            ChannelConfig {
                publication_name: "ts2any_pub".into(),
                slot_name: "ts2any_slot".into(),
                tombstones: options.tombstones,
            },
            Arc::clone(&dispatcher),
            Arc::clone(&catalog),
            Arc::clone(&context),
            table_filter,
            side_channel.clone() as Arc<dyn SideChannel>,
            Arc::clone(&snapshotter),
            source.clone() as Arc<dyn ts2any_lib::replicationchannel::WalEventSource>,
        ));
        channel.start_replication_channel(Vec::new()).await.unwrap();

        Self {
            dispatcher,
            catalog,
            context,
            emitter,
            sink,
            side_channel,
            source,
            injector,
            channel,
            state,
            snapshotter,
        }
    }

    pub async fn shutdown(&self) {
        self.channel.stop_replication_channel().await.unwrap();
        self.snapshotter.stop().await;
        self.dispatcher.stop().await.unwrap();
    }

    /// Poll until the condition holds or the timeout elapses
    pub async fn wait_until<F>(&self, mut condition: F)
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            if tokio::time::Instant::now() > deadline {
                panic!("condition not met within timeout");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// XLogData positioned at the given LSN
pub fn xld_at(lsn: u64) -> XLogData {
    XLogData::new(Lsn::new(lsn), Lsn::new(lsn), Utc::now())
}

/// Row values out of `(name, json)` pairs
pub fn row(values: &[(&str, Value)]) -> RowValues {
    values
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}
