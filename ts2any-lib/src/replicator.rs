//! Replicator supervisor
//!
//! Owns startup and shutdown ordering. Subsystems start leaves-first with a
//! teardown callback pushed after each successful step; teardown runs the
//! callbacks in reverse insertion order and joins their errors.

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::{exit_codes, ExitError, Result, StreamerError};
use crate::eventemitter::EventEmitter;
use crate::eventfilter::{AcceptAllFilter, EventFilter};
use crate::knowntables::{self, PREVIOUSLY_KNOWN_CHUNKS, PREVIOUSLY_KNOWN_TABLES};
use crate::monitoring::{StatsService, StatsServiceConfig};
use crate::replicaidentity::check_replica_identities;
use crate::replicationchannel::{
    ChannelConfig, QueuedWalEventSource, ReplicationChannel, StreamingReplicationChannel,
    WalEventSource,
};
use crate::replicationcontext::ReplicationContext;
use crate::sidechannel::{PgSideChannel, SideChannel};
use crate::sink::{LoggingSink, Sink};
use crate::snapshotter::{Snapshotter, SnapshotterConfig};
use crate::statestorage::{FileStateStorage, StateStorage, StateStorageManager};
use crate::systemcatalog::SystemCatalog;
use crate::tablefilter::TableFilter;
use crate::topic::{DebeziumNamingStrategy, NameGenerator, NamingStrategy};
use crate::transactionmonitor::TransactionMonitor;
use crate::catalog::{SystemEntity, TIMESCALEDB_CATALOG_SCHEMA, TIMESCALEDB_INTERNAL_SCHEMA};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

type ShutdownTask = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send>;

/// Wiring configuration: the static [`Config`] plus overridable providers
/// for the pluggable boundaries.
pub struct SystemConfig {
    pub config: Config,
    side_channel: Option<Arc<dyn SideChannel>>,
    sink: Option<Arc<dyn Sink>>,
    state_storage: Option<Box<dyn StateStorage>>,
    event_filter: Option<Arc<dyn EventFilter>>,
    naming_strategy: Option<Box<dyn NamingStrategy>>,
    wal_source: Option<Arc<dyn WalEventSource>>,
}

impl SystemConfig {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            side_channel: None,
            sink: None,
            state_storage: None,
            event_filter: None,
            naming_strategy: None,
            wal_source: None,
        }
    }

    pub fn with_side_channel(mut self, side_channel: Arc<dyn SideChannel>) -> Self {
        self.side_channel = Some(side_channel);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_state_storage(mut self, storage: Box<dyn StateStorage>) -> Self {
        self.state_storage = Some(storage);
        self
    }

    pub fn with_event_filter(mut self, filter: Arc<dyn EventFilter>) -> Self {
        self.event_filter = Some(filter);
        self
    }

    pub fn with_naming_strategy(mut self, strategy: Box<dyn NamingStrategy>) -> Self {
        self.naming_strategy = Some(strategy);
        self
    }

    pub fn with_wal_source(mut self, source: Arc<dyn WalEventSource>) -> Self {
        self.wal_source = Some(source);
        self
    }
}

/// Main controller for the replication lifecycle
pub struct Replicator {
    system_config: Mutex<Option<SystemConfig>>,
    shutdown_tasks: Mutex<Vec<ShutdownTask>>,
    context: Mutex<Option<Arc<ReplicationContext>>>,
    injector: Mutex<Option<crate::replicationchannel::WalEventInjector>>,
}

impl Replicator {
    pub fn new(system_config: SystemConfig) -> Self {
        Self {
            system_config: Mutex::new(Some(system_config)),
            shutdown_tasks: Mutex::new(Vec::new()),
            context: Mutex::new(None),
            injector: Mutex::new(None),
        }
    }

    /// Injector for the default queued WAL source; `None` when a custom
    /// source was wired in.
    pub fn wal_event_injector(&self) -> Option<crate::replicationchannel::WalEventInjector> {
        self.injector.lock().unwrap().clone()
    }

    fn push_shutdown_task(&self, task: ShutdownTask) {
        self.shutdown_tasks.lock().unwrap().push(task);
    }

    /// The replication context, available once started
    pub fn replication_context(&self) -> Option<Arc<ReplicationContext>> {
        self.context.lock().unwrap().clone()
    }

    /// Start all subsystems in dependency order. On error the already
    /// started subsystems stay registered for teardown.
    pub async fn start_replication(&self) -> std::result::Result<(), ExitError> {
        let system_config = self
            .system_config
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ExitError::new(StreamerError::fatal("replicator already started"), 1))?;
        let config = system_config.config.clone();

        // Wire the leaves first.
        let state_storage = system_config
            .state_storage
            .unwrap_or_else(|| Box::new(FileStateStorage::new(&config.state_path)));
        let state = Arc::new(StateStorageManager::new(state_storage));
        state
            .start()
            .await
            .map_err(|err| ExitError::new(err, exit_codes::STARTUP_FAILURE))?;
        {
            let state = Arc::clone(&state);
            self.push_shutdown_task(Box::new(move || Box::pin(async move { state.stop().await })));
        }

        let side_channel: Arc<dyn SideChannel> = match system_config.side_channel {
            Some(side_channel) => side_channel,
            None => Arc::new(
                PgSideChannel::connect(&config.connection_string)
                    .await
                    .map_err(|err| ExitError::new(err, exit_codes::STARTUP_FAILURE))?,
            ),
        };

        let table_filter = Arc::new(
            TableFilter::new(
                &config.exclude_patterns,
                &config.include_patterns,
                config.accepted_by_default,
            )
            .map_err(|err| ExitError::new(err, exit_codes::STARTUP_FAILURE))?,
        );

        let naming_strategy = system_config
            .naming_strategy
            .unwrap_or_else(|| Box::new(DebeziumNamingStrategy));
        let name_generator = NameGenerator::new(&config.topic_prefix, naming_strategy);

        let context = Arc::new(ReplicationContext::new(
            name_generator,
            Arc::clone(&side_channel),
            Arc::clone(&state),
        ));
        *self.context.lock().unwrap() = Some(Arc::clone(&context));

        // Stats service and version preflight.
        let stats = Arc::new(StatsService::new(StatsServiceConfig {
            enabled: config.stats_enabled,
            port: config.stats_port,
        }));
        stats
            .start()
            .await
            .map_err(|err| ExitError::new(err, exit_codes::STARTUP_FAILURE))?;
        {
            let stats = Arc::clone(&stats);
            self.push_shutdown_task(Box::new(move || Box::pin(async move { stats.stop().await })));
        }

        let system_information = side_channel
            .read_system_information()
            .await
            .map_err(|err| ExitError::new(err, exit_codes::STARTUP_FAILURE))?;
        if !system_information.is_minimum_postgres_version() {
            return Err(ExitError::new(
                StreamerError::preflight("ts2any requires PostgreSQL 13 or later"),
                exit_codes::POSTGRES_TOO_OLD,
            ));
        }
        if !system_information.is_minimum_timescale_version() {
            return Err(ExitError::new(
                StreamerError::preflight("ts2any requires TimescaleDB 2.10 or later"),
                exit_codes::TIMESCALE_TOO_OLD,
            ));
        }
        if !system_information.is_logical_replication_enabled() {
            return Err(ExitError::new(
                StreamerError::preflight("ts2any requires wal_level set to 'logical'"),
                exit_codes::WAL_LEVEL_NOT_LOGICAL,
            ));
        }

        // Internal dispatching.
        let dispatcher = Arc::new(Dispatcher::new(config.dispatch_queue_size));
        dispatcher.start();
        {
            let dispatcher = Arc::clone(&dispatcher);
            self.push_shutdown_task(Box::new(move || {
                Box::pin(async move { dispatcher.stop().await })
            }));
        }

        // Replication context.
        context.start().await.map_err(|err| {
            ExitError::new(
                StreamerError::fatal(format!("failed to start replication context: {}", err)),
                exit_codes::REPLICATION_CONTEXT_FAILED,
            )
        })?;
        {
            let context = Arc::clone(&context);
            self.push_shutdown_task(Box::new(move || {
                Box::pin(async move { context.stop().await })
            }));
        }

        // Discovery and preflight over the catalog.
        let catalog = Arc::new(
            SystemCatalog::load(side_channel.as_ref())
                .await
                .map_err(|err| ExitError::new(err, exit_codes::STARTUP_FAILURE))?,
        );
        dispatcher.register_handler(catalog.new_handler());

        let hypertables: Vec<_> = catalog.hypertables().iter().map(|h| (**h).clone()).collect();
        let vanilla_tables: Vec<_> = catalog
            .vanilla_tables()
            .iter()
            .map(|t| (**t).clone())
            .collect();
        let issues = check_replica_identities(&hypertables, &vanilla_tables);
        if !issues.is_empty() {
            error!("Replica identity issues found:");
            for issue in &issues {
                error!("\t* {}", issue);
            }
            return Err(ExitError::new(
                StreamerError::preflight("replica identity issues found"),
                exit_codes::STARTUP_FAILURE,
            ));
        }

        let transaction_monitor = Arc::new(TransactionMonitor::new());
        dispatcher.register_handler(
            Arc::clone(&transaction_monitor) as Arc<dyn crate::handlers::ReplicationEventHandler>
        );

        // Event emitter.
        let sink = system_config
            .sink
            .unwrap_or_else(|| Arc::new(LoggingSink) as Arc<dyn Sink>);
        let event_filter = system_config
            .event_filter
            .unwrap_or_else(|| Arc::new(AcceptAllFilter) as Arc<dyn EventFilter>);
        let emitter = Arc::new(EventEmitter::new(
            Arc::clone(&context),
            Arc::clone(&transaction_monitor),
            sink,
            event_filter,
            config.retry_config(),
        ));
        emitter.start().await.map_err(|err| {
            ExitError::new(
                StreamerError::fatal(format!("failed to start event emitter: {}", err)),
                exit_codes::EMITTER_START_FAILED,
            )
        })?;
        dispatcher.register_handler(emitter.new_handler());
        {
            let emitter = Arc::clone(&emitter);
            self.push_shutdown_task(Box::new(move || {
                Box::pin(async move { emitter.stop().await })
            }));
        }

        // Snapshotter.
        let snapshotter = Arc::new(Snapshotter::new(
            SnapshotterConfig {
                workers: config.snapshot_workers,
                batch_size: config.snapshot_batch_size,
            },
            Arc::clone(&side_channel),
            Arc::clone(&dispatcher),
        ));
        snapshotter.start();
        {
            let snapshotter = Arc::clone(&snapshotter);
            self.push_shutdown_task(Box::new(move || {
                Box::pin(async move {
                    snapshotter.stop().await;
                    Ok(())
                })
            }));
        }

        // Durable knowledge of discovered tables is written on the way out.
        {
            let catalog = Arc::clone(&catalog);
            let state = Arc::clone(&state);
            self.push_shutdown_task(Box::new(move || {
                Box::pin(async move {
                    let mut failures = Vec::new();
                    match knowntables::encode(&catalog.all_chunk_entities()) {
                        Ok(encoded) => state.set_encoded_state(PREVIOUSLY_KNOWN_CHUNKS, encoded),
                        Err(err) => failures.push(err.to_string()),
                    }
                    match knowntables::encode(&catalog.all_vanilla_entities()) {
                        Ok(encoded) => state.set_encoded_state(PREVIOUSLY_KNOWN_TABLES, encoded),
                        Err(err) => failures.push(err.to_string()),
                    }
                    if failures.is_empty() {
                        Ok(())
                    } else {
                        Err(StreamerError::Shutdown(failures))
                    }
                })
            }));
        }

        // Initial publication set.
        let published_tables = side_channel
            .read_published_tables(&config.publication_name)
            .await
            .map_err(|err| {
                ExitError::new(
                    StreamerError::fatal(format!("failed to read published tables: {}", err)),
                    exit_codes::KNOWN_TABLES_LOAD_FAILED,
                )
            })?;

        let mut initial_tables = collect_chunks_for_publication(
            state.encoded_state(PREVIOUSLY_KNOWN_CHUNKS),
            catalog.all_chunk_entities(),
            &published_tables,
        )
        .map_err(|err| ExitError::new(err, exit_codes::KNOWN_TABLES_LOAD_FAILED))?;
        initial_tables.extend(
            collect_vanilla_tables_for_publication(
                state.encoded_state(PREVIOUSLY_KNOWN_TABLES),
                catalog.all_vanilla_entities(),
                &published_tables,
            )
            .map_err(|err| ExitError::new(err, exit_codes::KNOWN_TABLES_LOAD_FAILED))?,
        );

        // Replication channel. Without an explicit WAL source a queued
        // source is created and its injector kept for the embedder.
        let wal_source = match system_config.wal_source {
            Some(source) => source,
            None => {
                let (source, injector) = QueuedWalEventSource::new(config.dispatch_queue_size);
                *self.injector.lock().unwrap() = Some(injector);
                source as Arc<dyn WalEventSource>
            }
        };
        let channel: Arc<dyn ReplicationChannel> = Arc::new(StreamingReplicationChannel::new(
            ChannelConfig {
                publication_name: config.publication_name.clone(),
                slot_name: config.slot_name.clone(),
                tombstones: config.tombstones,
            },
            Arc::clone(&dispatcher),
            Arc::clone(&catalog),
            Arc::clone(&context),
            Arc::clone(&table_filter),
            Arc::clone(&side_channel),
            Arc::clone(&snapshotter),
            wal_source,
        ));
        channel
            .start_replication_channel(initial_tables)
            .await
            .map_err(|err| match err {
                StreamerError::NoRestartPoint(slot) => ExitError::new(
                    StreamerError::NoRestartPoint(format!(
                        "{}: cannot resume, replicated data would have gaps",
                        slot
                    )),
                    exit_codes::NO_RESTART_POINT,
                ),
                other => ExitError::new(other, exit_codes::STARTUP_FAILURE),
            })?;
        {
            let channel = Arc::clone(&channel);
            self.push_shutdown_task(Box::new(move || {
                Box::pin(async move { channel.stop_replication_channel().await })
            }));
        }

        info!("Replication started");
        Ok(())
    }

    /// Clean shutdown: run teardown callbacks in reverse insertion order,
    /// collecting errors. Blocks until everything finished.
    pub async fn stop_replication(&self) -> std::result::Result<(), ExitError> {
        let mut tasks: Vec<ShutdownTask> = self.shutdown_tasks.lock().unwrap().drain(..).collect();
        let mut failures = Vec::new();
        while let Some(task) = tasks.pop() {
            if let Err(err) = task().await {
                failures.push(err.to_string());
            }
        }
        if failures.is_empty() {
            info!("Replication stopped");
            Ok(())
        } else {
            Err(ExitError::new(
                StreamerError::Shutdown(failures),
                exit_codes::SHUTDOWN_ERRORS,
            ))
        }
    }
}

/// Chunks to add to the publication: the durably known set filtered to the
/// live catalog, minus chunks already published.
pub fn collect_chunks_for_publication(
    encoded_state: Option<Vec<u8>>,
    live_chunks: Vec<SystemEntity>,
    published_tables: &[SystemEntity],
) -> Result<Vec<SystemEntity>> {
    let known = restrict_to_live(encoded_state, live_chunks)?;
    let published: Vec<_> = published_tables
        .iter()
        .filter(|entity| entity.schema_name() == TIMESCALEDB_INTERNAL_SCHEMA)
        .collect();
    Ok(known
        .into_iter()
        .filter(|candidate| {
            !published
                .iter()
                .any(|existing| existing.canonical_name() == candidate.canonical_name())
        })
        .collect())
}

/// Vanilla tables to add to the publication, analogous to the chunk set
pub fn collect_vanilla_tables_for_publication(
    encoded_state: Option<Vec<u8>>,
    live_tables: Vec<SystemEntity>,
    published_tables: &[SystemEntity],
) -> Result<Vec<SystemEntity>> {
    let known = restrict_to_live(encoded_state, live_tables)?;
    let published: Vec<_> = published_tables
        .iter()
        .filter(|entity| {
            entity.schema_name() != TIMESCALEDB_INTERNAL_SCHEMA
                && entity.schema_name() != TIMESCALEDB_CATALOG_SCHEMA
        })
        .collect();
    Ok(known
        .into_iter()
        .filter(|candidate| {
            !published
                .iter()
                .any(|existing| existing.canonical_name() == candidate.canonical_name())
        })
        .collect())
}

/// The durable set only counts entities the live catalog still reports;
/// with no durable state the live set is used as-is.
fn restrict_to_live(
    encoded_state: Option<Vec<u8>>,
    live: Vec<SystemEntity>,
) -> Result<Vec<SystemEntity>> {
    let Some(encoded) = encoded_state else {
        return Ok(live);
    };
    let candidates = knowntables::decode(&encoded)?;
    Ok(candidates
        .into_iter()
        .filter(|candidate| {
            live.iter()
                .any(|entity| entity.canonical_name() == candidate.canonical_name())
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(schema: &str, table: &str) -> SystemEntity {
        SystemEntity::new(schema, table)
    }

    #[test]
    fn test_chunks_without_state_use_live_catalog() {
        let live = vec![entity(TIMESCALEDB_INTERNAL_SCHEMA, "_hyper_1_1_chunk")];
        let initial = collect_chunks_for_publication(None, live.clone(), &[]).unwrap();
        assert_eq!(initial, live);
    }

    #[test]
    fn test_known_chunks_filtered_against_live_catalog() {
        let known = vec![
            entity(TIMESCALEDB_INTERNAL_SCHEMA, "_hyper_1_1_chunk"),
            entity(TIMESCALEDB_INTERNAL_SCHEMA, "_hyper_1_2_chunk"),
        ];
        let encoded = knowntables::encode(&known).unwrap();
        // Chunk 2 disappeared upstream.
        let live = vec![entity(TIMESCALEDB_INTERNAL_SCHEMA, "_hyper_1_1_chunk")];

        let initial = collect_chunks_for_publication(Some(encoded), live.clone(), &[]).unwrap();
        assert_eq!(initial, live);
    }

    #[test]
    fn test_published_chunks_are_excluded() {
        let live = vec![
            entity(TIMESCALEDB_INTERNAL_SCHEMA, "_hyper_1_1_chunk"),
            entity(TIMESCALEDB_INTERNAL_SCHEMA, "_hyper_1_2_chunk"),
        ];
        let published = vec![entity(TIMESCALEDB_INTERNAL_SCHEMA, "_hyper_1_1_chunk")];
        let initial = collect_chunks_for_publication(None, live, &published).unwrap();
        assert_eq!(
            initial,
            vec![entity(TIMESCALEDB_INTERNAL_SCHEMA, "_hyper_1_2_chunk")]
        );
    }

    #[test]
    fn test_vanilla_ignores_timescale_publication_entries() {
        let live = vec![entity("public", "users")];
        // Published chunk entries must not mask vanilla tables.
        let published = vec![entity(TIMESCALEDB_INTERNAL_SCHEMA, "_hyper_1_1_chunk")];
        let initial =
            collect_vanilla_tables_for_publication(None, live.clone(), &published).unwrap();
        assert_eq!(initial, live);
    }

    #[test]
    fn test_corrupt_state_fails_load() {
        let result = collect_chunks_for_publication(
            Some(vec![0xFF, 0x00]),
            vec![entity(TIMESCALEDB_INTERNAL_SCHEMA, "_hyper_1_1_chunk")],
            &[],
        );
        assert!(result.is_err());
    }
}
