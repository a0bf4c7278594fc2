//! Replicator supervisor tests: startup ordering, preflight exit codes,
//! initial publication set and teardown state persistence

mod common;

use common::{MockSideChannel, RecordingSink};
use std::collections::HashMap;
use std::sync::Arc;
use ts2any_lib::catalog::{SystemEntity, TIMESCALEDB_INTERNAL_SCHEMA};
use ts2any_lib::config::Config;
use ts2any_lib::error::exit_codes;
use ts2any_lib::knowntables::{self, PREVIOUSLY_KNOWN_CHUNKS, PREVIOUSLY_KNOWN_TABLES};
use ts2any_lib::replicationchannel::{QueuedWalEventSource, WalEventSource};
use ts2any_lib::replicator::{Replicator, SystemConfig};
use ts2any_lib::sidechannel::SideChannel;
use ts2any_lib::sink::Sink;
use ts2any_lib::statestorage::{MemoryStateStorage, StateStorage};
use ts2any_lib::types::Lsn;

fn test_config() -> Config {
    Config::builder()
        .connection_string("postgresql://ignored-by-mocks")
        .topic_prefix("prefix")
        .include_patterns(vec!["public.*".to_string()])
        .accepted_by_default(false)
        .stats_enabled(false)
        .build()
        .unwrap()
}

fn wired(
    side_channel: Arc<MockSideChannel>,
    storage: Arc<MemoryStateStorage>,
) -> (SystemConfig, Arc<QueuedWalEventSource>) {
    let (source, _injector) = QueuedWalEventSource::new(64);
    let system_config = SystemConfig::new(test_config())
        .with_side_channel(side_channel as Arc<dyn SideChannel>)
        .with_state_storage(Box::new(storage))
        .with_sink(RecordingSink::new() as Arc<dyn Sink>)
        .with_wal_source(source.clone() as Arc<dyn WalEventSource>);
    (system_config, source)
}

#[tokio::test]
async fn test_clean_start_and_stop_persists_known_tables() {
    let side_channel = MockSideChannel::new();
    let storage = Arc::new(MemoryStateStorage::new());
    let (system_config, _source) = wired(side_channel, Arc::clone(&storage));

    let replicator = Replicator::new(system_config);
    replicator.start_replication().await.unwrap();
    replicator.stop_replication().await.unwrap();

    let persisted = storage.load().await.unwrap();
    let chunks = knowntables::decode(persisted.get(PREVIOUSLY_KNOWN_CHUNKS).unwrap()).unwrap();
    assert_eq!(
        chunks,
        vec![SystemEntity::new(
            TIMESCALEDB_INTERNAL_SCHEMA,
            "_hyper_1_1_chunk"
        )]
    );
    let tables = knowntables::decode(persisted.get(PREVIOUSLY_KNOWN_TABLES).unwrap()).unwrap();
    assert_eq!(tables, vec![SystemEntity::new("public", "users")]);
}

#[tokio::test]
async fn test_initial_publication_set_excludes_already_published() {
    let side_channel = MockSideChannel::new();
    // The single live chunk is already published; users is not.
    side_channel.published.lock().unwrap().push(SystemEntity::new(
        TIMESCALEDB_INTERNAL_SCHEMA,
        "_hyper_1_1_chunk",
    ));
    let storage = Arc::new(MemoryStateStorage::new());
    let (system_config, _source) = wired(Arc::clone(&side_channel), storage);

    let replicator = Replicator::new(system_config);
    replicator.start_replication().await.unwrap();

    let attached = side_channel.attached_entities();
    assert_eq!(attached, vec![SystemEntity::new("public", "users")]);

    replicator.stop_replication().await.unwrap();
}

#[tokio::test]
async fn test_known_chunks_state_restricts_to_live_catalog() {
    let side_channel = MockSideChannel::new();
    let mut entries = HashMap::new();
    // The durable set names a chunk the live catalog no longer has.
    entries.insert(
        PREVIOUSLY_KNOWN_CHUNKS.to_string(),
        knowntables::encode(&[
            SystemEntity::new(TIMESCALEDB_INTERNAL_SCHEMA, "_hyper_1_1_chunk"),
            SystemEntity::new(TIMESCALEDB_INTERNAL_SCHEMA, "_hyper_9_9_chunk"),
        ])
        .unwrap(),
    );
    let storage = Arc::new(MemoryStateStorage::with_entries(entries));
    let (system_config, _source) = wired(Arc::clone(&side_channel), storage);

    let replicator = Replicator::new(system_config);
    replicator.start_replication().await.unwrap();

    let attached = side_channel.attached_entities();
    assert!(attached.contains(&SystemEntity::new(
        TIMESCALEDB_INTERNAL_SCHEMA,
        "_hyper_1_1_chunk"
    )));
    assert!(!attached
        .iter()
        .any(|entity| entity.table_name() == "_hyper_9_9_chunk"));

    replicator.stop_replication().await.unwrap();
}

#[tokio::test]
async fn test_postgres_too_old_aborts_with_exit_code_11() {
    let side_channel = MockSideChannel::new();
    side_channel.system_information.lock().unwrap().postgres_version = 120_015;
    let storage = Arc::new(MemoryStateStorage::new());
    let (system_config, _source) = wired(side_channel, storage);

    let replicator = Replicator::new(system_config);
    let err = replicator.start_replication().await.unwrap_err();
    assert_eq!(err.code, exit_codes::POSTGRES_TOO_OLD);
    let _ = replicator.stop_replication().await;
}

#[tokio::test]
async fn test_timescale_too_old_aborts_with_exit_code_12() {
    let side_channel = MockSideChannel::new();
    side_channel.system_information.lock().unwrap().timescale_version = "2.9.1".into();
    let storage = Arc::new(MemoryStateStorage::new());
    let (system_config, _source) = wired(side_channel, storage);

    let replicator = Replicator::new(system_config);
    let err = replicator.start_replication().await.unwrap_err();
    assert_eq!(err.code, exit_codes::TIMESCALE_TOO_OLD);
    let _ = replicator.stop_replication().await;
}

#[tokio::test]
async fn test_wrong_wal_level_aborts_with_exit_code_16() {
    let side_channel = MockSideChannel::new();
    side_channel.system_information.lock().unwrap().wal_level = "replica".into();
    let storage = Arc::new(MemoryStateStorage::new());
    let (system_config, _source) = wired(side_channel, storage);

    let replicator = Replicator::new(system_config);
    let err = replicator.start_replication().await.unwrap_err();
    assert_eq!(err.code, exit_codes::WAL_LEVEL_NOT_LOGICAL);
    let _ = replicator.stop_replication().await;
}

#[tokio::test]
async fn test_slot_without_restart_lsn_aborts_with_exit_code_30() {
    let side_channel = MockSideChannel::new();
    if let Some(slot) = side_channel.slot.lock().unwrap().as_mut() {
        slot.restart_lsn = None;
    }
    let storage = Arc::new(MemoryStateStorage::new());
    let (system_config, _source) = wired(side_channel, storage);

    let replicator = Replicator::new(system_config);
    let err = replicator.start_replication().await.unwrap_err();
    assert_eq!(err.code, exit_codes::NO_RESTART_POINT);
    let _ = replicator.stop_replication().await;
}

#[tokio::test]
async fn test_acknowledgements_reach_the_wal_source() {
    let side_channel = MockSideChannel::new();
    let storage = Arc::new(MemoryStateStorage::new());
    let (system_config, source) = wired(side_channel, storage);

    let replicator = Replicator::new(system_config);
    replicator.start_replication().await.unwrap();

    let context = replicator.replication_context().unwrap();
    context
        .acknowledge_processed(ts2any_lib::types::XLogData::synthetic(Lsn::new(77)))
        .await
        .unwrap();
    assert_eq!(source.last_acknowledged(), Lsn::new(77));
    assert_eq!(context.last_acknowledged(), Lsn::new(77));

    replicator.stop_replication().await.unwrap();
}
