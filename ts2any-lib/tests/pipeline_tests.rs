//! End-to-end pipeline tests: queued WAL source → channel → dispatcher →
//! emitter → recording sink

mod common;

use common::{row, xld_at, HarnessOptions, TestHarness};
use serde_json::{json, Value};
use std::sync::Arc;
use ts2any_lib::catalog::{SystemEntity, TrackedTable, TIMESCALEDB_INTERNAL_SCHEMA};
use ts2any_lib::dispatcher::{task, HypertableEvent};
use ts2any_lib::replicationchannel::ReplicationMessage;
use ts2any_lib::sink::SinkContext;
use ts2any_lib::types::{LogicalMessage, Lsn};

fn chunk_entity() -> SystemEntity {
    SystemEntity::new(TIMESCALEDB_INTERNAL_SCHEMA, "_hyper_1_1_chunk")
}

fn begin(transaction_id: u32) -> ReplicationMessage {
    ReplicationMessage::Begin {
        transaction_id,
        commit_time: chrono::Utc::now(),
        final_lsn: Lsn::new(999),
    }
}

#[tokio::test]
async fn test_insert_is_emitted_with_envelope_and_acknowledged() {
    let harness = TestHarness::start(HarnessOptions::default()).await;

    harness.injector.inject(xld_at(90), begin(42)).await.unwrap();
    harness
        .injector
        .inject(
            xld_at(100),
            ReplicationMessage::Insert {
                entity: chunk_entity(),
                new_values: row(&[("id", json!("7")), ("v", json!("1.5"))]),
            },
        )
        .await
        .unwrap();

    harness.wait_until(|| harness.sink.calls().len() == 1).await;
    let call = &harness.sink.calls()[0];

    assert_eq!(call.topic, "prefix.public.metrics");
    assert_eq!(call.key["payload"]["id"], 7);
    assert_eq!(call.key["schema"]["name"], "prefix.public.metrics.Key");

    let payload = &call.value["payload"];
    assert_eq!(payload["op"], "c");
    assert_eq!(payload["before"], Value::Null);
    assert_eq!(payload["after"]["id"], 7);
    assert_eq!(payload["after"]["v"], 1.5);
    assert_eq!(payload["source"]["lsn"], "0/64");
    assert_eq!(payload["source"]["snapshot"], false);
    assert_eq!(payload["source"]["db"], "tsdb");
    assert_eq!(payload["source"]["schema"], "public");
    assert_eq!(payload["source"]["table"], "metrics");
    assert_eq!(payload["source"]["txId"], 42);

    harness
        .wait_until(|| harness.source.acknowledgements().contains(&Lsn::new(100)))
        .await;
    harness.shutdown().await;
}

#[tokio::test]
async fn test_excluded_table_is_dropped_but_acknowledged() {
    let harness = TestHarness::start(HarnessOptions {
        excludes: vec!["public.metrics".to_string()],
        ..Default::default()
    })
    .await;

    harness
        .injector
        .inject(
            xld_at(100),
            ReplicationMessage::Insert {
                entity: chunk_entity(),
                new_values: row(&[("id", json!("7")), ("v", json!("1.5"))]),
            },
        )
        .await
        .unwrap();

    harness
        .wait_until(|| harness.source.acknowledgements().contains(&Lsn::new(100)))
        .await;
    assert!(harness.sink.calls().is_empty());
    harness.shutdown().await;
}

#[tokio::test]
async fn test_vanilla_table_events_flow_through() {
    let harness = TestHarness::start(HarnessOptions::default()).await;

    harness
        .injector
        .inject(
            xld_at(110),
            ReplicationMessage::Insert {
                entity: SystemEntity::new("public", "users"),
                new_values: row(&[("id", json!("3")), ("name", json!("ada"))]),
            },
        )
        .await
        .unwrap();

    harness.wait_until(|| harness.sink.calls().len() == 1).await;
    let call = &harness.sink.calls()[0];
    assert_eq!(call.topic, "prefix.public.users");
    assert_eq!(call.value["payload"]["after"]["name"], "ada");
    harness.shutdown().await;
}

#[tokio::test]
async fn test_update_keeps_partial_before_image() {
    let harness = TestHarness::start(HarnessOptions::default()).await;

    // DEFAULT replica identity: before image carries only the key column.
    harness
        .injector
        .inject(
            xld_at(120),
            ReplicationMessage::Update {
                entity: chunk_entity(),
                old_values: Some(row(&[("id", json!("7"))])),
                new_values: row(&[("id", json!("7")), ("v", json!("2.5"))]),
            },
        )
        .await
        .unwrap();

    harness.wait_until(|| harness.sink.calls().len() == 1).await;
    let payload = &harness.sink.calls()[0].value["payload"];
    assert_eq!(payload["op"], "u");
    assert_eq!(payload["before"]["id"], 7);
    assert!(payload["before"].get("v").is_none());
    assert_eq!(payload["after"]["v"], 2.5);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_delete_with_tombstone_emits_two_calls() {
    let harness = TestHarness::start(HarnessOptions {
        tombstones: true,
        ..Default::default()
    })
    .await;

    harness
        .injector
        .inject(
            xld_at(130),
            ReplicationMessage::Delete {
                entity: chunk_entity(),
                old_values: row(&[("id", json!("7"))]),
            },
        )
        .await
        .unwrap();

    harness.wait_until(|| harness.sink.calls().len() == 2).await;
    let calls = harness.sink.calls();
    assert_eq!(calls[0].value["payload"]["op"], "d");
    assert_eq!(calls[1].value, Value::Null);
    assert_eq!(calls[0].key, calls[1].key);
    // One logical event, one acknowledgement.
    harness
        .wait_until(|| harness.source.acknowledgements() == vec![Lsn::new(130)])
        .await;
    harness.shutdown().await;
}

#[tokio::test]
async fn test_sink_retries_until_success_then_acknowledges_once() {
    let harness = TestHarness::start(HarnessOptions {
        sink_failures: 3,
        ..Default::default()
    })
    .await;

    harness
        .injector
        .inject(
            xld_at(140),
            ReplicationMessage::Insert {
                entity: chunk_entity(),
                new_values: row(&[("id", json!("1")), ("v", json!("0.5"))]),
            },
        )
        .await
        .unwrap();

    harness.wait_until(|| harness.sink.calls().len() == 1).await;
    assert_eq!(harness.sink.attempts(), 4);

    harness
        .wait_until(|| !harness.source.acknowledgements().is_empty())
        .await;
    let acks: Vec<_> = harness
        .source
        .acknowledgements()
        .into_iter()
        .filter(|lsn| *lsn == Lsn::new(140))
        .collect();
    assert_eq!(acks.len(), 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_snapshot_read_event_is_marked_snapshot() {
    let harness = TestHarness::start(HarnessOptions::default()).await;

    let table = TrackedTable::Hypertable(Arc::new(common::MockSideChannel::metrics_hypertable()));
    let event = HypertableEvent::Read {
        lsn: Lsn::INVALID,
        table,
        chunk: Some(common::MockSideChannel::metrics_chunk()),
        new_values: row(&[("id", json!("1")), ("v", json!("2.0"))]),
    };
    harness
        .dispatcher
        .enqueue(task(move |n| async move {
            n.notify_hypertable_handlers(&event).await;
        }))
        .await
        .unwrap();

    harness.wait_until(|| harness.sink.calls().len() == 1).await;
    let payload = &harness.sink.calls()[0].value["payload"];
    assert_eq!(payload["op"], "r");
    assert_eq!(payload["source"]["snapshot"], true);
    assert_eq!(payload["source"]["lsn"], "0/0");
    harness.shutdown().await;
}

#[tokio::test]
async fn test_logical_message_event() {
    let harness = TestHarness::start(HarnessOptions::default()).await;

    harness
        .injector
        .inject(
            xld_at(150),
            ReplicationMessage::Message(LogicalMessage::new("wmsg", b"hello".to_vec(), false)),
        )
        .await
        .unwrap();

    harness.wait_until(|| harness.sink.calls().len() == 1).await;
    let call = &harness.sink.calls()[0];
    assert_eq!(call.topic, "prefix.message");
    let payload = &call.value["payload"];
    assert_eq!(payload["op"], "m");
    assert_eq!(payload["prefix"], "wmsg");
    assert_eq!(payload["content"], "aGVsbG8=");
    // Non-transactional messages have no transaction id.
    assert_eq!(payload["source"]["txId"], Value::Null);
    assert_eq!(call.key["payload"]["prefix"], "wmsg");
    harness.shutdown().await;
}

#[tokio::test]
async fn test_chunk_compression_event_uses_table_identity_key() {
    let harness = TestHarness::start(HarnessOptions::default()).await;

    harness
        .injector
        .inject(
            xld_at(160),
            ReplicationMessage::ChunkCompressed {
                chunk: chunk_entity(),
            },
        )
        .await
        .unwrap();

    harness.wait_until(|| harness.sink.calls().len() == 1).await;
    let call = &harness.sink.calls()[0];
    assert_eq!(call.value["payload"]["op"], "compress");
    assert_eq!(call.key["payload"]["schema"], "public");
    assert_eq!(call.key["payload"]["table"], "metrics");
    harness.shutdown().await;
}

#[tokio::test]
async fn test_per_topic_lsn_ordering_is_preserved() {
    let harness = TestHarness::start(HarnessOptions::default()).await;

    for lsn in [100u64, 110, 120, 130] {
        harness
            .injector
            .inject(
                xld_at(lsn),
                ReplicationMessage::Insert {
                    entity: chunk_entity(),
                    new_values: row(&[("id", json!(lsn.to_string())), ("v", json!("1.0"))]),
                },
            )
            .await
            .unwrap();
    }

    harness.wait_until(|| harness.sink.calls().len() == 4).await;
    let lsns: Vec<String> = harness
        .sink
        .calls()
        .iter()
        .map(|call| call.value["payload"]["source"]["lsn"].as_str().unwrap().to_string())
        .collect();
    let mut sorted = lsns.clone();
    sorted.sort();
    assert_eq!(lsns, sorted);

    // Acks follow emission order and never outrun the emitted positions.
    let acks = harness.source.acknowledgements();
    let mut sorted_acks = acks.clone();
    sorted_acks.sort();
    assert_eq!(acks, sorted_acks);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_new_chunk_discovery_attaches_and_resolves() {
    let harness = TestHarness::start(HarnessOptions::default()).await;

    harness
        .injector
        .inject(
            xld_at(200),
            ReplicationMessage::Insert {
                entity: SystemEntity::new("_timescaledb_catalog", "chunk"),
                new_values: row(&[
                    ("id", json!("12")),
                    ("hypertable_id", json!("1")),
                    ("schema_name", json!(TIMESCALEDB_INTERNAL_SCHEMA)),
                    ("table_name", json!("_hyper_1_2_chunk")),
                    ("status", json!("0")),
                    ("dropped", json!("f")),
                ]),
            },
        )
        .await
        .unwrap();

    let new_chunk = SystemEntity::new(TIMESCALEDB_INTERNAL_SCHEMA, "_hyper_1_2_chunk");
    harness
        .wait_until(|| harness.side_channel.attached_entities().contains(&new_chunk))
        .await;

    // Events on the discovered chunk resolve to the hypertable.
    harness
        .injector
        .inject(
            xld_at(210),
            ReplicationMessage::Insert {
                entity: new_chunk,
                new_values: row(&[("id", json!("9")), ("v", json!("3.0"))]),
            },
        )
        .await
        .unwrap();

    harness
        .wait_until(|| {
            harness
                .sink
                .calls()
                .iter()
                .any(|call| call.value["payload"]["after"]["id"] == 9)
        })
        .await;
    harness.shutdown().await;
}

#[tokio::test]
async fn test_persistent_sink_context_is_restored() {
    let seeded = SinkContext::new();
    seeded.set_attribute("region", "eu");
    let mut initial_state = std::collections::HashMap::new();
    initial_state.insert(
        ts2any_lib::sink::SINK_CONTEXT_STATE_NAME.to_string(),
        seeded.marshal().unwrap(),
    );

    let harness = TestHarness::start(HarnessOptions {
        initial_state,
        ..Default::default()
    })
    .await;

    assert_eq!(
        harness.emitter.sink_context().attribute("region").as_deref(),
        Some("eu")
    );
    harness.shutdown().await;
}
