//! Envelope schema model and event payload constructors
//!
//! Schemas are plain `serde_json` values built deterministically from the
//! catalog metadata; there is no hidden identity, caching happens by name in
//! the schema registry. The layout follows the Debezium envelope convention:
//! a `schema` describing the value and a `payload` carrying it.

use crate::catalog::{Column, Columns, TrackedTable};
use crate::types::{oids, Lsn};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

/// A schema or payload fragment
pub type Struct = Value;

/// Operation codes carried in the envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Create,
    Update,
    Delete,
    Truncate,
    Message,
    Compression,
    Decompression,
}

impl Operation {
    pub fn code(&self) -> &'static str {
        match self {
            Operation::Read => "r",
            Operation::Create => "c",
            Operation::Update => "u",
            Operation::Delete => "d",
            Operation::Truncate => "t",
            Operation::Message => "m",
            Operation::Compression => "compress",
            Operation::Decompression => "decompress",
        }
    }
}

/// Schema name for logical message keys, shared across all message events
pub const MESSAGE_KEY_SCHEMA_NAME: &str = "ts2any.messages.key";
/// Schema name for administrative event keys
pub const TIMESCALE_KEY_SCHEMA_NAME: &str = "ts2any.timescaledb.key";

/// Map a PostgreSQL type OID onto the envelope field type vocabulary
fn field_type_for_oid(oid: u32) -> &'static str {
    match oid {
        oids::BOOL => "boolean",
        oids::INT2 => "int16",
        oids::INT4 => "int32",
        oids::INT8 => "int64",
        oids::FLOAT4 => "float",
        oids::FLOAT8 => "double",
        oids::BYTEA => "bytes",
        _ => "string",
    }
}

fn field(name: &str, field_type: &str, optional: bool) -> Value {
    json!({
        "field": name,
        "type": field_type,
        "optional": optional,
    })
}

fn column_field(column: &Column) -> Value {
    field(
        column.name(),
        field_type_for_oid(column.data_type()),
        column.is_nullable(),
    )
}

/// Schema of the `source` block present in every envelope
pub fn source_schema() -> Struct {
    json!({
        "type": "struct",
        "name": "ts2any.source",
        "optional": false,
        "fields": [
            field("lsn", "string", false),
            field("ts_ms", "int64", false),
            field("snapshot", "boolean", false),
            field("db", "string", false),
            field("schema", "string", false),
            field("table", "string", false),
            field("txId", "int64", true),
        ],
    })
}

/// The `source` payload for a row or administrative event
#[allow(clippy::too_many_arguments)]
pub fn source(
    lsn: Lsn,
    ts: DateTime<Utc>,
    snapshot: bool,
    db: &str,
    schema_name: &str,
    table_name: &str,
    transaction_id: Option<u32>,
) -> Struct {
    json!({
        "lsn": lsn.to_string(),
        "ts_ms": ts.timestamp_millis(),
        "snapshot": snapshot,
        "db": db,
        "schema": schema_name,
        "table": table_name,
        "txId": transaction_id,
    })
}

/// Row-shaped sub-schema for `before`/`after` blocks
fn row_schema(schema_topic_name: &str, columns: &[Column]) -> Struct {
    json!({
        "type": "struct",
        "name": format!("{}.Value", schema_topic_name),
        "optional": true,
        "fields": columns.iter().map(column_field).collect::<Vec<_>>(),
    })
}

/// Full value envelope schema for a tracked table
pub fn envelope_schema(schema_topic_name: &str, table: &TrackedTable) -> Struct {
    let mut before = row_schema(schema_topic_name, table.columns());
    let mut after = before.clone();
    before["field"] = json!("before");
    after["field"] = json!("after");

    let mut src = source_schema();
    src["field"] = json!("source");

    json!({
        "type": "struct",
        "name": format!("{}.Envelope", schema_topic_name),
        "optional": false,
        "fields": [
            before,
            after,
            src,
            field("op", "string", false),
            field("ts_ms", "int64", true),
        ],
    })
}

/// Key schema built from the table's key columns
pub fn key_schema(schema_topic_name: &str, table: &TrackedTable) -> Struct {
    json!({
        "type": "struct",
        "name": format!("{}.Key", schema_topic_name),
        "optional": false,
        "fields": table
            .columns()
            .key_columns()
            .into_iter()
            .map(column_field)
            .collect::<Vec<_>>(),
    })
}

/// Value envelope schema for logical message events
pub fn message_envelope_schema() -> Struct {
    let mut src = source_schema();
    src["field"] = json!("source");
    json!({
        "type": "struct",
        "name": "ts2any.messages.Envelope",
        "optional": false,
        "fields": [
            field("prefix", "string", false),
            field("content", "string", false),
            src,
            field("op", "string", false),
            field("ts_ms", "int64", true),
        ],
    })
}

/// Key schema for logical message events
pub fn message_key_schema() -> Struct {
    json!({
        "type": "struct",
        "name": MESSAGE_KEY_SCHEMA_NAME,
        "optional": false,
        "fields": [field("prefix", "string", false)],
    })
}

/// Key schema for administrative (compression) events
pub fn timescale_key_schema() -> Struct {
    json!({
        "type": "struct",
        "name": TIMESCALE_KEY_SCHEMA_NAME,
        "optional": false,
        "fields": [
            field("schema", "string", false),
            field("table", "string", false),
        ],
    })
}

fn event_base(op: Operation, source: Struct) -> Map<String, Value> {
    let ts_ms = source.get("ts_ms").cloned().unwrap_or(Value::Null);
    let mut payload = Map::new();
    payload.insert("op".to_string(), json!(op.code()));
    payload.insert("ts_ms".to_string(), ts_ms);
    payload.insert("source".to_string(), source);
    payload
}

/// Snapshot read: `after` only
pub fn read_event(after: Option<Struct>, source: Struct) -> Struct {
    let mut payload = event_base(Operation::Read, source);
    payload.insert("before".to_string(), Value::Null);
    payload.insert("after".to_string(), after.unwrap_or(Value::Null));
    Value::Object(payload)
}

/// Insert: `after` only
pub fn create_event(after: Option<Struct>, source: Struct) -> Struct {
    let mut payload = event_base(Operation::Create, source);
    payload.insert("before".to_string(), Value::Null);
    payload.insert("after".to_string(), after.unwrap_or(Value::Null));
    Value::Object(payload)
}

/// Update: `before` carries whatever subset of columns the replica identity
/// reported, never synthesised nulls.
pub fn update_event(before: Option<Struct>, after: Option<Struct>, source: Struct) -> Struct {
    let mut payload = event_base(Operation::Update, source);
    payload.insert("before".to_string(), before.unwrap_or(Value::Null));
    payload.insert("after".to_string(), after.unwrap_or(Value::Null));
    Value::Object(payload)
}

/// Delete: `before` only
pub fn delete_event(before: Option<Struct>, source: Struct) -> Struct {
    let mut payload = event_base(Operation::Delete, source);
    payload.insert("before".to_string(), before.unwrap_or(Value::Null));
    payload.insert("after".to_string(), Value::Null);
    Value::Object(payload)
}

/// Truncate: no payload columns
pub fn truncate_event(source: Struct) -> Struct {
    Value::Object(event_base(Operation::Truncate, source))
}

/// Logical replication message with base64-encoded content
pub fn message_event(prefix: &str, content_b64: &str, source: Struct) -> Struct {
    let mut payload = event_base(Operation::Message, source);
    payload.insert("prefix".to_string(), json!(prefix));
    payload.insert("content".to_string(), json!(content_b64));
    Value::Object(payload)
}

/// Chunk compression notification
pub fn compression_event(source: Struct) -> Struct {
    Value::Object(event_base(Operation::Compression, source))
}

/// Chunk decompression notification
pub fn decompression_event(source: Struct) -> Struct {
    Value::Object(event_base(Operation::Decompression, source))
}

/// Key payload for logical message events
pub fn message_key(prefix: &str) -> Struct {
    json!({ "prefix": prefix })
}

/// Key payload for administrative events
pub fn timescale_key(schema_name: &str, table_name: &str) -> Struct {
    json!({ "schema": schema_name, "table": table_name })
}

/// Wrap a schema and payload into the outer envelope
pub fn envelope(schema: Struct, payload: Struct) -> Struct {
    json!({ "schema": schema, "payload": payload })
}
