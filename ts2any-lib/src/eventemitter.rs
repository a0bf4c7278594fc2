//! Event emission pipeline
//!
//! Receives decoded events from the dispatcher, builds key and value
//! envelopes, runs the event filter, pushes accepted envelopes to the sink
//! under bounded retry, and acknowledges the WAL position once the event is
//! either delivered or intentionally dropped.

use crate::catalog::{Chunk, Column, Columns, TrackedTable};
use crate::error::Result;
use crate::eventfilter::EventFilter;
use crate::handlers::{
    HypertableEventHandler, LogicalEventHandler, ReplicationEventHandler, RowValues,
};
use crate::monitoring::metrics;
use crate::replicationcontext::ReplicationContext;
use crate::retry::{retry_bounded, RetryConfig};
use crate::schema::{self, Struct, MESSAGE_KEY_SCHEMA_NAME};
use crate::sink::{Sink, SinkContext, SINK_CONTEXT_STATE_NAME};
use crate::transactionmonitor::TransactionMonitor;
use crate::typeconverter::convert_value;
use crate::types::{LogicalMessage, Lsn, XLogData};
use base64::Engine;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

pub struct EventEmitter {
    context: Arc<ReplicationContext>,
    transaction_monitor: Arc<TransactionMonitor>,
    filter: Arc<dyn EventFilter>,
    sink: Arc<dyn Sink>,
    sink_context: Arc<SinkContext>,
    retry_config: RetryConfig,
}

impl EventEmitter {
    pub fn new(
        context: Arc<ReplicationContext>,
        transaction_monitor: Arc<TransactionMonitor>,
        sink: Arc<dyn Sink>,
        filter: Arc<dyn EventFilter>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            context,
            transaction_monitor,
            filter,
            sink,
            sink_context: Arc::new(SinkContext::new()),
            retry_config,
        }
    }

    /// Restore the persistent sink context from durable state when present,
    /// otherwise register the encoder so the next checkpoint captures it.
    pub async fn start(&self) -> Result<()> {
        self.context
            .register_schema(MESSAGE_KEY_SCHEMA_NAME, schema::message_key_schema());

        if let Some(state) = self.context.encoded_state(SINK_CONTEXT_STATE_NAME) {
            return self.sink_context.unmarshal(&state);
        }
        let sink_context = Arc::clone(&self.sink_context);
        self.context.register_state_encoder(
            SINK_CONTEXT_STATE_NAME,
            Box::new(move || sink_context.marshal()),
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        Ok(())
    }

    pub fn sink_context(&self) -> Arc<SinkContext> {
        Arc::clone(&self.sink_context)
    }

    /// The handler to register with the dispatcher
    pub fn new_handler(self: &Arc<Self>) -> Arc<dyn ReplicationEventHandler> {
        Arc::new(EventEmitterHandler {
            emitter: Arc::clone(self),
        })
    }

    fn envelope_schema(&self, table: &TrackedTable) -> Struct {
        let name = self.context.envelope_schema_name(table);
        let topic = self.context.schema_topic_name(table);
        self.context
            .get_schema_or_create(&name, || schema::envelope_schema(&topic, table))
    }

    fn key_schema(&self, table: &TrackedTable) -> Struct {
        let name = self.context.key_schema_name(table);
        let topic = self.context.schema_topic_name(table);
        self.context
            .get_schema_or_create(&name, || schema::key_schema(&topic, table))
    }

    fn message_envelope_schema(&self) -> Struct {
        let name = self.context.message_envelope_schema_name();
        self.context
            .get_schema_or_create(&name, schema::message_envelope_schema)
    }

    fn timescale_key_schema(&self) -> Struct {
        self.context
            .get_schema_or_create(schema::TIMESCALE_KEY_SCHEMA_NAME, schema::timescale_key_schema)
    }

    /// Emit under bounded exponential backoff, then acknowledge. With
    /// `tombstone` set a value-less event with the same key follows for
    /// log-compaction sinks.
    async fn emit(
        &self,
        xld: XLogData,
        topic: &str,
        key: Struct,
        value: Struct,
        tombstone: bool,
    ) -> Result<()> {
        retry_bounded(&self.retry_config, || {
            self.sink
                .emit(&self.sink_context, xld.server_time, topic, key.clone(), value.clone())
        })
        .await?;

        if tombstone {
            retry_bounded(&self.retry_config, || {
                self.sink.emit(
                    &self.sink_context,
                    xld.server_time,
                    topic,
                    key.clone(),
                    Value::Null,
                )
            })
            .await?;
        }

        metrics::EVENTS_EMITTED_TOTAL.inc();
        self.context.acknowledge_processed(xld).await
    }
}

pub struct EventEmitterHandler {
    emitter: Arc<EventEmitter>,
}

impl EventEmitterHandler {
    fn transaction_id(&self) -> Option<u32> {
        let id = self.emitter.transaction_monitor.transaction_id();
        (id != 0).then_some(id)
    }

    /// Convert raw column values in catalog column order. Columns missing
    /// from the map (toasted, partial replica identity) are omitted; an
    /// empty map converts to no value at all.
    fn convert_column_values(
        &self,
        columns: &[Column],
        values: &RowValues,
    ) -> Result<Option<Struct>> {
        if values.is_empty() {
            return Ok(None);
        }
        let mut converted = serde_json::Map::new();
        for column in columns {
            if let Some(value) = values.get(column.name()) {
                let value = convert_value(column.data_type(), value.clone())?;
                converted.insert(column.name().to_string(), value);
            }
        }
        Ok(Some(Value::Object(converted)))
    }

    fn convert_values(&self, table: &TrackedTable, values: &RowValues) -> Result<Option<Struct>> {
        self.convert_column_values(table.columns(), values)
    }

    /// The key payload for a row event: primary key columns when the table
    /// has them, replica identity columns otherwise.
    fn row_key(&self, table: &TrackedTable, values: &RowValues) -> Result<Struct> {
        let key_columns: Vec<Column> = table
            .columns()
            .key_columns()
            .into_iter()
            .cloned()
            .collect();
        Ok(self
            .convert_column_values(&key_columns, values)?
            .unwrap_or(Value::Null))
    }

    /// Full event pipeline shared by row and administrative events
    async fn emit_event<F>(
        &self,
        xld: XLogData,
        snapshot: bool,
        table: &TrackedTable,
        key: Struct,
        tombstone: bool,
        build_payload: F,
    ) -> Result<()>
    where
        F: FnOnce(Struct) -> Struct,
    {
        let emitter = &self.emitter;
        let envelope_schema = emitter.envelope_schema(table);
        let topic = emitter.context.event_topic_name(table);

        let source = schema::source(
            xld.server_wal_end,
            xld.server_time,
            snapshot,
            table.database_name(),
            table.schema_name(),
            table.table_name(),
            self.transaction_id(),
        );
        let value = schema::envelope(envelope_schema, build_payload(source));

        if !emitter.filter.evaluate(table, &key, &value)? {
            debug!(topic = topic, "Event rejected by filter");
            metrics::EVENTS_FILTERED_TOTAL.inc();
            return emitter.context.acknowledge_processed(xld).await;
        }

        emitter.emit(xld, &topic, key, value, tombstone).await
    }

    fn wrapped_row_key(&self, table: &TrackedTable, values: &RowValues) -> Result<Struct> {
        let key_payload = self.row_key(table, values)?;
        Ok(schema::envelope(self.emitter.key_schema(table), key_payload))
    }

    fn wrapped_admin_key(&self, table: &TrackedTable) -> Struct {
        schema::envelope(
            self.emitter.timescale_key_schema(),
            schema::timescale_key(table.schema_name(), table.table_name()),
        )
    }
}

#[async_trait::async_trait]
impl ReplicationEventHandler for EventEmitterHandler {
    fn as_hypertable_handler(&self) -> Option<&dyn HypertableEventHandler> {
        Some(self)
    }

    fn as_logical_handler(&self) -> Option<&dyn LogicalEventHandler> {
        Some(self)
    }

    fn as_compression_handler(&self) -> Option<&dyn crate::handlers::CompressionEventHandler> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl HypertableEventHandler for EventEmitterHandler {
    async fn on_read_event(
        &self,
        lsn: Lsn,
        table: &TrackedTable,
        _chunk: Option<&Chunk>,
        new_values: RowValues,
    ) -> Result<()> {
        let converted = self.convert_values(table, &new_values)?;
        let key = self.wrapped_row_key(table, &new_values)?;
        let xld = XLogData::synthetic(lsn);
        self.emit_event(xld, true, table, key, false, |source| {
            schema::read_event(converted, source)
        })
        .await
    }

    async fn on_insert_event(
        &self,
        xld: XLogData,
        table: &TrackedTable,
        _chunk: Option<&Chunk>,
        new_values: RowValues,
    ) -> Result<()> {
        let converted = self.convert_values(table, &new_values)?;
        let key = self.wrapped_row_key(table, &new_values)?;
        self.emit_event(xld, false, table, key, false, |source| {
            schema::create_event(converted, source)
        })
        .await
    }

    async fn on_update_event(
        &self,
        xld: XLogData,
        table: &TrackedTable,
        _chunk: Option<&Chunk>,
        old_values: Option<RowValues>,
        new_values: RowValues,
    ) -> Result<()> {
        let converted_old = match &old_values {
            Some(values) => self.convert_values(table, values)?,
            None => None,
        };
        let converted_new = self.convert_values(table, &new_values)?;
        let key = self.wrapped_row_key(table, &new_values)?;
        self.emit_event(xld, false, table, key, false, |source| {
            schema::update_event(converted_old, converted_new, source)
        })
        .await
    }

    async fn on_delete_event(
        &self,
        xld: XLogData,
        table: &TrackedTable,
        _chunk: Option<&Chunk>,
        old_values: RowValues,
        tombstone: bool,
    ) -> Result<()> {
        let converted_old = self.convert_values(table, &old_values)?;
        let key = self.wrapped_row_key(table, &old_values)?;
        self.emit_event(xld, false, table, key, tombstone, |source| {
            schema::delete_event(converted_old, source)
        })
        .await
    }

    async fn on_truncate_event(&self, xld: XLogData, table: &TrackedTable) -> Result<()> {
        let key = schema::envelope(self.emitter.key_schema(table), Value::Null);
        self.emit_event(xld, false, table, key, false, schema::truncate_event)
            .await
    }
}

#[async_trait::async_trait]
impl LogicalEventHandler for EventEmitterHandler {
    async fn on_message_event(&self, xld: XLogData, message: &LogicalMessage) -> Result<()> {
        // Non-transactional messages carry the wall clock at emission time,
        // transactional ones the commit-time server timestamp.
        let timestamp = if message.is_transactional() {
            xld.server_time
        } else {
            Utc::now()
        };
        let transaction_id = message
            .is_transactional()
            .then(|| self.emitter.transaction_monitor.transaction_id());

        let envelope_schema = self.emitter.message_envelope_schema();
        let key_schema = self.emitter.context.get_schema(MESSAGE_KEY_SCHEMA_NAME)?;
        let topic = self.emitter.context.message_topic_name();

        let content = base64::engine::general_purpose::STANDARD.encode(&message.content);
        let source = schema::source(
            xld.server_wal_end,
            timestamp,
            false,
            "",
            "",
            "",
            transaction_id,
        );
        let payload = schema::message_event(&message.prefix, &content, source);

        let key = schema::envelope(key_schema, schema::message_key(&message.prefix));
        let value = schema::envelope(envelope_schema, payload);

        self.emitter.emit(xld, &topic, key, value, false).await
    }
}

#[async_trait::async_trait]
impl crate::handlers::CompressionEventHandler for EventEmitterHandler {
    async fn on_chunk_compressed(
        &self,
        xld: XLogData,
        table: &TrackedTable,
        _chunk: Option<&Chunk>,
    ) -> Result<()> {
        let key = self.wrapped_admin_key(table);
        self.emit_event(xld, false, table, key, false, schema::compression_event)
            .await
    }

    async fn on_chunk_decompressed(
        &self,
        xld: XLogData,
        table: &TrackedTable,
        _chunk: Option<&Chunk>,
    ) -> Result<()> {
        let key = self.wrapped_admin_key(table);
        self.emit_event(xld, false, table, key, false, schema::decompression_event)
            .await
    }
}
