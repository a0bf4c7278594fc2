//! Shared replication context
//!
//! Bundles the services the event pipeline needs at every step: topic and
//! schema naming, the schema registry, durable state access, system facts
//! from the side channel, and WAL acknowledgement.

use crate::catalog::TrackedTable;
use crate::error::{Result, StreamerError};
use crate::schema::Struct;
use crate::schemaregistry::SchemaRegistry;
use crate::sidechannel::{SideChannel, SystemInformation};
use crate::statestorage::{StateEncoder, StateStorageManager};
use crate::topic::NameGenerator;
use crate::types::{Lsn, XLogData};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Acknowledges processed WAL positions back to the replication channel
#[async_trait]
pub trait LsnAcknowledger: Send + Sync {
    async fn acknowledge(&self, lsn: Lsn) -> Result<()>;
}

pub struct ReplicationContext {
    name_generator: NameGenerator,
    schema_registry: SchemaRegistry,
    state: Arc<StateStorageManager>,
    side_channel: Arc<dyn SideChannel>,
    system_information: Mutex<Option<SystemInformation>>,
    acknowledger: Mutex<Option<Arc<dyn LsnAcknowledger>>>,
    last_acknowledged: AtomicU64,
}

impl ReplicationContext {
    pub fn new(
        name_generator: NameGenerator,
        side_channel: Arc<dyn SideChannel>,
        state: Arc<StateStorageManager>,
    ) -> Self {
        Self {
            name_generator,
            schema_registry: SchemaRegistry::new(),
            state,
            side_channel,
            system_information: Mutex::new(None),
            acknowledger: Mutex::new(None),
            last_acknowledged: AtomicU64::new(0),
        }
    }

    /// Gather system facts; must run before the preflight checks
    pub async fn start(&self) -> Result<()> {
        let info = self.side_channel.read_system_information().await?;
        info!("Discovered system information:");
        info!("  * PostgreSQL version {}", info.postgres_version_text);
        info!("  * TimescaleDB version {}", info.timescale_version);
        info!("  * PostgreSQL system identity {}", info.system_id);
        info!("  * PostgreSQL timeline {}", info.timeline);
        info!("  * PostgreSQL database name {}", info.database_name);
        *self.system_information.lock().unwrap() = Some(info);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        Ok(())
    }

    pub fn system_information(&self) -> Result<SystemInformation> {
        self.system_information
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| StreamerError::fatal("replication context not started"))
    }

    pub fn database_name(&self) -> Result<String> {
        Ok(self.system_information()?.database_name)
    }

    pub fn side_channel(&self) -> Arc<dyn SideChannel> {
        Arc::clone(&self.side_channel)
    }

    // --- naming -----------------------------------------------------------

    pub fn event_topic_name(&self, table: &TrackedTable) -> String {
        self.name_generator.event_topic_name(table)
    }

    pub fn message_topic_name(&self) -> String {
        self.name_generator.message_topic_name()
    }

    pub fn schema_topic_name(&self, table: &TrackedTable) -> String {
        self.name_generator.schema_topic_name(table)
    }

    pub fn envelope_schema_name(&self, table: &TrackedTable) -> String {
        format!("{}.Envelope", self.name_generator.schema_topic_name(table))
    }

    pub fn key_schema_name(&self, table: &TrackedTable) -> String {
        format!("{}.Key", self.name_generator.schema_topic_name(table))
    }

    pub fn message_envelope_schema_name(&self) -> String {
        format!("{}.Envelope", self.name_generator.message_topic_name())
    }

    // --- schema registry --------------------------------------------------

    pub fn get_schema_or_create<F>(&self, name: &str, factory: F) -> Struct
    where
        F: FnOnce() -> Struct,
    {
        self.schema_registry.get_or_create(name, factory)
    }

    pub fn get_schema(&self, name: &str) -> Result<Struct> {
        self.schema_registry.get(name)
    }

    pub fn register_schema(&self, name: &str, schema: Struct) {
        self.schema_registry.register(name, schema);
    }

    // --- durable state ----------------------------------------------------

    pub fn encoded_state(&self, name: &str) -> Option<Vec<u8>> {
        self.state.encoded_state(name)
    }

    pub fn set_encoded_state(&self, name: impl Into<String>, state: Vec<u8>) {
        self.state.set_encoded_state(name, state);
    }

    pub fn register_state_encoder(&self, name: impl Into<String>, encoder: StateEncoder) {
        self.state.register_state_encoder(name, encoder);
    }

    // --- acknowledgement --------------------------------------------------

    /// Install the channel-provided acknowledger; called at channel start
    pub fn set_acknowledger(&self, acknowledger: Arc<dyn LsnAcknowledger>) {
        *self.acknowledger.lock().unwrap() = Some(acknowledger);
    }

    /// Confirm that every event up to this record has been emitted or
    /// intentionally dropped.
    pub async fn acknowledge_processed(&self, xld: XLogData) -> Result<()> {
        let lsn = xld.server_wal_end;
        self.last_acknowledged
            .fetch_max(lsn.0, Ordering::SeqCst);
        crate::monitoring::metrics::LAST_ACKNOWLEDGED_LSN.set(lsn.0 as f64);

        let acknowledger = self.acknowledger.lock().unwrap().clone();
        match acknowledger {
            Some(acknowledger) => acknowledger.acknowledge(lsn).await,
            None => {
                warn!("No acknowledger installed, dropping ack for {}", lsn);
                Ok(())
            }
        }
    }

    /// Highest LSN acknowledged so far
    pub fn last_acknowledged(&self) -> Lsn {
        Lsn::new(self.last_acknowledged.load(Ordering::SeqCst))
    }
}
