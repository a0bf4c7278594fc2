//! Downstream sink boundary
//!
//! Sinks receive finished envelopes. Implementations are expected to be
//! idempotent under replay of the same `(topic, key, lsn)` triple, since
//! delivery is at-least-once.

use crate::buffer::{BufferReader, BufferWriter};
use crate::error::Result;
use crate::schema::Struct;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;

/// Durable state key under which the persistent attributes are stored
pub const SINK_CONTEXT_STATE_NAME: &str = "SinkContextState";

/// Typed attribute bag handed to the sink on every emission.
///
/// Persistent attributes round-trip through durable state across restarts;
/// transient attributes live only for the process lifetime.
#[derive(Debug, Default)]
pub struct SinkContext {
    attributes: Mutex<HashMap<String, String>>,
    transient_attributes: Mutex<HashMap<String, String>>,
}

impl SinkContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes
            .lock()
            .unwrap()
            .insert(key.into(), value.into());
    }

    pub fn attribute(&self, key: &str) -> Option<String> {
        self.attributes.lock().unwrap().get(key).cloned()
    }

    pub fn set_transient_attribute(&self, key: impl Into<String>, value: impl Into<String>) {
        self.transient_attributes
            .lock()
            .unwrap()
            .insert(key.into(), value.into());
    }

    pub fn transient_attribute(&self, key: &str) -> Option<String> {
        self.transient_attributes.lock().unwrap().get(key).cloned()
    }

    /// Encode the persistent attributes:
    /// `u32 count || [u32 keylen || u32 vallen || key || val]*`, big-endian.
    /// Transient attributes are never encoded.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let attributes = self.attributes.lock().unwrap();
        let mut writer = BufferWriter::with_capacity(64);
        writer.put_u32(attributes.len() as u32);
        for (key, value) in attributes.iter() {
            writer.put_u32(key.len() as u32);
            writer.put_u32(value.len() as u32);
            writer.put_bytes(key.as_bytes());
            writer.put_bytes(value.as_bytes());
        }
        Ok(writer.into_vec())
    }

    /// Decode a previously marshalled payload into the persistent map.
    /// Entry order is not part of the contract; any order is accepted.
    pub fn unmarshal(&self, data: &[u8]) -> Result<()> {
        let mut reader = BufferReader::new(data);
        let count = reader.read_u32()?;
        for _ in 0..count {
            let key_len = reader.read_u32()? as usize;
            let value_len = reader.read_u32()? as usize;
            let key = String::from_utf8(reader.read_bytes(key_len)?).map_err(|e| {
                crate::error::StreamerError::malformed_state(format!("invalid key: {}", e))
            })?;
            let value = String::from_utf8(reader.read_bytes(value_len)?).map_err(|e| {
                crate::error::StreamerError::malformed_state(format!("invalid value: {}", e))
            })?;
            self.set_attribute(key, value);
        }
        Ok(())
    }
}

/// The downstream transport for finished events
#[async_trait]
pub trait Sink: Send + Sync {
    async fn emit(
        &self,
        context: &SinkContext,
        server_time: DateTime<Utc>,
        topic: &str,
        key: Struct,
        envelope: Struct,
    ) -> Result<()>;
}

/// Sink that writes envelopes to the log, useful for smoke-testing a
/// deployment before wiring a real transport
#[derive(Debug, Default)]
pub struct LoggingSink;

#[async_trait]
impl Sink for LoggingSink {
    async fn emit(
        &self,
        _context: &SinkContext,
        server_time: DateTime<Utc>,
        topic: &str,
        key: Struct,
        envelope: Struct,
    ) -> Result<()> {
        info!(
            topic = topic,
            server_time = %server_time,
            key = %key,
            "{}",
            envelope
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamerError;

    #[test]
    fn test_persistent_round_trip() {
        let context = SinkContext::new();
        context.set_attribute("region", "eu");
        context.set_attribute("cluster", "a1");

        let encoded = context.marshal().unwrap();

        let restored = SinkContext::new();
        restored.unmarshal(&encoded).unwrap();
        assert_eq!(restored.attribute("region").as_deref(), Some("eu"));
        assert_eq!(restored.attribute("cluster").as_deref(), Some("a1"));
    }

    #[test]
    fn test_transient_attributes_are_not_encoded() {
        let context = SinkContext::new();
        context.set_attribute("keep", "yes");
        context.set_transient_attribute("drop", "yes");

        let restored = SinkContext::new();
        restored.unmarshal(&context.marshal().unwrap()).unwrap();
        assert_eq!(restored.attribute("keep").as_deref(), Some("yes"));
        assert_eq!(restored.attribute("drop"), None);
        assert_eq!(restored.transient_attribute("drop"), None);
    }

    #[test]
    fn test_unmarshal_tolerates_empty_payload() {
        let context = SinkContext::new();
        context.unmarshal(&0u32.to_be_bytes()).unwrap();
        assert_eq!(context.attribute("anything"), None);
    }

    #[test]
    fn test_unmarshal_rejects_underflowing_lengths() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&10u32.to_be_bytes()); // key length
        payload.extend_from_slice(&0u32.to_be_bytes()); // value length
        payload.extend_from_slice(b"abc"); // only 3 of the declared 10 bytes

        let context = SinkContext::new();
        let err = context.unmarshal(&payload).unwrap_err();
        assert!(matches!(err, StreamerError::MalformedState(_)));
    }

    #[test]
    fn test_unmarshal_accepts_any_entry_order() {
        let a = SinkContext::new();
        a.set_attribute("k1", "v1");
        a.set_attribute("k2", "v2");

        // Re-encode through a second context; HashMap order may differ.
        let b = SinkContext::new();
        b.unmarshal(&a.marshal().unwrap()).unwrap();
        let c = SinkContext::new();
        c.unmarshal(&b.marshal().unwrap()).unwrap();

        assert_eq!(c.attribute("k1").as_deref(), Some("v1"));
        assert_eq!(c.attribute("k2").as_deref(), Some("v2"));
    }
}
