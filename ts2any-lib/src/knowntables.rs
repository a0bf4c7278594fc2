//! Durable codec for the discovered-entity list
//!
//! Layout: `u32 count || [string schema || string table]*` where `string`
//! is `u32 len || bytes`, all big-endian.

use crate::buffer::{BufferReader, BufferWriter};
use crate::catalog::SystemEntity;
use crate::error::Result;

/// Durable state key for previously known chunks
pub const PREVIOUSLY_KNOWN_CHUNKS: &str = "::previously::known::chunks";
/// Durable state key for previously known vanilla tables
pub const PREVIOUSLY_KNOWN_TABLES: &str = "::previously::known::tables";

pub fn encode(entities: &[SystemEntity]) -> Result<Vec<u8>> {
    let mut writer = BufferWriter::with_capacity(64);
    writer.put_u32(entities.len() as u32);
    for entity in entities {
        writer.put_string(entity.schema_name());
        writer.put_string(entity.table_name());
    }
    Ok(writer.into_vec())
}

pub fn decode(data: &[u8]) -> Result<Vec<SystemEntity>> {
    let mut reader = BufferReader::new(data);
    let count = reader.read_u32()?;
    let mut entities = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let schema_name = reader.read_string()?;
        let table_name = reader.read_string()?;
        entities.push(SystemEntity::new(schema_name, table_name));
    }
    Ok(entities)
}
