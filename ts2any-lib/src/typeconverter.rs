//! Type-specific value converters keyed by column OID
//!
//! Logical replication delivers column values as text. Converters turn the
//! text into typed JSON values for the envelope; OIDs without a converter
//! pass the value through unchanged.

use crate::error::{Result, StreamerError};
use crate::types::oids;
use base64::Engine;
use serde_json::Value;

/// A converter for one type OID
pub type Converter = fn(u32, Value) -> Result<Value>;

/// Look up the converter for a type OID, `None` meaning pass-through
pub fn converter_by_oid(oid: u32) -> Option<Converter> {
    match oid {
        oids::BOOL => Some(convert_bool),
        oids::INT2 | oids::INT4 | oids::INT8 => Some(convert_integer),
        oids::FLOAT4 | oids::FLOAT8 => Some(convert_float),
        oids::BYTEA => Some(convert_bytea),
        _ => None,
    }
}

fn text_of(oid: u32, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(StreamerError::conversion(format!(
            "expected text representation for oid {}, got {}",
            oid, other
        ))),
    }
}

fn convert_bool(oid: u32, value: Value) -> Result<Value> {
    if value.is_null() || value.is_boolean() {
        return Ok(value);
    }
    match text_of(oid, &value)?.as_str() {
        "t" | "true" => Ok(Value::Bool(true)),
        "f" | "false" => Ok(Value::Bool(false)),
        other => Err(StreamerError::conversion(format!(
            "invalid boolean literal '{}'",
            other
        ))),
    }
}

fn convert_integer(oid: u32, value: Value) -> Result<Value> {
    if value.is_null() || value.is_i64() || value.is_u64() {
        return Ok(value);
    }
    let text = text_of(oid, &value)?;
    let parsed: i64 = text
        .parse()
        .map_err(|e| StreamerError::conversion(format!("invalid integer '{}': {}", text, e)))?;
    Ok(Value::from(parsed))
}

fn convert_float(oid: u32, value: Value) -> Result<Value> {
    if value.is_null() || value.is_number() {
        return Ok(value);
    }
    let text = text_of(oid, &value)?;
    let parsed: f64 = text
        .parse()
        .map_err(|e| StreamerError::conversion(format!("invalid float '{}': {}", text, e)))?;
    Ok(Value::from(parsed))
}

fn convert_bytea(oid: u32, value: Value) -> Result<Value> {
    if value.is_null() {
        return Ok(value);
    }
    let text = text_of(oid, &value)?;
    // PostgreSQL hex output format: \x0102...
    let hex = text.strip_prefix("\\x").unwrap_or(&text);
    let mut raw = Vec::with_capacity(hex.len() / 2);
    let bytes = hex.as_bytes();
    if bytes.len() % 2 != 0 {
        return Err(StreamerError::conversion(format!(
            "odd-length bytea literal '{}'",
            text
        )));
    }
    for pair in bytes.chunks_exact(2) {
        let hi = hex_digit(pair[0], &text)?;
        let lo = hex_digit(pair[1], &text)?;
        raw.push((hi << 4) | lo);
    }
    Ok(Value::String(
        base64::engine::general_purpose::STANDARD.encode(raw),
    ))
}

fn hex_digit(c: u8, literal: &str) -> Result<u8> {
    (c as char)
        .to_digit(16)
        .map(|d| d as u8)
        .ok_or_else(|| StreamerError::conversion(format!("invalid bytea literal '{}'", literal)))
}

/// Convert one raw value according to the column OID
pub fn convert_value(oid: u32, value: Value) -> Result<Value> {
    match converter_by_oid(oid) {
        Some(converter) => converter(oid, value),
        None => Ok(value),
    }
}
