//! Core replication types shared across the pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Log sequence number: a monotonic byte offset into the WAL
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn new(value: u64) -> Self {
        Lsn(value)
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Lsn {
    /// Formats in PostgreSQL's `XXXXXXXX/XXXXXXXX` notation
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = crate::error::StreamerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s.split_once('/').ok_or_else(|| {
            crate::error::StreamerError::config(format!("invalid LSN format: {}", s))
        })?;
        let hi = u64::from_str_radix(hi, 16)
            .map_err(|e| crate::error::StreamerError::config(format!("invalid LSN '{}': {}", s, e)))?;
        let lo = u64::from_str_radix(lo, 16)
            .map_err(|e| crate::error::StreamerError::config(format!("invalid LSN '{}': {}", s, e)))?;
        Ok(Lsn((hi << 32) | lo))
    }
}

/// Positional metadata attached to every decoded WAL event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XLogData {
    /// WAL position where this record starts
    pub wal_start: Lsn,
    /// WAL position past the end of this record
    pub server_wal_end: Lsn,
    /// Server timestamp at decode time
    pub server_time: DateTime<Utc>,
}

impl XLogData {
    pub fn new(wal_start: Lsn, server_wal_end: Lsn, server_time: DateTime<Utc>) -> Self {
        Self {
            wal_start,
            server_wal_end,
            server_time,
        }
    }

    /// Synthetic position for snapshot-originated events: start and end
    /// collapse onto the given LSN and the timestamp is the wall clock.
    pub fn synthetic(lsn: Lsn) -> Self {
        Self {
            wal_start: lsn,
            server_wal_end: lsn,
            server_time: Utc::now(),
        }
    }
}

/// A `pg_logical_emit_message` payload decoded off the WAL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalMessage {
    pub prefix: String,
    pub content: Vec<u8>,
    pub transactional: bool,
}

impl LogicalMessage {
    pub fn new(prefix: impl Into<String>, content: Vec<u8>, transactional: bool) -> Self {
        Self {
            prefix: prefix.into(),
            content,
            transactional,
        }
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional
    }
}

/// PostgreSQL type OIDs the converter layer understands
pub mod oids {
    pub const BOOL: u32 = 16;
    pub const BYTEA: u32 = 17;
    pub const INT8: u32 = 20;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const TEXT: u32 = 25;
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;
    pub const VARCHAR: u32 = 1043;
    pub const DATE: u32 = 1082;
    pub const TIME: u32 = 1083;
    pub const TIMESTAMP: u32 = 1114;
    pub const TIMESTAMPTZ: u32 = 1184;
    pub const INTERVAL: u32 = 1186;
    pub const NUMERIC: u32 = 1700;
    pub const UUID: u32 = 2950;
    pub const JSON: u32 = 114;
    pub const JSONB: u32 = 3802;
}
