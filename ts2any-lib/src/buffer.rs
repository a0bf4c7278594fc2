//! Buffer utilities for the durable state wire formats
//!
//! Safe wrappers for reading and writing the big-endian, length-prefixed
//! binary layouts used by the sink-context and known-tables state, built on
//! the `bytes` crate.

use crate::error::{Result, StreamerError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Buffer reader for parsing durable state payloads
pub struct BufferReader {
    data: Bytes,
}

impl BufferReader {
    /// Create a new buffer reader from a byte slice
    pub fn new(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
        }
    }

    /// Create a new buffer reader from Bytes
    pub fn from_bytes(data: Bytes) -> Self {
        Self { data }
    }

    /// Get remaining bytes in the buffer
    pub fn remaining(&self) -> usize {
        self.data.remaining()
    }

    /// Check if there are enough bytes remaining
    fn ensure_bytes(&self, count: usize) -> Result<()> {
        if self.data.remaining() < count {
            return Err(StreamerError::malformed_state(format!(
                "truncated payload: need {} more bytes, have {}",
                count,
                self.data.remaining()
            )));
        }
        Ok(())
    }

    /// Read a single byte
    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure_bytes(1)?;
        Ok(self.data.get_u8())
    }

    /// Read a 32-bit unsigned integer in big-endian order
    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure_bytes(4)?;
        Ok(self.data.get_u32())
    }

    /// Read a 64-bit unsigned integer in big-endian order
    pub fn read_u64(&mut self) -> Result<u64> {
        self.ensure_bytes(8)?;
        Ok(self.data.get_u64())
    }

    /// Read raw bytes
    pub fn read_bytes(&mut self, length: usize) -> Result<Vec<u8>> {
        self.ensure_bytes(length)?;
        let bytes = self.data.copy_to_bytes(length);
        Ok(bytes.to_vec())
    }

    /// Read a u32-length-prefixed UTF-8 string
    pub fn read_string(&mut self) -> Result<String> {
        let length = self.read_u32()? as usize;
        self.ensure_bytes(length)?;
        let string_bytes = self.data.copy_to_bytes(length);
        String::from_utf8(string_bytes.to_vec())
            .map_err(|e| StreamerError::malformed_state(format!("invalid UTF-8 in string: {}", e)))
    }
}

/// Buffer writer for building durable state payloads
pub struct BufferWriter {
    data: BytesMut,
}

impl BufferWriter {
    /// Create a new buffer writer
    pub fn new() -> Self {
        Self {
            data: BytesMut::new(),
        }
    }

    /// Create a new buffer writer with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
        }
    }

    /// Get bytes written so far
    pub fn bytes_written(&self) -> usize {
        self.data.len()
    }

    /// Consume the writer and return the payload
    pub fn into_vec(self) -> Vec<u8> {
        self.data.to_vec()
    }

    /// Consume the writer and return the payload as Bytes
    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }

    /// Write a single byte
    pub fn put_u8(&mut self, value: u8) {
        self.data.put_u8(value);
    }

    /// Write a 32-bit unsigned integer in big-endian order
    pub fn put_u32(&mut self, value: u32) {
        self.data.put_u32(value);
    }

    /// Write a 64-bit unsigned integer in big-endian order
    pub fn put_u64(&mut self, value: u64) {
        self.data.put_u64(value);
    }

    /// Write raw bytes
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.put_slice(bytes);
    }

    /// Write a u32-length-prefixed UTF-8 string
    pub fn put_string(&mut self, s: &str) {
        self.data.put_u32(s.len() as u32);
        self.data.put_slice(s.as_bytes());
    }
}

impl Default for BufferWriter {
    fn default() -> Self {
        Self::new()
    }
}
