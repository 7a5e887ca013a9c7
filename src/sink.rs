// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Record sinks: where a draining consumer hands records off to.

use crate::error::Result;

/// Receives records drained from a ring.
///
/// A recoverable error drops the record and draining continues; a fatal
/// error stops the drain and is returned to the caller.
pub trait RecordSink<T> {
    fn emit(&mut self, record: &T) -> Result<()>;
}

/// Collects records in memory.
impl<T: Copy> RecordSink<T> for Vec<T> {
    fn emit(&mut self, record: &T) -> Result<()> {
        self.push(*record);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TraceRecord
// ---------------------------------------------------------------------------

/// Payload bytes carried by one [`TraceRecord`].
pub const TRACE_PAYLOAD_LEN: usize = 240;

/// Set when the payload was cut to fit.
pub const FLAG_TRUNCATED: u16 = 1 << 0;

/// Fixed-size trace event as stored in a ring slot.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct TraceRecord {
    pub client_id: u32,
    len: u16,
    pub flags: u16,
    pub timestamp_ns: u64,
    payload: [u8; TRACE_PAYLOAD_LEN],
}

const _: () = assert!(std::mem::size_of::<TraceRecord>() == 256);

impl TraceRecord {
    /// Build a record, truncating `bytes` to [`TRACE_PAYLOAD_LEN`].
    pub fn new(client_id: u32, bytes: &[u8]) -> Self {
        let mut rec = Self { client_id, ..Self::default() };
        let n = bytes.len().min(TRACE_PAYLOAD_LEN);
        rec.payload[..n].copy_from_slice(&bytes[..n]);
        rec.len = n as u16;
        if n < bytes.len() {
            rec.flags |= FLAG_TRUNCATED;
        }
        rec
    }

    pub fn with_timestamp(mut self, timestamp_ns: u64) -> Self {
        self.timestamp_ns = timestamp_ns;
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload[..(self.len as usize).min(TRACE_PAYLOAD_LEN)]
    }

    pub fn is_truncated(&self) -> bool {
        self.flags & FLAG_TRUNCATED != 0
    }
}

impl Default for TraceRecord {
    fn default() -> Self {
        Self {
            client_id: 0,
            len: 0,
            flags: 0,
            timestamp_ns: 0,
            payload: [0; TRACE_PAYLOAD_LEN],
        }
    }
}

impl std::fmt::Debug for TraceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceRecord")
            .field("client_id", &self.client_id)
            .field("timestamp_ns", &self.timestamp_ns)
            .field("len", &self.len)
            .field("truncated", &self.is_truncated())
            .finish()
    }
}

impl PartialEq for TraceRecord {
    fn eq(&self, other: &Self) -> bool {
        self.client_id == other.client_id
            && self.flags == other.flags
            && self.timestamp_ns == other.timestamp_ns
            && self.payload() == other.payload()
    }
}

impl Eq for TraceRecord {}

/// Forwards trace records to the `tracing` diagnostic log.
#[derive(Debug, Default)]
pub struct TracingSink {
    emitted: u64,
}

impl TracingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records written so far.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}

impl RecordSink<TraceRecord> for TracingSink {
    fn emit(&mut self, record: &TraceRecord) -> Result<()> {
        tracing::info!(
            target: "libtrace::record",
            client_id = record.client_id,
            timestamp_ns = record.timestamp_ns,
            truncated = record.is_truncated(),
            payload = %String::from_utf8_lossy(record.payload()),
        );
        self.emitted += 1;
        Ok(())
    }
}
