//! Append-only subscription buffer framing.
//!
//! Unlike the SPSC ring, subscription buffers are append-only until recycled:
//! the first 4 bytes hold an absolute write position (u32 LE, starting at 4),
//! and records are `[len:u32 LE][payload]` laid out back to back. The reader
//! keeps its own cursor (`last_read_pos`, initially 4) and never writes to
//! the buffer.
//!
//! When a record does not fit, a BufferFull control record is appended once
//! so the consumer can surface a visible overflow instead of silence.

use js_sys::{SharedArrayBuffer, Uint8Array};

use crate::types::messages::{self, WorkerToMainMessage};

/// First record offset; bytes 0..4 are the write-position header.
pub const DATA_START: usize = 4;

/// Size a subscription buffer for an expected number of events.
pub fn calculate_buffer_size(total_event_limit: usize, bytes_per_event: usize) -> usize {
    DATA_START + (total_event_limit as f64 * bytes_per_event as f64 * 1.25) as usize
}

/// Default buffer-sizing hint when the caller supplies none.
pub const DEFAULT_BYTES_PER_EVENT: usize = 3072;

/// Parse committed records out of `region` (the bytes between the reader
/// cursor and the current write position). Returns the payloads and the
/// number of bytes consumed; a zero or out-of-range length stops the parse
/// at that point so the caller retries from the same spot later.
pub fn parse_records(region: &[u8]) -> (Vec<Vec<u8>>, usize) {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos + 4 <= region.len() {
        let len = u32::from_le_bytes(region[pos..pos + 4].try_into().unwrap()) as usize;
        if len == 0 || pos + 4 + len > region.len() {
            break;
        }
        out.push(region[pos + 4..pos + 4 + len].to_vec());
        pos += 4 + len;
    }
    (out, pos)
}

/// Writer side, owned by the producing worker.
pub struct SubBufferWriter {
    view: Uint8Array,
    total: usize,
    full_marked: bool,
}

impl SubBufferWriter {
    pub fn new(sab: &SharedArrayBuffer) -> Self {
        let view = Uint8Array::new(sab);
        let total = view.length() as usize;
        let writer = Self {
            view,
            total,
            full_marked: false,
        };
        if writer.write_pos() < DATA_START {
            writer.set_write_pos(DATA_START);
        }
        writer
    }

    fn write_pos(&self) -> usize {
        let mut tmp = [0u8; 4];
        self.view.subarray(0, 4).copy_to(&mut tmp);
        u32::from_le_bytes(tmp) as usize
    }

    fn set_write_pos(&self, pos: usize) {
        let tmp = Uint8Array::new_with_length(4);
        tmp.copy_from(&(pos as u32).to_le_bytes());
        self.view.set(&tmp, 0);
    }

    fn put(&self, pos: usize, bytes: &[u8]) {
        let tmp = Uint8Array::new_with_length(bytes.len() as u32);
        tmp.copy_from(bytes);
        self.view.set(&tmp, pos as u32);
    }

    /// Append one record. Returns false when the buffer is full; the first
    /// refusal also appends a BufferFull control record when it still fits.
    pub fn write(&mut self, data: &[u8]) -> bool {
        let pos = self.write_pos();
        if pos < DATA_START || pos > self.total {
            tracing::warn!(pos, total = self.total, "invalid write position, record dropped");
            return false;
        }
        if pos + 4 + data.len() > self.total {
            self.mark_full(pos);
            return false;
        }

        self.put(pos, &(data.len() as u32).to_le_bytes());
        self.put(pos + 4, data);
        // Header last, so a concurrent reader never sees a half-written record.
        self.set_write_pos(pos + 4 + data.len());
        true
    }

    fn mark_full(&mut self, pos: usize) {
        if self.full_marked {
            return;
        }
        let marker = match messages::encode(&WorkerToMainMessage::BufferFull) {
            Ok(m) => m,
            Err(_) => return,
        };
        if pos + 4 + marker.len() > self.total {
            tracing::warn!("buffer completely full, overflow marker dropped");
            return;
        }
        self.put(pos, &(marker.len() as u32).to_le_bytes());
        self.put(pos + 4, &marker);
        self.set_write_pos(pos + 4 + marker.len());
        self.full_marked = true;
    }
}

/// Reader side, owned by the UI thread.
pub struct SubBufferReader {
    view: Uint8Array,
    total: usize,
    last_read_pos: usize,
}

impl SubBufferReader {
    pub fn new(sab: &SharedArrayBuffer) -> Self {
        let view = Uint8Array::new(sab);
        let total = view.length() as usize;
        Self {
            view,
            total,
            last_read_pos: DATA_START,
        }
    }

    pub fn last_read_pos(&self) -> usize {
        self.last_read_pos
    }

    /// Read every record committed since the previous call. A corrupt length
    /// stops the read and preserves the cursor for a retry.
    pub fn read_new(&mut self) -> Vec<Vec<u8>> {
        let mut tmp = [0u8; 4];
        self.view.subarray(0, 4).copy_to(&mut tmp);
        let write_pos = u32::from_le_bytes(tmp) as usize;

        if write_pos <= self.last_read_pos {
            return Vec::new();
        }
        if write_pos > self.total {
            tracing::warn!(write_pos, total = self.total, "corrupt write position");
            return Vec::new();
        }

        let mut region = vec![0u8; write_pos - self.last_read_pos];
        self.view
            .subarray(self.last_read_pos as u32, write_pos as u32)
            .copy_to(&mut region);

        let (records, consumed) = parse_records(&region);
        self.last_read_pos += consumed;
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_le_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn parses_back_to_back_records() {
        let mut region = record(b"alpha");
        region.extend(record(b"bravo"));
        let (records, consumed) = parse_records(&region);
        assert_eq!(records, vec![b"alpha".to_vec(), b"bravo".to_vec()]);
        assert_eq!(consumed, region.len());
    }

    #[test]
    fn partial_trailing_record_is_left_for_retry() {
        let mut region = record(b"done");
        // A record whose length points past the committed region.
        region.extend((100u32).to_le_bytes());
        region.extend(b"trunc");
        let (records, consumed) = parse_records(&region);
        assert_eq!(records, vec![b"done".to_vec()]);
        assert_eq!(consumed, 8);
    }

    #[test]
    fn zero_length_stops_the_parse() {
        let mut region = record(b"ok");
        region.extend(0u32.to_le_bytes());
        region.extend(record(b"after"));
        let (records, consumed) = parse_records(&region);
        assert_eq!(records, vec![b"ok".to_vec()]);
        assert_eq!(consumed, 6);
    }

    #[test]
    fn sizing_follows_the_headroom_formula() {
        assert_eq!(calculate_buffer_size(0, DEFAULT_BYTES_PER_EVENT), DATA_START);
        let one = calculate_buffer_size(1, 1000);
        assert_eq!(one, DATA_START + 1250);
        let many = calculate_buffer_size(100, DEFAULT_BYTES_PER_EVENT);
        assert_eq!(many, DATA_START + (100.0 * 3072.0 * 1.25) as usize);
    }
}
