//! The ring protocol of [`crate::ring`] over a `SharedArrayBuffer`.
//!
//! This is the cross-context face of the ring: all access goes through
//! `Uint8Array` views so the same byte region can be mapped from the UI
//! thread and a worker at once. Single-producer/single-consumer discipline
//! and the trailer-commit protocol make Atomics unnecessary; see the layout
//! documentation in [`crate::ring`].

use js_sys::{SharedArrayBuffer, Uint8Array};
use wasm_bindgen::prelude::*;

use crate::ring::{HEADER_SIZE, OVERFLOW_SENTINEL};

pub struct SabRing {
    view: Uint8Array,
    capacity: usize,
    dropped: u64,
    overflow_marked: bool,
}

impl SabRing {
    /// Map a ring over a SharedArrayBuffer, stamping the header when the
    /// capacity field is still zero. Safe to call from both ends.
    pub fn new(sab: SharedArrayBuffer) -> Result<Self, JsValue> {
        let view = Uint8Array::new(&sab);
        let total = view.length() as usize;
        if total < HEADER_SIZE {
            return Err(JsValue::from_str(&format!(
                "SAB too small for ring header: {} < {}",
                total, HEADER_SIZE
            )));
        }

        let mut capacity = {
            let mut tmp = [0u8; 4];
            view.subarray(0, 4).copy_to(&mut tmp);
            u32::from_le_bytes(tmp) as usize
        };
        if capacity == 0 {
            capacity = total - HEADER_SIZE;
            let mut header = [0u8; HEADER_SIZE];
            header[0..4].copy_from_slice(&(capacity as u32).to_le_bytes());
            let tmp = Uint8Array::new_with_length(HEADER_SIZE as u32);
            tmp.copy_from(&header);
            view.set(&tmp, 0);
        }
        if HEADER_SIZE + capacity != total {
            return Err(JsValue::from_str(&format!(
                "SAB length {} != header + capacity {}",
                total,
                HEADER_SIZE + capacity
            )));
        }

        Ok(Self {
            view,
            capacity,
            dropped: 0,
            overflow_marked: false,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn has_records(&self) -> bool {
        self.head() != self.tail()
    }

    /// Read the next committed record payload and advance the tail.
    pub fn read_next(&mut self) -> Option<Vec<u8>> {
        let tail = self.tail();
        if tail == self.head() {
            return None;
        }

        let len = self.ring_read_u32(tail) as usize;
        if len == 0 {
            return None;
        }
        let trailer_pos = (tail + 4 + len) % self.capacity;
        if self.ring_read_u32(trailer_pos) as usize != len {
            return None;
        }

        let payload_len = len - 8;
        let payload_pos = (tail + 4 + 8) % self.capacity;
        let mut out = vec![0u8; payload_len];
        self.ring_read(payload_pos, &mut out);

        self.set_tail((tail + 4 + len + 4) % self.capacity);
        Some(out)
    }

    /// Write one committed record, evicting oldest records on overflow.
    /// Returns the committed sequence number, None when refused; a refused
    /// write leaves a one-byte 0xFF sentinel for the reader.
    pub fn write(&mut self, payload: &[u8]) -> Option<u32> {
        match self.write_inner(payload) {
            Some(seq) => {
                self.overflow_marked = false;
                Some(seq)
            }
            None => {
                if !self.overflow_marked && self.write_inner(&[OVERFLOW_SENTINEL]).is_some() {
                    self.overflow_marked = true;
                }
                None
            }
        }
    }

    fn write_inner(&mut self, payload: &[u8]) -> Option<u32> {
        let var_len = 8 + payload.len();
        if var_len + 4 > self.capacity {
            return None;
        }
        let total = 4 + var_len + 4;

        self.make_space(total.min(self.capacity));
        if total <= self.capacity {
            if self.free() < total {
                return None;
            }
        } else if self.free() < self.capacity || var_len + 4 != self.capacity {
            return None;
        }

        let head = self.head();
        let seq = self.seq().wrapping_add(1);

        self.ring_write_u32(head, var_len as u32);
        let var_pos = (head + 4) % self.capacity;
        self.ring_write(var_pos, &0u16.to_le_bytes());
        self.ring_write((var_pos + 2) % self.capacity, &0u16.to_le_bytes());
        self.ring_write((var_pos + 4) % self.capacity, &seq.to_le_bytes());
        self.ring_write((var_pos + 8) % self.capacity, payload);

        let trailer_pos = (head + 4 + var_len) % self.capacity;
        self.ring_write_u32(trailer_pos, var_len as u32);

        self.set_head((head + total) % self.capacity);
        self.set_seq(seq);
        Some(seq)
    }

    fn make_space(&mut self, needed: usize) {
        while self.free() < needed && self.has_records() {
            if self.skip_record() {
                self.dropped += 1;
            } else {
                break;
            }
        }
    }

    fn skip_record(&mut self) -> bool {
        let tail = self.tail();
        if tail == self.head() {
            return false;
        }
        let len = self.ring_read_u32(tail) as usize;
        if len == 0 {
            return false;
        }
        let trailer_pos = (tail + 4 + len) % self.capacity;
        if self.ring_read_u32(trailer_pos) as usize != len {
            return false;
        }
        self.set_tail((tail + 4 + len + 4) % self.capacity);
        true
    }

    // -------- header fields --------

    #[inline]
    fn head(&self) -> usize {
        self.read_header_u32(4) as usize % self.capacity
    }

    #[inline]
    fn set_head(&mut self, head: usize) {
        self.write_header_u32(4, (head % self.capacity) as u32);
    }

    #[inline]
    fn tail(&self) -> usize {
        self.read_header_u32(8) as usize % self.capacity
    }

    #[inline]
    fn set_tail(&mut self, tail: usize) {
        self.write_header_u32(8, (tail % self.capacity) as u32);
    }

    #[inline]
    fn seq(&self) -> u32 {
        self.read_header_u32(12)
    }

    #[inline]
    fn set_seq(&mut self, seq: u32) {
        self.write_header_u32(12, seq);
    }

    #[inline]
    fn used(&self) -> usize {
        (self.head() + self.capacity - self.tail()) % self.capacity
    }

    #[inline]
    fn free(&self) -> usize {
        self.capacity - self.used()
    }

    fn read_header_u32(&self, offset: usize) -> u32 {
        let mut tmp = [0u8; 4];
        self.view
            .subarray(offset as u32, (offset + 4) as u32)
            .copy_to(&mut tmp);
        u32::from_le_bytes(tmp)
    }

    fn write_header_u32(&mut self, offset: usize, v: u32) {
        let tmp = Uint8Array::new_with_length(4);
        tmp.copy_from(&v.to_le_bytes());
        self.view.set(&tmp, offset as u32);
    }

    // -------- data region with wrap-around --------

    fn ring_read(&self, mut pos: usize, out: &mut [u8]) {
        let mut remaining = out.len();
        let mut off = 0;
        while remaining > 0 {
            let to_end = self.capacity - (pos % self.capacity);
            let chunk = remaining.min(to_end);
            let abs = HEADER_SIZE + (pos % self.capacity);
            self.view
                .subarray(abs as u32, (abs + chunk) as u32)
                .copy_to(&mut out[off..off + chunk]);
            remaining -= chunk;
            off += chunk;
            pos = (pos + chunk) % self.capacity;
        }
    }

    fn ring_write(&mut self, mut pos: usize, src: &[u8]) {
        let mut remaining = src.len();
        let mut off = 0;
        while remaining > 0 {
            let to_end = self.capacity - (pos % self.capacity);
            let chunk = remaining.min(to_end);
            let abs = HEADER_SIZE + (pos % self.capacity);
            let tmp = Uint8Array::new_with_length(chunk as u32);
            tmp.copy_from(&src[off..off + chunk]);
            self.view.set(&tmp, abs as u32);
            remaining -= chunk;
            off += chunk;
            pos = (pos + chunk) % self.capacity;
        }
    }

    fn ring_read_u32(&self, pos: usize) -> u32 {
        let mut tmp = [0u8; 4];
        self.ring_read(pos, &mut tmp);
        u32::from_le_bytes(tmp)
    }

    fn ring_write_u32(&mut self, pos: usize, v: u32) {
        self.ring_write(pos, &v.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasm_bindgen_test::*;

    wasm_bindgen_test_configure!(run_in_browser);

    #[wasm_bindgen_test]
    fn sab_ring_roundtrip() {
        let sab = SharedArrayBuffer::new((HEADER_SIZE + 256) as u32);
        let mut writer = SabRing::new(sab.clone()).unwrap();
        let mut reader = SabRing::new(sab).unwrap();

        let s1 = writer.write(b"one").unwrap();
        let s2 = writer.write(b"two").unwrap();
        assert_eq!(s2, s1 + 1);

        assert_eq!(reader.read_next().unwrap(), b"one");
        assert_eq!(reader.read_next().unwrap(), b"two");
        assert!(reader.read_next().is_none());
    }
}
