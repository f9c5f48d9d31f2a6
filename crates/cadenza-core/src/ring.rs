//! Single-producer/single-consumer byte ring buffers.
//!
//! Writers stage one message field by field, then publish it with
//! [`RingWriter::commit_write`]. A message either lands whole or not at all,
//! so the reader never observes a half-written message.

use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};

/// Producer side of a byte ring buffer.
pub struct RingWriter {
    producer: HeapProd<u8>,
    pending: Vec<u8>,
    overflowed: bool,
}

/// Consumer side of a byte ring buffer.
pub struct RingReader {
    consumer: HeapCons<u8>,
}

/// Create a byte ring buffer holding up to `capacity` bytes.
pub fn byte_ring(capacity: usize) -> (RingWriter, RingReader) {
    let capacity = capacity.max(16);
    let (producer, consumer) = HeapRb::<u8>::new(capacity).split();
    (
        RingWriter {
            producer,
            pending: Vec::with_capacity(capacity),
            overflowed: false,
        },
        RingReader { consumer },
    )
}

impl RingWriter {
    #[inline]
    fn stage(&mut self, bytes: &[u8]) -> bool {
        if self.overflowed || self.pending.len() + bytes.len() > self.pending.capacity() {
            self.overflowed = true;
            return false;
        }
        self.pending.extend_from_slice(bytes);
        true
    }

    #[inline]
    pub fn write_bool(&mut self, value: bool) -> bool {
        self.stage(&[value as u8])
    }

    #[inline]
    pub fn write_u8(&mut self, value: u8) -> bool {
        self.stage(&[value])
    }

    #[inline]
    pub fn write_u32(&mut self, value: u32) -> bool {
        self.stage(&value.to_le_bytes())
    }

    #[inline]
    pub fn write_i32(&mut self, value: i32) -> bool {
        self.stage(&value.to_le_bytes())
    }

    #[inline]
    pub fn write_f32(&mut self, value: f32) -> bool {
        self.stage(&value.to_le_bytes())
    }

    #[inline]
    pub fn write_u64(&mut self, value: u64) -> bool {
        self.stage(&value.to_le_bytes())
    }

    #[inline]
    pub fn write_bytes(&mut self, bytes: &[u8]) -> bool {
        self.stage(bytes)
    }

    /// Publish the staged message. Returns `false` and drops it when it does not fit.
    pub fn commit_write(&mut self) -> bool {
        let fits = !self.overflowed && self.pending.len() <= self.producer.vacant_len();
        if fits && !self.pending.is_empty() {
            self.producer.push_slice(&self.pending);
        }
        self.pending.clear();
        self.overflowed = false;
        fits
    }

    /// Drop the staged message without publishing it.
    pub fn discard(&mut self) {
        self.pending.clear();
        self.overflowed = false;
    }

    pub fn capacity(&self) -> usize {
        self.pending.capacity()
    }

    pub fn vacant_len(&self) -> usize {
        self.producer.vacant_len()
    }
}

impl RingReader {
    #[inline]
    pub fn is_data_available(&self) -> bool {
        !self.consumer.is_empty()
    }

    pub fn occupied_len(&self) -> usize {
        self.consumer.occupied_len()
    }

    #[inline]
    fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        if self.consumer.occupied_len() < N {
            return None;
        }
        let mut bytes = [0u8; N];
        self.consumer.pop_slice(&mut bytes);
        Some(bytes)
    }

    pub fn read_bool(&mut self) -> Option<bool> {
        self.read_array::<1>().map(|b| b[0] != 0)
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.read_array::<1>().map(|b| b[0])
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        self.read_array::<4>().map(u32::from_le_bytes)
    }

    pub fn read_i32(&mut self) -> Option<i32> {
        self.read_array::<4>().map(i32::from_le_bytes)
    }

    pub fn read_f32(&mut self) -> Option<f32> {
        self.read_array::<4>().map(f32::from_le_bytes)
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        self.read_array::<8>().map(u64::from_le_bytes)
    }

    /// Fill `out` completely, or read nothing.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> bool {
        if self.consumer.occupied_len() < out.len() {
            return false;
        }
        self.consumer.pop_slice(out);
        true
    }

    /// Drop everything currently queued.
    pub fn clear(&mut self) {
        let pending = self.consumer.occupied_len();
        self.consumer.skip(pending);
    }
}
