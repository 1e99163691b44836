//! SPSC byte ring buffer carrying framed records
//!
//! The ring is a power-of-two byte region plus a trailer of cache-line
//! padded producer and consumer cursors. Records are framed with an 8-byte
//! header (record length then message-type id) and aligned to 8 bytes. A
//! record that would straddle the end of the buffer is preceded by a
//! padding record that fills the tail; the real record is placed at offset
//! zero, so every delivered payload is contiguous.
//!
//! Exactly one thread may write and exactly one thread may read a given
//! instance for its lifetime. Neither path blocks or allocates.
//!
//! ## Example
//!
//! ```
//! use relay::RingBuffer;
//!
//! let ring = RingBuffer::new(16 * 1024)?;
//! ring.write(1, b"payload")?;
//!
//! let consumed = ring.read(
//!     |msg_type_id, payload| {
//!         assert_eq!(msg_type_id, 1);
//!         assert_eq!(payload, b"payload");
//!     },
//!     10,
//! );
//! assert_eq!(consumed, 16); // 8-byte header + payload, 8-byte aligned
//! # Ok::<(), relay::RelayError>(())
//! ```

use std::cell::UnsafeCell;
use std::mem;
use std::ptr;
use std::slice;
use std::sync::atomic::{ AtomicU64, Ordering };

use static_assertions::const_assert_eq;

use crate::constants::{ PADDING_MSG_TYPE_ID, RECORD_ALIGNMENT, RECORD_HEADER_LENGTH };
use crate::error::{ RelayError, Result };

/// Cache-line padded atomic cursor
///
/// 128-byte alignment keeps each cursor on its own pair of cache lines so
/// producer and consumer updates do not false-share.
#[repr(align(128))]
#[derive(Debug)]
pub(crate) struct PaddedAtomicU64(AtomicU64);

impl PaddedAtomicU64 {
    pub(crate) fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    #[inline]
    pub(crate) fn load(&self, order: Ordering) -> u64 {
        self.0.load(order)
    }

    #[inline]
    pub(crate) fn store(&self, value: u64, order: Ordering) {
        self.0.store(value, order)
    }
}

const_assert_eq!(mem::size_of::<PaddedAtomicU64>(), 128);
const_assert_eq!(mem::align_of::<PaddedAtomicU64>(), 128);

/// Round a record length up to the record alignment
#[inline]
const fn align_record(length: usize) -> usize {
    (length + RECORD_ALIGNMENT - 1) & !(RECORD_ALIGNMENT - 1)
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("max_record_length", &self.max_record_length)
            .finish()
    }
}

/// Bounded single-producer single-consumer queue of framed byte records
pub struct RingBuffer {
    /// Data region, indexed through the cursor masks
    buffer: UnsafeCell<Box<[u8]>>,
    /// Data region size in bytes (power of 2)
    capacity: usize,
    /// Mask for cursor-to-index conversion
    mask: u64,
    /// Largest accepted record (header + payload)
    max_record_length: usize,
    /// Producer cursor, advanced with release ordering after the payload
    /// bytes are in place
    producer: PaddedAtomicU64,
    /// Consumer cursor, advanced with release ordering after each record is
    /// handed to the read callback
    consumer: PaddedAtomicU64,
    /// Producer-side cache of the consumer cursor, refreshed only when the
    /// cached value suggests the ring is full
    cached_consumer: PaddedAtomicU64,
}

// SAFETY: the buffer cell is written by the sole producer thread and read by
// the sole consumer thread; the producer publishes bytes with a release
// store of its cursor before the consumer's acquire load can expose them,
// and the consumer releases consumed regions back the same way. Enforcing
// the one-writer/one-reader discipline is the owner's contract.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Create a ring with the given data-region capacity in bytes
    pub fn new(capacity: usize) -> Result<Self> {
        if !capacity.is_power_of_two() {
            return Err(RelayError::config("ring capacity must be a power of 2"));
        }
        if capacity < RECORD_ALIGNMENT * 8 {
            return Err(RelayError::config("ring capacity too small to frame records"));
        }

        Ok(Self {
            buffer: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
            capacity,
            mask: (capacity - 1) as u64,
            max_record_length: capacity / 8,
            producer: PaddedAtomicU64::new(0),
            consumer: PaddedAtomicU64::new(0),
            cached_consumer: PaddedAtomicU64::new(0),
        })
    }

    /// Data-region capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently buffered between the cursors
    pub fn size(&self) -> usize {
        let head = self.consumer.load(Ordering::Acquire);
        let tail = self.producer.load(Ordering::Acquire);
        (tail - head) as usize
    }

    /// Largest record (header + payload) the ring accepts
    pub fn max_record_length(&self) -> usize {
        self.max_record_length
    }

    /// Write one framed record
    ///
    /// Returns `Ok(false)` when the free span between the cursors cannot
    /// hold the record plus any end-of-buffer padding; the writer retries
    /// under its idle strategy. Reserved type ids, empty payloads and
    /// oversized records are rejected outright.
    pub fn write(&self, msg_type_id: i32, payload: &[u8]) -> Result<bool> {
        if msg_type_id <= 0 {
            return Err(
                RelayError::invalid_message(format!("message type id {} is reserved", msg_type_id))
            );
        }
        if payload.is_empty() {
            return Err(RelayError::invalid_message("zero-length payload"));
        }
        let record_length = RECORD_HEADER_LENGTH + payload.len();
        if record_length > self.max_record_length {
            return Err(
                RelayError::invalid_message(
                    format!(
                        "record length {} exceeds maximum {}",
                        record_length,
                        self.max_record_length
                    )
                )
            );
        }

        let aligned = align_record(record_length);
        let tail = self.producer.load(Ordering::Relaxed);
        let tail_index = (tail & self.mask) as usize;
        let to_end = self.capacity - tail_index;
        let required = if aligned > to_end { aligned + to_end } else { aligned };

        let mut head = self.cached_consumer.load(Ordering::Relaxed);
        if self.capacity - ((tail - head) as usize) < required {
            head = self.consumer.load(Ordering::Acquire);
            self.cached_consumer.store(head, Ordering::Relaxed);
            if self.capacity - ((tail - head) as usize) < required {
                return Ok(false);
            }
        }

        unsafe {
            if aligned > to_end {
                // Fill the tail with a padding record and frame at offset 0
                self.put_header(tail_index, to_end as i32, PADDING_MSG_TYPE_ID);
                self.put_header(0, record_length as i32, msg_type_id);
                self.put_payload(RECORD_HEADER_LENGTH, payload);
            } else {
                self.put_header(tail_index, record_length as i32, msg_type_id);
                self.put_payload(tail_index + RECORD_HEADER_LENGTH, payload);
            }
        }

        self.producer.store(tail + (required as u64), Ordering::Release);
        Ok(true)
    }

    /// Read up to `limit` records, invoking the handler for each in write
    /// order
    ///
    /// The consumer cursor is advanced after each handler invocation, so
    /// the payload slice stays valid for the duration of the call. Padding
    /// records are skipped and do not count toward the limit. Returns the
    /// number of bytes consumed.
    pub fn read<F>(&self, mut handler: F, limit: usize) -> usize where F: FnMut(i32, &[u8]) {
        let head = self.consumer.load(Ordering::Relaxed);
        let tail = self.producer.load(Ordering::Acquire);

        let mut bytes_read = 0u64;
        let mut records = 0usize;
        while records < limit && head + bytes_read < tail {
            let index = ((head + bytes_read) & self.mask) as usize;
            let (record_length, msg_type_id) = unsafe { self.get_header(index) };
            bytes_read += align_record(record_length as usize) as u64;

            if msg_type_id == PADDING_MSG_TYPE_ID {
                self.consumer.store(head + bytes_read, Ordering::Release);
                continue;
            }

            let payload_length = (record_length as usize) - RECORD_HEADER_LENGTH;
            let payload = unsafe {
                self.payload_slice(index + RECORD_HEADER_LENGTH, payload_length)
            };
            handler(msg_type_id, payload);
            self.consumer.store(head + bytes_read, Ordering::Release);
            records += 1;
        }

        bytes_read as usize
    }

    /// # Safety
    /// `index` must be record aligned and leave 8 bytes before the end of
    /// the data region; only the producer thread may call this.
    unsafe fn put_header(&self, index: usize, record_length: i32, msg_type_id: i32) {
        let buf = (*self.buffer.get()).as_mut_ptr();
        ptr::copy_nonoverlapping(record_length.to_le_bytes().as_ptr(), buf.add(index), 4);
        ptr::copy_nonoverlapping(msg_type_id.to_le_bytes().as_ptr(), buf.add(index + 4), 4);
    }

    /// # Safety
    /// The span `[index, index + payload.len())` must lie inside the region
    /// reserved by the current write; only the producer thread may call this.
    unsafe fn put_payload(&self, index: usize, payload: &[u8]) {
        let buf = (*self.buffer.get()).as_mut_ptr();
        ptr::copy_nonoverlapping(payload.as_ptr(), buf.add(index), payload.len());
    }

    /// # Safety
    /// `index` must point at a published record header; only the consumer
    /// thread may call this.
    unsafe fn get_header(&self, index: usize) -> (i32, i32) {
        let buf = (*self.buffer.get()).as_ptr();
        let mut length = [0u8; 4];
        let mut type_id = [0u8; 4];
        ptr::copy_nonoverlapping(buf.add(index), length.as_mut_ptr(), 4);
        ptr::copy_nonoverlapping(buf.add(index + 4), type_id.as_mut_ptr(), 4);
        (i32::from_le_bytes(length), i32::from_le_bytes(type_id))
    }

    /// # Safety
    /// The span must lie inside a published record that the consumer cursor
    /// has not yet released.
    unsafe fn payload_slice(&self, index: usize, length: usize) -> &[u8] {
        let buf = (*self.buffer.get()).as_ptr();
        slice::from_raw_parts(buf.add(index), length)
    }
}
