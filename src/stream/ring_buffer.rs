//! Lock-free single-producer single-consumer byte ring
//!
//! One drainer thread writes, one consumer thread reads. The two index
//! atomics use acquire/release ordering; one slot is always left empty so
//! that a full buffer is distinguishable from an empty one.

use std::cell::UnsafeCell;
use std::cmp;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Cache-line aligned index to keep producer and consumer off the same line.
#[repr(align(64))]
struct AlignedIndex(AtomicUsize);

/// Single-producer single-consumer ring buffer.
///
/// All operations are non-blocking. `write` never overwrites unread data
/// and returns a short count when full; `read` returns 0 when empty.
pub struct RingBuffer {
    buf: UnsafeCell<Box<[u8]>>,
    read_pos: AlignedIndex,
    write_pos: AlignedIndex,
    capacity: usize,
}

// Exactly one producer and one consumer may access a buffer; the index
// protocol makes the written region visible before the index that covers it.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 1, "ring buffer capacity must exceed 1");
        Self {
            buf: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
            read_pos: AlignedIndex(AtomicUsize::new(0)),
            write_pos: AlignedIndex(AtomicUsize::new(0)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes available for reading.
    pub fn available(&self) -> usize {
        let w = self.write_pos.0.load(Ordering::Acquire);
        let r = self.read_pos.0.load(Ordering::Acquire);
        if w >= r {
            w - r
        } else {
            self.capacity - r + w
        }
    }

    /// Bytes accepted by the next write. Always strictly less than capacity:
    /// one slot stays reserved to distinguish full from empty.
    pub fn free_space(&self) -> usize {
        self.capacity - self.available() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    pub fn is_full(&self) -> bool {
        self.free_space() == 0
    }

    /// Append bytes, returning how many were accepted. Producer side only.
    pub fn write(&self, data: &[u8]) -> usize {
        let to_write = cmp::min(data.len(), self.free_space());
        if to_write == 0 {
            return 0;
        }

        let w = self.write_pos.0.load(Ordering::Relaxed);
        let first = cmp::min(to_write, self.capacity - w);

        unsafe {
            let base = (*self.buf.get()).as_mut_ptr();
            std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(w), first);
            if to_write > first {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr().add(first),
                    base,
                    to_write - first,
                );
            }
        }

        self.write_pos
            .0
            .store((w + to_write) % self.capacity, Ordering::Release);
        to_write
    }

    /// Consume bytes into `out`, returning how many were copied. Consumer
    /// side only.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let n = self.copy_out(out);
        if n > 0 {
            let r = self.read_pos.0.load(Ordering::Relaxed);
            self.read_pos
                .0
                .store((r + n) % self.capacity, Ordering::Release);
        }
        n
    }

    /// Like `read` but does not advance the read index.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        self.copy_out(out)
    }

    fn copy_out(&self, out: &mut [u8]) -> usize {
        let to_read = cmp::min(out.len(), self.available());
        if to_read == 0 {
            return 0;
        }

        let r = self.read_pos.0.load(Ordering::Relaxed);
        let first = cmp::min(to_read, self.capacity - r);

        unsafe {
            let base = (*self.buf.get()).as_ptr();
            std::ptr::copy_nonoverlapping(base.add(r), out.as_mut_ptr(), first);
            if to_read > first {
                std::ptr::copy_nonoverlapping(
                    base,
                    out.as_mut_ptr().add(first),
                    to_read - first,
                );
            }
        }

        to_read
    }

    /// Reset both indices. Must not run concurrently with either side.
    pub fn clear(&self) {
        self.read_pos.0.store(0, Ordering::Release);
        self.write_pos.0.store(0, Ordering::Release);
    }
}
