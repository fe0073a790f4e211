//! Byte buffer allocation.
//!
//! The driver acquires its network and output buffers through the
//! [`BufferPool`] trait and releases each acquired buffer exactly once.
//! [`RecyclingBufferPool`] is the default allocator, keeping a bounded
//! free list per size class so steady-state traffic allocates nothing.

use std::{
    collections::HashMap,
    sync::Mutex,
};

use bytes::BytesMut;

/// Allocator for the driver's network and output buffers.
pub trait BufferPool: Send + Sync {
    /// Obtain a cleared buffer with at least `size` bytes of capacity.
    fn acquire(&self, size: usize) -> BytesMut;

    /// Return a buffer to the pool. Each acquired buffer is released at
    /// most once; the pool may retain or drop it.
    fn release(&self, buffer: BytesMut);
}

/// Default number of buffers retained per size class.
const DEFAULT_RETAINED: usize = 16;

/// A size-classed free-list allocator.
///
/// Buffers are bucketed by their capacity rounded up to a power of two.
/// `release` clears the buffer and retains it unless the bucket is full.
#[derive(Debug)]
pub struct RecyclingBufferPool {
    buckets: Mutex<HashMap<usize, Vec<BytesMut>>>,
    max_retained: usize,
}

impl Default for RecyclingBufferPool {
    fn default() -> Self { Self::new(DEFAULT_RETAINED) }
}

impl RecyclingBufferPool {
    /// Build a pool retaining at most `max_retained` buffers per size class.
    #[must_use]
    pub fn new(max_retained: usize) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            max_retained,
        }
    }

    fn bucket_for(size: usize) -> usize { size.next_power_of_two().max(64) }
}

impl BufferPool for RecyclingBufferPool {
    fn acquire(&self, size: usize) -> BytesMut {
        let bucket = Self::bucket_for(size);
        let recycled = self
            .buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get_mut(&bucket)
            .and_then(Vec::pop);
        recycled.unwrap_or_else(|| BytesMut::with_capacity(bucket))
    }

    fn release(&self, mut buffer: BytesMut) {
        buffer.clear();
        let bucket = Self::bucket_for(buffer.capacity());
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let slot = buckets.entry(bucket).or_default();
        if slot.len() < self.max_retained {
            slot.push(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_meets_requested_capacity() {
        let pool = RecyclingBufferPool::default();
        let buffer = pool.acquire(1000);
        assert!(buffer.capacity() >= 1000);
        assert!(buffer.is_empty());
    }

    #[test]
    fn released_buffers_are_reused() {
        let pool = RecyclingBufferPool::default();
        let mut buffer = pool.acquire(4096);
        buffer.extend_from_slice(b"junk");
        let capacity = buffer.capacity();
        pool.release(buffer);

        let again = pool.acquire(4096);
        assert_eq!(again.capacity(), capacity);
        assert!(again.is_empty(), "recycled buffer must be cleared");
    }

    #[test]
    fn retention_is_bounded() {
        let pool = RecyclingBufferPool::new(1);
        pool.release(BytesMut::with_capacity(128));
        pool.release(BytesMut::with_capacity(128));
        let buckets = pool.buckets.lock().expect("lock");
        assert_eq!(buckets.get(&128).map(Vec::len), Some(1));
    }
}
