//! The dedicated data-block pool named in the Messaging Client State data
//! model (spec.md §3) but left unspecified in detail: a simple free list of
//! reusable buffers, safe for concurrent get/put (spec.md §5 "Data blocks
//! are pooled; the pool must be safe for concurrent get/put").

use std::sync::Mutex;

use bytes::BytesMut;

pub struct BlockPool {
    free: Mutex<Vec<BytesMut>>,
    default_capacity: usize,
}

impl BlockPool {
    pub fn new(default_capacity: usize) -> Self {
        BlockPool {
            free: Mutex::new(Vec::new()),
            default_capacity,
        }
    }

    /// Fetches a buffer with at least `len` bytes of capacity, reusing a
    /// pooled one if available.
    pub fn get(&self, len: usize) -> BytesMut {
        let mut free = self.free.lock().unwrap();
        while let Some(mut buf) = free.pop() {
            if buf.capacity() >= len {
                buf.clear();
                return buf;
            }
        }
        BytesMut::with_capacity(len.max(self.default_capacity))
    }

    /// Returns a buffer to the pool for reuse. Buffers are not zeroed; the
    /// pool only reuses allocations, never stale contents (callers always
    /// `clear()` on `get`).
    pub fn put(&self, buf: BytesMut) {
        let mut free = self.free.lock().unwrap();
        // Cap the free list so a burst of oversized blocks doesn't pin
        // memory indefinitely.
        if free.len() < 256 {
            free.push(buf);
        }
    }

    pub fn len(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}
