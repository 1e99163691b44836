//! Stream-keyed pool of output rings
//!
//! The pool is constructed before the user handler and handed to it by the
//! pipeline; endpoints registered afterwards populate it. The pool is the
//! single source of truth for which response and event rings exist, and the
//! handler looks rings up at call time, so there is no back-reference from
//! the handler to the pipeline.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{ RelayError, Result };
use crate::ring::RingBuffer;

/// Registry of rings keyed by response/event stream id
pub struct RingBufferPool {
    rings: RwLock<Vec<(i32, Arc<RingBuffer>)>>,
    ring_capacity: usize,
}

impl RingBufferPool {
    /// Create an empty pool; registered rings get the given capacity
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            rings: RwLock::new(Vec::new()),
            ring_capacity,
        }
    }

    /// Register a ring for a stream id, allocating it lazily
    pub fn register(&self, stream_id: i32) -> Result<Arc<RingBuffer>> {
        let mut rings = self.rings.write();
        if rings.iter().any(|(id, _)| *id == stream_id) {
            return Err(
                RelayError::usage(format!("stream {} already has a registered ring", stream_id))
            );
        }
        let ring = Arc::new(RingBuffer::new(self.ring_capacity)?);
        rings.push((stream_id, Arc::clone(&ring)));
        Ok(ring)
    }

    /// Look up the ring for a stream id
    pub fn get(&self, stream_id: i32) -> Option<Arc<RingBuffer>> {
        self.rings
            .read()
            .iter()
            .find(|(id, _)| *id == stream_id)
            .map(|(_, ring)| Arc::clone(ring))
    }

    /// Visit the currently registered rings in registration order
    pub fn for_each<F>(&self, mut f: F) where F: FnMut(i32, &Arc<RingBuffer>) {
        for (stream_id, ring) in self.rings.read().iter() {
            f(*stream_id, ring);
        }
    }

    /// Number of registered rings
    pub fn len(&self) -> usize {
        self.rings.read().len()
    }

    /// True when no ring has been registered
    pub fn is_empty(&self) -> bool {
        self.rings.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_get() {
        let pool = RingBufferPool::new(1024);
        assert!(pool.is_empty());
        assert!(pool.get(10).is_none());

        let ring = pool.register(10).unwrap();
        assert_eq!(ring.capacity(), 1024);
        assert!(Arc::ptr_eq(&ring, &pool.get(10).unwrap()));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_duplicate_registration_is_usage_error() {
        let pool = RingBufferPool::new(1024);
        pool.register(10).unwrap();
        let err = pool.register(10).unwrap_err();
        assert!(err.is_usage());
    }

    #[test]
    fn test_for_each_preserves_registration_order() {
        let pool = RingBufferPool::new(1024);
        pool.register(3).unwrap();
        pool.register(1).unwrap();
        pool.register(2).unwrap();

        let mut seen = Vec::new();
        pool.for_each(|stream_id, _| seen.push(stream_id));
        assert_eq!(seen, vec![3, 1, 2]);
    }
}
