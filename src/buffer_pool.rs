use std::collections::VecDeque;
use std::sync::{Mutex, OnceLock};

use crate::ring_buffer::{RingBuffer, DEFAULT_RING_SIZE};

const RING_POOL_CAP: usize = 128;
const SEGMENT_POOL_CAP: usize = 256;
const SEGMENT_SIZE: usize = 4 * 1024;

/// Reuse pool for inbound ring buffers.
///
/// Connection churn would otherwise allocate and free one ring per accept;
/// closed connections return their rings here instead, grown capacity intact.
/// Acquisition never fails: an empty pool falls back to a fresh allocation,
/// and the pool capacity bounds how many idle rings are retained.
pub struct RingPool {
    idle: Mutex<VecDeque<RingBuffer>>,
    capacity: usize,
}

impl RingPool {
    pub fn new() -> Self {
        Self::with_capacity(RING_POOL_CAP)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        RingPool {
            idle: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Hands out an empty ring armed with the connection's growth limit,
    /// recycled when one is idle.
    pub fn acquire(&'static self, limit: usize) -> PooledRing {
        let ring = self.idle.lock().unwrap().pop_front();
        let mut ring = ring.unwrap_or_else(|| RingBuffer::with_capacity(DEFAULT_RING_SIZE));
        ring.reset();
        ring.set_limit(limit);
        PooledRing {
            ring: Some(ring),
            pool: self,
        }
    }

    /// Idle rings currently pooled.
    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap().len()
    }

    fn release(&self, ring: RingBuffer) {
        let mut idle = self.idle.lock().unwrap();
        if idle.len() < self.capacity {
            idle.push_back(ring);
        }
    }
}

impl Default for RingPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard for a connection's inbound ring; returns it to the pool on drop,
/// which happens at connection close.
pub struct PooledRing {
    ring: Option<RingBuffer>,
    pool: &'static RingPool,
}

impl std::ops::Deref for PooledRing {
    type Target = RingBuffer;

    #[inline]
    fn deref(&self) -> &RingBuffer {
        self.ring.as_ref().expect("ring already returned")
    }
}

impl std::ops::DerefMut for PooledRing {
    #[inline]
    fn deref_mut(&mut self) -> &mut RingBuffer {
        self.ring.as_mut().expect("ring already returned")
    }
}

impl Drop for PooledRing {
    fn drop(&mut self) {
        if let Some(ring) = self.ring.take() {
            self.pool.release(ring);
        }
    }
}

/// Reuse pool for the byte segments backing outbound lists and transit
/// scratch buffers. Segments come back cleared; their grown capacity is kept.
pub struct SegmentPool {
    idle: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
}

impl SegmentPool {
    pub fn new() -> Self {
        Self::with_capacity(SEGMENT_POOL_CAP)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        SegmentPool {
            idle: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn acquire(&'static self) -> PooledSegment {
        let seg = self.idle.lock().unwrap().pop_front();
        let mut seg = seg.unwrap_or_else(|| Vec::with_capacity(SEGMENT_SIZE));
        seg.clear();
        PooledSegment {
            seg: Some(seg),
            pool: self,
        }
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap().len()
    }

    fn release(&self, seg: Vec<u8>) {
        let mut idle = self.idle.lock().unwrap();
        if idle.len() < self.capacity {
            idle.push_back(seg);
        }
    }
}

impl Default for SegmentPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard for one pooled byte segment.
pub struct PooledSegment {
    seg: Option<Vec<u8>>,
    pool: &'static SegmentPool,
}

impl std::ops::Deref for PooledSegment {
    type Target = Vec<u8>;

    #[inline]
    fn deref(&self) -> &Vec<u8> {
        self.seg.as_ref().expect("segment already returned")
    }
}

impl std::ops::DerefMut for PooledSegment {
    #[inline]
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.seg.as_mut().expect("segment already returned")
    }
}

impl Drop for PooledSegment {
    fn drop(&mut self) {
        if let Some(seg) = self.seg.take() {
            self.pool.release(seg);
        }
    }
}

/// Process-wide ring pool, shared by every server in the process.
pub fn ring_pool() -> &'static RingPool {
    static POOL: OnceLock<RingPool> = OnceLock::new();
    POOL.get_or_init(RingPool::new)
}

/// Process-wide segment pool.
pub fn segment_pool() -> &'static SegmentPool {
    static POOL: OnceLock<SegmentPool> = OnceLock::new();
    POOL.get_or_init(SegmentPool::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring_buffer::DEFAULT_RING_LIMIT;

    fn leak<T>(pool: T) -> &'static T {
        Box::leak(Box::new(pool))
    }

    #[test]
    fn test_ring_recycled_with_grown_capacity() {
        let pool = leak(RingPool::new());
        {
            let mut ring = pool.acquire(DEFAULT_RING_LIMIT);
            ring.write(&vec![0u8; 100_000]).unwrap();
        }
        assert_eq!(pool.idle(), 1);

        let ring = pool.acquire(DEFAULT_RING_LIMIT);
        assert!(ring.is_empty());
        assert!(ring.capacity() >= 100_000, "recycled ring lost its growth");
    }

    #[test]
    fn test_ring_acquire_arms_the_limit() {
        let pool = leak(RingPool::new());
        let mut ring = pool.acquire(32 * 1024);
        ring.write(&[0u8; 32 * 1024]).unwrap();
        assert!(ring.write(&[0u8; 1]).is_err());
    }

    #[test]
    fn test_ring_pool_allocates_when_empty() {
        let pool = leak(RingPool::with_capacity(4));
        let a = pool.acquire(DEFAULT_RING_LIMIT);
        let b = pool.acquire(DEFAULT_RING_LIMIT);
        assert_eq!(pool.idle(), 0);
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_ring_pool_capacity_caps_returns() {
        let pool = leak(RingPool::with_capacity(1));
        let a = pool.acquire(DEFAULT_RING_LIMIT);
        let b = pool.acquire(DEFAULT_RING_LIMIT);
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_segment_acquired_clean() {
        let pool = leak(SegmentPool::new());
        {
            let mut seg = pool.acquire();
            seg.extend_from_slice(b"leftover");
        }
        let seg = pool.acquire();
        assert!(seg.is_empty());
        assert!(seg.capacity() > 0);
    }

    #[test]
    fn test_segment_pool_capacity_caps_returns() {
        let pool = leak(SegmentPool::with_capacity(2));
        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();
        drop(a);
        drop(b);
        drop(c);
        assert_eq!(pool.idle(), 2);
    }
}
