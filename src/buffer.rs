//! Transfer buffer pool and RAII leases.
//!
//! Every byte crossing the reactor travels through a [`ByteLease`]: read
//! deliveries fill one before the data observers run, and each queued write
//! owns one until its completion. A lease returns its block to the pool when
//! dropped, which is how the "release unconditionally on completion" rule is
//! enforced without bookkeeping at every call site.

use std::cell::{Cell, RefCell};
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

/// Pool of fixed-size transfer blocks.
///
/// `lease` never fails: when the pool is empty a fresh block is heap
/// allocated instead, and simply dropped on release rather than growing the
/// pool past its configured capacity.
#[derive(Clone)]
pub struct BufferPool {
    inner: Rc<PoolInner>,
}

struct PoolInner {
    lease_size: usize,
    capacity: usize,
    available: RefCell<Vec<Box<[u8]>>>,
    outstanding: Cell<usize>,
    total_leases: Cell<u64>,
    fallback_allocations: Cell<u64>,
}

/// Point-in-time pool counters for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Configured number of pooled blocks.
    pub capacity: usize,
    /// Blocks currently sitting in the pool.
    pub available: usize,
    /// Pooled leases currently held by callers or in-flight requests.
    pub outstanding: usize,
    /// Leases handed out over the pool's lifetime.
    pub total_leases: u64,
    /// Leases served from the heap because the pool was empty.
    pub fallback_allocations: u64,
}

impl BufferPool {
    /// Creates a pool of `capacity` blocks of `lease_size` bytes each.
    pub fn new(capacity: usize, lease_size: usize) -> Self {
        let blocks = (0..capacity)
            .map(|_| vec![0u8; lease_size].into_boxed_slice())
            .collect();
        Self {
            inner: Rc::new(PoolInner {
                lease_size,
                capacity,
                available: RefCell::new(blocks),
                outstanding: Cell::new(0),
                total_leases: Cell::new(0),
                fallback_allocations: Cell::new(0),
            }),
        }
    }

    /// Size in bytes of each pooled block.
    pub fn lease_size(&self) -> usize {
        self.inner.lease_size
    }

    /// Takes an empty lease with the full block writable.
    pub fn lease(&self) -> ByteLease {
        self.lease_sized(self.inner.lease_size)
    }

    /// Takes a lease pre-filled with a copy of `data`.
    ///
    /// Payloads larger than the pooled block size get an exact-size heap
    /// block so callers never have to split writes to fit the pool.
    pub fn lease_copy(&self, data: &[u8]) -> ByteLease {
        let mut lease = self.lease_sized(data.len().max(self.inner.lease_size));
        lease.block_mut()[..data.len()].copy_from_slice(data);
        lease.len = data.len();
        lease
    }

    fn lease_sized(&self, min_size: usize) -> ByteLease {
        self.inner.total_leases.set(self.inner.total_leases.get() + 1);

        if min_size <= self.inner.lease_size {
            if let Some(block) = self.inner.available.borrow_mut().pop() {
                self.inner.outstanding.set(self.inner.outstanding.get() + 1);
                return ByteLease {
                    block: Some(block),
                    len: 0,
                    pool: Some(Rc::clone(&self.inner)),
                };
            }
        }

        self.inner
            .fallback_allocations
            .set(self.inner.fallback_allocations.get() + 1);
        ByteLease {
            block: Some(vec![0u8; min_size].into_boxed_slice()),
            len: 0,
            pool: None,
        }
    }

    /// Current pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.inner.capacity,
            available: self.inner.available.borrow().len(),
            outstanding: self.inner.outstanding.get(),
            total_leases: self.inner.total_leases.get(),
            fallback_allocations: self.inner.fallback_allocations.get(),
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("lease_size", &self.inner.lease_size)
            .field("stats", &self.stats())
            .finish()
    }
}

/// One leased transfer block.
///
/// Dereferences to the filled portion. The block goes back to its pool when
/// the lease drops; [`detach`](ByteLease::detach) takes the bytes out
/// instead.
pub struct ByteLease {
    block: Option<Box<[u8]>>,
    len: usize,
    pool: Option<Rc<PoolInner>>,
}

impl ByteLease {
    /// Number of filled bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` when nothing has been filled.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total writable size of the underlying block.
    pub fn capacity(&self) -> usize {
        self.block.as_ref().map_or(0, |b| b.len())
    }

    /// The whole block, beyond the filled length. Used by the read path to
    /// hand the kernel the full chunk.
    pub(crate) fn block_mut(&mut self) -> &mut [u8] {
        match self.block.as_mut() {
            Some(block) => block,
            None => &mut [],
        }
    }

    /// Marks `len` bytes as filled after the kernel wrote into the block.
    pub(crate) fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.capacity());
        self.len = len.min(self.capacity());
    }

    /// Consumes the lease, keeping the filled bytes and returning nothing to
    /// the pool.
    pub fn detach(mut self) -> Vec<u8> {
        let block = self.block.take();
        if let Some(pool) = self.pool.take() {
            pool.outstanding.set(pool.outstanding.get() - 1);
        }
        match block {
            Some(block) => {
                let mut bytes = block.into_vec();
                bytes.truncate(self.len);
                bytes
            }
            None => Vec::new(),
        }
    }
}

impl Deref for ByteLease {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.block.as_ref() {
            Some(block) => &block[..self.len],
            None => &[],
        }
    }
}

impl DerefMut for ByteLease {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        match self.block.as_mut() {
            Some(block) => &mut block[..len],
            None => &mut [],
        }
    }
}

impl Drop for ByteLease {
    fn drop(&mut self) {
        let block = self.block.take();
        if let Some(pool) = self.pool.take() {
            pool.outstanding.set(pool.outstanding.get() - 1);
            if let Some(block) = block {
                debug_assert_eq!(block.len(), pool.lease_size);
                pool.available.borrow_mut().push(block);
            }
        }
    }
}

impl std::fmt::Debug for ByteLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteLease")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_returns_to_pool_on_drop() {
        let pool = BufferPool::new(2, 64);
        assert_eq!(pool.stats().available, 2);

        {
            let lease = pool.lease();
            assert_eq!(lease.capacity(), 64);
            assert_eq!(pool.stats().available, 1);
            assert_eq!(pool.stats().outstanding, 1);
        }

        let stats = pool.stats();
        assert_eq!(stats.available, 2);
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.total_leases, 1);
    }

    #[test]
    fn exhausted_pool_falls_back_to_heap() {
        let pool = BufferPool::new(1, 32);
        let _first = pool.lease();
        let second = pool.lease();

        assert_eq!(second.capacity(), 32);
        let stats = pool.stats();
        assert_eq!(stats.available, 0);
        assert_eq!(stats.outstanding, 1);
        assert_eq!(stats.fallback_allocations, 1);

        // The fallback block is not adopted by the pool.
        drop(second);
        assert_eq!(pool.stats().available, 0);
    }

    #[test]
    fn lease_copy_fills_and_sizes() {
        let pool = BufferPool::new(1, 8);

        let small = pool.lease_copy(b"ping");
        assert_eq!(&*small, b"ping");
        assert_eq!(small.capacity(), 8);
        drop(small);

        let big = pool.lease_copy(&[7u8; 100]);
        assert_eq!(big.len(), 100);
        assert_eq!(big.capacity(), 100);
        assert_eq!(pool.stats().fallback_allocations, 1);
        // Oversized block must not be pushed into the fixed-size pool.
        drop(big);
        assert_eq!(pool.stats().available, 1);
    }

    #[test]
    fn detach_keeps_bytes_out_of_pool() {
        let pool = BufferPool::new(1, 16);
        let lease = pool.lease_copy(b"keep");
        let bytes = lease.detach();

        assert_eq!(bytes, b"keep");
        assert_eq!(pool.stats().available, 0);
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn set_len_bounds_deref() {
        let pool = BufferPool::new(1, 8);
        let mut lease = pool.lease();
        assert!(lease.is_empty());

        lease.block_mut()[..3].copy_from_slice(b"abc");
        lease.set_len(3);
        assert_eq!(&*lease, b"abc");
        assert_eq!(lease.len(), 3);
    }
}
