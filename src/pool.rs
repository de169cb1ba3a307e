//! Typed buffer pools (RX/TX) and the packet buffer they hand out.
//!
//! `BufferPool<T>` is generic over the pooled element the way `rte_mempool` is
//! parameterized over element size rather than type — one implementation serves both
//! the RX and TX pools. Allocation/free is a `spin::Mutex`-guarded free list: the RX
//! pool is freed in bulk by the dispatcher alone (single free-side), but the TX pool
//! is allocated from concurrently by every shard, which is exactly the cross-shard
//! contention `spin` is already pulled in for in the teacher crate ("for exclusion of
//! multiple devices on the same queue").
//!
//! The per-core allocation cache that a real NIC driver's mempool would keep is an
//! internal performance optimization of the external driver and is not modeled here —
//! the core only needs the pool's capacity for the startup sanity check.

use std::sync::Arc;

use spin::Mutex;

use crate::error::AppError;

/// Maximum Ethernet frame payload this crate ever builds or parses.
pub const FRAME_CAP: usize = 2048;

/// A pooled, owned packet buffer.
///
/// Tracks the per-packet TX metadata (`l2_len`, `l3_len`, checksum-offload flag) rather
/// than relying on pool-init-time values, so a TX path that resets buffer metadata
/// after pool init can't desync offload flags from the header bytes actually on the
/// wire.
#[derive(Debug)]
pub struct PacketBuf {
    data: Box<[u8; FRAME_CAP]>,
    len: usize,
    pub l2_len: u16,
    pub l3_len: u16,
    pub checksum_offload: bool,
}

impl PacketBuf {
    fn new() -> Self {
        PacketBuf {
            data: Box::new([0; FRAME_CAP]),
            len: 0,
            l2_len: 0,
            l3_len: 0,
            checksum_offload: false,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the logical length of the buffer, as if `rte_pktmbuf_append` had been
    /// called for that many bytes.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= FRAME_CAP, "packet buffer overflow");
        self.len = len;
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.l2_len = 0;
        self.l3_len = 0;
        self.checksum_offload = false;
    }
}

struct Inner {
    free: Mutex<Vec<Box<PacketBuf>>>,
    capacity: usize,
}

/// A pool of pre-allocated [`PacketBuf`]s.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

impl BufferPool {
    /// Create a pool with `capacity` pre-allocated buffers.
    ///
    /// `name`, `shards`, and `per_shard` are only used to produce the sanity-check
    /// error if the pool is too small to cover every shard's worst-case outstanding
    /// buffers; callers pass the bound appropriate to the pool (RX or TX).
    pub fn new(
        name: &'static str,
        capacity: usize,
        shards: usize,
        per_shard: usize,
    ) -> Result<Self, AppError> {
        if capacity <= shards * per_shard {
            return Err(AppError::PoolTooSmall {
                pool: name,
                size: capacity,
                shards,
                per_shard,
            });
        }

        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(Box::new(PacketBuf::new()));
        }

        Ok(BufferPool {
            inner: Arc::new(Inner {
                free: Mutex::new(free),
                capacity,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Allocate one buffer. `None` means the pool is exhausted.
    pub fn alloc(&self) -> Option<Box<PacketBuf>> {
        let mut buf = self.inner.free.lock().pop()?;
        buf.clear();
        Some(buf)
    }

    /// Return a single buffer to the pool.
    pub fn free_one(&self, buf: Box<PacketBuf>) {
        self.inner.free.lock().push(buf);
    }

    /// Return many buffers in a single lock acquisition — the dispatcher's reconcile
    /// pass deliberately batches all shards' returned RX buffers into one bulk-free
    /// call rather than freeing one at a time per shard.
    pub fn free_bulk(&self, bufs: Vec<Box<PacketBuf>>) {
        self.inner.free.lock().extend(bufs);
    }

    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_exhausts_and_free_replenishes() {
        let pool = BufferPool::new("test", 4, 1, 1).unwrap();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        let c = pool.alloc().unwrap();
        assert_eq!(pool.available(), 1);
        pool.free_bulk(vec![a, b, c]);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn sanity_check_rejects_undersized_pool() {
        assert!(BufferPool::new("test", 4, 2, 2).is_err());
    }
}
