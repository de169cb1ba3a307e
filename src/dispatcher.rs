//! The dispatcher: single RX queue owner, shard load balancer, bulk reclaimer.

use tracing::warn;

use crate::iosub::RxSubstrate;
use crate::pool::{BufferPool, PacketBuf};
use crate::priority::ShardQueue;

/// Non-blocking RX burst size.
pub const B_RX: usize = 32;
/// Return-ring drain burst size during reconcile.
pub const R_RET: u32 = 8;
/// Per-shard in-flight ceiling that forces a reconcile.
pub const IN_FLIGHT_CEILING_PER_SHARD: u32 = 128;

pub struct Dispatcher<R: RxSubstrate> {
    rx: R,
    queue: ShardQueue,
    rx_pool: BufferPool,
    num_shards: u32,
    /// Checkin threshold: `R_ret * N * 2`.
    r_ckin: u32,
    dispatched_since_reconcile: u32,
}

impl<R: RxSubstrate> Dispatcher<R> {
    pub fn new(rx: R, queue: ShardQueue, rx_pool: BufferPool) -> Self {
        let num_shards = queue.len() as u32;
        Dispatcher {
            rx,
            queue,
            rx_pool,
            num_shards,
            r_ckin: R_RET * num_shards * 2,
            dispatched_since_reconcile: 0,
        }
    }

    /// One poll-and-dispatch pass: drain an RX burst and steer each packet to the
    /// currently best-ranked shard.
    pub fn poll_and_dispatch(&mut self) {
        let batch = self.rx.rx_burst(B_RX);

        for buf in batch {
            let mut shard = self.queue.pop_best();

            match shard.dispatch.enqueue(buf) {
                Ok(()) => {
                    shard.key.in_flight += 1;
                    self.queue.push(shard);
                    self.dispatched_since_reconcile += 1;
                }
                Err(buf) => {
                    warn!(shard = shard.id(), "dispatch ring full, dropping packet");
                    self.rx_pool.free_one(buf);
                    self.queue.push(shard);
                    self.reconcile();
                    continue;
                }
            }

            if self.should_reconcile() {
                self.reconcile();
            }
        }
    }

    fn should_reconcile(&self) -> bool {
        if self.dispatched_since_reconcile >= self.r_ckin {
            return true;
        }
        self.total_in_flight() >= self.num_shards * IN_FLIGHT_CEILING_PER_SHARD
    }

    fn total_in_flight(&self) -> u32 {
        // Cheap enough at N shards (single-digit to low hundreds); avoids
        // threading a running total through every push/pop in the priority
        // queue for what is, in this crate, a rarely-hot path.
        self.queue.iter().map(|e| e.key.in_flight).sum()
    }

    /// Total in-flight count across every shard.
    pub fn queue_in_flight_for_test(&self) -> u32 {
        self.total_in_flight()
    }

    /// Every shard's current reconciliation version.
    pub fn versions_for_test(&self) -> Vec<u32> {
        self.queue.iter().map(|e| e.key.version).collect()
    }

    /// Drain every shard's return ring and bulk-free the reclaimed buffers.
    pub fn reconcile(&mut self) {
        let mut reclaimed: Vec<Box<PacketBuf>> = Vec::new();
        let n = self.queue.len();

        for _ in 0..n {
            let mut shard = self.queue.pop_best();
            let mut drained = 0u32;

            loop {
                let burst = shard.returns.dequeue_burst(R_RET);
                if burst.is_empty() {
                    break;
                }
                drained += burst.len() as u32;
                reclaimed.extend(burst);
            }

            shard.key.in_flight = shard.key.in_flight.saturating_sub(drained);
            shard.key.version += 1;
            self.queue.push(shard);
        }

        self.dispatched_since_reconcile = 0;
        if !reclaimed.is_empty() {
            self.rx_pool.free_bulk(reclaimed);
        }
    }
}
