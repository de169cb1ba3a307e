//! The packet I/O substrate interface.
//!
//! The kernel-bypass NIC substrate is an external collaborator, specified only by
//! the interface the core consumes: non-blocking receive burst on queue 0, non-blocking
//! transmit burst on queue *w*, and the ambient MAC/IP identity a bound interface
//! carries. [`RxSubstrate`] and [`TxSubstrate`] are that interface; [`MockNic`] is the
//! one concrete, in-process implementation this crate carries, standing in for a real
//! AF_XDP/DPDK binding — its own I/O internals are out of scope for the core, not for
//! the test harness that drives the core.

use std::collections::VecDeque;
use std::sync::Arc;

use spin::Mutex;

use crate::pool::PacketBuf;
use crate::wire::MacAddr;

/// Network identity of a bound interface: its MAC address and the local IPv4 address
/// passed on the command line.
#[derive(Debug, Copy, Clone)]
pub struct IfaceInfo {
    pub mac: MacAddr,
    pub ipv4: u32,
}

/// The dispatcher's single RX queue (queue 0).
pub trait RxSubstrate: Send {
    /// Non-blocking receive of up to `max` packets.
    fn rx_burst(&mut self, max: usize) -> Vec<Box<PacketBuf>>;
}

/// One shard's TX queue (queue *w*).
pub trait TxSubstrate: Send {
    /// Transmit as many of `batch` as the substrate accepts right now, taking
    /// ownership of the whole batch regardless: a short burst is logged, not retried,
    /// and the buffers the driver didn't accept are lost, not returned to the shard.
    /// Returns the number actually accepted.
    fn tx_burst(&mut self, batch: Vec<Box<PacketBuf>>) -> usize;
}

/// An in-process substitute for a real kernel-bypass NIC binding.
///
/// One [`MockNic::rx_handle`] feeds the dispatcher's RX queue; one
/// [`MockNic::tx_handle`] per shard records what that shard transmitted, so tests can
/// assert on reply contents.
pub struct MockNic {
    inbox: Arc<Mutex<VecDeque<Box<PacketBuf>>>>,
    sent: Vec<Arc<Mutex<Vec<Box<PacketBuf>>>>>,
    pub info: IfaceInfo,
}

impl MockNic {
    pub fn new(info: IfaceInfo, num_shards: usize) -> Self {
        MockNic {
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            sent: (0..num_shards)
                .map(|_| Arc::new(Mutex::new(Vec::new())))
                .collect(),
            info,
        }
    }

    /// Inject one already-built [`PacketBuf`] as if the driver had just received it.
    pub fn inject(&self, buf: Box<PacketBuf>) {
        self.inbox.lock().push_back(buf);
    }

    pub fn pending_rx(&self) -> usize {
        self.inbox.lock().len()
    }

    pub fn rx_handle(&self) -> MockRx {
        MockRx {
            inbox: self.inbox.clone(),
        }
    }

    pub fn tx_handle(&self, shard: usize) -> MockTx {
        MockTx {
            sent: self.sent[shard].clone(),
        }
    }

    /// Drain everything a given shard has transmitted so far (test assertion hook).
    pub fn drain_sent(&self, shard: usize) -> Vec<Box<PacketBuf>> {
        std::mem::take(&mut *self.sent[shard].lock())
    }
}

pub struct MockRx {
    inbox: Arc<Mutex<VecDeque<Box<PacketBuf>>>>,
}

impl RxSubstrate for MockRx {
    fn rx_burst(&mut self, max: usize) -> Vec<Box<PacketBuf>> {
        let mut inbox = self.inbox.lock();
        let n = max.min(inbox.len());
        inbox.drain(..n).collect()
    }
}

pub struct MockTx {
    sent: Arc<Mutex<Vec<Box<PacketBuf>>>>,
}

impl TxSubstrate for MockTx {
    fn tx_burst(&mut self, batch: Vec<Box<PacketBuf>>) -> usize {
        let n = batch.len();
        self.sent.lock().extend(batch);
        n
    }
}
