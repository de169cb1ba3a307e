//! The per-shard scheduler: schedule a coroutine slice, take in newly dispatched
//! work, flush replies, flush completed buffers back to the dispatcher.

use std::sync::Arc;

use tracing::{trace, warn};

use crate::backend::KvBackend;
use crate::config::Tunables;
use crate::coro::{Job, Resumed, Slot};
use crate::cycles::rdtsc;
use crate::error::fatal;
use crate::iosub::{IfaceInfo, TxSubstrate};
use crate::pool::{BufferPool, PacketBuf};
use crate::preemption;
use crate::ring::{Consumer, Producer};
use crate::runqueue::RunQueue;
use crate::wire::{self, AppHeader, EthernetHeader, Ipv4Header, UdpHeader};

/// A single shard's scheduler state: dispatch/return rings, TX substrate, idle stack,
/// run queue, pending batches.
pub struct Shard<T: TxSubstrate> {
    id: u32,
    dispatch_rx: Consumer<Box<PacketBuf>>,
    return_tx: Producer<Box<PacketBuf>>,
    tx: T,
    tx_pool: BufferPool,
    backend: Arc<dyn KvBackend>,
    /// Idle coroutine slots (LIFO — "available in the shard's idle stack").
    idle: Vec<Slot>,
    run_queue: RunQueue<Slot>,
    pending_tx: Vec<Box<PacketBuf>>,
    pending_return: Vec<Box<PacketBuf>>,
    quanta_since_intake: u32,
    iface: IfaceInfo,
    tunables: Tunables,
}

impl<T: TxSubstrate> Shard<T> {
    pub fn new(
        id: u32,
        dispatch_rx: Consumer<Box<PacketBuf>>,
        return_tx: Producer<Box<PacketBuf>>,
        tx: T,
        tx_pool: BufferPool,
        backend: Arc<dyn KvBackend>,
        slots: Vec<Slot>,
        iface: IfaceInfo,
        tunables: Tunables,
    ) -> Self {
        Shard {
            id,
            dispatch_rx,
            return_tx,
            tx,
            tx_pool,
            backend,
            idle: slots,
            run_queue: RunQueue::new(),
            pending_tx: Vec::with_capacity(tunables.tx_batch_size),
            pending_return: Vec::with_capacity(tunables.reconcile_burst as usize),
            quanta_since_intake: 0,
            iface,
            tunables,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Run one iteration of the scheduler's main loop.
    pub fn run_once(&mut self) {
        let (force_dispatch, force_flush) = self.schedule();
        self.dispatch_intake(force_dispatch);
        self.tx_flush(force_flush);
        self.return_flush(force_flush);
    }

    /// Step 1: pop the next runnable slot, give it one scheduling slice, and
    /// route it to the run queue (still busy) or the idle stack (finished).
    fn schedule(&mut self) -> (bool, bool) {
        let Some(mut slot) = self.run_queue.pop() else {
            return (true, !self.pending_tx.is_empty());
        };

        // Cap the raw LAS budget (unbounded by itself) against how much of the
        // current dispatch-intake period is left, so one coroutine can never run
        // past the next scheduled intake.
        let raw_budget = self.run_queue.next_quantum_budget(slot.quanta()).unwrap_or(1);
        let remaining_in_period = self
            .tunables
            .dispatch_dequeue_period
            .saturating_sub(self.quanta_since_intake)
            .max(1);
        preemption::set_quanta_budget(raw_budget.min(remaining_in_period));

        let start = rdtsc();
        let resumed = slot.resume();
        slot.add_cycles(rdtsc().wrapping_sub(start));

        // Counts every scheduling step, completions included, so the periodic
        // intake below actually fires — a point-get that completes without ever
        // yielding must still advance this counter.
        self.quanta_since_intake += 1;

        match resumed {
            Resumed::Yielded => {
                self.run_queue.push_continuation(slot);
            }
            Resumed::Completed { rx, tx } => {
                self.pending_return.push(rx);
                self.pending_tx.push(tx);
                self.idle.push(slot);
            }
        }

        (false, false)
    }

    /// Step 2: take in newly dispatched work from the dispatch ring.
    fn dispatch_intake(&mut self, force_dispatch: bool) {
        let should_intake = force_dispatch
            || (self.quanta_since_intake >= self.tunables.dispatch_dequeue_period
                && !self.idle.is_empty());

        if !should_intake || self.idle.is_empty() {
            return;
        }

        let want = self.idle.len().min(self.tunables.dispatch_dequeue_burst);
        let batch = self.dispatch_rx.dequeue_burst(want as u32);

        for buf in batch {
            self.bind_or_return(buf);
        }

        self.quanta_since_intake = 0;
    }

    fn bind_or_return(&mut self, buf: Box<PacketBuf>) {
        // Safety: every buffer reaching the shard was built by a wire-parsing
        // substrate that wrote these headers at their fixed offsets.
        let eth: EthernetHeader = unsafe { wire::read_at(buf.as_slice(), 0) };
        let ip: Ipv4Header = unsafe { wire::read_at(buf.as_slice(), EthernetHeader::LEN) };

        if !wire::headers_valid(&eth, &ip, &self.iface.mac, self.iface.ipv4) {
            trace!(shard = self.id, "dropping malformed packet");
            self.pending_return.push(buf);
            return;
        }

        let udp: UdpHeader =
            unsafe { wire::read_at(buf.as_slice(), EthernetHeader::LEN + Ipv4Header::LEN) };
        let app: AppHeader = unsafe { wire::read_at(buf.as_slice(), wire::APP_HDR_OFFSET) };

        let Some(mut slot) = self.idle.pop() else {
            // Can't happen: caller bounds the dequeue burst to `self.idle.len()`.
            self.pending_return.push(buf);
            return;
        };

        let mut tx_buf = match self.tx_pool.alloc() {
            Some(b) => b,
            None => fatal("TX pool exhausted"),
        };

        wire::build_reply(
            tx_buf.as_mut_slice(),
            &eth,
            &ip,
            &udp,
            &app,
            self.iface.mac,
            self.iface.ipv4,
            self.tunables.server_port,
        );
        tx_buf.set_len(wire::REPLY_LEN);
        tx_buf.l2_len = EthernetHeader::LEN as u16;
        tx_buf.l3_len = Ipv4Header::LEN as u16;
        tx_buf.checksum_offload = true;

        // A request kind the backend doesn't implement (range-scan) or that wasn't
        // recognized at all both resolve to the same fatal disposition once the
        // coroutine runs; `coro::Slot::start` is where that check actually fires.
        let kind = crate::wire::JobKind::from_wire(app.req_type())
            .unwrap_or(crate::wire::JobKind::RangeScan);

        slot.start(
            Job {
                kind,
                key: app.key(),
                rx: buf,
                tx: tx_buf,
            },
            self.backend.clone(),
        );
        self.run_queue.push_new(slot);
    }

    /// Step 3: flush the pending TX batch to the shard's TX queue.
    fn tx_flush(&mut self, force_flush: bool) {
        if !(force_flush || self.pending_tx.len() >= self.tunables.tx_batch_size) {
            return;
        }
        if self.pending_tx.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.pending_tx);
        let requested = batch.len();
        let sent = self.tx.tx_burst(batch);

        if sent < requested {
            // A short burst is logged and not retried; there's no reliable-delivery
            // layer underneath to hand the unsent packets back to.
            warn!(shard = self.id, requested, sent, "short TX burst");
        }
    }

    /// Step 4: flush the pending return batch to the dispatcher's return ring.
    fn return_flush(&mut self, force_flush: bool) {
        if !(force_flush || self.pending_return.len() >= self.tunables.reconcile_burst as usize) {
            return;
        }
        if self.pending_return.is_empty() {
            return;
        }

        let mut batch = std::mem::take(&mut self.pending_return);
        let requested = batch.len();
        let sent = self.return_tx.enqueue_burst(&mut batch);

        if sent < requested {
            // A short enqueue here means buffer ownership was silently lost — not
            // a condition that can be retried or logged through.
            fatal("short return-ring enqueue: buffer ownership broken");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::MemBackend;
    use crate::iosub::MockNic;
    use crate::ring::spsc;
    use crate::wire::{JobKind, MacAddr};
    use corosensei::stack::DefaultStack;

    fn build_request(
        pool: &BufferPool,
        my_mac: MacAddr,
        my_ip: u32,
        id: u32,
        key: u32,
    ) -> Box<PacketBuf> {
        let mut buf = pool.alloc().unwrap();
        {
            let eth = EthernetHeader {
                dst: my_mac,
                src: MacAddr([9; 6]),
                ether_type: 0x0800u16.to_be(),
            };
            let ip = Ipv4Header {
                version_ihl: Ipv4Header::VERSION_IHL_NO_OPTIONS,
                tos: 0,
                total_length: 0,
                packet_id: 0,
                fragment_offset: 0,
                ttl: 64,
                next_proto: wire::IPPROTO_UDP,
                hdr_checksum: 0,
                src_addr: 0x0A000001u32.to_be(),
                dst_addr: my_ip.to_be(),
            };
            let udp = UdpHeader {
                src_port: 5555u16.to_be(),
                dst_port: 8001u16.to_be(),
                length: 0,
                checksum: 0,
            };
            let app = AppHeader {
                id: id.to_be(),
                req_type: JobKind::POINT_GET.to_be(),
                req_size: key.to_be(),
                run_ns: 0,
            };
            let s = buf.as_mut_slice();
            macro_rules! put {
                ($off:expr, $val:expr) => {{
                    let bytes = unsafe {
                        core::slice::from_raw_parts(
                            &$val as *const _ as *const u8,
                            core::mem::size_of_val(&$val),
                        )
                    };
                    s[$off..$off + bytes.len()].copy_from_slice(bytes);
                }};
            }
            put!(0, eth);
            put!(EthernetHeader::LEN, ip);
            put!(EthernetHeader::LEN + Ipv4Header::LEN, udp);
            put!(wire::APP_HDR_OFFSET, app);
        }
        buf.set_len(wire::REPLY_LEN);
        buf
    }

    fn slots(n: u32) -> Vec<Slot> {
        (0..n)
            .map(|i| Slot::new(i, DefaultStack::new(crate::coro::STACK_SIZE).unwrap()))
            .collect()
    }

    #[test]
    fn single_request_produces_one_reply_with_echoed_header_fields() {
        let my_mac = MacAddr([1; 6]);
        let my_ip = 0x0A000002u32;
        let nic = MockNic::new(
            IfaceInfo {
                mac: my_mac,
                ipv4: my_ip,
            },
            1,
        );
        let rx_pool = BufferPool::new("rx", 8, 1, 1).unwrap();
        let tx_pool = BufferPool::new("tx", 8, 1, 1).unwrap();
        let backend: Arc<dyn KvBackend> = Arc::new(MemBackend::populated([7]));

        let request = build_request(&rx_pool, my_mac, my_ip, 0x11223344, 7);

        // The scheduler reads straight off its dispatch ring; the dispatcher's
        // load-balancing logic is covered separately in `dispatcher.rs`.
        let (mut dispatch_p, dispatch_c) = spsc::<Box<PacketBuf>>(4);
        let (return_p, _return_c) = spsc::<Box<PacketBuf>>(8);
        dispatch_p.enqueue(request).ok();

        let mut shard = Shard::new(
            0,
            dispatch_c,
            return_p,
            nic.tx_handle(0),
            tx_pool,
            backend,
            slots(2),
            IfaceInfo {
                mac: my_mac,
                ipv4: my_ip,
            },
            Tunables::DEFAULT,
        );

        // Drive enough iterations to intake, run the coroutine to completion, and
        // flush both batches.
        for _ in 0..10 {
            shard.run_once();
        }

        let sent = nic.drain_sent(0);
        assert_eq!(sent.len(), 1);
        let reply = &sent[0];
        let eth: EthernetHeader = unsafe { wire::read_at(reply.as_slice(), 0) };
        let app: AppHeader = unsafe { wire::read_at(reply.as_slice(), wire::APP_HDR_OFFSET) };
        assert_eq!(eth.dst, MacAddr([9; 6]));
        assert_eq!(u32::from_be(app.id), 0x11223344);
        assert_eq!(app.key(), 7);
        assert_eq!(u32::from_be(app.run_ns), 0);
    }
}
