//! A single-producer/single-consumer bounded ring, used for the dispatch and return
//! rings between the dispatcher and each shard.
//!
//! The cached-producer/cached-consumer algorithm is the same one `xsk/ring.rs` uses for
//! the kernel-shared XDP rings (`XskRingProd`/`XskRingCons`): each side keeps a local,
//! possibly-stale copy of the other side's head and only re-reads the shared atomic when
//! its local view says the ring might be full/empty. What's shared there by an mmap is
//! shared here by an `Arc`; what's a descriptor index there is a moved `T` here. This is
//! deliberately a dedicated SPSC structure rather than an MPMC queue — substituting one
//! would need to re-justify the perf cost.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

struct Slots<T> {
    mask: u32,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    producer: AtomicU32,
    consumer: AtomicU32,
}

// Safety: access to each slot is only ever performed by the producer (write, at indices
// it alone advances into) or the consumer (read, at indices it alone advances into);
// the atomics establish the happens-before edge between a producer's write and the
// consumer's later read of the same slot.
unsafe impl<T: Send> Sync for Slots<T> {}

/// The producer half of an SPSC ring. Not `Clone` — there is exactly one producer.
pub struct Producer<T> {
    ring: Arc<Slots<T>>,
    cached_producer: u32,
    cached_consumer: u32,
}

/// The consumer half of an SPSC ring. Not `Clone` — there is exactly one consumer.
pub struct Consumer<T> {
    ring: Arc<Slots<T>>,
    cached_producer: u32,
    cached_consumer: u32,
}

/// Construct the producer/consumer halves of a new ring with `capacity` slots.
///
/// `capacity` must be a power of two (mirrors the XDP ring's masking requirement).
pub fn spsc<T: Send>(capacity: u32) -> (Producer<T>, Consumer<T>) {
    assert!(capacity.is_power_of_two());

    let mut slots = Vec::with_capacity(capacity as usize);
    slots.resize_with(capacity as usize, || UnsafeCell::new(MaybeUninit::uninit()));

    let ring = Arc::new(Slots {
        mask: capacity - 1,
        slots: slots.into_boxed_slice(),
        producer: AtomicU32::new(0),
        consumer: AtomicU32::new(0),
    });

    (
        Producer {
            ring: ring.clone(),
            cached_producer: 0,
            cached_consumer: 0,
        },
        Consumer {
            ring,
            cached_producer: 0,
            cached_consumer: 0,
        },
    )
}

impl<T> Producer<T> {
    /// Number of free slots, up to `nb` (refreshes the cached consumer head only if the
    /// cached view says there isn't enough room).
    fn count_free(&mut self, nb: u32) -> u32 {
        let capacity = self.ring.mask + 1;
        let in_flight = self.cached_producer.wrapping_sub(self.cached_consumer);
        let free = capacity - in_flight;

        if free >= nb {
            return free;
        }

        self.cached_consumer = self.ring.consumer.load(Ordering::Acquire);
        let in_flight = self.cached_producer.wrapping_sub(self.cached_consumer);
        capacity - in_flight
    }

    /// Try to enqueue one item. Returns `Err(item)` if the ring is full.
    pub fn enqueue(&mut self, item: T) -> Result<(), T> {
        if self.count_free(1) < 1 {
            return Err(item);
        }

        let idx = (self.cached_producer & self.ring.mask) as usize;
        unsafe { (*self.ring.slots[idx].get()).write(item) };
        self.cached_producer = self.cached_producer.wrapping_add(1);

        // Release: all prior writes to the slot must be visible before the consumer
        // observes the new producer head.
        self.ring
            .producer
            .store(self.cached_producer, Ordering::Release);

        Ok(())
    }

    /// Enqueue up to `items.len()` items, draining from the back. Returns the number
    /// actually enqueued; undrained items remain in `items`.
    pub fn enqueue_burst(&mut self, items: &mut Vec<T>) -> usize {
        let room = self.count_free(items.len() as u32).min(items.len() as u32);
        let mut published = self.cached_producer;

        for item in items.drain(..room as usize) {
            let idx = (published & self.ring.mask) as usize;
            unsafe { (*self.ring.slots[idx].get()).write(item) };
            published = published.wrapping_add(1);
        }

        self.cached_producer = published;
        self.ring.producer.store(published, Ordering::Release);
        room as usize
    }

    pub fn is_full(&mut self) -> bool {
        self.count_free(1) == 0
    }
}

impl<T> Consumer<T> {
    fn count_available(&mut self, nb: u32) -> u32 {
        let mut available = self.cached_producer.wrapping_sub(self.cached_consumer);

        if available == 0 {
            self.cached_producer = self.ring.producer.load(Ordering::Acquire);
            available = self.cached_producer.wrapping_sub(self.cached_consumer);
        }

        available.min(nb)
    }

    /// Dequeue up to `max` items into a freshly allocated `Vec`.
    pub fn dequeue_burst(&mut self, max: u32) -> Vec<T> {
        let count = self.count_available(max);
        let mut out = Vec::with_capacity(count as usize);

        let mut cur = self.cached_consumer;
        for _ in 0..count {
            let idx = (cur & self.ring.mask) as usize;
            let item = unsafe { (*self.ring.slots[idx].get()).assume_init_read() };
            out.push(item);
            cur = cur.wrapping_add(1);
        }

        self.cached_consumer = cur;
        // Release: the consumer has finished reading those slots before the producer
        // is allowed to overwrite them.
        self.ring.consumer.store(cur, Ordering::Release);
        out
    }

    pub fn is_empty(&mut self) -> bool {
        self.count_available(1) == 0
    }
}
