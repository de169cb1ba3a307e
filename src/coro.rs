//! Coroutine slots: one stackful coroutine per pooled slot, resumed by the shard
//! scheduler and preempted via the thread-local trap of `preemption.rs`.

use std::sync::Arc;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use crate::backend::KvBackend;
use crate::error::fatal;
use crate::pool::PacketBuf;
use crate::preemption;
use crate::runqueue::Quanta;
use crate::wire::JobKind;

#[cfg(feature = "stacks-from-hugepage")]
pub type SlotStack = crate::hugepage::HugepageStack;
#[cfg(not(feature = "stacks-from-hugepage"))]
pub type SlotStack = DefaultStack;

/// Stack size per coroutine slot.
pub const STACK_SIZE: usize = 128 * 1024;

/// A job bound to a coroutine slot.
pub struct Job {
    pub kind: JobKind,
    pub key: u32,
    /// The RX buffer this job was dispatched with; returned to the shard's return
    /// batch on completion.
    pub rx: Box<PacketBuf>,
    /// The TX buffer built during dispatch intake; returned to the shard's TX batch
    /// on completion.
    pub tx: Box<PacketBuf>,
}

type Body = Coroutine<(), (), (Box<PacketBuf>, Box<PacketBuf>), SlotStack>;

/// What resuming a slot's coroutine produced.
pub enum Resumed {
    /// Still busy; suspended at a preemption point.
    Yielded,
    /// Finished; hands back the RX and TX buffers it was working with.
    Completed {
        rx: Box<PacketBuf>,
        tx: Box<PacketBuf>,
    },
}

/// One pooled coroutine slot. Lifecycle: idle (no `coroutine`, `stack_spare`
/// holding its reusable stack) or busy (`coroutine` bound to a job, `stack_spare`
/// empty).
pub struct Slot {
    id: u32,
    coroutine: Option<Body>,
    stack_spare: Option<SlotStack>,
    quanta: u32,
    cycles: u64,
}

impl Slot {
    pub fn new(id: u32, stack: SlotStack) -> Self {
        Slot {
            id,
            coroutine: None,
            stack_spare: Some(stack),
            quanta: 0,
            cycles: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_idle(&self) -> bool {
        self.coroutine.is_none()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn add_cycles(&mut self, cycles: u64) {
        self.cycles += cycles;
    }

    /// Bind `job` to this (idle) slot and start its coroutine. The coroutine arms
    /// the preemption trap as its first action and disarms it right before
    /// returning, so the trap is live for exactly the span this job is on-CPU.
    pub fn start(&mut self, job: Job, backend: Arc<dyn KvBackend>) {
        let stack = self
            .stack_spare
            .take()
            .expect("Slot::start called on a busy slot");
        self.quanta = 0;

        self.coroutine = Some(Coroutine::new(stack, move |yielder: &Yielder<(), ()>, ()| {
            unsafe { preemption::arm(suspend_shim, yielder as *const Yielder<(), ()> as *const ()) };

            if job.kind != JobKind::PointGet {
                preemption::disarm();
                fatal(format!("unknown request kind {:?}", job.kind));
            }

            // Small stack buffer: the backend's contract guarantees a fixed-width
            // value, never a caller-supplied size.
            let mut scratch = [0u8; 64];
            backend.point_get(job.key, &mut scratch);

            preemption::disarm();
            (job.rx, job.tx)
        }));
    }

    /// Run the bound coroutine for one scheduling slice.
    pub fn resume(&mut self) -> Resumed {
        let coroutine = self
            .coroutine
            .as_mut()
            .expect("Slot::resume called on an idle slot");

        match coroutine.resume(()) {
            CoroutineResult::Yield(()) => {
                self.quanta += 1;
                Resumed::Yielded
            }
            CoroutineResult::Return((rx, tx)) => {
                let finished = self.coroutine.take().expect("just matched Return");
                self.stack_spare = Some(finished.into_stack());
                Resumed::Completed { rx, tx }
            }
        }
    }
}

impl Quanta for Slot {
    fn quanta(&self) -> u32 {
        self.quanta
    }
}

unsafe fn suspend_shim(ctx: *const ()) {
    let yielder = &*(ctx as *const Yielder<(), ()>);
    yielder.suspend(());
}
