//! Preemption trap registration and contract.
//!
//! A true instruction-counting compiler pass that traps every `Q` cycles of useful
//! work is out of scope here; this crate uses a substitute that's acceptable as long
//! as the handler touches no non-async-signal-safe state: a per-thread `SIGVTALRM`
//! timer (`setitimer(ITIMER_VIRTUAL, ..)` measures only CPU time spent running this
//! thread, so it tracks "useful work" rather than firing while the shard is blocked)
//! and a swap into the coroutine's own suspend point instead of a raw `siglongjmp`.
//!
//! The handler touches exactly one thread-local `Cell`, which is async-signal-safe:
//! no allocation, no locks, no syscalls beyond what `corosensei`'s context swap itself
//! performs.

use core::cell::Cell;

use crate::error::{AppError, Errno};

/// Suspend function type: calling it yields the currently-running coroutine back to
/// the scheduler. Type-erased because the concrete `Yielder<I, Y>` lives in
/// `coro.rs` and the trap handler must not depend on coroutine generics.
pub type SuspendFn = unsafe fn(*const ());

thread_local! {
    /// The currently-armed suspend target. `None` when no coroutine is on-CPU — the
    /// trap must not fire then.
    static CURRENT_YIELD: Cell<Option<(SuspendFn, *const ())>> = Cell::new(None);

    /// Ticks remaining in the current quantum budget; written by `set_quanta_budget`,
    /// decremented by every trap fire, and only yields once it reaches zero.
    static QUANTA_BUDGET: Cell<u32> = Cell::new(1);
}

/// Arm the trap: a coroutine calls this as the very first thing it does, with `ctx`
/// pointing at its own `Yielder`. The registration then stays valid across every
/// subsequent suspend/resume of that same coroutine — a signal delivered while the
/// coroutine is on-CPU always finds a live target, because corosensei's context
/// switch returns control to right after the in-signal-handler `suspend()` call, not
/// to the scheduler's code — the registration is set once per coroutine invocation,
/// not re-armed on every resume.
///
/// # Safety
/// `ctx` must remain valid and correctly typed for `suspend` until the matching
/// [`disarm`] call — i.e. until the coroutine that armed it has returned.
pub unsafe fn arm(suspend: SuspendFn, ctx: *const ()) {
    CURRENT_YIELD.with(|c| c.set(Some((suspend, ctx))));
}

/// Disarm the trap. A coroutine calls this immediately before it returns, so a timer
/// tick firing after the coroutine has completed (but before the scheduler resumes a
/// different one) finds nothing armed rather than a dangling `Yielder` pointer.
pub fn disarm() {
    CURRENT_YIELD.with(|c| c.set(None));
}

/// Program how many timer ticks must elapse before the trap actually suspends.
/// FIFO and LIFO-loop always use 1 (every tick yields); LAS uses the budget computed
/// by [`crate::runqueue`]'s LAS discipline, capped by the caller against the
/// dispatch-intake period.
pub fn set_quanta_budget(n: u32) {
    QUANTA_BUDGET.with(|b| b.set(n.max(1)));
}

/// Invoked by the quantum timer's signal handler (or, under the `empty-handler`
/// feature, by nothing at all — see [`Handler`]).
fn trap_fire() {
    let should_yield = QUANTA_BUDGET.with(|b| {
        let left = b.get().saturating_sub(1);
        b.set(left);
        left == 0
    });

    if !should_yield {
        return;
    }

    CURRENT_YIELD.with(|c| {
        if let Some((suspend, ctx)) = c.get() {
            unsafe { suspend(ctx) };
        }
    });
}

/// Which trap behavior this build uses.
///
/// Default: every trap fire yields once its quantum budget reaches zero (FIFO,
/// LIFO-loop). Under `las`, `set_quanta_budget` already carries the LAS-computed
/// budget so the same countdown logic applies unchanged. Under `empty-handler`, the
/// timer still fires (so cycle accounting stays comparable) but the handler never
/// calls `suspend`, which disables preemption for measurement runs.
pub fn on_timer_tick() {
    #[cfg(feature = "empty-handler")]
    {
        // Record-only: still drains the budget counter so `time-stage` accounting
        // stays meaningful, but never suspends.
        QUANTA_BUDGET.with(|b| b.set(b.get().saturating_sub(1).max(1)));
    }
    #[cfg(not(feature = "empty-handler"))]
    {
        trap_fire();
    }
}

/// A per-thread virtual-time interval timer that calls [`on_timer_tick`] via
/// `SIGVTALRM`. One instance lives for the lifetime of a shard's thread.
pub struct QuantumTimer {
    _private: (),
}

impl QuantumTimer {
    /// Install the `SIGVTALRM` handler and arm an interval timer approximating `Q`
    /// cycles using `cal` (see [`crate::cycles::TscCalibration`]).
    ///
    /// Only one `QuantumTimer` may exist per thread; this is enforced by a
    /// thread-local guard rather than process-wide state.
    pub fn install(
        quantum_cycles: u64,
        cal: crate::cycles::TscCalibration,
    ) -> Result<Self, AppError> {
        thread_local! {
            static INSTALLED: Cell<bool> = Cell::new(false);
        }
        INSTALLED.with(|i| {
            assert!(!i.get(), "QuantumTimer::install called twice on one thread");
            i.set(true);
        });

        unsafe {
            let mut action: libc::sigaction = core::mem::zeroed();
            action.sa_sigaction = handle_sigvtalrm as usize;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);

            if libc::sigaction(libc::SIGVTALRM, &action, core::ptr::null_mut()) != 0 {
                return Err(AppError::Substrate(Errno::new()));
            }

            let interval = cal.cycles_to_duration(quantum_cycles);
            let spec = libc::itimerval {
                it_interval: to_timeval(interval),
                it_value: to_timeval(interval),
            };

            if libc::setitimer(libc::ITIMER_VIRTUAL, &spec, core::ptr::null_mut()) != 0 {
                return Err(AppError::Substrate(Errno::new()));
            }
        }

        Ok(QuantumTimer { _private: () })
    }
}

impl Drop for QuantumTimer {
    fn drop(&mut self) {
        unsafe {
            let zero = libc::itimerval {
                it_interval: libc::timeval {
                    tv_sec: 0,
                    tv_usec: 0,
                },
                it_value: libc::timeval {
                    tv_sec: 0,
                    tv_usec: 0,
                },
            };
            libc::setitimer(libc::ITIMER_VIRTUAL, &zero, core::ptr::null_mut());
        }
    }
}

fn to_timeval(d: std::time::Duration) -> libc::timeval {
    libc::timeval {
        tv_sec: d.as_secs() as libc::time_t,
        tv_usec: d.subsec_micros().max(1) as libc::suseconds_t,
    }
}

extern "C" fn handle_sigvtalrm(_sig: libc::c_int) {
    on_timer_tick();
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    static SUSPENDS: AtomicU32 = AtomicU32::new(0);

    unsafe fn record_suspend(_ctx: *const ()) {
        SUSPENDS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn trap_does_not_fire_when_disarmed() {
        SUSPENDS.store(0, Ordering::SeqCst);
        trap_fire();
        assert_eq!(SUSPENDS.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn armed_trap_yields_once_budget_exhausted() {
        SUSPENDS.store(0, Ordering::SeqCst);
        unsafe {
            arm(record_suspend, core::ptr::null());
        }
        set_quanta_budget(2);
        trap_fire();
        assert_eq!(SUSPENDS.load(Ordering::SeqCst), 0);
        trap_fire();
        assert_eq!(SUSPENDS.load(Ordering::SeqCst), 1);
        disarm();
    }
}
