//! Cycle counting and CPU pinning.

use core::arch::x86_64::{__rdtscp, _mm_lfence};
use std::time::{Duration, Instant};

use crate::error::{AppError, Errno};

/// Serializing `RDTSCP` read, `lfence`d on both sides so neither earlier nor later
/// instructions are allowed to reorder across the timestamp read.
#[inline]
pub fn rdtsc() -> u64 {
    unsafe {
        _mm_lfence();
        let mut aux = 0u32;
        let ts = __rdtscp(&mut aux as *mut u32);
        _mm_lfence();
        ts
    }
}

/// Pin the calling thread to `cpu`, via `sched_setaffinity` rather than the pthread
/// wrapper — no extra libc surface needed for a single-thread, self-pinning call.
pub fn pin_to_cpu(cpu: usize) -> Result<(), AppError> {
    unsafe {
        let mut set: libc::cpu_set_t = core::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);

        let rc = libc::sched_setaffinity(
            0, // calling thread
            core::mem::size_of::<libc::cpu_set_t>(),
            &set,
        );

        if rc != 0 {
            return Err(AppError::Pin {
                cpu,
                source: Errno::new(),
            });
        }
    }
    Ok(())
}

/// Estimated TSC ticks per second, measured once at startup by timing a short sleep
/// against `rdtsc`. There is no portable way to read the TSC frequency without this
/// kind of calibration (no `cpuid` leaf is guaranteed present), and the preemption
/// timer (`preemption.rs`) needs *a* cycles-to-duration conversion to program
/// `setitimer` with something resembling `QUANTUM_CYCLE` cycles.
#[derive(Debug, Copy, Clone)]
pub struct TscCalibration {
    ticks_per_sec: f64,
}

impl TscCalibration {
    pub fn measure() -> Self {
        const CALIBRATION_SLEEP: Duration = Duration::from_millis(10);

        let t0 = rdtsc();
        let wall0 = Instant::now();
        std::thread::sleep(CALIBRATION_SLEEP);
        let t1 = rdtsc();
        let elapsed = wall0.elapsed();

        let ticks_per_sec = (t1 - t0) as f64 / elapsed.as_secs_f64();
        TscCalibration { ticks_per_sec }
    }

    pub fn cycles_to_duration(&self, cycles: u64) -> Duration {
        Duration::from_secs_f64(cycles as f64 / self.ticks_per_sec)
    }
}
