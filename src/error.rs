//! Error types at the edges of the system.
//!
//! Inside the hot loop, fatal dispositions are not `Result`s: they are documented
//! panics via [`fatal`], because the buffer-ownership invariants they guard offer no
//! reconciliation path once violated.

use core::fmt;

/// A raw OS error, as returned by a failing syscall.
pub struct Errno(pub libc::c_int);

impl Errno {
    pub(crate) fn new() -> Self {
        Errno(unsafe { *libc::__errno_location() })
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = unsafe { libc::strerror(self.0) };
        let cstr = unsafe { core::ffi::CStr::from_ptr(st) };
        write!(f, "{}", cstr.to_string_lossy())
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({}: {})", self.0, self)
    }
}

/// Errors surfaced at component boundaries: startup, substrate bind, backend open.
///
/// Once a shard or the dispatcher is running, violations of the buffer-ownership
/// invariants are not representable as one of these — they go through [`fatal`] instead.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("packet I/O substrate error: {0}")]
    Substrate(#[source] Errno),

    #[error("key-value backend error: {0}")]
    Backend(#[from] rocksdb::Error),

    #[error(
        "pool sanity check failed: {pool} pool size {size} must exceed {shards} shards * {per_shard} per shard"
    )]
    PoolTooSmall {
        pool: &'static str,
        size: usize,
        shards: usize,
        per_shard: usize,
    },

    #[error("thread pinning failed for cpu {cpu}: {source}")]
    Pin { cpu: usize, source: Errno },
}

/// Log a fatal invariant violation and terminate this thread's unwind. Used for
/// return-ring enqueue failure, TX allocation failure, backend lookup error, and
/// unknown request kind — conditions with no reconciliation path once hit.
///
/// This is a documented panic rather than `libc::abort()` so that `catch_unwind` in
/// tests can observe it; in production there is no supervisor that would restart a
/// shard mid-corruption, so the effect is the same: the process stops making progress
/// on the violated invariant.
#[track_caller]
pub fn fatal(msg: impl fmt::Display) -> ! {
    tracing::error!("{msg}");
    panic!("{msg}");
}
