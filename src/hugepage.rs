//! Huge-page-backed coroutine stack arena: a single huge-page-backed anonymous
//! mapping sliced into N*K chunks of `STACK_SIZE`, one per coroutine slot. Ownership
//! of a slice transfers to its coroutine slot and is never relocated.
//!
//! Only compiled when the `stacks-from-hugepage` feature is active; the default
//! build uses `corosensei`'s own `DefaultStack`.

use std::sync::Arc;

use corosensei::stack::{Stack, StackPointer};

use crate::error::{AppError, Errno};

/// A 1 GiB anonymous `MAP_HUGETLB` mapping, sliced into fixed-size stacks.
///
/// One `Arena` is created once at shard-thread startup (or process startup, shared
/// read-only-by-layout across shards) and handed out one slice per coroutine slot;
/// the mapping itself outlives every slice via the `Arc`.
pub struct Arena {
    base: *mut u8,
    len: usize,
}

// Safety: the mapping is never written to concurrently in overlapping regions —
// each `HugepageStack` owns a disjoint, fixed slice for its whole lifetime.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// `slice_size` and `slices` must together not exceed 1 GiB (a single huge page
    /// on x86_64 with `MAP_HUGETLB`'s default 2 MiB page size, rounded up).
    pub fn new(slice_size: usize, slices: usize) -> Result<Arc<Self>, AppError> {
        let len = slice_size * slices;
        let addr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(AppError::Substrate(Errno::new()));
        }

        Ok(Arc::new(Arena {
            base: addr as *mut u8,
            len,
        }))
    }

    /// Carve out the `index`-th `slice_size`-byte slice. Caller must ensure slices
    /// don't overlap — the shard startup sequence hands out indices `0..N*K` once,
    /// and a slice is never relocated after that.
    pub fn slice(self: &Arc<Self>, index: usize, slice_size: usize) -> HugepageStack {
        assert!((index + 1) * slice_size <= self.len);
        HugepageStack {
            arena: self.clone(),
            offset: index * slice_size,
            size: slice_size,
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

/// One coroutine's stack, carved from a shared [`Arena`].
pub struct HugepageStack {
    arena: Arc<Arena>,
    offset: usize,
    size: usize,
}

unsafe impl Stack for HugepageStack {
    fn base(&self) -> StackPointer {
        let top = unsafe { self.arena.base.add(self.offset + self.size) };
        unsafe { StackPointer::new(top as usize).expect("non-null stack base") }
    }

    fn limit(&self) -> StackPointer {
        let bottom = unsafe { self.arena.base.add(self.offset) };
        unsafe { StackPointer::new(bottom as usize).expect("non-null stack limit") }
    }
}
