//! A size-classed byte allocator with delayed physical reclamation.
//!
//! [`SlabAllocator`] hands out fixed-alignment byte buffers and recycles them by size
//! class once freed, but never hands a freed region back out (or returns it to the OS)
//! until a fixed TTL has elapsed since the `dealloc` call that freed it. That quarantine
//! window is what lets a caller (namely `slabtable-skiplist`) expose raw pointers into
//! this memory to concurrent readers without reference counting: a reader that finishes
//! within the TTL sees intact bytes even if a writer has since freed the region.
//!
//! # Threading contract
//! `SlabAllocator` is `Send + Sync` so that it can sit behind a shared reference
//! alongside the atomics-based skiplist it backs, but it provides no internal
//! synchronization of its own: callers must ensure `alloc`, `dealloc`, and `dup` are
//! never invoked concurrently with one another (exactly the "writers must be externally
//! serialized" contract the skiplist and table above it already require). Nothing here
//! prevents a concurrent *reader* from dereferencing a previously-returned pointer, which
//! is the entire point.

use std::alloc::{alloc as alloc_raw, dealloc as dealloc_raw, Layout};
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::ptr::{self, NonNull};
use std::time::{Duration, Instant};

/// Alignment used for every buffer this allocator hands out.
pub const ALIGN: usize = 8;
/// Requests at or below this size are served from a size-classed free list; larger
/// requests are allocated and quarantined individually.
pub const MAX_SMALL: usize = 256;
/// Number of size classes covering `ALIGN..=MAX_SMALL`.
pub const SMALL_CLASSES: usize = MAX_SMALL / ALIGN;
/// Number of slabs carved out of a single refill block for a size class.
const NREFILL: usize = 20;

#[inline]
#[must_use]
fn round_up(sz: usize) -> usize {
    debug_assert!(sz > 0, "zero-size allocations are not meaningful here");
    sz.div_ceil(ALIGN) * ALIGN
}

#[inline]
#[must_use]
fn class_of(rounded: usize) -> usize {
    rounded / ALIGN - 1
}

/// One size class's free list, plus the backing blocks it has ever carved slabs from.
struct SmallClass {
    /// Slabs that are either ready for reuse (deadline already past) or still
    /// quarantined. Not kept in any particular order; `alloc` does a linear scan.
    free: Vec<(NonNull<u8>, Instant)>,
    /// Whole blocks of `slab_size * NREFILL` bytes carved into slabs by `refill`.
    /// Tracked only so `Drop` can release them; individual slabs inside are never
    /// freed to the OS on their own.
    blocks: Vec<(NonNull<u8>, Layout)>,
}

impl SmallClass {
    const fn new() -> Self {
        Self { free: Vec::new(), blocks: Vec::new() }
    }
}

/// One large (> `MAX_SMALL`) allocation still owned by the allocator, whether currently
/// handed out or sitting in quarantine.
struct LargeBlock {
    ptr:    NonNull<u8>,
    layout: Layout,
}

/// State behind the `UnsafeCell`; see the module-level threading contract.
struct Inner {
    small: [SmallClass; SMALL_CLASSES],
    /// FIFO quarantine of large allocations awaiting their deadline, ordered by
    /// deadline (equivalently, by insertion order, since every deadline is
    /// `insertion time + ttl` and `ttl` is constant).
    large_quarantine: VecDeque<(NonNull<u8>, Instant)>,
    /// Every large block the allocator currently owns, in use or quarantined, keyed
    /// by its address so `dealloc`/the sweep/`Drop` can find its `Layout` again.
    large_live: Vec<LargeBlock>,
}

/// A size-classed allocator for short-lived byte buffers, with TTL-bounded delayed
/// reclamation. See the module documentation for the full threading contract.
pub struct SlabAllocator {
    inner: UnsafeCell<Inner>,
    ttl:   Duration,
}

// SAFETY: see the module-level threading contract. All interior mutation happens
// through the single `UnsafeCell<Inner>`, and correctness relies on the caller never
// calling `alloc`/`dealloc`/`dup` concurrently with each other; that is a documented
// precondition, not something this impl can check.
unsafe impl Sync for SlabAllocator {}
// SAFETY: the raw `NonNull<u8>` pointers held throughout `Inner` carry no thread
// affinity; mutation is single-writer (see above), so moving a `SlabAllocator` to
// another thread and continuing to use it under that same contract is sound.
unsafe impl Send for SlabAllocator {}

impl Debug for SlabAllocator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabAllocator")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl SlabAllocator {
    /// Create an allocator whose quarantine window is `ttl_msec` milliseconds.
    #[must_use]
    pub fn new(ttl_msec: u64) -> Self {
        Self {
            inner: UnsafeCell::new(Inner {
                small:            std::array::from_fn(|_| SmallClass::new()),
                large_quarantine: VecDeque::new(),
                large_live:       Vec::new(),
            }),
            ttl: Duration::from_millis(ttl_msec),
        }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn inner(&self) -> &mut Inner {
        // SAFETY: the module-level contract guarantees this allocator's methods are
        // never called concurrently with one another, so a unique `&mut` derived from
        // the shared `&self` here never aliases another live reference into `Inner`.
        unsafe { &mut *self.inner.get() }
    }

    /// Allocate `sz` bytes (`sz > 0`), rounded up to a multiple of [`ALIGN`].
    ///
    /// # Panics
    /// Panics if `sz` is zero, or if the underlying system allocator fails.
    #[must_use]
    pub fn alloc(&self, sz: usize) -> NonNull<u8> {
        assert!(sz > 0, "SlabAllocator::alloc called with a zero size");
        let rounded = round_up(sz);

        let ptr = if rounded <= MAX_SMALL {
            self.alloc_small(rounded)
        } else {
            self.alloc_large(rounded)
        };

        self.sweep();
        ptr
    }

    /// Return `sz` bytes previously returned by `alloc(sz)` (or a larger request
    /// rounded to the same class) to the allocator. The region is quarantined for
    /// `ttl_msec` milliseconds before it can be handed out again or released to the OS.
    pub fn dealloc(&self, ptr: NonNull<u8>, sz: usize) {
        let rounded = round_up(sz);
        let now = Instant::now();

        if rounded <= MAX_SMALL {
            let class = class_of(rounded);
            self.inner().small[class].free.push((ptr, now + self.ttl));
        } else {
            self.inner().large_quarantine.push_back((ptr, now + self.ttl));
        }

        self.sweep();
    }

    /// Allocate `sz` bytes and copy `sz` bytes from `src` into them.
    ///
    /// # Safety
    /// `src` must be valid to read for `sz` bytes.
    #[must_use]
    pub unsafe fn dup(&self, src: NonNull<u8>, sz: usize) -> NonNull<u8> {
        let dst = self.alloc(sz);
        // SAFETY: `dst` was just allocated with room for `sz` bytes and does not
        // overlap `src` (it is freshly allocated memory); the caller guarantees `src`
        // is valid to read for `sz` bytes.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), sz) };
        dst
    }

    fn alloc_small(&self, rounded: usize) -> NonNull<u8> {
        let now = Instant::now();
        let class_idx = class_of(rounded);
        let class = &mut self.inner().small[class_idx];

        if let Some(pos) = class.free.iter().rposition(|&(_, ready_at)| ready_at <= now) {
            return class.free.swap_remove(pos).0;
        }

        // No ready slab: refill this size class with a fresh block of `NREFILL` slabs.
        let block_layout = Layout::from_size_align(rounded * NREFILL, ALIGN)
            .expect("slab refill block size/align is always valid");
        // SAFETY: `block_layout` has nonzero size (rounded >= ALIGN > 0, NREFILL > 0).
        let block = unsafe { alloc_raw(block_layout) };
        let block = NonNull::new(block).expect("global allocator returned null");

        class.blocks.push((block, block_layout));

        for i in 0..NREFILL {
            // SAFETY: `i * rounded` is within the `rounded * NREFILL`-byte block.
            let slab = unsafe { block.as_ptr().add(i * rounded) };
            let slab = NonNull::new(slab).expect("offset within a non-null block is non-null");
            class.free.push((slab, now));
        }

        let pos = class.free.len() - 1;
        class.free.swap_remove(pos).0
    }

    fn alloc_large(&self, rounded: usize) -> NonNull<u8> {
        let layout = Layout::from_size_align(rounded, ALIGN)
            .expect("large allocation size/align is always valid");
        // SAFETY: `layout` has nonzero size.
        let ptr = unsafe { alloc_raw(layout) };
        let ptr = NonNull::new(ptr).expect("global allocator returned null");

        self.inner().large_live.push(LargeBlock { ptr, layout });
        ptr
    }

    /// Drain the large-allocation quarantine from the front, releasing to the OS every
    /// entry whose deadline has passed. Entries are ordered by deadline (equivalently,
    /// insertion order, since the TTL is constant), so this stops at the first
    /// not-yet-expired entry.
    fn sweep(&self) {
        let now = Instant::now();
        let inner = self.inner();

        while let Some(&(ptr, deadline)) = inner.large_quarantine.front() {
            if deadline > now {
                break;
            }
            inner.large_quarantine.pop_front();

            if let Some(idx) = inner.large_live.iter().position(|b| b.ptr == ptr) {
                let block = inner.large_live.swap_remove(idx);
                // SAFETY: `block.ptr` was allocated with `block.layout` by `alloc_large`
                // and has not been freed before (it was tracked in `large_live` until
                // now); its quarantine deadline has passed, so no caller may still be
                // relying on the TTL window to read through a stale pointer to it.
                unsafe { dealloc_raw(block.ptr.as_ptr(), block.layout) };
            }
        }
    }
}

impl Drop for SlabAllocator {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();

        for block in inner.large_live.drain(..) {
            // SAFETY: every block in `large_live` was allocated with its stored
            // `Layout` and has not yet been freed (it is removed from `large_live`
            // exactly when it is freed, in `sweep`).
            unsafe { dealloc_raw(block.ptr.as_ptr(), block.layout) };
        }

        for class in &mut inner.small {
            for &(block, layout) in &class.blocks {
                // SAFETY: every block in `blocks` was allocated with the paired
                // `Layout` by `alloc_small` and is only ever freed here, once, at
                // allocator teardown.
                unsafe { dealloc_raw(block.as_ptr(), layout) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread::sleep;

    use super::*;

    #[test]
    fn round_trip_small() {
        let alloc = SlabAllocator::new(50);
        let p = alloc.alloc(16);
        // SAFETY: freshly allocated 16-byte region.
        unsafe {
            ptr::write_bytes(p.as_ptr(), 0xAB, 16);
            let slice = std::slice::from_raw_parts(p.as_ptr(), 16);
            assert!(slice.iter().all(|&b| b == 0xAB));
        }
        alloc.dealloc(p, 16);
    }

    #[test]
    fn round_trip_large() {
        let alloc = SlabAllocator::new(50);
        let p = alloc.alloc(4096);
        // SAFETY: freshly allocated 4096-byte region.
        unsafe {
            ptr::write_bytes(p.as_ptr(), 0x7C, 4096);
            let slice = std::slice::from_raw_parts(p.as_ptr(), 4096);
            assert!(slice.iter().all(|&b| b == 0x7C));
        }
        alloc.dealloc(p, 4096);
    }

    #[test]
    fn small_slab_is_reused_after_ttl() {
        let alloc = SlabAllocator::new(10);
        let p1 = alloc.alloc(16);
        alloc.dealloc(p1, 16);

        sleep(Duration::from_millis(25));

        let p2 = alloc.alloc(16);
        assert_eq!(p1, p2, "after the TTL elapses the same slab should be recycled");
    }

    #[test]
    fn small_slab_not_reused_before_ttl() {
        let alloc = SlabAllocator::new(10_000);
        let p1 = alloc.alloc(16);
        alloc.dealloc(p1, 16);

        // No sleep: the freed slab is still quarantined, so a fresh block must be
        // carved instead of reusing `p1`.
        let p2 = alloc.alloc(16);
        assert_ne!(p1, p2);
    }

    #[test]
    fn dup_copies_and_is_independent() {
        let alloc = SlabAllocator::new(50);
        let src = alloc.alloc(4);
        // SAFETY: freshly allocated 4-byte region.
        unsafe { ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), src.as_ptr(), 4) };

        // SAFETY: `src` is valid to read for 4 bytes.
        let dst = unsafe { alloc.dup(src, 4) };
        assert_ne!(src, dst);

        // SAFETY: both regions are valid for 4 bytes and non-overlapping.
        unsafe {
            assert_eq!(
                std::slice::from_raw_parts(src.as_ptr(), 4),
                std::slice::from_raw_parts(dst.as_ptr(), 4),
            );
            dst.as_ptr().write(9);
            assert_eq!(*src.as_ptr(), 1, "mutating the copy must not affect the source");
        }
    }

    #[test]
    fn large_blocks_freed_past_ttl_via_sweep() {
        let alloc = SlabAllocator::new(5);
        let p = alloc.alloc(4096);
        alloc.dealloc(p, 4096);
        sleep(Duration::from_millis(20));

        // Triggers the sweep on entry; a fresh large alloc forces one too.
        let _ = alloc.alloc(4096);

        let inner = alloc.inner();
        assert!(inner.large_quarantine.is_empty());
    }
}
