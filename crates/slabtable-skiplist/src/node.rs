//! The in-memory layout of a skiplist node.
//!
//! A node is never represented by an ordinary Rust struct with owned fields; it is a
//! fixed [`NodeHeader`] followed immediately by a variable-length array of
//! `AtomicPtr<Node>` forward pointers, all carved out of a single [`SlabAllocator`]
//! allocation sized for the node's height. `Node` itself is an empty, never-constructed
//! marker type: every access goes through a `NonNull<Node>` and raw pointer arithmetic,
//! mirroring how the atomic forward-pointer links are erased-type in the teacher this
//! crate is grounded on.

use std::alloc::Layout;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicPtr, Ordering};

use slabtable_slab::SlabAllocator;

/// Fixed-size header stored at the start of every node allocation. Every field is
/// `Copy`, so the header can be read out of its slab allocation by value.
#[repr(C)]
#[derive(Clone, Copy)]
struct NodeHeader {
    key_ptr: NonNull<u8>,
    key_len: usize,
    val_ptr: NonNull<u8>,
    val_len: usize,
    height: usize,
}

/// Opaque marker for a slab-allocated node. Never constructed; only ever reached
/// through a `NonNull<Node>` produced by [`Node::create`] and consumed by the other
/// associated functions, which compute offsets into the backing allocation directly.
pub(crate) struct Node {
    _never: (),
}

/// Layout of a node with `height` forward-pointer slots, plus the byte offset at which
/// the forward-pointer array starts.
fn node_layout(height: usize) -> (Layout, usize) {
    let header = Layout::new::<NodeHeader>();
    let links = Layout::array::<AtomicPtr<Node>>(height)
        .expect("node height is bounded by MAX_HEIGHT and never overflows a Layout");
    let (combined, offset) = header
        .extend(links)
        .expect("header + forward-pointer array never overflows isize");
    (combined.pad_to_align(), offset)
}

/// Copy `src` into a fresh slab allocation, or return a dangling, zero-length pointer
/// without touching the allocator if `src` is empty.
fn copy_into_slab(alloc: &SlabAllocator, src: &[u8]) -> NonNull<u8> {
    if src.is_empty() {
        return NonNull::dangling();
    }
    let dst = alloc.alloc(src.len());
    // SAFETY: `dst` is freshly allocated with room for `src.len()` bytes and cannot
    // overlap `src`.
    unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), src.len()) };
    dst
}

/// Release a buffer previously produced by [`copy_into_slab`]. A zero length means
/// nothing was ever allocated, so there is nothing to give back.
fn free_from_slab(alloc: &SlabAllocator, ptr: NonNull<u8>, len: usize) {
    if len > 0 {
        alloc.dealloc(ptr, len);
    }
}

impl Node {
    #[inline]
    fn header_ptr(ptr: NonNull<Node>) -> *mut NodeHeader {
        ptr.as_ptr().cast()
    }

    /// Allocate a new node, with its own key and value copied into the slab, and every
    /// forward pointer initialized to null. The node is not linked into any list yet.
    ///
    /// # Safety
    /// `height` must be at least 1.
    pub(crate) unsafe fn create(
        alloc: &SlabAllocator,
        height: usize,
        key: &[u8],
        value: &[u8],
    ) -> NonNull<Node> {
        debug_assert!(height >= 1);
        let (layout, links_offset) = node_layout(height);

        let base = alloc.alloc(layout.size());
        let key_ptr = copy_into_slab(alloc, key);
        let val_ptr = copy_into_slab(alloc, value);

        let header = NodeHeader {
            key_ptr,
            key_len: key.len(),
            val_ptr,
            val_len: value.len(),
            height,
        };
        // SAFETY: `base` points to at least `layout.size()` freshly allocated bytes,
        // which is at least `size_of::<NodeHeader>()` at the correctly aligned offset 0.
        unsafe { base.as_ptr().cast::<NodeHeader>().write(header) };

        // SAFETY: `links_offset..links_offset + height * size_of::<AtomicPtr<Node>>()`
        // is within the `layout.size()` bytes just allocated, by construction of
        // `node_layout`.
        unsafe {
            let links = base.as_ptr().add(links_offset).cast::<AtomicPtr<Node>>();
            for i in 0..height {
                links.add(i).write(AtomicPtr::new(ptr::null_mut()));
            }
        }

        base.cast()
    }

    /// Free a node's key, value, and header/link allocations.
    ///
    /// # Safety
    /// `node` must have been produced by [`Node::create`] with `alloc`, must not
    /// already have been destroyed, and no other reference to it may be read after
    /// this call returns (though, per the slab allocator's TTL quarantine, raw bytes
    /// remain intact for a bounded grace period).
    pub(crate) unsafe fn destroy(alloc: &SlabAllocator, node: NonNull<Node>) {
        // SAFETY: `node` is a live node; its header is readable and `Copy`.
        let header = unsafe { Self::header_ptr(node).read() };

        free_from_slab(alloc, header.key_ptr, header.key_len);
        free_from_slab(alloc, header.val_ptr, header.val_len);

        let (layout, _) = node_layout(header.height);
        alloc.dealloc(node.cast(), layout.size());
    }

    /// # Safety
    /// `node` must be a live node and the returned slice must not outlive it.
    #[inline]
    pub(crate) unsafe fn key<'a>(node: NonNull<Node>) -> &'a [u8] {
        // SAFETY: `node` is live; `header_ptr` is readable.
        let header = unsafe { &*Self::header_ptr(node) };
        if header.key_len == 0 {
            &[]
        } else {
            // SAFETY: `key_ptr` was allocated (or is dangling with key_len == 0, the
            // branch just ruled out) for exactly `key_len` bytes by `create` and is
            // only ever freed by `destroy`, which the caller guarantees hasn't run.
            unsafe { slice::from_raw_parts(header.key_ptr.as_ptr(), header.key_len) }
        }
    }

    /// # Safety
    /// Same contract as [`Node::key`].
    #[inline]
    pub(crate) unsafe fn value<'a>(node: NonNull<Node>) -> &'a [u8] {
        // SAFETY: `node` is live; `header_ptr` is readable.
        let header = unsafe { &*Self::header_ptr(node) };
        if header.val_len == 0 {
            &[]
        } else {
            // SAFETY: see `key`.
            unsafe { slice::from_raw_parts(header.val_ptr.as_ptr(), header.val_len) }
        }
    }

    /// # Safety
    /// `node` must be a live node.
    #[inline]
    pub(crate) unsafe fn height(node: NonNull<Node>) -> usize {
        // SAFETY: `node` is live.
        unsafe { (*Self::header_ptr(node)).height }
    }

    /// # Safety
    /// `node` must be a live node and `level` must be less than its height.
    #[inline]
    unsafe fn link_at(node: NonNull<Node>, level: usize) -> *const AtomicPtr<Node> {
        // SAFETY: `node` is live, so its height and the `node_layout` offset it was
        // created with are valid; `level < height` is an explicit precondition.
        let height = unsafe { Self::height(node) };
        debug_assert!(level < height);
        let (_, links_offset) = node_layout(height);
        // SAFETY: offset + level * size_of::<AtomicPtr<Node>>() is within the node's
        // allocation by construction of `node_layout` and the `level < height` bound.
        unsafe {
            node.as_ptr()
                .cast::<u8>()
                .add(links_offset)
                .cast::<AtomicPtr<Node>>()
                .add(level)
        }
    }

    /// # Safety
    /// `node` must be a live node and `level` must be less than its height.
    #[inline]
    pub(crate) unsafe fn next(node: NonNull<Node>, level: usize, order: Ordering) -> Option<NonNull<Node>> {
        // SAFETY: delegated to the caller's contract on `link_at`.
        let raw = unsafe { (*Self::link_at(node, level)).load(order) };
        NonNull::new(raw)
    }

    /// # Safety
    /// `node` must be a live node and `level` must be less than its height.
    #[inline]
    pub(crate) unsafe fn set_next(
        node: NonNull<Node>,
        level: usize,
        next: Option<NonNull<Node>>,
        order: Ordering,
    ) {
        let raw = next.map_or_else(ptr::null_mut, NonNull::as_ptr);
        // SAFETY: delegated to the caller's contract on `link_at`.
        unsafe { (*Self::link_at(node, level)).store(raw, order) };
    }
}
