//! Platform
//!
//! The Platform trait is used to request memory directly from the Platform. By abstracting the underlying platform,
//! it becomes possible to easily port the code to a different OS, or even to a bare-metal target.
//!
//! Two families of calls are used:
//!
//! -   `allocate`/`deallocate`, the malloc-equivalent, for descriptors allocated on their own, directly allocated
//!     stacks, unit table entries, and the page arena.
//! -   `allocate_page`/`deallocate_page`, for the pages carved into blocks, keyed by the kind of large page.

use core::{
    alloc::Layout,
    ptr::NonNull,
};

use crate::LargePageKind;

/// Abstraction of platform specific memory allocation and deallocation.
pub trait Platform {
    /// Allocates a fresh block of memory as per the specified layout.
    ///
    /// May return `None` if the allocation request cannot be satisfied.
    ///
    /// #   Safety
    ///
    /// The caller may assume that if the returned pointer is not null then:
    /// -   The number of usable bytes is _greater than or equal_ to `layout.size()`.
    /// -   The pointer is _at least_ aligned to `layout.align()`.
    ///
    /// `allocate` assumes that `layout.size()` is non-zero.
    unsafe fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Deallocates the supplied block of memory.
    ///
    /// #   Safety
    ///
    /// The caller should no longer reference the memory after calling this function.
    ///
    /// `deallocate` assumes that:
    /// -   `pointer` was allocated by this instance of `Platform`, with `layout` as argument.
    /// -   `pointer` is the value returned by `Platform`, and not an interior pointer.
    unsafe fn deallocate(&self, pointer: NonNull<u8>, layout: Layout);

    /// Allocates a page of the specified kind.
    ///
    /// Returns `None` if the kind is not available, or the allocation request cannot be satisfied; the caller then
    /// falls back to a cheaper kind.
    ///
    /// The default implementation only supports `LargePageKind::Malloc`.
    ///
    /// #   Safety
    ///
    /// Same as `allocate`.
    unsafe fn allocate_page(&self, layout: Layout, kind: LargePageKind) -> Option<NonNull<u8>> {
        match kind {
            LargePageKind::Malloc => self.allocate(layout),
            _ => None,
        }
    }

    /// Deallocates a page.
    ///
    /// #   Safety
    ///
    /// `deallocate_page` assumes that `pointer` was returned by `allocate_page`, with `layout` and `kind` as
    /// arguments, and that the page is no longer in use.
    unsafe fn deallocate_page(&self, pointer: NonNull<u8>, layout: Layout, kind: LargePageKind) {
        debug_assert_eq!(LargePageKind::Malloc, kind);

        self.deallocate(pointer, layout)
    }
}

impl<P: Platform + ?Sized> Platform for &P {
    unsafe fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> { (**self).allocate(layout) }

    unsafe fn deallocate(&self, pointer: NonNull<u8>, layout: Layout) { (**self).deallocate(pointer, layout) }

    unsafe fn allocate_page(&self, layout: Layout, kind: LargePageKind) -> Option<NonNull<u8>> {
        (**self).allocate_page(layout, kind)
    }

    unsafe fn deallocate_page(&self, pointer: NonNull<u8>, layout: Layout, kind: LargePageKind) {
        (**self).deallocate_page(pointer, layout, kind)
    }
}
