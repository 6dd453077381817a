//! Implementation of the Platform trait on top of the global allocator.

use std::{
    alloc::{self, Layout},
    ptr::NonNull,
};

/// Implementation of the Platform trait, for any target with a global allocator.
///
/// Only plain heap pages are supported; any other kind of large page falls back to them.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemPlatform;

impl SystemPlatform {
    /// Creates an instance.
    pub const fn new() -> Self { Self }
}

impl ultmem_core::Platform for SystemPlatform {
    unsafe fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() > 0);

        NonNull::new(alloc::alloc(layout))
    }

    unsafe fn deallocate(&self, pointer: NonNull<u8>, layout: Layout) {
        alloc::dealloc(pointer.as_ptr(), layout);
    }
}

// mod tests
