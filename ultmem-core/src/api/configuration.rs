//! The configuration of ultmem-core.
//!
//! A single Configuration instance is resolved when the `MemoryContext` is created, and is immutable thereafter.
//!
//! ultmem-core features 2 classes of blocks, both carved from pages of `page_size` bytes:
//!
//! -   Stacks: `stack_size` bytes, holding a thread descriptor, its stack header, and the usable stack.
//! -   Tasks: a cache-line rounded task descriptor, and its origin tag.

use crate::{Error, PowerOf2, Result};

/// The size of a cache line.
///
/// Headers co-located with stacks are rounded up to a multiple of this size, so that the boundary between header and
/// stack never splits a cache line.
//  Safety:
//  -   64 is a power of 2.
pub const CACHE_LINE_SIZE: PowerOf2 = unsafe { PowerOf2::new_unchecked(64) };

/// The kind of large pages.
///
/// The kind a page was obtained with is recorded, so that it is released with the matching call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LargePageKind {
    /// Plain heap allocation.
    Malloc,
    /// Anonymous mapping, reserving the address space.
    Mapped,
    /// Anonymous mapping, hinted to be backed by transparent huge pages.
    TransparentHuge,
    /// Anonymous mapping backed by explicitly reserved huge pages.
    Huge,
}

impl LargePageKind {
    /// Returns the next cheaper kind, if any.
    pub fn cheaper(self) -> Option<LargePageKind> {
        match self {
            LargePageKind::Huge => Some(LargePageKind::TransparentHuge),
            LargePageKind::TransparentHuge => Some(LargePageKind::Mapped),
            LargePageKind::Mapped => Some(LargePageKind::Malloc),
            LargePageKind::Malloc => None,
        }
    }

    /// Returns the kinds to attempt, in order, starting from `self`.
    pub fn fallbacks(self) -> impl Iterator<Item = LargePageKind> {
        core::iter::successors(Some(self), |kind| kind.cheaper())
    }
}

/// Configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Configuration {
    page_size: usize,
    stack_size: usize,
    max_global_empty_pages: usize,
    large_page: LargePageKind,
    external_pooling: bool,
}

impl Configuration {
    /// Default size of a page: 2 MB.
    pub const DEFAULT_PAGE_SIZE: usize = 2 * 1024 * 1024;

    /// Default size of a stack, header included: 16 KB.
    pub const DEFAULT_STACK_SIZE: usize = 16 * 1024;

    /// Default number of empty pages retained by each global pool.
    pub const DEFAULT_MAX_GLOBAL_EMPTY_PAGES: usize = 16;

    /// Minimum size of a page.
    pub const MINIMUM_PAGE_SIZE: usize = 4 * 1024;

    /// Creates the default configuration.
    pub const fn new() -> Self {
        Self {
            page_size: Self::DEFAULT_PAGE_SIZE,
            stack_size: Self::DEFAULT_STACK_SIZE,
            max_global_empty_pages: Self::DEFAULT_MAX_GLOBAL_EMPTY_PAGES,
            large_page: LargePageKind::Mapped,
            external_pooling: false,
        }
    }

    /// Sets the size of the pages, for both stacks and tasks.
    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the default stack size, header included.
    ///
    /// Threads created with the default stack size are served from the stack pools, others are allocated directly.
    pub const fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Sets the maximum number of empty pages each global pool retains before releasing them to the platform.
    pub const fn with_max_global_empty_pages(mut self, max: usize) -> Self {
        self.max_global_empty_pages = max;
        self
    }

    /// Sets the preferred kind of large pages.
    pub const fn with_large_page(mut self, kind: LargePageKind) -> Self {
        self.large_page = kind;
        self
    }

    /// Sets whether callers outside of any `ExecutionUnit` are served by the global pools, rather than directly.
    pub const fn with_external_pooling(mut self, external_pooling: bool) -> Self {
        self.external_pooling = external_pooling;
        self
    }

    /// Returns the size of the pages.
    pub const fn page_size(&self) -> usize { self.page_size }

    /// Returns the default stack size.
    pub const fn stack_size(&self) -> usize { self.stack_size }

    /// Returns the maximum number of empty pages retained by each global pool.
    pub const fn max_global_empty_pages(&self) -> usize { self.max_global_empty_pages }

    /// Returns the preferred kind of large pages.
    pub const fn large_page(&self) -> LargePageKind { self.large_page }

    /// Returns whether external callers are served by the global pools.
    pub const fn external_pooling(&self) -> bool { self.external_pooling }

    /// Checks the consistency of the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.page_size < Self::MINIMUM_PAGE_SIZE {
            return Err(Error::InvalidConfiguration("page size is below 4 KB"));
        }

        if !CACHE_LINE_SIZE.divides(self.page_size) {
            return Err(Error::InvalidConfiguration("page size is not a multiple of the cache line size"));
        }

        if !CACHE_LINE_SIZE.divides(self.stack_size) {
            return Err(Error::InvalidConfiguration("stack size is not a multiple of the cache line size"));
        }

        if self.stack_size > self.page_size {
            return Err(Error::InvalidConfiguration("stack size exceeds page size"));
        }

        //  A page index is 32 bits, and so is the count of blocks within a page.
        if self.page_size / CACHE_LINE_SIZE.value() > u32::MAX as usize {
            return Err(Error::InvalidConfiguration("page size is too large"));
        }

        Ok(())
    }
}

impl Default for Configuration {
    fn default() -> Self { Self::new() }
}

// mod tests
