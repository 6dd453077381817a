//! Page Source
//!
//! The Page/Block allocator: obtains pages from the platform, records their descriptors in the arena, and releases
//! them with the matching strategy.
//!
//! Pages are requested with the preferred `LargePageKind`, falling back to the next cheaper kind whenever the
//! platform cannot satisfy the request.

use core::{
    alloc::Layout,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{CACHE_LINE_SIZE, Error, LargePageKind, OwnerId, Platform, Result};

use super::{
    page::{Page, PageIndex},
    page_arena::PageArena,
};

/// PageSource.
pub(crate) struct PageSource<P> {
    platform: P,
    arena: PageArena,
    page_size: usize,
    preferred: LargePageKind,
    counters: PageCounters,
}

/// Counters of the platform calls made by a `PageSource`.
#[derive(Default)]
pub(crate) struct PageCounters {
    pub(crate) allocated: AtomicUsize,
    pub(crate) released: AtomicUsize,
    pub(crate) fallbacks: AtomicUsize,
}

impl<P> PageSource<P> {
    /// Creates an instance.
    pub(crate) fn new(platform: P, page_size: usize, preferred: LargePageKind) -> Self {
        Self { platform, arena: PageArena::new(), page_size, preferred, counters: PageCounters::default(), }
    }

    /// Returns the platform.
    pub(crate) fn platform(&self) -> &P { &self.platform }

    /// Returns the arena of descriptors.
    pub(crate) fn arena(&self) -> &PageArena { &self.arena }

    /// Returns the descriptor of a page.
    pub(crate) fn page(&self, index: PageIndex) -> &Page { self.arena.get(index) }

    /// Returns the counters.
    pub(crate) fn counters(&self) -> &PageCounters { &self.counters }

    fn layout(&self) -> Result<Layout> {
        Layout::from_size_align(self.page_size, CACHE_LINE_SIZE.value())
            .map_err(|_| Error::InvalidConfiguration("page size overflows"))
    }
}

impl<P: Platform> PageSource<P> {
    /// Allocates a page carved in blocks of `block_size`, owned by `owner`.
    ///
    /// Returns `Error::OutOfMemory` if no kind of page can be obtained.
    pub(crate) fn allocate_page(&self, block_size: usize, owner: OwnerId) -> Result<PageIndex> {
        debug_assert!(block_size <= self.page_size);

        let layout = self.layout()?;
        let index = self.arena.acquire(&self.platform).ok_or(Error::OutOfMemory)?;

        for kind in self.preferred.fallbacks() {
            //  Safety:
            //  -   `layout.size()` is non-zero.
            let Some(base) = (unsafe { self.platform.allocate_page(layout, kind) }) else {
                log::debug!("Page source: {:?} pages unavailable, falling back", kind);
                continue;
            };

            if kind != self.preferred {
                self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
            }

            self.counters.allocated.fetch_add(1, Ordering::Relaxed);

            let page = self.arena.get(index);

            //  Safety:
            //  -   The descriptor was just acquired, hence access is exclusive.
            //  -   `base` points to `layout.size()` bytes, aligned to a cache line.
            unsafe { page.initialize(base, layout.size(), block_size, kind, owner) };

            log::trace!("Page source: mapped {:?} ({:?}) at {:?}, {} blocks of {} bytes",
                index, kind, base, page.total(), block_size);

            return Ok(index);
        }

        self.arena.release(index);

        Err(Error::OutOfMemory)
    }

    /// Releases a page to the platform.
    ///
    /// #   Panics
    ///
    /// If any block of the page is still outstanding.
    ///
    /// #   Safety
    ///
    /// -   Assumes that the caller owns the page, and that it is no longer linked in any list.
    pub(crate) unsafe fn free_page(&self, index: PageIndex) {
        let page = self.arena.get(index);

        assert!(page.is_vacant(), "{:?} released with {} of {} blocks outstanding, {} pending remote frees",
            index, page.total() - page.empty(), page.total(), page.pending());

        if let Some(base) = page.base() {
            let layout = Layout::from_size_align_unchecked(page.size(), CACHE_LINE_SIZE.value());
            self.platform.deallocate_page(base, layout, page.kind());

            log::trace!("Page source: unmapped {:?} ({:?}) at {:?}", index, page.kind(), base);
        }

        page.reset();
        self.counters.released.fetch_add(1, Ordering::Relaxed);

        self.arena.release(index);
    }

    /// Releases the arena.
    ///
    /// #   Safety
    ///
    /// -   Assumes that all pages were released.
    pub(crate) unsafe fn close(&self) {
        debug_assert_eq!(0, self.arena.live());

        self.arena.close(&self.platform);
    }
}

// mod tests
