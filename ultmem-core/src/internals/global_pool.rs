//! Global Pool
//!
//! The process-wide pool of one class of blocks.
//!
//! The global pool plays 2 roles:
//!
//! -   It is the reservoir of pages for the local pools: pages donated when they become vacant, or orphaned when their
//!     owner finalizes, and handed out again on demand.
//! -   It serves callers which have no local pool, with the same contract as a local pool.
//!
//! All its operations are cold, and serialized by a spin lock. The pages it holds are owned by `OwnerId::GLOBAL`,
//! and their owner fields are only ever touched with the lock held.

use crate::{Error, OwnerId, Platform, Result};

use super::{
    blocks::Block,
    page::{PageIndex, PageList},
    page_source::PageSource,
};

/// GlobalPool.
pub(crate) struct GlobalPool {
    block_size: usize,
    max_empty_pages: usize,
    pages: spin::Mutex<PageList>,
}

impl GlobalPool {
    /// Creates an instance.
    pub(crate) fn new(block_size: usize, max_empty_pages: usize) -> Self {
        Self { block_size, max_empty_pages, pages: spin::Mutex::new(PageList::default()), }
    }

    /// Returns the size of the blocks.
    pub(crate) fn block_size(&self) -> usize { self.block_size }

    /// Returns the number of pages held.
    pub(crate) fn len(&self) -> usize { self.pages.lock().len() }

    /// Returns the number of vacant pages held.
    #[cfg(test)]
    pub(crate) fn vacant(&self, source: &PageSource<impl Platform>) -> usize {
        let pages = self.pages.lock();

        Self::count_vacant(&pages, source)
    }

    /// Hands out a page with available blocks, transferring its ownership to `owner`.
    ///
    /// Returns `None` if no page with available blocks is held.
    pub(crate) fn take_page(&self, source: &PageSource<impl Platform>, owner: OwnerId) -> Option<PageIndex> {
        let pages = self.pages.lock();

        let index = Self::find_available(&pages, source)?;
        let page = source.page(index);

        //  Safety:
        //  -   `index` is linked in `pages`.
        //  -   The lock is held, hence the global pool is the owner.
        unsafe {
            pages.remove(source.arena(), index);
            page.set_owner(owner);
        }

        log::debug!("Global pool ({} bytes): {:?} taken by {:?}, {} empty blocks",
            self.block_size, index, owner, page.empty());

        Some(index)
    }

    /// Receives a vacant page.
    ///
    /// The page is retained if fewer than `max_empty_pages` vacant pages are held, and released otherwise.
    ///
    /// #   Safety
    ///
    /// -   Assumes that the caller owns the page, and that it is no longer linked in any list.
    pub(crate) unsafe fn donate(&self, source: &PageSource<impl Platform>, index: PageIndex) {
        let page = source.page(index);
        debug_assert!(page.is_vacant());

        let pages = self.pages.lock();

        if Self::count_vacant(&pages, source) < self.max_empty_pages {
            page.set_owner(OwnerId::GLOBAL);
            pages.push_front(source.arena(), index);

            log::debug!("Global pool ({} bytes): {:?} donated", self.block_size, index);
            return;
        }

        drop(pages);

        source.free_page(index);
    }

    /// Receives a page with outstanding blocks, whose owner is going away.
    ///
    /// #   Safety
    ///
    /// -   Assumes that the caller owns the page, and that it is no longer linked in any list.
    pub(crate) unsafe fn adopt(&self, source: &PageSource<impl Platform>, index: PageIndex) {
        let page = source.page(index);

        let pages = self.pages.lock();

        page.set_owner(OwnerId::GLOBAL);
        pages.push_front(source.arena(), index);

        log::debug!("Global pool ({} bytes): {:?} orphaned, {} of {} blocks outstanding",
            self.block_size, index, page.total() - page.empty(), page.total());
    }

    /// Allocates a block, for a caller without local pool.
    pub(crate) fn allocate<P: Platform>(&self, source: &PageSource<P>) -> Result<Block> {
        let pages = self.pages.lock();

        let index = match Self::find_available(&pages, source) {
            Some(index) => index,
            None => {
                let index = source.allocate_page(self.block_size, OwnerId::GLOBAL)?;

                //  Safety:
                //  -   The page was just allocated.
                unsafe { pages.push_front(source.arena(), index) };

                index
            },
        };

        //  Safety:
        //  -   The lock is held, hence the global pool is the owner.
        let block = unsafe { source.page(index).allocate() };

        //  `find_available` only returns pages with available blocks, as are freshly allocated pages.
        debug_assert!(block.is_some());

        block.ok_or(Error::OutOfMemory)
    }

    /// Deallocates a block, for a caller without local pool.
    ///
    /// #   Safety
    ///
    /// -   Assumes that `block` was allocated from a pool of this class, and is no longer in use.
    pub(crate) unsafe fn deallocate<P: Platform>(&self, source: &PageSource<P>, block: Block) {
        let index = block.page();
        let page = source.page(index);

        let pages = self.pages.lock();

        //  Ownership only ever transfers to, or from, the global pool with the lock held.
        if page.owner() != OwnerId::GLOBAL {
            drop(pages);

            page.deallocate_remote(block.pointer());
            return;
        }

        page.deallocate(block.pointer());

        if page.is_vacant() && Self::count_vacant(&pages, source) > self.max_empty_pages {
            pages.remove(source.arena(), index);
            drop(pages);

            source.free_page(index);
        }
    }

    /// Releases all pages.
    ///
    /// #   Panics
    ///
    /// If any block is still outstanding.
    ///
    /// #   Safety
    ///
    /// -   Assumes that no other thread accesses the pool, or its pages.
    pub(crate) unsafe fn close<P: Platform>(&self, source: &PageSource<P>) {
        let pages = self.pages.lock();

        while let Some(index) = pages.pop_front(source.arena()) {
            source.page(index).reclaim_remote();
            source.free_page(index);
        }
    }

    //  Internal: finds the first page with available blocks, reclaiming remotely freed blocks along the way.
    //
    //  Requires the lock to be held.
    fn find_available(pages: &PageList, source: &PageSource<impl Platform>) -> Option<PageIndex> {
        pages.iter(source.arena()).find(|index| {
            let page = source.page(*index);

            //  Safety:
            //  -   The lock is held, hence the global pool is the owner.
            unsafe { page.reclaim_remote() };

            page.has_available()
        })
    }

    //  Internal: requires the lock to be held.
    fn count_vacant(pages: &PageList, source: &PageSource<impl Platform>) -> usize {
        pages.iter(source.arena()).filter(|index| source.page(*index).is_vacant()).count()
    }
}

// mod tests
