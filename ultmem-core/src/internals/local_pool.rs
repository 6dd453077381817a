//! Local Pool
//!
//! The pool of one class of blocks, dedicated to a single execution unit.
//!
//! The local pool owns a list of pages, the head of which is the current page. Allocation proceeds through:
//!
//! 1.  The free blocks of the current page.
//! 2.  The blocks remotely freed on the current page.
//! 3.  Any other owned page with free, or remotely freed, blocks.
//! 4.  A page handed out by the global pool.
//! 5.  A fresh page from the page source.
//!
//! Only the first 2 steps are expected on the hot path.

use crate::{Error, OwnerId, Platform, Result};

use super::{
    blocks::Block,
    global_pool::GlobalPool,
    page::{PageIndex, PageList},
    page_source::PageSource,
};

/// LocalPool.
pub(crate) struct LocalPool {
    owner: OwnerId,
    block_size: usize,
    pages: PageList,
}

impl LocalPool {
    /// Creates an instance.
    pub(crate) fn new(owner: OwnerId, block_size: usize) -> Self {
        debug_assert!(owner != OwnerId::GLOBAL);

        Self { owner, block_size, pages: PageList::default(), }
    }

    /// Returns the number of pages owned.
    pub(crate) fn len(&self) -> usize { self.pages.len() }

    /// Allocates a block.
    pub(crate) fn allocate<P: Platform>(&self, source: &PageSource<P>, global: &GlobalPool) -> Result<Block> {
        debug_assert_eq!(self.block_size, global.block_size());

        if let Some(index) = self.pages.head() {
            let page = source.page(index);

            //  Safety:
            //  -   The pool owns its pages.
            if let Some(block) = unsafe { page.allocate() } {
                return Ok(block);
            }

            //  Safety:
            //  -   The pool owns its pages.
            if unsafe { page.reclaim_remote() } > 0 {
                if let Some(block) = unsafe { page.allocate() } {
                    return Ok(block);
                }
            }
        }

        self.allocate_slow(source, global)
    }

    /// Deallocates a block.
    ///
    /// If the pool does not own the page of the block, the block is pushed onto the remote list of its page.
    ///
    /// #   Safety
    ///
    /// -   Assumes that `block` was allocated from a pool of this class, and is no longer in use.
    pub(crate) unsafe fn deallocate<P: Platform>(&self, source: &PageSource<P>, global: &GlobalPool, block: Block) {
        let index = block.page();
        let page = source.page(index);

        //  Only this pool may transfer the ownership of its pages away, hence the check cannot be invalidated.
        if page.owner() != self.owner {
            page.deallocate_remote(block.pointer());
            return;
        }

        page.deallocate(block.pointer());

        //  The current page is kept, to avoid bouncing a single page between local and global pools.
        if page.is_vacant() && self.pages.head() != Some(index) {
            self.pages.remove(source.arena(), index);
            global.donate(source, index);
        }
    }

    /// Hands all pages over to the global pool.
    ///
    /// Vacant pages are donated, others are orphaned.
    pub(crate) fn finalize<P: Platform>(&self, source: &PageSource<P>, global: &GlobalPool) {
        while let Some(index) = self.pages.pop_front(source.arena()) {
            let page = source.page(index);

            //  Safety:
            //  -   The pool owns its pages, and the page is no longer linked.
            unsafe {
                page.reclaim_remote();

                if page.is_vacant() {
                    global.donate(source, index);
                } else {
                    global.adopt(source, index);
                }
            }
        }
    }

    #[inline(never)]
    fn allocate_slow<P: Platform>(&self, source: &PageSource<P>, global: &GlobalPool) -> Result<Block> {
        let index = match self.find_available(source) {
            Some(index) => {
                //  Safety:
                //  -   `index` is linked in `pages`.
                unsafe { self.pages.move_to_front(source.arena(), index) };
                index
            },
            None => {
                let index = match global.take_page(source, self.owner) {
                    Some(index) => index,
                    None => source.allocate_page(self.block_size, self.owner)?,
                };

                //  Safety:
                //  -   `index` was either just allocated, or just taken from the global pool.
                unsafe { self.pages.push_front(source.arena(), index) };
                index
            },
        };

        //  Safety:
        //  -   The pool owns its pages.
        let block = unsafe { source.page(index).allocate() };
        debug_assert!(block.is_some());

        block.ok_or(Error::OutOfMemory)
    }

    //  Internal: finds an owned page, other than the current one, with blocks available.
    fn find_available<P: Platform>(&self, source: &PageSource<P>) -> Option<PageIndex> {
        self.pages.iter(source.arena()).skip(1).find(|index| {
            let page = source.page(*index);

            //  Safety:
            //  -   The pool owns its pages.
            unsafe { page.reclaim_remote() };

            page.has_available()
        })
    }
}

// mod tests
