//! Page
//!
//! A Page is a single platform allocation, carved into blocks of a single size.
//!
//! The descriptor of a Page does not live within the page memory itself, but in the `PageArena`, and is referred to
//! by its `PageIndex`. The memory of the page only ever contains blocks, whether allocated or free.
//!
//! The fields of a Page fall in 3 categories:
//!
//! -   Carving fields, written once by `initialize` while the slot is exclusively held, read-only afterwards.
//! -   Owner fields, only ever accessed by the current owner of the page: either an execution unit, or the global
//!     pool under its lock.
//! -   Shared fields: the owner identity and the remote free list, accessed by any thread.

use core::{
    cell::Cell,
    ptr::NonNull,
    sync::atomic::{AtomicU32, Ordering},
};

use crate::{LargePageKind, OwnerId};

use super::{
    blocks::{Block, BlockStack, FreeBlock, RemoteFreeList},
    page_arena::PageArena,
};

/// The stable index of a page descriptor within the `PageArena`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct PageIndex(u32);

impl PageIndex {
    /// Creates an instance.
    pub(crate) const fn new(index: u32) -> Self { Self(index) }

    /// Returns the raw value.
    pub(crate) const fn value(&self) -> u32 { self.0 }
}

/// Page descriptor.
pub(crate) struct Page {
    index: PageIndex,
    //  Carving fields.
    base: Cell<Option<NonNull<u8>>>,
    size: Cell<usize>,
    block_size: Cell<usize>,
    total: Cell<u32>,
    kind: Cell<LargePageKind>,
    //  Shared fields.
    owner: AtomicU32,
    remote: RemoteFreeList,
    //  Owner fields.
    free: BlockStack,
    //  Number of blocks carved so far; blocks past the watermark are implicitly free.
    watermark: Cell<u32>,
    //  Number of blocks either in `free`, or past the watermark.
    empty: Cell<u32>,
    pub(crate) prev: Cell<Option<PageIndex>>,
    pub(crate) next: Cell<Option<PageIndex>>,
}

//  Safety:
//  -   Owner fields are only accessed by the owner, carving fields are only written prior to publication, and shared
//      fields are atomic.
unsafe impl Sync for Page {}

impl Page {
    /// Creates a blank descriptor.
    pub(crate) fn new(index: PageIndex) -> Self {
        Self {
            index,
            base: Cell::new(None),
            size: Cell::new(0),
            block_size: Cell::new(0),
            total: Cell::new(0),
            kind: Cell::new(LargePageKind::Malloc),
            owner: AtomicU32::new(OwnerId::GLOBAL.value()),
            remote: RemoteFreeList::default(),
            free: BlockStack::default(),
            watermark: Cell::new(0),
            empty: Cell::new(0),
            prev: Cell::new(None),
            next: Cell::new(None),
        }
    }

    /// Prepares the descriptor for a freshly allocated page.
    ///
    /// #   Safety
    ///
    /// -   Assumes that access to the descriptor is exclusive.
    /// -   Assumes that `base` points to `size` bytes, aligned for a `FreeBlock`.
    pub(crate) unsafe fn initialize(&self, base: NonNull<u8>, size: usize, block_size: usize, kind: LargePageKind,
        owner: OwnerId)
    {
        debug_assert!(block_size >= FreeBlock::MINIMUM_SIZE);
        debug_assert!(size >= block_size);
        debug_assert!(self.remote.pending() == 0);

        let total = (size / block_size) as u32;

        self.base.set(Some(base));
        self.size.set(size);
        self.block_size.set(block_size);
        self.total.set(total);
        self.kind.set(kind);
        self.free.clear();
        self.watermark.set(0);
        self.empty.set(total);
        self.prev.set(None);
        self.next.set(None);
        self.owner.store(owner.value(), Ordering::Release);
    }

    /// Resets the descriptor, prior to recycling it.
    ///
    /// #   Safety
    ///
    /// -   Assumes that access to the descriptor is exclusive.
    pub(crate) unsafe fn reset(&self) {
        self.base.set(None);
        self.size.set(0);
        self.total.set(0);
        self.empty.set(0);
        self.free.clear();
    }

    /// Returns the index of the page.
    #[cfg(test)]
    pub(crate) fn index(&self) -> PageIndex { self.index }

    /// Returns the base address of the page, if allocated.
    pub(crate) fn base(&self) -> Option<NonNull<u8>> { self.base.get() }

    /// Returns the size of the page, in bytes.
    pub(crate) fn size(&self) -> usize { self.size.get() }

    /// Returns the size of the blocks, in bytes.
    #[cfg(test)]
    pub(crate) fn block_size(&self) -> usize { self.block_size.get() }

    /// Returns the total number of blocks.
    pub(crate) fn total(&self) -> u32 { self.total.get() }

    /// Returns the kind of large page the page was obtained with.
    pub(crate) fn kind(&self) -> LargePageKind { self.kind.get() }

    /// Returns the current owner.
    pub(crate) fn owner(&self) -> OwnerId { OwnerId::new(self.owner.load(Ordering::Acquire)) }

    /// Transfers ownership.
    ///
    /// #   Safety
    ///
    /// -   Assumes that the caller is the current owner, or holds the lock of the global pool owning the page.
    pub(crate) unsafe fn set_owner(&self, owner: OwnerId) { self.owner.store(owner.value(), Ordering::Release); }

    /// Returns the number of empty blocks, as known to the owner.
    pub(crate) fn empty(&self) -> u32 { self.empty.get() }

    /// Returns the number of remotely freed blocks pending reclamation.
    pub(crate) fn pending(&self) -> u32 { self.remote.pending() }

    /// Returns whether no block of the page is outstanding.
    ///
    /// Both the local count and the remote counter are checked: a page is only released when no block is outstanding
    /// and no remote free is pending.
    pub(crate) fn is_vacant(&self) -> bool { self.empty.get() == self.total.get() && self.remote.pending() == 0 }

    /// Returns whether a block can be allocated without reclaiming remote blocks.
    pub(crate) fn has_available(&self) -> bool { !self.free.is_empty() || self.watermark.get() < self.total.get() }

    /// Allocates one block, if any.
    ///
    /// #   Safety
    ///
    /// -   Assumes that the caller is the owner.
    pub(crate) unsafe fn allocate(&self) -> Option<Block> {
        //  Fast Path.
        if let Some(block) = self.free.pop() {
            self.empty.set(self.empty.get() - 1);
            return Some(Block::new(block.cast(), self.index));
        }

        //  Expansion path.
        let watermark = self.watermark.get();

        if watermark == self.total.get() {
            return None;
        }

        let base = self.base.get()?;

        self.watermark.set(watermark + 1);
        self.empty.set(self.empty.get() - 1);

        //  Safety:
        //  -   `watermark < total`, hence the block is within the page.
        let pointer = NonNull::new_unchecked(base.as_ptr().add(watermark as usize * self.block_size.get()));

        Some(Block::new(pointer, self.index))
    }

    /// Deallocates one block, from the owner.
    ///
    /// #   Safety
    ///
    /// -   Assumes that the caller is the owner.
    /// -   Assumes that `ptr` was allocated from this page, and is no longer in use.
    pub(crate) unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        debug_assert!(self.contains(ptr));
        debug_assert!(self.empty.get() < self.total.get());

        let block = FreeBlock::initialize(ptr);
        self.free.push(block);

        self.empty.set(self.empty.get() + 1);
    }

    /// Deallocates one block, from any thread.
    ///
    /// #   Safety
    ///
    /// -   Assumes that `ptr` was allocated from this page, and is no longer in use.
    pub(crate) unsafe fn deallocate_remote(&self, ptr: NonNull<u8>) {
        debug_assert!(self.contains(ptr));

        let block = FreeBlock::initialize(ptr);
        self.remote.push(block);
    }

    /// Moves the remotely freed blocks into the local free list.
    ///
    /// Returns the number of blocks reclaimed.
    ///
    /// #   Safety
    ///
    /// -   Assumes that the caller is the owner.
    pub(crate) unsafe fn reclaim_remote(&self) -> u32 {
        let reclaimed = self.remote.drain(&self.free);

        self.empty.set(self.empty.get() + reclaimed);
        debug_assert!(self.empty.get() <= self.total.get());

        reclaimed
    }

    //  Internal: checks whether `ptr` points to the start of a block of this page.
    fn contains(&self, ptr: NonNull<u8>) -> bool {
        let Some(base) = self.base.get() else { return false };

        let (base, ptr) = (base.as_ptr() as usize, ptr.as_ptr() as usize);
        let end = base + self.total.get() as usize * self.block_size.get();

        ptr >= base && ptr < end && (ptr - base) % self.block_size.get() == 0
    }
}

/// PageList.
///
/// An intrusive doubly linked list of pages, linked through the `prev` and `next` fields of their descriptors.
///
/// Only the owner of the pages may manipulate the list.
#[derive(Default)]
pub(crate) struct PageList {
    head: Cell<Option<PageIndex>>,
    len: Cell<usize>,
}

impl PageList {
    /// Returns the first page, if any.
    pub(crate) fn head(&self) -> Option<PageIndex> { self.head.get() }

    /// Returns the number of pages.
    pub(crate) fn len(&self) -> usize { self.len.get() }

    /// Returns whether the list is empty.
    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool { self.head.get().is_none() }

    /// Pushes a page at the front.
    ///
    /// #   Safety
    ///
    /// -   Assumes that the page is not linked in any list.
    pub(crate) unsafe fn push_front(&self, arena: &PageArena, index: PageIndex) {
        let page = arena.get(index);
        debug_assert!(page.prev.get().is_none() && page.next.get().is_none());

        let head = self.head.get();

        if let Some(head) = head {
            arena.get(head).prev.set(Some(index));
        }

        page.prev.set(None);
        page.next.set(head);

        self.head.set(Some(index));
        self.len.set(self.len.get() + 1);
    }

    /// Unlinks a page.
    ///
    /// #   Safety
    ///
    /// -   Assumes that the page is linked in this list.
    pub(crate) unsafe fn remove(&self, arena: &PageArena, index: PageIndex) {
        let page = arena.get(index);
        let (prev, next) = (page.prev.get(), page.next.get());

        match prev {
            Some(prev) => arena.get(prev).next.set(next),
            None => {
                debug_assert_eq!(Some(index), self.head.get());
                self.head.set(next);
            },
        }

        if let Some(next) = next {
            arena.get(next).prev.set(prev);
        }

        page.prev.set(None);
        page.next.set(None);

        debug_assert!(self.len.get() > 0);
        self.len.set(self.len.get() - 1);
    }

    /// Unlinks and returns the first page, if any.
    pub(crate) fn pop_front(&self, arena: &PageArena) -> Option<PageIndex> {
        let head = self.head.get()?;

        //  Safety:
        //  -   `head` is linked in this list.
        unsafe { self.remove(arena, head) };

        Some(head)
    }

    /// Moves a page to the front.
    ///
    /// #   Safety
    ///
    /// -   Assumes that the page is linked in this list.
    pub(crate) unsafe fn move_to_front(&self, arena: &PageArena, index: PageIndex) {
        if self.head.get() == Some(index) {
            return;
        }

        self.remove(arena, index);
        self.push_front(arena, index);
    }

    /// Iterates over the pages, front to back.
    ///
    /// The iterator must not outlive a modification of the list.
    pub(crate) fn iter<'a>(&self, arena: &'a PageArena) -> impl Iterator<Item = PageIndex> + 'a {
        core::iter::successors(self.head.get(), move |index| arena.get(*index).next.get())
    }
}

// mod tests
