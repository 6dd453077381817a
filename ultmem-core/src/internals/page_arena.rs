//! Page Arena
//!
//! The arena holding the descriptors of all pages, addressed by `PageIndex`.
//!
//! The arena grows by chunks of `CHUNK_PAGES` descriptors, obtained from the platform on demand. Chunks are never
//! released until the arena is closed, so that a `PageIndex` always refers to a valid descriptor; the slots of
//! released pages are recycled instead.

use core::{
    alloc::Layout,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, Ordering},
};

use crate::Platform;

use super::page::{Page, PageIndex};

/// Number of descriptors per chunk.
pub(crate) const CHUNK_PAGES: usize = 128;

/// Maximum number of chunks.
pub(crate) const MAX_CHUNKS: usize = 512;

/// PageArena.
pub(crate) struct PageArena {
    chunks: [AtomicPtr<Page>; MAX_CHUNKS],
    slots: spin::Mutex<ArenaSlots>,
}

impl PageArena {
    /// Creates an empty arena.
    pub(crate) fn new() -> Self {
        let chunks = core::array::from_fn(|_| AtomicPtr::new(ptr::null_mut()));
        let slots = spin::Mutex::new(ArenaSlots::default());

        Self { chunks, slots, }
    }

    /// Returns the descriptor at `index`.
    ///
    /// #   Panics
    ///
    /// If `index` was never handed out by `acquire`.
    pub(crate) fn get(&self, index: PageIndex) -> &Page {
        let (chunk, slot) = Self::split(index);

        let pointer = self.chunks[chunk].load(Ordering::Acquire);
        assert!(!pointer.is_null(), "{:?} was never acquired", index);

        //  Safety:
        //  -   The chunk was fully initialized prior to its publication, and lives until `close`.
        //  -   `slot < CHUNK_PAGES`.
        unsafe { &*pointer.add(slot) }
    }

    /// Acquires a blank descriptor.
    ///
    /// Returns `None` if the arena is full, or the platform cannot provide a new chunk.
    pub(crate) fn acquire<P: Platform>(&self, platform: &P) -> Option<PageIndex> {
        let mut slots = self.slots.lock();

        if let Some(index) = slots.recycled {
            //  Recycled slots are linked through `next`, under the lock.
            slots.recycled = self.get(index).next.replace(None);
            return Some(index);
        }

        let fresh = slots.fresh;

        if fresh as usize == CHUNK_PAGES * MAX_CHUNKS {
            return None;
        }

        let (chunk, slot) = Self::split(PageIndex::new(fresh));

        if slot == 0 {
            let pointer = Self::allocate_chunk(platform, fresh)?;
            self.chunks[chunk].store(pointer.as_ptr(), Ordering::Release);
        }

        slots.fresh += 1;

        Some(PageIndex::new(fresh))
    }

    /// Releases a descriptor, for later reuse.
    ///
    /// The page must no longer be referred to.
    pub(crate) fn release(&self, index: PageIndex) {
        let mut slots = self.slots.lock();

        let page = self.get(index);
        debug_assert!(page.base().is_none());

        page.prev.set(None);
        page.next.set(slots.recycled);

        slots.recycled = Some(index);
    }

    /// Returns the number of descriptors handed out, and not released.
    pub(crate) fn live(&self) -> usize {
        let slots = self.slots.lock();

        let recycled = core::iter::successors(slots.recycled, |index| self.get(*index).next.get()).count();

        slots.fresh as usize - recycled
    }

    /// Releases all chunks.
    ///
    /// #   Safety
    ///
    /// -   Assumes that no descriptor is referred to any longer.
    /// -   Assumes that `platform` is the platform chunks were acquired with.
    pub(crate) unsafe fn close<P: Platform>(&self, platform: &P) {
        let mut slots = self.slots.lock();

        for chunk in &self.chunks {
            let pointer = chunk.swap(ptr::null_mut(), Ordering::Acquire);

            if let Some(pointer) = NonNull::new(pointer) {
                platform.deallocate(pointer.cast(), Self::chunk_layout());
            }
        }

        *slots = ArenaSlots::default();
    }

    //  Internal: splits an index into chunk and slot.
    fn split(index: PageIndex) -> (usize, usize) {
        let index = index.value() as usize;

        (index / CHUNK_PAGES, index % CHUNK_PAGES)
    }

    fn chunk_layout() -> Layout {
        //  Safety:
        //  -   `Page` is a handful of words, a few hundreds of them cannot overflow.
        unsafe { Layout::from_size_align_unchecked(core::mem::size_of::<Page>() * CHUNK_PAGES, core::mem::align_of::<Page>()) }
    }

    //  Internal: allocates, and initializes, the chunk starting at `first`.
    fn allocate_chunk<P: Platform>(platform: &P, first: u32) -> Option<NonNull<Page>> {
        //  Safety:
        //  -   The layout is non-zero sized.
        let pointer: NonNull<Page> = unsafe { platform.allocate(Self::chunk_layout()) }?.cast();

        for slot in 0..CHUNK_PAGES {
            //  Safety:
            //  -   `slot` is within the chunk, and the chunk is exclusively accessed.
            unsafe { ptr::write(pointer.as_ptr().add(slot), Page::new(PageIndex::new(first + slot as u32))) };
        }

        log::trace!("Page arena: chunk {} allocated at {:?}", first as usize / CHUNK_PAGES, pointer);

        Some(pointer)
    }
}

impl Default for PageArena {
    fn default() -> Self { Self::new() }
}

//
//  Implementation
//

#[derive(Default)]
struct ArenaSlots {
    fresh: u32,
    recycled: Option<PageIndex>,
}

#[cfg(test)]
mod tests {

use super::*;
use super::super::test::TestPlatform;

#[test]
fn page_arena_acquire_release() {
    let platform = TestPlatform::default();
    let arena = PageArena::new();

    let a = arena.acquire(&platform).unwrap();
    let b = arena.acquire(&platform).unwrap();

    assert_eq!(PageIndex::new(0), a);
    assert_eq!(PageIndex::new(1), b);
    assert_eq!(b, arena.get(b).index());
    assert_eq!(2, arena.live());
    assert_eq!(1, platform.allocations());

    arena.release(a);
    assert_eq!(1, arena.live());

    //  Released slots are recycled before fresh ones.
    assert_eq!(a, arena.acquire(&platform).unwrap());
    assert_eq!(PageIndex::new(2), arena.acquire(&platform).unwrap());

    unsafe { arena.close(&platform) };
    assert_eq!(1, platform.deallocations());
}

#[test]
fn page_arena_grow() {
    let platform = TestPlatform::default();
    let arena = PageArena::new();

    for i in 0..(CHUNK_PAGES + 1) {
        assert_eq!(PageIndex::new(i as u32), arena.acquire(&platform).unwrap());
    }

    assert_eq!(2, platform.allocations());
    assert_eq!(PageIndex::new(CHUNK_PAGES as u32), arena.get(PageIndex::new(CHUNK_PAGES as u32)).index());

    unsafe { arena.close(&platform) };
    assert_eq!(2, platform.deallocations());
}

#[test]
fn page_arena_out_of_memory() {
    let platform = TestPlatform::default().with_budget(0);
    let arena = PageArena::new();

    assert_eq!(None, arena.acquire(&platform));
    assert_eq!(0, arena.live());
}

#[test]
#[should_panic]
fn page_arena_get_unknown() {
    let arena = PageArena::new();
    arena.get(PageIndex::new(3));
}

} // mod tests
