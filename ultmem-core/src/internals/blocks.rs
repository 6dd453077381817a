//! Blocks
//!
//! A Block represent a unit of allocation, carved from a Page.
//!
//! Whilst allocated, the content of the block is purely in the hands of its user. Whilst deallocated, however, the
//! first bytes of the block are reused to store a `FreeBlock`: the link to the next free block. The page of a free
//! block is implied by the list it is linked in.
//!
//! A free block is linked in exactly one of two lists of its page:
//!
//! -   The local list, `BlockStack`, only ever accessed by the owner of the page.
//! -   The remote list, `RemoteFreeList`, pushed to by any thread and drained by the owner.
//!
//! Note: FreeBlocks are never _constructed_ by value, instead raw memory is reinterpreted.

use core::{
    cell::Cell,
    ptr::{self, NonNull},
    sync::atomic::{AtomicU32, Ordering},
};

use crate::{PowerOf2, utils};

use super::{atomic::AtomicLink, page::PageIndex};

/// A block handed out by a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Block {
    pointer: NonNull<u8>,
    page: PageIndex,
}

impl Block {
    /// Creates an instance.
    pub(crate) fn new(pointer: NonNull<u8>, page: PageIndex) -> Self { Self { pointer, page } }

    /// Returns the address of the first byte of the block.
    pub(crate) fn pointer(&self) -> NonNull<u8> { self.pointer }

    /// Returns the page the block was carved from.
    pub(crate) fn page(&self) -> PageIndex { self.page }
}

/// FreeBlock.
#[repr(C)]
pub(crate) struct FreeBlock {
    next: Cell<Option<NonNull<FreeBlock>>>,
}

impl FreeBlock {
    /// Minimum size of a block.
    pub(crate) const MINIMUM_SIZE: usize = core::mem::size_of::<FreeBlock>();

    /// In-place constructs a `FreeBlock`.
    ///
    /// #   Safety
    ///
    /// -   Assumes that access to the memory location is exclusive.
    /// -   Assumes that there is sufficient memory available.
    /// -   Assumes that the pointer is correctly aligned.
    #[allow(clippy::cast_ptr_alignment)]
    pub(crate) unsafe fn initialize(at: NonNull<u8>) -> NonNull<FreeBlock> {
        debug_assert!(utils::is_sufficiently_aligned_for(at, PowerOf2::align_of::<FreeBlock>()));

        let block = at.as_ptr() as *mut FreeBlock;

        //  Safety:
        //  -   Access to the memory location is exclusive.
        //  -   `block` is assumed to be sufficiently sized and aligned.
        ptr::write(block, FreeBlock { next: Cell::new(None) });

        at.cast()
    }
}

/// BlockStack.
///
/// The stack of free blocks local to the owner of a page.
#[derive(Default)]
pub(crate) struct BlockStack(Cell<Option<NonNull<FreeBlock>>>);

impl BlockStack {
    /// Returns whether the stack is empty, or not.
    pub(crate) fn is_empty(&self) -> bool { self.0.get().is_none() }

    /// Pops the head of the stack, if any.
    pub(crate) fn pop(&self) -> Option<NonNull<FreeBlock>> {
        let result = self.0.get()?;

        //  Safety:
        //  -   Non-null, and valid instance.
        let next = unsafe { result.as_ref().next.get() };
        self.0.set(next);

        Some(result)
    }

    /// Pushes the block at the head of the stack.
    ///
    /// #   Safety
    ///
    /// -   Assumes that access to the block is exclusive.
    pub(crate) unsafe fn push(&self, block: NonNull<FreeBlock>) {
        //  Safety:
        //  -   Bounded lifetime.
        block.as_ref().next.set(self.0.get());

        self.0.set(Some(block));
    }

    /// Clears the stack, forgetting its blocks.
    pub(crate) fn clear(&self) { self.0.set(None); }

    /// Returns the head, without popping it.
    #[cfg(test)]
    pub(crate) fn peek(&self) -> Option<NonNull<FreeBlock>> { self.0.get() }
}

/// RemoteFreeList.
///
/// The list of blocks freed by threads other than the owner of the page.
///
/// Any number of threads may `push` concurrently, whilst only the owner may `drain`, hence releasing a block remotely
/// never touches the memory of the owner, and draining needs no more than an acquire exchange of the head.
#[derive(Default)]
pub(crate) struct RemoteFreeList {
    head: AtomicLink<FreeBlock>,
    pub(super) pending: AtomicU32,
}

impl RemoteFreeList {
    /// Returns whether no block is linked, as of now.
    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool { self.head.load_acquire().is_none() }

    /// Returns the number of blocks pushed, and not yet drained.
    pub(crate) fn pending(&self) -> u32 { self.pending.load(Ordering::Acquire) }

    /// Pushes a block, from any thread.
    ///
    /// #   Safety
    ///
    /// -   Assumes that access to the block is exclusive.
    pub(crate) unsafe fn push(&self, block: NonNull<FreeBlock>) {
        //  The counter is bumped first: an owner observing the block in the list necessarily observes the increment.
        self.pending.fetch_add(1, Ordering::Release);

        let mut current = self.head.load_relaxed();

        loop {
            //  Safety:
            //  -   Access to the block is exclusive until it is published.
            block.as_ref().next.set(current);

            match self.head.compare_exchange_release(current, Some(block)) {
                Ok(_) => return,
                Err(new_current) => current = new_current,
            }
        }
    }

    /// Drains the list into `local`, from the owner only.
    ///
    /// Returns the number of blocks transferred.
    ///
    /// #   Safety
    ///
    /// -   Assumes that a single thread calls `drain` at a time.
    pub(crate) unsafe fn drain(&self, local: &BlockStack) -> u32 {
        let mut cursor = self.head.take_acquire();
        let mut count = 0;

        while let Some(block) = cursor {
            //  Safety:
            //  -   The head was acquired, hence all links written prior to publication are visible.
            cursor = block.as_ref().next.get();

            local.push(block);
            count += 1;
        }

        if count > 0 {
            let previous = self.pending.fetch_sub(count, Ordering::AcqRel);
            debug_assert!(previous >= count, "{} < {}", previous, count);
        }

        count
    }
}

#[cfg(test)]
mod tests {

use super::*;
use super::super::test::AlignedBlocks;

#[test]
fn free_block_initialize() {
    let blocks = AlignedBlocks::default();

    //  Safety:
    //  -   The memory is exclusively accessed, sufficiently sized and aligned.
    let block = unsafe { FreeBlock::initialize(blocks.get(0)) };
    assert_eq!(blocks.get(0), block.cast());

    //  Safety:
    //  -   Initialized above.
    let block = unsafe { block.as_ref() };

    assert_eq!(None, block.next.get());
}

#[test]
fn block_stack_push_pop() {
    let blocks = AlignedBlocks::default();
    let (a, b) = unsafe { (blocks.free(0), blocks.free(1)) };

    let stack = BlockStack::default();
    assert!(stack.is_empty());
    assert_eq!(None, stack.pop());

    unsafe {
        stack.push(b);
        stack.push(a);
    }

    assert_eq!(Some(a), stack.peek());
    assert_eq!(Some(a), stack.pop());
    assert_eq!(Some(b), stack.pop());
    assert_eq!(None, stack.pop());
    assert!(stack.is_empty());
}

#[test]
fn remote_free_list_push_drain() {
    let blocks = AlignedBlocks::default();
    let (a, b, c) = unsafe { (blocks.free(0), blocks.free(1), blocks.free(2)) };

    let remote = RemoteFreeList::default();
    assert!(remote.is_empty());
    assert_eq!(0, remote.pending());

    unsafe {
        remote.push(a);
        remote.push(b);
    }

    assert!(!remote.is_empty());
    assert_eq!(2, remote.pending());

    let local = BlockStack::default();
    unsafe { local.push(c) };

    assert_eq!(2, unsafe { remote.drain(&local) });
    assert!(remote.is_empty());
    assert_eq!(0, remote.pending());

    //  The drained blocks are prepended, in reverse order of the remote list.
    assert_eq!(Some(a), local.pop());
    assert_eq!(Some(b), local.pop());
    assert_eq!(Some(c), local.pop());
    assert_eq!(None, local.pop());

    assert_eq!(0, unsafe { remote.drain(&local) });
}

#[test]
fn remote_free_list_concurrent_push() {
    use std::sync::Arc;

    use ultmem_test::LockstepBuilder;

    const THREADS: usize = 4;
    const PER_THREAD: usize = 8;

    struct Global {
        blocks: AlignedBlocks,
        remote: RemoteFreeList,
    }

    //  Safety:
    //  -   Each thread only touches its own blocks, until they are published.
    unsafe impl Send for Global {}
    unsafe impl Sync for Global {}

    let global = Global { blocks: AlignedBlocks::default(), remote: RemoteFreeList::default() };

    let mut builder = LockstepBuilder::new(global, (0..THREADS).collect());

    builder.add_step(|| |global: &Global, local: &mut usize| {
        for i in 0..PER_THREAD {
            let block = unsafe { global.blocks.free(*local * PER_THREAD + i) };
            unsafe { global.remote.push(block) };
        }
    });

    let lockstep = builder.launch(1);
    lockstep.join();

    let global: Arc<Global> = lockstep.into_global();

    assert_eq!((THREADS * PER_THREAD) as u32, global.remote.pending());

    let local = BlockStack::default();
    assert_eq!((THREADS * PER_THREAD) as u32, unsafe { global.remote.drain(&local) });
    assert_eq!(0, global.remote.pending());

    let mut seen = std::collections::BTreeSet::new();

    while let Some(block) = local.pop() {
        assert!(seen.insert(block.as_ptr() as usize), "{:?} drained twice", block);
    }

    assert_eq!(THREADS * PER_THREAD, seen.len());
}

} // mod tests
