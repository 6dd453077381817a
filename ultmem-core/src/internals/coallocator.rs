//! Co-allocator
//!
//! Allocates thread descriptors along with their stacks, and task descriptors.
//!
//! A stack region is laid out as:
//!
//! ```text
//! +------------------+-------------+---------------------------------------+
//! | ThreadDescriptor | StackHeader | usable stack ...                      |
//! +------------------+-------------+---------------------------------------+
//! ^ region           ^             ^ region + header size (cache aligned)
//! ```
//!
//! The region is either a block of a stack pool, or a direct allocation; the descriptors of threads whose stack is
//! not allocated here are allocated alone.
//!
//! A task block is laid out as a `TaskDescriptor`, immediately followed by its `TaskOrigin`.

use core::{
    alloc::Layout,
    mem,
    ptr::{self, NonNull},
};

use crate::{
    CACHE_LINE_SIZE, Error, Platform, Result, StackKind, TaskDescriptor, TaskHandle, ThreadAttributes,
    ThreadDescriptor, ThreadHandle,
};

use super::{
    blocks::Block,
    global_pool::GlobalPool,
    local_pool::LocalPool,
    page::PageIndex,
    page_source::PageSource,
};

/// The size of the blocks of the task pools.
pub(crate) const TASK_BLOCK_SIZE: usize = CACHE_LINE_SIZE.round_up(mem::size_of::<TaskBlock>());

/// A source of blocks of a single class.
pub(crate) trait BlockPool {
    /// The platform backing the pool.
    type Platform: Platform;

    /// Returns the platform, for direct allocations.
    fn platform(&self) -> &Self::Platform;

    /// Returns the size of the blocks.
    fn block_size(&self) -> usize;

    /// Allocates a block.
    fn allocate(&self) -> Result<Block>;

    /// Deallocates a block.
    ///
    /// #   Safety
    ///
    /// -   Assumes that `block` was allocated from a pool of this class, and is no longer in use.
    unsafe fn deallocate(&self, block: Block);
}

/// The blocks of an execution unit.
pub(crate) struct LocalBlocks<'a, P> {
    pub(crate) source: &'a PageSource<P>,
    pub(crate) global: &'a GlobalPool,
    pub(crate) local: &'a LocalPool,
}

impl<'a, P: Platform> BlockPool for LocalBlocks<'a, P> {
    type Platform = P;

    fn platform(&self) -> &P { self.source.platform() }

    fn block_size(&self) -> usize { self.global.block_size() }

    fn allocate(&self) -> Result<Block> { self.local.allocate(self.source, self.global) }

    unsafe fn deallocate(&self, block: Block) { self.local.deallocate(self.source, self.global, block) }
}

/// The blocks of a caller external to any execution unit.
pub(crate) struct GlobalBlocks<'a, P> {
    pub(crate) source: &'a PageSource<P>,
    pub(crate) global: &'a GlobalPool,
}

impl<'a, P: Platform> BlockPool for GlobalBlocks<'a, P> {
    type Platform = P;

    fn platform(&self) -> &P { self.source.platform() }

    fn block_size(&self) -> usize { self.global.block_size() }

    fn allocate(&self) -> Result<Block> { self.global.allocate(self.source) }

    unsafe fn deallocate(&self, block: Block) { self.global.deallocate(self.source, block) }
}

/// How the memory of a thread descriptor, and its stack, was obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StackAllocation {
    /// A block of a stack pool, holding descriptor and stack.
    Pooled(Block),
    /// A direct allocation, holding descriptor and stack.
    Direct { region: NonNull<u8>, layout: Layout },
    /// A descriptor allocated alone, the stack being supplied by the user.
    User,
    /// A descriptor allocated alone, without stack.
    Main,
}

impl StackAllocation {
    pub(crate) fn kind(&self) -> StackKind {
        match self {
            StackAllocation::Pooled(_) => StackKind::Pooled,
            StackAllocation::Direct { .. } => StackKind::Direct,
            StackAllocation::User => StackKind::User,
            StackAllocation::Main => StackKind::Main,
        }
    }
}

/// The bookkeeping header of a stack region, placed right after its descriptor.
#[repr(C)]
pub(crate) struct StackHeader {
    descriptor: NonNull<ThreadDescriptor>,
    region_size: usize,
    stack: NonNull<u8>,
}

/// The layout of stack regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct StackLayout {
    header_size: usize,
}

impl StackLayout {
    pub(crate) const fn new() -> Self {
        let header_size = CACHE_LINE_SIZE.round_up(mem::size_of::<ThreadDescriptor>() + mem::size_of::<StackHeader>());

        Self { header_size }
    }

    /// Returns the size of the header: descriptor and stack header, rounded up to a cache line.
    pub(crate) const fn header_size(&self) -> usize { self.header_size }

    /// Returns the size of the usable stack of a region.
    pub(crate) fn usable(&self, region_size: usize) -> Result<usize> {
        if region_size <= self.header_size {
            return Err(Error::StackTooSmall { requested: region_size, overhead: self.header_size });
        }

        Ok(region_size - self.header_size)
    }

    //  Internal: lays out descriptor, header and stack within region.
    //
    //  #   Safety
    //
    //  -   Assumes that `region` is exclusively accessed, cache aligned, and `region_size` bytes large.
    unsafe fn emplace(&self, region: NonNull<u8>, region_size: usize, allocation: StackAllocation)
        -> NonNull<ThreadDescriptor>
    {
        debug_assert!(region_size > self.header_size);
        debug_assert!(CACHE_LINE_SIZE.divides(region.as_ptr() as usize));

        let descriptor: NonNull<ThreadDescriptor> = region.cast();
        let stack = NonNull::new_unchecked(region.as_ptr().add(self.header_size));
        let stack_size = region_size - self.header_size;

        ptr::write(descriptor.as_ptr(), ThreadDescriptor::new(Some(stack), stack_size, allocation));
        ptr::write(Self::header_of(descriptor).as_ptr(), StackHeader { descriptor, region_size, stack });

        descriptor
    }

    //  Internal: the header follows the descriptor.
    unsafe fn header_of(descriptor: NonNull<ThreadDescriptor>) -> NonNull<StackHeader> {
        NonNull::new_unchecked(descriptor.as_ptr().add(1)).cast()
    }
}

/// A resolved request for a thread stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StackRequest {
    Pooled,
    Direct(usize),
    User { stack: NonNull<u8>, size: usize },
    Main,
}

impl StackRequest {
    /// Determines how the stack of a thread is obtained.
    ///
    /// Only stacks of the default size are pooled, and only if `pooled` indicates that a pool is available.
    pub(crate) fn resolve(attributes: &ThreadAttributes, default_stack_size: usize, pooled: bool) -> Self {
        if attributes.is_main() {
            return StackRequest::Main;
        }

        if let Some((stack, size)) = attributes.user_stack() {
            return StackRequest::User { stack, size };
        }

        match attributes.stack_size() {
            Some(size) if size != default_stack_size => StackRequest::Direct(size),
            _ if pooled => StackRequest::Pooled,
            _ => StackRequest::Direct(default_stack_size),
        }
    }
}

/// Allocates a thread descriptor, and its stack as requested.
pub(crate) fn allocate_thread<B: BlockPool>(pool: &B, layout: &StackLayout, request: StackRequest)
    -> Result<ThreadHandle>
{
    let descriptor = match request {
        StackRequest::Pooled => {
            let region_size = pool.block_size();
            layout.usable(region_size)?;

            let block = pool.allocate()?;

            //  Safety:
            //  -   The block is exclusively ours, cache aligned, and `block_size` bytes large.
            unsafe { layout.emplace(block.pointer(), region_size, StackAllocation::Pooled(block)) }
        },
        StackRequest::Direct(size) => {
            let region_size = CACHE_LINE_SIZE.checked_round_up(size).ok_or(Error::OutOfMemory)?;
            layout.usable(region_size)?;

            let region_layout = Layout::from_size_align(region_size, CACHE_LINE_SIZE.value())
                .map_err(|_| Error::OutOfMemory)?;

            //  Safety:
            //  -   `region_size` is non-zero.
            let region = unsafe { pool.platform().allocate(region_layout) }.ok_or(Error::OutOfMemory)?;

            //  Safety:
            //  -   The region is exclusively ours, cache aligned, and `region_size` bytes large.
            unsafe { layout.emplace(region, region_size, StackAllocation::Direct { region, layout: region_layout }) }
        },
        StackRequest::User { stack, size } => {
            let descriptor = ThreadDescriptor::new(Some(stack), size, StackAllocation::User);
            allocate_descriptor(pool.platform(), descriptor)?
        },
        StackRequest::Main => {
            let descriptor = ThreadDescriptor::new(None, 0, StackAllocation::Main);
            allocate_descriptor(pool.platform(), descriptor)?
        },
    };

    Ok(ThreadHandle::new(descriptor))
}

/// Frees a thread descriptor, and its stack if owned.
///
/// #   Safety
///
/// -   Assumes that `thread` was allocated by `allocate_thread`, with a pool of the same class, and is no longer in
///     use.
pub(crate) unsafe fn free_thread<B: BlockPool>(pool: &B, thread: ThreadHandle) {
    let descriptor = NonNull::new_unchecked(thread.as_ptr());
    let allocation = descriptor.as_ref().allocation();

    let region_size = match allocation {
        StackAllocation::Pooled(_) => Some(pool.block_size()),
        StackAllocation::Direct { layout, .. } => Some(layout.size()),
        StackAllocation::User | StackAllocation::Main => None,
    };

    if let Some(region_size) = region_size {
        let header = StackLayout::header_of(descriptor).as_ref();

        debug_assert_eq!(descriptor, header.descriptor);
        debug_assert_eq!(region_size, header.region_size);
        debug_assert_eq!(descriptor.as_ref().stack(), Some(header.stack));
    }

    ptr::drop_in_place(descriptor.as_ptr());

    match allocation {
        StackAllocation::Pooled(block) => pool.deallocate(block),
        StackAllocation::Direct { region, layout } => pool.platform().deallocate(region, layout),
        StackAllocation::User | StackAllocation::Main =>
            pool.platform().deallocate(descriptor.cast(), Layout::new::<ThreadDescriptor>()),
    }
}

/// Allocates a task descriptor, from `pool` if `pooled`, and directly otherwise.
pub(crate) fn allocate_task<B: BlockPool>(pool: &B, pooled: bool) -> Result<TaskHandle> {
    let (pointer, origin) = if pooled {
        debug_assert!(pool.block_size() >= mem::size_of::<TaskBlock>());

        let block = pool.allocate()?;
        (block.pointer(), TaskOrigin::Pooled(block.page()))
    } else {
        //  Safety:
        //  -   `TaskBlock` is not zero-sized.
        let pointer = unsafe { pool.platform().allocate(Layout::new::<TaskBlock>()) }.ok_or(Error::OutOfMemory)?;
        (pointer, TaskOrigin::Direct)
    };

    let block: NonNull<TaskBlock> = pointer.cast();

    //  Safety:
    //  -   The memory is exclusively ours, suitably sized and aligned.
    unsafe { ptr::write(block.as_ptr(), TaskBlock { descriptor: TaskDescriptor::new(), origin }) };

    Ok(TaskHandle::new(block.cast()))
}

/// Frees a task descriptor.
///
/// #   Safety
///
/// -   Assumes that `task` was allocated by `allocate_task`, with a pool of the same class, and is no longer in use.
pub(crate) unsafe fn free_task<B: BlockPool>(pool: &B, task: TaskHandle) {
    let block: NonNull<TaskBlock> = NonNull::new_unchecked(task.as_ptr()).cast();
    let origin = block.as_ref().origin;

    ptr::drop_in_place(block.as_ptr());

    match origin {
        TaskOrigin::Pooled(page) => pool.deallocate(Block::new(block.cast(), page)),
        TaskOrigin::Direct => pool.platform().deallocate(block.cast(), Layout::new::<TaskBlock>()),
    }
}

/// Returns whether a task descriptor was obtained from a pool.
///
/// #   Safety
///
/// -   Assumes that `task` was allocated by `allocate_task`, and is not yet freed.
pub(crate) unsafe fn is_pooled_task(task: TaskHandle) -> bool {
    let block: NonNull<TaskBlock> = NonNull::new_unchecked(task.as_ptr()).cast();

    matches!(block.as_ref().origin, TaskOrigin::Pooled(_))
}

//
//  Implementation
//

//  The tag of a task descriptor, a single word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TaskOrigin {
    Pooled(PageIndex),
    Direct,
}

#[repr(C)]
struct TaskBlock {
    descriptor: TaskDescriptor,
    origin: TaskOrigin,
}

fn allocate_descriptor<P: Platform>(platform: &P, descriptor: ThreadDescriptor) -> Result<NonNull<ThreadDescriptor>> {
    //  Safety:
    //  -   `ThreadDescriptor` is not zero-sized.
    let pointer: NonNull<ThreadDescriptor> = unsafe { platform.allocate(Layout::new::<ThreadDescriptor>()) }
        .ok_or(Error::OutOfMemory)?
        .cast();

    //  Safety:
    //  -   The memory is exclusively ours, suitably sized and aligned.
    unsafe { ptr::write(pointer.as_ptr(), descriptor) };

    Ok(pointer)
}

#[cfg(test)]
mod tests {

use crate::{LargePageKind, OwnerId};

use super::*;
use super::super::test::TestPlatform;

const PAGE_SIZE: usize = 64 * 1024;
const STACK_SIZE: usize = 16 * 1024;

struct Fixture {
    source: PageSource<TestPlatform>,
    stacks: GlobalPool,
    tasks: GlobalPool,
    local_stacks: LocalPool,
    local_tasks: LocalPool,
}

impl Fixture {
    fn new() -> Self {
        Self {
            source: PageSource::new(TestPlatform::default(), PAGE_SIZE, LargePageKind::Malloc),
            stacks: GlobalPool::new(STACK_SIZE, 4),
            tasks: GlobalPool::new(TASK_BLOCK_SIZE, 4),
            local_stacks: LocalPool::new(OwnerId::new(1), STACK_SIZE),
            local_tasks: LocalPool::new(OwnerId::new(1), TASK_BLOCK_SIZE),
        }
    }

    fn stacks(&self) -> LocalBlocks<'_, TestPlatform> {
        LocalBlocks { source: &self.source, global: &self.stacks, local: &self.local_stacks }
    }

    fn tasks(&self) -> LocalBlocks<'_, TestPlatform> {
        LocalBlocks { source: &self.source, global: &self.tasks, local: &self.local_tasks }
    }

    fn global_tasks(&self) -> GlobalBlocks<'_, TestPlatform> { GlobalBlocks { source: &self.source, global: &self.tasks } }

    fn platform(&self) -> &TestPlatform { self.source.platform() }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        self.local_stacks.finalize(&self.source, &self.stacks);
        self.local_tasks.finalize(&self.source, &self.tasks);

        unsafe {
            self.stacks.close(&self.source);
            self.tasks.close(&self.source);
            self.source.close();
        }

        assert_eq!(0, self.platform().outstanding_pages());
        assert_eq!(self.platform().allocations(), self.platform().deallocations());
    }
}

#[test]
fn stack_layout_header() {
    let layout = StackLayout::new();

    assert!(layout.header_size() >= mem::size_of::<ThreadDescriptor>() + mem::size_of::<StackHeader>());
    assert!(CACHE_LINE_SIZE.divides(layout.header_size()));

    assert_eq!(Ok(STACK_SIZE - layout.header_size()), layout.usable(STACK_SIZE));
    assert_eq!(
        Err(Error::StackTooSmall { requested: layout.header_size(), overhead: layout.header_size() }),
        layout.usable(layout.header_size())
    );
}

#[test]
fn stack_request_resolve() {
    let default = ThreadAttributes::new();
    let sized = ThreadAttributes::new().with_stack_size(65536);
    let explicit_default = ThreadAttributes::new().with_stack_size(STACK_SIZE);
    let main = ThreadAttributes::main();

    let mut stack = [0u8; 64];
    let pointer = NonNull::from(&mut stack).cast();
    let user = unsafe { ThreadAttributes::new().with_user_stack(pointer, 64) };

    assert_eq!(StackRequest::Pooled, StackRequest::resolve(&default, STACK_SIZE, true));
    assert_eq!(StackRequest::Pooled, StackRequest::resolve(&explicit_default, STACK_SIZE, true));
    assert_eq!(StackRequest::Direct(STACK_SIZE), StackRequest::resolve(&default, STACK_SIZE, false));
    assert_eq!(StackRequest::Direct(65536), StackRequest::resolve(&sized, STACK_SIZE, true));
    assert_eq!(StackRequest::Main, StackRequest::resolve(&main, STACK_SIZE, true));
    assert_eq!(StackRequest::User { stack: pointer, size: 64 }, StackRequest::resolve(&user, STACK_SIZE, true));
}

#[test]
fn allocate_thread_pooled() {
    let fixture = Fixture::new();
    let layout = StackLayout::new();

    let thread = allocate_thread(&fixture.stacks(), &layout, StackRequest::Pooled).unwrap();
    let descriptor = unsafe { thread.as_ref() };

    assert_eq!(StackKind::Pooled, descriptor.kind());
    assert!(descriptor.owns_stack());
    assert_eq!(STACK_SIZE - layout.header_size(), descriptor.stack_size());

    let stack = descriptor.stack().unwrap().as_ptr() as usize;
    assert_eq!(thread.as_ptr() as usize + layout.header_size(), stack);
    assert!(CACHE_LINE_SIZE.divides(stack));

    //  The stack is usable, end to end.
    unsafe { ptr::write_bytes(stack as *mut u8, 0xAB, descriptor.stack_size()) };

    unsafe { free_thread(&fixture.stacks(), thread) };

    //  The region is reused for the next thread.
    let again = allocate_thread(&fixture.stacks(), &layout, StackRequest::Pooled).unwrap();
    assert_eq!(thread, again);
    assert_eq!(1, fixture.platform().total_pages());

    unsafe { free_thread(&fixture.stacks(), again) };
}

#[test]
fn allocate_thread_direct() {
    let fixture = Fixture::new();
    let layout = StackLayout::new();

    let thread = allocate_thread(&fixture.stacks(), &layout, StackRequest::Direct(65536 + 1)).unwrap();
    let descriptor = unsafe { thread.as_ref() };

    assert_eq!(StackKind::Direct, descriptor.kind());
    assert_eq!(65536 + 64 - layout.header_size(), descriptor.stack_size());
    assert_eq!(0, fixture.platform().total_pages());

    let allocations = fixture.platform().allocations();
    unsafe { free_thread(&fixture.stacks(), thread) };

    assert_eq!(allocations, fixture.platform().allocations());
    assert_eq!(1, fixture.platform().deallocations());
}

#[test]
fn allocate_thread_too_small() {
    let fixture = Fixture::new();
    let layout = StackLayout::new();

    let result = allocate_thread(&fixture.stacks(), &layout, StackRequest::Direct(64));

    assert!(matches!(result, Err(Error::StackTooSmall { requested: 64, .. })));
}

#[test]
fn allocate_thread_too_large() {
    let fixture = Fixture::new();
    let layout = StackLayout::new();

    for size in [usize::MAX - 8, usize::MAX - 63, isize::MAX as usize + 1] {
        let result = allocate_thread(&fixture.stacks(), &layout, StackRequest::Direct(size));

        assert_eq!(Some(Error::OutOfMemory), result.err());
    }
}

#[test]
fn allocate_thread_user_and_main() {
    let fixture = Fixture::new();
    let layout = StackLayout::new();

    let mut stack = [0u8; 4096];
    let pointer = NonNull::from(&mut stack).cast();

    let user = allocate_thread(&fixture.stacks(), &layout, StackRequest::User { stack: pointer, size: 4096 }).unwrap();
    let main = allocate_thread(&fixture.stacks(), &layout, StackRequest::Main).unwrap();

    unsafe {
        assert_eq!(StackKind::User, user.as_ref().kind());
        assert_eq!(Some(pointer), user.as_ref().stack());
        assert_eq!(4096, user.as_ref().stack_size());
        assert!(!user.as_ref().owns_stack());

        assert_eq!(StackKind::Main, main.as_ref().kind());
        assert_eq!(None, main.as_ref().stack());
        assert!(!main.as_ref().owns_stack());
    }

    assert_eq!(0, fixture.platform().total_pages());

    unsafe {
        free_thread(&fixture.stacks(), user);
        free_thread(&fixture.stacks(), main);
    }

    //  The user stack is untouched.
    assert!(stack.iter().all(|b| *b == 0));
}

#[test]
fn allocate_thread_out_of_memory() {
    let fixture = Fixture::new();
    let layout = StackLayout::new();

    fixture.platform().set_budget(0);

    assert_eq!(Err(Error::OutOfMemory), allocate_thread(&fixture.stacks(), &layout, StackRequest::Pooled));
    assert_eq!(Err(Error::OutOfMemory), allocate_thread(&fixture.stacks(), &layout, StackRequest::Direct(65536)));
    assert_eq!(Err(Error::OutOfMemory), allocate_thread(&fixture.stacks(), &layout, StackRequest::Main));
}

#[test]
fn allocate_task_tags() {
    let fixture = Fixture::new();

    let pooled = allocate_task(&fixture.tasks(), true).unwrap();
    let direct = allocate_task(&fixture.tasks(), false).unwrap();

    unsafe {
        assert!(is_pooled_task(pooled));
        assert!(!is_pooled_task(direct));
    }

    assert_eq!(1, fixture.platform().total_pages());

    //  The tag dispatches the free, whichever pool is supplied.
    unsafe {
        free_task(&fixture.global_tasks(), direct);
        free_task(&fixture.tasks(), pooled);
    }

    let again = allocate_task(&fixture.tasks(), true).unwrap();
    assert_eq!(pooled, again);

    unsafe { free_task(&fixture.tasks(), again) };
}

#[test]
fn task_block_size() {
    assert!(TASK_BLOCK_SIZE >= mem::size_of::<TaskBlock>());
    assert!(CACHE_LINE_SIZE.divides(TASK_BLOCK_SIZE));

    //  The tag is a single word, right after the descriptor.
    assert!(mem::size_of::<TaskOrigin>() <= mem::size_of::<u64>());
    assert_eq!(mem::size_of::<TaskDescriptor>(), mem::offset_of!(TaskBlock, origin));
}

} // mod tests
