//! Memory Context
//!
//! The shared state of a runtime instance: the page source, the global pools of stacks and tasks, and the unit table.
//!
//! A `MemoryContext` is created explicitly, shared by reference between the execution units and the external callers,
//! and torn down on drop. Its configuration is resolved once, at creation.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::{
    Configuration, Error, ExecutionUnit, OwnerId, Platform, Result, TaskHandle, ThreadAttributes, ThreadHandle,
    UnitHandle,
    internals::{
        coallocator::{self, BlockPool, GlobalBlocks, StackLayout, StackRequest, TASK_BLOCK_SIZE},
        global_pool::GlobalPool,
        page_source::PageSource,
        unit_table::UnitTable,
    },
};

/// A snapshot of the counters of a `MemoryContext`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Number of pages obtained from the platform, since creation.
    pub pages_allocated: usize,
    /// Number of pages released to the platform, since creation.
    pub pages_released: usize,
    /// Number of page allocations which fell back to a cheaper kind of large page.
    pub large_page_fallbacks: usize,
    /// Number of thread and task descriptors allocated directly from the platform.
    pub direct_allocations: usize,
    /// Number of pages currently held by the global pool of stacks.
    pub global_stack_pages: usize,
    /// Number of pages currently held by the global pool of tasks.
    pub global_task_pages: usize,
    /// Number of units currently mapped in the unit table.
    pub mapped_units: usize,
    /// Number of entries allocated by the unit table, mapped or recycled.
    pub unit_entries: usize,
}

/// MemoryContext
pub struct MemoryContext<P: Platform> {
    configuration: Configuration,
    layout: StackLayout,
    source: PageSource<P>,
    stacks: GlobalPool,
    tasks: GlobalPool,
    units: UnitTable,
    owners: AtomicU32,
    direct: AtomicUsize,
}

impl<P: Platform> MemoryContext<P> {
    /// Creates a context, after validating the configuration.
    pub fn new(configuration: Configuration, platform: P) -> Result<Self> {
        configuration.validate()?;

        let layout = StackLayout::new();

        if layout.usable(configuration.stack_size()).is_err() {
            return Err(Error::InvalidConfiguration("stack size cannot hold the descriptor header"));
        }

        let max_empty_pages = configuration.max_global_empty_pages();

        let source = PageSource::new(platform, configuration.page_size(), configuration.large_page());
        let stacks = GlobalPool::new(configuration.stack_size(), max_empty_pages);
        let tasks = GlobalPool::new(TASK_BLOCK_SIZE, max_empty_pages);

        log::debug!("Memory context: created with {:?}, header of {} bytes", configuration, layout.header_size());

        Ok(Self {
            configuration,
            layout,
            source,
            stacks,
            tasks,
            units: UnitTable::new(),
            owners: AtomicU32::new(OwnerId::GLOBAL.value() + 1),
            direct: AtomicUsize::new(0),
        })
    }

    /// Returns the configuration.
    pub fn configuration(&self) -> &Configuration { &self.configuration }

    /// Returns the platform.
    pub fn platform(&self) -> &P { self.source.platform() }

    /// Returns a snapshot of the counters.
    pub fn statistics(&self) -> Statistics {
        let counters = self.source.counters();

        Statistics {
            pages_allocated: counters.allocated.load(Ordering::Relaxed),
            pages_released: counters.released.load(Ordering::Relaxed),
            large_page_fallbacks: counters.fallbacks.load(Ordering::Relaxed),
            direct_allocations: self.direct.load(Ordering::Relaxed),
            global_stack_pages: self.stacks.len(),
            global_task_pages: self.tasks.len(),
            mapped_units: self.units.len(),
            unit_entries: self.units.capacity(),
        }
    }

    /// Creates a new execution unit, with its own identity.
    ///
    /// #   Panics
    ///
    /// If the identities are exhausted.
    pub fn execution_unit(&self) -> ExecutionUnit<'_, P> {
        let owner = self.owners.fetch_add(1, Ordering::Relaxed);
        assert!(owner != OwnerId::GLOBAL.value(), "execution unit identities exhausted");

        ExecutionUnit::new(self, OwnerId::new(owner))
    }

    /// Allocates a thread and its stack, on behalf of a caller outside of any execution unit.
    ///
    /// Stacks of the default size are served by the global pool of stacks if external pooling is configured, and
    /// allocated directly otherwise.
    pub fn alloc_thread(&self, attributes: Option<&ThreadAttributes>) -> Result<ThreadHandle> {
        let attributes = attributes.copied().unwrap_or_default();
        let pooled = self.configuration.external_pooling();
        let request = StackRequest::resolve(&attributes, self.configuration.stack_size(), pooled);

        self.allocate_thread(&self.external_stacks(), request)
    }

    /// Frees a thread, on behalf of a caller outside of any execution unit.
    ///
    /// #   Safety
    ///
    /// -   Assumes that `thread` was allocated from this context, and is no longer in use.
    pub unsafe fn free_thread(&self, thread: ThreadHandle) { coallocator::free_thread(&self.external_stacks(), thread) }

    /// Allocates a task, on behalf of a caller outside of any execution unit.
    pub fn alloc_task(&self) -> Result<TaskHandle> {
        self.allocate_task(&self.external_tasks(), self.configuration.external_pooling())
    }

    /// Frees a task, on behalf of a caller outside of any execution unit.
    ///
    /// #   Safety
    ///
    /// -   Assumes that `task` was allocated from this context, and is no longer in use.
    pub unsafe fn free_task(&self, task: TaskHandle) { coallocator::free_task(&self.external_tasks(), task) }

    /// Returns whether `task` was obtained from a pool of tasks.
    ///
    /// #   Safety
    ///
    /// -   Assumes that `task` was allocated from this context, and is not yet freed.
    pub unsafe fn is_pooled_task(&self, task: TaskHandle) -> bool { coallocator::is_pooled_task(task) }

    /// Maps a foreign unit to its thread.
    ///
    /// #   Panics
    ///
    /// If `unit` is builtin.
    pub fn map_unit(&self, unit: UnitHandle, thread: ThreadHandle) -> Result<()> {
        self.units.map(self.source.platform(), unit, thread)
    }

    /// Unmaps a foreign unit.
    ///
    /// #   Panics
    ///
    /// If `unit` is not mapped.
    pub fn unmap_unit(&self, unit: UnitHandle) { self.units.unmap(unit) }

    /// Returns the thread of a unit: decoded if builtin, looked up otherwise.
    pub fn unit_thread(&self, unit: UnitHandle) -> Option<ThreadHandle> {
        unit.as_builtin_thread().or_else(|| self.units.get(unit))
    }

    /// Returns the number of mapped units.
    pub fn mapped_units(&self) -> usize { self.units.len() }

    pub(crate) fn source(&self) -> &PageSource<P> { &self.source }

    pub(crate) fn global_stacks(&self) -> &GlobalPool { &self.stacks }

    pub(crate) fn global_tasks(&self) -> &GlobalPool { &self.tasks }

    pub(crate) fn allocate_thread<B>(&self, pool: &B, request: StackRequest) -> Result<ThreadHandle>
        where
            B: BlockPool<Platform = P>,
    {
        let is_direct = matches!(request, StackRequest::Direct(_));

        let thread = coallocator::allocate_thread(pool, &self.layout, request)?;

        if is_direct {
            self.direct.fetch_add(1, Ordering::Relaxed);
        }

        Ok(thread)
    }

    pub(crate) fn allocate_task<B>(&self, pool: &B, pooled: bool) -> Result<TaskHandle>
        where
            B: BlockPool<Platform = P>,
    {
        let task = coallocator::allocate_task(pool, pooled)?;

        if !pooled {
            self.direct.fetch_add(1, Ordering::Relaxed);
        }

        Ok(task)
    }

    fn external_stacks(&self) -> GlobalBlocks<'_, P> { GlobalBlocks { source: &self.source, global: &self.stacks } }

    fn external_tasks(&self) -> GlobalBlocks<'_, P> { GlobalBlocks { source: &self.source, global: &self.tasks } }
}

impl<P: Platform> Drop for MemoryContext<P> {
    fn drop(&mut self) {
        let platform = self.source.platform();

        //  Safety:
        //  -   `&mut self` guarantees that no execution unit, nor external caller, remains.
        //  -   The unit table is closed first: a live unit panics before any page is released.
        unsafe {
            self.units.close(platform);
            self.stacks.close(&self.source);
            self.tasks.close(&self.source);
            self.source.close();
        }

        log::debug!("Memory context: closed");
    }
}

// mod tests
