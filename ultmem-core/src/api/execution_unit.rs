//! Execution Unit
//!
//! The handle of a parallel worker on the `MemoryContext`: it owns the local pools of stacks and tasks of the worker.
//!
//! An `ExecutionUnit` is not `Sync`: its local pools are only ever accessed by the worker owning it. Descriptors it
//! allocates may however be freed by any other execution unit, or by an external caller, in which case their blocks
//! are handed back to the owner of their page through its remote free list.

use crate::{
    MemoryContext, Platform, Result, TaskHandle, ThreadAttributes, ThreadHandle,
    internals::{
        coallocator::{self, LocalBlocks, StackRequest, TASK_BLOCK_SIZE},
        local_pool::LocalPool,
    },
};

/// The identity of the owner of a page: an execution unit, or the global pools.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(u32);

impl OwnerId {
    /// The owner of the pages held by the global pools.
    pub const GLOBAL: OwnerId = OwnerId(0);

    pub(crate) const fn new(value: u32) -> Self { Self(value) }

    /// Returns the raw value.
    pub const fn value(&self) -> u32 { self.0 }
}

/// ExecutionUnit
pub struct ExecutionUnit<'a, P: Platform> {
    context: &'a MemoryContext<P>,
    owner: OwnerId,
    stacks: LocalPool,
    tasks: LocalPool,
}

impl<'a, P: Platform> ExecutionUnit<'a, P> {
    pub(crate) fn new(context: &'a MemoryContext<P>, owner: OwnerId) -> Self {
        let stacks = LocalPool::new(owner, context.configuration().stack_size());
        let tasks = LocalPool::new(owner, TASK_BLOCK_SIZE);

        log::debug!("Execution unit {:?}: created", owner);

        Self { context, owner, stacks, tasks }
    }

    /// Returns the identity of the execution unit.
    pub fn owner(&self) -> OwnerId { self.owner }

    /// Returns the context.
    pub fn context(&self) -> &'a MemoryContext<P> { self.context }

    /// Allocates a thread and its stack, as per `attributes`.
    ///
    /// Stacks of the default size are obtained from the local pool of stacks, with no platform call on the fast path.
    pub fn alloc_thread(&self, attributes: Option<&ThreadAttributes>) -> Result<ThreadHandle> {
        let attributes = attributes.copied().unwrap_or_default();
        let request = StackRequest::resolve(&attributes, self.context.configuration().stack_size(), true);

        self.context.allocate_thread(&self.stacks(), request)
    }

    /// Frees a thread, and its stack if owned.
    ///
    /// The thread may have been allocated by any execution unit, or external caller, of the same context.
    ///
    /// #   Safety
    ///
    /// -   Assumes that `thread` was allocated from the same context, and is no longer in use.
    pub unsafe fn free_thread(&self, thread: ThreadHandle) { coallocator::free_thread(&self.stacks(), thread) }

    /// Allocates a task, from the local pool of tasks.
    pub fn alloc_task(&self) -> Result<TaskHandle> { self.context.allocate_task(&self.tasks(), true) }

    /// Frees a task.
    ///
    /// The task may have been allocated by any execution unit, or external caller, of the same context.
    ///
    /// #   Safety
    ///
    /// -   Assumes that `task` was allocated from the same context, and is no longer in use.
    pub unsafe fn free_task(&self, task: TaskHandle) { coallocator::free_task(&self.tasks(), task) }

    /// Returns the number of pages of stacks, and tasks, owned.
    pub fn owned_pages(&self) -> (usize, usize) { (self.stacks.len(), self.tasks.len()) }

    fn stacks(&self) -> LocalBlocks<'_, P> {
        LocalBlocks { source: self.context.source(), global: self.context.global_stacks(), local: &self.stacks }
    }

    fn tasks(&self) -> LocalBlocks<'_, P> {
        LocalBlocks { source: self.context.source(), global: self.context.global_tasks(), local: &self.tasks }
    }
}

impl<'a, P: Platform> Drop for ExecutionUnit<'a, P> {
    fn drop(&mut self) {
        self.stacks.finalize(self.context.source(), self.context.global_stacks());
        self.tasks.finalize(self.context.source(), self.context.global_tasks());

        log::debug!("Execution unit {:?}: finalized", self.owner);
    }
}

// mod tests
