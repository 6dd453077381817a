//! Descriptors
//!
//! The thread and task descriptors handed out to the runtime, their attributes, and their handles.
//!
//! A `ThreadDescriptor` records how its stack was obtained, so that it is released the same way, whichever execution
//! unit releases it.

use core::{
    cell::Cell,
    fmt,
    ptr::NonNull,
};

use crate::{
    PoolHandle,
    internals::coallocator::StackAllocation,
};

/// The signature of the function run by a task.
pub type TaskFn = fn(usize);

/// How the stack of a thread was obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StackKind {
    /// Block of an execution unit, or global, stack pool.
    Pooled,
    /// Allocated directly from the platform, along with its descriptor.
    Direct,
    /// Supplied by the user; never touched.
    User,
    /// No stack is tracked: the thread runs on the call stack it already owns.
    Main,
}

/// The attributes of a thread to create.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThreadAttributes {
    stack_size: Option<usize>,
    stack: AttributeStack,
}

impl ThreadAttributes {
    /// Creates default attributes: a pooled stack of the default size.
    pub const fn new() -> Self { Self { stack_size: None, stack: AttributeStack::Allocated } }

    /// Creates the attributes of a thread running on the stack it already owns.
    pub const fn main() -> Self { Self { stack_size: None, stack: AttributeStack::Main } }

    /// Sets the size of the stack to allocate, header included.
    ///
    /// A size other than the default stack size is allocated directly.
    pub const fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Sets a stack supplied by the user.
    ///
    /// #   Safety
    ///
    /// -   Assumes that `stack` points to `size` bytes, which outlive the thread.
    pub const unsafe fn with_user_stack(mut self, stack: NonNull<u8>, size: usize) -> Self {
        self.stack = AttributeStack::User(stack, size);
        self
    }

    /// Returns the requested stack size, if any.
    pub const fn stack_size(&self) -> Option<usize> { self.stack_size }

    /// Returns the stack supplied by the user, if any.
    pub const fn user_stack(&self) -> Option<(NonNull<u8>, usize)> {
        match self.stack {
            AttributeStack::User(stack, size) => Some((stack, size)),
            _ => None,
        }
    }

    /// Returns whether the thread runs on the stack it already owns.
    pub const fn is_main(&self) -> bool { matches!(self.stack, AttributeStack::Main) }
}

/// The descriptor of a thread: its stack, and the pool it is associated with.
pub struct ThreadDescriptor {
    stack: Option<NonNull<u8>>,
    stack_size: usize,
    pool: Cell<Option<PoolHandle>>,
    allocation: StackAllocation,
}

impl ThreadDescriptor {
    pub(crate) fn new(stack: Option<NonNull<u8>>, stack_size: usize, allocation: StackAllocation) -> Self {
        Self { stack, stack_size, pool: Cell::new(None), allocation, }
    }

    /// Returns the lowest address of the usable stack, if tracked.
    pub fn stack(&self) -> Option<NonNull<u8>> { self.stack }

    /// Returns the size of the usable stack, header excluded.
    pub fn stack_size(&self) -> usize { self.stack_size }

    /// Returns how the stack was obtained.
    pub fn kind(&self) -> StackKind { self.allocation.kind() }

    /// Returns whether the stack is released along with the descriptor.
    pub fn owns_stack(&self) -> bool { matches!(self.kind(), StackKind::Pooled | StackKind::Direct) }

    /// Returns the associated pool, if any.
    pub fn pool(&self) -> Option<PoolHandle> { self.pool.get() }

    /// Sets the associated pool.
    pub fn set_pool(&self, pool: Option<PoolHandle>) { self.pool.set(pool); }

    pub(crate) fn allocation(&self) -> StackAllocation { self.allocation }
}

impl fmt::Debug for ThreadDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadDescriptor")
            .field("stack", &self.stack)
            .field("stack_size", &self.stack_size)
            .field("kind", &self.kind())
            .field("pool", &self.pool.get())
            .finish()
    }
}

/// A handle to a `ThreadDescriptor`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ThreadHandle(NonNull<ThreadDescriptor>);

impl ThreadHandle {
    pub(crate) fn new(descriptor: NonNull<ThreadDescriptor>) -> Self { Self(descriptor) }

    /// Returns the address of the descriptor.
    pub fn as_ptr(&self) -> *mut ThreadDescriptor { self.0.as_ptr() }

    /// Returns a reference to the descriptor.
    ///
    /// #   Safety
    ///
    /// -   Assumes that the descriptor was not freed, and will not be for the lifetime `'a`.
    /// -   Assumes that the descriptor is not concurrently accessed by another thread.
    pub unsafe fn as_ref<'a>(&self) -> &'a ThreadDescriptor { &*self.0.as_ptr() }
}

//  Safety:
//  -   A handle is an address; dereferencing it is unsafe.
unsafe impl Send for ThreadHandle {}
unsafe impl Sync for ThreadHandle {}

/// The descriptor of a task: a function, and its argument.
pub struct TaskDescriptor {
    function: Cell<Option<TaskFn>>,
    argument: Cell<usize>,
    pool: Cell<Option<PoolHandle>>,
}

impl TaskDescriptor {
    pub(crate) const fn new() -> Self {
        Self { function: Cell::new(None), argument: Cell::new(0), pool: Cell::new(None), }
    }

    /// Sets the function to run, and its argument.
    pub fn set_function(&self, function: TaskFn, argument: usize) {
        self.function.set(Some(function));
        self.argument.set(argument);
    }

    /// Returns the function to run, if any.
    pub fn function(&self) -> Option<TaskFn> { self.function.get() }

    /// Returns the argument of the function.
    pub fn argument(&self) -> usize { self.argument.get() }

    /// Runs the function, if any, and returns whether it did.
    pub fn run(&self) -> bool {
        match self.function.get() {
            Some(function) => {
                function(self.argument.get());
                true
            },
            None => false,
        }
    }

    /// Returns the associated pool, if any.
    pub fn pool(&self) -> Option<PoolHandle> { self.pool.get() }

    /// Sets the associated pool.
    pub fn set_pool(&self, pool: Option<PoolHandle>) { self.pool.set(pool); }
}

impl fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("argument", &self.argument.get())
            .field("pool", &self.pool.get())
            .finish()
    }
}

/// A handle to a `TaskDescriptor`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle(NonNull<TaskDescriptor>);

impl TaskHandle {
    pub(crate) fn new(descriptor: NonNull<TaskDescriptor>) -> Self { Self(descriptor) }

    /// Returns the address of the descriptor.
    pub fn as_ptr(&self) -> *mut TaskDescriptor { self.0.as_ptr() }

    /// Returns a reference to the descriptor.
    ///
    /// #   Safety
    ///
    /// -   Assumes that the descriptor was not freed, and will not be for the lifetime `'a`.
    /// -   Assumes that the descriptor is not concurrently accessed by another thread.
    pub unsafe fn as_ref<'a>(&self) -> &'a TaskDescriptor { &*self.0.as_ptr() }
}

//  Safety:
//  -   A handle is an address; dereferencing it is unsafe.
unsafe impl Send for TaskHandle {}
unsafe impl Sync for TaskHandle {}

//
//  Implementation
//

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum AttributeStack {
    #[default]
    Allocated,
    User(NonNull<u8>, usize),
    Main,
}

// mod tests
