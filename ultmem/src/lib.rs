#![deny(missing_docs)]

//! The memory of a cooperative-threading runtime, ready to use.
//!
//! `Memory` is a `MemoryContext` on the default platform of the target: `LinuxPlatform` on Linux, backed by `mmap`,
//! and `SystemPlatform`, backed by the global allocator, elsewhere.
//!
//! ```
//! let memory = ultmem::memory().expect("valid configuration");
//! let worker = memory.execution_unit();
//!
//! let thread = worker.alloc_thread(None).expect("memory");
//!
//! //  Safety:
//! //  -   The thread was allocated from `worker`, and is not in use.
//! unsafe { worker.free_thread(thread) };
//! ```

mod config;
mod platform;

pub use config::{configuration_from, configuration_from_env};
pub use platform::{DefaultPlatform, SystemPlatform};

#[cfg(target_os = "linux")]
pub use platform::LinuxPlatform;

pub use ultmem_core::{
    CACHE_LINE_SIZE, Configuration, Error, ExecutionUnit, LargePageKind, MemoryContext, OwnerId, Platform, PoolHandle,
    Result, StackKind, Statistics, TaskDescriptor, TaskFn, TaskHandle, ThreadAttributes, ThreadDescriptor,
    ThreadHandle, UnitHandle, UnitPool, UNIT_TABLE_SIZE, set_associated_pool,
};

/// The memory context of the default platform.
pub type Memory = MemoryContext<DefaultPlatform>;

/// An execution unit of the default platform.
pub type Worker<'a> = ExecutionUnit<'a, DefaultPlatform>;

/// Creates a memory context on the default platform, configured from the environment.
///
/// See `configuration_from_env` for the variables read.
pub fn memory() -> Result<Memory> {
    MemoryContext::new(configuration_from_env(), DefaultPlatform::new())
}
