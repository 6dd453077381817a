//! The API of ultmem-core.

mod configuration;
mod context;
mod descriptor;
mod error;
mod execution_unit;
mod platform;
mod unit;

pub use configuration::{Configuration, LargePageKind, CACHE_LINE_SIZE};
pub use context::{MemoryContext, Statistics};
pub use descriptor::{StackKind, TaskDescriptor, TaskFn, TaskHandle, ThreadAttributes, ThreadDescriptor, ThreadHandle};
pub use error::{Error, Result};
pub use execution_unit::{ExecutionUnit, OwnerId};
pub use platform::Platform;
pub use unit::{set_associated_pool, PoolHandle, UnitHandle, UnitPool, UNIT_TABLE_SIZE};
