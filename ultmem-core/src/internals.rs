//! The internals of ultmem-core.
//!
//! The internals provide all the heavy-lifting.

pub(crate) mod blocks;
pub(crate) mod coallocator;
pub(crate) mod global_pool;
pub(crate) mod local_pool;
pub(crate) mod page;
pub(crate) mod page_arena;
pub(crate) mod page_source;
pub(crate) mod unit_table;

mod atomic;
