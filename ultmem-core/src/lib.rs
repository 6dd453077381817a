#![cfg_attr(not(test), no_std)]

#![deny(missing_docs)]

//! Building blocks for the memory of a cooperative-threading runtime.
//!
//! ultmem-core supplies execution contexts, each a stack and its thread descriptor co-located in a single block, and
//! stackless task descriptors at high rates, and resolves scheduler-visible unit handles into thread descriptors. It
//! contains:
//! -   A platform trait, used to allocate large pages of memory to be carved up into blocks.
//! -   A shared `MemoryContext`, holding the global pools and the unit table, and per-worker `ExecutionUnit` caches.
//! -   Thread and task descriptors, and the unit handles associating them with scheduler pools.

mod api;
mod internals;
mod utils;

pub use api::*;
pub use utils::PowerOf2;
