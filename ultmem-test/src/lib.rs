//! Test helpers for ultmem.
//!
//! The central piece is `Lockstep`, a runner executing user-specified steps in lock-step across multiple threads, so
//! that each step starts as simultaneously as possible on every thread. It is meant to flush out data-races, and
//! race-conditions, in the lock-free parts of ultmem.

#![deny(missing_docs)]

mod lockstep;

pub use lockstep::{Lockstep, LockstepBuilder};
