//! Errors reported by ultmem-core.
//!
//! Only recoverable conditions are reported as errors. Violations of the internal invariants, such as unmapping a unit
//! which was never mapped or releasing a page with outstanding blocks, are caller contract breaches and trigger a panic
//! instead.

/// Errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The platform could not supply the memory.
    #[error("out of memory")]
    OutOfMemory,
    /// The unit handle is null.
    #[error("invalid unit handle")]
    InvalidUnit,
    /// The pool handle is null.
    #[error("invalid pool handle")]
    InvalidPool,
    /// The requested stack cannot hold the descriptor header.
    #[error("stack of {requested} bytes cannot hold the {overhead} bytes of descriptor header")]
    StackTooSmall {
        /// Requested stack size, in bytes.
        requested: usize,
        /// Size of the header co-located with the stack, in bytes.
        overhead: usize,
    },
    /// The configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(&'static str),
}

/// Result, with a ultmem-core Error.
pub type Result<T> = core::result::Result<T, Error>;
