//! Units
//!
//! A unit is the opaque handle a scheduler pool stores for each runnable item.
//!
//! A unit is either builtin, encoding the address of its thread descriptor with its lowest bit set, or foreign, in
//! which case the association between the unit and its thread descriptor is recorded in the unit table of the
//! `MemoryContext`.

use core::{
    num::NonZeroUsize,
    ptr::NonNull,
};

use crate::{Error, Result, ThreadDescriptor, ThreadHandle};

/// The number of buckets of the unit table.
pub const UNIT_TABLE_SIZE: usize = crate::internals::unit_table::UNIT_TABLE_SIZE;

/// An opaque unit handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitHandle(NonZeroUsize);

impl UnitHandle {
    const BUILTIN: usize = 1;

    /// Creates a handle from its raw value, or `None` if 0.
    pub const fn from_raw(raw: usize) -> Option<UnitHandle> {
        match NonZeroUsize::new(raw) {
            Some(raw) => Some(UnitHandle(raw)),
            None => None,
        }
    }

    /// Returns the raw value.
    pub const fn into_raw(self) -> usize { self.0.get() }

    /// Creates the builtin unit of a thread.
    pub fn from_thread(thread: ThreadHandle) -> UnitHandle {
        let raw = thread.as_ptr() as usize;
        debug_assert!(raw & Self::BUILTIN == 0);

        //  Safety:
        //  -   The lowest bit is set.
        UnitHandle(unsafe { NonZeroUsize::new_unchecked(raw | Self::BUILTIN) })
    }

    /// Returns whether the unit is builtin.
    pub const fn is_builtin(&self) -> bool { self.0.get() & Self::BUILTIN != 0 }

    /// Returns the thread of a builtin unit.
    pub fn as_builtin_thread(&self) -> Option<ThreadHandle> {
        if !self.is_builtin() {
            return None;
        }

        NonNull::new((self.0.get() & !Self::BUILTIN) as *mut ThreadDescriptor).map(ThreadHandle::new)
    }
}

/// An opaque handle identifying a scheduler pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolHandle(NonNull<()>);

impl PoolHandle {
    /// Creates the handle of `pool`.
    pub fn of<T: ?Sized>(pool: &T) -> PoolHandle { PoolHandle(NonNull::from(pool).cast()) }

    /// Returns the address of the pool.
    pub fn as_ptr(&self) -> *const () { self.0.as_ptr() }
}

//  Safety:
//  -   A handle is an address, only ever compared or handed back to its pool.
unsafe impl Send for PoolHandle {}
unsafe impl Sync for PoolHandle {}

/// The contract of a scheduler pool, as seen by this crate.
pub trait UnitPool {
    /// Returns the thread a unit of this pool stands for.
    fn thread_of(&self, unit: UnitHandle) -> ThreadHandle;
}

/// Associates the thread of `unit` with `pool`.
///
/// Returns `Error::InvalidPool` if no pool is supplied, and `Error::InvalidUnit` if no unit is supplied; the pool is
/// checked first.
///
/// `pool.thread_of` is invoked exactly once, and the pool is referred to by its `PoolHandle` afterwards.
///
/// #   Safety
///
/// -   Assumes that `unit` is not stored in any pool.
/// -   Assumes that the thread of `unit` is not concurrently accessed.
pub unsafe fn set_associated_pool(unit: Option<UnitHandle>, pool: Option<&dyn UnitPool>) -> Result<()> {
    let pool = pool.ok_or(Error::InvalidPool)?;
    let unit = unit.ok_or(Error::InvalidUnit)?;

    let thread = pool.thread_of(unit);

    thread.as_ref().set_pool(Some(PoolHandle::of(pool)));

    Ok(())
}

// mod tests
