//! Unit Table
//!
//! The table associating the units handed out by schedulers to the thread descriptors they stand for.
//!
//! The table is a fixed array of buckets, each a singly linked list of entries protected by its own spin lock for
//! writers. Readers never take the lock: entries are published at the head of their bucket with a release store, and
//! never unlinked while the table is alive. Instead, unmapping an entry resets its unit to `UnitSlot::Empty`, and the
//! entry is then recycled by the next `map` in the same bucket.
//!
//! Builtin units, encoding their thread descriptor directly, never enter the table.

use core::{
    alloc::Layout,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use crate::{Error, Platform, Result, ThreadDescriptor, ThreadHandle, UnitHandle};

use super::atomic::AtomicLink;

/// The exponent of the number of buckets.
pub(crate) const UNIT_TABLE_SIZE_EXP: u32 = 10;

/// The number of buckets.
pub(crate) const UNIT_TABLE_SIZE: usize = 1 << UNIT_TABLE_SIZE_EXP;

/// The unit recorded in an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UnitSlot {
    /// The entry is free, and may be recycled.
    Empty,
    /// The entry maps the unit.
    Live(UnitHandle),
}

impl UnitSlot {
    fn from_raw(raw: usize) -> Self { UnitHandle::from_raw(raw).map_or(UnitSlot::Empty, UnitSlot::Live) }

    fn into_raw(self) -> usize {
        match self {
            UnitSlot::Empty => 0,
            UnitSlot::Live(unit) => unit.into_raw(),
        }
    }
}

/// UnitTable.
pub(crate) struct UnitTable {
    buckets: [Bucket; UNIT_TABLE_SIZE],
}

impl UnitTable {
    /// Creates an empty table.
    pub(crate) fn new() -> Self { Self { buckets: core::array::from_fn(|_| Bucket::default()) } }

    /// Returns the bucket of a unit.
    pub(crate) fn bucket_index(unit: UnitHandle) -> usize {
        let value = unit.into_raw();

        let mut hash = (value >> 3) + (value >> (UNIT_TABLE_SIZE_EXP + 3));

        if UNIT_TABLE_SIZE_EXP <= 9 {
            hash += value >> (2 * UNIT_TABLE_SIZE_EXP + 3);
        }

        hash & (UNIT_TABLE_SIZE - 1)
    }

    /// Maps `unit` to `thread`.
    ///
    /// Returns `Error::OutOfMemory` if a new entry is required, and cannot be allocated.
    ///
    /// #   Panics
    ///
    /// If `unit` is builtin.
    pub(crate) fn map<P: Platform>(&self, platform: &P, unit: UnitHandle, thread: ThreadHandle) -> Result<()> {
        assert!(!unit.is_builtin(), "builtin {:?} cannot be mapped", unit);

        let bucket = &self.buckets[Self::bucket_index(unit)];
        let _guard = bucket.lock.lock();

        debug_assert!(bucket.find(unit).is_none(), "{:?} is already mapped", unit);

        //  Recycle an empty entry, if any.
        if let Some(entry) = bucket.find_slot(UnitSlot::Empty) {
            //  Safety:
            //  -   Entries live as long as the table.
            let entry = unsafe { entry.as_ref() };

            //  Readers only ever look at the thread after having matched the unit, which they obtained by other,
            //  synchronizing, means.
            entry.thread.store(thread.as_ptr(), Ordering::Relaxed);
            entry.unit.store(UnitSlot::Live(unit).into_raw(), Ordering::Relaxed);

            return Ok(());
        }

        //  Safety:
        //  -   `Entry` is not zero-sized.
        let entry: NonNull<Entry> = unsafe { platform.allocate(Layout::new::<Entry>()) }
            .ok_or(Error::OutOfMemory)?
            .cast();

        let next = bucket.head.load_relaxed();

        //  Safety:
        //  -   The memory is exclusively ours, suitably sized and aligned.
        unsafe { ptr::write(entry.as_ptr(), Entry::new(UnitSlot::Live(unit), thread, next)) };

        bucket.head.store_release(Some(entry));

        Ok(())
    }

    /// Unmaps `unit`.
    ///
    /// #   Panics
    ///
    /// If `unit` is builtin, or is not mapped.
    pub(crate) fn unmap(&self, unit: UnitHandle) {
        assert!(!unit.is_builtin(), "builtin {:?} cannot be unmapped", unit);

        let bucket = &self.buckets[Self::bucket_index(unit)];
        let _guard = bucket.lock.lock();

        let Some(entry) = bucket.find(unit) else {
            panic!("{:?} is not mapped", unit);
        };

        //  Safety:
        //  -   Entries live as long as the table.
        unsafe { entry.as_ref() }.unit.store(UnitSlot::Empty.into_raw(), Ordering::Relaxed);
    }

    /// Returns the thread `unit` is mapped to, if any.
    ///
    /// Lock-free.
    pub(crate) fn get(&self, unit: UnitHandle) -> Option<ThreadHandle> {
        let bucket = &self.buckets[Self::bucket_index(unit)];

        let entry = bucket.find(unit)?;

        //  Safety:
        //  -   Entries live as long as the table.
        let thread = unsafe { entry.as_ref() }.thread.load(Ordering::Relaxed);

        NonNull::new(thread).map(ThreadHandle::new)
    }

    /// Returns the number of units mapped.
    pub(crate) fn len(&self) -> usize {
        self.buckets.iter()
            .flat_map(|bucket| bucket.entries())
            .filter(|entry| unsafe { entry.as_ref() }.slot() != UnitSlot::Empty)
            .count()
    }

    /// Returns the number of entries allocated, mapped or not.
    pub(crate) fn capacity(&self) -> usize { self.buckets.iter().map(|bucket| bucket.entries().count()).sum() }

    /// Frees all entries.
    ///
    /// #   Panics
    ///
    /// If any entry is still mapped, or a bucket is locked.
    ///
    /// #   Safety
    ///
    /// -   Assumes that no other thread accesses the table.
    /// -   Assumes that `platform` is the platform entries were allocated with.
    pub(crate) unsafe fn close<P: Platform>(&self, platform: &P) {
        for bucket in &self.buckets {
            assert!(!bucket.lock.is_locked(), "bucket locked at teardown");

            for entry in bucket.entries() {
                let slot = entry.as_ref().slot();
                assert_eq!(UnitSlot::Empty, slot, "unit still mapped at teardown");
            }
        }

        for bucket in &self.buckets {
            let mut cursor = bucket.head.take_acquire();

            while let Some(entry) = cursor {
                cursor = entry.as_ref().next;

                ptr::drop_in_place(entry.as_ptr());
                platform.deallocate(entry.cast(), Layout::new::<Entry>());
            }
        }
    }
}

impl Default for UnitTable {
    fn default() -> Self { Self::new() }
}

//
//  Implementation
//

#[derive(Default)]
struct Bucket {
    lock: spin::Mutex<()>,
    head: AtomicLink<Entry>,
}

impl Bucket {
    //  Iterates over the entries, from the head, without lock.
    fn entries(&self) -> impl Iterator<Item = NonNull<Entry>> + '_ {
        //  Safety:
        //  -   Entries live as long as the table, and their `next` is immutable once published.
        core::iter::successors(self.head.load_acquire(), |entry| unsafe { entry.as_ref() }.next)
    }

    fn find(&self, unit: UnitHandle) -> Option<NonNull<Entry>> { self.find_slot(UnitSlot::Live(unit)) }

    fn find_slot(&self, slot: UnitSlot) -> Option<NonNull<Entry>> {
        let raw = slot.into_raw();

        self.entries().find(|entry| unsafe { entry.as_ref() }.unit.load(Ordering::Relaxed) == raw)
    }
}

struct Entry {
    unit: AtomicUsize,
    thread: AtomicPtr<ThreadDescriptor>,
    next: Option<NonNull<Entry>>,
}

impl Entry {
    fn new(slot: UnitSlot, thread: ThreadHandle, next: Option<NonNull<Entry>>) -> Self {
        Self { unit: AtomicUsize::new(slot.into_raw()), thread: AtomicPtr::new(thread.as_ptr()), next }
    }

    fn slot(&self) -> UnitSlot { UnitSlot::from_raw(self.unit.load(Ordering::Relaxed)) }
}

#[cfg(test)]
mod tests {

use std::{sync::Arc, vec::Vec};

use ultmem_test::LockstepBuilder;

use super::*;
use super::super::test::TestPlatform;

//  Fake thread descriptors: the table never dereferences them.
fn thread(n: usize) -> ThreadHandle {
    ThreadHandle::new(NonNull::new((n * 64) as *mut ThreadDescriptor).unwrap())
}

fn unit(raw: usize) -> UnitHandle { UnitHandle::from_raw(raw).unwrap() }

//  Units of the given bucket, all distinct.
fn colliding_units(bucket: usize, count: usize) -> Vec<UnitHandle> {
    (1..).map(|i| unit(i * 8))
        .filter(|unit| UnitTable::bucket_index(*unit) == bucket)
        .take(count)
        .collect()
}

#[test]
fn unit_table_bucket_index() {
    //  Low bits cleared by alignment do not matter.
    assert_eq!(UnitTable::bucket_index(unit(0x1000)), UnitTable::bucket_index(unit(0x1004)));

    //  Consecutive aligned addresses spread over consecutive buckets.
    assert_eq!(1, UnitTable::bucket_index(unit(8)));
    assert_eq!(2, UnitTable::bucket_index(unit(16)));

    //  High bits are folded in.
    let high = 1usize << (UNIT_TABLE_SIZE_EXP + 3);
    assert_eq!(1, UnitTable::bucket_index(unit(high)));
    assert_ne!(UnitTable::bucket_index(unit(high + 8)), UnitTable::bucket_index(unit(8)));

    for raw in (8..(1 << 20)).step_by(8 * 97) {
        assert!(UnitTable::bucket_index(unit(raw)) < UNIT_TABLE_SIZE);
    }
}

#[test]
fn unit_table_map_get_unmap() {
    let platform = TestPlatform::default();
    let table = UnitTable::new();

    let (a, b) = (unit(0x1000), unit(0x2000));

    assert_eq!(None, table.get(a));

    table.map(&platform, a, thread(1)).unwrap();
    table.map(&platform, b, thread(2)).unwrap();

    assert_eq!(Some(thread(1)), table.get(a));
    assert_eq!(Some(thread(2)), table.get(b));
    assert_eq!(2, table.len());

    table.unmap(a);

    assert_eq!(None, table.get(a));
    assert_eq!(Some(thread(2)), table.get(b));
    assert_eq!(1, table.len());
    assert_eq!(2, table.capacity());

    table.unmap(b);

    unsafe { table.close(&platform) };
    assert_eq!(platform.allocations(), platform.deallocations());
}

#[test]
fn unit_table_recycles_entries() {
    let platform = TestPlatform::default();
    let table = UnitTable::new();

    let units = colliding_units(5, 3);

    table.map(&platform, units[0], thread(1)).unwrap();
    table.map(&platform, units[1], thread(2)).unwrap();
    assert_eq!(2, table.capacity());

    table.unmap(units[0]);

    //  The recycled entry never yields its former thread for the new unit.
    table.map(&platform, units[2], thread(3)).unwrap();

    assert_eq!(2, table.capacity());
    assert_eq!(Some(thread(3)), table.get(units[2]));
    assert_eq!(Some(thread(2)), table.get(units[1]));
    assert_eq!(None, table.get(units[0]));

    table.unmap(units[1]);
    table.unmap(units[2]);

    unsafe { table.close(&platform) };
}

#[test]
fn unit_table_out_of_memory() {
    let platform = TestPlatform::default().with_budget(1);
    let table = UnitTable::new();

    let units = colliding_units(9, 3);

    table.map(&platform, units[0], thread(1)).unwrap();
    assert_eq!(Err(Error::OutOfMemory), table.map(&platform, units[1], thread(2)));

    //  Recycling requires no allocation.
    table.unmap(units[0]);
    table.map(&platform, units[2], thread(3)).unwrap();

    table.unmap(units[2]);

    unsafe { table.close(&platform) };
}

#[test]
#[should_panic]
fn unit_table_unmap_absent() {
    let table = UnitTable::new();

    table.unmap(unit(0x1000));
}

#[test]
#[should_panic]
fn unit_table_map_builtin() {
    let platform = TestPlatform::default();
    let table = UnitTable::new();

    let _ = table.map(&platform, UnitHandle::from_thread(thread(1)), thread(1));
}

#[test]
#[should_panic]
fn unit_table_close_live() {
    let platform = TestPlatform::default();
    let table = UnitTable::new();

    table.map(&platform, unit(0x1000), thread(1)).unwrap();

    unsafe { table.close(&platform) };
}

#[test]
fn unit_table_concurrent_colliding() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 16;

    struct Global {
        platform: TestPlatform,
        table: UnitTable,
    }

    let units = colliding_units(17, THREADS * PER_THREAD);
    let locals: Vec<Vec<UnitHandle>> = units.chunks(PER_THREAD).map(|chunk| chunk.to_vec()).collect();

    let global = Global { platform: TestPlatform::default(), table: UnitTable::new() };

    let mut builder = LockstepBuilder::new(global, locals);

    //  Map all.
    builder.add_step(|| |global: &Global, local: &mut Vec<UnitHandle>| {
        for (i, unit) in local.iter().enumerate() {
            global.table.map(&global.platform, *unit, thread(i + 1)).unwrap();
        }
    });

    //  Unmap half, while others look up.
    builder.add_step(|| |global: &Global, local: &mut Vec<UnitHandle>| {
        for (i, unit) in local.iter().enumerate() {
            if i % 2 == 0 {
                global.table.unmap(*unit);
            } else {
                assert_eq!(Some(thread(i + 1)), global.table.get(*unit));
            }
        }
    });

    //  Remap the unmapped half, recycling entries.
    builder.add_step(|| |global: &Global, local: &mut Vec<UnitHandle>| {
        for (i, unit) in local.iter().enumerate().filter(|(i, _)| i % 2 == 0) {
            global.table.map(&global.platform, *unit, thread(i + 100)).unwrap();
        }
    });

    let lockstep = builder.launch(1);
    lockstep.join();

    let global: Arc<Global> = lockstep.into_global();

    //  The bucket holds exactly the live units.
    assert_eq!(THREADS * PER_THREAD, global.table.len());
    assert!(global.table.capacity() <= THREADS * PER_THREAD * 3 / 2);

    for (i, unit) in units.iter().enumerate() {
        let i = i % PER_THREAD;
        let expected = if i % 2 == 0 { thread(i + 100) } else { thread(i + 1) };

        assert_eq!(Some(expected), global.table.get(*unit));

        global.table.unmap(*unit);
    }

    assert_eq!(0, global.table.len());

    unsafe { global.table.close(&global.platform) };
}

} // mod tests
