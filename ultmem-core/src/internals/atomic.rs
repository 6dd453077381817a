//! Building brick for the lists shared across threads.
//!
//! Unlike a raw `AtomicPtr`, each operation names its ordering, so that the synchronization points of the algorithms
//! using it stand out.

use core::{
    ptr::{self, NonNull},
    sync::atomic::{self, Ordering},
};

//  A nullable atomic pointer.
pub(crate) struct AtomicLink<T>(atomic::AtomicPtr<T>);

impl<T> AtomicLink<T> {
    pub(crate) const fn new() -> Self { Self(atomic::AtomicPtr::new(ptr::null_mut())) }

    //  For readers which did not take the lock protecting the writers.
    pub(crate) fn load_acquire(&self) -> Option<NonNull<T>> { NonNull::new(self.0.load(Ordering::Acquire)) }

    //  For writers, already synchronized by other means.
    pub(crate) fn load_relaxed(&self) -> Option<NonNull<T>> { NonNull::new(self.0.load(Ordering::Relaxed)) }

    //  Publishes a fully initialized pointee.
    pub(crate) fn store_release(&self, ptr: Option<NonNull<T>>) { self.0.store(into_raw(ptr), Ordering::Release) }

    //  Steals the whole content, and all the writes made to the pointees prior to their publication.
    pub(crate) fn take_acquire(&self) -> Option<NonNull<T>> {
        NonNull::new(self.0.swap(ptr::null_mut(), Ordering::Acquire))
    }

    //  Publishes `new` if the link still is `current`, or returns the new current value.
    pub(crate) fn compare_exchange_release(&self, current: Option<NonNull<T>>, new: Option<NonNull<T>>)
        -> Result<Option<NonNull<T>>, Option<NonNull<T>>>
    {
        self.0.compare_exchange_weak(into_raw(current), into_raw(new), Ordering::Release, Ordering::Relaxed)
            .map(NonNull::new)
            .map_err(NonNull::new)
    }
}

impl<T> Default for AtomicLink<T> {
    fn default() -> Self { Self::new() }
}

//
//  Implementation
//

#[inline(always)]
fn into_raw<T>(ptr: Option<NonNull<T>>) -> *mut T {
    ptr.map(|t| t.as_ptr())
        .unwrap_or(ptr::null_mut())
}

// mod tests
