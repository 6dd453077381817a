//! Implementation of Linux specific calls.

use core::{alloc::Layout, mem, ptr::{self, NonNull}};

use ultmem_core::{LargePageKind, PowerOf2};

/// Implementation of the Platform trait, for Linux.
///
/// -   Descriptors are allocated with `posix_memalign`.
/// -   Pages are mapped anonymously, possibly hinted towards transparent huge pages, or backed by reserved huge pages.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinuxPlatform;

impl LinuxPlatform {
    //  4 KB
    const OS_PAGE_SIZE: PowerOf2 = unsafe { PowerOf2::new_unchecked(4 * 1024) };

    //  2 MB
    const HUGE_PAGE_SIZE: PowerOf2 = unsafe { PowerOf2::new_unchecked(2 * 1024 * 1024) };

    /// Creates an instance.
    pub const fn new() -> Self { Self }
}

impl ultmem_core::Platform for LinuxPlatform {
    unsafe fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        memalign_allocate(layout)
    }

    unsafe fn deallocate(&self, pointer: NonNull<u8>, _layout: Layout) {
        libc::free(pointer.as_ptr() as *mut libc::c_void);
    }

    unsafe fn allocate_page(&self, layout: Layout, kind: LargePageKind) -> Option<NonNull<u8>> {
        match kind {
            LargePageKind::Malloc => memalign_allocate(layout),
            LargePageKind::Mapped => mmap_aligned(layout, 0),
            LargePageKind::TransparentHuge => {
                let pointer = mmap_aligned(layout, 0)?;

                //  A failure to advise is not a failure to allocate: the mapping remains usable, if not huge.
                let result = libc::madvise(pointer.as_ptr() as *mut libc::c_void, layout.size(), libc::MADV_HUGEPAGE);

                if result != 0 {
                    log::trace!("madvise(MADV_HUGEPAGE) of {} bytes failed", layout.size());
                }

                Some(pointer)
            },
            LargePageKind::Huge => {
                if !Self::HUGE_PAGE_SIZE.divides(layout.size()) || layout.align() > Self::HUGE_PAGE_SIZE.value() {
                    return None;
                }

                mmap_allocate(layout.size(), libc::MAP_HUGETLB)
            },
        }
    }

    unsafe fn deallocate_page(&self, pointer: NonNull<u8>, layout: Layout, kind: LargePageKind) {
        match kind {
            LargePageKind::Malloc => libc::free(pointer.as_ptr() as *mut libc::c_void),
            LargePageKind::Mapped | LargePageKind::TransparentHuge | LargePageKind::Huge =>
                munmap_deallocate(pointer.as_ptr(), layout.size()),
        }
    }
}

//  Wrapper around `posix_memalign`.
//
//  The alignment is raised to the minimum `posix_memalign` accepts.
unsafe fn memalign_allocate(layout: Layout) -> Option<NonNull<u8>> {
    let align = layout.align().max(mem::size_of::<usize>());

    let mut pointer: *mut libc::c_void = ptr::null_mut();
    let result = libc::posix_memalign(&mut pointer as *mut _, align, layout.size());

    if result != 0 {
        return None;
    }

    NonNull::new(pointer as *mut u8)
}

//  Maps `layout.size()` bytes, aligned on `layout.align()`.
//
//  Mappings are naturally aligned on OS pages; larger alignments are obtained by over-allocating, then trimming front
//  and back.
unsafe fn mmap_aligned(layout: Layout, extra_flags: libc::c_int) -> Option<NonNull<u8>> {
    if layout.align() <= LinuxPlatform::OS_PAGE_SIZE.value() {
        return mmap_allocate(layout.size(), extra_flags);
    }

    let size = LinuxPlatform::OS_PAGE_SIZE.round_up(layout.size());
    let align = layout.align();

    let over_size = size + align;
    let front_pointer = mmap_allocate(over_size, extra_flags)?;

    let misalignment = front_pointer.as_ptr() as usize % align;
    let front_size = if misalignment == 0 { 0 } else { align - misalignment };
    let back_size = over_size - front_size - size;

    //  Safety:
    //  -   `front_size + size <= over_size`, hence both pointers are within the mapping, or at its end.
    let aligned_pointer = front_pointer.as_ptr().add(front_size);
    let back_pointer = aligned_pointer.add(size);

    debug_assert!(aligned_pointer as usize % align == 0, "{:x} not {:x}-aligned!", aligned_pointer as usize, align);

    if front_size > 0 {
        //  Safety:
        //  -   `[front_pointer, front_pointer + front_size)` is mapped, and no longer in use.
        munmap_deallocate(front_pointer.as_ptr(), front_size);
    }

    if back_size > 0 {
        //  Safety:
        //  -   `[back_pointer, back_pointer + back_size)` is mapped, and no longer in use.
        munmap_deallocate(back_pointer, back_size);
    }

    NonNull::new(aligned_pointer)
}

//  Wrapper around `mmap`.
//
//  Returns a pointer to `size` bytes of memory, aligned on OS pages.
fn mmap_allocate(size: usize, extra_flags: libc::c_int) -> Option<NonNull<u8>> {
    let length = size;
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra_flags;

    //  No specific address hint.
    let addr = ptr::null_mut();
    //  When used in conjunction with MAP_ANONYMOUS, fd is mandated to be -1 on some implementations.
    let fd = -1;
    //  When used in conjunction with MAP_ANONYMOUS, offset is mandated to be 0 on some implementations.
    let offset = 0;

    //  Safety:
    //  -   `addr`, `fd`, and `offset` are suitable for MAP_ANONYMOUS.
    let result = unsafe { libc::mmap(addr, length, prot, flags, fd, offset) };

    if result == libc::MAP_FAILED {
        return None;
    }

    NonNull::new(result as *mut u8)
}

//  Wrapper around `munmap`.
//
//  #   Panics
//
//  If `munmap` returns a non-0 result.
//
//  #   Safety
//
//  -   Assumes that `addr` points to a `mmap`ed area of at least `size` bytes.
//  -   Assumes that the range `[addr, addr + size)` is no longer in use.
unsafe fn munmap_deallocate(addr: *mut u8, size: usize) {
    let result = libc::munmap(addr as *mut libc::c_void, size);
    assert!(result == 0, "Could not munmap {:x}, {}: {}", addr as usize, size, result);
}

#[cfg(test)]
mod tests {

use ultmem_core::Platform;

use super::*;

fn round_trip(layout: Layout, kind: LargePageKind) -> bool {
    let platform = LinuxPlatform::new();

    unsafe {
        let Some(page) = platform.allocate_page(layout, kind) else { return false };

        assert_eq!(0, page.as_ptr() as usize % layout.align());

        page.as_ptr().write_bytes(0xAB, layout.size());

        platform.deallocate_page(page, layout, kind);
    }

    true
}

#[test]
fn linux_platform_allocate() {
    let platform = LinuxPlatform::new();
    let layout = Layout::from_size_align(256, 64).unwrap();

    unsafe {
        let pointer = platform.allocate(layout).unwrap();
        assert_eq!(0, pointer.as_ptr() as usize % 64);

        pointer.as_ptr().write_bytes(0xAB, layout.size());

        platform.deallocate(pointer, layout);
    }
}

#[test]
fn linux_platform_pages() {
    let layout = Layout::from_size_align(64 * 1024, 64).unwrap();

    assert!(round_trip(layout, LargePageKind::Malloc));
    assert!(round_trip(layout, LargePageKind::Mapped));
    assert!(round_trip(layout, LargePageKind::TransparentHuge));
}

#[test]
fn linux_platform_over_aligned() {
    let layout = Layout::from_size_align(64 * 1024, 64 * 1024).unwrap();

    assert!(round_trip(layout, LargePageKind::Mapped));
}

#[test]
fn linux_platform_huge_size() {
    //  Not a multiple of the huge page size: refused without any system call.
    let layout = Layout::from_size_align(64 * 1024, 64).unwrap();

    assert!(!round_trip(layout, LargePageKind::Huge));
}

} // mod tests
