use std::{io, ptr::NonNull};

/// Size in bytes of the pages we request from the kernel. Small chunks are
/// always carved out of a single page, so this is also the largest chunk the
/// free list hands out without splitting into the large path.
pub const PAGE_SIZE: usize = 4096;

/// Abstraction for platform specific memory handling. The allocator only needs
/// to map pages and unmap them when they are no longer in use, it doesn't care
/// about the APIs offered by the underlying kernel or libraries.
trait PlatformSpecificMemory {
    /// Requests a memory region from the kernel where `length` bytes can be
    /// read and written safely. `length` is always a multiple of
    /// [`PAGE_SIZE`].
    unsafe fn request_memory(length: usize) -> io::Result<NonNull<u8>>;

    /// Returns `length` bytes starting at `address` back to the kernel. The
    /// region must have been obtained from [`Self::request_memory`] with the
    /// same `length`.
    unsafe fn return_memory(address: NonNull<u8>, length: usize) -> io::Result<()>;
}

/// Zero sized type that implements [`PlatformSpecificMemory`] for each OS.
struct Platform;

/// Maps `count` contiguous, page aligned, read-write pages.
#[inline]
pub(crate) fn map_pages(count: usize) -> io::Result<NonNull<u8>> {
    let length = count
        .checked_mul(PAGE_SIZE)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "page count overflow"))?;

    unsafe { Platform::request_memory(length) }
}

/// Unmaps `count` pages starting at `base`.
///
/// # Safety
///
/// `base` must come from [`map_pages`] called with the same `count`, and
/// nothing may access the region afterwards.
#[inline]
pub(crate) unsafe fn unmap_pages(base: NonNull<u8>, count: usize) -> io::Result<()> {
    Platform::return_memory(base, count * PAGE_SIZE)
}

/// Number of pages needed to hold `size` bytes, rounded up.
#[inline]
pub(crate) fn pages_for(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::{
        io,
        ptr::{self, NonNull},
    };

    use super::{Platform, PlatformSpecificMemory};

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> io::Result<NonNull<u8>> {
            // Data pages only, never executable.
            let protection = libc::PROT_READ | libc::PROT_WRITE;

            // Private to our process and not backed by any file.
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            let address = libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0);

            if address == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }

            Ok(NonNull::new_unchecked(address).cast())
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) -> io::Result<()> {
            if libc::munmap(address.cast().as_ptr(), length) != 0 {
                return Err(io::Error::last_os_error());
            }

            Ok(())
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::{io, ptr::NonNull};

    use windows::Win32::System::Memory;

    use super::{Platform, PlatformSpecificMemory};

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> io::Result<NonNull<u8>> {
            let protection = Memory::PAGE_READWRITE;

            // Reserve and commit in one call so the pages are usable right
            // away.
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            let address = Memory::VirtualAlloc(None, length, flags, protection);

            NonNull::new(address.cast()).ok_or_else(io::Error::last_os_error)
        }

        unsafe fn return_memory(address: NonNull<u8>, _length: usize) -> io::Result<()> {
            // MEM_RELEASE requires a length of 0 and releases the whole
            // reservation made by VirtualAlloc.
            let address = address.cast().as_ptr();

            if !Memory::VirtualFree(address, 0, Memory::MEM_RELEASE).as_bool() {
                return Err(io::Error::last_os_error());
            }

            Ok(())
        }
    }
}

#[cfg(miri)]
mod miri {
    //! Miri has no FFI support, so pages are mocked with the global allocator.
    //! Miri's leak checker then reports any page we forget to unmap.

    use std::{alloc, io, ptr::NonNull};

    use super::{Platform, PlatformSpecificMemory, PAGE_SIZE};

    fn to_layout(length: usize) -> io::Result<alloc::Layout> {
        alloc::Layout::from_size_align(length, PAGE_SIZE)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> io::Result<NonNull<u8>> {
            NonNull::new(alloc::alloc(to_layout(length)?))
                .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) -> io::Result<()> {
            alloc::dealloc(address.as_ptr(), to_layout(length)?);
            Ok(())
        }
    }
}
