//! The shim between the allocator and the operating system's virtual memory
//! interface. Everything above this module deals in arenas and blocks; this
//! is the only place that talks to the kernel.
//!
//! Three operations are provided: [`obtain`] a zero-initialised, page-aligned
//! region, [`release`] it, and [`reset`] a sub-range so its physical backing
//! can be reclaimed while the virtual mapping stays in place.
//!
//! Out-of-memory is the only failure the caller is expected to handle:
//! [`obtain`] reports it as `None`. Every other failure of the VM interface
//! is a programming error in this shim and terminates the process with a
//! short message on stderr.

use std::ptr::NonNull;

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. The allocator itself has nothing to do with the concrete
/// APIs offered by each kernel.
trait PlatformMemory {
    /// Requests a read-write, zeroed, page-aligned region of `len` bytes.
    /// Returns `None` iff the kernel is out of memory.
    unsafe fn obtain(len: usize) -> Option<NonNull<u8>>;

    /// Returns a region previously handed out by [`PlatformMemory::obtain`].
    unsafe fn release(addr: *mut u8, len: usize);

    /// Tells the kernel the physical backing of the range is unneeded. The
    /// virtual range stays mapped; its contents become undefined.
    unsafe fn reset(addr: *mut u8, len: usize);
}

pub(crate) struct Kernel;

/// Terminal path for VM interface failures other than out-of-memory.
fn fatal(msg: &str) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

/// Wrapper to use [`PlatformMemory::obtain`].
#[inline]
pub(crate) unsafe fn obtain(len: usize) -> Option<NonNull<u8>> {
    let addr = unsafe { Kernel::obtain(len) };
    #[cfg(test)]
    if addr.is_some() {
        counters::OBTAINED.with(|c| c.set(c.get() + 1));
    }
    addr
}

/// Wrapper to use [`PlatformMemory::release`].
#[inline]
pub(crate) unsafe fn release(addr: *mut u8, len: usize) {
    #[cfg(test)]
    counters::RELEASED.with(|c| c.set(c.get() + 1));
    unsafe { Kernel::release(addr, len) }
}

/// Wrapper to use [`PlatformMemory::reset`].
///
/// On debug builds the range is first overwritten with `0x7e` so any
/// use-after-trim shows up as recognisable garbage instead of silently
/// reading stale data.
#[inline]
pub(crate) unsafe fn reset(addr: *mut u8, len: usize) {
    unsafe {
        if cfg!(debug_assertions) {
            std::ptr::write_bytes(addr, 0x7e, len);
        }
        Kernel::reset(addr, len)
    }
}

#[cfg(unix)]
mod unix {
    use super::{fatal, Kernel, PlatformMemory};

    use libc::{madvise, mmap, munmap, off_t, size_t};

    use std::io;
    use std::os::raw::{c_int, c_void};
    use std::ptr::NonNull;

    impl PlatformMemory for Kernel {
        unsafe fn obtain(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                if addr == libc::MAP_FAILED {
                    if io::Error::last_os_error().raw_os_error() == Some(libc::ENOMEM) {
                        return None;
                    }
                    fatal("kernel obtain failed: could not map memory");
                }
                Some(NonNull::new_unchecked(addr).cast::<u8>())
            }
        }

        unsafe fn release(addr: *mut u8, len: usize) {
            unsafe {
                if munmap(addr as *mut c_void, len as size_t) < 0 {
                    fatal("kernel release failed: could not unmap memory");
                }
            }
        }

        unsafe fn reset(addr: *mut u8, len: usize) {
            unsafe {
                if madvise(addr as *mut c_void, len as size_t, libc::MADV_DONTNEED) < 0 {
                    fatal("kernel reset failed: could not advise memory");
                }
            }
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::{fatal, Kernel, PlatformMemory};

    use std::os::raw::c_void;
    use std::ptr::NonNull;

    use windows::Win32::System::Memory;

    impl PlatformMemory for Kernel {
        unsafe fn obtain(len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn release(addr: *mut u8, _len: usize) {
            unsafe {
                if Memory::VirtualFree(addr as *mut c_void, 0, Memory::MEM_RELEASE).is_err() {
                    fatal("kernel release failed: could not free memory");
                }
            }
        }

        unsafe fn reset(addr: *mut u8, len: usize) {
            unsafe {
                let reset = Memory::VirtualAlloc(
                    Some(addr as *const c_void),
                    len,
                    Memory::MEM_RESET,
                    Memory::PAGE_READWRITE,
                );
                if reset.is_null() {
                    fatal("kernel reset failed: could not reset memory");
                }
            }
        }
    }
}
