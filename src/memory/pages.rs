use std::ptr::NonNull;

use super::constants::{PAGE_ALLOCATION_GRANULARITY, SYSTEM_PAGE_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum PageError {
    #[error("address space reservation of {size} bytes failed: {source}")]
    ReservationFailed {
        size: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("page commit failed: {0}")]
    CommitFailed(#[source] std::io::Error),
    #[error("page decommit failed: {0}")]
    DecommitFailed(#[source] std::io::Error),
    #[error("address space release failed: {0}")]
    ReleaseFailed(#[source] std::io::Error),
    #[error("page protection change failed: {0}")]
    ProtectFailed(#[source] std::io::Error),
    #[error("page discard failed: {0}")]
    DiscardFailed(#[source] std::io::Error),
}

/// Access mode for [`PageOps::protect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageAccess {
    Inaccessible,
    ReadWrite,
}

/// Virtual memory primitives the heap is built on.
///
/// Every function is static: a heap is parameterised by the type, not an
/// instance, so the platform layer carries no state of its own. All ranges
/// passed in are aligned to [`SYSTEM_PAGE_SIZE`].
pub trait PageOps {
    /// Reserve `size` bytes of inaccessible address space aligned to `align`.
    ///
    /// `hint` is a preferred base address (0 for none). The hint is advisory;
    /// callers compare the returned base against it.
    ///
    /// # Safety
    /// `align` must be a power of two no smaller than the allocation
    /// granularity and `size` a multiple of it.
    unsafe fn reserve(hint: usize, size: usize, align: usize) -> Result<NonNull<u8>, PageError>;

    /// Return a reservation (or a whole-granule tail/head of one) to the OS.
    ///
    /// # Safety
    /// The range must have been obtained from [`PageOps::reserve`] and must
    /// not be accessed afterwards.
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), PageError>;

    /// Make a reserved range readable and writable, backed on first touch.
    ///
    /// # Safety
    /// The range must lie inside a live reservation.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), PageError>;

    /// Drop the physical backing of a range and make it inaccessible. The
    /// address range stays reserved.
    ///
    /// # Safety
    /// The range must lie inside a live reservation and hold no live data.
    unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), PageError>;

    /// Change access without touching the backing.
    ///
    /// # Safety
    /// The range must lie inside a live reservation.
    unsafe fn protect(ptr: NonNull<u8>, size: usize, access: PageAccess) -> Result<(), PageError>;

    /// Tell the OS the contents of a committed range are no longer needed.
    /// The range stays accessible; its contents become unspecified (old data
    /// or zero, depending on the platform).
    ///
    /// # Safety
    /// The range must be committed and hold no live data.
    unsafe fn discard(ptr: NonNull<u8>, size: usize) -> Result<(), PageError>;

    /// OS page size (default/minimum).
    fn page_size() -> usize;

    /// A randomized, page-aligned address to seed reservations with, or 0 if
    /// the platform should choose.
    fn next_random_base() -> usize;
}

pub struct PlatformPageOps;

/// Splitmix64 over a per-process random seed, masked to the part of the
/// address space user mappings may occupy.
#[cfg(not(any(loom, miri)))]
fn random_page_base() -> usize {
    use crate::sync::OnceLock;
    use crate::sync::atomic::{AtomicU64, Ordering};
    use std::hash::{BuildHasher, Hasher};

    #[cfg(target_os = "macos")]
    const ASLR_MASK: usize = (1 << 38) - 1;
    #[cfg(target_os = "macos")]
    const ASLR_OFFSET: usize = 0x10_0000_0000;
    #[cfg(not(target_os = "macos"))]
    const ASLR_MASK: usize = (1 << 46) - 1;
    #[cfg(not(target_os = "macos"))]
    const ASLR_OFFSET: usize = 0;

    const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

    static SEED: OnceLock<u64> = OnceLock::new();
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seed = *SEED.get_or_init(|| {
        std::collections::hash_map::RandomState::new()
            .build_hasher()
            .finish()
    });
    let mut z = seed.wrapping_add(COUNTER.fetch_add(GOLDEN_GAMMA, Ordering::Relaxed));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;

    // PORTABILITY: 64-bit targets only (see lib.rs).
    #[allow(clippy::cast_possible_truncation)]
    let random = z as usize;
    ((random & ASLR_MASK) + ASLR_OFFSET) & !(PAGE_ALLOCATION_GRANULARITY - 1)
}

#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PageAccess, PageError, PageOps, PlatformPageOps};
    use crate::memory::constants::PAGE_ALLOCATION_GRANULARITY;
    use std::io;

    const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

    /// Map `size` bytes of PROT_NONE address space near `hint`.
    fn map_none(hint: usize, size: usize) -> Result<usize, PageError> {
        // Safety: FFI call to mmap. Without MAP_FIXED the hint never clobbers
        // existing mappings.
        let ptr = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(PageError::ReservationFailed {
                size,
                source: io::Error::last_os_error(),
            });
        }
        if ptr.is_null() {
            return Err(PageError::ReservationFailed {
                size,
                source: io::Error::other("mmap returned null"),
            });
        }
        Ok(ptr as usize)
    }

    fn unmap(addr: usize, size: usize) -> Result<(), PageError> {
        // Safety: FFI call to munmap; callers only pass ranges they mapped.
        if unsafe { libc::munmap(addr as *mut libc::c_void, size) } != 0 {
            return Err(PageError::ReleaseFailed(io::Error::last_os_error()));
        }
        Ok(())
    }

    impl PageOps for PlatformPageOps {
        unsafe fn reserve(hint: usize, size: usize, align: usize) -> Result<NonNull<u8>, PageError> {
            debug_assert!(align.is_power_of_two() && align >= PAGE_ALLOCATION_GRANULARITY);
            debug_assert!(size.is_multiple_of(PAGE_ALLOCATION_GRANULARITY));

            // First try an exact-size mapping at the hint; it is usually
            // honored and already aligned.
            let addr = map_none(hint, size)?;
            if addr.is_multiple_of(align) {
                // Safety: map_none never returns 0.
                return Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) });
            }
            unmap(addr, size)?;

            // Over-reserve and trim both ends down to an aligned window.
            let try_size = size + align - PAGE_ALLOCATION_GRANULARITY;
            let raw = map_none(0, try_size)?;
            let aligned = raw.next_multiple_of(align);
            let head = aligned - raw;
            let tail = try_size - head - size;
            if head > 0 {
                unmap(raw, head)?;
            }
            if tail > 0 {
                unmap(aligned + size, tail)?;
            }
            // Safety: aligned lies inside a successful mapping.
            Ok(unsafe { NonNull::new_unchecked(aligned as *mut u8) })
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), PageError> {
            unmap(ptr.as_ptr() as usize, size)
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), PageError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(PageError::CommitFailed(io::Error::last_os_error()));
            }

            #[cfg(target_os = "linux")]
            if size >= HUGE_PAGE_SIZE {
                // Direct maps are large and touched front to back; let THP
                // back them with 2MB pages. Advisory, errors ignored.
                // Safety: FFI call to madvise.
                unsafe {
                    libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_HUGEPAGE)
                };
            }
            #[cfg(not(target_os = "linux"))]
            let _ = HUGE_PAGE_SIZE;

            // Pages are faulted in lazily: span provisioning only writes up to
            // the next system page boundary.
            Ok(())
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), PageError> {
            // MADV_FREE marks pages for lazy reclamation; PROT_NONE makes any
            // stale access fault. On recommit the contents are either old data
            // or zero; the heap resets span state and never relies on either.
            // Safety: FFI call to madvise.
            if unsafe { libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_FREE) }
                != 0
            {
                return Err(PageError::DecommitFailed(io::Error::last_os_error()));
            }
            // Safety: FFI call to mprotect.
            if unsafe { libc::mprotect(ptr.as_ptr().cast::<libc::c_void>(), size, libc::PROT_NONE) }
                != 0
            {
                return Err(PageError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn protect(ptr: NonNull<u8>, size: usize, access: PageAccess) -> Result<(), PageError> {
            let prot = match access {
                PageAccess::Inaccessible => libc::PROT_NONE,
                PageAccess::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            };
            // Safety: FFI call to mprotect.
            if unsafe { libc::mprotect(ptr.as_ptr().cast::<libc::c_void>(), size, prot) } != 0 {
                return Err(PageError::ProtectFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn discard(ptr: NonNull<u8>, size: usize) -> Result<(), PageError> {
            // Linux: MADV_DONTNEED on private anonymous memory reads back as
            // zero. macOS: MADV_FREE reads back as old data or zero.
            #[cfg(target_os = "linux")]
            let advice = libc::MADV_DONTNEED;
            #[cfg(not(target_os = "linux"))]
            let advice = libc::MADV_FREE;
            // Safety: FFI call to madvise.
            if unsafe { libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, advice) } != 0 {
                return Err(PageError::DiscardFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // PORTABILITY: this crate supports only 64-bit targets; page
                // size fits in usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }

        fn next_random_base() -> usize {
            super::random_page_base()
        }
    }
}

#[cfg(all(target_os = "windows", not(any(loom, miri))))]
mod windows {
    use super::{NonNull, PageAccess, PageError, PageOps, PlatformPageOps};
    use std::ffi::c_void;
    use std::io;

    const MEM_COMMIT: u32 = 0x0000_1000;
    const MEM_RESERVE: u32 = 0x0000_2000;
    const MEM_DECOMMIT: u32 = 0x0000_4000;
    const MEM_RELEASE: u32 = 0x0000_8000;
    const MEM_RESET: u32 = 0x0008_0000;
    const PAGE_NOACCESS: u32 = 0x01;
    const PAGE_READWRITE: u32 = 0x04;

    /// Attempts at landing an aligned reservation before giving up.
    const ALIGN_RETRIES: usize = 8;

    #[repr(C)]
    struct SystemInfo {
        processor_architecture: u16,
        reserved: u16,
        page_size: u32,
        minimum_application_address: *mut c_void,
        maximum_application_address: *mut c_void,
        active_processor_mask: usize,
        number_of_processors: u32,
        processor_type: u32,
        allocation_granularity: u32,
        processor_level: u16,
        processor_revision: u16,
    }

    #[link(name = "kernel32")]
    unsafe extern "system" {
        fn VirtualAlloc(address: *mut c_void, size: usize, alloc_type: u32, protect: u32) -> *mut c_void;
        fn VirtualFree(address: *mut c_void, size: usize, free_type: u32) -> i32;
        fn VirtualProtect(address: *mut c_void, size: usize, protect: u32, old: *mut u32) -> i32;
        fn GetSystemInfo(info: *mut SystemInfo);
    }

    fn reserve_at(addr: usize, size: usize) -> usize {
        // Safety: FFI call to VirtualAlloc; MEM_RESERVE never clobbers.
        unsafe { VirtualAlloc(addr as *mut c_void, size, MEM_RESERVE, PAGE_NOACCESS) as usize }
    }

    fn free_reservation(addr: usize) {
        // Safety: FFI call to VirtualFree on a base returned by VirtualAlloc.
        unsafe {
            VirtualFree(addr as *mut c_void, 0, MEM_RELEASE);
        }
    }

    impl PageOps for PlatformPageOps {
        unsafe fn reserve(hint: usize, size: usize, align: usize) -> Result<NonNull<u8>, PageError> {
            if hint != 0 {
                let addr = reserve_at(hint, size);
                if addr != 0 && addr % align == 0 {
                    // Safety: checked non-zero above.
                    return Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) });
                }
                if addr != 0 {
                    free_reservation(addr);
                }
            }

            // Windows cannot trim a reservation: find an aligned hole by
            // reserving an oversized range, releasing it, and claiming the
            // aligned address inside it. Another thread may race us for it.
            for _ in 0..ALIGN_RETRIES {
                let probe = reserve_at(0, size + align);
                if probe == 0 {
                    break;
                }
                free_reservation(probe);
                let aligned = probe.next_multiple_of(align);
                let addr = reserve_at(aligned, size);
                if addr != 0 {
                    // Safety: checked non-zero above.
                    return Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) });
                }
            }
            Err(PageError::ReservationFailed {
                size,
                source: io::Error::last_os_error(),
            })
        }

        unsafe fn release(ptr: NonNull<u8>, _size: usize) -> Result<(), PageError> {
            // MEM_RELEASE must have size 0 and the base address of the region.
            // Safety: FFI call to VirtualFree.
            if unsafe { VirtualFree(ptr.as_ptr().cast::<c_void>(), 0, MEM_RELEASE) } == 0 {
                return Err(PageError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), PageError> {
            // Safety: FFI call to VirtualAlloc.
            let result = unsafe { VirtualAlloc(ptr.as_ptr().cast::<c_void>(), size, MEM_COMMIT, PAGE_READWRITE) };
            if result.is_null() {
                return Err(PageError::CommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), PageError> {
            // Safety: FFI call to VirtualFree.
            if unsafe { VirtualFree(ptr.as_ptr().cast::<c_void>(), size, MEM_DECOMMIT) } == 0 {
                return Err(PageError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn protect(ptr: NonNull<u8>, size: usize, access: PageAccess) -> Result<(), PageError> {
            let protect = match access {
                PageAccess::Inaccessible => PAGE_NOACCESS,
                PageAccess::ReadWrite => PAGE_READWRITE,
            };
            let mut old = 0u32;
            // Safety: FFI call to VirtualProtect.
            if unsafe { VirtualProtect(ptr.as_ptr().cast::<c_void>(), size, protect, &mut old) } == 0 {
                return Err(PageError::ProtectFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn discard(ptr: NonNull<u8>, size: usize) -> Result<(), PageError> {
            // Safety: FFI call to VirtualAlloc.
            let result = unsafe { VirtualAlloc(ptr.as_ptr().cast::<c_void>(), size, MEM_RESET, PAGE_READWRITE) };
            if result.is_null() {
                return Err(PageError::DiscardFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
            *PAGE_SIZE.get_or_init(|| {
                // Safety: FFI call to GetSystemInfo on a zeroed out-param.
                unsafe {
                    let mut info: SystemInfo = std::mem::zeroed();
                    GetSystemInfo(&mut info);
                    info.page_size as usize
                }
            })
        }

        fn next_random_base() -> usize {
            super::random_page_base()
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed PageOps (no real mmap/VirtualAlloc)
//
// Every reservation is a plain heap allocation aligned to the super page, so
// `release` can rebuild the layout from the size alone. Commit, decommit,
// protect and discard are no-ops: the memory is always accessible once
// reserved. This is enough to exercise the heap's locking (loom) and its
// pointer arithmetic (Miri); page-fault behaviour is covered by the real
// platform implementation in normal builds.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl PageOps for PlatformPageOps {
    unsafe fn reserve(_hint: usize, size: usize, align: usize) -> Result<NonNull<u8>, PageError> {
        use super::constants::SUPER_PAGE_SIZE;
        debug_assert!(align <= SUPER_PAGE_SIZE);
        if size == 0 {
            return Err(PageError::ReservationFailed {
                size,
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "zero-size reservation"),
            });
        }
        let layout = std::alloc::Layout::from_size_align(size, SUPER_PAGE_SIZE).map_err(|e| {
            PageError::ReservationFailed {
                size,
                source: std::io::Error::other(e),
            }
        })?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| PageError::ReservationFailed {
            size,
            source: std::io::Error::new(std::io::ErrorKind::OutOfMemory, "alloc returned null"),
        })
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), PageError> {
        use super::constants::SUPER_PAGE_SIZE;
        let layout = std::alloc::Layout::from_size_align(size, SUPER_PAGE_SIZE)
            .map_err(|e| PageError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), PageError> {
        Ok(())
    }

    unsafe fn decommit(_ptr: NonNull<u8>, _size: usize) -> Result<(), PageError> {
        Ok(())
    }

    unsafe fn protect(_ptr: NonNull<u8>, _size: usize, _access: PageAccess) -> Result<(), PageError> {
        Ok(())
    }

    unsafe fn discard(_ptr: NonNull<u8>, _size: usize) -> Result<(), PageError> {
        Ok(())
    }

    fn page_size() -> usize {
        SYSTEM_PAGE_SIZE
    }

    fn next_random_base() -> usize {
        0
    }
}

/// True if the OS page is no larger than the page the heap manages in.
pub(crate) fn os_page_fits<P: PageOps>() -> bool {
    let os = P::page_size();
    os.is_power_of_two() && os <= SYSTEM_PAGE_SIZE
}
