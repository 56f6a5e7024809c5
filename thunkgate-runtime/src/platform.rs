//! # Platform Memory
//!
//! Page-granular memory primitives used by the trampoline page allocator.
//!
//! ## Design
//!
//! Trampoline pages are mapped read-write, stamped with code, and then the
//! code half is sealed read+execute. The data half stays writable for the
//! lifetime of the process so that config records can be rewritten without
//! ever toggling permissions on code that other threads may be executing.
//!
//! - Unix: `mmap` / `mprotect` / `sysconf` via `nix::libc`
//! - Windows: `VirtualAlloc` / `VirtualProtect` / `FlushInstructionCache`
//!
//! Mappings are never released. See [`MappedRegion`].

use std::fmt;
use std::ptr::NonNull;
use std::sync::OnceLock;

// ============================================================================
// Platform-specific primitives
// ============================================================================

#[cfg(unix)]
mod sys {
    use nix::libc;
    use std::ptr::{self, NonNull};

    pub fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 {
            4096
        } else {
            size as usize
        }
    }

    /// Map anonymous read-write memory.
    pub unsafe fn map_rw(len: usize) -> Option<NonNull<u8>> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            None
        } else {
            NonNull::new(ptr as *mut u8)
        }
    }

    /// Make memory read+execute (and no longer writable).
    pub unsafe fn protect_rx(ptr: NonNull<u8>, len: usize) -> bool {
        unsafe {
            libc::mprotect(
                ptr.as_ptr() as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_EXEC,
            ) == 0
        }
    }

    #[cfg(all(target_arch = "aarch64", target_vendor = "apple"))]
    pub unsafe fn flush_icache(ptr: NonNull<u8>, len: usize) {
        extern "C" {
            fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
        }
        unsafe { sys_icache_invalidate(ptr.as_ptr() as *mut libc::c_void, len) }
    }

    #[cfg(all(target_arch = "aarch64", not(target_vendor = "apple")))]
    pub unsafe fn flush_icache(ptr: NonNull<u8>, len: usize) {
        extern "C" {
            fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
        }
        let start = ptr.as_ptr() as *mut libc::c_char;
        unsafe { __clear_cache(start, start.add(len)) }
    }

    // x86 keeps instruction fetch coherent with stores.
    #[cfg(not(target_arch = "aarch64"))]
    pub unsafe fn flush_icache(_ptr: NonNull<u8>, _len: usize) {}
}

#[cfg(windows)]
mod sys {
    use std::ffi::c_void;
    use std::ptr::NonNull;

    use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows::Win32::System::Memory::{
        VirtualAlloc, VirtualProtect, MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READ,
        PAGE_PROTECTION_FLAGS, PAGE_READWRITE,
    };
    use windows::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
    use windows::Win32::System::Threading::GetCurrentProcess;

    pub fn page_size() -> usize {
        let mut info = SYSTEM_INFO::default();
        unsafe { GetSystemInfo(&mut info) };
        if info.dwPageSize == 0 {
            4096
        } else {
            info.dwPageSize as usize
        }
    }

    /// Reserve and commit read-write memory.
    pub unsafe fn map_rw(len: usize) -> Option<NonNull<u8>> {
        let ptr = unsafe { VirtualAlloc(None, len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        NonNull::new(ptr as *mut u8)
    }

    /// Make memory read+execute (and no longer writable).
    pub unsafe fn protect_rx(ptr: NonNull<u8>, len: usize) -> bool {
        let mut old = PAGE_PROTECTION_FLAGS(0);
        unsafe {
            VirtualProtect(ptr.as_ptr() as *const c_void, len, PAGE_EXECUTE_READ, &mut old).is_ok()
        }
    }

    pub unsafe fn flush_icache(ptr: NonNull<u8>, len: usize) {
        unsafe {
            let _ = FlushInstructionCache(
                GetCurrentProcess(),
                Some(ptr.as_ptr() as *const c_void),
                len,
            );
        }
    }
}

// ============================================================================
// Page size
// ============================================================================

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// The platform's virtual memory page size in bytes.
///
/// Queried once and cached for the process lifetime.
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(sys::page_size)
}

/// Round `size` up to a multiple of `page_size` (a power of two).
#[inline]
pub const fn align_to_page(size: usize, page_size: usize) -> usize {
    (size + page_size - 1) & !(page_size - 1)
}

// ============================================================================
// Mapped region
// ============================================================================

/// A page-aligned region of anonymous memory.
///
/// Regions are deliberately leaked: trampolines handed out as function
/// pointers may be stored anywhere, so the backing memory is retained for
/// the life of the process. There is no `Drop` impl.
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl MappedRegion {
    /// Map `len` bytes (rounded up to whole pages) as read-write.
    ///
    /// Returns `None` if the platform refuses the mapping.
    pub fn map_rw(len: usize) -> Option<Self> {
        let len = align_to_page(len.max(1), page_size());
        let ptr = unsafe { sys::map_rw(len)? };
        Some(Self { ptr, len })
    }

    /// Base address of the region.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Length of the region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty (never true for a mapped region).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `addr` falls inside the region.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.ptr.as_ptr() as usize;
        addr >= base && addr < base + self.len
    }

    /// Seal `len` bytes starting at `offset` as read+execute and make the
    /// instruction stream observe what was written there.
    ///
    /// Returns `true` on success.
    ///
    /// # Safety
    ///
    /// The range must be page-aligned and lie within the region, and no
    /// thread may write to it afterwards.
    pub unsafe fn seal_executable(&self, offset: usize, len: usize) -> bool {
        debug_assert!(offset + len <= self.len, "seal range out of bounds");
        let start = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) };
        if !unsafe { sys::protect_rx(start, len) } {
            return false;
        }
        unsafe { sys::flush_icache(start, len) };
        true
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("base", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

// Access to the memory is coordinated by the owning trampoline table.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}
