use std::{
    io,
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::error::PlatformError;

/// Address in device-global memory.
///
/// Device memory is not necessarily dereferenceable from the host, so this is
/// kept as a plain address. Pools only do offset arithmetic on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevicePtr(usize);

impl DevicePtr {
    /// Wraps a raw device address returned by a native call.
    #[inline]
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    /// The raw device address.
    #[inline]
    pub const fn addr(self) -> usize {
        self.0
    }

    /// The address as a host pointer. Only meaningful for host-visible memory.
    #[inline]
    pub fn as_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }

    /// Address `offset` bytes after `self`.
    #[inline]
    pub const fn add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }
}

impl From<NonNull<u8>> for DevicePtr {
    fn from(ptr: NonNull<u8>) -> Self {
        Self(ptr.as_ptr() as usize)
    }
}

/// Handle to a chunk of physical device memory that is not yet (or no longer)
/// visible at any virtual address.
#[derive(Debug, PartialEq, Eq)]
pub struct PhysicalHandle {
    id: u64,
    size: usize,
}

impl PhysicalHandle {
    /// Wraps a native handle `id` backing `size` bytes.
    pub const fn new(id: u64, size: usize) -> Self {
        Self { id, size }
    }

    /// Native identifier of the chunk.
    #[inline]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Bytes of physical memory behind the handle.
    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }
}

/// This trait is the boundary between the pools and the accelerator's native
/// runtime. The pools only know about allocation policy, everything that ends
/// up in the driver goes through here.
///
/// Every call is synchronous. Whether a failure is recoverable is decided by the
/// caller: only device enumeration tolerates errors, pool growth and teardown
/// treat them as fatal.
pub trait DevicePlatform: Send + Sync {
    /// Number of devices visible to this process.
    fn device_count(&self) -> Result<u32, PlatformError>;

    /// Minimum unit of physical memory the platform maps for `device`.
    fn allocation_granularity(&self, device: u32) -> Result<usize, PlatformError>;

    /// Allocates `size` bytes of raw device memory.
    fn malloc(&self, device: u32, size: usize) -> Result<DevicePtr, PlatformError>;

    /// Returns memory obtained from [`DevicePlatform::malloc`].
    ///
    /// # Safety
    /// `ptr` and `size` must describe exactly one live `malloc` result.
    unsafe fn free(&self, ptr: DevicePtr, size: usize) -> Result<(), PlatformError>;

    /// Reserves `size` bytes of virtual address space without backing memory.
    fn reserve_address(&self, size: usize) -> Result<DevicePtr, PlatformError>;

    /// Releases a reservation made by [`DevicePlatform::reserve_address`].
    ///
    /// # Safety
    /// Nothing may still be mapped inside the range.
    unsafe fn release_address(&self, ptr: DevicePtr, size: usize) -> Result<(), PlatformError>;

    /// Allocates `size` bytes of physical memory on `device`.
    fn malloc_physical(&self, device: u32, size: usize) -> Result<PhysicalHandle, PlatformError>;

    /// Releases physical memory. It must not be mapped anywhere.
    fn free_physical(&self, handle: PhysicalHandle) -> Result<(), PlatformError>;

    /// Maps `handle` at `ptr`, making `size` bytes accessible.
    ///
    /// # Safety
    /// The range must lie inside a live reservation and not be mapped already.
    unsafe fn map(&self, ptr: DevicePtr, size: usize, handle: &PhysicalHandle) -> Result<(), PlatformError>;

    /// Unmaps a range previously mapped with [`DevicePlatform::map`].
    ///
    /// # Safety
    /// No live allocation may point into the range anymore.
    unsafe fn unmap(&self, ptr: DevicePtr, size: usize) -> Result<(), PlatformError>;
}

/// Platform that exposes the host's own virtual memory as a single device.
///
/// Reservations, commits and decommits map one to one onto the OS primitives,
/// so it behaves like an accelerator VMM with the page size as granularity. It
/// is what [`crate::device_info::device_info`] and [`crate::DeviceContext::new`]
/// use when no vendor runtime is plugged in.
#[derive(Debug, Default)]
pub struct HostPlatform {
    next_handle: AtomicU64,
}

/// Index of the only device a [`HostPlatform`] exposes.
pub const HOST_DEVICE: u32 = 0;

/// Low level OS memory primitives. The platform-specific syscalls live
/// in the `unix` and `windows` modules below.
trait HostMemory {
    /// Reserve and commit `len` bytes of read-write memory.
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the kernel.
    unsafe fn return_memory(addr: *mut u8, len: usize) -> bool;

    /// Reserve `len` bytes of inaccessible address space.
    unsafe fn reserve_range(len: usize) -> Option<NonNull<u8>>;

    /// Make `len` bytes at `addr` (inside a reservation) read-write.
    unsafe fn commit_range(addr: *mut u8, len: usize) -> bool;

    /// Drop the backing pages of `len` bytes at `addr` and make them inaccessible.
    unsafe fn decommit_range(addr: *mut u8, len: usize) -> bool;

    /// Granularity at which ranges can be committed.
    fn granularity() -> usize;
}

impl HostPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_device(device: u32) -> Result<(), PlatformError> {
        if device == HOST_DEVICE {
            Ok(())
        } else {
            Err(PlatformError::InvalidDevice(device))
        }
    }
}

fn last_os_error(call: &'static str) -> PlatformError {
    PlatformError::Native {
        call,
        code: io::Error::last_os_error().raw_os_error().unwrap_or(-1),
    }
}

impl DevicePlatform for HostPlatform {
    fn device_count(&self) -> Result<u32, PlatformError> {
        Ok(1)
    }

    fn allocation_granularity(&self, device: u32) -> Result<usize, PlatformError> {
        Self::check_device(device)?;
        Ok(<Self as HostMemory>::granularity())
    }

    fn malloc(&self, device: u32, size: usize) -> Result<DevicePtr, PlatformError> {
        Self::check_device(device)?;

        let addr = unsafe { <Self as HostMemory>::request_memory(size) };

        addr.map(DevicePtr::from).ok_or(PlatformError::OutOfMemory { size })
    }

    unsafe fn free(&self, ptr: DevicePtr, size: usize) -> Result<(), PlatformError> {
        match unsafe { <Self as HostMemory>::return_memory(ptr.as_ptr(), size) } {
            true => Ok(()),
            false => Err(last_os_error("free")),
        }
    }

    fn reserve_address(&self, size: usize) -> Result<DevicePtr, PlatformError> {
        let addr = unsafe { <Self as HostMemory>::reserve_range(size) };

        addr.map(DevicePtr::from).ok_or_else(|| last_os_error("reserve_address"))
    }

    unsafe fn release_address(&self, ptr: DevicePtr, size: usize) -> Result<(), PlatformError> {
        match unsafe { <Self as HostMemory>::return_memory(ptr.as_ptr(), size) } {
            true => Ok(()),
            false => Err(last_os_error("release_address")),
        }
    }

    fn malloc_physical(&self, device: u32, size: usize) -> Result<PhysicalHandle, PlatformError> {
        Self::check_device(device)?;

        // Host pages only exist once committed, so the handle is just a token
        // remembering how much it is allowed to back.
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        Ok(PhysicalHandle::new(id, size))
    }

    fn free_physical(&self, _handle: PhysicalHandle) -> Result<(), PlatformError> {
        Ok(())
    }

    unsafe fn map(&self, ptr: DevicePtr, size: usize, handle: &PhysicalHandle) -> Result<(), PlatformError> {
        if handle.size() != size {
            return Err(PlatformError::SizeMismatch { handle_size: handle.size(), size });
        }

        match unsafe { <Self as HostMemory>::commit_range(ptr.as_ptr(), size) } {
            true => Ok(()),
            false => Err(last_os_error("map")),
        }
    }

    unsafe fn unmap(&self, ptr: DevicePtr, size: usize) -> Result<(), PlatformError> {
        match unsafe { <Self as HostMemory>::decommit_range(ptr.as_ptr(), size) } {
            true => Ok(()),
            false => Err(last_os_error("unmap")),
        }
    }
}

#[cfg(unix)]
mod unix {
    use super::{HostMemory, HostPlatform};

    use libc::{madvise, mmap, mprotect, munmap, off_t, size_t};

    use std::{os::raw::{c_int, c_void}, ptr::NonNull};

    // mmap parameters shared by every call.
    const FD: c_int = -1;
    const OFFSET: off_t = 0;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    const NORESERVE: c_int = libc::MAP_NORESERVE;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const NORESERVE: c_int = 0;

    unsafe fn anonymous(len: usize, prot: c_int, extra_flags: c_int) -> Option<NonNull<u8>> {
        const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra_flags;

        unsafe {
            match mmap(ADDR, len as size_t, prot, flags, FD, OFFSET) {
                libc::MAP_FAILED => None,
                addr => NonNull::new(addr.cast::<u8>()),
            }
        }
    }

    impl HostMemory for HostPlatform {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // Read-Write only memory.
            unsafe { anonymous(len, libc::PROT_READ | libc::PROT_WRITE, 0) }
        }

        unsafe fn return_memory(addr: *mut u8, len: usize) -> bool {
            unsafe { munmap(addr as *mut c_void, len as size_t) == 0 }
        }

        unsafe fn reserve_range(len: usize) -> Option<NonNull<u8>> {
            unsafe { anonymous(len, libc::PROT_NONE, NORESERVE) }
        }

        unsafe fn commit_range(addr: *mut u8, len: usize) -> bool {
            unsafe { mprotect(addr as *mut c_void, len as size_t, libc::PROT_READ | libc::PROT_WRITE) == 0 }
        }

        unsafe fn decommit_range(addr: *mut u8, len: usize) -> bool {
            unsafe {
                madvise(addr as *mut c_void, len as size_t, libc::MADV_DONTNEED) == 0
                    && mprotect(addr as *mut c_void, len as size_t, libc::PROT_NONE) == 0
            }
        }

        fn granularity() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use super::{HostMemory, HostPlatform};

    use windows::Win32::System::{Memory, SystemInformation};

    impl HostMemory for HostPlatform {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn return_memory(addr: *mut u8, _len: usize) -> bool {
            unsafe { Memory::VirtualFree(addr as *mut c_void, 0, Memory::MEM_RELEASE).is_ok() }
        }

        unsafe fn reserve_range(len: usize) -> Option<NonNull<u8>> {
            unsafe {
                let addr = Memory::VirtualAlloc(None, len, Memory::MEM_RESERVE, Memory::PAGE_NOACCESS);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn commit_range(addr: *mut u8, len: usize) -> bool {
            unsafe {
                let addr = Memory::VirtualAlloc(
                    Some(addr as *const c_void),
                    len,
                    Memory::MEM_COMMIT,
                    Memory::PAGE_READWRITE,
                );

                !addr.is_null()
            }
        }

        unsafe fn decommit_range(addr: *mut u8, len: usize) -> bool {
            unsafe { Memory::VirtualFree(addr as *mut c_void, len, Memory::MEM_DECOMMIT).is_ok() }
        }

        fn granularity() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwAllocationGranularity as usize
            }
        }
    }
}
