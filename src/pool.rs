use crate::{error::fatal, platform::DevicePtr};

/// A region of device memory handed out by a [`DevicePool`].
///
/// The handle can't be built or cloned outside of this crate. Giving it back to
/// [`DevicePool::free`] consumes it, so the size a pool gets back is always the
/// size it handed out and a region can't be returned twice.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an allocation that is never freed stays reserved in its pool"]
pub struct Allocation {
    device: u32,
    ptr: DevicePtr,
    size: usize,
}

impl Allocation {
    pub(crate) fn new(device: u32, ptr: DevicePtr, size: usize) -> Self {
        Self { device, ptr, size }
    }

    /// Device the region lives on.
    #[inline]
    pub fn device(&self) -> u32 {
        self.device
    }

    /// Start of the region.
    #[inline]
    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Usable size, which is at least the requested size.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Start of the region as a raw pointer. Only host-visible devices can
    /// dereference it.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Splits the handle for the pool taking it back. `pool` names the caller
    /// in the fatal error raised when the handle belongs to another device.
    pub(crate) fn into_parts(self, pool: &str, device: u32) -> (DevicePtr, usize) {
        if self.device != device {
            fatal(
                pool,
                format!(
                    "allocation from device {} returned to device {}",
                    self.device, device
                ),
            );
        }

        (self.ptr, self.size)
    }
}

/// Common contract of the device memory pools.
///
/// A pool sits between the compute runtime and the expensive native
/// allocation calls. Pools don't lock: the owning [`crate::DeviceContext`]
/// serialises every call on the thread driving the device.
pub trait DevicePool: Send {
    /// Device this pool allocates on.
    fn device(&self) -> u32;

    /// Returns at least `size` bytes of device memory.
    ///
    /// Panics if the native platform can't provide more memory or a pool limit
    /// would be exceeded.
    fn alloc(&mut self, size: usize) -> Allocation;

    /// Gives `allocation` back to the pool.
    ///
    /// Panics if the pool can't take it back (capacity exhausted, or out of
    /// order for pools that require LIFO frees).
    fn free(&mut self, allocation: Allocation);
}
