use std::sync::Arc;

use crate::{
    error::{fatal, PlatformError},
    platform::{DevicePlatform, DevicePtr, PhysicalHandle},
    pool::{Allocation, DevicePool},
    utils::{align, mib, round_up},
};

/// Default upper bound of the virtual address space reserved per pool (32 GiB).
pub const VMM_MAX_SIZE: usize = 1 << 35;

/// Every allocation is rounded to this many bytes so that it is aligned for all
/// data types.
pub const VMM_ALIGNMENT: usize = 128;

/// A chunk of physical memory mapped into the pool's address range.
#[derive(Debug)]
struct Mapping {
    handle: PhysicalHandle,
    /// Offset from the pool base where the chunk is mapped
    offset: usize,
}

/// Virtual memory pool.
///
/// The pool reserves one contiguous virtual range of `max_size` bytes the first
/// time it grows and maps physical chunks into it back to back. Allocation is a
/// bump of `used` inside the committed part:
///
/// ```text
///  base                                                         base + max_size
///   +------------+------------+-----------------+--------------------------+
///   |  chunk 0   |  chunk 1   |     chunk 2     |  reserved, not mapped    |
///   +------------+------------+-----------------+--------------------------+
///   |<------------ used ------------>|
///   |<------------------ committed ------------>|
/// ```
///
/// Frees only rewind `used`, so they must come in exactly the reverse order of
/// the allocations. Scratch memory of a compute pass is naturally stack-like,
/// and the pool aborts as soon as that order is broken.
pub struct VmmPool {
    device: u32,
    platform: Arc<dyn DevicePlatform>,
    granularity: usize,
    max_size: usize,
    /// Start of the reserved range, `None` until the first growth
    base: Option<DevicePtr>,
    /// Bytes handed out, counted from `base`
    used: usize,
    /// Bytes with physical memory mapped behind them, counted from `base`
    committed: usize,
    /// Physical chunks in mapping order
    mappings: Vec<Mapping>,
}

impl VmmPool {
    /// Creates a pool for `device` that grows in multiples of `granularity`.
    pub fn new(device: u32, platform: Arc<dyn DevicePlatform>, granularity: usize) -> Self {
        Self::with_max_size(device, platform, granularity, VMM_MAX_SIZE)
    }

    /// Same as [`VmmPool::new`] with a custom address space bound.
    pub fn with_max_size(
        device: u32,
        platform: Arc<dyn DevicePlatform>,
        granularity: usize,
        max_size: usize,
    ) -> Self {
        // A zero granularity only comes out of a failed device enumeration.
        if granularity == 0 {
            fatal("vmm pool", format!("device {device} reports no allocation granularity"));
        }

        Self {
            device,
            platform,
            granularity,
            max_size,
            base: None,
            used: 0,
            committed: 0,
            mappings: Vec::new(),
        }
    }

    /// Bytes handed out, counted from the start of the reservation.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes of physical memory mapped into the reservation.
    pub fn committed(&self) -> usize {
        self.committed
    }

    /// Size of the virtual reservation, the upper bound for `committed`.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of physical chunks mapped so far.
    pub fn mapped_chunks(&self) -> usize {
        self.mappings.len()
    }

    /// Maps enough physical memory after the committed range to fit `size`
    /// more bytes on top of `used`.
    fn grow(&mut self, size: usize) -> DevicePtr {
        let avail = self.committed - self.used;
        let Some(reserve_size) = round_up(size - avail, self.granularity) else {
            fatal("vmm pool growth", format!("request of {size} bytes overflows"));
        };

        if self.committed.checked_add(reserve_size).is_none_or(|total| total > self.max_size) {
            fatal(
                "vmm pool growth",
                format!(
                    "committing {} more bytes on top of {} exceeds the {} MB bound",
                    reserve_size,
                    self.committed,
                    mib(self.max_size)
                ),
            );
        }

        let handle = self
            .platform
            .malloc_physical(self.device, reserve_size)
            .unwrap_or_else(|err| fatal("vmm pool malloc_physical", err));

        // The address range is reserved once, on first growth.
        let base = match self.base {
            Some(base) => base,
            None => {
                let base = self
                    .platform
                    .reserve_address(self.max_size)
                    .unwrap_or_else(|err| fatal("vmm pool reserve_address", err));
                tracing::debug!(
                    "vmm pool[{}]: reserved {} MB of address space at {:#x}",
                    self.device,
                    mib(self.max_size),
                    base.addr()
                );
                self.base = Some(base);
                base
            }
        };

        // Map at the end of the pool.
        let mapped = unsafe { self.platform.map(base.add(self.committed), reserve_size, &handle) };
        mapped.unwrap_or_else(|err| fatal("vmm pool map", err));

        self.mappings.push(Mapping { handle, offset: self.committed });
        self.committed += reserve_size;

        tracing::debug!(
            "vmm pool[{}]: size increased to {} MB (mapped {} bytes)",
            self.device,
            mib(self.committed),
            reserve_size
        );

        base
    }
}

impl DevicePool for VmmPool {
    fn device(&self) -> u32 {
        self.device
    }

    fn alloc(&mut self, requested: usize) -> Allocation {
        let size = align(requested.max(1), VMM_ALIGNMENT).unwrap_or_else(|| {
            fatal("vmm pool growth", format!("request of {requested} bytes overflows"))
        });

        let base = match self.base {
            Some(base) if size <= self.committed - self.used => base,
            _ => self.grow(size),
        };

        let ptr = base.add(self.used);
        self.used += size;

        tracing::trace!("vmm pool[{}]: allocated {} bytes at {:#x}", self.device, size, ptr.addr());

        Allocation::new(self.device, ptr, size)
    }

    fn free(&mut self, allocation: Allocation) {
        let (ptr, size) = allocation.into_parts("vmm pool free", self.device);

        tracing::trace!("vmm pool[{}]: freed {} bytes at {:#x}", self.device, size, ptr.addr());

        let Some(used) = self.used.checked_sub(size) else {
            fatal("vmm pool free", format!("{size} bytes freed but only {} in use", self.used));
        };

        // All deallocations must be in reverse order of the allocations.
        let expected = self.base.map(|base| base.add(used));
        if expected != Some(ptr) {
            fatal(
                "vmm pool free",
                format!("{:#x} freed out of order (expected {:?})", ptr.addr(), expected),
            );
        }

        self.used = used;
    }
}

impl Drop for VmmPool {
    fn drop(&mut self) {
        let Some(base) = self.base else { return };

        let check = |what: &str, result: Result<(), PlatformError>| {
            if let Err(err) = result {
                if std::thread::panicking() {
                    tracing::error!("vmm pool teardown: {what} failed during unwind: {err}");
                } else {
                    fatal(what, err);
                }
            }
        };

        for mapping in &self.mappings {
            let size = mapping.handle.size();
            check("vmm pool unmap", unsafe { self.platform.unmap(base.add(mapping.offset), size) });
        }

        for mapping in self.mappings.drain(..) {
            check("vmm pool free_physical", self.platform.free_physical(mapping.handle));
        }

        check("vmm pool release_address", unsafe { self.platform.release_address(base, self.max_size) });

        tracing::debug!("vmm pool[{}]: released {} MB", self.device, mib(self.committed));
    }
}
