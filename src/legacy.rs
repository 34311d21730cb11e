use std::sync::Arc;

use crate::{
    error::fatal,
    platform::{DevicePlatform, DevicePtr},
    pool::{Allocation, DevicePool},
    utils::{mib, round_up},
};

/// The maximum number of free blocks the pool keeps.
pub const MAX_BUFFERS: usize = 256;

/// Growth requests are padded by this percentage so that slightly larger
/// follow-up requests can reuse the block.
const LOOK_AHEAD_PERCENT: u128 = 105;

/// Growth requests are rounded to this many bytes.
const GROWTH_ROUNDING: usize = 256;

/// A block of device memory that is currently not in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeBlock {
    ptr: DevicePtr,
    size: usize,
}

/// Legacy pool: a fixed table of free blocks served by best fit.
///
/// Freed memory is never returned to the platform while the pool lives. It is
/// parked in the first empty slot of the table and handed out again to the
/// request it fits most tightly:
///
/// ```text
///   slots:  [ 4 KiB ][  --   ][ 1 MiB ][ 8 KiB ][  --   ] ...
///                                ^
///   alloc(900 KiB) --------------+   smallest block >= request
/// ```
///
/// If nothing fits, a new block of 105% of the request (rounded to 256 bytes) is
/// allocated natively. The table never grows: running out of slots on free
/// means the workload holds more distinct blocks than it ever should, and the
/// pool aborts rather than leak.
pub struct LegacyPool {
    device: u32,
    platform: Arc<dyn DevicePlatform>,
    /// Free blocks, `None` marks an empty slot
    slots: [Option<FreeBlock>; MAX_BUFFERS],
    /// Bytes allocated natively and not yet returned to the platform
    pool_size: usize,
}

impl LegacyPool {
    pub fn new(device: u32, platform: Arc<dyn DevicePlatform>) -> Self {
        Self {
            device,
            platform,
            slots: [None; MAX_BUFFERS],
            pool_size: 0,
        }
    }

    /// Bytes this pool obtained from the platform, whether cached or handed out.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Number of free blocks currently cached.
    pub fn cached_blocks(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Returns the slot holding the smallest block that can fit `size`. Ties
    /// go to the lowest slot.
    fn find_best_fit(&self, size: usize) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;

        for (i, block) in self.slots.iter().enumerate() {
            let Some(block) = block else { continue };

            if block.size < size {
                continue;
            }

            let diff = block.size - size;
            if best.is_none_or(|(best_diff, _)| diff < best_diff) {
                best = Some((diff, i));

                if diff == 0 {
                    // Can't do better than an exact match.
                    break;
                }
            }
        }

        best.map(|(_, i)| i)
    }
}

/// Size of the native allocation made when no cached block fits `size`.
pub(crate) fn look_ahead_size(size: usize) -> usize {
    let padded = (size as u128 * LOOK_AHEAD_PERCENT).div_ceil(100);

    usize::try_from(padded)
        .ok()
        .and_then(|padded| round_up(padded.max(1), GROWTH_ROUNDING))
        .unwrap_or_else(|| {
            fatal("legacy pool growth", format!("request of {size} bytes overflows"))
        })
}

impl DevicePool for LegacyPool {
    fn device(&self) -> u32 {
        self.device
    }

    fn alloc(&mut self, size: usize) -> Allocation {
        if let Some(i) = self.find_best_fit(size) {
            if let Some(block) = self.slots[i].take() {
                tracing::trace!(
                    "legacy pool[{}]: reused slot {} ({} bytes) for {} bytes",
                    self.device, i, block.size, size
                );
                return Allocation::new(self.device, block.ptr, block.size);
            }
        }

        let look_ahead = look_ahead_size(size);

        let ptr = self
            .platform
            .malloc(self.device, look_ahead)
            .unwrap_or_else(|err| fatal("legacy pool malloc", err));

        self.pool_size += look_ahead;

        tracing::debug!(
            "legacy pool[{}]: {} cached blocks, pool_size = {} MB, requested {} bytes, allocated {} bytes",
            self.device,
            self.cached_blocks(),
            mib(self.pool_size),
            size,
            look_ahead
        );

        Allocation::new(self.device, ptr, look_ahead)
    }

    fn free(&mut self, allocation: Allocation) {
        let (ptr, size) = allocation.into_parts("legacy pool free", self.device);

        match self.slots.iter_mut().enumerate().find(|(_, slot)| slot.is_none()) {
            Some((i, slot)) => {
                *slot = Some(FreeBlock { ptr, size });
                tracing::trace!("legacy pool[{}]: cached {} bytes in slot {}", self.device, size, i);
            }
            None => fatal(
                "legacy pool free",
                format!("all {MAX_BUFFERS} slots are in use, increase MAX_BUFFERS"),
            ),
        }
    }
}

impl Drop for LegacyPool {
    fn drop(&mut self) {
        for block in self.slots.iter_mut().filter_map(Option::take) {
            if let Err(err) = unsafe { self.platform.free(block.ptr, block.size) } {
                if std::thread::panicking() {
                    tracing::error!("legacy pool[{}]: free failed during unwind: {}", self.device, err);
                    continue;
                }
                fatal("legacy pool teardown", err);
            }

            self.pool_size = self.pool_size.saturating_sub(block.size);
        }

        tracing::debug!("legacy pool[{}]: released, {} bytes unaccounted", self.device, self.pool_size);

        if self.pool_size != 0 && !std::thread::panicking() {
            fatal(
                "legacy pool teardown",
                format!("{} bytes were never returned to the pool (leak)", self.pool_size),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::{Call, MockPlatform};
    use proptest::prelude::*;

    fn pool() -> (Arc<MockPlatform>, LegacyPool) {
        let platform = Arc::new(MockPlatform::new(2 << 20));
        let pool = LegacyPool::new(0, platform.clone());
        (platform, pool)
    }

    fn mallocs(platform: &MockPlatform) -> usize {
        platform.count(|c| matches!(c, Call::Malloc { .. }))
    }

    #[test]
    fn look_ahead_rounding() {
        // 105 -> 256
        assert_eq!(256, look_ahead_size(100));
        // 1050 -> 1280
        assert_eq!(1280, look_ahead_size(1000));
        // 5376 is already a multiple of 256
        assert_eq!(5376, look_ahead_size(5120));
        // 256.2 must round up, not truncate
        assert_eq!(512, look_ahead_size(244));
        assert_eq!(256, look_ahead_size(0));
    }

    #[test]
    fn grows_when_nothing_fits() {
        let (platform, mut pool) = pool();

        let a = pool.alloc(1000);

        assert_eq!(1280, a.size());
        assert_eq!(vec![Call::Malloc { size: 1280 }], platform.calls());
        assert_eq!(1280, pool.pool_size());

        pool.free(a);
    }

    #[test]
    fn freed_block_is_reused() {
        let (platform, mut pool) = pool();

        let a = pool.alloc(1000);
        let ptr = a.ptr();
        pool.free(a);

        let b = pool.alloc(1100);
        assert_eq!(ptr, b.ptr());
        assert_eq!(1280, b.size());
        assert_eq!(1, mallocs(&platform));
        assert_eq!(0, pool.cached_blocks());

        pool.free(b);
    }

    #[test]
    fn best_fit_picks_smallest_sufficient_block() {
        let (platform, mut pool) = pool();

        let small = pool.alloc(1000); // 1280
        let large = pool.alloc(3000); // 3328
        let medium = pool.alloc(2000); // 2304
        let (small_ptr, medium_ptr) = (small.ptr(), medium.ptr());

        pool.free(small);
        pool.free(large);
        pool.free(medium);

        let a = pool.alloc(1500);
        assert_eq!(medium_ptr, a.ptr());
        let b = pool.alloc(1200);
        assert_eq!(small_ptr, b.ptr());
        assert_eq!(3, mallocs(&platform));

        pool.free(a);
        pool.free(b);
    }

    #[test]
    fn ties_go_to_first_slot() {
        let (_, mut pool) = pool();

        let a = pool.alloc(1000);
        let b = pool.alloc(1000);
        let first = b.ptr();

        pool.free(b);
        pool.free(a);

        let c = pool.alloc(500);
        assert_eq!(first, c.ptr());

        pool.free(c);
    }

    #[test]
    fn drop_returns_cached_blocks() {
        let (platform, mut pool) = pool();

        let a = pool.alloc(1000);
        let b = pool.alloc(4096);
        pool.free(a);
        pool.free(b);
        drop(pool);

        assert_eq!(0, platform.live_bytes());
        assert_eq!(2, platform.count(|c| matches!(c, Call::Free { .. })));
    }

    #[test]
    fn full_table_is_not_fatal() {
        let (_, mut pool) = pool();

        let blocks: Vec<_> = (0..MAX_BUFFERS).map(|_| pool.alloc(128)).collect();
        for block in blocks {
            pool.free(block);
        }

        assert_eq!(MAX_BUFFERS, pool.cached_blocks());
    }

    #[test]
    #[should_panic(expected = "slots are in use")]
    fn free_beyond_capacity_aborts() {
        let (_, mut pool) = pool();

        let blocks: Vec<_> = (0..=MAX_BUFFERS).map(|_| pool.alloc(128)).collect();
        for block in blocks {
            pool.free(block);
        }
    }

    #[test]
    #[should_panic(expected = "leak")]
    fn teardown_detects_outstanding_blocks() {
        let (_, mut pool) = pool();

        let _outstanding = pool.alloc(1000);
        drop(pool);
    }

    #[test]
    #[should_panic(expected = "legacy pool growth")]
    fn oversized_request_aborts() {
        let (_, mut pool) = pool();

        let _a = pool.alloc(usize::MAX);
    }

    #[test]
    #[should_panic(expected = "overflows")]
    fn look_ahead_near_usize_max_aborts() {
        // Padding lands within 256 bytes of usize::MAX.
        look_ahead_size(usize::MAX / 105 * 100);
    }

    #[test]
    #[should_panic(expected = "allocation from device 1 returned to device 0")]
    fn free_from_other_device_aborts() {
        let platform = Arc::new(MockPlatform::new(2 << 20).with_devices(Ok(2)));
        let mut pool = LegacyPool::new(0, platform.clone());
        let mut other = LegacyPool::new(1, platform);

        let a = other.alloc(1000);
        pool.free(a);
    }

    proptest! {
        #[test]
        fn best_fit_matches_reference(
            sizes in prop::collection::vec(1usize..10_000, 1..24),
            pick in any::<prop::sample::Index>(),
        ) {
            let (platform, mut pool) = pool();

            let allocations: Vec<_> = sizes.iter().map(|&s| pool.alloc(s)).collect();
            let cached: Vec<_> = allocations.iter().map(|a| (a.ptr(), a.size())).collect();
            for a in allocations {
                pool.free(a);
            }

            let max = cached.iter().map(|&(_, size)| size).max().unwrap();
            let request = pick.index(max) + 1;

            // Slots fill in free order, so the first minimal entry is the expected one.
            let expected = cached
                .iter()
                .filter(|&&(_, size)| size >= request)
                .min_by_key(|&&(_, size)| size - request)
                .map(|&(ptr, _)| ptr)
                .unwrap();

            let got = pool.alloc(request);
            prop_assert_eq!(expected, got.ptr());
            prop_assert_eq!(sizes.len(), mallocs(&platform));

            pool.free(got);
        }
    }
}
