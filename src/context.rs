use std::{cell::RefCell, sync::Arc};

use crate::{
    config::{PoolConfig, PoolKind},
    device_info::{DeviceInfo, device_info},
    error::ConfigError,
    legacy::LegacyPool,
    platform::{DevicePlatform, DevicePtr, HostPlatform},
    pool::{Allocation, DevicePool},
    vmm::VmmPool,
};

/// Builds the pool a device context owns for its whole life.
///
/// The strategy is picked once from `config`. There is no fallback from one
/// strategy to the other.
pub fn new_pool_for_device(
    device: u32,
    config: &PoolConfig,
    platform: Arc<dyn DevicePlatform>,
    info: &DeviceInfo,
) -> Box<dyn DevicePool> {
    tracing::debug!("device[{}]: creating {:?} pool", device, config.kind);

    match config.kind {
        PoolKind::Vmm => Box::new(VmmPool::with_max_size(
            device,
            platform,
            info.granularity_for(device),
            config.vmm_max_size,
        )),
        PoolKind::Legacy => Box::new(LegacyPool::new(device, platform)),
    }
}

/// Per-device state that funnels every scratch allocation through one pool.
///
/// The pool sits in a [`RefCell`]: a context can move to another thread but it
/// can't be shared, so all pool traffic stays on the thread driving the device.
pub struct DeviceContext {
    device: u32,
    pool: RefCell<Box<dyn DevicePool>>,
}

impl DeviceContext {
    /// Context on the host platform with the default (VMM) pool.
    pub fn new(device: u32) -> Self {
        Self::with_config(device, &PoolConfig::default(), Arc::new(HostPlatform::new()), device_info())
    }

    /// Context on the host platform configured from the environment.
    pub fn from_env(device: u32) -> Result<Self, ConfigError> {
        let config = PoolConfig::from_env()?;
        Ok(Self::with_config(device, &config, Arc::new(HostPlatform::new()), device_info()))
    }

    pub fn with_config(
        device: u32,
        config: &PoolConfig,
        platform: Arc<dyn DevicePlatform>,
        info: &DeviceInfo,
    ) -> Self {
        Self::with_pool(device, new_pool_for_device(device, config, platform, info))
    }

    /// Context owning an already built pool.
    pub fn with_pool(device: u32, pool: Box<dyn DevicePool>) -> Self {
        debug_assert_eq!(device, pool.device());
        Self { device, pool: RefCell::new(pool) }
    }

    pub fn device(&self) -> u32 {
        self.device
    }

    /// Requests at least `size` bytes of scratch memory.
    pub fn alloc(&self, size: usize) -> Allocation {
        self.pool.borrow_mut().alloc(size)
    }

    /// Returns scratch memory to the pool.
    pub fn free(&self, allocation: Allocation) {
        self.pool.borrow_mut().free(allocation)
    }

    /// Scratch memory that goes back to the pool when the guard is dropped.
    ///
    /// Guards declared in the same scope drop in reverse order, which is the
    /// LIFO order the VMM pool needs.
    pub fn scratch(&self, size: usize) -> ScratchBuffer<'_> {
        ScratchBuffer {
            context: self,
            allocation: Some(self.alloc(size)),
        }
    }
}

/// Scoped allocation returned by [`DeviceContext::scratch`].
pub struct ScratchBuffer<'a> {
    context: &'a DeviceContext,
    allocation: Option<Allocation>,
}

impl ScratchBuffer<'_> {
    pub fn ptr(&self) -> DevicePtr {
        self.allocation().ptr()
    }

    pub fn size(&self) -> usize {
        self.allocation().size()
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.allocation().as_ptr()
    }

    fn allocation(&self) -> &Allocation {
        self.allocation
            .as_ref()
            .expect("scratch allocation is only taken in drop")
    }
}

impl Drop for ScratchBuffer<'_> {
    fn drop(&mut self) {
        let Some(allocation) = self.allocation.take() else { return };

        if std::thread::panicking() {
            tracing::warn!(
                "device[{}]: dropping {} bytes of scratch while unwinding",
                self.context.device,
                allocation.size()
            );
            return;
        }

        self.context.free(allocation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::{Call, MockPlatform};

    const MIB: usize = 1 << 20;

    fn context(kind: PoolKind) -> (Arc<MockPlatform>, DeviceContext) {
        let platform = Arc::new(MockPlatform::new(2 * MIB));
        let info = DeviceInfo::query(platform.as_ref());
        let config = PoolConfig { kind, ..PoolConfig::default() };
        let ctx = DeviceContext::with_config(0, &config, platform.clone(), &info);
        (platform, ctx)
    }

    #[test]
    fn factory_defaults_to_vmm() {
        let (platform, ctx) = context(PoolKind::default());

        let a = ctx.alloc(1);
        // VMM rounds to 128 bytes and grows by physical mapping
        assert_eq!(128, a.size());
        assert_eq!(1, platform.count(|c| matches!(c, Call::Map { .. })));
        assert_eq!(0, platform.count(|c| matches!(c, Call::Malloc { .. })));

        ctx.free(a);
    }

    #[test]
    fn factory_builds_legacy_pool() {
        let (platform, ctx) = context(PoolKind::Legacy);

        let a = ctx.alloc(1);
        assert_eq!(256, a.size());
        assert_eq!(vec![Call::Malloc { size: 256 }], platform.calls());

        ctx.free(a);
    }

    #[test]
    fn nested_scratch_frees_in_reverse_order() {
        let (platform, ctx) = context(PoolKind::Vmm);

        let first = {
            let outer = ctx.scratch(MIB);
            let inner = ctx.scratch(2 * MIB);
            assert_eq!(outer.ptr().add(MIB), inner.ptr());
            outer.ptr()
        };

        // Everything was rewound, the next pass starts at the same address.
        let again = ctx.scratch(4 * MIB);
        assert_eq!(first, again.ptr());
        assert_eq!(2, platform.count(|c| matches!(c, Call::MallocPhysical { .. })));
    }

    #[test]
    fn repeated_passes_reuse_legacy_blocks() {
        let (platform, ctx) = context(PoolKind::Legacy);

        for _ in 0..10 {
            let a = ctx.scratch(4096);
            let b = ctx.scratch(100_000);
            assert!(a.size() >= 4096 && b.size() >= 100_000);
        }

        assert_eq!(2, platform.count(|c| matches!(c, Call::Malloc { .. })));
    }

    #[test]
    fn scratch_accessors_hold_until_drop() {
        let (platform, ctx) = context(PoolKind::Legacy);

        let scratch = ctx.scratch(1000);
        let ptr = scratch.ptr();
        assert_eq!(1280, scratch.size());
        assert_eq!(ptr.as_ptr(), scratch.as_ptr());
        assert_eq!(ptr, scratch.ptr());
        drop(scratch);

        let a = ctx.alloc(1000);
        assert_eq!(ptr, a.ptr());
        assert_eq!(1, platform.count(|c| matches!(c, Call::Malloc { .. })));
        ctx.free(a);
    }

    #[test]
    fn context_teardown_releases_pool() {
        let (platform, ctx) = context(PoolKind::Vmm);

        drop(ctx.scratch(3 * MIB));
        drop(ctx);

        assert_eq!(1, platform.count(|c| matches!(c, Call::Release { .. })));
    }

    #[test]
    fn host_context_allocates_writable_memory() {
        let ctx = DeviceContext::new(crate::platform::HOST_DEVICE);

        let scratch = ctx.scratch(1000);
        unsafe {
            scratch.as_ptr().write_bytes(0xab, scratch.size());
            assert_eq!(0xab, *scratch.as_ptr().add(999));
        }
    }
}
