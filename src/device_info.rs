//! Process wide table of per-device allocation properties.
//!
//! The table is built in a single pass over every visible device the first
//! time anyone asks for it and never changes afterwards.

use once_cell::sync::OnceCell;

use crate::{
    error::fatal,
    platform::{DevicePlatform, HostPlatform},
};

/// The maximum number of devices the table can describe.
pub const MAX_DEVICES: usize = 16;

/// Allocation properties of one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceAllocationInfo {
    pub device: u32,
    /// Minimum unit of physical memory the platform maps for this device
    pub granularity: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    device_count: u32,
    devices: [DeviceAllocationInfo; MAX_DEVICES],
}

static DEVICE_INFO: OnceCell<DeviceInfo> = OnceCell::new();

/// Returns the device table of the host platform, building it on first use.
///
/// Concurrent first calls wait for a single initialization.
pub fn device_info() -> &'static DeviceInfo {
    get_or_query(&DEVICE_INFO, &HostPlatform::new())
}

/// Fills `cell` from `platform` unless another caller already did.
fn get_or_query<'a>(
    cell: &'a OnceCell<DeviceInfo>,
    platform: &dyn DevicePlatform,
) -> &'a DeviceInfo {
    cell.get_or_init(|| DeviceInfo::query(platform))
}

/// Shorthand for `device_info().granularity_for(device)`.
pub fn granularity_for(device: u32) -> usize {
    device_info().granularity_for(device)
}

impl DeviceInfo {
    /// Queries every device visible through `platform`.
    ///
    /// If the platform can't even enumerate devices the error is logged and an
    /// empty table is returned, since that usually just means there are none.
    /// Any other failure is fatal.
    pub fn query(platform: &dyn DevicePlatform) -> Self {
        let mut info = Self::default();

        let count = match platform.device_count() {
            Ok(count) => count,
            Err(err) => {
                tracing::error!("device info: failed to enumerate devices: {}", err);
                return info;
            }
        };

        if count as usize > MAX_DEVICES {
            fatal(
                "device info",
                format!("{count} devices found, at most {MAX_DEVICES} are supported"),
            );
        }

        info.device_count = count;
        for (device, entry) in (0..count).zip(info.devices.iter_mut()) {
            let granularity = platform
                .allocation_granularity(device)
                .unwrap_or_else(|err| fatal("device info granularity", err));

            *entry = DeviceAllocationInfo { device, granularity };
        }

        tracing::debug!("device info: {} devices", count);

        info
    }

    pub fn device_count(&self) -> u32 {
        self.device_count
    }

    pub fn devices(&self) -> &[DeviceAllocationInfo] {
        &self.devices[..self.device_count as usize]
    }

    /// Granularity of `device`, or 0 when the device isn't known.
    pub fn granularity_for(&self, device: u32) -> usize {
        self.devices()
            .get(device as usize)
            .map_or(0, |info| info.granularity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockPlatform;
    use std::{sync::Barrier, thread};

    #[test]
    fn query_fills_every_device() {
        let platform = MockPlatform::new(2 << 20).with_devices(Ok(3));
        let info = DeviceInfo::query(&platform);

        assert_eq!(3, info.device_count());
        for device in 0..3 {
            assert_eq!(2 << 20, info.granularity_for(device));
            assert_eq!(device, info.devices()[device as usize].device);
        }
        assert_eq!(0, info.granularity_for(3));
    }

    #[test]
    fn enumeration_failure_leaves_empty_table() {
        let platform = MockPlatform::new(2 << 20).with_devices(Err(507_000));
        let info = DeviceInfo::query(&platform);

        assert_eq!(DeviceInfo::default(), info);
        assert_eq!(0, info.granularity_for(0));
    }

    #[test]
    #[should_panic(expected = "at most 16")]
    fn too_many_devices_aborts() {
        let platform = MockPlatform::new(2 << 20).with_devices(Ok(MAX_DEVICES as u32 + 1));
        let _ = DeviceInfo::query(&platform);
    }

    #[test]
    fn concurrent_first_access_queries_once() {
        const THREADS: usize = 8;

        let platform = MockPlatform::new(2 << 20).with_devices(Ok(2));
        let cell = OnceCell::new();
        let barrier = Barrier::new(THREADS);
        let (platform, cell, barrier) = (&platform, &cell, &barrier);

        let tables: Vec<&DeviceInfo> = thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(move || {
                        barrier.wait();
                        get_or_query(cell, platform)
                    })
                })
                .collect();

            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(1, platform.device_queries());
        assert!(tables.iter().all(|table| std::ptr::eq(*table, tables[0])));
        assert_eq!(2, tables[0].device_count());
    }

    #[test]
    fn global_table_is_built_once() {
        let first = device_info();
        let second = device_info();

        assert!(std::ptr::eq(first, second));
        assert_eq!(1, first.device_count());
        assert!(granularity_for(0) > 0);
    }
}
