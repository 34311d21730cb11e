//! Device memory pools for accelerator backends.
//!
//! Native device allocation is synchronous and slow, while a compute graph asks
//! for scratch memory of a different size on every operation. A [`DeviceContext`]
//! puts a pool between the two:
//!
//! ```text
//!   compute op ──alloc/free──> DeviceContext ──> DevicePool ──> DevicePlatform
//!                                                 (vmm | legacy)   (driver calls)
//! ```
//!
//! - [`VmmPool`] (default) reserves one large virtual range and maps physical
//!   memory into it on demand. Allocation is a bump of a pointer and frees must
//!   be LIFO.
//! - [`LegacyPool`] keeps a fixed table of freed blocks and serves requests by
//!   best fit, growing with a 5% look-ahead when nothing fits.
//!
//! Contract violations and resource exhaustion inside a pool are fatal and
//! panic. Only device enumeration, configuration and logging setup return
//! errors.

pub mod config;
pub mod context;
pub mod device_info;
pub mod error;
pub mod legacy;
pub mod logging;
pub mod platform;
pub mod pool;
pub mod utils;
pub mod vmm;

pub use config::{PoolConfig, PoolKind};
pub use context::{DeviceContext, ScratchBuffer, new_pool_for_device};
pub use device_info::{DeviceAllocationInfo, DeviceInfo, device_info, granularity_for};
pub use error::{ConfigError, LoggingError, PlatformError};
pub use legacy::LegacyPool;
pub use platform::{DevicePlatform, DevicePtr, HostPlatform, PhysicalHandle};
pub use pool::{Allocation, DevicePool};
pub use vmm::VmmPool;
