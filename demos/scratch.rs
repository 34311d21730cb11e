//! Runs a few fake compute passes against the host device and prints what the
//! pool does. Set `RUST_LOG=devpool=trace` to see every allocation.

use devpool::{DeviceContext, logging::init_logging, platform::HOST_DEVICE};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging()?;

    let ctx = DeviceContext::from_env(HOST_DEVICE)?;

    for pass in 0..3 {
        let workspace = ctx.scratch(1 << 20);
        let tmp = ctx.scratch(100_000 * (pass + 1));

        unsafe { tmp.as_ptr().write_bytes(0, tmp.size()) };

        println!(
            "pass {pass}: workspace {} bytes at {:#x}, tmp {} bytes at {:#x}",
            workspace.size(),
            workspace.ptr().addr(),
            tmp.size(),
            tmp.ptr().addr()
        );
    }

    Ok(())
}
