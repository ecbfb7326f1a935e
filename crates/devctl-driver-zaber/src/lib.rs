//! Zaber hardware drivers for devctl.
//!
//! Devices speaking the Zaber binary protocol (T-series, A-series in binary
//! mode): 6-byte frames, several devices daisy-chained on one port.
//!
//! ```rust,ignore
//! use devctl_driver_zaber::ZaberFactory;
//!
//! drivers.register_factory(ZaberFactory);
//! ```

pub mod binary;

pub use binary::{Frame, ZaberCommand, ZaberDriver, ZaberFactory};

/// Force the linker to include this crate.
///
/// Call this function from main() to ensure the driver factory is linked
/// into the final binary and not stripped by the linker.
#[inline(never)]
pub fn link() {
    std::hint::black_box(std::any::TypeId::of::<ZaberFactory>());
}
