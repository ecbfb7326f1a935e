//! Thorlabs hardware drivers for devctl.
//!
//! This crate provides drivers for:
//! - FW102C / FW212C motorized filter wheels (`thorlabs_wheel`)
//! - MFF101 / MFF102 motorized flip mounts (`thorlabs_flip`)
//! - Elliptec ELLx modules on an RS-485 bus (`elliptec`)
//!
//! Several Elliptec modules can share one serial port; the port registry in
//! `devctl-core` hands every driver on the same path the same transport.
//!
//! ```rust,ignore
//! use devctl_driver_thorlabs::{ElliptecFactory, FilterWheelFactory, FlipMountFactory};
//!
//! drivers.register_factory(FilterWheelFactory);
//! drivers.register_factory(FlipMountFactory);
//! drivers.register_factory(ElliptecFactory);
//! ```

pub mod elliptec;
pub mod filter_wheel;
pub mod flip_mount;

pub use elliptec::{ElliptecDriver, ElliptecFactory, ElliptecStatus};
pub use filter_wheel::{FilterWheelDriver, FilterWheelFactory};
pub use flip_mount::{FlipMountDriver, FlipMountFactory, FlipStatus};

/// Force the linker to include this crate.
///
/// Call this function from main() to ensure the driver factories are linked
/// into the final binary and not stripped by the linker.
#[inline(never)]
pub fn link() {
    std::hint::black_box(std::any::TypeId::of::<FilterWheelFactory>());
    std::hint::black_box(std::any::TypeId::of::<FlipMountFactory>());
    std::hint::black_box(std::any::TypeId::of::<ElliptecFactory>());
}
