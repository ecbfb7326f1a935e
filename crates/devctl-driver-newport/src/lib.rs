//! Newport hardware drivers for devctl.
//!
//! This crate provides the driver for Newport CONEX single-axis controllers:
//! - CONEX-CC (DC servo stages)
//! - CONEX-AGP (piezo, two axes `U`/`V` on one controller)
//!
//! Register the factory with the driver registry:
//!
//! ```rust,ignore
//! use devctl_driver_newport::ConexFactory;
//!
//! drivers.register_factory(ConexFactory);
//! ```

pub mod conex;

pub use conex::{ConexAxis, ConexDriver, ConexFactory};

/// Force the linker to include this crate.
///
/// Call this function from main() to ensure the driver factory is linked
/// into the final binary and not stripped by the linker.
#[inline(never)]
pub fn link() {
    std::hint::black_box(std::any::TypeId::of::<ConexFactory>());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_does_not_panic() {
        link();
    }
}
