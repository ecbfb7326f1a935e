//! `devctl-core`
//!
//! Device abstraction and configuration core for optical-bench motion
//! hardware: stages, filter wheels and flip mounts behind one interface.
//!
//! ## Layers
//!
//! - **[`transport`]**: one open byte stream per physical port, exchanged
//!   through short [`Session`](transport::Session)s.
//! - **[`arbiter`]**: exclusive access per resource, across tasks and across
//!   processes (advisory `flock` on a sidecar file).
//! - **[`driver`]**: the [`Driver`] trait vendors implement, plus factories.
//! - **[`motion`]**: [`MotionDevice`], adding offset, presets, retries and
//!   observer updates on top of a driver.
//! - **[`composite`]**: [`CompositeDevice`], several motion devices with
//!   joint presets.
//! - **[`store`]**: TOML device files.
//!
//! ## Example
//!
//! ```rust,no_run
//! use devctl_core::{ConfigSelector, DriverRegistry, MotionDevice, PortRegistry};
//! use devctl_core::mock::SimulatedStageFactory;
//! use std::path::Path;
//! # async fn example() -> Result<(), devctl_core::DeviceError> {
//! let mut drivers = DriverRegistry::new(PortRegistry::global());
//! drivers.register_factory(SimulatedStageFactory);
//!
//! let stage = MotionDevice::from_config(Path::new("config/devices/mock_stage.toml"), &drivers).await?;
//! stage.move_configuration(&ConfigSelector::from("open"), true).await?;
//! println!("{}", stage.get_status().await?.status_line());
//! # Ok(())
//! # }
//! ```

pub mod arbiter;
pub mod composite;
pub mod configuration;
pub mod driver;
pub mod error;
pub mod mock;
pub mod motion;
pub mod observer;
pub mod retry;
pub mod settings;
pub mod state;
pub mod store;
pub mod transport;

pub use arbiter::{ArbiterSettings, PortArbiter, PortLease, ResourceId};
pub use composite::{AxisOptions, CompositeDevice, CompositeStatus};
pub use configuration::{ConfigSelector, ConfigurationEntry, ConfigurationMatch, JointValue, DEFAULT_TOLERANCE};
pub use driver::{Driver, DriverConfig, DriverFactory, DriverRegistry, DriverSection};
pub use error::{ArbiterError, ConfigError, DeviceError, DeviceResult, DriverError, ErrorKind, TransportError};
pub use motion::{DeviceIdentity, DeviceStatus, MotionDevice, MotionSettings};
pub use observer::{PositionObserver, PositionUpdate, SharedObserver};
pub use retry::RetryPolicy;
pub use settings::{LogFormat, LoggingSettings, RuntimeSettings};
pub use state::{DriverState, MotionPhase};
pub use store::{CompositeFile, ConfigStore, DeviceFile, DocumentKind};
pub use transport::{DynSerial, PortRegistry, SerialSettings, Session, Transport};
