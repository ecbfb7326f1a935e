//! Building devices from configuration files.

use anyhow::{bail, Result};
use devctl_core::mock::SimulatedStageFactory;
use devctl_core::observer::TracingObserver;
use devctl_core::{
    AxisOptions, CompositeDevice, ConfigStore, DeviceResult, DocumentKind, DriverRegistry, MotionDevice,
    PortRegistry, RuntimeSettings, SharedObserver,
};
use devctl_driver_newport::ConexFactory;
use devctl_driver_thorlabs::{ElliptecFactory, FilterWheelFactory, FlipMountFactory};
use devctl_driver_zaber::ZaberFactory;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Registry with every driver this binary ships.
pub fn driver_registry(ports: Arc<PortRegistry>) -> DriverRegistry {
    let mut drivers = DriverRegistry::new(ports);
    drivers.register_factory(SimulatedStageFactory);
    drivers.register_factory(ConexFactory);
    drivers.register_factory(FilterWheelFactory);
    drivers.register_factory(FlipMountFactory);
    drivers.register_factory(ElliptecFactory);
    drivers.register_factory(ZaberFactory);
    tracing::debug!(types = ?drivers.driver_types(), "Driver factories registered");
    drivers
}

/// A loaded configuration file.
pub enum Target {
    /// Single-axis device file.
    Single(MotionDevice),
    /// Composite file.
    Composite(CompositeDevice),
}

impl Target {
    /// Load `path` as a single device or a composite, whichever it holds.
    pub async fn open(path: &Path, drivers: &DriverRegistry, settings: &RuntimeSettings) -> Result<Self> {
        let observer: SharedObserver = Arc::new(TracingObserver);
        match ConfigStore::document_kind(path)? {
            DocumentKind::Device => {
                let device = MotionDevice::from_config(path, drivers)
                    .await?
                    .with_retry(settings.retry.clone())
                    .with_motion_settings(settings.motion.clone())
                    .with_observer(observer);
                Ok(Target::Single(device))
            }
            DocumentKind::Composite => {
                let options = AxisOptions {
                    retry: settings.retry.clone(),
                    motion: settings.motion.clone(),
                    observers: BTreeMap::new(),
                };
                let composite = CompositeDevice::from_config(path, drivers, &options)
                    .await?
                    .with_observer(observer);
                Ok(Target::Composite(composite))
            }
        }
    }

    /// Device name.
    pub fn name(&self) -> String {
        match self {
            Target::Single(device) => device.name(),
            Target::Composite(composite) => composite.name().to_string(),
        }
    }

    /// The device an `--axis` option designates.
    pub fn axis(&self, axis: &str) -> Result<&MotionDevice> {
        match self {
            Target::Single(device) => bail!(
                "--axis {} given, but {} is a single device",
                axis,
                device.name()
            ),
            Target::Composite(composite) => Ok(composite.axis(axis)?.as_ref()),
        }
    }

    /// Stop the selected axis, or everything.
    pub async fn stop(&self, axis: Option<&str>) -> DeviceResult<()> {
        match self {
            Target::Single(device) => device.stop().await,
            Target::Composite(composite) => composite.stop(axis).await,
        }
    }
}
