//! Vendor driver interface and factory registry.
//!
//! Every protocol family implements [`Driver`]. A [`MotionDevice`] holds an
//! `Arc<dyn Driver>` and never a concrete type. Drivers deal only in raw
//! hardware units: offsets, configuration tables and observers live in the
//! device layer.
//!
//! Drivers are created from configuration through a [`DriverFactory`]
//! registered once at startup:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  main.rs                                     │
//! │  drivers.register_factory(ConexFactory);     │
//! │  drivers.register_factory(FilterWheelFactory)│
//! └──────────────────────────────────────────────┘
//!                      │
//!                      ▼
//! ┌──────────────────────────────────────────────┐
//! │  DriverRegistry                              │
//! │  factories: HashMap<type, Arc<dyn Factory>>  │
//! │  ports: Arc<PortRegistry>                    │
//! └──────────────────────────────────────────────┘
//!                      │  [driver] type = "conex"
//!                      ▼
//! ┌──────────────────────────────────────────────┐
//! │  DriverFactory::build(config, ports)         │
//! │  opens/reuses the port, returns dyn Driver   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! [`MotionDevice`]: crate::motion::MotionDevice

use crate::error::DriverError;
use crate::state::DriverState;
use crate::transport::{PortRegistry, SerialSettings};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

// =============================================================================
// Driver Trait
// =============================================================================

/// Abstract operations every vendor protocol provides, in raw units.
///
/// Each method performs exactly one logical exchange and must take the port
/// lease for that exchange only. Motion commands return once the controller
/// has accepted them; waiting for completion is done by the caller polling
/// [`Driver::get_state`].
#[async_trait]
pub trait Driver: Send + Sync {
    /// Driver type as written in configuration (`"conex"`, `"zaber_binary"`...).
    fn kind(&self) -> &'static str;

    /// Current raw position (live hardware query).
    async fn get_position(&self) -> Result<f64, DriverError>;

    /// Commanded target in raw units.
    async fn get_target_position(&self) -> Result<f64, DriverError> {
        Err(DriverError::Unsupported)
    }

    /// Issue an absolute move to `raw`.
    async fn move_absolute(&self, raw: f64) -> Result<(), DriverError>;

    /// Issue a move by `delta` from the current raw position.
    async fn move_relative(&self, delta: f64) -> Result<(), DriverError>;

    /// Start the reference (homing) sequence.
    async fn home(&self) -> Result<(), DriverError>;

    /// Stop motion immediately.
    async fn stop(&self) -> Result<(), DriverError>;

    /// Fresh protocol state.
    async fn get_state(&self) -> Result<DriverState, DriverError>;

    /// Reset the controller.
    async fn reset(&self) -> Result<(), DriverError> {
        Err(DriverError::Unsupported)
    }

    /// Controller identification string.
    async fn identify(&self) -> Result<String, DriverError> {
        Err(DriverError::Unsupported)
    }

    /// Reject targets the hardware cannot reach, before anything is sent.
    fn validate_target(&self, _raw: f64) -> Result<(), DriverError> {
        Ok(())
    }
}

// =============================================================================
// Driver Configuration
// =============================================================================

/// `[driver]` section of a device file: the type plus free-form options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverSection {
    /// Driver type (`type = "..."`), the registry key.
    #[serde(rename = "type")]
    pub kind: String,
    /// Every other key, interpreted by the factory.
    #[serde(flatten)]
    pub options: toml::Table,
}

impl DriverSection {
    /// Section for driver type `kind` with no options.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            options: toml::Table::new(),
        }
    }

    /// Add one option.
    pub fn with_option(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }
}

/// Everything a factory needs to build one driver.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Name of the device the driver is built for (used in messages).
    pub device: String,
    /// The `[driver]` section.
    pub section: DriverSection,
    /// The `[serial]` section, if the device has one.
    pub serial: Option<SerialSettings>,
}

impl DriverConfig {
    /// Config for `device`.
    pub fn new(device: impl Into<String>, section: DriverSection, serial: Option<SerialSettings>) -> Self {
        Self {
            device: device.into(),
            section,
            serial,
        }
    }

    /// Driver type.
    pub fn kind(&self) -> &str {
        &self.section.kind
    }

    /// Raw option value.
    pub fn option(&self, key: &str) -> Option<&toml::Value> {
        self.section.options.get(key)
    }

    /// String option; wrong type is an error, absence is `None`.
    pub fn option_str(&self, key: &str) -> anyhow::Result<Option<&str>> {
        match self.option(key) {
            None => Ok(None),
            Some(value) => value
                .as_str()
                .map(Some)
                .ok_or_else(|| anyhow!("driver option '{key}' must be a string")),
        }
    }

    /// Integer option.
    pub fn option_i64(&self, key: &str) -> anyhow::Result<Option<i64>> {
        match self.option(key) {
            None => Ok(None),
            Some(value) => value
                .as_integer()
                .map(Some)
                .ok_or_else(|| anyhow!("driver option '{key}' must be an integer")),
        }
    }

    /// Numeric option; integers are accepted.
    pub fn option_f64(&self, key: &str) -> anyhow::Result<Option<f64>> {
        match self.option(key) {
            None => Ok(None),
            Some(toml::Value::Float(v)) => Ok(Some(*v)),
            Some(toml::Value::Integer(v)) => Ok(Some(*v as f64)),
            Some(_) => Err(anyhow!("driver option '{key}' must be a number")),
        }
    }

    /// Boolean option.
    pub fn option_bool(&self, key: &str) -> anyhow::Result<Option<bool>> {
        match self.option(key) {
            None => Ok(None),
            Some(value) => value
                .as_bool()
                .map(Some)
                .ok_or_else(|| anyhow!("driver option '{key}' must be true or false")),
        }
    }

    /// The `[serial]` section, which most hardware drivers require.
    pub fn require_serial(&self) -> anyhow::Result<&SerialSettings> {
        self.serial
            .as_ref()
            .ok_or_else(|| anyhow!("{} driver requires a [serial] section", self.section.kind))
    }
}

// =============================================================================
// Driver Factory
// =============================================================================

/// Creates drivers of one type from configuration.
///
/// Factories are registered once at startup and must not hold mutable state
/// across builds. Shared serial ports come from the [`PortRegistry`] passed to
/// `build`.
pub trait DriverFactory: Send + Sync + 'static {
    /// Value of `type` in the `[driver]` section.
    fn driver_type(&self) -> &'static str;

    /// Human-readable name for documentation and error messages.
    fn name(&self) -> &'static str;

    /// Check options without touching hardware.
    fn validate(&self, config: &DriverConfig) -> anyhow::Result<()>;

    /// Open (or reuse) the transport and construct the driver.
    fn build(
        &self,
        config: DriverConfig,
        ports: Arc<PortRegistry>,
    ) -> BoxFuture<'static, anyhow::Result<Arc<dyn Driver>>>;
}

/// Lookup table from driver type to factory.
pub struct DriverRegistry {
    factories: HashMap<&'static str, Arc<dyn DriverFactory>>,
    ports: Arc<PortRegistry>,
}

impl DriverRegistry {
    /// Empty registry opening ports through `ports`.
    pub fn new(ports: Arc<PortRegistry>) -> Self {
        Self {
            factories: HashMap::new(),
            ports,
        }
    }

    /// Register a factory, replacing any earlier one for the same type.
    pub fn register_factory(&mut self, factory: impl DriverFactory) {
        let driver_type = factory.driver_type();
        tracing::debug!(driver_type, name = factory.name(), "Registered driver factory");
        self.factories.insert(driver_type, Arc::new(factory));
    }

    /// Whether `driver_type` can be built.
    pub fn has_factory(&self, driver_type: &str) -> bool {
        self.factories.contains_key(driver_type)
    }

    /// Registered driver types, sorted.
    pub fn driver_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.factories.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Port registry handed to every factory.
    pub fn ports(&self) -> &Arc<PortRegistry> {
        &self.ports
    }

    /// Validate and build the driver described by `config`.
    pub async fn build(&self, config: DriverConfig) -> anyhow::Result<Arc<dyn Driver>> {
        let factory = self.factories.get(config.kind()).cloned().ok_or_else(|| {
            anyhow!(
                "unknown driver type '{}' (registered: {})",
                config.kind(),
                self.driver_types().join(", ")
            )
        })?;

        factory
            .validate(&config)
            .with_context(|| format!("invalid [driver] section for {}", factory.name()))?;

        let device = config.device.clone();
        let driver = factory
            .build(config, self.ports.clone())
            .await
            .with_context(|| format!("failed to initialise {} for {}", factory.name(), device))?;

        tracing::info!(device = %device, driver = driver.kind(), "Driver ready");
        Ok(driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_section_flattens_options() {
        let section: DriverSection = toml::from_str(
            r#"
            type = "conex"
            address = 1
            axis = "U"
            "#,
        )
        .unwrap();
        assert_eq!(section.kind, "conex");
        assert_eq!(section.options.get("address").and_then(|v| v.as_integer()), Some(1));

        let config = DriverConfig::new("stage", section, None);
        assert_eq!(config.option_str("axis").unwrap(), Some("U"));
        assert_eq!(config.option_f64("address").unwrap(), Some(1.0));
        assert!(config.option_bool("axis").is_err());
        assert!(config.require_serial().is_err());
    }

    #[tokio::test]
    async fn test_unknown_driver_type_lists_registered() {
        let registry = DriverRegistry::new(Arc::new(PortRegistry::process_local()));
        let config = DriverConfig::new("stage", DriverSection::new("nope"), None);
        let err = registry.build(config).await.err().unwrap();
        assert!(err.to_string().contains("unknown driver type 'nope'"));
    }
}
