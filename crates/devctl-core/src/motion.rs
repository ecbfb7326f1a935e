//! Motion Device: one axis of motion with offset, presets and retries.
//!
//! A [`MotionDevice`] wraps an `Arc<dyn Driver>` and adds:
//!
//! - an **offset**: `logical = raw + offset` on every read, `raw = logical - offset`
//!   on every absolute write (relative moves are deltas and pass through);
//! - a **named configuration table** with lookup by index/name and reverse
//!   lookup by position;
//! - the [`RetryPolicy`] around every driver exchange;
//! - a [`PositionObserver`] notified after every position query or change.
//!
//! Moves refuse to start on an unreferenced or disabled controller
//! ([`DeviceError::Precondition`]) and wait for a busy controller to become
//! idle first. A `wait=true` move polls state and position once per poll
//! interval, each as its own exchange, so the port is free between polls and a
//! `stop()` from another task gets through.
//!
//! [`PositionObserver`]: crate::observer::PositionObserver

use crate::configuration::{
    find_entry, match_scalar, upsert_entry, ConfigSelector, ConfigurationEntry, ConfigurationMatch,
    DEFAULT_TOLERANCE,
};
use crate::driver::{Driver, DriverConfig, DriverRegistry, DriverSection};
use crate::error::{ConfigError, DeviceError, DeviceResult, DriverError};
use crate::observer::{notify, PositionUpdate, SharedObserver};
use crate::retry::RetryPolicy;
use crate::state::DriverState;
use crate::store::{AxisFile, ConfigStore, DeviceFile};
use crate::transport::SerialSettings;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::instrument;

// =============================================================================
// Identity & Settings
// =============================================================================

/// Name, unit, offset and preset table of a device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    /// Device name used in messages and status lines.
    pub name: String,
    /// Display unit.
    pub unit: Option<String>,
    /// Added to raw positions to give logical positions.
    pub offset: f64,
    /// Presets, kept sorted by index.
    pub configurations: Vec<ConfigurationEntry<f64>>,
}

impl DeviceIdentity {
    /// Identity with no unit, offset or presets.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: None,
            offset: 0.0,
            configurations: Vec::new(),
        }
    }

    /// Set the display unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Set the offset.
    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    /// Set the preset table.
    pub fn with_configurations(mut self, configurations: Vec<ConfigurationEntry<f64>>) -> Self {
        self.configurations = configurations;
        self
    }
}

impl From<&DeviceFile> for DeviceIdentity {
    fn from(file: &DeviceFile) -> Self {
        Self {
            name: file.name.clone(),
            unit: file.unit.clone(),
            offset: file.offset,
            configurations: file.configurations.clone(),
        }
    }
}

/// Polling behaviour of `wait=true` moves (`[motion]` in the runtime settings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionSettings {
    /// Delay between state polls.
    pub poll_interval_ms: u64,
    /// Give up waiting after this long; `None` waits forever.
    pub wait_timeout_ms: Option<u64>,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            wait_timeout_ms: Some(300_000),
        }
    }
}

impl MotionSettings {
    /// Delay between state polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Bound on a `wait=true` move, if any.
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }
}

/// Snapshot returned by [`MotionDevice::get_status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Device name.
    pub name: String,
    /// Display unit.
    pub unit: Option<String>,
    /// Logical position.
    pub position: f64,
    /// Index of the matching preset.
    pub index: Option<u32>,
    /// Name of the matching preset, or `Unknown`.
    pub configuration: String,
}

impl DeviceStatus {
    /// `"<idx>: <name> {<position> <unit>}"`, with `-` for an unknown index.
    pub fn status_line(&self) -> String {
        let idx = self.index.map_or_else(|| "-".to_string(), |i| i.to_string());
        match &self.unit {
            Some(unit) => format!("{}: {} {{{} {}}}", idx, self.configuration, self.position, unit),
            None => format!("{}: {} {{{}}}", idx, self.configuration, self.position),
        }
    }
}

// =============================================================================
// Motion Device
// =============================================================================

/// One logical axis of motion.
pub struct MotionDevice {
    identity: RwLock<DeviceIdentity>,
    driver: Arc<dyn Driver>,
    retry: RetryPolicy,
    motion: MotionSettings,
    observer: Option<SharedObserver>,
    config_path: Option<PathBuf>,
    serial: Option<SerialSettings>,
    driver_section: DriverSection,
}

impl MotionDevice {
    /// Device with default retry and motion settings, no observer and no backing file.
    pub fn new(identity: DeviceIdentity, driver: Arc<dyn Driver>) -> Self {
        let driver_section = DriverSection::new(driver.kind());
        Self {
            identity: RwLock::new(identity),
            driver,
            retry: RetryPolicy::default(),
            motion: MotionSettings::default(),
            observer: None,
            config_path: None,
            serial: None,
            driver_section,
        }
    }

    /// Retry policy wrapped around every exchange.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Polling interval and wait bound.
    pub fn with_motion_settings(mut self, motion: MotionSettings) -> Self {
        self.motion = motion;
        self
    }

    /// Observer called after every position query and poll.
    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// File that `save_config` and `save_configuration` write to.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Transport and driver sections written back on save.
    pub fn with_sections(mut self, serial: Option<SerialSettings>, driver: DriverSection) -> Self {
        self.serial = serial;
        self.driver_section = driver;
        self
    }

    /// Load a device file and build its driver through `drivers`.
    pub async fn from_config(path: &Path, drivers: &DriverRegistry) -> DeviceResult<Self> {
        let file = ConfigStore::load_device(path).map_err(|source| DeviceError::Config {
            device: path.display().to_string(),
            operation: "load",
            source,
        })?;
        let device = Self::from_file(file, drivers).await?;
        Ok(device.with_config_path(path))
    }

    /// Build from an already-parsed device file.
    pub async fn from_file(file: DeviceFile, drivers: &DriverRegistry) -> DeviceResult<Self> {
        let identity = DeviceIdentity::from(&file);
        let config = DriverConfig::new(file.name.clone(), file.driver.clone(), file.serial.clone());
        let driver = drivers.build(config).await.map_err(|source| DeviceError::Setup {
            device: file.name.clone(),
            operation: "connect",
            source,
        })?;
        Ok(Self::new(identity, driver).with_sections(file.serial, file.driver))
    }

    /// Build one axis of a composite.
    pub(crate) async fn from_axis(
        composite: &str,
        axis: &AxisFile,
        drivers: &DriverRegistry,
    ) -> DeviceResult<Self> {
        let name = format!("{}_{}", composite, axis.name);
        let identity = DeviceIdentity {
            name: name.clone(),
            unit: axis.unit.clone(),
            offset: axis.offset,
            configurations: axis.configurations.clone(),
        };
        let config = DriverConfig::new(name.clone(), axis.driver.clone(), axis.serial.clone());
        let driver = drivers.build(config).await.map_err(|source| DeviceError::Setup {
            device: name,
            operation: "connect",
            source,
        })?;
        Ok(Self::new(identity, driver).with_sections(axis.serial.clone(), axis.driver.clone()))
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Device name.
    pub fn name(&self) -> String {
        self.identity.read().name.clone()
    }

    /// Rename the device.
    pub fn set_name(&self, name: impl Into<String>) {
        self.identity.write().name = name.into();
    }

    /// Display unit.
    pub fn unit(&self) -> Option<String> {
        self.identity.read().unit.clone()
    }

    /// Change the display unit.
    pub fn set_unit(&self, unit: Option<String>) {
        self.identity.write().unit = unit;
    }

    /// Logical minus raw position.
    pub fn offset(&self) -> f64 {
        self.identity.read().offset
    }

    /// Change the offset; presets stay in logical units.
    pub fn set_offset(&self, offset: f64) {
        self.identity.write().offset = offset;
    }

    /// Copy of the preset table.
    pub fn configurations(&self) -> Vec<ConfigurationEntry<f64>> {
        self.identity.read().configurations.clone()
    }

    /// Copy of the identity.
    pub fn identity(&self) -> DeviceIdentity {
        self.identity.read().clone()
    }

    /// Driver type, e.g. `conex`.
    pub fn driver_kind(&self) -> &'static str {
        self.driver.kind()
    }

    /// Backing file, if any.
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Polling settings in use.
    pub fn motion_settings(&self) -> &MotionSettings {
        &self.motion
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Run one driver exchange under the retry policy.
    async fn call<T, F, Fut>(&self, operation: &'static str, op: F) -> DeviceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        match self.retry.run(operation, op).await {
            Ok((value, _attempts)) => Ok(value),
            Err(exhausted) => Err(DeviceError::from_driver(
                &self.name(),
                operation,
                self.driver.kind(),
                exhausted.attempts,
                exhausted.error,
            )),
        }
    }

    fn invalid_input(&self, operation: &'static str, reason: impl Into<String>) -> DeviceError {
        DeviceError::InvalidInput {
            device: self.name(),
            operation,
            reason: reason.into(),
        }
    }

    fn check_target(&self, operation: &'static str, raw: f64) -> DeviceResult<()> {
        self.driver
            .validate_target(raw)
            .map_err(|e| DeviceError::from_driver(&self.name(), operation, self.driver.kind(), 1, e))
    }

    fn notify(&self, logical: f64) {
        notify(self.observer.as_ref(), &self.name(), PositionUpdate::Single(logical));
    }

    /// Re-read the position for the observer; failures are logged only.
    async fn refresh_observer(&self, operation: &'static str) {
        if self.observer.is_none() {
            return;
        }
        match self.call(operation, || self.driver.get_position()).await {
            Ok(raw) => self.notify(raw + self.offset()),
            Err(e) => tracing::warn!(error = %e, "Position refresh after {} failed", operation),
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.motion.wait_timeout().map(|t| Instant::now() + t)
    }

    fn timed_out(&self, operation: &'static str) -> DeviceError {
        DeviceError::MotionTimeout {
            device: self.name(),
            operation,
            timeout: self.motion.wait_timeout().unwrap_or_default(),
        }
    }

    fn precondition(&self, operation: &'static str, state: &DriverState) -> Option<DeviceError> {
        let reason = if state.needs_homing() {
            format!("controller is not referenced ({}); home it first", state)
        } else if !state.is_enabled() {
            format!("controller is disabled ({})", state)
        } else {
            return None;
        };
        Some(DeviceError::Precondition {
            device: self.name(),
            operation,
            reason,
        })
    }

    /// Reject unreferenced/disabled controllers and wait out a busy one.
    async fn ensure_ready(&self, operation: &'static str) -> DeviceResult<()> {
        let deadline = self.deadline();
        loop {
            let state = self.call(operation, || self.driver.get_state()).await?;
            if let Some(err) = self.precondition(operation, &state) {
                return Err(err);
            }
            if !state.is_busy() {
                return Ok(());
            }
            tracing::debug!(%state, "Controller busy, waiting before {}", operation);
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(self.timed_out(operation));
            }
            tokio::time::sleep(self.motion.poll_interval()).await;
        }
    }

    /// Poll state and position until the controller stops moving/homing.
    async fn wait_until_settled(&self, operation: &'static str) -> DeviceResult<DriverState> {
        let deadline = self.deadline();
        loop {
            let state = self.call(operation, || self.driver.get_state()).await?;
            let raw = self.call(operation, || self.driver.get_position()).await?;
            self.notify(raw + self.offset());

            if !state.is_busy() {
                tracing::debug!(%state, position = raw, "Motion settled");
                return Ok(state);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(self.timed_out(operation));
            }
            tokio::time::sleep(self.motion.poll_interval()).await;
        }
    }

    async fn finish_motion(&self, operation: &'static str, wait: bool) -> DeviceResult<()> {
        if !wait {
            self.refresh_observer(operation).await;
            return Ok(());
        }
        let state = self.wait_until_settled(operation).await?;
        if !state.is_enabled() {
            return Err(DeviceError::Precondition {
                device: self.name(),
                operation,
                reason: format!("controller became disabled during motion ({})", state),
            });
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Live logical position.
    #[instrument(skip(self), fields(device = %self.name()), err)]
    pub async fn get_position(&self) -> DeviceResult<f64> {
        let raw = self.call("get_position", || self.driver.get_position()).await?;
        let logical = raw + self.offset();
        self.notify(logical);
        Ok(logical)
    }

    /// Commanded target, in logical units.
    #[instrument(skip(self), fields(device = %self.name()), err)]
    pub async fn get_target_position(&self) -> DeviceResult<f64> {
        let raw = self
            .call("get_target_position", || self.driver.get_target_position())
            .await?;
        Ok(raw + self.offset())
    }

    /// Move to logical position `value`.
    #[instrument(skip(self), fields(device = %self.name()), err)]
    pub async fn move_absolute(&self, value: f64, wait: bool) -> DeviceResult<()> {
        const OP: &str = "move_absolute";
        if !value.is_finite() {
            return Err(self.invalid_input(OP, format!("target {} is not a finite number", value)));
        }
        let raw = value - self.offset();
        self.check_target(OP, raw)?;
        self.ensure_ready(OP).await?;

        tracing::debug!(logical = value, raw, "Moving");
        self.call(OP, || self.driver.move_absolute(raw)).await?;
        self.finish_motion(OP, wait).await
    }

    /// Move by `delta` from the current position.
    #[instrument(skip(self), fields(device = %self.name()), err)]
    pub async fn move_relative(&self, delta: f64, wait: bool) -> DeviceResult<()> {
        const OP: &str = "move_relative";
        if !delta.is_finite() {
            return Err(self.invalid_input(OP, format!("step {} is not a finite number", delta)));
        }
        let current = self.call(OP, || self.driver.get_position()).await?;
        self.check_target(OP, current + delta)?;
        self.ensure_ready(OP).await?;

        self.call(OP, || self.driver.move_relative(delta)).await?;
        self.finish_motion(OP, wait).await
    }

    /// Run the reference search.
    #[instrument(skip(self), fields(device = %self.name()), err)]
    pub async fn home(&self, wait: bool) -> DeviceResult<()> {
        const OP: &str = "home";
        self.call(OP, || self.driver.home()).await?;
        if !wait {
            self.refresh_observer(OP).await;
            return Ok(());
        }
        let state = self.wait_until_settled(OP).await?;
        if let Some(err) = self.precondition(OP, &state) {
            return Err(err);
        }
        Ok(())
    }

    /// Stop motion now. Never blocked by preconditions.
    #[instrument(skip(self), fields(device = %self.name()), err)]
    pub async fn stop(&self) -> DeviceResult<()> {
        self.call("stop", || self.driver.stop()).await?;
        self.refresh_observer("stop").await;
        Ok(())
    }

    /// Reset the controller.
    #[instrument(skip(self), fields(device = %self.name()), err)]
    pub async fn reset(&self) -> DeviceResult<()> {
        self.call("reset", || self.driver.reset()).await?;
        self.refresh_observer("reset").await;
        Ok(())
    }

    /// Fresh protocol state.
    pub async fn get_state(&self) -> DeviceResult<DriverState> {
        self.call("get_state", || self.driver.get_state()).await
    }

    /// Controller identification string.
    pub async fn identify(&self) -> DeviceResult<String> {
        self.call("identify", || self.driver.identify()).await
    }

    /// Move to the preset chosen by `selector`.
    #[instrument(skip(self), fields(device = %self.name()), err)]
    pub async fn move_configuration(&self, selector: &ConfigSelector, wait: bool) -> DeviceResult<()> {
        let value = {
            let identity = self.identity.read();
            find_entry(&identity.configurations, selector).map(|entry| entry.value)
        };
        let value = value.ok_or_else(|| DeviceError::NotFound {
            device: self.name(),
            operation: "move_configuration",
            key: selector.to_string(),
        })?;
        self.move_absolute(value, wait).await
    }

    /// Preset matching `position` (or the live position), first in table order.
    pub async fn get_configuration(
        &self,
        position: Option<f64>,
        tolerance: Option<f64>,
    ) -> DeviceResult<ConfigurationMatch> {
        let position = match position {
            Some(p) => p,
            None => self.get_position().await?,
        };
        let tolerance = tolerance.unwrap_or(DEFAULT_TOLERANCE);
        let identity = self.identity.read();
        Ok(match_scalar(&identity.configurations, position, tolerance))
    }

    /// Store `position` (or the live position) as a preset and persist.
    ///
    /// Without `index`, the preset currently matching `position` is updated.
    /// Returns the index written.
    #[instrument(skip(self), fields(device = %self.name()), err)]
    pub async fn save_configuration(
        &self,
        position: Option<f64>,
        index: Option<u32>,
        name: Option<&str>,
        tolerance: Option<f64>,
    ) -> DeviceResult<u32> {
        const OP: &str = "save_configuration";
        let position = match position {
            Some(p) => p,
            None => self.get_position().await?,
        };
        if !position.is_finite() {
            return Err(self.invalid_input(OP, format!("position {} is not a finite number", position)));
        }
        let tolerance = tolerance.unwrap_or(DEFAULT_TOLERANCE);

        // Edit a copy; the live table changes only once the file is written.
        let mut configurations = self.identity.read().configurations.clone();
        let inferred = match_scalar(&configurations, position, tolerance).idx;
        let idx = upsert_entry(&mut configurations, index, inferred, name, position)
            .map_err(|e| self.invalid_input(OP, e.to_string()))?;

        if self.config_path.is_some() {
            let mut file = self.to_device_file();
            file.configurations = configurations.clone();
            self.write_file(OP, &file)?;
        } else {
            tracing::debug!("No backing file, configuration kept in memory");
        }
        self.identity.write().configurations = configurations;
        tracing::info!(idx, position, "Saved configuration");
        self.notify(position);
        Ok(idx)
    }

    /// Current position plus reverse lookup.
    pub async fn get_status(&self) -> DeviceResult<DeviceStatus> {
        let position = self.get_position().await?;
        let identity = self.identity.read();
        let found = match_scalar(&identity.configurations, position, DEFAULT_TOLERANCE);
        Ok(DeviceStatus {
            name: identity.name.clone(),
            unit: identity.unit.clone(),
            position,
            index: found.idx,
            configuration: found.name,
        })
    }

    /// Persist the current identity to the backing file.
    pub fn save_config(&self) -> DeviceResult<()> {
        self.persist("save_config")
    }

    fn persist(&self, operation: &'static str) -> DeviceResult<()> {
        self.write_file(operation, &self.to_device_file())
    }

    fn write_file(&self, operation: &'static str, file: &DeviceFile) -> DeviceResult<()> {
        let path = self.config_path.as_deref().ok_or_else(|| DeviceError::Config {
            device: self.name(),
            operation,
            source: ConfigError::NoBackingFile,
        })?;
        ConfigStore::save(path, file).map_err(|source| DeviceError::Config {
            device: self.name(),
            operation,
            source,
        })
    }

    /// Device file describing this device as it is now.
    pub fn to_device_file(&self) -> DeviceFile {
        let identity = self.identity.read();
        DeviceFile {
            name: identity.name.clone(),
            unit: identity.unit.clone(),
            offset: identity.offset,
            serial: self.serial.clone(),
            driver: self.driver_section.clone(),
            configurations: identity.configurations.clone(),
        }
    }

    /// Composite `[[devices]]` entry for this device under `axis`.
    pub(crate) fn to_axis_file(&self, axis: &str) -> AxisFile {
        let identity = self.identity.read();
        AxisFile {
            name: axis.to_string(),
            unit: identity.unit.clone(),
            offset: identity.offset,
            serial: self.serial.clone(),
            driver: self.driver_section.clone(),
            configurations: identity.configurations.clone(),
        }
    }
}

impl std::fmt::Debug for MotionDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotionDevice")
            .field("identity", &*self.identity.read())
            .field("driver", &self.driver.kind())
            .field("config_path", &self.config_path)
            .finish_non_exhaustive()
    }
}
