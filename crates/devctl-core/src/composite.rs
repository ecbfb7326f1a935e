//! Multi-axis composite device.
//!
//! A [`CompositeDevice`] presents several [`MotionDevice`]s under one name,
//! with joint presets whose value maps axis name to logical position.
//!
//! Joint lookups AND across axes: an entry matches only when every axis it
//! lists is within tolerance. Joint moves go axis by axis in the declared axis
//! order. The first failing axis stops the sequence: every axis is sent a
//! best-effort stop and the error is returned.

use crate::configuration::{
    find_entry, match_joint, upsert_entry, ConfigSelector, ConfigurationEntry, ConfigurationMatch,
    JointValue, DEFAULT_TOLERANCE,
};
use crate::driver::DriverRegistry;
use crate::error::{ConfigError, DeviceError, DeviceResult};
use crate::motion::{MotionDevice, MotionSettings};
use crate::observer::{notify, PositionUpdate, SharedObserver};
use crate::retry::RetryPolicy;
use crate::store::{CompositeFile, ConfigStore};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::instrument;

/// Settings applied to every axis when building from a file.
#[derive(Clone, Default)]
pub struct AxisOptions {
    /// Retry policy for every axis.
    pub retry: RetryPolicy,
    /// Polling behaviour for every axis.
    pub motion: MotionSettings,
    /// Observer per axis name.
    pub observers: BTreeMap<String, SharedObserver>,
}

/// Snapshot returned by [`CompositeDevice::get_status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeStatus {
    /// Composite device name.
    pub name: String,
    /// Logical position per axis.
    pub positions: BTreeMap<String, f64>,
    /// Index of the matching joint preset.
    pub index: Option<u32>,
    /// Name of the matching joint preset, or `Unknown`.
    pub configuration: String,
}

impl CompositeStatus {
    /// `"<idx>: <name> {<axis>=<position>, ...}"`.
    pub fn status_line(&self) -> String {
        let idx = self.index.map_or_else(|| "-".to_string(), |i| i.to_string());
        let positions: Vec<String> = self
            .positions
            .iter()
            .map(|(axis, position)| format!("{}={}", axis, position))
            .collect();
        format!("{}: {} {{{}}}", idx, self.configuration, positions.join(", "))
    }
}

/// Several motion devices under one logical name.
pub struct CompositeDevice {
    name: String,
    axes: Vec<(String, Arc<MotionDevice>)>,
    configurations: RwLock<Vec<ConfigurationEntry<JointValue>>>,
    observer: Option<SharedObserver>,
    config_path: Option<PathBuf>,
}

impl CompositeDevice {
    /// `axes` keeps its order; it is the order joint moves run in.
    pub fn new(
        name: impl Into<String>,
        axes: Vec<(String, Arc<MotionDevice>)>,
        configurations: Vec<ConfigurationEntry<JointValue>>,
    ) -> Self {
        Self {
            name: name.into(),
            axes,
            configurations: RwLock::new(configurations),
            observer: None,
            config_path: None,
        }
    }

    /// Observer receiving the joint position map.
    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// File that `save_config` and `save_configuration` write to.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Load a composite file and build every axis.
    pub async fn from_config(path: &Path, drivers: &DriverRegistry, options: &AxisOptions) -> DeviceResult<Self> {
        let file = ConfigStore::load_composite(path).map_err(|source| DeviceError::Config {
            device: path.display().to_string(),
            operation: "load",
            source,
        })?;
        let device = Self::from_file(file, drivers, options).await?;
        Ok(device.with_config_path(path))
    }

    /// Build every axis of an already loaded composite file.
    pub async fn from_file(file: CompositeFile, drivers: &DriverRegistry, options: &AxisOptions) -> DeviceResult<Self> {
        let mut axes = Vec::with_capacity(file.devices.len());
        for axis in &file.devices {
            let mut device = MotionDevice::from_axis(&file.name, axis, drivers)
                .await?
                .with_retry(options.retry.clone())
                .with_motion_settings(options.motion.clone());
            if let Some(observer) = options.observers.get(&axis.name) {
                device = device.with_observer(observer.clone());
            }
            axes.push((axis.name.clone(), Arc::new(device)));
        }
        tracing::info!(device = %file.name, axes = axes.len(), "Composite device ready");
        Ok(Self::new(file.name, axes, file.configurations))
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Composite device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Axis names in declared order.
    pub fn axes(&self) -> Vec<String> {
        self.axes.iter().map(|(axis, _)| axis.clone()).collect()
    }

    /// Sub-device for `axis`.
    pub fn axis(&self, axis: &str) -> DeviceResult<&Arc<MotionDevice>> {
        self.axes
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, device)| device)
            .ok_or_else(|| DeviceError::InvalidInput {
                device: self.name.clone(),
                operation: "axis",
                reason: format!("unknown axis '{}' (axes: {})", axis, self.axes().join(", ")),
            })
    }

    /// Copy of the joint preset table.
    pub fn configurations(&self) -> Vec<ConfigurationEntry<JointValue>> {
        self.configurations.read().clone()
    }

    /// Backing file, if any.
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    // -------------------------------------------------------------------------
    // Per-axis operations
    // -------------------------------------------------------------------------

    /// Refresh the joint observer; failures are logged only.
    async fn update_joint(&self) {
        if self.observer.is_none() {
            return;
        }
        if let Err(e) = self.get_positions().await {
            tracing::warn!(device = %self.name, error = %e, "Joint position refresh failed");
        }
    }

    /// Logical position of one axis.
    pub async fn get_position(&self, axis: &str) -> DeviceResult<f64> {
        let position = self.axis(axis)?.get_position().await?;
        self.update_joint().await;
        Ok(position)
    }

    /// Logical position of every axis.
    pub async fn get_positions(&self) -> DeviceResult<BTreeMap<String, f64>> {
        let mut positions = BTreeMap::new();
        for (axis, device) in &self.axes {
            positions.insert(axis.clone(), device.get_position().await?);
        }
        notify(self.observer.as_ref(), &self.name, PositionUpdate::Joint(positions.clone()));
        Ok(positions)
    }

    /// Move one axis to a logical position.
    #[instrument(skip(self), fields(device = %self.name), err)]
    pub async fn move_absolute(&self, axis: &str, value: f64, wait: bool) -> DeviceResult<()> {
        self.axis(axis)?.move_absolute(value, wait).await?;
        self.update_joint().await;
        Ok(())
    }

    /// Move one axis by `delta`.
    #[instrument(skip(self), fields(device = %self.name), err)]
    pub async fn move_relative(&self, axis: &str, delta: f64, wait: bool) -> DeviceResult<()> {
        self.axis(axis)?.move_relative(delta, wait).await?;
        self.update_joint().await;
        Ok(())
    }

    /// Run the reference search on one axis.
    #[instrument(skip(self), fields(device = %self.name), err)]
    pub async fn home(&self, axis: &str, wait: bool) -> DeviceResult<()> {
        self.axis(axis)?.home(wait).await?;
        self.update_joint().await;
        Ok(())
    }

    /// Stop one axis, or every axis when `axis` is `None`.
    ///
    /// Stopping every axis carries on past failures and reports the first.
    #[instrument(skip(self), fields(device = %self.name), err)]
    pub async fn stop(&self, axis: Option<&str>) -> DeviceResult<()> {
        let result = match axis {
            Some(axis) => self.axis(axis)?.stop().await,
            None => self.stop_all().await,
        };
        self.update_joint().await;
        result
    }

    async fn stop_all(&self) -> DeviceResult<()> {
        let mut first_error = None;
        for (axis, device) in &self.axes {
            if let Err(e) = device.stop().await {
                tracing::warn!(device = %self.name, axis = %axis, error = %e, "Stop failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // -------------------------------------------------------------------------
    // Joint configurations
    // -------------------------------------------------------------------------

    /// Joint preset matching `positions` (or the live positions).
    pub async fn get_configuration(
        &self,
        positions: Option<&BTreeMap<String, f64>>,
        tolerance: Option<f64>,
    ) -> DeviceResult<ConfigurationMatch> {
        let live;
        let positions = match positions {
            Some(p) => p,
            None => {
                live = self.get_positions().await?;
                &live
            }
        };
        let tolerance = tolerance.unwrap_or(DEFAULT_TOLERANCE);
        Ok(match_joint(&self.configurations.read(), positions, tolerance))
    }

    /// Move every axis listed in the selected preset.
    #[instrument(skip(self), fields(device = %self.name), err)]
    pub async fn move_configuration(&self, selector: &ConfigSelector, wait: bool) -> DeviceResult<()> {
        const OP: &str = "move_configuration";
        let value = {
            let configurations = self.configurations.read();
            find_entry(&configurations, selector).map(|entry| entry.value.clone())
        };
        let value = value.ok_or_else(|| DeviceError::NotFound {
            device: self.name.clone(),
            operation: OP,
            key: selector.to_string(),
        })?;
        self.check_axes(OP, value.keys())?;

        for (axis, device) in &self.axes {
            let Some(target) = value.get(axis) else {
                continue;
            };
            tracing::debug!(axis = %axis, target, "Joint move");
            if let Err(e) = device.move_absolute(*target, wait).await {
                tracing::warn!(axis = %axis, error = %e, "Joint move failed, stopping all axes");
                if let Err(stop_err) = self.stop_all().await {
                    tracing::warn!(error = %stop_err, "Stop after failed joint move also failed");
                }
                self.update_joint().await;
                return Err(e);
            }
            self.update_joint().await;
        }
        Ok(())
    }

    /// Store `positions` (or the live positions) as a joint preset and persist.
    #[instrument(skip(self, positions), fields(device = %self.name), err)]
    pub async fn save_configuration(
        &self,
        positions: Option<BTreeMap<String, f64>>,
        index: Option<u32>,
        name: Option<&str>,
        tolerance: Option<f64>,
    ) -> DeviceResult<u32> {
        const OP: &str = "save_configuration";
        let positions = match positions {
            Some(p) => p,
            None => self.get_positions().await?,
        };
        self.check_axes(OP, positions.keys())?;
        if positions.is_empty() {
            return Err(self.invalid_input(OP, "no axis positions given"));
        }
        let tolerance = tolerance.unwrap_or(DEFAULT_TOLERANCE);

        let mut configurations = self.configurations();
        let inferred = match_joint(&configurations, &positions, tolerance).idx;
        let idx = upsert_entry(&mut configurations, index, inferred, name, positions.clone())
            .map_err(|e| self.invalid_input(OP, e.to_string()))?;

        if self.config_path.is_some() {
            let mut file = self.to_composite_file();
            file.configurations = configurations.clone();
            self.write_file(OP, &file)?;
        }
        *self.configurations.write() = configurations;
        tracing::info!(idx, ?positions, "Saved joint configuration");
        notify(self.observer.as_ref(), &self.name, PositionUpdate::Joint(positions));
        Ok(idx)
    }

    /// All axis positions plus joint reverse lookup.
    pub async fn get_status(&self) -> DeviceResult<CompositeStatus> {
        let positions = self.get_positions().await?;
        let found = match_joint(&self.configurations.read(), &positions, DEFAULT_TOLERANCE);
        Ok(CompositeStatus {
            name: self.name.clone(),
            positions,
            index: found.idx,
            configuration: found.name,
        })
    }

    /// Persist the composite and every axis to the backing file.
    pub fn save_config(&self) -> DeviceResult<()> {
        self.persist("save_config")
    }

    fn persist(&self, operation: &'static str) -> DeviceResult<()> {
        self.write_file(operation, &self.to_composite_file())
    }

    fn write_file(&self, operation: &'static str, file: &CompositeFile) -> DeviceResult<()> {
        let path = self.config_path.as_deref().ok_or_else(|| DeviceError::Config {
            device: self.name.clone(),
            operation,
            source: ConfigError::NoBackingFile,
        })?;
        ConfigStore::save(path, file).map_err(|source| DeviceError::Config {
            device: self.name.clone(),
            operation,
            source,
        })
    }

    /// Composite file describing the device as it is now.
    pub fn to_composite_file(&self) -> CompositeFile {
        CompositeFile {
            name: self.name.clone(),
            devices: self
                .axes
                .iter()
                .map(|(axis, device)| device.to_axis_file(axis))
                .collect(),
            configurations: self.configurations(),
        }
    }

    fn invalid_input(&self, operation: &'static str, reason: impl Into<String>) -> DeviceError {
        DeviceError::InvalidInput {
            device: self.name.clone(),
            operation,
            reason: reason.into(),
        }
    }

    fn check_axes<'a>(&self, operation: &'static str, mut names: impl Iterator<Item = &'a String>) -> DeviceResult<()> {
        match names.find(|name| !self.axes.iter().any(|(axis, _)| axis == *name)) {
            Some(unknown) => Err(self.invalid_input(operation, format!("unknown axis '{}'", unknown))),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for CompositeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeDevice")
            .field("name", &self.name)
            .field("axes", &self.axes())
            .field("config_path", &self.config_path)
            .finish_non_exhaustive()
    }
}
