//! Configuration Store: device files on disk.
//!
//! A device file holds identity, offset, unit, the transport and driver
//! sections, and the named-configuration table:
//!
//! ```toml
//! name = "vampires_filter"
//! unit = "slot"
//! offset = 0.0
//!
//! [serial]
//! port = "/dev/serial/by-id/usb-FTDI_FT230X-if00-port0"
//! baud_rate = 115200
//!
//! [driver]
//! type = "thorlabs_wheel"
//! slots = 6
//!
//! [[configurations]]
//! idx = 1
//! name = "Open"
//! value = 1.0
//! ```
//!
//! A composite file lists its axes under `[[devices]]` and stores joint
//! presets whose `value` is a table of axis positions.
//!
//! Loading never reorders or rewrites anything. Saving renders the whole
//! document with `toml::to_string_pretty`; all maps are ordered, so saving an
//! unchanged document twice produces identical bytes.

use crate::configuration::{ConfigurationEntry, JointValue};
use crate::driver::DriverSection;
use crate::error::ConfigError;
use crate::transport::SerialSettings;
use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Contents of a single-axis device file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceFile {
    /// Device name.
    pub name: String,
    /// Display unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Logical minus raw position.
    #[serde(default)]
    pub offset: f64,
    /// `[serial]` section.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<SerialSettings>,
    /// `[driver]` section.
    pub driver: DriverSection,
    /// Presets in file order.
    #[serde(default)]
    pub configurations: Vec<ConfigurationEntry<f64>>,
}

/// One axis inside a composite file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisFile {
    /// Axis name, unique within the composite.
    pub name: String,
    /// Display unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Logical minus raw position.
    #[serde(default)]
    pub offset: f64,
    /// `[serial]` section.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<SerialSettings>,
    /// `[driver]` section.
    pub driver: DriverSection,
    /// Single-axis presets of this axis.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configurations: Vec<ConfigurationEntry<f64>>,
}

/// Contents of a composite (multi-axis) device file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeFile {
    /// Device name.
    pub name: String,
    /// Axes in declared order (`[[devices]]`).
    #[serde(default)]
    pub devices: Vec<AxisFile>,
    /// Joint presets.
    #[serde(default)]
    pub configurations: Vec<ConfigurationEntry<JointValue>>,
}

/// Kind of document a file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    /// Single-axis device file.
    Device,
    /// Composite file with `[[devices]]`.
    Composite,
}

/// Reads and writes device files.
pub struct ConfigStore;

impl ConfigStore {
    /// Extract any document type from `path`.
    pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        tracing::debug!(path = %path.display(), "Loading configuration");

        Figment::new()
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
    }

    /// Load and check a single-axis device file.
    pub fn load_device(path: &Path) -> Result<DeviceFile, ConfigError> {
        let file: DeviceFile = Self::load(path)?;
        validate_name(path, &file.name)?;
        validate_indices(path, file.configurations.iter().map(|e| e.idx))?;
        Ok(file)
    }

    /// Load and check a composite device file.
    pub fn load_composite(path: &Path) -> Result<CompositeFile, ConfigError> {
        let file: CompositeFile = Self::load(path)?;
        validate_name(path, &file.name)?;
        if file.devices.is_empty() {
            return Err(invalid(path, "composite device lists no [[devices]]"));
        }

        let mut axes = BTreeSet::new();
        for axis in &file.devices {
            validate_name(path, &axis.name)?;
            if !axes.insert(axis.name.as_str()) {
                return Err(invalid(path, format!("axis '{}' listed twice", axis.name)));
            }
        }
        for entry in &file.configurations {
            if let Some(axis) = entry.value.keys().find(|a| !axes.contains(a.as_str())) {
                return Err(invalid(
                    path,
                    format!("configuration {} names unknown axis '{}'", entry.idx, axis),
                ));
            }
        }
        validate_indices(path, file.configurations.iter().map(|e| e.idx))?;
        Ok(file)
    }

    /// Whether `path` holds a composite (has a `devices` array).
    pub fn document_kind(path: &Path) -> Result<DocumentKind, ConfigError> {
        let table: toml::Table = Self::load(path)?;
        Ok(if table.contains_key("devices") {
            DocumentKind::Composite
        } else {
            DocumentKind::Device
        })
    }

    /// Render `document` as TOML text.
    pub fn render<T: Serialize>(document: &T) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(document)?)
    }

    /// Write `document` to `path`, replacing it atomically.
    pub fn save<T: Serialize>(path: &Path, document: &T) -> Result<(), ConfigError> {
        let text = Self::render(document)?;
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        let mut staging = path.as_os_str().to_owned();
        staging.push(".tmp");
        let staging = std::path::PathBuf::from(staging);

        std::fs::write(&staging, text.as_bytes()).map_err(write_err)?;
        std::fs::rename(&staging, path).map_err(write_err)?;

        tracing::info!(path = %path.display(), "Saved configuration");
        Ok(())
    }
}

fn invalid(path: &Path, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

fn validate_name(path: &Path, name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(invalid(path, "name must not be empty"));
    }
    Ok(())
}

fn validate_indices(path: &Path, indices: impl Iterator<Item = u32>) -> Result<(), ConfigError> {
    let mut seen = BTreeSet::new();
    for idx in indices {
        if !seen.insert(idx) {
            return Err(invalid(path, format!("configuration index {} appears twice", idx)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const WHEEL: &str = r#"
name = "vampires_filter"
unit = "slot"

[serial]
port = "/dev/ttyUSB0"
baud_rate = 115200

[driver]
type = "thorlabs_wheel"
slots = 6

[[configurations]]
idx = 3
name = "Halpha"
value = 3

[[configurations]]
idx = 1
name = "Open"
value = 1.0
"#;

    #[test]
    fn test_load_applies_defaults_without_reordering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wheel.toml");
        std::fs::write(&path, WHEEL).unwrap();

        let file = ConfigStore::load_device(&path).unwrap();
        assert_eq!(file.offset, 0.0);
        assert_eq!(file.unit.as_deref(), Some("slot"));
        assert_eq!(file.driver.kind, "thorlabs_wheel");
        assert_eq!(file.serial.as_ref().map(|s| s.timeout_ms), Some(500));
        let idx: Vec<u32> = file.configurations.iter().map(|e| e.idx).collect();
        assert_eq!(idx, vec![3, 1]);
        assert_eq!(ConfigStore::document_kind(&path).unwrap(), DocumentKind::Device);
    }

    #[test]
    fn test_save_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wheel.toml");
        std::fs::write(&path, WHEEL).unwrap();

        let file = ConfigStore::load_device(&path).unwrap();
        ConfigStore::save(&path, &file).unwrap();
        let first = std::fs::read(&path).unwrap();

        let reloaded = ConfigStore::load_device(&path).unwrap();
        assert_eq!(reloaded, file);
        ConfigStore::save(&path, &reloaded).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), first);
    }

    #[test]
    fn test_missing_file_and_duplicate_index() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(matches!(ConfigStore::load_device(&missing), Err(ConfigError::NotFound(_))));

        let path = dir.path().join("dup.toml");
        std::fs::write(
            &path,
            "name = \"x\"\n[driver]\ntype = \"mock\"\n[[configurations]]\nidx = 1\nname = \"a\"\nvalue = 0.0\n[[configurations]]\nidx = 1\nname = \"b\"\nvalue = 1.0\n",
        )
        .unwrap();
        assert!(matches!(ConfigStore::load_device(&path), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_composite_rejects_unknown_axis() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.toml");
        std::fs::write(
            &path,
            r#"
name = "bench"

[[devices]]
name = "x"
[devices.driver]
type = "mock"

[[configurations]]
idx = 1
name = "bad"
value = { x = 1.0, z = 2.0 }
"#,
        )
        .unwrap();
        assert_eq!(ConfigStore::document_kind(&path).unwrap(), DocumentKind::Composite);
        let err = ConfigStore::load_composite(&path).unwrap_err();
        assert!(err.to_string().contains("unknown axis 'z'"));
    }
}
