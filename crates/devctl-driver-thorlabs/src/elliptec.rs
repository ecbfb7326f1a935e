//! Thorlabs Elliptec (ELL14 rotation mount, ELL6/ELL9 sliders) Driver
//!
//! Protocol: RS-485 multidrop bus, 9600 baud, ASCII encoded
//! Reference: ELLx modules protocol manual Issue 10
//!
//! Commands are `{addr}{cmd}[data]` with no terminator; replies are
//! `{addr}{CMD}{data}\r\n`. Up to 16 modules (`0`-`F`) share one port, so
//! replies addressed elsewhere and leftovers from earlier moves are skipped
//! until the expected header arrives.
//!
//! Positions are signed 32-bit pulse counts written as 8 hex digits.
//!
//! # Configuration
//!
//! ```toml
//! [serial]
//! port = "/dev/ttyUSB1"
//! baud_rate = 9600
//!
//! [driver]
//! type = "elliptec"
//! address = "2"
//! pulses_per_unit = 398.22222222   # omit to read it from the module
//! ```

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use devctl_core::driver::{Driver, DriverConfig, DriverFactory};
use devctl_core::error::{DriverError, TransportError};
use devctl_core::state::{DriverState, MotionPhase};
use devctl_core::transport::{PortRegistry, Transport};
use futures::future::BoxFuture;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Lines read while looking for one reply before giving up.
const MAX_SKIPPED_LINES: usize = 8;

// =============================================================================
// ElliptecFactory - DriverFactory implementation
// =============================================================================

/// `[driver]` options for `type = "elliptec"`.
#[derive(Debug, Clone, Deserialize)]
pub struct ElliptecOptions {
    /// Module address on the bus (`0`-`9`, `A`-`F`)
    #[serde(default = "default_address")]
    pub address: String,
    /// Calibration; read from the module's `in` reply when absent
    #[serde(default)]
    pub pulses_per_unit: Option<f64>,
}

fn default_address() -> String {
    "0".to_string()
}

impl ElliptecOptions {
    fn from_config(config: &DriverConfig) -> Result<Self> {
        let options: ElliptecOptions = toml::Value::Table(config.section.options.clone())
            .try_into()
            .context("Invalid Elliptec options")?;
        parse_address(&options.address)?;
        if let Some(ppu) = options.pulses_per_unit {
            if !(ppu.is_finite() && ppu > 0.0) {
                return Err(anyhow!("pulses_per_unit must be positive, got {ppu}"));
            }
        }
        Ok(options)
    }
}

fn parse_address(address: &str) -> Result<char> {
    let mut chars = address.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_hexdigit() => Ok(c.to_ascii_uppercase()),
        _ => Err(anyhow!("Elliptec address must be one hex digit, got {address:?}")),
    }
}

/// Factory for creating Elliptec driver instances.
pub struct ElliptecFactory;

impl DriverFactory for ElliptecFactory {
    fn driver_type(&self) -> &'static str {
        "elliptec"
    }

    fn name(&self) -> &'static str {
        "Thorlabs Elliptec ELLx"
    }

    fn validate(&self, config: &DriverConfig) -> Result<()> {
        ElliptecOptions::from_config(config)?;
        config.require_serial()?;
        Ok(())
    }

    fn build(&self, config: DriverConfig, ports: Arc<PortRegistry>) -> BoxFuture<'static, Result<Arc<dyn Driver>>> {
        Box::pin(async move {
            let options = ElliptecOptions::from_config(&config)?;
            let address = parse_address(&options.address)?;
            let transport = ports.get_or_open(config.require_serial()?).await?;

            let driver = match options.pulses_per_unit {
                Some(ppu) => ElliptecDriver::new(transport, address, ppu),
                None => ElliptecDriver::calibrated(transport, address).await?,
            };
            tracing::info!(
                device = %config.device,
                address = %address,
                pulses_per_unit = driver.pulses_per_unit(),
                "Elliptec module ready"
            );
            Ok(Arc::new(driver) as Arc<dyn Driver>)
        })
    }
}

// =============================================================================
// Status Codes
// =============================================================================

/// Status/error codes returned in `GS` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ElliptecStatus {
    /// No error.
    Ok = 0x00,
    /// Module timed out on the serial line.
    CommunicationTimeout = 0x01,
    /// Motion did not finish in time.
    MechanicalTimeout = 0x02,
    /// Command not understood.
    CommandError = 0x03,
    /// Parameter outside its range.
    ValueOutOfRange = 0x04,
    /// Module isolated from the bus.
    ModuleIsolated = 0x05,
    /// Module left isolation.
    ModuleOutOfIsolation = 0x06,
    /// Initialisation failed.
    InitializationError = 0x07,
    /// Over temperature.
    ThermalError = 0x08,
    /// Motor running.
    Busy = 0x09,
    /// Position sensor fault.
    SensorError = 0x0A,
    /// Motor fault.
    MotorError = 0x0B,
    /// Target outside travel.
    OutOfRange = 0x0C,
    /// Motor over current.
    OverCurrentError = 0x0D,
    /// Any code not listed above.
    Unknown = 0xFF,
}

impl ElliptecStatus {
    /// Decode the two hex digits of a `GS` reply.
    pub fn from_hex(hex: &str) -> Self {
        match u8::from_str_radix(hex, 16) {
            Ok(0x00) => Self::Ok,
            Ok(0x01) => Self::CommunicationTimeout,
            Ok(0x02) => Self::MechanicalTimeout,
            Ok(0x03) => Self::CommandError,
            Ok(0x04) => Self::ValueOutOfRange,
            Ok(0x05) => Self::ModuleIsolated,
            Ok(0x06) => Self::ModuleOutOfIsolation,
            Ok(0x07) => Self::InitializationError,
            Ok(0x08) => Self::ThermalError,
            Ok(0x09) => Self::Busy,
            Ok(0x0A) => Self::SensorError,
            Ok(0x0B) => Self::MotorError,
            Ok(0x0C) => Self::OutOfRange,
            Ok(0x0D) => Self::OverCurrentError,
            _ => Self::Unknown,
        }
    }

    /// Human-readable text for the code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Ok => "No error",
            Self::CommunicationTimeout => "Communication timeout",
            Self::MechanicalTimeout => "Mechanical timeout",
            Self::CommandError => "Command error",
            Self::ValueOutOfRange => "Value out of range",
            Self::ModuleIsolated => "Module isolated",
            Self::ModuleOutOfIsolation => "Module out of isolation",
            Self::InitializationError => "Initialization error",
            Self::ThermalError => "Thermal error",
            Self::Busy => "Busy",
            Self::SensorError => "Sensor error",
            Self::MotorError => "Motor error",
            Self::OutOfRange => "Position out of range",
            Self::OverCurrentError => "Over current error",
            Self::Unknown => "Unknown error",
        }
    }

    /// Codes that do not indicate a fault.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::Ok | Self::Busy)
    }
}

/// Pulses per unit from an `IN` payload (last 8 hex digits, pulses per
/// revolution for rotation mounts).
pub fn parse_calibration(payload: &str) -> Option<f64> {
    let hex = payload.trim().get(payload.trim().len().checked_sub(8)?..)?;
    let per_turn = u32::from_str_radix(hex, 16).ok()?;
    let ppu = f64::from(per_turn) / 360.0;
    (ppu > 100.0 && ppu < 1000.0).then_some(ppu)
}

// =============================================================================
// ElliptecDriver
// =============================================================================

/// Driver for one Elliptec module on a (possibly shared) bus.
pub struct ElliptecDriver {
    transport: Arc<Transport>,
    address: char,
    pulses_per_unit: f64,
}

impl ElliptecDriver {
    /// Default calibration: 143360 pulses / 360 degrees
    pub const DEFAULT_PULSES_PER_UNIT: f64 = 398.22222222;

    /// Driver with a known calibration.
    pub fn new(transport: Arc<Transport>, address: char, pulses_per_unit: f64) -> Self {
        Self {
            transport,
            address,
            pulses_per_unit,
        }
    }

    /// Create a driver with the calibration read from the module.
    pub async fn calibrated(transport: Arc<Transport>, address: char) -> Result<Self> {
        let probe = Self::new(transport, address, Self::DEFAULT_PULSES_PER_UNIT);
        let info = probe
            .transaction("in", "IN")
            .await
            .with_context(|| format!("Elliptec module {address} did not answer"))?;
        let ppu = parse_calibration(&info).unwrap_or_else(|| {
            tracing::warn!(address = %address, info = %info, "Unusable calibration in IN reply, using default");
            Self::DEFAULT_PULSES_PER_UNIT
        });
        Ok(Self::new(probe.transport, address, ppu))
    }

    /// Bus address, `0`-`F`.
    pub fn address(&self) -> char {
        self.address
    }

    /// Encoder pulses per raw unit.
    pub fn pulses_per_unit(&self) -> f64 {
        self.pulses_per_unit
    }

    fn malformed(&self, detail: impl Into<String>) -> DriverError {
        DriverError::Transport(TransportError::malformed(self.transport.resource().as_str(), detail))
    }

    fn pulses(&self, raw: f64) -> Result<i32, DriverError> {
        let pulses = (raw * self.pulses_per_unit).round();
        if !pulses.is_finite() || pulses < f64::from(i32::MIN) || pulses > f64::from(i32::MAX) {
            return Err(DriverError::InvalidInput(format!("{raw} is outside the encoder range")));
        }
        Ok(pulses as i32)
    }

    /// Write a command and return nothing; its reply is skipped later.
    async fn send(&self, command: &str) -> Result<(), DriverError> {
        let mut session = self.transport.session().await?;
        session.drain(Duration::ZERO).await;
        tracing::debug!(address = %self.address, command, "Elliptec command");
        session.send(format!("{}{}", self.address, command).as_bytes()).await?;
        Ok(())
    }

    /// Send `command` and return the payload of the first `{addr}{expect}` reply.
    #[instrument(skip(self), fields(address = %self.address), err)]
    async fn transaction(&self, command: &str, expect: &str) -> Result<String, DriverError> {
        let header = format!("{}{}", self.address, expect);
        let status_header = format!("{}GS", self.address);

        let mut session = self.transport.session().await?;
        session.drain(Duration::ZERO).await;
        session.send(format!("{}{}", self.address, command).as_bytes()).await?;

        for _ in 0..MAX_SKIPPED_LINES {
            let line = session.read_line().await?;
            let line = line.trim();
            if let Some(payload) = line.strip_prefix(header.as_str()) {
                tracing::trace!(command, reply = %line, "Elliptec transaction");
                return Ok(payload.to_string());
            }
            if let Some(code) = line.strip_prefix(status_header.as_str()) {
                let status = ElliptecStatus::from_hex(code);
                if !status.is_benign() {
                    return Err(DriverError::Controller(format!(
                        "{} (code {})",
                        status.description(),
                        code
                    )));
                }
            }
            tracing::trace!(command, skipped = %line, "Skipping unrelated Elliptec reply");
        }
        Err(self.malformed(format!("no {header} reply to {command}")))
    }

    /// Module status (`gs`).
    pub async fn status(&self) -> Result<ElliptecStatus, DriverError> {
        let code = self.transaction("gs", "GS").await?;
        Ok(ElliptecStatus::from_hex(&code))
    }
}

#[async_trait]
impl Driver for ElliptecDriver {
    fn kind(&self) -> &'static str {
        "elliptec"
    }

    #[instrument(skip(self), fields(address = %self.address), err)]
    async fn get_position(&self) -> Result<f64, DriverError> {
        let hex = self.transaction("gp", "PO").await?;
        let pulses = u32::from_str_radix(hex.trim(), 16)
            .map_err(|_| self.malformed(format!("bad position {hex:?}")))? as i32;
        Ok(f64::from(pulses) / self.pulses_per_unit)
    }

    #[instrument(skip(self), fields(address = %self.address), err)]
    async fn move_absolute(&self, raw: f64) -> Result<(), DriverError> {
        let pulses = self.pulses(raw)?;
        self.send(&format!("ma{:08X}", pulses)).await
    }

    #[instrument(skip(self), fields(address = %self.address), err)]
    async fn move_relative(&self, delta: f64) -> Result<(), DriverError> {
        let pulses = self.pulses(delta)?;
        self.send(&format!("mr{:08X}", pulses)).await
    }

    async fn home(&self) -> Result<(), DriverError> {
        // Direction digit only matters for rotation mounts; 0 is clockwise.
        self.send("ho0").await
    }

    async fn stop(&self) -> Result<(), DriverError> {
        self.send("st").await
    }

    async fn get_state(&self) -> Result<DriverState, DriverError> {
        match self.status().await? {
            ElliptecStatus::Ok => Ok(DriverState::ready()),
            ElliptecStatus::Busy => Ok(DriverState::new(MotionPhase::Moving)),
            other => Err(DriverError::Controller(other.description().to_string())),
        }
    }

    async fn identify(&self) -> Result<String, DriverError> {
        self.transaction("in", "IN").await
    }

    fn validate_target(&self, raw: f64) -> Result<(), DriverError> {
        self.pulses(raw).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devctl_core::arbiter::{PortArbiter, ResourceId};
    use devctl_core::driver::DriverSection;
    use devctl_core::transport::SerialSettings;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn module(address: char) -> (ElliptecDriver, tokio::io::DuplexStream) {
        let (host, device) = tokio::io::duplex(256);
        let transport = Arc::new(Transport::new(
            ResourceId::new("ell-test"),
            Box::new(device),
            Arc::new(PortArbiter::process_local()),
            Duration::from_millis(200),
        ));
        (ElliptecDriver::new(transport, address, 400.0), host)
    }

    #[test]
    fn test_status_code_parsing() {
        assert_eq!(ElliptecStatus::from_hex("00"), ElliptecStatus::Ok);
        assert_eq!(ElliptecStatus::from_hex("02"), ElliptecStatus::MechanicalTimeout);
        assert_eq!(ElliptecStatus::from_hex("0D"), ElliptecStatus::OverCurrentError);
        assert_eq!(ElliptecStatus::from_hex("zz"), ElliptecStatus::Unknown);
        assert!(ElliptecStatus::Busy.is_benign());
    }

    #[test]
    fn test_calibration_parsing() {
        let ppu = parse_calibration("0E1140051720231701016800023000").unwrap();
        assert!((ppu - 398.2222).abs() < 1e-3);
        assert_eq!(parse_calibration("0E11400517202317010168000000FF"), None);
        assert_eq!(parse_calibration("123"), None);
    }

    #[test]
    fn test_factory_validate_config() {
        let factory = ElliptecFactory;
        let serial = Some(SerialSettings::new("/dev/ttyUSB1", 9600));
        let ok = DriverConfig::new("rotator", DriverSection::new("elliptec").with_option("address", "b"), serial.clone());
        assert!(factory.validate(&ok).is_ok());
        let bad = DriverConfig::new("rotator", DriverSection::new("elliptec").with_option("address", "12"), serial);
        assert!(factory.validate(&bad).is_err());
    }

    #[tokio::test]
    async fn test_negative_position_round_trip() {
        let (driver, mut host) = module('2');
        let responder = tokio::spawn(async move {
            let mut cmd = [0u8; 3];
            host.read_exact(&mut cmd).await.unwrap();
            assert_eq!(&cmd, b"2gp");
            // Another module answering first, then ours.
            host.write_all(b"3PO00000010\r\n2POFFFFF060\r\n").await.unwrap();
            host
        });
        assert_eq!(driver.get_position().await.unwrap(), -10.0);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_move_writes_twos_complement_pulses() {
        let (driver, mut host) = module('0');
        driver.move_relative(-0.5).await.unwrap();
        let mut cmd = [0u8; 11];
        host.read_exact(&mut cmd).await.unwrap();
        assert_eq!(&cmd, b"0mrFFFFFF38");
    }

    #[tokio::test]
    async fn test_fault_status_is_controller_error() {
        let (driver, mut host) = module('1');
        let responder = tokio::spawn(async move {
            let mut cmd = [0u8; 3];
            host.read_exact(&mut cmd).await.unwrap();
            host.write_all(b"1GS02\r\n").await.unwrap();
            host
        });
        let err = driver.get_position().await.unwrap_err();
        assert!(matches!(err, DriverError::Controller(ref m) if m.contains("Mechanical timeout")), "{err}");
        responder.await.unwrap();
    }
}
