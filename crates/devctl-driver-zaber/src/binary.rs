//! Zaber Binary Protocol Stage Driver
//!
//! Protocol: 6-byte frames, 9600 baud, 8N1
//! Reference: Zaber Binary Protocol Manual
//!
//! Every frame, request or reply, is `[device, command, data0..data3]` where
//! `data` is a little-endian `i32`. Devices are numbered 1-254 on a daisy
//! chain (0 addresses all of them and is not used here).
//!
//! Motion commands reply only when the move has finished. The driver does not
//! wait for those replies; they are discarded by the next exchange, which
//! reads frames until one carries the expected device and command.
//!
//! # Configuration
//!
//! ```toml
//! [serial]
//! port = "/dev/serial/by-id/usb-Zaber_X-MCC-if00-port0"
//! baud_rate = 9600
//!
//! [driver]
//! type = "zaber_binary"
//! device_number = 1
//! steps_per_unit = 20997.0   # microsteps per mm
//! ```

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use devctl_core::driver::{Driver, DriverConfig, DriverFactory};
use devctl_core::error::{DriverError, TransportError};
use devctl_core::state::{DriverState, MotionPhase};
use devctl_core::transport::{PortRegistry, Session, Transport};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

/// Frame length in both directions.
pub const FRAME_LEN: usize = 6;

/// Frames read while looking for one reply before giving up.
const MAX_STALE_FRAMES: usize = 8;

/// Setting number of the maximum position (microsteps).
pub const SETTING_MAX_POSITION: u8 = 44;

// =============================================================================
// Frames
// =============================================================================

/// Binary command numbers used by this driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ZaberCommand {
    /// Controller reset.
    Reset = 0,
    /// Reference search.
    Home = 1,
    /// Move to a position in microsteps.
    MoveAbsolute = 20,
    /// Move by a number of microsteps.
    MoveRelative = 21,
    /// Decelerate and stop.
    Stop = 23,
    /// Device model id.
    ReturnDeviceId = 50,
    /// Firmware version times 100.
    ReturnFirmwareVersion = 51,
    /// Read the setting whose number is in the data field.
    ReturnSetting = 53,
    /// Status code, 0 when idle.
    ReturnStatus = 54,
    /// Position in microsteps.
    ReturnCurrentPosition = 60,
    /// Reply only: the data field holds the error code.
    Error = 255,
}

impl ZaberCommand {
    /// Command number on the wire.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Bytes that do not form a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Wrong number of bytes.
    #[error("frame has {0} bytes, expected {FRAME_LEN}")]
    Length(usize),
}

/// One 6-byte message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Device number, 0 for all.
    pub device: u8,
    /// Command number.
    pub command: u8,
    /// Signed data field.
    pub data: i32,
}

impl Frame {
    /// Request frame.
    pub fn new(device: u8, command: ZaberCommand, data: i32) -> Self {
        Self {
            device,
            command: command.code(),
            data,
        }
    }

    /// Wire bytes, data little-endian.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let data = self.data.to_le_bytes();
        [self.device, self.command, data[0], data[1], data[2], data[3]]
    }

    /// Parse exactly one frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        match bytes {
            [device, command, d0, d1, d2, d3] => Ok(Self {
                device: *device,
                command: *command,
                data: i32::from_le_bytes([*d0, *d1, *d2, *d3]),
            }),
            _ => Err(FrameError::Length(bytes.len())),
        }
    }
}

/// Description of the data of an error reply (command 255).
pub fn error_description(code: i32) -> &'static str {
    match code {
        1 => "Cannot home",
        2 => "Device number invalid",
        14 => "Voltage low",
        15 => "Voltage high",
        18 => "Stored position invalid",
        20 => "Absolute position invalid",
        21 => "Relative position invalid",
        22 => "Velocity invalid",
        36 => "Peripheral ID invalid",
        44 => "Maximum position invalid",
        53 => "Setting number invalid",
        64 => "Command invalid",
        255 => "Busy",
        _ => "Unknown error",
    }
}

/// Map the data of a status reply (command 54) to a protocol state.
pub fn parse_status(code: i32) -> Option<DriverState> {
    let phase = match code {
        0 => MotionPhase::Ready,
        1 => MotionPhase::Homing,
        // manual, knob, move absolute/relative, constant speed, stopping
        10 | 11 | 18 | 20 | 21 | 22 | 23 => MotionPhase::Moving,
        // parked or disabled
        65 | 90 => MotionPhase::Disabled,
        _ => return None,
    };
    Some(DriverState::new(phase))
}

// =============================================================================
// ZaberFactory - DriverFactory implementation
// =============================================================================

/// `[driver]` options for `type = "zaber_binary"`.
#[derive(Debug, Clone, Deserialize)]
pub struct ZaberOptions {
    /// Device number on the chain (1-254)
    #[serde(default = "default_device_number")]
    pub device_number: u8,
    /// Microsteps per raw unit
    #[serde(default = "default_steps_per_unit")]
    pub steps_per_unit: f64,
    /// Read the maximum position at startup
    #[serde(default = "default_check_limits")]
    pub check_limits: bool,
}

fn default_device_number() -> u8 {
    1
}

fn default_steps_per_unit() -> f64 {
    1.0
}

fn default_check_limits() -> bool {
    true
}

impl ZaberOptions {
    fn from_config(config: &DriverConfig) -> Result<Self> {
        let options: ZaberOptions = toml::Value::Table(config.section.options.clone())
            .try_into()
            .context("Invalid Zaber options")?;
        if !(1..=254).contains(&options.device_number) {
            return Err(anyhow!(
                "device number must be between 1 and 254, got {}",
                options.device_number
            ));
        }
        if !(options.steps_per_unit.is_finite() && options.steps_per_unit > 0.0) {
            return Err(anyhow!("steps_per_unit must be positive, got {}", options.steps_per_unit));
        }
        Ok(options)
    }
}

/// Factory for creating Zaber driver instances.
pub struct ZaberFactory;

impl DriverFactory for ZaberFactory {
    fn driver_type(&self) -> &'static str {
        "zaber_binary"
    }

    fn name(&self) -> &'static str {
        "Zaber Binary Protocol"
    }

    fn validate(&self, config: &DriverConfig) -> Result<()> {
        ZaberOptions::from_config(config)?;
        config.require_serial()?;
        Ok(())
    }

    fn build(&self, config: DriverConfig, ports: Arc<PortRegistry>) -> BoxFuture<'static, Result<Arc<dyn Driver>>> {
        Box::pin(async move {
            let options = ZaberOptions::from_config(&config)?;
            let transport = ports.get_or_open(config.require_serial()?).await?;
            let driver = ZaberDriver::new(transport, options.device_number, options.steps_per_unit);

            let id = driver
                .identify()
                .await
                .map_err(|e| anyhow!("Zaber device {} did not answer: {}", options.device_number, e))?;
            tracing::info!(device = %config.device, device_number = options.device_number, id = %id, "Zaber device validated");

            if options.check_limits {
                let (min, max) = driver.load_limits().await.context("Failed to read Zaber maximum position")?;
                tracing::debug!(min, max, "Zaber travel range");
            }

            Ok(Arc::new(driver) as Arc<dyn Driver>)
        })
    }
}

// =============================================================================
// ZaberDriver
// =============================================================================

/// Driver for one device on a Zaber binary-protocol chain.
pub struct ZaberDriver {
    transport: Arc<Transport>,
    device_number: u8,
    steps_per_unit: f64,
    /// Travel range in raw units, once read
    limits: RwLock<Option<(f64, f64)>>,
    /// Last commanded target in raw units; cleared by stop/reset
    target: Mutex<Option<f64>>,
}

impl ZaberDriver {
    /// Driver for device `device_number` on `transport`.
    pub fn new(transport: Arc<Transport>, device_number: u8, steps_per_unit: f64) -> Self {
        Self {
            transport,
            device_number,
            steps_per_unit,
            limits: RwLock::new(None),
            target: Mutex::new(None),
        }
    }

    /// Device number on the chain.
    pub fn device_number(&self) -> u8 {
        self.device_number
    }

    /// Microsteps per raw unit.
    pub fn steps_per_unit(&self) -> f64 {
        self.steps_per_unit
    }

    /// Cached travel range (`None` until loaded).
    pub fn limits(&self) -> Option<(f64, f64)> {
        *self.limits.read()
    }

    /// Read the maximum position setting and cache `(0, max)` for target validation.
    #[instrument(skip(self), fields(device_number = self.device_number), err)]
    pub async fn load_limits(&self) -> Result<(f64, f64), DriverError> {
        let max = self.get_setting(SETTING_MAX_POSITION).await?;
        let limits = (0.0, self.to_units(max));
        *self.limits.write() = Some(limits);
        Ok(limits)
    }

    /// Value of a device setting (command 53; the reply carries the setting number).
    pub async fn get_setting(&self, setting: u8) -> Result<i32, DriverError> {
        let mut session = self.transport.session().await?;
        let request = Frame::new(self.device_number, ZaberCommand::ReturnSetting, i32::from(setting));
        self.exchange(&mut session, request, setting).await
    }

    /// Send any command and return the data of its reply.
    pub async fn generic_command(&self, command: u8, data: i32) -> Result<i32, DriverError> {
        let mut session = self.transport.session().await?;
        let request = Frame {
            device: self.device_number,
            command,
            data,
        };
        self.exchange(&mut session, request, command).await
    }

    fn to_units(&self, steps: i32) -> f64 {
        f64::from(steps) / self.steps_per_unit
    }

    fn to_steps(&self, raw: f64) -> Result<i32, DriverError> {
        let steps = (raw * self.steps_per_unit).round();
        if !steps.is_finite() || steps < f64::from(i32::MIN) || steps > f64::from(i32::MAX) {
            return Err(DriverError::InvalidInput(format!("{raw} is outside the microstep range")));
        }
        Ok(steps as i32)
    }

    fn malformed(&self, detail: impl Into<String>) -> DriverError {
        DriverError::Transport(TransportError::malformed(self.transport.resource().as_str(), detail))
    }

    /// Write a frame without reading anything back.
    async fn send(&self, session: &mut Session<'_>, frame: Frame) -> Result<(), DriverError> {
        session.drain(Duration::ZERO).await;
        tracing::debug!(device = frame.device, command = frame.command, data = frame.data, "Zaber command");
        session.send(&frame.encode()).await?;
        Ok(())
    }

    /// Write `request` and return the data of the first reply from this
    /// device carrying `reply_command`.
    async fn exchange(&self, session: &mut Session<'_>, request: Frame, reply_command: u8) -> Result<i32, DriverError> {
        self.send(session, request).await?;

        for _ in 0..MAX_STALE_FRAMES {
            let bytes = session.read_exact(FRAME_LEN).await?;
            let reply = Frame::decode(&bytes).map_err(|e| self.malformed(e.to_string()))?;
            if reply.device == self.device_number {
                if reply.command == reply_command {
                    tracing::debug!(command = reply.command, data = reply.data, "Zaber reply");
                    return Ok(reply.data);
                }
                if reply.command == ZaberCommand::Error.code() {
                    return Err(DriverError::Controller(format!(
                        "{} (error {})",
                        error_description(reply.data),
                        reply.data
                    )));
                }
            }
            tracing::trace!(device = reply.device, command = reply.command, data = reply.data, "Discarding stale Zaber frame");
        }
        Err(self.malformed(format!(
            "no reply to command {} from device {}",
            request.command, self.device_number
        )))
    }

    async fn query(&self, command: ZaberCommand) -> Result<i32, DriverError> {
        let mut session = self.transport.session().await?;
        let request = Frame::new(self.device_number, command, 0);
        self.exchange(&mut session, request, command.code()).await
    }

    async fn command(&self, command: ZaberCommand, data: i32) -> Result<(), DriverError> {
        let mut session = self.transport.session().await?;
        self.send(&mut session, Frame::new(self.device_number, command, data)).await
    }
}

#[async_trait]
impl Driver for ZaberDriver {
    fn kind(&self) -> &'static str {
        "zaber_binary"
    }

    #[instrument(skip(self), fields(device_number = self.device_number), err)]
    async fn get_position(&self) -> Result<f64, DriverError> {
        let steps = self.query(ZaberCommand::ReturnCurrentPosition).await?;
        Ok(self.to_units(steps))
    }

    async fn get_target_position(&self) -> Result<f64, DriverError> {
        let cached = *self.target.lock();
        match cached {
            Some(target) => Ok(target),
            None => self.get_position().await,
        }
    }

    #[instrument(skip(self), fields(device_number = self.device_number), err)]
    async fn move_absolute(&self, raw: f64) -> Result<(), DriverError> {
        let steps = self.to_steps(raw)?;
        self.command(ZaberCommand::MoveAbsolute, steps).await?;
        *self.target.lock() = Some(self.to_units(steps));
        Ok(())
    }

    #[instrument(skip(self), fields(device_number = self.device_number), err)]
    async fn move_relative(&self, delta: f64) -> Result<(), DriverError> {
        let steps = self.to_steps(delta)?;
        let mut session = self.transport.session().await?;
        let current = self
            .exchange(
                &mut session,
                Frame::new(self.device_number, ZaberCommand::ReturnCurrentPosition, 0),
                ZaberCommand::ReturnCurrentPosition.code(),
            )
            .await?;
        self.send(&mut session, Frame::new(self.device_number, ZaberCommand::MoveRelative, steps))
            .await?;
        *self.target.lock() = Some(self.to_units(current.saturating_add(steps)));
        Ok(())
    }

    async fn home(&self) -> Result<(), DriverError> {
        self.command(ZaberCommand::Home, 0).await?;
        *self.target.lock() = Some(0.0);
        Ok(())
    }

    async fn stop(&self) -> Result<(), DriverError> {
        self.command(ZaberCommand::Stop, 0).await?;
        *self.target.lock() = None;
        Ok(())
    }

    async fn get_state(&self) -> Result<DriverState, DriverError> {
        let code = self.query(ZaberCommand::ReturnStatus).await?;
        parse_status(code).ok_or_else(|| self.malformed(format!("unknown status {code}")))
    }

    async fn reset(&self) -> Result<(), DriverError> {
        self.command(ZaberCommand::Reset, 0).await?;
        *self.target.lock() = None;
        Ok(())
    }

    async fn identify(&self) -> Result<String, DriverError> {
        let id = self.query(ZaberCommand::ReturnDeviceId).await?;
        let firmware = self.query(ZaberCommand::ReturnFirmwareVersion).await?;
        Ok(format!("Zaber device {} firmware {}.{:02}", id, firmware / 100, firmware % 100))
    }

    fn validate_target(&self, raw: f64) -> Result<(), DriverError> {
        if !raw.is_finite() {
            return Err(DriverError::InvalidInput(format!("target {raw} is not a finite number")));
        }
        if let Some((min, max)) = self.limits() {
            if raw < min || raw > max {
                return Err(DriverError::InvalidInput(format!(
                    "target {raw} outside travel range [{min}, {max}]"
                )));
            }
        }
        self.to_steps(raw).map(|_| ())
    }
}
