//! Thorlabs MFF101 / MFF102 Motorized Flip Mount Driver
//!
//! Protocol: Thorlabs APT binary messages over USB virtual COM port,
//! 115200 baud, 8N1, RTS/CTS handshake.
//! Reference: Thorlabs APT Communications Protocol, MGMSG_MOT_MOVE_JOG and
//! MGMSG_MOT_REQ_STATUSBITS.
//!
//! Every message starts with a 6-byte header `[id_lo, id_hi, p1, p2, dest, src]`.
//! The mount has two positions: 1 (up, beam passes) and 2 (down, filter in).
//! While it travels neither limit bit is set and the position reads 1.5.
//!
//! # Configuration
//!
//! ```toml
//! [serial]
//! port = "/dev/serial/by-id/usb-Thorlabs_APT_Filter_Flipper_37000001-if00-port0"
//! baud_rate = 115200
//! rts_cts = true
//!
//! [driver]
//! type = "thorlabs_flip"
//! ```

use anyhow::Result;
use async_trait::async_trait;
use devctl_core::driver::{Driver, DriverConfig, DriverFactory};
use devctl_core::error::{DriverError, TransportError};
use devctl_core::state::{DriverState, MotionPhase};
use devctl_core::transport::{PortRegistry, Transport};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

/// Jog to position 1 (MGMSG_MOT_MOVE_JOG, direction forward).
pub const JOG_UP: [u8; 6] = [0x6A, 0x04, 0x00, 0x01, 0x21, 0x01];
/// Jog to position 2 (MGMSG_MOT_MOVE_JOG, direction reverse).
pub const JOG_DOWN: [u8; 6] = [0x6A, 0x04, 0x00, 0x02, 0x21, 0x01];
/// MGMSG_MOT_REQ_STATUSBITS.
pub const REQ_STATUS: [u8; 6] = [0x29, 0x04, 0x00, 0x00, 0x21, 0x01];

/// MGMSG_MOT_GET_STATUSBITS message id, little-endian.
const GET_STATUS_ID: [u8; 2] = [0x2A, 0x04];
/// Header plus 6-byte payload (channel u16, status u32).
pub const STATUS_REPLY_LEN: usize = 12;

const BIT_POSITION_1: u32 = 0x0000_0001;
const BIT_POSITION_2: u32 = 0x0000_0002;

/// Position reported while the mount travels between its end stops.
pub const IN_TRANSIT: f64 = 1.5;

/// Status reply that is not a status frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatusFrameError {
    /// Wrong number of bytes.
    #[error("status frame has {0} bytes, expected {STATUS_REPLY_LEN}")]
    Length(usize),

    /// Not a status message.
    #[error("unexpected message id {0:02X} {1:02X}")]
    MessageId(u8, u8),
}

/// Decoded MGMSG_MOT_GET_STATUSBITS payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipStatus {
    /// Raw status bits.
    pub bits: u32,
}

impl FlipStatus {
    /// Decode a complete status reply.
    pub fn parse(frame: &[u8]) -> Result<Self, StatusFrameError> {
        if frame.len() != STATUS_REPLY_LEN {
            return Err(StatusFrameError::Length(frame.len()));
        }
        if frame[..2] != GET_STATUS_ID {
            return Err(StatusFrameError::MessageId(frame[0], frame[1]));
        }
        let bits = u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]);
        Ok(Self { bits })
    }

    /// 1.0, 2.0 or [`IN_TRANSIT`].
    pub fn position(&self) -> f64 {
        if self.bits & BIT_POSITION_1 != 0 {
            1.0
        } else if self.bits & BIT_POSITION_2 != 0 {
            2.0
        } else {
            IN_TRANSIT
        }
    }

    /// Neither end stop reached.
    pub fn in_transit(&self) -> bool {
        self.bits & (BIT_POSITION_1 | BIT_POSITION_2) == 0
    }
}

// =============================================================================
// FlipMountFactory - DriverFactory implementation
// =============================================================================

/// Factory for creating flip mount driver instances.
pub struct FlipMountFactory;

impl DriverFactory for FlipMountFactory {
    fn driver_type(&self) -> &'static str {
        "thorlabs_flip"
    }

    fn name(&self) -> &'static str {
        "Thorlabs MFF10x Flip Mount"
    }

    fn validate(&self, config: &DriverConfig) -> Result<()> {
        let serial = config.require_serial()?;
        if !serial.rts_cts {
            tracing::warn!(device = %config.device, "Flip mount configured without rts_cts; the controller may ignore commands");
        }
        Ok(())
    }

    fn build(&self, config: DriverConfig, ports: Arc<PortRegistry>) -> BoxFuture<'static, Result<Arc<dyn Driver>>> {
        Box::pin(async move {
            let transport = ports.get_or_open(config.require_serial()?).await?;
            Ok(Arc::new(FlipMountDriver::new(transport)) as Arc<dyn Driver>)
        })
    }
}

// =============================================================================
// FlipMountDriver
// =============================================================================

/// Driver for a two-position flip mount.
pub struct FlipMountDriver {
    transport: Arc<Transport>,
}

impl FlipMountDriver {
    /// Driver for the mount on `transport`.
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    /// Request and decode the status bits.
    pub async fn status(&self) -> Result<FlipStatus, DriverError> {
        let mut session = self.transport.session().await?;
        session.drain(Duration::ZERO).await;
        session.send(&REQ_STATUS).await?;
        let frame = session.read_exact(STATUS_REPLY_LEN).await?;
        drop(session);

        let status = FlipStatus::parse(&frame)
            .map_err(|e| TransportError::malformed(self.transport.resource().as_str(), e.to_string()))?;
        tracing::trace!(bits = format_args!("{:#010x}", status.bits), "Flip mount status");
        Ok(status)
    }

    async fn jog(&self, frame: &[u8; 6]) -> Result<(), DriverError> {
        let mut session = self.transport.session().await?;
        session.send(frame).await?;
        Ok(())
    }
}

#[async_trait]
impl Driver for FlipMountDriver {
    fn kind(&self) -> &'static str {
        "thorlabs_flip"
    }

    async fn get_position(&self) -> Result<f64, DriverError> {
        Ok(self.status().await?.position())
    }

    #[instrument(skip(self), fields(raw), err)]
    async fn move_absolute(&self, raw: f64) -> Result<(), DriverError> {
        self.validate_target(raw)?;
        if raw == 1.0 {
            self.jog(&JOG_UP).await
        } else {
            self.jog(&JOG_DOWN).await
        }
    }

    async fn move_relative(&self, _delta: f64) -> Result<(), DriverError> {
        Err(DriverError::Unsupported)
    }

    async fn home(&self) -> Result<(), DriverError> {
        Err(DriverError::Unsupported)
    }

    async fn stop(&self) -> Result<(), DriverError> {
        // A jog always runs to the opposite end stop.
        tracing::debug!("Flip mount cannot be stopped mid-travel");
        Ok(())
    }

    async fn get_state(&self) -> Result<DriverState, DriverError> {
        if self.status().await?.in_transit() {
            Ok(DriverState::new(MotionPhase::Moving))
        } else {
            Ok(DriverState::ready())
        }
    }

    fn validate_target(&self, raw: f64) -> Result<(), DriverError> {
        if raw == 1.0 || raw == 2.0 {
            Ok(())
        } else {
            Err(DriverError::InvalidInput(format!("flip mount position must be 1 or 2, got {raw}")))
        }
    }
}
