//! Thorlabs FW102C / FW212C Motorized Filter Wheel Driver
//!
//! Protocol: ASCII over USB virtual COM port, 115200 baud, 8N1
//! Reference: FW102C/FW212C manual, "Communications Command Protocol"
//!
//! Every command is terminated by `\r` and echoed back; queries then send the
//! value on its own `\r`-terminated line, followed by a `> ` prompt:
//!
//! ```text
//! -> pos?\r
//! <- pos?\r3\r>
//! ```
//!
//! Slots are numbered `1..=slots`. Fractional or out-of-range targets are
//! rejected before anything is written.
//!
//! # Configuration
//!
//! ```toml
//! [serial]
//! port = "/dev/serial/by-id/usb-Thorlabs_FW102C-if00-port0"
//! baud_rate = 115200
//!
//! [driver]
//! type = "thorlabs_wheel"
//! slots = 6   # omit to ask the wheel (pcount?)
//! ```

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use devctl_core::driver::{Driver, DriverConfig, DriverFactory};
use devctl_core::error::{DriverError, TransportError};
use devctl_core::state::DriverState;
use devctl_core::transport::{PortRegistry, Session, Transport};
use futures::future::BoxFuture;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Slot count used until the wheel has been asked.
pub const DEFAULT_SLOTS: u32 = 6;

// =============================================================================
// FilterWheelFactory - DriverFactory implementation
// =============================================================================

/// `[driver]` options for `type = "thorlabs_wheel"`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterWheelOptions {
    /// Number of filter positions; queried from the wheel when absent
    #[serde(default)]
    pub slots: Option<u32>,
}

impl FilterWheelOptions {
    fn from_config(config: &DriverConfig) -> Result<Self> {
        let options: FilterWheelOptions = toml::Value::Table(config.section.options.clone())
            .try_into()
            .context("Invalid filter wheel options")?;
        if options.slots == Some(0) {
            return Err(anyhow!("filter wheel needs at least one slot"));
        }
        Ok(options)
    }
}

/// Factory for creating filter wheel driver instances.
pub struct FilterWheelFactory;

impl DriverFactory for FilterWheelFactory {
    fn driver_type(&self) -> &'static str {
        "thorlabs_wheel"
    }

    fn name(&self) -> &'static str {
        "Thorlabs FW102C Filter Wheel"
    }

    fn validate(&self, config: &DriverConfig) -> Result<()> {
        FilterWheelOptions::from_config(config)?;
        config.require_serial()?;
        Ok(())
    }

    fn build(&self, config: DriverConfig, ports: Arc<PortRegistry>) -> BoxFuture<'static, Result<Arc<dyn Driver>>> {
        Box::pin(async move {
            let options = FilterWheelOptions::from_config(&config)?;
            let transport = ports.get_or_open(config.require_serial()?).await?;

            let slots = match options.slots {
                Some(slots) => slots,
                None => FilterWheelDriver::new(transport.clone(), DEFAULT_SLOTS)
                    .query_slot_count()
                    .await
                    .context("Filter wheel did not answer pcount?")?,
            };
            tracing::info!(device = %config.device, slots, "Filter wheel ready");

            Ok(Arc::new(FilterWheelDriver::new(transport, slots)) as Arc<dyn Driver>)
        })
    }
}

// =============================================================================
// FilterWheelDriver
// =============================================================================

/// Driver for a Thorlabs filter wheel. Raw positions are slot numbers.
pub struct FilterWheelDriver {
    transport: Arc<Transport>,
    slots: u32,
}

impl FilterWheelDriver {
    /// Driver for a wheel with `slots` positions.
    pub fn new(transport: Arc<Transport>, slots: u32) -> Self {
        Self { transport, slots }
    }

    /// Number of slots; valid positions are `1..=slots`.
    pub fn slots(&self) -> u32 {
        self.slots
    }

    /// Ask the wheel how many positions it has (`pcount?`).
    pub async fn query_slot_count(&self) -> Result<u32, DriverError> {
        let value = self.ask("pcount?").await?;
        value
            .parse()
            .map_err(|_| self.malformed(format!("bad slot count {value:?}")))
    }

    fn malformed(&self, detail: impl Into<String>) -> DriverError {
        DriverError::Transport(TransportError::malformed(self.transport.resource().as_str(), detail))
    }

    /// Read one `\r`-terminated field, dropping a leading prompt.
    async fn read_field(&self, session: &mut Session<'_>) -> Result<String, DriverError> {
        let raw = session.read_until(b'\r').await?;
        let text = String::from_utf8_lossy(&raw);
        Ok(text.trim().trim_start_matches('>').trim().to_string())
    }

    /// Write `command` and check its echo, leaving the session open for a value.
    async fn write_echoed(&self, session: &mut Session<'_>, command: &str) -> Result<(), DriverError> {
        // Stale prompts from the previous exchange
        session.drain(Duration::ZERO).await;
        tracing::debug!(command, "Filter wheel command");
        session.send(format!("{}\r", command).as_bytes()).await?;

        let echo = self.read_field(session).await?;
        if echo != command {
            return Err(self.malformed(format!("expected echo {command:?}, got {echo:?}")));
        }
        Ok(())
    }

    /// Send command; only the echo comes back.
    async fn send_command(&self, command: &str) -> Result<(), DriverError> {
        let mut session = self.transport.session().await?;
        self.write_echoed(&mut session, command).await
    }

    /// Send query and read its value line.
    async fn ask(&self, command: &str) -> Result<String, DriverError> {
        let mut session = self.transport.session().await?;
        self.write_echoed(&mut session, command).await?;
        let value = self.read_field(&mut session).await?;
        tracing::debug!(command, value = %value, "Filter wheel reply");
        Ok(value)
    }

    fn slot(&self, raw: f64) -> Result<u32, DriverError> {
        if !raw.is_finite() || raw.fract() != 0.0 || raw < 1.0 || raw > f64::from(self.slots) {
            return Err(DriverError::InvalidInput(format!(
                "filter position must be a whole number between 1 and {}, got {}",
                self.slots, raw
            )));
        }
        Ok(raw as u32)
    }
}

#[async_trait]
impl Driver for FilterWheelDriver {
    fn kind(&self) -> &'static str {
        "thorlabs_wheel"
    }

    #[instrument(skip(self), err)]
    async fn get_position(&self) -> Result<f64, DriverError> {
        let value = self.ask("pos?").await?;
        value
            .parse::<u32>()
            .map(f64::from)
            .map_err(|_| self.malformed(format!("bad position {value:?}")))
    }

    #[instrument(skip(self), fields(raw), err)]
    async fn move_absolute(&self, raw: f64) -> Result<(), DriverError> {
        let slot = self.slot(raw)?;
        self.send_command(&format!("pos={}", slot)).await
    }

    #[instrument(skip(self), fields(delta), err)]
    async fn move_relative(&self, delta: f64) -> Result<(), DriverError> {
        let current = self.get_position().await?;
        let slot = self.slot(current + delta)?;
        self.send_command(&format!("pos={}", slot)).await
    }

    async fn home(&self) -> Result<(), DriverError> {
        Err(DriverError::Unsupported)
    }

    async fn stop(&self) -> Result<(), DriverError> {
        Err(DriverError::Unsupported)
    }

    /// The wheel does not answer until a move has finished, so it is always
    /// ready by the time it can be asked.
    async fn get_state(&self) -> Result<DriverState, DriverError> {
        Ok(DriverState::ready())
    }

    async fn identify(&self) -> Result<String, DriverError> {
        self.ask("*idn?").await
    }

    fn validate_target(&self, raw: f64) -> Result<(), DriverError> {
        self.slot(raw).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devctl_core::arbiter::{PortArbiter, ResourceId};
    use devctl_core::driver::DriverSection;
    use devctl_core::transport::SerialSettings;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn wheel(slots: u32) -> (FilterWheelDriver, tokio::io::DuplexStream) {
        let (host, device) = tokio::io::duplex(256);
        let transport = Arc::new(Transport::new(
            ResourceId::new("wheel-test"),
            Box::new(device),
            Arc::new(PortArbiter::process_local()),
            Duration::from_millis(200),
        ));
        (FilterWheelDriver::new(transport, slots), host)
    }

    #[test]
    fn test_factory_validate_config() {
        let factory = FilterWheelFactory;
        let serial = Some(SerialSettings::new("/dev/ttyUSB0", 115200));
        let ok = DriverConfig::new("filter", DriverSection::new("thorlabs_wheel").with_option("slots", 12), serial.clone());
        assert!(factory.validate(&ok).is_ok());
        let zero = DriverConfig::new("filter", DriverSection::new("thorlabs_wheel").with_option("slots", 0), serial);
        assert!(factory.validate(&zero).is_err());
    }

    #[test]
    fn test_slot_validation() {
        let (driver, _host) = wheel(6);
        assert!(driver.validate_target(1.0).is_ok());
        assert!(driver.validate_target(6.0).is_ok());
        for bad in [0.0, 7.0, 2.5, -1.0, f64::NAN] {
            assert!(matches!(driver.validate_target(bad), Err(DriverError::InvalidInput(_))), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_query_skips_echo_and_prompt() {
        let (driver, mut host) = wheel(6);
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let n = host.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"pos?\r");
            host.write_all(b"pos?\r4\r> ").await.unwrap();
            host
        });
        assert_eq!(driver.get_position().await.unwrap(), 4.0);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_echo_is_malformed() {
        let (driver, mut host) = wheel(6);
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let _ = host.read(&mut buf).await.unwrap();
            host.write_all(b"Command error\r").await.unwrap();
            host
        });
        let err = driver.move_absolute(2.0).await.unwrap_err();
        assert!(matches!(err, DriverError::Transport(TransportError::Malformed { .. })));
        responder.await.unwrap();
    }
}
