//! Newport CONEX-CC / CONEX-AGP Single-Axis Controller Driver
//!
//! Reference: CONEX-CC and CONEX-AGP Controller Documentation
//!
//! Protocol Overview:
//! - Format: ASCII command/response, CR LF terminated
//! - Baud: 921600 (USB virtual COM port), 8N1, no flow control
//! - Commands: {Address}{Command}{Axis}{Value}, address 1..=31
//! - Example: "1PA5.0" (controller 1, position absolute 5.0)
//! - Queries echo the command: "1TP" answers "1TP5.0000"
//! - Set commands are silent; "TE" reads the last error code ("@" = none)
//!   and "TB<code>" describes it
//!
//! The CONEX-AGP drives two axes (`U`, `V`) from one controller; each axis is
//! configured as its own device sharing the same port.
//!
//! # Configuration
//!
//! ```toml
//! [serial]
//! port = "/dev/serial/by-id/usb-Newport_CONEX-AGP-if00-port0"
//! baud_rate = 921600
//!
//! [driver]
//! type = "conex"
//! address = 1
//! axis = "U"          # CONEX-AGP only
//! check_limits = true # read SL?/SR? at startup
//! ```

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use devctl_core::driver::{Driver, DriverConfig, DriverFactory};
use devctl_core::error::{DriverError, TransportError};
use devctl_core::state::{DriverState, MotionPhase};
use devctl_core::transport::{PortRegistry, Session, Transport};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// "No error" reply to `TE`.
const NO_ERROR: &str = "@";

/// `TE` queries tried after a command before giving up on confirmation.
const ERROR_CHECK_ATTEMPTS: u32 = 3;

// =============================================================================
// Protocol
// =============================================================================

/// CONEX-AGP axis selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConexAxis {
    /// First axis.
    U,
    /// Second axis.
    V,
}

impl ConexAxis {
    /// Axis letter as sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConexAxis::U => "U",
            ConexAxis::V => "V",
        }
    }
}

impl fmt::Display for ConexAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConexAxis {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "u" | "U" | "0" => Ok(ConexAxis::U),
            "v" | "V" | "1" => Ok(ConexAxis::V),
            other => Err(anyhow!("CONEX axis must be U or V, got '{}'", other)),
        }
    }
}

/// Reply that does not fit the protocol.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConexReplyError {
    /// Reply does not start with the echoed command.
    #[error("reply {reply:?} lacks echoed prefix {expected:?}")]
    MissingEcho { expected: String, reply: String },

    /// State code outside the documented table.
    #[error("unknown controller state code {0:?}")]
    UnknownState(String),

    /// Numeric reply could not be parsed.
    #[error("cannot parse a number from {0:?}")]
    NotANumber(String),
}

/// Remove the echoed `<address><command>` from `reply`.
///
/// A trailing `?` is not echoed and the echo is upper case even when the
/// command was not.
pub fn strip_echo<'a>(address: u8, command: &str, reply: &'a str) -> Result<&'a str, ConexReplyError> {
    let expected = format!("{}{}", address, command.trim_end_matches('?')).to_ascii_uppercase();
    match reply.get(..expected.len()) {
        Some(head) if head.eq_ignore_ascii_case(&expected) => Ok(&reply[expected.len()..]),
        _ => Err(ConexReplyError::MissingEcho {
            expected,
            reply: reply.to_string(),
        }),
    }
}

/// Decode the two-character controller state code.
pub fn parse_state(code: &str) -> Result<DriverState, ConexReplyError> {
    use MotionPhase::*;

    let state = match code.trim().to_ascii_uppercase().as_str() {
        "0A" => DriverState::from_phase(NotReferenced, Reset),
        "0B" => DriverState::from_phase(NotReferenced, Homing),
        "0C" => DriverState::from_phase(NotReferenced, Configuration),
        "0D" => DriverState::from_phase(NotReferenced, Disabled),
        "0E" => DriverState::from_phase(NotReferenced, Ready),
        "0F" => DriverState::from_phase(NotReferenced, Moving),
        // No parameters in memory
        "10" | "11" => DriverState::new(NotReferenced),
        "14" => DriverState::new(Configuration),
        "1E" => DriverState::new(Homing),
        "28" => DriverState::new(Moving),
        "32" => DriverState::from_phase(Ready, Homing),
        "33" => DriverState::from_phase(Ready, Moving),
        "34" => DriverState::from_phase(Ready, Disabled),
        "3C" => DriverState::from_phase(Disabled, Ready),
        "3D" => DriverState::from_phase(Disabled, Moving),
        other => return Err(ConexReplyError::UnknownState(other.to_string())),
    };
    Ok(state)
}

fn parse_number(body: &str) -> Result<f64, ConexReplyError> {
    body.trim()
        .parse()
        .map_err(|_| ConexReplyError::NotANumber(body.to_string()))
}

// =============================================================================
// ConexFactory - DriverFactory implementation
// =============================================================================

/// `[driver]` options for `type = "conex"`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConexOptions {
    /// Controller address (1-31)
    #[serde(default = "default_address")]
    pub address: u8,
    /// CONEX-AGP axis; absent for CONEX-CC
    #[serde(default)]
    pub axis: Option<String>,
    /// Read the software travel limits at startup
    #[serde(default = "default_check_limits")]
    pub check_limits: bool,
}

fn default_address() -> u8 {
    1
}

fn default_check_limits() -> bool {
    true
}

impl ConexOptions {
    fn from_config(config: &DriverConfig) -> Result<Self> {
        let options: ConexOptions = toml::Value::Table(config.section.options.clone())
            .try_into()
            .context("Invalid CONEX options")?;
        if !(1..=31).contains(&options.address) {
            return Err(anyhow!(
                "controller address must be between 1 and 31, got {}",
                options.address
            ));
        }
        options.axis()?;
        Ok(options)
    }

    fn axis(&self) -> Result<Option<ConexAxis>> {
        self.axis.as_deref().map(str::parse).transpose()
    }
}

/// Factory for creating CONEX driver instances.
pub struct ConexFactory;

impl DriverFactory for ConexFactory {
    fn driver_type(&self) -> &'static str {
        "conex"
    }

    fn name(&self) -> &'static str {
        "Newport CONEX-CC / CONEX-AGP"
    }

    fn validate(&self, config: &DriverConfig) -> Result<()> {
        ConexOptions::from_config(config)?;
        config.require_serial()?;
        Ok(())
    }

    fn build(&self, config: DriverConfig, ports: Arc<PortRegistry>) -> BoxFuture<'static, Result<Arc<dyn Driver>>> {
        Box::pin(async move {
            let options = ConexOptions::from_config(&config)?;
            let transport = ports.get_or_open(config.require_serial()?).await?;
            let driver = ConexDriver::new(transport, options.address, options.axis()?);

            // Validate device identity
            let id = driver
                .identify()
                .await
                .map_err(|e| anyhow!("CONEX validation failed: no response to ID? ({})", e))?;
            tracing::info!(device = %config.device, address = options.address, id = %id, "CONEX controller validated");

            if options.check_limits {
                let (min, max) = driver.load_limits().await.context("Failed to read CONEX travel limits")?;
                tracing::debug!(min, max, "CONEX travel limits");
            }

            Ok(Arc::new(driver) as Arc<dyn Driver>)
        })
    }
}

// =============================================================================
// ConexDriver
// =============================================================================

/// Driver for one CONEX controller (or one CONEX-AGP axis).
pub struct ConexDriver {
    /// Shared transport; one exchange per session
    transport: Arc<Transport>,
    /// Controller address (1-31)
    address: u8,
    /// CONEX-AGP axis, if any
    axis: Option<ConexAxis>,
    /// Software travel limits, once read
    limits: RwLock<Option<(f64, f64)>>,
}

impl ConexDriver {
    /// Driver for controller `address` on `transport`.
    pub fn new(transport: Arc<Transport>, address: u8, axis: Option<ConexAxis>) -> Self {
        Self {
            transport,
            address,
            axis,
            limits: RwLock::new(None),
        }
    }

    /// Controller address.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// CONEX-AGP axis, if any.
    pub fn axis(&self) -> Option<ConexAxis> {
        self.axis
    }

    /// Cached travel limits (`None` until [`load_limits`](Self::load_limits)).
    pub fn limits(&self) -> Option<(f64, f64)> {
        *self.limits.read()
    }

    /// Read `SL?`/`SR?` and cache them for target validation.
    #[instrument(skip(self), fields(address = self.address), err)]
    pub async fn load_limits(&self) -> Result<(f64, f64), DriverError> {
        let min = self.query_number(&format!("SL{}?", self.axis_suffix())).await?;
        let max = self.query_number(&format!("SR{}?", self.axis_suffix())).await?;
        *self.limits.write() = Some((min, max));
        Ok((min, max))
    }

    /// Enter (`MM1`) or leave (`MM0`) the enabled state.
    #[instrument(skip(self), fields(address = self.address), err)]
    pub async fn set_enabled(&self, enabled: bool) -> Result<(), DriverError> {
        self.command(if enabled { "MM1" } else { "MM0" }).await
    }

    /// Human-readable description of the last command error, `None` if clear.
    pub async fn last_error(&self) -> Result<Option<String>, DriverError> {
        let mut session = self.transport.session().await?;
        self.read_error(&mut session).await
    }

    fn axis_suffix(&self) -> &'static str {
        self.axis.map_or("", |axis| axis.as_str())
    }

    fn frame(&self, command: &str) -> String {
        format!("{}{}\r\n", self.address, command)
    }

    fn malformed(&self, err: ConexReplyError) -> DriverError {
        DriverError::Transport(TransportError::malformed(
            self.transport.resource().as_str(),
            err.to_string(),
        ))
    }

    /// Send query and return the reply with the echo removed.
    async fn query(&self, command: &str) -> Result<String, DriverError> {
        let mut session = self.transport.session().await?;
        self.query_in(&mut session, command).await
    }

    async fn query_in(&self, session: &mut Session<'_>, command: &str) -> Result<String, DriverError> {
        tracing::debug!(address = self.address, command, "CONEX query");
        let reply = session.query_line(self.frame(command).as_bytes()).await?;
        tracing::debug!(address = self.address, reply = %reply, "CONEX reply");
        strip_echo(self.address, command, &reply)
            .map(|body| body.trim().to_string())
            .map_err(|e| self.malformed(e))
    }

    async fn query_number(&self, command: &str) -> Result<f64, DriverError> {
        let body = self.query(command).await?;
        parse_number(&body).map_err(|e| self.malformed(e))
    }

    async fn read_error(&self, session: &mut Session<'_>) -> Result<Option<String>, DriverError> {
        let code = self.query_in(session, "TE").await?;
        if code.is_empty() || code == NO_ERROR {
            return Ok(None);
        }
        let description = self.query_in(session, &format!("TB{}", code)).await?;
        let description = description.trim_start_matches([',', ' ']);
        Ok(Some(format!("{} (code {})", description, code)))
    }

    /// Send command, then check `TE` within the same session.
    ///
    /// Once the command is on the wire only the `TE` query is repeated; a
    /// check that keeps failing is reported as [`DriverError::Unconfirmed`]
    /// so the retry policy cannot send the command again.
    async fn command(&self, command: &str) -> Result<(), DriverError> {
        let mut session = self.transport.session().await?;
        tracing::debug!(address = self.address, command, "CONEX command");
        session.send(self.frame(command).as_bytes()).await?;

        let mut attempt = 1;
        let checked = loop {
            match self.read_error(&mut session).await {
                Err(DriverError::Transport(err)) if err.is_transient() && attempt < ERROR_CHECK_ATTEMPTS => {
                    tracing::debug!(address = self.address, command, attempt, error = %err, "CONEX error check failed");
                    session.drain(Duration::ZERO).await;
                    attempt += 1;
                }
                Err(DriverError::Transport(err)) => break Err(DriverError::Unconfirmed(err)),
                other => break other,
            }
        };

        match checked? {
            None => Ok(()),
            Some(error) => {
                tracing::warn!(address = self.address, command, error = %error, "CONEX rejected command");
                Err(DriverError::Controller(format!("{} rejected: {}", command, error)))
            }
        }
    }
}

#[async_trait]
impl Driver for ConexDriver {
    fn kind(&self) -> &'static str {
        "conex"
    }

    #[instrument(skip(self), fields(address = self.address), err)]
    async fn get_position(&self) -> Result<f64, DriverError> {
        self.query_number(&format!("TP{}", self.axis_suffix())).await
    }

    #[instrument(skip(self), fields(address = self.address), err)]
    async fn get_target_position(&self) -> Result<f64, DriverError> {
        self.query_number(&format!("TH{}", self.axis_suffix())).await
    }

    #[instrument(skip(self), fields(address = self.address, raw), err)]
    async fn move_absolute(&self, raw: f64) -> Result<(), DriverError> {
        self.command(&format!("PA{}{}", self.axis_suffix(), raw)).await
    }

    #[instrument(skip(self), fields(address = self.address, delta), err)]
    async fn move_relative(&self, delta: f64) -> Result<(), DriverError> {
        self.command(&format!("PR{}{}", self.axis_suffix(), delta)).await
    }

    #[instrument(skip(self), fields(address = self.address), err)]
    async fn home(&self) -> Result<(), DriverError> {
        self.command("OR").await
    }

    #[instrument(skip(self), fields(address = self.address), err)]
    async fn stop(&self) -> Result<(), DriverError> {
        self.command(&format!("ST{}", self.axis_suffix())).await
    }

    async fn get_state(&self) -> Result<DriverState, DriverError> {
        let body = self.query("MM?").await?;
        // Some firmware prefixes the state with an error field.
        let code = body.get(body.len().saturating_sub(2)..).unwrap_or_default();
        parse_state(code).map_err(|e| self.malformed(e))
    }

    #[instrument(skip(self), fields(address = self.address), err)]
    async fn reset(&self) -> Result<(), DriverError> {
        let mut session = self.transport.session().await?;
        session.send(self.frame("RS").as_bytes()).await?;
        Ok(())
    }

    async fn identify(&self) -> Result<String, DriverError> {
        self.query("ID?").await
    }

    fn validate_target(&self, raw: f64) -> Result<(), DriverError> {
        if !raw.is_finite() {
            return Err(DriverError::InvalidInput(format!("target {} is not finite", raw)));
        }
        match self.limits() {
            Some((min, max)) if raw < min || raw > max => Err(DriverError::InvalidInput(format!(
                "target {} outside travel limits {}..={}",
                raw, min, max
            ))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devctl_core::arbiter::{PortArbiter, ResourceId};
    use devctl_core::driver::DriverSection;
    use devctl_core::transport::SerialSettings;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

    fn driver_on_duplex(axis: Option<ConexAxis>) -> (ConexDriver, tokio::io::DuplexStream) {
        let (host, device) = tokio::io::duplex(256);
        let transport = Arc::new(Transport::new(
            ResourceId::new("conex-test"),
            Box::new(device),
            Arc::new(PortArbiter::process_local()),
            Duration::from_millis(200),
        ));
        (ConexDriver::new(transport, 1, axis), host)
    }

    #[test]
    fn test_factory_driver_type() {
        let factory = ConexFactory;
        assert_eq!(factory.driver_type(), "conex");
        assert_eq!(factory.name(), "Newport CONEX-CC / CONEX-AGP");
    }

    #[test]
    fn test_factory_validate_config() {
        let factory = ConexFactory;
        let serial = Some(SerialSettings::new("/dev/ttyUSB0", 921600));

        let valid = DriverConfig::new("bs", DriverSection::new("conex").with_option("axis", "u"), serial.clone());
        assert!(factory.validate(&valid).is_ok());

        let bad_address = DriverConfig::new("bs", DriverSection::new("conex").with_option("address", 32), serial.clone());
        assert!(factory.validate(&bad_address).is_err());

        let bad_axis = DriverConfig::new("bs", DriverSection::new("conex").with_option("axis", "W"), serial);
        assert!(factory.validate(&bad_axis).is_err());

        let missing_port = DriverConfig::new("bs", DriverSection::new("conex"), None);
        assert!(factory.validate(&missing_port).is_err());
    }

    #[test]
    fn test_state_codes() {
        assert!(parse_state("0A").unwrap().needs_homing());
        assert_eq!(parse_state("0a").unwrap().from, Some(MotionPhase::Reset));
        assert!(parse_state("28").unwrap().is_moving());
        assert!(parse_state("1E").unwrap().is_homing());
        assert_eq!(parse_state("33").unwrap(), DriverState::from_phase(MotionPhase::Ready, MotionPhase::Moving));
        assert!(!parse_state("3C").unwrap().is_enabled());
        assert_eq!(parse_state("99"), Err(ConexReplyError::UnknownState("99".to_string())));
        assert!(parse_state("").is_err());
    }

    #[test]
    fn test_echo_stripping() {
        assert_eq!(strip_echo(1, "TP", "1TP12.5").unwrap(), "12.5");
        assert_eq!(strip_echo(1, "SLu?", "1SLU-10").unwrap(), "-10");
        assert_eq!(strip_echo(12, "MM?", "12MM33").unwrap(), "33");
        assert!(strip_echo(2, "TP", "1TP0").is_err());
    }

    #[tokio::test]
    async fn test_move_writes_command_then_checks_error() {
        let (driver, mut host) = driver_on_duplex(Some(ConexAxis::V));
        let controller = tokio::spawn(async move {
            let mut buf = vec![0u8; 64];
            let mut seen = String::new();
            while !seen.ends_with("1TE\r\n") {
                let n = host.read(&mut buf).await.unwrap();
                seen.push_str(&String::from_utf8_lossy(&buf[..n]));
            }
            host.write_all(b"1TE@\r\n").await.unwrap();
            seen
        });

        driver.move_absolute(-0.25).await.unwrap();
        assert_eq!(controller.await.unwrap(), "1PAV-0.25\r\n1TE\r\n");
    }

    #[tokio::test]
    async fn test_rejected_command_reports_description() {
        let (driver, host) = driver_on_duplex(None);
        let controller = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(host);
            let mut lines = tokio::io::BufReader::new(read);
            let mut line = String::new();
            loop {
                line.clear();
                if lines.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                match line.trim_end() {
                    "1TE" => write.write_all(b"1TEC\r\n").await.unwrap(),
                    "1TBC" => write.write_all(b"1TBC, Parameter out of limits\r\n").await.unwrap(),
                    _ => {}
                }
            }
        });

        let err = driver.move_absolute(99.0).await.unwrap_err();
        match err {
            DriverError::Controller(message) => {
                assert!(message.contains("Parameter out of limits"), "{message}");
                assert!(message.contains("code C"), "{message}");
            }
            other => panic!("unexpected error {other:?}"),
        }
        drop(driver);
        controller.abort();
    }

    #[test]
    fn test_limits_checked_locally() {
        let (driver, _host) = driver_on_duplex(None);
        assert!(driver.validate_target(500.0).is_ok());
        *driver.limits.write() = Some((-12.5, 12.5));
        assert!(driver.validate_target(12.5).is_ok());
        assert!(matches!(driver.validate_target(13.0), Err(DriverError::InvalidInput(_))));
        assert!(matches!(driver.validate_target(f64::NAN), Err(DriverError::InvalidInput(_))));
    }
}
