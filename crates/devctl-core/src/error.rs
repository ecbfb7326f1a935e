//! Error types for the device-control core.
//!
//! Errors are layered the same way the I/O path is layered:
//!
//! - **[`TransportError`]**: a single command/response exchange failed on the wire
//!   (timeout, I/O error, malformed or short reply, controller busy).
//!   [`TransportError::is_transient`] decides whether the [`RetryPolicy`] may try again.
//! - **[`ArbiterError`]**: the cross-process port lock could not be taken.
//! - **[`DriverError`]**: what a vendor driver reports for one abstract operation.
//! - **[`DeviceError`]**: the caller-facing taxonomy. Every variant names the
//!   device and the attempted operation, so a remote caller receiving only the
//!   rendered message still knows what failed where.
//!
//! Retries are invisible to callers: a [`DeviceError::Connectivity`] is produced
//! once, after the last attempt, carrying the last transport error.
//!
//! [`RetryPolicy`]: crate::retry::RetryPolicy

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Transport Errors
// =============================================================================

/// Failure of one raw exchange with a physical resource.
#[derive(Error, Debug)]
pub enum TransportError {
    /// No (complete) reply arrived within the configured timeout.
    #[error("timed out after {after:?} waiting for reply on {resource}")]
    Timeout { resource: String, after: Duration },

    /// Underlying I/O failure.
    #[error("I/O error on {resource}: {source}")]
    Io {
        resource: String,
        #[source]
        source: std::io::Error,
    },

    /// Reply was received but could not be understood (short frame, bad echo,
    /// unparsable number, unknown state code).
    #[error("malformed reply on {resource}: {detail}")]
    Malformed { resource: String, detail: String },

    /// Controller answered that it cannot take the command right now.
    #[error("{resource} reported busy")]
    Busy { resource: String },

    /// Peer closed the channel.
    #[error("{resource} closed the connection")]
    Closed { resource: String },
}

impl TransportError {
    /// Whether a retry has a reasonable chance of succeeding.
    ///
    /// `NotFound` and `PermissionDenied` I/O errors are permanent (the port is
    /// gone or not ours); every other I/O error, timeouts, malformed replies and
    /// busy replies are transient.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout { .. }
            | TransportError::Malformed { .. }
            | TransportError::Busy { .. } => true,
            TransportError::Io { source, .. } => !matches!(
                source.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
            TransportError::Closed { .. } => false,
        }
    }

    /// Build a [`TransportError::Malformed`].
    pub fn malformed(resource: impl Into<String>, detail: impl Into<String>) -> Self {
        TransportError::Malformed {
            resource: resource.into(),
            detail: detail.into(),
        }
    }
}

// =============================================================================
// Arbiter Errors
// =============================================================================

/// Failure to obtain exclusive access to a physical resource.
#[derive(Error, Debug)]
pub enum ArbiterError {
    /// Bounded wait elapsed while another holder kept the resource.
    #[error("{resource} still locked after waiting {waited:?}")]
    Timeout { resource: String, waited: Duration },

    /// The sidecar lock file could not be created or locked.
    #[error("lock file {path} for {resource}: {source}")]
    LockFile {
        resource: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// =============================================================================
// Driver Errors
// =============================================================================

/// Error reported by a [`Driver`](crate::driver::Driver) for one operation.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Exchange with the hardware failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Port lock could not be obtained.
    #[error(transparent)]
    Arbiter(#[from] ArbiterError),

    /// Argument rejected before anything was sent to the hardware.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The protocol family has no equivalent of this operation.
    #[error("operation not supported")]
    Unsupported,

    /// Controller answered with an explicit error code.
    #[error("controller error: {0}")]
    Controller(String),

    /// Command was written but reading its acknowledgement failed.
    ///
    /// Never retried: the controller may already be acting on the command,
    /// and repeating a relative move would move twice.
    #[error("command sent but not confirmed: {0}")]
    Unconfirmed(#[source] TransportError),
}

impl DriverError {
    /// Whether the retry wrapper may repeat the exchange.
    pub fn is_transient(&self) -> bool {
        match self {
            DriverError::Transport(err) => err.is_transient(),
            _ => false,
        }
    }
}

// =============================================================================
// Configuration Errors
// =============================================================================

/// Error loading, validating or writing a configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File not found.
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    /// Parse error (invalid TOML or wrong field types).
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// Semantic validation failed.
    #[error("invalid configuration in {path}: {message}")]
    Invalid { path: PathBuf, message: String },

    /// Serialization failed.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// File could not be written.
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Device has no backing file to persist into.
    #[error("device has no configuration file")]
    NoBackingFile,
}

// =============================================================================
// Device Errors
// =============================================================================

/// Coarse category of a [`DeviceError`], for callers that branch on the kind
/// rather than on the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport failed after retries.
    Connectivity,
    /// Controller not referenced, disabled or rejecting the command.
    Precondition,
    /// No such configuration.
    NotFound,
    /// Argument rejected before dispatch.
    InvalidInput,
    /// Port lock not obtained in time.
    Contention,
    /// Move or home did not settle in time.
    MotionTimeout,
    /// Driver has no such operation.
    Unsupported,
    /// Configuration file could not be read or written.
    Config,
    /// Device could not be built.
    Setup,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::Precondition => "precondition",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Contention => "contention",
            ErrorKind::MotionTimeout => "motion_timeout",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Config => "config",
            ErrorKind::Setup => "setup",
        };
        write!(f, "{}", label)
    }
}

/// Convenience alias for device-level results.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Error surfaced by a Motion Device or Composite Device operation.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Transport failed and retries (if any) were exhausted.
    ///
    /// **Recovery Strategy**: check cabling and power; the port may need to be
    /// reopened.
    #[error("{device}: {operation} failed after {attempts} attempt(s): {source}")]
    Connectivity {
        device: String,
        operation: &'static str,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// Hardware is not in a state that allows the operation (not referenced,
    /// disabled).
    ///
    /// **Recovery Strategy**: home or enable the device, then retry.
    #[error("{device}: cannot {operation}: {reason}")]
    Precondition {
        device: String,
        operation: &'static str,
        reason: String,
    },

    /// Configuration index or name does not exist.
    #[error("{device}: {operation}: no configuration {key}")]
    NotFound {
        device: String,
        operation: &'static str,
        key: String,
    },

    /// Argument rejected before any command was sent.
    #[error("{device}: {operation}: invalid input: {reason}")]
    InvalidInput {
        device: String,
        operation: &'static str,
        reason: String,
    },

    /// Port lock not obtained within the configured bound.
    #[error("{device}: {operation}: {source}")]
    Contention {
        device: String,
        operation: &'static str,
        #[source]
        source: ArbiterError,
    },

    /// A `wait=true` move or home did not settle in time.
    #[error("{device}: {operation} did not complete within {timeout:?}")]
    MotionTimeout {
        device: String,
        operation: &'static str,
        timeout: Duration,
    },

    /// The device's driver has no such operation.
    #[error("{device}: {operation} is not supported by the {driver} driver")]
    Unsupported {
        device: String,
        operation: &'static str,
        driver: &'static str,
    },

    /// Configuration store failure.
    #[error("{device}: {operation}: {source}")]
    Config {
        device: String,
        operation: &'static str,
        #[source]
        source: ConfigError,
    },

    /// Device could not be assembled from its configuration.
    #[error("{device}: {operation}: {source:#}")]
    Setup {
        device: String,
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl DeviceError {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::Connectivity { .. } => ErrorKind::Connectivity,
            DeviceError::Precondition { .. } => ErrorKind::Precondition,
            DeviceError::NotFound { .. } => ErrorKind::NotFound,
            DeviceError::InvalidInput { .. } => ErrorKind::InvalidInput,
            DeviceError::Contention { .. } => ErrorKind::Contention,
            DeviceError::MotionTimeout { .. } => ErrorKind::MotionTimeout,
            DeviceError::Unsupported { .. } => ErrorKind::Unsupported,
            DeviceError::Config { .. } => ErrorKind::Config,
            DeviceError::Setup { .. } => ErrorKind::Setup,
        }
    }

    /// Name of the device the error belongs to.
    pub fn device(&self) -> &str {
        match self {
            DeviceError::Connectivity { device, .. }
            | DeviceError::Precondition { device, .. }
            | DeviceError::NotFound { device, .. }
            | DeviceError::InvalidInput { device, .. }
            | DeviceError::Contention { device, .. }
            | DeviceError::MotionTimeout { device, .. }
            | DeviceError::Unsupported { device, .. }
            | DeviceError::Config { device, .. }
            | DeviceError::Setup { device, .. } => device,
        }
    }

    /// Operation that was being attempted.
    pub fn operation(&self) -> &'static str {
        match self {
            DeviceError::Connectivity { operation, .. }
            | DeviceError::Precondition { operation, .. }
            | DeviceError::NotFound { operation, .. }
            | DeviceError::InvalidInput { operation, .. }
            | DeviceError::Contention { operation, .. }
            | DeviceError::MotionTimeout { operation, .. }
            | DeviceError::Unsupported { operation, .. }
            | DeviceError::Config { operation, .. }
            | DeviceError::Setup { operation, .. } => operation,
        }
    }

    /// Lift a [`DriverError`] into the device taxonomy.
    ///
    /// `attempts` is the number of exchanges tried before giving up and is only
    /// reported for connectivity failures.
    pub fn from_driver(
        device: &str,
        operation: &'static str,
        driver: &'static str,
        attempts: u32,
        err: DriverError,
    ) -> Self {
        let device = device.to_string();
        match err {
            DriverError::Transport(source) | DriverError::Unconfirmed(source) => DeviceError::Connectivity {
                device,
                operation,
                attempts,
                source,
            },
            DriverError::Arbiter(source) => DeviceError::Contention {
                device,
                operation,
                source,
            },
            DriverError::InvalidInput(reason) => DeviceError::InvalidInput {
                device,
                operation,
                reason,
            },
            DriverError::Unsupported => DeviceError::Unsupported {
                device,
                operation,
                driver,
            },
            DriverError::Controller(reason) => DeviceError::Precondition {
                device,
                operation,
                reason,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let timeout = TransportError::Timeout {
            resource: "/dev/ttyUSB0".into(),
            after: Duration::from_millis(500),
        };
        assert!(timeout.is_transient());

        let gone = TransportError::Io {
            resource: "/dev/ttyUSB0".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(!gone.is_transient());

        let broken = TransportError::Io {
            resource: "/dev/ttyUSB0".into(),
            source: std::io::Error::from(std::io::ErrorKind::BrokenPipe),
        };
        assert!(broken.is_transient());

        assert!(!DriverError::Unsupported.is_transient());
        assert!(DriverError::from(TransportError::malformed("x", "short")).is_transient());
        assert!(!DriverError::Unconfirmed(TransportError::malformed("x", "short")).is_transient());
    }

    #[test]
    fn test_device_error_names_device_and_operation() {
        let err = DeviceError::from_driver(
            "vampires_filter",
            "move_absolute",
            "thorlabs_wheel",
            1,
            DriverError::InvalidInput("slot 9 outside 1..=6".into()),
        );
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(err.device(), "vampires_filter");
        let message = err.to_string();
        assert!(message.contains("vampires_filter"));
        assert!(message.contains("move_absolute"));
        assert!(message.contains("slot 9"));
    }

    #[test]
    fn test_connectivity_error_reports_attempts() {
        let err = DeviceError::from_driver(
            "beamsplitter",
            "get_position",
            "conex",
            10,
            DriverError::Transport(TransportError::Timeout {
                resource: "/dev/ttyUSB3".into(),
                after: Duration::from_millis(500),
            }),
        );
        assert_eq!(err.kind(), ErrorKind::Connectivity);
        assert!(err.to_string().contains("after 10 attempt(s)"));
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::NotFound.to_string(), "not_found");
        assert_eq!(ErrorKind::MotionTimeout.to_string(), "motion_timeout");
    }
}
