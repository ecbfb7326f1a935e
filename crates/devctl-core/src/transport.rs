//! Serial transport shared by every driver.
//!
//! A [`Transport`] owns one open byte stream (a real serial port, or a
//! `tokio::io::duplex` half in tests) together with the [`PortArbiter`] that
//! guards it. Drivers never touch the stream directly: they open a [`Session`]
//! for each command/response exchange, which holds the port lease for exactly
//! that exchange.
//!
//! [`PortRegistry`] keeps one `Transport` per physical port so that devices
//! chained on the same bus share a stream and a lock.

use crate::arbiter::{ArbiterSettings, PortArbiter, PortLease, ResourceId};
use crate::error::{ArbiterError, TransportError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, MutexGuard};

// =============================================================================
// Stream Types
// =============================================================================

/// Anything usable as a serial port: `tokio_serial::SerialStream`,
/// `tokio::io::DuplexStream`, or a test double.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased serial stream.
pub type DynSerial = Box<dyn SerialPortIO>;

// =============================================================================
// Settings
// =============================================================================

/// `[serial]` section of a device file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Port path, e.g. `/dev/ttyUSB0` or `/dev/serial/by-id/...`.
    pub port: String,
    /// Line speed.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Per-reply timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Hardware (RTS/CTS) flow control.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub rts_cts: bool,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_timeout_ms() -> u64 {
    500
}

impl SerialSettings {
    /// Settings for `port` with the default timeout and no flow control.
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            timeout_ms: default_timeout_ms(),
            rts_cts: false,
        }
    }

    /// Enable or disable hardware flow control.
    pub fn with_rts_cts(mut self, rts_cts: bool) -> Self {
        self.rts_cts = rts_cts;
        self
    }

    /// Per-reply timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Arbiter key for this port.
    pub fn resource(&self) -> ResourceId {
        ResourceId::from_port_path(&self.port)
    }
}

// =============================================================================
// Transport
// =============================================================================

/// One physical port and the arbiter that serialises access to it.
pub struct Transport {
    resource: ResourceId,
    arbiter: Arc<PortArbiter>,
    stream: Mutex<BufReader<DynSerial>>,
    timeout: Duration,
}

impl Transport {
    /// Wrap an open stream.
    pub fn new(resource: ResourceId, stream: DynSerial, arbiter: Arc<PortArbiter>, timeout: Duration) -> Self {
        Self {
            resource,
            arbiter,
            stream: Mutex::new(BufReader::new(stream)),
            timeout,
        }
    }

    /// Resource this transport talks to.
    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    /// Per-reply timeout applied by sessions.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start one exchange: take the port lease, then the stream.
    pub async fn session(&self) -> Result<Session<'_>, ArbiterError> {
        let lease = self.arbiter.acquire(&self.resource).await?;
        let stream = self.stream.lock().await;
        Ok(Session {
            stream,
            _lease: lease,
            resource: &self.resource,
            timeout: self.timeout,
        })
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("resource", &self.resource)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Exclusive access to a [`Transport`] for one exchange.
///
/// Dropping the session releases the stream and the port lease.
pub struct Session<'a> {
    stream: MutexGuard<'a, BufReader<DynSerial>>,
    _lease: PortLease,
    resource: &'a ResourceId,
    timeout: Duration,
}

impl Session<'_> {
    fn io_error(&self, source: std::io::Error) -> TransportError {
        TransportError::Io {
            resource: self.resource.to_string(),
            source,
        }
    }

    fn timed_out(&self) -> TransportError {
        TransportError::Timeout {
            resource: self.resource.to_string(),
            after: self.timeout,
        }
    }

    fn closed(&self) -> TransportError {
        TransportError::Closed {
            resource: self.resource.to_string(),
        }
    }

    /// Resource this transport talks to.
    pub fn resource(&self) -> &ResourceId {
        self.resource
    }

    /// Write `bytes` and flush.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let timeout = self.timeout;
        let port = self.stream.get_mut();
        let write = async {
            port.write_all(bytes).await?;
            port.flush().await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.io_error(e)),
            Err(_) => Err(self.timed_out()),
        }
    }

    /// Read up to and including `delimiter`.
    pub async fn read_until(&mut self, delimiter: u8) -> Result<Vec<u8>, TransportError> {
        let mut buf = Vec::new();
        match tokio::time::timeout(self.timeout, self.stream.read_until(delimiter, &mut buf)).await {
            Ok(Ok(0)) => Err(self.closed()),
            Ok(Ok(_)) if buf.last() != Some(&delimiter) => Err(self.closed()),
            Ok(Ok(_)) => Ok(buf),
            Ok(Err(e)) => Err(self.io_error(e)),
            Err(_) => Err(self.timed_out()),
        }
    }

    /// Read one line terminated by `\n`, with trailing `\r`/`\n` removed.
    pub async fn read_line(&mut self) -> Result<String, TransportError> {
        let raw = self.read_until(b'\n').await?;
        let text = String::from_utf8_lossy(&raw);
        Ok(text.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Read exactly `len` bytes (binary frames).
    pub async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; len];
        match tokio::time::timeout(self.timeout, self.stream.read_exact(&mut buf)).await {
            Ok(Ok(_)) => Ok(buf),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(self.closed()),
            Ok(Err(e)) => Err(self.io_error(e)),
            Err(_) => Err(self.timed_out()),
        }
    }

    /// Send a line-protocol command and return its reply line.
    pub async fn query_line(&mut self, command: &[u8]) -> Result<String, TransportError> {
        self.send(command).await?;
        self.read_line().await
    }

    /// Discard stale bytes (buffered and pending) before a new exchange.
    ///
    /// Returns the number of bytes thrown away.
    pub async fn drain(&mut self, window: Duration) -> usize {
        let buffered = self.stream.buffer().len();
        if buffered > 0 {
            Pin::new(&mut *self.stream).consume(buffered);
        }
        let discarded = buffered + drain_serial_buffer(self.stream.get_mut(), window).await;
        if discarded > 0 {
            tracing::debug!(resource = %self.resource, discarded, "Discarded stale bytes");
        }
        discarded
    }
}

/// Read and discard until nothing arrives within `window`.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, window: Duration) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + window;
    let mut total = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(_)) | Err(_) => break,
        }
    }

    total
}

/// Open a serial port off the async runtime (8N1).
#[cfg(feature = "serial")]
pub async fn open_serial_async(settings: &SerialSettings) -> anyhow::Result<tokio_serial::SerialStream> {
    use anyhow::Context;
    use tokio_serial::SerialPortBuilderExt;

    check_port_exists(&settings.port)?;
    let port = settings.port.clone();
    let baud_rate = settings.baud_rate;
    let timeout = settings.timeout();
    let flow_control = if settings.rts_cts {
        tokio_serial::FlowControl::Hardware
    } else {
        tokio_serial::FlowControl::None
    };

    tokio::task::spawn_blocking(move || {
        tokio_serial::new(&port, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(flow_control)
            .timeout(timeout)
            .open_native_async()
            .with_context(|| format!("failed to open serial port {port} at {baud_rate} baud"))
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

/// Fail early, listing the ports that do exist, when `port` is a missing path.
#[cfg(feature = "serial")]
fn check_port_exists(port: &str) -> anyhow::Result<()> {
    let path = std::path::Path::new(port);
    if !path.is_absolute() || path.exists() {
        return Ok(());
    }
    let available = match serialport::available_ports() {
        Ok(ports) if ports.is_empty() => "no serial ports detected".to_string(),
        Ok(ports) => ports
            .iter()
            .map(|p| p.port_name.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        Err(e) => format!("could not enumerate serial ports: {e}"),
    };
    anyhow::bail!("serial port {port} does not exist (available: {available})")
}

// =============================================================================
// Port Registry
// =============================================================================

static GLOBAL_REGISTRY: OnceLock<Arc<PortRegistry>> = OnceLock::new();

/// Open transports keyed by resource, plus the arbiter they share.
pub struct PortRegistry {
    arbiter: Arc<PortArbiter>,
    ports: RwLock<HashMap<ResourceId, Arc<Transport>>>,
    #[cfg_attr(not(feature = "serial"), allow(dead_code))]
    opening: Mutex<()>,
}

impl PortRegistry {
    /// Empty registry whose transports share `arbiter`.
    pub fn new(arbiter: Arc<PortArbiter>) -> Self {
        Self {
            arbiter,
            ports: RwLock::new(HashMap::new()),
            opening: Mutex::new(()),
        }
    }

    /// Registry backed by an arbiter that only locks within this process.
    pub fn process_local() -> Self {
        Self::new(Arc::new(PortArbiter::process_local()))
    }

    /// Process-wide registry, created with `settings` on first use.
    ///
    /// Later calls return the existing registry and ignore `settings`.
    pub fn init_global(settings: ArbiterSettings) -> Arc<PortRegistry> {
        GLOBAL_REGISTRY
            .get_or_init(|| Arc::new(PortRegistry::new(Arc::new(PortArbiter::new(settings)))))
            .clone()
    }

    /// Process-wide registry with default arbiter settings.
    pub fn global() -> Arc<PortRegistry> {
        Self::init_global(ArbiterSettings::default())
    }

    /// Arbiter shared by every transport.
    pub fn arbiter(&self) -> &Arc<PortArbiter> {
        &self.arbiter
    }

    /// Open transport for `resource`, if any.
    pub fn get(&self, resource: &ResourceId) -> Option<Arc<Transport>> {
        self.ports.read().get(resource).cloned()
    }

    /// Register an already-open stream under `resource`.
    ///
    /// An existing transport for the same resource is kept and returned.
    pub fn attach(&self, resource: ResourceId, stream: DynSerial, timeout: Duration) -> Arc<Transport> {
        let mut ports = self.ports.write();
        ports
            .entry(resource.clone())
            .or_insert_with(|| {
                tracing::debug!(resource = %resource, "Attached transport");
                Arc::new(Transport::new(resource, stream, self.arbiter.clone(), timeout))
            })
            .clone()
    }

    /// Return the transport for `settings.port`, opening the port on first use.
    #[cfg(feature = "serial")]
    pub async fn get_or_open(&self, settings: &SerialSettings) -> anyhow::Result<Arc<Transport>> {
        let resource = settings.resource();
        let _opening = self.opening.lock().await;

        if let Some(existing) = self.get(&resource) {
            tracing::debug!(resource = %resource, "Reusing shared port");
            return Ok(existing);
        }

        let port = open_serial_async(settings).await?;
        tracing::info!(
            resource = %resource,
            baud_rate = settings.baud_rate,
            timeout_ms = settings.timeout_ms,
            "Opened serial port"
        );
        Ok(self.attach(resource, Box::new(port), settings.timeout()))
    }

    /// Forget a transport (e.g. after the port went away). Returns whether one
    /// was registered.
    pub fn remove(&self, resource: &ResourceId) -> bool {
        let removed = self.ports.write().remove(resource).is_some();
        if removed {
            tracing::info!(resource = %resource, "Removed shared port from registry");
        }
        removed
    }

    /// Drop every registered transport.
    pub fn close_all(&self) {
        let mut ports = self.ports.write();
        let count = ports.len();
        ports.clear();
        tracing::info!(count, "Closed all shared ports");
    }

    /// Number of open transports.
    pub fn port_count(&self) -> usize {
        self.ports.read().len()
    }
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self::new(Arc::new(PortArbiter::default()))
    }
}
