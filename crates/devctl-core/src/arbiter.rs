//! Port arbitration for shared physical resources.
//!
//! Several logical devices can sit behind one physical port (stages chained on
//! an RS-485 bus), and separate daemon processes can open the same port path.
//! [`PortArbiter`] hands out a [`PortLease`] per command exchange:
//!
//! 1. a process-local async mutex keyed by [`ResourceId`] serialises tasks and
//!    threads in this process;
//! 2. an advisory `flock` on a sidecar file in the lock directory serialises
//!    independent processes (unix only).
//!
//! A lease is dropped at the end of every exchange, on every exit path. It is
//! never held across a whole move, so a `stop()` from another caller can get
//! onto the bus between two polls of a waiting move.
//!
//! Acquisition blocks while contended. With `acquire_timeout_ms` set it becomes
//! a bounded wait that fails with [`ArbiterError::Timeout`].

use crate::error::ArbiterError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

// =============================================================================
// Resource Identity
// =============================================================================

/// Stable identifier of one physical resource (normalised port path, bus
/// address, or host:port pair).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(String);

impl ResourceId {
    /// Use `id` verbatim.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identify a serial port by path.
    ///
    /// Symlinks such as `/dev/serial/by-id/...` are resolved so that two
    /// configuration files naming the same port differently still share one
    /// lock. Paths that do not exist are used as given.
    pub fn from_port_path(path: &str) -> Self {
        match std::fs::canonicalize(path) {
            Ok(resolved) => Self(resolved.to_string_lossy().into_owned()),
            Err(_) => Self(path.to_string()),
        }
    }

    /// Identifier as given.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of the sidecar lock for this resource.
    ///
    /// `/` becomes `_`; anything outside `[A-Za-z0-9.-]`, `_` and `%`
    /// included, is percent-encoded byte by byte, so distinct ids never share
    /// a lock file.
    pub fn lock_file_name(&self) -> String {
        let mut name = String::with_capacity(self.0.len() + 5);
        for byte in self.0.bytes() {
            match byte {
                b'/' => name.push('_'),
                b'-' | b'.' => name.push(byte as char),
                _ if byte.is_ascii_alphanumeric() => name.push(byte as char),
                _ => name.push_str(&format!("%{:02X}", byte)),
            }
        }
        name.push_str(".lock");
        name
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Arbiter configuration (`[arbiter]` section of the runtime settings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbiterSettings {
    /// Directory holding the sidecar lock files. Defaults to
    /// `<tmp>/devctl-locks`.
    #[serde(default)]
    pub lock_dir: Option<PathBuf>,
    /// Give up after this long instead of waiting forever.
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,
    /// Sleep between non-blocking lock attempts on the sidecar file.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Take the sidecar file lock in addition to the in-process lock.
    #[serde(default = "default_cross_process")]
    pub cross_process: bool,
}

fn default_poll_interval_ms() -> u64 {
    5
}

fn default_cross_process() -> bool {
    true
}

impl Default for ArbiterSettings {
    fn default() -> Self {
        Self {
            lock_dir: None,
            acquire_timeout_ms: None,
            poll_interval_ms: default_poll_interval_ms(),
            cross_process: default_cross_process(),
        }
    }
}

impl ArbiterSettings {
    /// Bound on lease acquisition, `None` for an unbounded wait.
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }

    /// Sleep between non-blocking attempts on the sidecar lock.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

// =============================================================================
// PortArbiter
// =============================================================================

/// Named mutex keyed by resource identity, safe across tasks, threads and
/// processes.
pub struct PortArbiter {
    settings: ArbiterSettings,
    local: Mutex<HashMap<ResourceId, Arc<tokio::sync::Mutex<()>>>>,
}

impl PortArbiter {
    /// Arbiter using `settings`.
    pub fn new(settings: ArbiterSettings) -> Self {
        Self {
            settings,
            local: Mutex::new(HashMap::new()),
        }
    }

    /// Arbiter that only serialises callers inside this process.
    pub fn process_local() -> Self {
        Self::new(ArbiterSettings {
            cross_process: false,
            ..Default::default()
        })
    }

    /// Settings this arbiter was built with.
    pub fn settings(&self) -> &ArbiterSettings {
        &self.settings
    }

    /// Directory where sidecar lock files are created.
    pub fn lock_dir(&self) -> PathBuf {
        self.settings
            .lock_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("devctl-locks"))
    }

    fn local_mutex(&self, resource: &ResourceId) -> Arc<tokio::sync::Mutex<()>> {
        let mut local = self.local.lock();
        local
            .entry(resource.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Take exclusive access to `resource` for one exchange.
    ///
    /// Blocks while another holder (task, thread or process) has it. The
    /// returned lease releases both locks when dropped.
    pub async fn acquire(&self, resource: &ResourceId) -> Result<PortLease, ArbiterError> {
        let started = Instant::now();
        let deadline = self.settings.acquire_timeout().map(|t| started + t);
        let mutex = self.local_mutex(resource);

        let local = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, mutex.lock_owned())
                .await
                .map_err(|_| ArbiterError::Timeout {
                    resource: resource.to_string(),
                    waited: started.elapsed(),
                })?,
            None => mutex.lock_owned().await,
        };

        #[cfg(unix)]
        let file = if self.settings.cross_process {
            Some(self.lock_file(resource, started, deadline).await?)
        } else {
            None
        };

        let waited = started.elapsed();
        if waited > Duration::from_millis(50) {
            tracing::debug!(resource = %resource, waited_ms = waited.as_millis() as u64, "Port lease acquired after contention");
        }

        Ok(PortLease {
            resource: resource.clone(),
            acquired_at: Instant::now(),
            #[cfg(unix)]
            _file: file,
            _local: local,
        })
    }

    #[cfg(unix)]
    async fn lock_file(
        &self,
        resource: &ResourceId,
        started: Instant,
        deadline: Option<Instant>,
    ) -> Result<nix::fcntl::Flock<std::fs::File>, ArbiterError> {
        use nix::errno::Errno;
        use nix::fcntl::{Flock, FlockArg};

        let dir = self.lock_dir();
        let path = dir.join(resource.lock_file_name());
        let lock_err = |source: std::io::Error| ArbiterError::LockFile {
            resource: resource.to_string(),
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(&dir).map_err(lock_err)?;
        let mut file = open_lock_file(&path).map_err(lock_err)?;

        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(locked) => return Ok(locked),
                Err((returned, errno)) if errno == Errno::EWOULDBLOCK => file = returned,
                Err((_, errno)) => return Err(lock_err(std::io::Error::from(errno))),
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(ArbiterError::Timeout {
                        resource: resource.to_string(),
                        waited: started.elapsed(),
                    });
                }
            }
            tokio::time::sleep(self.settings.poll_interval()).await;
        }
    }
}

impl Default for PortArbiter {
    fn default() -> Self {
        Self::new(ArbiterSettings::default())
    }
}

#[cfg(unix)]
fn open_lock_file(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
}

/// Exclusive access to one resource; released on drop.
pub struct PortLease {
    resource: ResourceId,
    acquired_at: Instant,
    #[cfg(unix)]
    _file: Option<nix::fcntl::Flock<std::fs::File>>,
    _local: OwnedMutexGuard<()>,
}

impl PortLease {
    /// Resource this lease covers.
    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    /// Release explicitly (equivalent to dropping).
    pub fn release(self) {}
}

impl Drop for PortLease {
    fn drop(&mut self) {
        tracing::trace!(
            resource = %self.resource,
            held_us = self.acquired_at.elapsed().as_micros() as u64,
            "Port lease released"
        );
    }
}
