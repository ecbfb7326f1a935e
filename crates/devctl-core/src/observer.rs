//! Position update hook.
//!
//! After every operation that queries or changes position, a device calls its
//! observer with the logical position (or, for composites, every axis). The
//! observer routes it wherever the host process wants: a status store, a log,
//! a UI. A failing observer is logged and never aborts the hardware operation.

#[cfg(any(test, feature = "testing"))]
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Payload delivered to a [`PositionObserver`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PositionUpdate {
    /// Logical position of a single-axis device.
    Single(f64),
    /// Logical position of every axis of a composite device.
    Joint(BTreeMap<String, f64>),
}

/// Receives position updates.
pub trait PositionObserver: Send + Sync {
    /// Called with the device name and its new position(s).
    fn on_position_update(&self, device: &str, update: &PositionUpdate) -> anyhow::Result<()>;
}

impl<F> PositionObserver for F
where
    F: Fn(&str, &PositionUpdate) -> anyhow::Result<()> + Send + Sync,
{
    fn on_position_update(&self, device: &str, update: &PositionUpdate) -> anyhow::Result<()> {
        self(device, update)
    }
}

/// Shared observer handle.
pub type SharedObserver = Arc<dyn PositionObserver>;

/// Deliver `update`, logging (not propagating) a failure.
pub fn notify(observer: Option<&SharedObserver>, device: &str, update: PositionUpdate) {
    if let Some(observer) = observer {
        if let Err(e) = observer.on_position_update(device, &update) {
            tracing::warn!(device, error = %e, "Position observer failed");
        }
    }
}

/// Observer that emits every update as a tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl PositionObserver for TracingObserver {
    fn on_position_update(&self, device: &str, update: &PositionUpdate) -> anyhow::Result<()> {
        match update {
            PositionUpdate::Single(position) => tracing::info!(device, position, "Position update"),
            PositionUpdate::Joint(positions) => tracing::info!(device, ?positions, "Position update"),
        }
        Ok(())
    }
}

/// Observer that keeps every update in memory.
#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Default)]
pub struct RecordingObserver {
    updates: Mutex<Vec<(String, PositionUpdate)>>,
}

#[cfg(any(test, feature = "testing"))]
impl RecordingObserver {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every update so far, oldest first.
    pub fn updates(&self) -> Vec<(String, PositionUpdate)> {
        self.updates.lock().clone()
    }

    /// Number of updates received.
    pub fn len(&self) -> usize {
        self.updates.lock().len()
    }

    /// Whether nothing was received yet.
    pub fn is_empty(&self) -> bool {
        self.updates.lock().is_empty()
    }

    /// Most recent update.
    pub fn last(&self) -> Option<(String, PositionUpdate)> {
        self.updates.lock().last().cloned()
    }
}

#[cfg(any(test, feature = "testing"))]
impl PositionObserver for RecordingObserver {
    fn on_position_update(&self, device: &str, update: &PositionUpdate) -> anyhow::Result<()> {
        self.updates.lock().push((device.to_string(), update.clone()));
        Ok(())
    }
}
