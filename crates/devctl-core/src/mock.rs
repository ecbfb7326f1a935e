//! Simulated motion stage.
//!
//! [`SimulatedStage`] implements [`Driver`] entirely in memory. A move or home
//! completes after a configurable number of state polls, so `wait=true` loops
//! can be exercised deterministically. Transient failures can be injected to
//! exercise the retry path.
//!
//! Registered under driver type `mock`:
//!
//! ```toml
//! [driver]
//! type = "mock"
//! position = 0.0
//! settle_polls = 3
//! referenced = true
//! min = -25.0
//! max = 25.0
//! ```

use crate::driver::{Driver, DriverConfig, DriverFactory};
use crate::error::{DriverError, TransportError};
use crate::state::{DriverState, MotionPhase};
use crate::transport::PortRegistry;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct SimState {
    position: f64,
    target: f64,
    phase: MotionPhase,
    from: Option<MotionPhase>,
    polls_remaining: u32,
    pending_failures: u32,
    exchanges: u32,
    log: Vec<String>,
}

/// In-memory stage with scripted motion timing.
#[derive(Debug)]
pub struct SimulatedStage {
    state: Mutex<SimState>,
    settle_polls: u32,
    limits: Option<(f64, f64)>,
}

impl SimulatedStage {
    /// Referenced stage at `position` that settles after `settle_polls` polls.
    pub fn new(position: f64, settle_polls: u32) -> Self {
        Self {
            state: Mutex::new(SimState {
                position,
                target: position,
                phase: MotionPhase::Ready,
                from: None,
                polls_remaining: 0,
                pending_failures: 0,
                exchanges: 0,
                log: Vec::new(),
            }),
            settle_polls,
            limits: None,
        }
    }

    /// Reject targets outside `min..=max`.
    pub fn with_limits(mut self, min: f64, max: f64) -> Self {
        self.limits = Some((min, max));
        self
    }

    /// Start in `phase` (e.g. `NotReferenced` or `Disabled`).
    pub fn with_phase(self, phase: MotionPhase) -> Self {
        self.state.lock().phase = phase;
        self
    }

    /// Fail the next `count` exchanges with a reply timeout.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().pending_failures = count;
    }

    /// Force the controller phase, e.g. to simulate a fault.
    pub fn set_phase(&self, phase: MotionPhase) {
        let mut state = self.state.lock();
        state.from = Some(state.phase);
        state.phase = phase;
    }

    /// Raw position without going through an exchange.
    pub fn raw_position(&self) -> f64 {
        self.state.lock().position
    }

    /// Current phase without an exchange.
    pub fn phase(&self) -> MotionPhase {
        self.state.lock().phase
    }

    /// Exchanges attempted so far, failed ones included.
    pub fn exchanges(&self) -> u32 {
        self.state.lock().exchanges
    }

    /// Commands accepted so far, e.g. `"move_absolute 12.5"`.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    fn exchange<T>(&self, f: impl FnOnce(&mut SimState) -> Result<T, DriverError>) -> Result<T, DriverError> {
        let mut state = self.state.lock();
        state.exchanges += 1;
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            return Err(DriverError::Transport(TransportError::Timeout {
                resource: "simulated".to_string(),
                after: Duration::from_millis(1),
            }));
        }
        f(&mut state)
    }

    fn begin_motion(&self, state: &mut SimState, phase: MotionPhase, target: f64) {
        state.from = Some(state.phase);
        state.target = target;
        if self.settle_polls == 0 {
            state.position = target;
            state.phase = MotionPhase::Ready;
        } else {
            state.phase = phase;
            state.polls_remaining = self.settle_polls;
        }
    }
}

fn check_ready(state: &SimState) -> Result<(), DriverError> {
    match state.phase {
        MotionPhase::Ready => Ok(()),
        phase => Err(DriverError::Controller(format!("stage is {}", phase))),
    }
}

#[async_trait]
impl Driver for SimulatedStage {
    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn get_position(&self) -> Result<f64, DriverError> {
        self.exchange(|s| Ok(s.position))
    }

    async fn get_target_position(&self) -> Result<f64, DriverError> {
        self.exchange(|s| Ok(s.target))
    }

    async fn move_absolute(&self, raw: f64) -> Result<(), DriverError> {
        self.validate_target(raw)?;
        self.exchange(|s| {
            check_ready(s)?;
            s.log.push(format!("move_absolute {}", raw));
            self.begin_motion(s, MotionPhase::Moving, raw);
            Ok(())
        })
    }

    async fn move_relative(&self, delta: f64) -> Result<(), DriverError> {
        let target = self.state.lock().position + delta;
        self.validate_target(target)?;
        self.exchange(|s| {
            check_ready(s)?;
            s.log.push(format!("move_relative {}", delta));
            let target = s.position + delta;
            self.begin_motion(s, MotionPhase::Moving, target);
            Ok(())
        })
    }

    async fn home(&self) -> Result<(), DriverError> {
        self.exchange(|s| {
            s.log.push("home".to_string());
            self.begin_motion(s, MotionPhase::Homing, 0.0);
            Ok(())
        })
    }

    async fn stop(&self) -> Result<(), DriverError> {
        self.exchange(|s| {
            s.log.push("stop".to_string());
            if matches!(s.phase, MotionPhase::Moving | MotionPhase::Homing) {
                s.from = Some(s.phase);
                s.phase = MotionPhase::Ready;
                s.target = s.position;
                s.polls_remaining = 0;
            }
            Ok(())
        })
    }

    async fn get_state(&self) -> Result<DriverState, DriverError> {
        self.exchange(|s| {
            if matches!(s.phase, MotionPhase::Moving | MotionPhase::Homing) {
                s.polls_remaining = s.polls_remaining.saturating_sub(1);
                if s.polls_remaining == 0 {
                    s.position = s.target;
                    s.from = Some(s.phase);
                    s.phase = MotionPhase::Ready;
                }
            }
            Ok(DriverState {
                phase: s.phase,
                from: s.from,
            })
        })
    }

    async fn reset(&self) -> Result<(), DriverError> {
        self.exchange(|s| {
            s.log.push("reset".to_string());
            s.from = Some(s.phase);
            s.phase = MotionPhase::NotReferenced;
            s.polls_remaining = 0;
            Ok(())
        })
    }

    async fn identify(&self) -> Result<String, DriverError> {
        Ok("Simulated stage".to_string())
    }

    fn validate_target(&self, raw: f64) -> Result<(), DriverError> {
        if !raw.is_finite() {
            return Err(DriverError::InvalidInput(format!("target {} is not finite", raw)));
        }
        match self.limits {
            Some((min, max)) if raw < min || raw > max => Err(DriverError::InvalidInput(format!(
                "target {} outside travel {}..={}",
                raw, min, max
            ))),
            _ => Ok(()),
        }
    }
}

/// Factory for driver type `mock`.
pub struct SimulatedStageFactory;

impl DriverFactory for SimulatedStageFactory {
    fn driver_type(&self) -> &'static str {
        "mock"
    }

    fn name(&self) -> &'static str {
        "Simulated motion stage"
    }

    fn validate(&self, config: &DriverConfig) -> anyhow::Result<()> {
        config.option_f64("position")?;
        config.option_i64("settle_polls")?;
        config.option_bool("referenced")?;
        if let (Some(min), Some(max)) = (config.option_f64("min")?, config.option_f64("max")?) {
            anyhow::ensure!(min <= max, "min ({min}) must not exceed max ({max})");
        }
        Ok(())
    }

    fn build(
        &self,
        config: DriverConfig,
        _ports: Arc<PortRegistry>,
    ) -> BoxFuture<'static, anyhow::Result<Arc<dyn Driver>>> {
        Box::pin(async move {
            let position = config.option_f64("position")?.unwrap_or(0.0);
            let settle_polls = config.option_i64("settle_polls")?.unwrap_or(1).clamp(0, 10_000) as u32;
            let mut stage = SimulatedStage::new(position, settle_polls);
            if let (Some(min), Some(max)) = (config.option_f64("min")?, config.option_f64("max")?) {
                stage = stage.with_limits(min, max);
            }
            if !config.option_bool("referenced")?.unwrap_or(true) {
                stage = stage.with_phase(MotionPhase::NotReferenced);
            }
            Ok(Arc::new(stage) as Arc<dyn Driver>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverSection;

    #[tokio::test]
    async fn test_move_settles_after_polls() {
        let stage = SimulatedStage::new(0.0, 2);
        stage.move_absolute(5.0).await.unwrap();
        assert!(stage.get_state().await.unwrap().is_moving());
        assert!(stage.get_state().await.unwrap().is_ready());
        assert_eq!(stage.get_position().await.unwrap(), 5.0);
    }

    #[tokio::test]
    async fn test_stop_freezes_position() {
        let stage = SimulatedStage::new(1.0, 100);
        stage.move_absolute(9.0).await.unwrap();
        stage.stop().await.unwrap();
        assert!(stage.get_state().await.unwrap().is_ready());
        assert_eq!(stage.get_position().await.unwrap(), 1.0);
        assert_eq!(stage.commands(), vec!["move_absolute 9", "stop"]);
    }

    #[tokio::test]
    async fn test_factory_reads_options() {
        let section = DriverSection::new("mock")
            .with_option("position", 2.5)
            .with_option("referenced", false);
        let config = DriverConfig::new("stage", section, None);
        let factory = SimulatedStageFactory;
        factory.validate(&config).unwrap();
        let driver = factory
            .build(config, Arc::new(PortRegistry::process_local()))
            .await
            .unwrap();
        assert_eq!(driver.get_position().await.unwrap(), 2.5);
        assert!(driver.get_state().await.unwrap().needs_homing());
    }
}
