//! Controller protocol state.
//!
//! Motion controllers report a small finite set of states. The CONEX family is
//! the most detailed (it also reports which state it came from); simpler
//! controllers map onto a subset. The Motion Device only ever consults the
//! predicates below, and always on a freshly queried [`DriverState`].

use serde::{Deserialize, Serialize};

/// One controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionPhase {
    /// Powered up or reset, no reference search done yet.
    NotReferenced,
    /// Controller is in its parameter-configuration mode.
    Configuration,
    /// Reference search in progress.
    Homing,
    /// Executing a move.
    Moving,
    /// Idle and able to accept a move.
    Ready,
    /// Motor output disabled.
    Disabled,
    /// Controller is resetting.
    Reset,
}

impl MotionPhase {
    /// Human-readable label
    pub fn label(&self) -> &'static str {
        match self {
            MotionPhase::NotReferenced => "NotReferenced",
            MotionPhase::Configuration => "Configuration",
            MotionPhase::Homing => "Homing",
            MotionPhase::Moving => "Moving",
            MotionPhase::Ready => "Ready",
            MotionPhase::Disabled => "Disabled",
            MotionPhase::Reset => "Reset",
        }
    }
}

impl std::fmt::Display for MotionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Current controller state, optionally annotated with the state it came from.
///
/// `from` is diagnostic only and never used in decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverState {
    /// Current phase.
    pub phase: MotionPhase,
    /// Previous phase, when the controller reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<MotionPhase>,
}

impl DriverState {
    /// State without a recorded predecessor.
    pub const fn new(phase: MotionPhase) -> Self {
        Self { phase, from: None }
    }

    /// State reached from `from`.
    pub const fn from_phase(phase: MotionPhase, from: MotionPhase) -> Self {
        Self {
            phase,
            from: Some(from),
        }
    }

    /// Shorthand for an idle controller.
    pub const fn ready() -> Self {
        Self::new(MotionPhase::Ready)
    }

    /// Executing a move.
    pub fn is_moving(&self) -> bool {
        self.phase == MotionPhase::Moving
    }

    /// Running the reference search.
    pub fn is_homing(&self) -> bool {
        self.phase == MotionPhase::Homing
    }

    /// Idle and able to take a move.
    pub fn is_ready(&self) -> bool {
        self.phase == MotionPhase::Ready
    }

    /// Controller has lost (or never had) its reference.
    pub fn needs_homing(&self) -> bool {
        self.phase == MotionPhase::NotReferenced
    }

    /// Motor power is on.
    pub fn is_enabled(&self) -> bool {
        self.phase != MotionPhase::Disabled
    }

    /// Controller is doing something a new move must wait for.
    pub fn is_busy(&self) -> bool {
        matches!(
            self.phase,
            MotionPhase::Moving | MotionPhase::Homing | MotionPhase::Configuration | MotionPhase::Reset
        )
    }
}

impl std::fmt::Display for DriverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.from {
            Some(from) => write!(f, "{} from {}", self.phase, from),
            None => write!(f, "{}", self.phase),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates_follow_phase() {
        let ready = DriverState::from_phase(MotionPhase::Ready, MotionPhase::Moving);
        assert!(ready.is_ready());
        assert!(!ready.is_busy());
        assert!(ready.is_enabled());

        let unreferenced = DriverState::from_phase(MotionPhase::NotReferenced, MotionPhase::Reset);
        assert!(unreferenced.needs_homing());
        assert!(!unreferenced.is_ready());

        let disabled = DriverState::new(MotionPhase::Disabled);
        assert!(!disabled.is_enabled());
        assert!(!disabled.is_busy());

        assert!(DriverState::new(MotionPhase::Homing).is_busy());
        assert!(DriverState::new(MotionPhase::Moving).is_moving());
    }

    #[test]
    fn test_display_includes_origin() {
        let state = DriverState::from_phase(MotionPhase::Disabled, MotionPhase::Moving);
        assert_eq!(state.to_string(), "Disabled from Moving");
        assert_eq!(DriverState::ready().to_string(), "Ready");
    }
}
