//! Bring-up state machine.
//!
//! States only ever move forward:
//!
//! ```text
//! Idle -> FirmwareLoaded -> BitstreamLoaded -> Activated -> Streaming
//!   \__________________________/
//! any -> Failed (terminal)
//! ```

use std::fmt;

use thiserror::Error;

/// Bring-up progress of one device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum BringupState {
    /// Nothing replayed yet.
    #[default]
    Idle,
    /// USB controller firmware script replayed.
    FirmwareLoaded,
    /// FPGA bitstream script replayed.
    BitstreamLoaded,
    /// Settle delay elapsed; ready for activation.
    Activated,
    /// Activation succeeded; keep-alive and capture may run.
    Streaming,
    /// Resource acquisition failed. Terminal.
    Failed,
}

impl fmt::Display for BringupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BringupState::Idle => write!(f, "IDLE"),
            BringupState::FirmwareLoaded => write!(f, "FIRMWARE_LOADED"),
            BringupState::BitstreamLoaded => write!(f, "BITSTREAM_LOADED"),
            BringupState::Activated => write!(f, "ACTIVATED"),
            BringupState::Streaming => write!(f, "STREAMING"),
            BringupState::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Illegal bring-up transition {from} -> {to}")]
pub struct StateError {
    pub from: BringupState,
    pub to: BringupState,
}

impl BringupState {
    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition(self, next: BringupState) -> bool {
        use BringupState::*;
        matches!(
            (self, next),
            (Idle, FirmwareLoaded)
                | (Idle, BitstreamLoaded)
                | (FirmwareLoaded, BitstreamLoaded)
                | (BitstreamLoaded, Activated)
                | (Activated, Streaming)
        ) || (next == Failed && self != Failed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BringupState::Failed)
    }

    /// Keep-alive and capture may only run here.
    pub fn is_streaming(self) -> bool {
        matches!(self, BringupState::Streaming)
    }
}

/// Tracks the bring-up state and enforces forward-only transitions.
#[derive(Debug, Default)]
pub struct BringupTracker {
    state: BringupState,
    history: Vec<BringupState>,
}

impl BringupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> BringupState {
        self.state
    }

    /// States visited so far, excluding the initial `Idle`.
    pub fn history(&self) -> &[BringupState] {
        &self.history
    }

    /// Whether the session ever reached `state`.
    pub fn reached(&self, state: BringupState) -> bool {
        self.state == state || self.history.contains(&state)
    }

    /// Transition to a new state.
    pub fn goto_state(&mut self, new_state: BringupState) -> Result<(), StateError> {
        if !self.state.can_transition(new_state) {
            return Err(StateError {
                from: self.state,
                to: new_state,
            });
        }
        tracing::info!(from = %self.state, to = %new_state, "State transition");
        self.state = new_state;
        self.history.push(new_state);
        Ok(())
    }

    /// Enter `Failed`. A no-op when already failed.
    pub fn fail(&mut self) {
        if self.state != BringupState::Failed {
            tracing::error!(from = %self.state, "Bring-up failed");
            self.state = BringupState::Failed;
            self.history.push(BringupState::Failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_forward_path() {
        let mut tracker = BringupTracker::new();
        tracker.goto_state(BringupState::FirmwareLoaded).unwrap();
        tracker.goto_state(BringupState::BitstreamLoaded).unwrap();
        tracker.goto_state(BringupState::Activated).unwrap();
        tracker.goto_state(BringupState::Streaming).unwrap();
        assert!(tracker.state().is_streaming());
        assert_eq!(tracker.history().len(), 4);
    }

    #[test]
    fn test_stage2_skips_firmware() {
        let mut tracker = BringupTracker::new();
        tracker.goto_state(BringupState::BitstreamLoaded).unwrap();
        assert!(!tracker.reached(BringupState::FirmwareLoaded));
    }

    #[test]
    fn test_backward_and_skipping_rejected() {
        let mut tracker = BringupTracker::new();
        tracker.goto_state(BringupState::BitstreamLoaded).unwrap();
        assert!(tracker.goto_state(BringupState::FirmwareLoaded).is_err());
        assert!(tracker.goto_state(BringupState::Streaming).is_err());
        assert!(tracker.goto_state(BringupState::BitstreamLoaded).is_err());
        assert_eq!(tracker.state(), BringupState::BitstreamLoaded);
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut tracker = BringupTracker::new();
        tracker.goto_state(BringupState::FirmwareLoaded).unwrap();
        tracker.fail();
        assert!(tracker.state().is_terminal());
        assert!(tracker.goto_state(BringupState::BitstreamLoaded).is_err());
        assert!(tracker.goto_state(BringupState::Failed).is_err());
    }
}
