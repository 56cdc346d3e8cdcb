//! Bring-up: script replay and the activation handshake.

pub mod activation;
pub mod sequencer;

pub use activation::{
    ActivationError, ActivationReport, ActivationRoutine, activation_probe,
    activation_status_read,
};
pub use sequencer::{BringupSequencer, ReplayReport};
