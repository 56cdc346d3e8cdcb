//! Protocol module - vendor request codes and control-transfer descriptors.

pub mod constants;
pub mod control;

pub use constants::*;
pub use control::{ControlTransfer, RequestKind, RequestRecipient, TransferDirection};
