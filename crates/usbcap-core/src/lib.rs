//! usbcap-core: bring-up and bulk capture for a vendor USB capture device.
//!
//! The device enumerates blank. A firmware script is replayed to its USB
//! controller (stage 1); after it re-enumerates, a bitstream script loads
//! the FPGA (stage 2), an activation handshake claims the capture endpoint
//! and two threads take over: one sends keep-alive writes, the other
//! streams bulk data to a file.
//!
//! # Architecture
//!
//! - **Protocol**: Device constants and the control transfer descriptor
//! - **Transport**: USB communication abstraction (nusb, mock)
//! - **Script**: Control scripts in TOML or packed binary form, progress ticks
//! - **State**: Forward-only bring-up state machine
//! - **Device**: Exclusive handle pairing the transport with its state
//! - **Bring-up**: Script replay and activation
//! - **Stream**: Keep-alive, bulk capture and the stop signal
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use usbcap_core::session::{CaptureSession, SessionConfig, Stage};
//!
//! let config = SessionConfig {
//!     bitstream_script: "scripts/bitstream.toml".to_string(),
//!     capture_secs: Some(10),
//!     ..Default::default()
//! };
//!
//! let session = CaptureSession::new(config);
//! session.run(Stage::Bitstream).expect("capture failed");
//! ```

pub mod bringup;
pub mod device;
pub mod events;
pub mod protocol;
pub mod script;
pub mod session;
pub mod state;
pub mod stream;
pub mod transport;

// Re-exports for convenience
pub use bringup::{ActivationError, ActivationRoutine, BringupSequencer, ReplayReport};
pub use device::DeviceSession;
pub use events::{CaptureEvent, CaptureObserver, LogLevel, TracingObserver};
pub use protocol::ControlTransfer;
pub use script::{ControlScript, ScriptError, ScriptKind};
pub use session::{CaptureSession, SessionConfig, SessionOutcome, Stage};
pub use state::{BringupState, StateError};
pub use stream::{KeepAliveFailurePolicy, RetryPolicy, StopSignal, StreamError};
pub use transport::{MockTransport, NusbTransport, TransportError, UsbTransport};
