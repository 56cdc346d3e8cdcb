//! Activation handshake, run once after the bitstream is loaded.
//!
//! The probe and status read are vendor "unlocks" whose meaning is unknown;
//! request codes, values and buffer sizes must match exactly.

use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::device::DeviceSession;
use crate::events::{CaptureEvent, CaptureObserver, LogLevel, Resource};
use crate::protocol::ControlTransfer;
use crate::protocol::constants::*;
use crate::state::{BringupState, StateError};
use crate::transport::{TransportError, UsbTransport};

#[derive(Error, Debug)]
pub enum ActivationError {
    #[error("Unable to acquire {resource}: {source}")]
    Resource {
        resource: Resource,
        #[source]
        source: TransportError,
    },
    #[error(transparent)]
    State(#[from] StateError),
}

/// What activation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
    /// Address of the capture endpoint.
    pub endpoint: u8,
    /// Bytes returned by the status read, if it succeeded.
    pub status_blob: Option<Vec<u8>>,
}

/// The null probe: 39 zero bytes to the register-write request.
pub fn activation_probe() -> ControlTransfer {
    ControlTransfer::vendor_out(VENDOR_REQ_REGISTER_WRITE, 0, 0, &[0u8; ACTIVATION_PROBE_LEN])
}

/// The 12-byte diagnostic status read.
pub fn activation_status_read() -> ControlTransfer {
    ControlTransfer::vendor_in(VENDOR_REQ_STATUS_READ, 0, 0, ACTIVATION_STATUS_LEN)
}

pub struct ActivationRoutine<'a, O: CaptureObserver + ?Sized> {
    observer: &'a O,
    settle_delay: Duration,
}

impl<'a, O: CaptureObserver + ?Sized> ActivationRoutine<'a, O> {
    pub fn new(observer: &'a O) -> Self {
        Self {
            observer,
            settle_delay: ACTIVATION_SETTLE_DELAY,
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Settle, acquire config/interface/endpoint, then unlock the device.
    ///
    /// Only valid from `BitstreamLoaded`, so it runs at most once per
    /// session: success leaves the session `Streaming`, a resource failure
    /// leaves it `Failed`.
    pub fn run<T: UsbTransport>(
        &self,
        session: &mut DeviceSession<T>,
    ) -> Result<ActivationReport, ActivationError> {
        let from = session.state();
        if from != BringupState::BitstreamLoaded {
            return Err(StateError {
                from,
                to: BringupState::Activated,
            }
            .into());
        }

        self.log(
            LogLevel::Info,
            format!("Activating in {} ms", self.settle_delay.as_millis()),
        );
        thread::sleep(self.settle_delay);
        self.transition(session, BringupState::Activated)?;

        self.acquire(session, Resource::Config, |s| {
            s.acquire_configuration(CAPTURE_CONFIGURATION)
        })?;
        self.acquire(session, Resource::Interface, |s| {
            s.claim_interface(CAPTURE_INTERFACE, CAPTURE_ALT_SETTING)
        })?;
        let endpoint = self.acquire(session, Resource::Endpoint, |s| {
            s.resolve_in_endpoint(CAPTURE_ENDPOINT_NUMBER)
        })?;

        if let Err(e) = session.control(&activation_probe()) {
            self.log(LogLevel::Warn, format!("Null probe failed: {}", e));
        }

        let status_blob = match session.control(&activation_status_read()) {
            Ok(data) => {
                self.observer.on_event(&CaptureEvent::Diagnostic {
                    label: "activation-status".into(),
                    data: data.clone(),
                });
                Some(data)
            }
            Err(e) => {
                self.log(LogLevel::Warn, format!("Status read failed: {}", e));
                None
            }
        };

        self.transition(session, BringupState::Streaming)?;
        Ok(ActivationReport {
            endpoint,
            status_blob,
        })
    }

    fn acquire<T: UsbTransport, R>(
        &self,
        session: &mut DeviceSession<T>,
        resource: Resource,
        step: impl FnOnce(&mut DeviceSession<T>) -> Result<R, TransportError>,
    ) -> Result<R, ActivationError> {
        match step(session) {
            Ok(value) => {
                self.observer
                    .on_event(&CaptureEvent::ResourceAcquired { resource });
                Ok(value)
            }
            Err(source) => {
                self.log(
                    LogLevel::Error,
                    format!("Unable to grab {}: {}", resource, source),
                );
                let from = session.state();
                session.fail();
                self.observer.on_event(&CaptureEvent::PhaseChanged {
                    from,
                    to: BringupState::Failed,
                });
                Err(ActivationError::Resource { resource, source })
            }
        }
    }

    fn transition<T: UsbTransport>(
        &self,
        session: &mut DeviceSession<T>,
        to: BringupState,
    ) -> Result<(), StateError> {
        let from = session.state();
        session.advance(to)?;
        self.observer
            .on_event(&CaptureEvent::PhaseChanged { from, to });
        Ok(())
    }

    fn log(&self, level: LogLevel, message: String) {
        self.observer
            .on_event(&CaptureEvent::Log { level, message });
    }
}
