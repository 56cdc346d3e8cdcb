//! Device session: one opened capture peripheral and the resources claimed on it.
//!
//! The session owns its transport exclusively. Bring-up mutates it serially
//! (`&mut self`); once streaming starts it is shared by reference between the
//! keep-alive and capture threads, relying on the transport's concurrency
//! contract (see [`UsbTransport`]). Resources are released when the session
//! is dropped, on every exit path.

use std::time::Duration;

use tracing::{debug, info};

use crate::protocol::ControlTransfer;
use crate::state::{BringupState, BringupTracker, StateError};
use crate::transport::{InterfaceSummary, NusbTransport, TransportError, UsbTransport};

pub struct DeviceSession<T: UsbTransport> {
    transport: T,
    tracker: BringupTracker,
    configuration: Option<u8>,
    interface: Option<(u8, u8)>,
    endpoint: Option<u8>,
}

impl DeviceSession<NusbTransport> {
    /// Open the device with the given VID/PID. Failure is fatal for the caller.
    pub fn open(vid: u16, pid: u16, control_timeout: Duration) -> Result<Self, TransportError> {
        Ok(Self::new(NusbTransport::open_with_ids(
            vid,
            pid,
            control_timeout,
        )?))
    }
}

impl<T: UsbTransport> DeviceSession<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            tracker: BringupTracker::new(),
            configuration: None,
            interface: None,
            endpoint: None,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn state(&self) -> BringupState {
        self.tracker.state()
    }

    pub fn advance(&mut self, to: BringupState) -> Result<(), StateError> {
        self.tracker.goto_state(to)
    }

    pub fn fail(&mut self) {
        self.tracker.fail();
    }

    /// Issue one control transfer.
    pub fn control(&self, transfer: &ControlTransfer) -> Result<Vec<u8>, TransportError> {
        self.transport.control(transfer)
    }

    pub fn acquire_configuration(&mut self, config: u8) -> Result<(), TransportError> {
        self.transport.set_configuration(config)?;
        self.configuration = Some(config);
        Ok(())
    }

    pub fn claim_interface(&mut self, interface: u8, alt_setting: u8) -> Result<(), TransportError> {
        self.transport.claim_interface(interface, alt_setting)?;
        self.interface = Some((interface, alt_setting));
        Ok(())
    }

    /// Resolve the bulk IN capture endpoint; returns its address.
    pub fn resolve_in_endpoint(&mut self, number: u8) -> Result<u8, TransportError> {
        let address = self.transport.resolve_in_endpoint(number)?;
        self.endpoint = Some(address);
        Ok(address)
    }

    /// One bulk read from the capture endpoint.
    pub fn read_bulk(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        if self.endpoint.is_none() {
            return Err(TransportError::NotClaimed);
        }
        self.transport.read_bulk(max_len)
    }

    pub fn configuration(&self) -> Option<u8> {
        self.configuration
    }

    pub fn interface(&self) -> Option<(u8, u8)> {
        self.interface
    }

    pub fn endpoint(&self) -> Option<u8> {
        self.endpoint
    }

    pub fn describe(&self, config: u8) -> Vec<InterfaceSummary> {
        self.transport.describe(config)
    }

    pub fn vendor_id(&self) -> u16 {
        self.transport.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.transport.product_id()
    }
}

impl<T: UsbTransport> Drop for DeviceSession<T> {
    fn drop(&mut self) {
        if let Some(ep) = self.endpoint {
            debug!(endpoint = %format!("0x{:02X}", ep), "Releasing capture endpoint");
        }
        if let Some((iface, alt)) = self.interface {
            debug!(interface = iface, alt, "Releasing interface");
        }
        info!(state = %self.tracker.state(), "Device session released");
    }
}
