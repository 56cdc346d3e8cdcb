//! nusb-based USB transport implementation.
//!
//! Control transfers go to the device (not an interface) so the scripted
//! bring-up works before any interface is claimed. The bulk IN reader is
//! created once, when the capture endpoint is resolved, and kept behind its
//! own lock so it never contends with the control lock.

use std::io::Read;
use std::sync::Mutex;
use std::time::Duration;

use nusb::io::EndpointRead;
use nusb::transfer::{Bulk, ControlIn, ControlOut, ControlType, Direction, In, Recipient};
use nusb::{Device, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument};

use super::traits::{InterfaceSummary, TransportError, UsbTransport};
use crate::protocol::constants::CAPTURE_READ_SIZE;
use crate::protocol::{ControlTransfer, RequestKind, RequestRecipient, TransferDirection};

/// Interface claimed during activation.
struct ClaimedInterface {
    interface: Interface,
    number: u8,
    alt_setting: u8,
}

/// nusb-based USB transport.
pub struct NusbTransport {
    device: Device,
    claimed: Mutex<Option<ClaimedInterface>>,
    reader: Mutex<Option<EndpointRead<Bulk>>>,
    control_lock: Mutex<()>,
    control_timeout: Duration,
    vid: u16,
    pid: u16,
}

impl NusbTransport {
    /// Open a device with specific VID/PID.
    #[instrument(level = "info", fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn open_with_ids(vid: u16, pid: u16, control_timeout: Duration) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        Ok(Self {
            device,
            claimed: Mutex::new(None),
            reader: Mutex::new(None),
            control_lock: Mutex::new(()),
            control_timeout,
            vid,
            pid,
        })
    }

    fn control_type(transfer: &ControlTransfer) -> Result<ControlType, TransportError> {
        match transfer.kind() {
            RequestKind::Standard => Ok(ControlType::Standard),
            RequestKind::Class => Ok(ControlType::Class),
            RequestKind::Vendor => Ok(ControlType::Vendor),
            RequestKind::Reserved => Err(TransportError::UnsupportedRequestType(
                transfer.request_type(),
            )),
        }
    }

    fn recipient(transfer: &ControlTransfer) -> Result<Recipient, TransportError> {
        match transfer.recipient() {
            RequestRecipient::Device => Ok(Recipient::Device),
            RequestRecipient::Interface => Ok(Recipient::Interface),
            RequestRecipient::Endpoint => Ok(Recipient::Endpoint),
            RequestRecipient::Other => Ok(Recipient::Other),
            RequestRecipient::Reserved(_) => Err(TransportError::UnsupportedRequestType(
                transfer.request_type(),
            )),
        }
    }
}

impl UsbTransport for NusbTransport {
    #[instrument(level = "trace", skip(self, transfer), fields(request = transfer.request()))]
    fn control(&self, transfer: &ControlTransfer) -> Result<Vec<u8>, TransportError> {
        let control_type = Self::control_type(transfer)?;
        let recipient = Self::recipient(transfer)?;
        let failed = |e: nusb::transfer::TransferError| TransportError::ControlFailed {
            request: transfer.request(),
            message: e.to_string(),
        };

        // A poisoned lock only means another transfer panicked; the bus is still usable.
        let _guard = self
            .control_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match transfer.direction() {
            TransferDirection::Out => {
                self.device
                    .control_out(
                        ControlOut {
                            control_type,
                            recipient,
                            request: transfer.request(),
                            value: transfer.value(),
                            index: transfer.index(),
                            data: transfer.payload(),
                        },
                        self.control_timeout,
                    )
                    .wait()
                    .map_err(failed)?;
                Ok(Vec::new())
            }
            TransferDirection::In => {
                let data = self
                    .device
                    .control_in(
                        ControlIn {
                            control_type,
                            recipient,
                            request: transfer.request(),
                            value: transfer.value(),
                            index: transfer.index(),
                            length: transfer.length() as u16,
                        },
                        self.control_timeout,
                    )
                    .wait()
                    .map_err(failed)?;
                Ok(data)
            }
        }
    }

    #[instrument(skip(self))]
    fn set_configuration(&self, config: u8) -> Result<(), TransportError> {
        let unavailable = |message: String| TransportError::ConfigurationUnavailable { config, message };

        if !self
            .device
            .configurations()
            .any(|c| c.configuration_value() == config)
        {
            return Err(unavailable("no such configuration descriptor".into()));
        }

        let active = self
            .device
            .active_configuration()
            .map(|c| c.configuration_value())
            .ok();
        if active == Some(config) {
            debug!(config, "Configuration already active");
            return Ok(());
        }

        self.device
            .set_configuration(config)
            .wait()
            .map_err(|e| unavailable(e.to_string()))?;
        info!(config, "Configuration selected");
        Ok(())
    }

    #[instrument(skip(self))]
    fn claim_interface(&self, interface: u8, alt_setting: u8) -> Result<(), TransportError> {
        let claim_failed = |message: String| TransportError::ClaimInterfaceFailed {
            interface,
            alt_setting,
            message,
        };

        let claimed = self
            .device
            .claim_interface(interface)
            .wait()
            .map_err(|e| claim_failed(e.to_string()))?;
        claimed
            .set_alt_setting(alt_setting)
            .wait()
            .map_err(|e| claim_failed(e.to_string()))?;

        info!(interface, alt_setting, "Interface claimed");
        *self.claimed.lock().unwrap_or_else(|p| p.into_inner()) = Some(ClaimedInterface {
            interface: claimed,
            number: interface,
            alt_setting,
        });
        Ok(())
    }

    #[instrument(skip(self))]
    fn resolve_in_endpoint(&self, number: u8) -> Result<u8, TransportError> {
        let claimed = self.claimed.lock().unwrap_or_else(|p| p.into_inner());
        let claimed = claimed.as_ref().ok_or(TransportError::NotClaimed)?;

        // Endpoints of the claimed alternate setting, from the active configuration.
        let mut available = Vec::new();
        let mut found = None;
        if let Ok(config) = self.device.active_configuration() {
            for iface in config.interfaces() {
                if iface.interface_number() != claimed.number {
                    continue;
                }
                for alt in iface.alt_settings() {
                    if alt.alternate_setting() != claimed.alt_setting {
                        continue;
                    }
                    for ep in alt.endpoints() {
                        available.push(ep.address());
                        if ep.direction() == Direction::In
                            && ep.transfer_type() == nusb::descriptors::TransferType::Bulk
                            && ep.address() & 0x0F == number
                        {
                            found = Some(ep.address());
                        }
                    }
                }
            }
        }

        let address = found.ok_or_else(|| TransportError::EndpointNotFound {
            requested: number,
            interface: claimed.number,
            available,
        })?;

        let endpoint = claimed
            .interface
            .endpoint::<Bulk, In>(address)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
        *self.reader.lock().unwrap_or_else(|p| p.into_inner()) =
            Some(endpoint.reader(CAPTURE_READ_SIZE));

        info!(endpoint = %format!("0x{:02X}", address), "Capture endpoint resolved");
        Ok(address)
    }

    #[instrument(level = "trace", skip(self))]
    fn read_bulk(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut reader = self.reader.lock().unwrap_or_else(|p| p.into_inner());
        let reader = reader.as_mut().ok_or(TransportError::NotClaimed)?;

        let mut buf = vec![0u8; max_len];
        let n = reader
            .read(&mut buf)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        buf.truncate(n);
        debug!(bytes_read = n, "Read complete");
        Ok(buf)
    }

    fn describe(&self, config: u8) -> Vec<InterfaceSummary> {
        let mut summary = Vec::new();
        for cfg in self.device.configurations() {
            if cfg.configuration_value() != config {
                continue;
            }
            for iface in cfg.interfaces() {
                for alt in iface.alt_settings() {
                    summary.push(InterfaceSummary {
                        interface: iface.interface_number(),
                        alt_setting: alt.alternate_setting(),
                        endpoints: alt.endpoints().map(|ep| ep.address()).collect(),
                    });
                }
            }
        }
        summary
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
