//! USB Transport layer abstraction.
//!
//! Defines the `UsbTransport` trait for USB communication,
//! allowing different implementations (nusb, mock, etc.).
//!
//! # Concurrency contract
//!
//! Implementations are shared by reference between the keep-alive thread and
//! the capture thread once streaming starts. Control transfers are serialized
//! by the implementation; a bulk read in flight never blocks a control
//! transfer, and vice versa.

use crate::protocol::ControlTransfer;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Configuration {config} unavailable: {message}")]
    ConfigurationUnavailable { config: u8, message: String },

    #[error("Failed to claim interface {interface} alt {alt_setting}: {message}")]
    ClaimInterfaceFailed {
        interface: u8,
        alt_setting: u8,
        message: String,
    },

    #[error(
        "Endpoint {requested} (IN) not found on interface {interface}; available endpoints: [{}]",
        format_endpoints(.available)
    )]
    EndpointNotFound {
        requested: u8,
        interface: u8,
        available: Vec<u8>,
    },

    #[error("Interface not claimed")]
    NotClaimed,

    #[error("Unsupported bmRequestType 0x{0:02X}")]
    UnsupportedRequestType(u8),

    #[error("Control transfer (bRequest={request}) failed: {message}")]
    ControlFailed { request: u8, message: String },

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Render endpoint addresses the way lsusb does: `0x82(2,IN)`.
pub fn format_endpoints(addresses: &[u8]) -> String {
    addresses
        .iter()
        .map(|addr| {
            let dir = if addr & 0x80 != 0 { "IN" } else { "OUT" };
            format!("0x{:02x}({},{})", addr, addr & 0x0F, dir)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// One alternate setting of an interface, as reported by its descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSummary {
    pub interface: u8,
    pub alt_setting: u8,
    pub endpoints: Vec<u8>,
}

/// Abstract USB transport interface.
///
/// This trait enables:
/// - Production implementation using nusb
/// - Mock implementation for unit testing
pub trait UsbTransport: Send + Sync {
    /// Issue one control transfer. Returns the bytes received for IN
    /// transfers and an empty vector for OUT transfers.
    fn control(&self, transfer: &ControlTransfer) -> Result<Vec<u8>, TransportError>;

    /// Select a configuration by its `bConfigurationValue`.
    fn set_configuration(&self, config: u8) -> Result<(), TransportError>;

    /// Claim an interface and select its alternate setting.
    fn claim_interface(&self, interface: u8, alt_setting: u8) -> Result<(), TransportError>;

    /// Resolve the bulk IN endpoint with the given number on the claimed
    /// interface. Returns the endpoint address.
    fn resolve_in_endpoint(&self, number: u8) -> Result<u8, TransportError>;

    /// One bulk read of at most `max_len` bytes from the resolved endpoint.
    fn read_bulk(&self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Interfaces and endpoints of the given configuration.
    fn describe(&self, config: u8) -> Vec<InterfaceSummary>;

    /// Get the current VID.
    fn vendor_id(&self) -> u16;

    /// Get the current PID.
    fn product_id(&self) -> u16;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_diagnostic_lists_available() {
        let err = TransportError::EndpointNotFound {
            requested: 2,
            interface: 0,
            available: vec![0x81, 0x02],
        };
        assert_eq!(
            err.to_string(),
            "Endpoint 2 (IN) not found on interface 0; available endpoints: [0x81(1,IN) 0x02(2,OUT)]"
        );
    }
}
