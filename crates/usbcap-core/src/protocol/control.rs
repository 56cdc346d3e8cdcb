//! USB control-transfer descriptors.
//!
//! A [`ControlTransfer`] mirrors the SETUP packet plus its data stage:
//! `bmRequestType`, `bRequest`, `wValue`, `wIndex` and a payload. For OUT
//! transfers the payload is sent as-is; for IN transfers only its length
//! matters and sizes the receive buffer.

use std::fmt;

use super::constants::{REQUEST_TYPE_VENDOR_IN, REQUEST_TYPE_VENDOR_OUT};

/// Data-stage direction (bit 7 of `bmRequestType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Host to device.
    Out,
    /// Device to host.
    In,
}

/// Request type (bits 5..6 of `bmRequestType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
    Reserved,
}

/// Request recipient (bits 0..4 of `bmRequestType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestRecipient {
    Device,
    Interface,
    Endpoint,
    Other,
    Reserved(u8),
}

/// One control transfer, immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct ControlTransfer {
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    payload: Vec<u8>,
}

impl ControlTransfer {
    pub fn new(request_type: u8, request: u8, value: u16, index: u16, payload: Vec<u8>) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            payload,
        }
    }

    /// Vendor request writing `data` to the device.
    pub fn vendor_out(request: u8, value: u16, index: u16, data: &[u8]) -> Self {
        Self::new(REQUEST_TYPE_VENDOR_OUT, request, value, index, data.to_vec())
    }

    /// Vendor request reading up to `length` bytes from the device.
    pub fn vendor_in(request: u8, value: u16, index: u16, length: usize) -> Self {
        Self::new(REQUEST_TYPE_VENDOR_IN, request, value, index, vec![0u8; length])
    }

    pub fn request_type(&self) -> u8 {
        self.request_type
    }

    pub fn request(&self) -> u8 {
        self.request
    }

    pub fn value(&self) -> u16 {
        self.value
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    /// Bytes sent for OUT transfers; a buffer of the receive size for IN.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Number of bytes in the data stage.
    pub fn length(&self) -> usize {
        self.payload.len()
    }

    pub fn direction(&self) -> TransferDirection {
        if self.request_type & 0x80 != 0 {
            TransferDirection::In
        } else {
            TransferDirection::Out
        }
    }

    pub fn kind(&self) -> RequestKind {
        match (self.request_type >> 5) & 0x03 {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }

    pub fn recipient(&self) -> RequestRecipient {
        match self.request_type & 0x1F {
            0 => RequestRecipient::Device,
            1 => RequestRecipient::Interface,
            2 => RequestRecipient::Endpoint,
            3 => RequestRecipient::Other,
            other => RequestRecipient::Reserved(other),
        }
    }
}

impl fmt::Debug for ControlTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ControlTransfer({})", self)
    }
}

impl fmt::Display for ControlTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type=0x{:02X} req={} value=0x{:04X} index=0x{:04X} len={}",
            self.request_type,
            self.request,
            self.value,
            self.index,
            self.payload.len()
        )
    }
}
