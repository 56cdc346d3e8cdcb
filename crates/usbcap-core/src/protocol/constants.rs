//! Protocol constants for the capture peripheral.
//!
//! Request codes and payloads are vendor-specific and must stay bit-exact;
//! the device never reaches a readable state otherwise.

use std::time::Duration;

// ============================================================================
// Device Identification
// ============================================================================

/// Vendor ID reported by the capture peripheral.
pub const CAPTURE_VENDOR_ID: u16 = 0x5555;

/// Product ID reported by the capture peripheral.
pub const CAPTURE_PRODUCT_ID: u16 = 0x3382;

// ============================================================================
// Resources acquired during activation
// ============================================================================

/// Configuration value selected before streaming.
pub const CAPTURE_CONFIGURATION: u8 = 1;

/// Interface number carrying the capture endpoint.
pub const CAPTURE_INTERFACE: u8 = 0;

/// Alternate setting of the capture interface.
pub const CAPTURE_ALT_SETTING: u8 = 0;

/// Endpoint number of the bulk IN capture endpoint (address 0x82).
pub const CAPTURE_ENDPOINT_NUMBER: u8 = 2;

// ============================================================================
// bmRequestType values
// ============================================================================

/// Host-to-device, vendor, device recipient.
pub const REQUEST_TYPE_VENDOR_OUT: u8 = 0x40;

/// Device-to-host, vendor, device recipient.
pub const REQUEST_TYPE_VENDOR_IN: u8 = 0xC0;

// ============================================================================
// Vendor requests (bRequest)
// ============================================================================

/// Register blob write. Used by the activation probe and the keep-alive.
pub const VENDOR_REQ_REGISTER_WRITE: u8 = 176; // 0xB0

/// Diagnostic status read performed during activation.
pub const VENDOR_REQ_STATUS_READ: u8 = 177; // 0xB1

/// Run/refresh command sent by the keep-alive.
pub const VENDOR_REQ_RUN: u8 = 184; // 0xB8

/// Pre-read issued before the bitstream upload.
pub const VENDOR_REQ_FPGA_QUERY: u8 = 185; // 0xB9

/// wValue of the keep-alive run command.
pub const RUN_VALUE: u16 = 0x0076;

/// wValue of the stage-2 pre-read.
pub const FPGA_QUERY_VALUE: u16 = 0x0021;

// ============================================================================
// Sizes
// ============================================================================

/// Length of the zero-filled activation probe.
pub const ACTIVATION_PROBE_LEN: usize = 39;

/// Length of the activation diagnostic blob.
pub const ACTIVATION_STATUS_LEN: usize = 12;

/// Length of the stage-2 pre-read buffer.
pub const FPGA_QUERY_LEN: usize = 64;

/// Capacity of each bulk read (6 x 60 KiB).
pub const CAPTURE_READ_SIZE: usize = 61440 * 6;

/// Register blob re-sent by the keep-alive.
pub const KEEPALIVE_REGISTER_BLOB: [u8; 39] = [
    0x04, 0x10, 0x00, 0x00, 0x10, 0x14, 0x10, 0xaa, 0xaa, 0xaa, 0x1f, 0x1f, 0x1f, 0x03, 0x03,
    0x20, 0x02, 0x58, 0x00, 0x01, 0x02, 0x58, 0x00, 0x7c, 0x19, 0x01, 0x01, 0x80, 0x80, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x20, 0x02, 0x58,
];

// ============================================================================
// Timing
// ============================================================================

/// Pause between keep-alive rounds.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(200);

/// Settle delay between bitstream load and activation.
pub const ACTIVATION_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Pause before the process exits after stage 1.
pub const STAGE1_EXIT_DELAY: Duration = Duration::from_secs(1);

/// Default timeout for a single control transfer.
pub const DEFAULT_CONTROL_TIMEOUT_MS: u64 = 5000;

// ============================================================================
// Progress
// ============================================================================

/// Firmware script: one tick every N descriptors.
pub const FIRMWARE_TICK_STRIDE: usize = 10;

/// Firmware script phase symbols.
pub const FIRMWARE_TICK_SYMBOLS: &[char] = &['U', 'S', 'B'];

/// Bitstream script: one tick every N descriptors.
pub const BITSTREAM_TICK_STRIDE: usize = 60;

/// Bitstream script phase symbols.
pub const BITSTREAM_TICK_SYMBOLS: &[char] = &['F', 'P', 'G', 'A'];
