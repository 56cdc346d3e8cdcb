//! Control scripts - ordered, immutable lists of control transfers.
//!
//! Two scripts drive the bring-up: the firmware script (USB controller) and
//! the bitstream script (FPGA). Their content is opaque; only the order
//! matters, and replay never reorders or deduplicates.
//!
//! Scripts are read from data files in one of two formats:
//!
//! - TOML (`*.toml`), one `[[transfer]]` table per descriptor, payloads as hex:
//!
//!   ```toml
//!   [[transfer]]
//!   request_type = 0x40
//!   request = 176
//!   value = 0
//!   index = 0
//!   data = "0410aa"
//!
//!   [[transfer]]
//!   request_type = 0xc0
//!   request = 177
//!   length = 12
//!   ```
//!
//! - Packed binary (`*.bin`): magic `UCSC`, a little-endian `u32` count, then
//!   per descriptor `request_type: u8, request: u8, value: u16, index: u16,
//!   length: u16`, followed by `length` payload bytes for OUT transfers only.

mod progress;

use std::fmt;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{ControlTransfer, TransferDirection};

pub use progress::ProgressPlan;

/// Magic of the packed binary format.
pub const BINARY_MAGIC: &[u8; 4] = b"UCSC";

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("Transfer {index}: invalid hex payload: {source}")]
    InvalidHex {
        index: usize,
        source: hex::FromHexError,
    },
    #[error("Transfer {index}: {message}")]
    InvalidTransfer { index: usize, message: String },
    #[error("Bad magic: expected \"UCSC\"")]
    BadMagic,
    #[error("Truncated script: {expected} transfers declared, {actual} readable")]
    Truncated { expected: usize, actual: usize },
}

/// Which bring-up script a [`ControlScript`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    /// USB controller firmware.
    Firmware,
    /// FPGA bitstream.
    Bitstream,
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptKind::Firmware => write!(f, "firmware"),
            ScriptKind::Bitstream => write!(f, "bitstream"),
        }
    }
}

/// One `[[transfer]]` table.
#[derive(Debug, Serialize, Deserialize)]
struct TransferEntry {
    request_type: u8,
    request: u8,
    #[serde(default)]
    value: u16,
    #[serde(default)]
    index: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    length: Option<u16>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ScriptFile {
    #[serde(rename = "transfer", default)]
    transfers: Vec<TransferEntry>,
}

/// An ordered, immutable sequence of control transfers.
///
/// Cloning is cheap: the transfers are shared.
#[derive(Debug, Clone)]
pub struct ControlScript {
    kind: ScriptKind,
    transfers: Arc<[ControlTransfer]>,
}

impl ControlScript {
    pub fn new(kind: ScriptKind, transfers: Vec<ControlTransfer>) -> Self {
        Self {
            kind,
            transfers: transfers.into(),
        }
    }

    pub fn kind(&self) -> ScriptKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    pub fn transfers(&self) -> &[ControlTransfer] {
        &self.transfers
    }

    pub fn iter(&self) -> impl Iterator<Item = &ControlTransfer> {
        self.transfers.iter()
    }

    /// Progress plan matching this script's kind.
    pub fn progress_plan(&self) -> ProgressPlan {
        ProgressPlan::for_kind(self.kind)
    }

    /// Load a script file; `.bin` files use the packed format, anything else TOML.
    pub fn load<P: AsRef<Path>>(kind: ScriptKind, path: P) -> Result<Self, ScriptError> {
        let path = path.as_ref();
        let is_binary = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("bin"));

        let script = if is_binary {
            Self::from_bytes(kind, &std::fs::read(path)?)?
        } else {
            Self::from_toml_str(kind, &std::fs::read_to_string(path)?)?
        };

        tracing::info!(
            kind = %kind,
            path = %path.display(),
            transfers = script.len(),
            "Loaded control script"
        );
        Ok(script)
    }

    /// Parse the TOML format.
    pub fn from_toml_str(kind: ScriptKind, content: &str) -> Result<Self, ScriptError> {
        let file: ScriptFile = toml::from_str(content)?;
        let transfers = file
            .transfers
            .into_iter()
            .enumerate()
            .map(|(index, entry)| entry_to_transfer(index, entry))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(kind, transfers))
    }

    /// Render the TOML format.
    pub fn to_toml_string(&self) -> Result<String, ScriptError> {
        let file = ScriptFile {
            transfers: self
                .iter()
                .enumerate()
                .map(|(index, t)| transfer_to_entry(index, t))
                .collect::<Result<_, _>>()?,
        };
        Ok(toml::to_string_pretty(&file)?)
    }

    /// Parse the packed binary format.
    pub fn from_bytes(kind: ScriptKind, bytes: &[u8]) -> Result<Self, ScriptError> {
        let mut cursor = Cursor::new(bytes);

        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic).map_err(|_| ScriptError::BadMagic)?;
        if &magic != BINARY_MAGIC {
            return Err(ScriptError::BadMagic);
        }

        let count = cursor.read_u32::<LittleEndian>()? as usize;
        let mut transfers = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            match read_record(&mut cursor) {
                Ok(t) => transfers.push(t),
                Err(_) => {
                    return Err(ScriptError::Truncated {
                        expected: count,
                        actual: transfers.len(),
                    });
                }
            }
        }
        Ok(Self::new(kind, transfers))
    }

    /// Render the packed binary format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ScriptError> {
        let mut out = Vec::with_capacity(8 + self.len() * 8);
        out.extend_from_slice(BINARY_MAGIC);
        out.extend_from_slice(&(self.len() as u32).to_le_bytes());
        for (index, t) in self.iter().enumerate() {
            let length = wire_length(index, t)?;
            out.push(t.request_type());
            out.push(t.request());
            out.extend_from_slice(&t.value().to_le_bytes());
            out.extend_from_slice(&t.index().to_le_bytes());
            out.extend_from_slice(&length.to_le_bytes());
            if t.direction() == TransferDirection::Out {
                out.extend_from_slice(t.payload());
            }
        }
        Ok(out)
    }
}

fn read_record(cursor: &mut Cursor<&[u8]>) -> std::io::Result<ControlTransfer> {
    let request_type = cursor.read_u8()?;
    let request = cursor.read_u8()?;
    let value = cursor.read_u16::<LittleEndian>()?;
    let index = cursor.read_u16::<LittleEndian>()?;
    let length = cursor.read_u16::<LittleEndian>()? as usize;

    let mut payload = vec![0u8; length];
    if request_type & 0x80 == 0 {
        cursor.read_exact(&mut payload)?;
    }
    Ok(ControlTransfer::new(request_type, request, value, index, payload))
}

fn entry_to_transfer(index: usize, entry: TransferEntry) -> Result<ControlTransfer, ScriptError> {
    let invalid = |message: &str| ScriptError::InvalidTransfer {
        index,
        message: message.to_string(),
    };

    let payload = if entry.request_type & 0x80 != 0 {
        if entry.data.is_some() {
            return Err(invalid("IN transfers take `length`, not `data`"));
        }
        let length = entry
            .length
            .ok_or_else(|| invalid("IN transfers require `length`"))?;
        vec![0u8; length as usize]
    } else {
        if entry.length.is_some() {
            return Err(invalid("OUT transfers take `data`, not `length`"));
        }
        let data = entry.data.unwrap_or_default();
        let bytes =
            hex::decode(data.trim()).map_err(|source| ScriptError::InvalidHex { index, source })?;
        if bytes.len() > u16::MAX as usize {
            return Err(invalid("payload exceeds 65535 bytes"));
        }
        bytes
    };

    Ok(ControlTransfer::new(
        entry.request_type,
        entry.request,
        entry.value,
        entry.index,
        payload,
    ))
}

/// `wLength` of a transfer; control payloads are limited to 65535 bytes.
fn wire_length(index: usize, t: &ControlTransfer) -> Result<u16, ScriptError> {
    u16::try_from(t.length()).map_err(|_| ScriptError::InvalidTransfer {
        index,
        message: format!("payload of {} bytes exceeds 65535", t.length()),
    })
}

fn transfer_to_entry(index: usize, t: &ControlTransfer) -> Result<TransferEntry, ScriptError> {
    let length = wire_length(index, t)?;
    let (data, length) = match t.direction() {
        TransferDirection::Out => (Some(hex::encode(t.payload())), None),
        TransferDirection::In => (None, Some(length)),
    };
    Ok(TransferEntry {
        request_type: t.request_type(),
        request: t.request(),
        value: t.value(),
        index: t.index(),
        data,
        length,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[transfer]]
        request_type = 0x40
        request = 176
        data = "0410aa"

        [[transfer]]
        request_type = 0xc0
        request = 185
        value = 0x0021
        length = 64

        [[transfer]]
        request_type = 0x40
        request = 184
        value = 0x0076
    "#;

    #[test]
    fn test_parse_toml_preserves_order() {
        let script = ControlScript::from_toml_str(ScriptKind::Firmware, SAMPLE).unwrap();
        assert_eq!(script.len(), 3);

        let t = script.transfers();
        assert_eq!(t[0].request(), 176);
        assert_eq!(t[0].payload(), &[0x04, 0x10, 0xaa]);
        assert_eq!(t[1].direction(), TransferDirection::In);
        assert_eq!(t[1].value(), 0x0021);
        assert_eq!(t[1].length(), 64);
        assert_eq!(t[2].request(), 184);
        assert!(t[2].payload().is_empty());
    }

    #[test]
    fn test_duplicates_are_kept() {
        let src = r#"
            [[transfer]]
            request_type = 0x40
            request = 1

            [[transfer]]
            request_type = 0x40
            request = 1
        "#;
        let script = ControlScript::from_toml_str(ScriptKind::Bitstream, src).unwrap();
        assert_eq!(script.len(), 2);
    }

    #[test]
    fn test_in_transfer_requires_length() {
        let src = r#"
            [[transfer]]
            request_type = 0xc0
            request = 177
        "#;
        let err = ControlScript::from_toml_str(ScriptKind::Firmware, src).unwrap_err();
        assert!(matches!(err, ScriptError::InvalidTransfer { index: 0, .. }));
    }

    #[test]
    fn test_bad_hex_reports_index() {
        let src = r#"
            [[transfer]]
            request_type = 0x40
            request = 1

            [[transfer]]
            request_type = 0x40
            request = 2
            data = "zz"
        "#;
        let err = ControlScript::from_toml_str(ScriptKind::Firmware, src).unwrap_err();
        assert!(matches!(err, ScriptError::InvalidHex { index: 1, .. }));
    }

    #[test]
    fn test_binary_format_matches_toml() {
        let script = ControlScript::from_toml_str(ScriptKind::Firmware, SAMPLE).unwrap();
        let bytes = script.to_bytes().unwrap();
        assert_eq!(&bytes[..4], BINARY_MAGIC);

        let decoded = ControlScript::from_bytes(ScriptKind::Firmware, &bytes).unwrap();
        assert_eq!(decoded.transfers(), script.transfers());
    }

    #[test]
    fn test_binary_truncated() {
        let script = ControlScript::from_toml_str(ScriptKind::Firmware, SAMPLE).unwrap();
        let bytes = script.to_bytes().unwrap();

        let err = ControlScript::from_bytes(ScriptKind::Firmware, &bytes[..bytes.len() - 4])
            .unwrap_err();
        assert!(matches!(
            err,
            ScriptError::Truncated {
                expected: 3,
                actual: 2
            }
        ));
        assert!(matches!(
            ControlScript::from_bytes(ScriptKind::Firmware, b"NOPE"),
            Err(ScriptError::BadMagic)
        ));
    }

    #[test]
    fn test_oversized_payload_is_not_encoded() {
        let script = ControlScript::new(
            ScriptKind::Bitstream,
            vec![
                ControlTransfer::vendor_out(1, 0, 0, &[0u8; 8]),
                ControlTransfer::vendor_out(2, 0, 0, &vec![0u8; 70_000]),
            ],
        );

        assert!(matches!(
            script.to_bytes(),
            Err(ScriptError::InvalidTransfer { index: 1, .. })
        ));
        assert!(matches!(
            script.to_toml_string(),
            Err(ScriptError::InvalidTransfer { index: 1, .. })
        ));
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let script = ControlScript::from_toml_str(ScriptKind::Bitstream, SAMPLE).unwrap();

        let toml_path = dir.path().join("bitstream.toml");
        std::fs::write(&toml_path, script.to_toml_string().unwrap()).unwrap();
        let bin_path = dir.path().join("bitstream.bin");
        std::fs::write(&bin_path, script.to_bytes().unwrap()).unwrap();

        let from_toml = ControlScript::load(ScriptKind::Bitstream, &toml_path).unwrap();
        let from_bin = ControlScript::load(ScriptKind::Bitstream, &bin_path).unwrap();
        assert_eq!(from_toml.transfers(), from_bin.transfers());
        assert_eq!(from_bin.kind(), ScriptKind::Bitstream);
    }
}
