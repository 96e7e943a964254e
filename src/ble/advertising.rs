//! Advertising data parsing.
//!
//! Parses the manufacturer-specific scan record broadcast by watches.
//!
//! Layout (little-endian):
//! - Byte 0: payload type
//! - Bytes 1-12: serial number (ASCII)
//! - Bytes 13-18: extended info, only present on firmware 3.0 and later
//!   - 13: hardware platform
//!   - 14: color
//!   - 15-17: firmware major, minor, patch
//!   - 18: flags (bit 0 running recovery, bit 1 first use)

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Extended scan record fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedScanRecord {
    /// Hardware platform id.
    pub hardware_platform: u8,
    /// Case color id.
    pub color: u8,
    /// Firmware major version.
    pub major: u8,
    /// Firmware minor version.
    pub minor: u8,
    /// Firmware patch version.
    pub patch: u8,
    /// The watch is running recovery firmware.
    pub running_recovery: bool,
    /// The watch has not completed first-use setup.
    pub first_use: bool,
}

impl ExtendedScanRecord {
    /// Size of the extended fields.
    pub const SIZE: usize = 6;

    /// Firmware version as a tuple.
    pub fn firmware(&self) -> (u8, u8, u8) {
        (self.major, self.minor, self.patch)
    }
}

/// Scan record from a watch advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchScanRecord {
    /// Payload type.
    pub payload_type: u8,
    /// Serial number.
    pub serial_number: String,
    /// Extended info, if advertised.
    pub extended: Option<ExtendedScanRecord>,
}

impl WatchScanRecord {
    /// Minimum size of the scan record.
    pub const MIN_SIZE: usize = 13;

    /// Serial number field size.
    pub const SERIAL_SIZE: usize = 12;

    /// Parse the manufacturer data payload.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_SIZE {
            return Err(Error::InvalidData {
                context: format!(
                    "Scan record too short: {} bytes (need at least {})",
                    data.len(),
                    Self::MIN_SIZE
                ),
            });
        }

        let payload_type = data[0];

        // Serial is NUL padded on some firmware
        let serial_bytes = &data[1..1 + Self::SERIAL_SIZE];
        let serial_number = String::from_utf8_lossy(serial_bytes)
            .trim_end_matches('\0')
            .to_string();

        let rest = &data[Self::MIN_SIZE..];
        let extended = if rest.is_empty() {
            None
        } else if rest.len() < ExtendedScanRecord::SIZE {
            return Err(Error::InvalidData {
                context: format!("Truncated extended scan record: {} bytes", rest.len()),
            });
        } else {
            let flags = rest[5];
            Some(ExtendedScanRecord {
                hardware_platform: rest[0],
                color: rest[1],
                major: rest[2],
                minor: rest[3],
                patch: rest[4],
                running_recovery: flags & 0x01 != 0,
                first_use: flags & 0x02 != 0,
            })
        };

        Ok(Self {
            payload_type,
            serial_number,
            extended,
        })
    }
}
