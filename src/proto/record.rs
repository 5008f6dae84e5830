//! Log record read from the PRX log characteristic.
//!
//! Every read pops one buffered record. Layout (14 bytes, trailing
//! bytes ignored):
//! ```text
//! Byte 0-1:   Unit (device class of the contacted peer, little-endian)
//! Byte 2:     RSSI (dBm, signed)
//! Byte 3:     TX power (dBm, signed)
//! Byte 4-7:   Start time (unix seconds, little-endian)
//! Byte 8-11:  Duration (seconds, little-endian)
//! Byte 12-13: Reserved
//! ```

use core::fmt::Write as _;

use chrono::{DateTime, NaiveDateTime};

use crate::ble::BdAddr;
use crate::error::DecodeError;

/// Log record size in bytes.
pub const LOG_RECORD_SIZE: usize = 14;

/// One harvested log record. Immutable once decoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HarvestedRecord {
    pub unit: u16,
    pub rssi: i8,
    pub tx_power: i8,
    pub start_time: NaiveDateTime,
    pub duration_secs: u32,
}

impl HarvestedRecord {
    /// Parse from a raw log characteristic value.
    pub fn from_ble_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < LOG_RECORD_SIZE {
            return Err(DecodeError::TooShort {
                expected: LOG_RECORD_SIZE,
                got: data.len(),
            });
        }
        let start = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let start_time = DateTime::from_timestamp(i64::from(start), 0)
            .ok_or(DecodeError::InvalidTimestamp)?
            .naive_utc();
        Ok(Self {
            unit: u16::from_le_bytes([data[0], data[1]]),
            rssi: data[2] as i8,
            tx_power: data[3] as i8,
            start_time,
            duration_secs: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
        })
    }

    /// Render as one log-file row (no line terminator).
    pub fn to_row(&self) -> String {
        let mut row = String::with_capacity(48);
        let _ = write!(
            row,
            "true,{},{},{},{},{}",
            self.unit,
            self.rssi,
            self.tx_power,
            self.start_time.format("%Y-%m-%d %H:%M:%S"),
            self.duration_secs
        );
        row
    }
}

/// Decode one log characteristic value read from `peer`.
pub fn decode_log_record(peer: BdAddr, data: &[u8]) -> Result<HarvestedRecord, DecodeError> {
    HarvestedRecord::from_ble_bytes(data).inspect_err(|err| {
        tracing::warn!(%peer, %err, len = data.len(), "discarding undecodable log record");
    })
}
