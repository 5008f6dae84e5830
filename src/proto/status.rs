//! Status record carried in PRX advertisements.
//!
//! Manufacturer-specific data, company id `0x02FF`, followed by
//! (13 bytes):
//! ```text
//! Byte 0:     Device class
//! Byte 1-6:   Peripheral clock (year-2000, month, day, hour, min, sec)
//! Byte 7:     Battery level (percent)
//! Byte 8:     TX power (dBm, signed)
//! Byte 9:     Firmware revision
//! Byte 10:    Alarm flags
//! Byte 11-12: Pending log count (little-endian)
//! ```

use chrono::NaiveDateTime;

use super::{unpack_timestamp, PACKED_TIMESTAMP_SIZE};
use crate::ble::adv_parser::find_manufacturer_data;
use crate::config::STATUS_COMPANY_ID;

/// Status record size in bytes, company id excluded.
pub const STATUS_RECORD_SIZE: usize = 13;

/// Decoded advertisement status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdvertisementStatus {
    pub device_class: u8,
    /// Peripheral's own idea of the current time.
    pub last_known_time: NaiveDateTime,
    pub battery_percent: u8,
    pub tx_power: i8,
    pub firmware_revision: u8,
    pub alarm_flags: u8,
    /// Records buffered on the peripheral awaiting harvest.
    pub pending_log_count: u16,
}

impl AdvertisementStatus {
    /// Parse the status body (company id already stripped).
    pub fn from_ble_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < STATUS_RECORD_SIZE {
            return None;
        }
        let last_known_time = unpack_timestamp(&data[1..1 + PACKED_TIMESTAMP_SIZE])?;
        Some(Self {
            device_class: data[0],
            last_known_time,
            battery_percent: data[7],
            tx_power: data[8] as i8,
            firmware_revision: data[9],
            alarm_flags: data[10],
            pending_log_count: u16::from_le_bytes([data[11], data[12]]),
        })
    }
}

/// Locate and decode the status record in a raw advertisement.
///
/// `None` means the advertisement is not from a recognised peripheral.
pub fn decode_advertisement_status(payload: &[u8]) -> Option<AdvertisementStatus> {
    find_manufacturer_data(payload, STATUS_COMPANY_ID).and_then(AdvertisementStatus::from_ble_bytes)
}
