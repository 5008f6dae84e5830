//! Binary payloads exchanged with PRX peripherals.
//!
//! - `status` - the status record embedded in advertisements.
//! - `record` - one buffered log record read from the log characteristic.
//! - `rtc` - the clock-set command written to the control point.

pub mod record;
pub mod rtc;
pub mod status;


use chrono::{NaiveDate, NaiveDateTime};

pub use record::{decode_log_record, HarvestedRecord};
pub use rtc::encode_clock_set_command;
pub use status::{decode_advertisement_status, AdvertisementStatus};

/// Packed calendar timestamp size: `year-2000, month, day, hour, min, sec`.
pub const PACKED_TIMESTAMP_SIZE: usize = 6;

/// Decode a packed calendar timestamp.
pub(crate) fn unpack_timestamp(data: &[u8]) -> Option<NaiveDateTime> {
    let &[year, month, day, hour, minute, second] = data.get(..PACKED_TIMESTAMP_SIZE)? else {
        return None;
    };
    NaiveDate::from_ymd_opt(2000 + i32::from(year), u32::from(month), u32::from(day))?
        .and_hms_opt(u32::from(hour), u32::from(minute), u32::from(second))
}
