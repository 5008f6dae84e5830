//! Clock-set command written to the PRX data control point.
//!
//! Layout (8 bytes):
//! ```text
//! Byte 0:   Opcode (0x01 = set RTC)
//! Byte 1-6: Local time (year-2000, month, day, hour, min, sec)
//! Byte 7:   ISO weekday (1 = Monday ... 7 = Sunday)
//! ```

use chrono::{Datelike, NaiveDateTime, Timelike};

/// Opcode of the set-RTC command.
pub const OPCODE_SET_RTC: u8 = 0x01;

/// Clock-set command size in bytes.
pub const CLOCK_SET_COMMAND_SIZE: usize = 8;

/// Encode `now` as a clock-set command.
pub fn encode_clock_set_command(now: NaiveDateTime) -> [u8; CLOCK_SET_COMMAND_SIZE] {
    [
        OPCODE_SET_RTC,
        (now.year() - 2000).clamp(0, 255) as u8,
        now.month() as u8,
        now.day() as u8,
        now.hour() as u8,
        now.minute() as u8,
        now.second() as u8,
        now.weekday().number_from_monday() as u8,
    ]
}
