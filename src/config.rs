//! Application-wide constants and runtime configuration.
//!
//! Protocol constants (GATT UUIDs, connection timing, admission cap) live
//! here so they can be tuned in one place. `HarvestConfig` carries the
//! values the gateway binary may override from the command line.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::error::ConfigError;

// BLE connection parameters

/// Connection interval range (in 1.25 ms units). 80 = 100 ms.
pub const CONN_INTERVAL_MIN: u16 = 80;
pub const CONN_INTERVAL_MAX: u16 = 80;

/// Slave latency (number of connection events the peripheral can skip).
pub const CONN_SLAVE_LATENCY: u16 = 1;

/// Supervision timeout (in 10 ms units). 500 = 5 s.
pub const CONN_TIMEOUT: u16 = 500;

/// Connection event length bounds (in 0.625 ms units).
pub const CONN_MIN_CE_LENGTH: u16 = 0;
pub const CONN_MAX_CE_LENGTH: u16 = 65535;

// Sessions

/// Maximum simultaneous sessions.
///
/// Has to match the concurrent-connection limit configured on the radio
/// side, otherwise opens beyond the radio's limit fail.
pub const MAX_CONNECTIONS: usize = 5;

/// Local name advertised by harvestable peripherals.
pub const DEVICE_NAME_TAG: &str = "PRX";

/// Company identifier carried in the status manufacturer data (Silicon Labs).
pub const STATUS_COMPANY_ID: u16 = 0x02FF;

/// Sessions with no event for this long are closed by the watchdog.
pub const SESSION_TIMEOUT_SECS: u64 = 30;

/// Host transport: give up on a connect plus GATT snapshot after this long.
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

// GATT layout

/// Device Information service (0x180A).
pub const DEVICE_INFO_SERVICE: Uuid = uuid16(0x180A);
/// Manufacturer Name String (0x2A29).
pub const MANUFACTURER_NAME_CHAR: Uuid = uuid16(0x2A29);
/// System ID (0x2A23).
pub const SYSTEM_ID_CHAR: Uuid = uuid16(0x2A23);
/// Serial Number String (0x2A25).
pub const SERIAL_NUMBER_CHAR: Uuid = uuid16(0x2A25);
/// Hardware Revision String (0x2A27).
pub const HARDWARE_ID_CHAR: Uuid = uuid16(0x2A27);
/// Firmware Revision String (0x2A26).
pub const FIRMWARE_ID_CHAR: Uuid = uuid16(0x2A26);
/// Model Number String (0x2A24).
pub const MODEL_CHAR: Uuid = uuid16(0x2A24);

/// Proximity/log service.
pub const PRX_SERVICE: Uuid = uuid::uuid!("01e59576-be13-47da-9c29-354a565cc874");
/// Data control point - receives the clock-set command.
pub const PRX_CONTROL_POINT_CHAR: Uuid = uuid::uuid!("8093f8a5-82ce-4fac-9fb3-f7dab64c0b74");
/// Log characteristic - each read pops one buffered record.
pub const PRX_LOG_CHAR: Uuid = uuid::uuid!("1d316924-9f39-47a3-a16d-a39846473eac");

// Log file

/// Default location of the harvested log file.
pub const LOG_FILE_PATH: &str = "logs.csv";

/// Header row written once to an empty log file.
pub const LOG_FILE_HEADER: [&str; 6] = [
    "OK",
    "Unit",
    "RSSI",
    "TX Power",
    "Start Time",
    "Seconds Duration",
];

/// Expand a 16-bit SIG-assigned UUID onto the Bluetooth base UUID.
pub const fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// Connection parameters applied at boot for every later connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionParameters {
    pub interval_min: u16,
    pub interval_max: u16,
    pub slave_latency: u16,
    pub timeout: u16,
    pub min_ce_length: u16,
    pub max_ce_length: u16,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            interval_min: CONN_INTERVAL_MIN,
            interval_max: CONN_INTERVAL_MAX,
            slave_latency: CONN_SLAVE_LATENCY,
            timeout: CONN_TIMEOUT,
            min_ce_length: CONN_MIN_CE_LENGTH,
            max_ce_length: CONN_MAX_CE_LENGTH,
        }
    }
}

/// Discovery mode requested from the scanner.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScanMode {
    /// Report only limited-discoverable advertisers.
    Limited,
    /// Report limited- and general-discoverable advertisers.
    #[default]
    Generic,
    /// Report everything, including non-discoverable advertisers.
    Observation,
}

/// When the admission controller pauses and resumes scanning.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScanPolicy {
    /// Stop scanning on every connection attempt; resume on any close.
    #[default]
    PauseOnAttempt,
    /// Keep scanning while below the cap; stop only at the cap.
    PauseAtCapacity,
}

/// Runtime configuration for one harvester instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HarvestConfig {
    pub max_connections: usize,
    pub device_name: String,
    pub connection_params: ConnectionParameters,
    pub scan_mode: ScanMode,
    pub scan_policy: ScanPolicy,
    /// `None` disables the stalled-session watchdog.
    pub session_timeout: Option<Duration>,
    pub log_path: PathBuf,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            max_connections: MAX_CONNECTIONS,
            device_name: DEVICE_NAME_TAG.to_string(),
            connection_params: ConnectionParameters::default(),
            scan_mode: ScanMode::default(),
            scan_policy: ScanPolicy::default(),
            session_timeout: Some(Duration::from_secs(SESSION_TIMEOUT_SECS)),
            log_path: PathBuf::from(LOG_FILE_PATH),
        }
    }
}

impl HarvestConfig {
    /// Reject configurations the radio side cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 || self.max_connections > MAX_CONNECTIONS {
            return Err(ConfigError::MaxConnections {
                requested: self.max_connections,
                limit: MAX_CONNECTIONS,
            });
        }
        if self.device_name.is_empty() || self.device_name.len() > 32 {
            return Err(ConfigError::DeviceName(self.device_name.clone()));
        }
        let params = &self.connection_params;
        if params.interval_min > params.interval_max {
            return Err(ConfigError::ConnectionInterval {
                min: params.interval_min,
                max: params.interval_max,
            });
        }
        if self.session_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::SessionTimeout);
        }
        Ok(())
    }
}
