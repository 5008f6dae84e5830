//! Bluetooth Low Energy subsystem.
//!
//! This module drives the radio in **Central** role:
//!
//! 1. **Triage** - decides which advertisements are worth a connection.
//! 2. **Admission** - enforces the concurrent-session cap and owns the
//!    scanner on/off state.
//! 3. **Sessions** - one `SessionState` per open connection, advanced by
//!    the session machine through discovery, clock sync and log harvest.
//! 4. **Router** - receives transport events one at a time and dispatches
//!    them to the pieces above.
//!
//! The radio itself is reached through the `PeripheralAccess` capability.
//! Every command is fire-and-continue; its outcome arrives later as a
//! `PeripheralEvent`.

pub mod adv_parser;
pub mod admission;
#[cfg(feature = "host")]
pub mod host;
pub mod machine;
pub mod registry;
pub mod router;
pub mod session;
pub mod triage;

use core::fmt;

use uuid::Uuid;

use crate::config::{ConnectionParameters, ScanMode};
use crate::error::AccessError;

/// 48-bit device address, stored most-significant byte first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BdAddr(pub [u8; 6]);

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AddressType {
    #[default]
    Public,
    RandomStatic,
    RandomPrivateResolvable,
    RandomPrivateNonResolvable,
    Anonymous,
}

/// Transport-assigned identifier of one open connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u8);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result code carried by procedure-completed and connection-closed events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProcedureStatus(pub u16);

impl ProcedureStatus {
    pub const SUCCESS: Self = Self(0x0000);
    /// ATT "attribute not found".
    pub const ATTRIBUTE_NOT_FOUND: Self = Self(0x040A);
    /// ATT "unlikely error", used for transport failures without a code.
    pub const UNLIKELY_ERROR: Self = Self(0x040E);
    /// Supervision timeout expired.
    pub const CONNECTION_TIMEOUT: Self = Self(0x0208);
    /// Remote user terminated connection.
    pub const REMOTE_USER_TERMINATED: Self = Self(0x0213);
    /// Connection terminated by local host.
    pub const LOCAL_HOST_TERMINATED: Self = Self(0x0216);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for ProcedureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Scanner report flags (not the AD "Flags" structure).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReportFlags(pub u8);

impl ReportFlags {
    pub const CONNECTABLE: Self = Self(0x01);
    pub const DISCOVERABLE: Self = Self(0x02);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for ReportFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Events delivered by the transport, one at a time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeripheralEvent {
    /// The radio is ready; no command may be issued before this.
    Boot,
    AdvertisementObserved {
        address: BdAddr,
        address_type: AddressType,
        flags: ReportFlags,
        payload: Vec<u8>,
    },
    ConnectionOpened {
        handle: ConnectionHandle,
        address: BdAddr,
        address_type: AddressType,
    },
    /// An open attempt ended without ever producing a handle.
    ConnectionFailed {
        address: BdAddr,
        reason: ProcedureStatus,
    },
    ConnectionClosed {
        handle: ConnectionHandle,
        reason: ProcedureStatus,
    },
    ServiceDiscovered {
        handle: ConnectionHandle,
        service: u32,
    },
    CharacteristicDiscovered {
        handle: ConnectionHandle,
        characteristic: u16,
    },
    ProcedureCompleted {
        handle: ConnectionHandle,
        status: ProcedureStatus,
    },
    CharacteristicValueReceived {
        handle: ConnectionHandle,
        value: Vec<u8>,
    },
}

/// Commands the core issues to the radio.
///
/// None of these block for the outcome. A returned `Err` means the command
/// was refused outright; otherwise the result arrives as a later event.
pub trait PeripheralAccess {
    fn set_connection_parameters(&mut self, params: &ConnectionParameters)
        -> Result<(), AccessError>;

    fn start_scanning(&mut self, mode: ScanMode) -> Result<(), AccessError>;

    fn stop_scanning(&mut self) -> Result<(), AccessError>;

    fn open_connection(
        &mut self,
        address: BdAddr,
        address_type: AddressType,
    ) -> Result<(), AccessError>;

    fn discover_services_by_uuid(
        &mut self,
        handle: ConnectionHandle,
        uuid: Uuid,
    ) -> Result<(), AccessError>;

    fn discover_characteristics_by_uuid(
        &mut self,
        handle: ConnectionHandle,
        service: u32,
        uuid: Uuid,
    ) -> Result<(), AccessError>;

    fn read_characteristic_value(
        &mut self,
        handle: ConnectionHandle,
        characteristic: u16,
    ) -> Result<(), AccessError>;

    fn write_characteristic_value(
        &mut self,
        handle: ConnectionHandle,
        characteristic: u16,
        value: &[u8],
    ) -> Result<(), AccessError>;

    fn close_connection(&mut self, handle: ConnectionHandle) -> Result<(), AccessError>;
}
