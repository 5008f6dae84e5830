//! Error types for prx-harvest.
//!
//! Only `HarvestError` ever escapes the event router; everything else is
//! logged at the point of failure and absorbed (a failed session closes,
//! an undecodable record is dropped).

use thiserror::Error;

use crate::ble::session::Stage;
use crate::ble::{BdAddr, ConnectionHandle, ProcedureStatus};

/// Fatal router-level error.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// The transport reported the same connection handle twice without a
    /// close in between.
    #[error("connection handle {0} opened twice")]
    DuplicateHandle(ConnectionHandle),
}

/// A `PeripheralAccess` command was refused before it was issued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    /// Raw status code from the radio stack.
    #[error("command rejected with status {0}")]
    Status(ProcedureStatus),

    /// The handle no longer refers to a live connection.
    #[error("connection {0} is not open")]
    NotConnected(ConnectionHandle),

    /// No peripheral with this address has been seen by the transport.
    #[error("unknown peer {0}")]
    UnknownPeer(BdAddr),

    /// The attribute handle was never reported by discovery.
    #[error("unknown attribute handle {0:#06x}")]
    UnknownAttribute(u16),

    /// Transport-level failure without a status code.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Binary payload could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("payload too short: expected {expected} bytes, got {got}")]
    TooShort { expected: usize, got: usize },

    #[error("invalid timestamp in payload")]
    InvalidTimestamp,
}

/// Session registry invariant violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("a session already exists for connection {0}")]
    DuplicateHandle(ConnectionHandle),

    #[error("no session for connection {0}")]
    UnknownHandle(ConnectionHandle),
}

/// Why a session was aborted before finishing its sequence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionFault {
    /// A GATT procedure completed with a non-success status.
    #[error("GATT procedure failed with status {status}")]
    Protocol { status: ProcedureStatus },

    /// Discovery finished without reporting an attribute the sequence needs.
    #[error("{0} was not discovered")]
    MissingAttribute(&'static str),

    /// A command could not be issued.
    #[error(transparent)]
    Access(#[from] AccessError),

    /// The sequence tried to move somewhere other than forward.
    #[error("illegal stage transition {from:?} -> {to:?}")]
    IllegalTransition { from: Stage, to: Stage },

    /// No event arrived within the watchdog window.
    #[error("no progress for {secs} s")]
    Stalled { secs: u64 },
}

/// Persistent log store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("log store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Another writer panicked while holding the store lock.
    #[error("log store lock poisoned")]
    Poisoned,
}

/// Invalid runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max connections must be between 1 and {limit}, got {requested}")]
    MaxConnections { requested: usize, limit: usize },

    #[error("device name {0:?} must be 1..=32 bytes")]
    DeviceName(String),

    #[error("connection interval min {min} exceeds max {max}")]
    ConnectionInterval { min: u16, max: u16 },

    #[error("session timeout must be non-zero")]
    SessionTimeout,
}
