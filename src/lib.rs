//! prx-harvest - BLE central that drains buffered proximity logs from PRX
//! sensor peripherals.
//!
//! The library is sans-IO: it consumes `PeripheralEvent`s one at a time and
//! issues commands through the `PeripheralAccess` capability. Everything
//! here runs and tests on the host without a radio. The `host` feature adds
//! a btleplug transport and the `prx-harvest` binary.
//!
//! Usage: `cargo test` for the core, `cargo run --features host` for the
//! gateway.

// ═══════════════════════════════════════════════════════════════════════════
// Core modules
// ═══════════════════════════════════════════════════════════════════════════

pub mod ble;
pub mod clock;
pub mod config;
pub mod error;
pub mod proto;
pub mod storage;

// ═══════════════════════════════════════════════════════════════════════════
// Re-exports
// ═══════════════════════════════════════════════════════════════════════════

pub use ble::router::{Harvester, SweepReport};
pub use ble::{
    AddressType, BdAddr, ConnectionHandle, PeripheralAccess, PeripheralEvent, ProcedureStatus,
    ReportFlags,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{HarvestConfig, ScanMode, ScanPolicy};
pub use error::{HarvestError, StoreError};
pub use proto::HarvestedRecord;
pub use storage::{CsvFileStore, LogSink, LogStore, MemoryLogStore};
