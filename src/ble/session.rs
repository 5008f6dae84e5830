//! Per-connection harvest state.
//!
//! A `SessionState` is created when a connection opens and dropped when it
//! closes. It is the only place discovery progress, the pending-log counter
//! and the harvested-record buffer live; nothing about one connection is
//! stored anywhere another connection can reach.

use chrono::NaiveDateTime;
use heapless::String;
use uuid::Uuid;

use super::{AddressType, BdAddr, ConnectionHandle};
use crate::config;
use crate::proto::HarvestedRecord;

/// Position in the fixed discovery → sync → harvest → close sequence.
///
/// Each stage names the request that is outstanding while the session sits
/// in it. Declaration order is the only legal order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    DiscoverDeviceInfoService,
    DiscoverProximityService,
    DiscoverCharManufacturer,
    DiscoverCharSystemId,
    DiscoverCharSerialNumber,
    DiscoverCharHardwareId,
    DiscoverCharFirmwareId,
    DiscoverCharModel,
    DiscoverCharControlPoint,
    DiscoverCharLog,
    ReadFirmwareId,
    SyncClock,
    HarvestLoop,
    Closing,
}

impl Stage {
    /// Every stage, in sequence order.
    pub const ALL: [Stage; 14] = [
        Stage::DiscoverDeviceInfoService,
        Stage::DiscoverProximityService,
        Stage::DiscoverCharManufacturer,
        Stage::DiscoverCharSystemId,
        Stage::DiscoverCharSerialNumber,
        Stage::DiscoverCharHardwareId,
        Stage::DiscoverCharFirmwareId,
        Stage::DiscoverCharModel,
        Stage::DiscoverCharControlPoint,
        Stage::DiscoverCharLog,
        Stage::ReadFirmwareId,
        Stage::SyncClock,
        Stage::HarvestLoop,
        Stage::Closing,
    ];

    /// Total-order successor. `Closing` is terminal.
    pub fn next(self) -> Option<Stage> {
        let idx = self as usize;
        Stage::ALL.get(idx + 1).copied()
    }

    /// Legal moves: one step forward, or straight to `Closing` (abort,
    /// nothing left to harvest, watchdog).
    pub fn can_advance_to(self, target: Stage) -> bool {
        Some(target) == self.next() || (target == Stage::Closing && self != Stage::Closing)
    }

    /// Service this stage looks up, for the two service stages.
    pub fn service_target(self) -> Option<(ServiceSlot, Uuid)> {
        match self {
            Stage::DiscoverDeviceInfoService => {
                Some((ServiceSlot::DeviceInfo, config::DEVICE_INFO_SERVICE))
            }
            Stage::DiscoverProximityService => Some((ServiceSlot::Proximity, config::PRX_SERVICE)),
            _ => None,
        }
    }

    /// Characteristic this stage looks up, and the service it lives in.
    pub fn characteristic_target(self) -> Option<(ServiceSlot, CharSlot, Uuid)> {
        use ServiceSlot::{DeviceInfo, Proximity};

        let target = match self {
            Stage::DiscoverCharManufacturer => {
                (DeviceInfo, CharSlot::Manufacturer, config::MANUFACTURER_NAME_CHAR)
            }
            Stage::DiscoverCharSystemId => (DeviceInfo, CharSlot::SystemId, config::SYSTEM_ID_CHAR),
            Stage::DiscoverCharSerialNumber => {
                (DeviceInfo, CharSlot::SerialNumber, config::SERIAL_NUMBER_CHAR)
            }
            Stage::DiscoverCharHardwareId => {
                (DeviceInfo, CharSlot::HardwareId, config::HARDWARE_ID_CHAR)
            }
            Stage::DiscoverCharFirmwareId => {
                (DeviceInfo, CharSlot::FirmwareId, config::FIRMWARE_ID_CHAR)
            }
            Stage::DiscoverCharModel => (DeviceInfo, CharSlot::Model, config::MODEL_CHAR),
            Stage::DiscoverCharControlPoint => {
                (Proximity, CharSlot::ControlPoint, config::PRX_CONTROL_POINT_CHAR)
            }
            Stage::DiscoverCharLog => (Proximity, CharSlot::Log, config::PRX_LOG_CHAR),
            _ => return None,
        };
        Some(target)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceSlot {
    DeviceInfo,
    Proximity,
}

impl ServiceSlot {
    pub fn label(self) -> &'static str {
        match self {
            ServiceSlot::DeviceInfo => "device information service",
            ServiceSlot::Proximity => "proximity service",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CharSlot {
    Manufacturer,
    SystemId,
    SerialNumber,
    HardwareId,
    FirmwareId,
    Model,
    ControlPoint,
    Log,
}

impl CharSlot {
    pub fn label(self) -> &'static str {
        match self {
            CharSlot::Manufacturer => "manufacturer name characteristic",
            CharSlot::SystemId => "system id characteristic",
            CharSlot::SerialNumber => "serial number characteristic",
            CharSlot::HardwareId => "hardware revision characteristic",
            CharSlot::FirmwareId => "firmware revision characteristic",
            CharSlot::Model => "model number characteristic",
            CharSlot::ControlPoint => "control point characteristic",
            CharSlot::Log => "log characteristic",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServiceHandles {
    pub device_info: Option<u32>,
    pub proximity: Option<u32>,
}

impl ServiceHandles {
    pub fn get(&self, slot: ServiceSlot) -> Option<u32> {
        match slot {
            ServiceSlot::DeviceInfo => self.device_info,
            ServiceSlot::Proximity => self.proximity,
        }
    }

    pub fn set(&mut self, slot: ServiceSlot, handle: u32) {
        match slot {
            ServiceSlot::DeviceInfo => self.device_info = Some(handle),
            ServiceSlot::Proximity => self.proximity = Some(handle),
        }
    }
}

/// Attribute handles, filled in one discovery step at a time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CharacteristicHandles {
    pub manufacturer: Option<u16>,
    pub system_id: Option<u16>,
    pub serial_number: Option<u16>,
    pub hardware_id: Option<u16>,
    pub firmware_id: Option<u16>,
    pub model: Option<u16>,
    pub control_point: Option<u16>,
    pub log: Option<u16>,
}

impl CharacteristicHandles {
    fn slot_mut(&mut self, slot: CharSlot) -> &mut Option<u16> {
        match slot {
            CharSlot::Manufacturer => &mut self.manufacturer,
            CharSlot::SystemId => &mut self.system_id,
            CharSlot::SerialNumber => &mut self.serial_number,
            CharSlot::HardwareId => &mut self.hardware_id,
            CharSlot::FirmwareId => &mut self.firmware_id,
            CharSlot::Model => &mut self.model,
            CharSlot::ControlPoint => &mut self.control_point,
            CharSlot::Log => &mut self.log,
        }
    }

    pub fn get(&self, slot: CharSlot) -> Option<u16> {
        match slot {
            CharSlot::Manufacturer => self.manufacturer,
            CharSlot::SystemId => self.system_id,
            CharSlot::SerialNumber => self.serial_number,
            CharSlot::HardwareId => self.hardware_id,
            CharSlot::FirmwareId => self.firmware_id,
            CharSlot::Model => self.model,
            CharSlot::ControlPoint => self.control_point,
            CharSlot::Log => self.log,
        }
    }

    pub fn set(&mut self, slot: CharSlot, handle: u16) {
        *self.slot_mut(slot) = Some(handle);
    }
}

/// Strings read from the device information service.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub firmware_id: Option<String<32>>,
}

/// Everything one connection knows about its own progress.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionState {
    pub handle: ConnectionHandle,
    pub peer_address: BdAddr,
    pub peer_address_type: AddressType,
    pub services: ServiceHandles,
    pub characteristics: CharacteristicHandles,
    stage: Stage,
    /// Records the peripheral still holds; decremented per read issued.
    pub pending_log_count: u16,
    pub harvested: Vec<HarvestedRecord>,
    pub device_info: DeviceInfo,
    /// Time of the last event seen for this connection.
    pub last_activity: NaiveDateTime,
}

impl SessionState {
    pub fn new(
        handle: ConnectionHandle,
        peer_address: BdAddr,
        peer_address_type: AddressType,
        pending_log_count: u16,
        now: NaiveDateTime,
    ) -> Self {
        Self {
            handle,
            peer_address,
            peer_address_type,
            services: ServiceHandles::default(),
            characteristics: CharacteristicHandles::default(),
            stage: Stage::DiscoverDeviceInfoService,
            pending_log_count,
            harvested: Vec::new(),
            device_info: DeviceInfo::default(),
            last_activity: now,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Move to `target`, refusing anything but a legal forward step.
    pub fn advance_to(&mut self, target: Stage) -> Result<(), Stage> {
        if !self.stage.can_advance_to(target) {
            return Err(self.stage);
        }
        self.stage = target;
        Ok(())
    }

    pub fn is_closing(&self) -> bool {
        self.stage == Stage::Closing
    }

    pub fn touch(&mut self, now: NaiveDateTime) {
        self.last_activity = now;
    }
}
