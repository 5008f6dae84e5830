//! Session state machine - drives one `SessionState` through discovery,
//! clock sync and log harvest.
//!
//! After a connection opens, the machine:
//! 1. Looks up the Device Information and proximity services by UUID.
//! 2. Looks up six device-information characteristics, then the
//!    control-point and log characteristics.
//! 3. Reads the firmware revision string.
//! 4. Writes the current time to the control point.
//! 5. Reads the log characteristic once per pending record.
//! 6. Requests the connection close.
//!
//! The link allows one outstanding GATT request, so each stage issues
//! exactly one request and waits for its procedure-completed event before
//! moving on. A failed procedure ends the session; nothing is retried.

use heapless::String;
use tracing::{debug, error, info, warn};

use super::session::{CharSlot, SessionState, Stage};
use super::{PeripheralAccess, ProcedureStatus};
use crate::clock::Clock;
use crate::error::SessionFault;
use crate::proto::{decode_log_record, encode_clock_set_command};

/// Borrowed view over one session and the radio.
///
/// Holding `&mut SessionState` for exactly one connection is what keeps
/// sessions isolated: a machine cannot name any other session.
pub struct SessionMachine<'a, P: PeripheralAccess + ?Sized, C: Clock + ?Sized> {
    session: &'a mut SessionState,
    access: &'a mut P,
    clock: &'a C,
}

impl<'a, P: PeripheralAccess + ?Sized, C: Clock + ?Sized> SessionMachine<'a, P, C> {
    pub fn new(session: &'a mut SessionState, access: &'a mut P, clock: &'a C) -> Self {
        Self {
            session,
            access,
            clock,
        }
    }

    pub fn session(&self) -> &SessionState {
        &*self.session
    }

    /// Issue the first request of a freshly opened session.
    pub fn start(&mut self) {
        debug_assert_eq!(self.session.stage(), Stage::DiscoverDeviceInfoService);
        if let Err(fault) = self.issue() {
            self.abort(fault);
        }
    }

    pub fn service_discovered(&mut self, service: u32) {
        match self.session.stage().service_target() {
            Some((slot, _)) => {
                debug!(peer = %self.session.peer_address, service, slot = ?slot, "service found");
                self.session.services.set(slot, service);
            }
            None => warn!(
                peer = %self.session.peer_address,
                stage = ?self.session.stage(),
                service,
                "service report outside a service lookup"
            ),
        }
    }

    pub fn characteristic_discovered(&mut self, characteristic: u16) {
        match self.session.stage().characteristic_target() {
            Some((_, slot, _)) => {
                debug!(
                    peer = %self.session.peer_address,
                    characteristic,
                    slot = ?slot,
                    "characteristic found"
                );
                self.session.characteristics.set(slot, characteristic);
            }
            None => warn!(
                peer = %self.session.peer_address,
                stage = ?self.session.stage(),
                characteristic,
                "characteristic report outside a characteristic lookup"
            ),
        }
    }

    pub fn value_received(&mut self, value: &[u8]) {
        let peer = self.session.peer_address;
        match self.session.stage() {
            Stage::ReadFirmwareId => {
                let firmware = decode_info_string(value);
                info!(%peer, firmware = firmware.as_str(), "firmware revision");
                self.session.device_info.firmware_id = Some(firmware);
            }
            Stage::HarvestLoop => {
                // Undecodable records are logged by the decoder and dropped.
                if let Ok(record) = decode_log_record(peer, value) {
                    debug!(%peer, unit = record.unit, "log record harvested");
                    self.session.harvested.push(record);
                }
            }
            stage => debug!(%peer, ?stage, len = value.len(), "ignoring value outside a read"),
        }
    }

    pub fn procedure_completed(&mut self, status: ProcedureStatus) {
        if self.session.is_closing() {
            debug!(peer = %self.session.peer_address, %status, "procedure completed while closing");
            return;
        }
        if !status.is_success() {
            self.abort(SessionFault::Protocol { status });
            return;
        }

        let result = match self.session.stage() {
            Stage::HarvestLoop if self.session.pending_log_count > 0 => self.issue(),
            Stage::HarvestLoop => self.enter(Stage::Closing),
            Stage::SyncClock if self.session.pending_log_count == 0 => self.enter(Stage::Closing),
            stage => match stage.next() {
                Some(next) => self.enter(next),
                None => Ok(()),
            },
        };
        if let Err(fault) = result {
            self.abort(fault);
        }
    }

    /// End the session early: log why, move to `Closing`, request close.
    pub fn abort(&mut self, fault: SessionFault) {
        error!(
            peer = %self.session.peer_address,
            handle = %self.session.handle,
            stage = ?self.session.stage(),
            %fault,
            "session aborted"
        );
        if self.session.is_closing() {
            return;
        }
        if self.session.advance_to(Stage::Closing).is_ok() {
            if let Err(err) = self.access.close_connection(self.session.handle) {
                error!(peer = %self.session.peer_address, %err, "close request refused");
            }
        }
    }

    fn enter(&mut self, target: Stage) -> Result<(), SessionFault> {
        let from = self.session.stage();
        self.session
            .advance_to(target)
            .map_err(|from| SessionFault::IllegalTransition { from, to: target })?;
        debug!(peer = %self.session.peer_address, ?from, to = ?target, "stage advanced");
        self.issue()
    }

    /// Send the one request the current stage waits on.
    fn issue(&mut self) -> Result<(), SessionFault> {
        let handle = self.session.handle;
        let stage = self.session.stage();

        if let Some((_, uuid)) = stage.service_target() {
            self.access.discover_services_by_uuid(handle, uuid)?;
            return Ok(());
        }

        if let Some((service_slot, _, uuid)) = stage.characteristic_target() {
            let service = self
                .session
                .services
                .get(service_slot)
                .ok_or(SessionFault::MissingAttribute(service_slot.label()))?;
            self.access
                .discover_characteristics_by_uuid(handle, service, uuid)?;
            return Ok(());
        }

        match stage {
            Stage::ReadFirmwareId => {
                let characteristic = self.required(CharSlot::FirmwareId)?;
                self.access.read_characteristic_value(handle, characteristic)?;
            }
            Stage::SyncClock => {
                let characteristic = self.required(CharSlot::ControlPoint)?;
                let now = self.clock.now();
                info!(peer = %self.session.peer_address, %now, "writing peripheral clock");
                let command = encode_clock_set_command(now);
                self.access
                    .write_characteristic_value(handle, characteristic, &command)?;
            }
            Stage::HarvestLoop => {
                let characteristic = self.required(CharSlot::Log)?;
                self.access.read_characteristic_value(handle, characteristic)?;
                self.session.pending_log_count = self.session.pending_log_count.saturating_sub(1);
                debug!(
                    peer = %self.session.peer_address,
                    remaining = self.session.pending_log_count,
                    "log read issued"
                );
            }
            Stage::Closing => {
                info!(
                    peer = %self.session.peer_address,
                    records = self.session.harvested.len(),
                    "harvest finished, closing"
                );
                self.access.close_connection(handle)?;
            }
            // Lookup stages were served above.
            _ => {}
        }
        Ok(())
    }

    fn required(&self, slot: CharSlot) -> Result<u16, SessionFault> {
        self.session
            .characteristics
            .get(slot)
            .ok_or(SessionFault::MissingAttribute(slot.label()))
    }
}

/// Decode a device-information string value, truncated to 32 chars.
fn decode_info_string(value: &[u8]) -> String<32> {
    let mut out = String::new();
    for c in std::string::String::from_utf8_lossy(value)
        .trim_end_matches('\0')
        .chars()
    {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::session::CharacteristicHandles;
    use crate::ble::{AddressType, BdAddr, ConnectionHandle};
    use crate::clock::FixedClock;
    use crate::config::{ConnectionParameters, ScanMode};
    use crate::error::AccessError;
    use crate::proto::record::LOG_RECORD_SIZE;
    use chrono::{NaiveDate, NaiveDateTime};
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq)]
    enum Cmd {
        DiscoverService(Uuid),
        DiscoverChar(u32, Uuid),
        Read(u16),
        Write(u16, Vec<u8>),
        Close,
    }

    #[derive(Default)]
    struct Recorder {
        cmds: Vec<Cmd>,
        refuse_reads: bool,
    }

    impl PeripheralAccess for Recorder {
        fn set_connection_parameters(&mut self, _: &ConnectionParameters) -> Result<(), AccessError> {
            Ok(())
        }
        fn start_scanning(&mut self, _: ScanMode) -> Result<(), AccessError> {
            Ok(())
        }
        fn stop_scanning(&mut self) -> Result<(), AccessError> {
            Ok(())
        }
        fn open_connection(&mut self, _: BdAddr, _: AddressType) -> Result<(), AccessError> {
            Ok(())
        }
        fn discover_services_by_uuid(&mut self, _: ConnectionHandle, uuid: Uuid) -> Result<(), AccessError> {
            self.cmds.push(Cmd::DiscoverService(uuid));
            Ok(())
        }
        fn discover_characteristics_by_uuid(
            &mut self,
            _: ConnectionHandle,
            service: u32,
            uuid: Uuid,
        ) -> Result<(), AccessError> {
            self.cmds.push(Cmd::DiscoverChar(service, uuid));
            Ok(())
        }
        fn read_characteristic_value(&mut self, _: ConnectionHandle, ch: u16) -> Result<(), AccessError> {
            if self.refuse_reads {
                return Err(AccessError::Status(ProcedureStatus(0x0181)));
            }
            self.cmds.push(Cmd::Read(ch));
            Ok(())
        }
        fn write_characteristic_value(
            &mut self,
            _: ConnectionHandle,
            ch: u16,
            value: &[u8],
        ) -> Result<(), AccessError> {
            self.cmds.push(Cmd::Write(ch, value.to_vec()));
            Ok(())
        }
        fn close_connection(&mut self, _: ConnectionHandle) -> Result<(), AccessError> {
            self.cmds.push(Cmd::Close);
            Ok(())
        }
    }

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 6, 1)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .unwrap()
    }

    fn session(pending: u16) -> SessionState {
        SessionState::new(
            ConnectionHandle(4),
            BdAddr([0xAA, 0, 0, 0, 0, 1]),
            AddressType::RandomStatic,
            pending,
            noon(),
        )
    }

    fn log_value(unit: u16) -> Vec<u8> {
        let mut v = vec![0u8; LOG_RECORD_SIZE];
        v[0..2].copy_from_slice(&unit.to_le_bytes());
        v[4..8].copy_from_slice(&1_780_000_000u32.to_le_bytes());
        v
    }

    /// Drive discovery to the start of `ReadFirmwareId`, reporting every
    /// attribute with a distinct handle.
    fn discover_all(m: &mut SessionMachine<'_, Recorder, FixedClock>) {
        m.start();
        m.service_discovered(0x10);
        m.procedure_completed(ProcedureStatus::SUCCESS);
        m.service_discovered(0x20);
        m.procedure_completed(ProcedureStatus::SUCCESS);
        for ch in 1..=8u16 {
            m.characteristic_discovered(ch);
            m.procedure_completed(ProcedureStatus::SUCCESS);
        }
    }

    #[test]
    fn full_sequence_issues_requests_in_order() {
        let clock = FixedClock::new(noon());
        let mut access = Recorder::default();
        let mut s = session(2);
        let mut m = SessionMachine::new(&mut s, &mut access, &clock);

        discover_all(&mut m);
        assert_eq!(m.session().stage(), Stage::ReadFirmwareId);
        m.value_received(b"1.4.2\0");
        m.procedure_completed(ProcedureStatus::SUCCESS);
        assert_eq!(m.session().stage(), Stage::SyncClock);
        m.procedure_completed(ProcedureStatus::SUCCESS);
        assert_eq!(m.session().stage(), Stage::HarvestLoop);
        assert_eq!(m.session().pending_log_count, 1);
        m.value_received(&log_value(7));
        m.procedure_completed(ProcedureStatus::SUCCESS);
        assert_eq!(m.session().pending_log_count, 0);
        m.value_received(&log_value(8));
        m.procedure_completed(ProcedureStatus::SUCCESS);
        assert_eq!(m.session().stage(), Stage::Closing);

        assert_eq!(s.harvested.len(), 2);
        assert_eq!(s.harvested[1].unit, 8);
        assert_eq!(
            s.device_info.firmware_id.as_ref().map(|f| f.as_str()),
            Some("1.4.2")
        );
        assert_eq!(s.characteristics.firmware_id, Some(5));
        assert_eq!(s.characteristics.model, Some(6));
        assert_eq!(s.characteristics.log, Some(8));

        use crate::config::*;
        let expected = vec![
            Cmd::DiscoverService(DEVICE_INFO_SERVICE),
            Cmd::DiscoverService(PRX_SERVICE),
            Cmd::DiscoverChar(0x10, MANUFACTURER_NAME_CHAR),
            Cmd::DiscoverChar(0x10, SYSTEM_ID_CHAR),
            Cmd::DiscoverChar(0x10, SERIAL_NUMBER_CHAR),
            Cmd::DiscoverChar(0x10, HARDWARE_ID_CHAR),
            Cmd::DiscoverChar(0x10, FIRMWARE_ID_CHAR),
            Cmd::DiscoverChar(0x10, MODEL_CHAR),
            Cmd::DiscoverChar(0x20, PRX_CONTROL_POINT_CHAR),
            Cmd::DiscoverChar(0x20, PRX_LOG_CHAR),
            Cmd::Read(5),
            Cmd::Write(7, encode_clock_set_command(noon()).to_vec()),
            Cmd::Read(8),
            Cmd::Read(8),
            Cmd::Close,
        ];
        assert_eq!(access.cmds, expected);
    }

    #[test]
    fn nothing_pending_closes_right_after_clock_sync() {
        let clock = FixedClock::new(noon());
        let mut access = Recorder::default();
        let mut s = session(0);
        let mut m = SessionMachine::new(&mut s, &mut access, &clock);

        discover_all(&mut m);
        m.procedure_completed(ProcedureStatus::SUCCESS);
        m.procedure_completed(ProcedureStatus::SUCCESS);
        assert_eq!(m.session().stage(), Stage::Closing);
        assert_eq!(access.cmds.last(), Some(&Cmd::Close));
        assert!(!access.cmds.iter().any(|c| matches!(c, Cmd::Read(8))));
    }

    #[test]
    fn failed_procedure_closes_without_further_discovery() {
        for failing_step in 0..10 {
            let clock = FixedClock::new(noon());
            let mut access = Recorder::default();
            let mut s = session(3);
            let mut m = SessionMachine::new(&mut s, &mut access, &clock);
            m.start();
            m.service_discovered(0x10);
            for _ in 0..failing_step {
                m.characteristic_discovered(0x99);
                m.service_discovered(0x10);
                m.procedure_completed(ProcedureStatus::SUCCESS);
            }
            let issued = access_len(&m);
            m.procedure_completed(ProcedureStatus(0x0401));
            assert_eq!(m.session().stage(), Stage::Closing);
            // Further completions are ignored.
            m.procedure_completed(ProcedureStatus::SUCCESS);
            drop(m);
            assert_eq!(access.cmds.len(), issued + 1, "step {failing_step}");
            assert_eq!(access.cmds.last(), Some(&Cmd::Close));
        }
    }

    fn access_len(m: &SessionMachine<'_, Recorder, FixedClock>) -> usize {
        m.access.cmds.len()
    }

    #[test]
    fn missing_log_characteristic_aborts_before_harvest() {
        let clock = FixedClock::new(noon());
        let mut access = Recorder::default();
        let mut s = session(4);
        let mut m = SessionMachine::new(&mut s, &mut access, &clock);
        m.start();
        m.service_discovered(0x10);
        m.procedure_completed(ProcedureStatus::SUCCESS);
        m.service_discovered(0x20);
        m.procedure_completed(ProcedureStatus::SUCCESS);
        // Only the first seven lookups find something.
        for ch in 1..=7u16 {
            m.characteristic_discovered(ch);
            m.procedure_completed(ProcedureStatus::SUCCESS);
        }
        m.procedure_completed(ProcedureStatus::SUCCESS); // log lookup, nothing found
        m.procedure_completed(ProcedureStatus::SUCCESS); // firmware read
        m.procedure_completed(ProcedureStatus::SUCCESS); // clock write
        assert_eq!(m.session().stage(), Stage::Closing);
        assert_eq!(access.cmds.last(), Some(&Cmd::Close));
        assert!(s.harvested.is_empty());
        assert_eq!(s.pending_log_count, 4);
    }

    #[test]
    fn missing_model_does_not_block_the_sequence() {
        let clock = FixedClock::new(noon());
        let mut access = Recorder::default();
        let mut s = session(0);
        let mut m = SessionMachine::new(&mut s, &mut access, &clock);
        m.start();
        m.service_discovered(0x10);
        m.procedure_completed(ProcedureStatus::SUCCESS);
        m.service_discovered(0x20);
        m.procedure_completed(ProcedureStatus::SUCCESS);
        for ch in 1..=8u16 {
            if ch != 6 {
                m.characteristic_discovered(ch);
            }
            m.procedure_completed(ProcedureStatus::SUCCESS);
        }
        assert_eq!(m.session().stage(), Stage::ReadFirmwareId);
        assert_eq!(m.session().characteristics.model, None);
    }

    #[test]
    fn refused_read_aborts_session() {
        let clock = FixedClock::new(noon());
        let mut access = Recorder {
            refuse_reads: true,
            ..Recorder::default()
        };
        let mut s = session(1);
        let mut m = SessionMachine::new(&mut s, &mut access, &clock);
        discover_all(&mut m);
        assert_eq!(m.session().stage(), Stage::Closing);
        assert_eq!(access.cmds.last(), Some(&Cmd::Close));
    }

    #[test]
    fn undecodable_record_is_dropped_and_harvest_continues() {
        let clock = FixedClock::new(noon());
        let mut access = Recorder::default();
        let mut s = session(2);
        let mut m = SessionMachine::new(&mut s, &mut access, &clock);
        discover_all(&mut m);
        m.procedure_completed(ProcedureStatus::SUCCESS);
        m.procedure_completed(ProcedureStatus::SUCCESS);
        m.value_received(&[]);
        m.procedure_completed(ProcedureStatus::SUCCESS);
        m.value_received(&log_value(1));
        m.procedure_completed(ProcedureStatus::SUCCESS);
        assert_eq!(m.session().stage(), Stage::Closing);
        assert_eq!(s.harvested.len(), 1);
    }

    #[test]
    fn stray_reports_do_not_touch_handles() {
        let clock = FixedClock::new(noon());
        let mut access = Recorder::default();
        let mut s = session(0);
        let mut m = SessionMachine::new(&mut s, &mut access, &clock);
        m.start();
        m.characteristic_discovered(0x33);
        m.value_received(b"junk");
        assert_eq!(s.characteristics, CharacteristicHandles::default());
        assert!(s.harvested.is_empty());
        assert_eq!(s.device_info.firmware_id, None);
    }

    #[test]
    fn info_strings_are_trimmed_and_truncated() {
        assert_eq!(decode_info_string(b"2.0.1\0\0").as_str(), "2.0.1");
        assert_eq!(decode_info_string(&[b'A'; 40]).len(), 32);
    }
}
