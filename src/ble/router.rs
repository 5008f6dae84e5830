//! Event router - the single entry point for transport events.
//!
//! Events are processed one at a time, each to completion. Connection
//! events are routed by handle to the owning session; events for a handle
//! that has no session (late replies after a close) are dropped.

use chrono::TimeDelta;
use tracing::{debug, error, info, warn};

use super::admission::{Admission, ConnectionAdmissionController};
use super::machine::SessionMachine;
use super::registry::SessionRegistry;
use super::session::SessionState;
use super::triage::{AdvertisementTriage, Verdict};
use super::{AddressType, BdAddr, ConnectionHandle, PeripheralAccess, PeripheralEvent, ProcedureStatus};
use crate::clock::Clock;
use crate::config::HarvestConfig;
use crate::error::{ConfigError, HarvestError, RegistryError, SessionFault};
use crate::storage::{LogSink, LogStore};

/// What one watchdog pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Silent sessions moved to `Closing`.
    pub aborted: usize,
    /// Connection attempts the radio never answered.
    pub expired_attempts: usize,
    /// Closing sessions whose close was never confirmed, released locally.
    pub released: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.aborted + self.expired_attempts + self.released
    }
}

/// Central-role harvester: triage, admission, sessions and the log sink
/// behind one event handler.
pub struct Harvester<P: PeripheralAccess, S: LogStore, C: Clock> {
    config: HarvestConfig,
    access: P,
    clock: C,
    triage: AdvertisementTriage,
    admission: ConnectionAdmissionController,
    registry: SessionRegistry,
    sink: LogSink<S>,
}

impl<P: PeripheralAccess, S: LogStore, C: Clock> Harvester<P, S, C> {
    pub fn new(
        config: HarvestConfig,
        access: P,
        sink: LogSink<S>,
        clock: C,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            triage: AdvertisementTriage::new(config.device_name.clone()),
            admission: ConnectionAdmissionController::new(
                config.max_connections,
                config.scan_policy,
                config.scan_mode,
            ),
            registry: SessionRegistry::new(),
            config,
            access,
            clock,
            sink,
        })
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn access(&self) -> &P {
        &self.access
    }

    pub fn access_mut(&mut self) -> &mut P {
        &mut self.access
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn admission(&self) -> &ConnectionAdmissionController {
        &self.admission
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn sink(&self) -> &LogSink<S> {
        &self.sink
    }

    /// Process one event. Only a broken handle-uniqueness contract in the
    /// transport is fatal; every other failure is logged and absorbed.
    pub fn handle_event(&mut self, event: PeripheralEvent) -> Result<(), HarvestError> {
        match event {
            PeripheralEvent::Boot => self.on_boot(),
            PeripheralEvent::AdvertisementObserved {
                address,
                address_type,
                flags,
                payload,
            } => {
                let now = self.clock.now();
                if let Verdict::Connect(candidate) =
                    self.triage
                        .evaluate(address, address_type, flags, &payload, now)
                {
                    if let Admission::Rejected(reason) =
                        self.admission.try_admit(candidate, now, &mut self.access)
                    {
                        debug!(%address, ?reason, "candidate not admitted");
                    }
                }
            }
            PeripheralEvent::ConnectionOpened {
                handle,
                address,
                address_type,
            } => return self.on_connection_opened(handle, address, address_type),
            PeripheralEvent::ConnectionFailed { address, reason } => {
                warn!(%address, status = %reason, "connection attempt failed");
                self.admission
                    .on_connection_failed(address, &mut self.access);
            }
            PeripheralEvent::ConnectionClosed { handle, reason } => {
                self.on_connection_closed(handle, reason)
            }
            PeripheralEvent::ServiceDiscovered { handle, service } => {
                self.with_session(handle, |m| m.service_discovered(service))
            }
            PeripheralEvent::CharacteristicDiscovered {
                handle,
                characteristic,
            } => self.with_session(handle, |m| m.characteristic_discovered(characteristic)),
            PeripheralEvent::ProcedureCompleted { handle, status } => {
                self.with_session(handle, |m| m.procedure_completed(status))
            }
            PeripheralEvent::CharacteristicValueReceived { handle, value } => {
                self.with_session(handle, |m| m.value_received(&value))
            }
        }
        Ok(())
    }

    /// Watchdog pass, run with the configured `session_timeout` as the
    /// window:
    ///
    /// - sessions with no event inside the window are aborted;
    /// - attempts older than the window are dropped and their slot freed;
    /// - sessions still `Closing` a full window after their last event
    ///   are released as if the close had been confirmed.
    pub fn sweep_stalled(&mut self) -> SweepReport {
        let Some(timeout) = self.config.session_timeout else {
            return SweepReport::default();
        };
        let Some(cutoff) = TimeDelta::from_std(timeout)
            .ok()
            .and_then(|window| self.clock.now().checked_sub_signed(window))
        else {
            return SweepReport::default();
        };

        let mut report = SweepReport {
            expired_attempts: self.admission.expire_attempts(cutoff, &mut self.access).len(),
            ..SweepReport::default()
        };

        for handle in self.registry.closing_since(cutoff) {
            if let Err(err) = self.access.close_connection(handle) {
                debug!(%handle, %err, "repeated close refused");
            }
            warn!(%handle, "close never confirmed, releasing session");
            self.on_connection_closed(handle, ProcedureStatus::LOCAL_HOST_TERMINATED);
            report.released += 1;
        }

        let stalled = self.registry.stalled_since(cutoff);
        for &handle in &stalled {
            self.with_session(handle, |m| {
                m.abort(SessionFault::Stalled {
                    secs: timeout.as_secs(),
                })
            });
        }
        report.aborted = stalled.len();
        report
    }

    /// Flush and release every open session, requesting close for each.
    /// Returns how many sessions were released.
    pub fn shutdown(&mut self) -> usize {
        let sessions = self.registry.drain();
        for session in &sessions {
            if let Err(err) = self.access.close_connection(session.handle) {
                debug!(handle = %session.handle, %err, "close on shutdown refused");
            }
            self.release(session, ProcedureStatus::LOCAL_HOST_TERMINATED);
        }
        sessions.len()
    }

    fn on_boot(&mut self) {
        info!(
            cap = self.config.max_connections,
            name = %self.config.device_name,
            "radio up"
        );
        if let Err(err) = self
            .access
            .set_connection_parameters(&self.config.connection_params)
        {
            error!(%err, "connection parameters refused");
        }
        self.admission.boot(&mut self.access);
    }

    fn on_connection_opened(
        &mut self,
        handle: ConnectionHandle,
        address: BdAddr,
        address_type: AddressType,
    ) -> Result<(), HarvestError> {
        let pending = self
            .admission
            .on_connection_opened(address, &mut self.access);
        let now = self.clock.now();

        let session = match self
            .registry
            .on_open(handle, address, address_type, pending, now)
        {
            Ok(session) => session,
            Err(err) => {
                error!(%handle, peer = %address, %err, "transport reused a live handle");
                return Err(HarvestError::DuplicateHandle(handle));
            }
        };
        info!(%handle, peer = %address, pending_logs = pending, "connection opened");

        SessionMachine::new(session, &mut self.access, &self.clock).start();
        Ok(())
    }

    fn on_connection_closed(&mut self, handle: ConnectionHandle, reason: ProcedureStatus) {
        match self.registry.on_close(handle) {
            Ok(session) => self.release(&session, reason),
            Err(err) => warn!(%handle, %err, "close for a connection with no session"),
        }
    }

    /// Persist what `session` harvested and give its slot back.
    fn release(&mut self, session: &SessionState, reason: ProcedureStatus) {
        let peer = session.peer_address;
        info!(
            handle = %session.handle,
            %peer,
            status = %reason,
            stage = ?session.stage(),
            records = session.harvested.len(),
            "connection closed"
        );

        if let Err(err) = self.sink.flush(peer, &session.harvested) {
            error!(
                %peer,
                %err,
                lost = session.harvested.len(),
                "failed to persist harvested records"
            );
        }
        self.admission
            .on_connection_closed(peer, &mut self.access);
    }

    /// Run `f` on the machine for `handle`, dropping the event if the
    /// session is already gone.
    fn with_session(&mut self, handle: ConnectionHandle, f: impl FnOnce(&mut SessionMachine<'_, P, C>)) {
        let session = match self.registry.get(handle) {
            Ok(session) => session,
            Err(err @ RegistryError::UnknownHandle(_)) => {
                warn!(%handle, %err, "late event dropped");
                return;
            }
            Err(err) => {
                error!(%handle, %err, "event dropped");
                return;
            }
        };
        session.touch(self.clock.now());
        let mut machine = SessionMachine::new(session, &mut self.access, &self.clock);
        f(&mut machine);
    }
}
