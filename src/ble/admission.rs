//! Connection admission - caps concurrent sessions and owns the scanner.
//!
//! Open sessions plus outstanding attempts never exceed the cap. The
//! scanner is on exactly when no attempt is outstanding and the policy's
//! pause condition is clear:
//!
//! - `PauseOnAttempt`: an admitted attempt pauses scanning for the whole
//!   life of that connection; any close (or failed attempt) lifts it.
//! - `PauseAtCapacity`: scanning pauses only while the cap is full.
//!
//! Each attempt is stamped when it is admitted. An attempt the radio never
//! answers is dropped by `expire_attempts`, which frees its slot.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;
use tracing::{debug, error, info, warn};

use super::triage::Candidate;
use super::{BdAddr, PeripheralAccess};
use crate::config::{ScanMode, ScanPolicy};
use crate::error::AccessError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected(AdmissionRejection),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdmissionRejection {
    /// Open sessions plus outstanding attempts already fill the cap.
    AtCapacity,
    /// This peer already has an attempt or a session.
    AlreadyConnected,
    /// The radio refused the open command.
    Refused(AccessError),
}

pub struct ConnectionAdmissionController {
    cap: usize,
    policy: ScanPolicy,
    scan_mode: ScanMode,
    booted: bool,
    scanning: bool,
    /// `PauseOnAttempt` only: a session-lifetime pause is in effect.
    held: bool,
    attempts: HashMap<BdAddr, Attempt>,
    connected: HashSet<BdAddr>,
}

#[derive(Clone, Copy, Debug)]
struct Attempt {
    candidate: Candidate,
    started: NaiveDateTime,
}

impl ConnectionAdmissionController {
    pub fn new(cap: usize, policy: ScanPolicy, scan_mode: ScanMode) -> Self {
        Self {
            cap,
            policy,
            scan_mode,
            booted: false,
            scanning: false,
            held: false,
            attempts: HashMap::new(),
            connected: HashSet::new(),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn open_sessions(&self) -> usize {
        self.connected.len()
    }

    pub fn outstanding_attempts(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    fn occupied(&self) -> usize {
        self.connected.len() + self.attempts.len()
    }

    /// Radio is up: begin scanning.
    pub fn boot<P: PeripheralAccess + ?Sized>(&mut self, access: &mut P) {
        self.booted = true;
        self.reconcile(access);
    }

    pub fn try_admit<P: PeripheralAccess + ?Sized>(
        &mut self,
        candidate: Candidate,
        now: NaiveDateTime,
        access: &mut P,
    ) -> Admission {
        let address = candidate.address;
        if self.attempts.contains_key(&address) || self.connected.contains(&address) {
            debug!(%address, "already connected or connecting");
            return Admission::Rejected(AdmissionRejection::AlreadyConnected);
        }
        if self.occupied() >= self.cap {
            debug!(%address, open = self.open_sessions(), cap = self.cap, "at capacity");
            return Admission::Rejected(AdmissionRejection::AtCapacity);
        }

        self.attempts.insert(
            address,
            Attempt {
                candidate,
                started: now,
            },
        );
        if self.policy == ScanPolicy::PauseOnAttempt {
            self.held = true;
        }
        self.reconcile(access);

        if let Err(err) = access.open_connection(address, candidate.address_type) {
            warn!(%address, %err, "open request refused");
            self.attempts.remove(&address);
            self.held = false;
            self.reconcile(access);
            return Admission::Rejected(AdmissionRejection::Refused(err));
        }

        info!(
            %address,
            pending_logs = candidate.pending_log_count(),
            "connecting"
        );
        Admission::Admitted
    }

    /// A connection came up. Returns the pending-log count advertised by
    /// the attempt that produced it (0 for a connection we never asked for).
    pub fn on_connection_opened<P: PeripheralAccess + ?Sized>(
        &mut self,
        address: BdAddr,
        access: &mut P,
    ) -> u16 {
        let pending = match self.attempts.remove(&address) {
            Some(attempt) => attempt.candidate.pending_log_count(),
            None => {
                warn!(%address, "connection opened without an outstanding attempt");
                0
            }
        };
        self.connected.insert(address);
        self.reconcile(access);
        pending
    }

    /// An attempt ended without a connection.
    pub fn on_connection_failed<P: PeripheralAccess + ?Sized>(
        &mut self,
        address: BdAddr,
        access: &mut P,
    ) {
        if self.attempts.remove(&address).is_none() {
            warn!(%address, "failure reported for unknown attempt");
        }
        self.held = false;
        self.reconcile(access);
    }

    pub fn on_connection_closed<P: PeripheralAccess + ?Sized>(
        &mut self,
        address: BdAddr,
        access: &mut P,
    ) {
        if !self.connected.remove(&address) {
            warn!(%address, "close reported for a peer that was not open");
        }
        self.held = false;
        self.reconcile(access);
    }

    /// Drop every attempt admitted at or before `cutoff`. Returns the
    /// addresses given up on.
    ///
    /// A late `ConnectionOpened` for one of them is still accepted, as an
    /// unsolicited connection.
    pub fn expire_attempts<P: PeripheralAccess + ?Sized>(
        &mut self,
        cutoff: NaiveDateTime,
        access: &mut P,
    ) -> Vec<BdAddr> {
        let mut expired: Vec<BdAddr> = self
            .attempts
            .iter()
            .filter(|(_, attempt)| attempt.started <= cutoff)
            .map(|(&address, _)| address)
            .collect();
        if expired.is_empty() {
            return expired;
        }
        expired.sort();
        for address in &expired {
            self.attempts.remove(address);
            warn!(%address, "connection attempt timed out");
        }
        self.held = false;
        self.reconcile(access);
        expired
    }

    fn scan_wanted(&self) -> bool {
        if !self.booted || !self.attempts.is_empty() {
            return false;
        }
        match self.policy {
            ScanPolicy::PauseOnAttempt => !self.held,
            ScanPolicy::PauseAtCapacity => self.occupied() < self.cap,
        }
    }

    /// Bring the scanner in line with `scan_wanted`. A refused command
    /// leaves the flag as it was so the next reconcile tries again.
    fn reconcile<P: PeripheralAccess + ?Sized>(&mut self, access: &mut P) {
        let wanted = self.scan_wanted();
        if wanted == self.scanning {
            return;
        }
        let result = if wanted {
            access.start_scanning(self.scan_mode)
        } else {
            access.stop_scanning()
        };
        match result {
            Ok(()) => {
                self.scanning = wanted;
                if wanted {
                    info!("scanning started");
                } else {
                    debug!("scanning paused");
                }
            }
            Err(err) => error!(%err, wanted, "scanner command refused"),
        }
    }
}
