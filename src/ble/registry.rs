//! Session registry - the one owner of every `SessionState`, keyed by
//! connection handle.

use std::collections::HashMap;

use chrono::NaiveDateTime;

use super::session::SessionState;
use super::{AddressType, BdAddr, ConnectionHandle};
use crate::error::RegistryError;

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<ConnectionHandle, SessionState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the session for a newly opened connection.
    pub fn on_open(
        &mut self,
        handle: ConnectionHandle,
        address: BdAddr,
        address_type: AddressType,
        pending_log_count: u16,
        now: NaiveDateTime,
    ) -> Result<&mut SessionState, RegistryError> {
        use std::collections::hash_map::Entry;

        match self.sessions.entry(handle) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateHandle(handle)),
            Entry::Vacant(slot) => Ok(slot.insert(SessionState::new(
                handle,
                address,
                address_type,
                pending_log_count,
                now,
            ))),
        }
    }

    /// Remove and hand back a closed connection's session for flushing.
    pub fn on_close(&mut self, handle: ConnectionHandle) -> Result<SessionState, RegistryError> {
        self.sessions
            .remove(&handle)
            .ok_or(RegistryError::UnknownHandle(handle))
    }

    pub fn get(&mut self, handle: ConnectionHandle) -> Result<&mut SessionState, RegistryError> {
        self.sessions
            .get_mut(&handle)
            .ok_or(RegistryError::UnknownHandle(handle))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionState> {
        self.sessions.values()
    }

    /// Handles of sessions whose last event is at or before `cutoff` and
    /// that have not started closing.
    pub fn stalled_since(&self, cutoff: NaiveDateTime) -> Vec<ConnectionHandle> {
        let mut handles: Vec<_> = self
            .sessions
            .values()
            .filter(|s| !s.is_closing() && s.last_activity <= cutoff)
            .map(|s| s.handle)
            .collect();
        handles.sort();
        handles
    }

    /// Handles of closing sessions whose last event is at or before
    /// `cutoff`, i.e. whose close was never confirmed.
    pub fn closing_since(&self, cutoff: NaiveDateTime) -> Vec<ConnectionHandle> {
        let mut handles: Vec<_> = self
            .sessions
            .values()
            .filter(|s| s.is_closing() && s.last_activity <= cutoff)
            .map(|s| s.handle)
            .collect();
        handles.sort();
        handles
    }

    /// Remove every session, ordered by handle.
    pub fn drain(&mut self) -> Vec<SessionState> {
        let mut sessions: Vec<_> = self.sessions.drain().map(|(_, s)| s).collect();
        sessions.sort_by_key(|s| s.handle);
        sessions
    }
}
