//! Stored-session model and transitions (spec §3.4, §4.3).
//!
//! A `StoredSession` tracks one session's lease and the set of entry
//! paths it owns (for ephemeral cascade on termination). Like
//! `StoredEntry`, state changes are pure functions from old state to
//! new state; persistence and lease-clock decisions live in
//! `session_manager`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::InvalidEntryTransition;
use crate::path::Path;
use crate::session_id::SessionId;

/// Monotone lifecycle state: `Alive -> Ending -> Ended`. Never moves
/// backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Alive,
    Ending,
    Ended,
}

impl SessionState {
    fn rank(self) -> u8 {
        match self {
            SessionState::Alive => 0,
            SessionState::Ending => 1,
            SessionState::Ended => 2,
        }
    }
}

impl PartialOrd for SessionState {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SessionState {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub session: SessionId,
    pub lease_end_ms: u64,
    pub state: SessionState,
    pub owned_entries: BTreeSet<Path>,
    pub storage_version: u64,
}

impl StoredSession {
    /// `begin(id, lease_end)`: precondition none, a fresh record,
    /// `Alive` with empty ownership.
    pub fn begin(session: SessionId, lease_end_ms: u64) -> Self {
        Self {
            session,
            lease_end_ms,
            state: SessionState::Alive,
            owned_entries: BTreeSet::new(),
            storage_version: 1,
        }
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.state, SessionState::Alive)
    }

    /// Derived read, not a stored bit: true once `state = Ended`, or
    /// once `state = Alive` and the lease (plus grace) has lapsed.
    /// `now_ms`/`lease_grace_ms` are supplied by the caller (the
    /// session manager), which owns the wall clock.
    pub fn is_ended(&self, now_ms: u64, lease_grace_ms: u64) -> bool {
        match self.state {
            SessionState::Ended => true,
            SessionState::Ending => true,
            SessionState::Alive => now_ms > self.lease_end_ms.saturating_add(lease_grace_ms),
        }
    }

    /// `update_lease(t)`: precondition `state = Alive`.
    pub fn update_lease(&self, new_lease_end_ms: u64) -> Result<Self, InvalidEntryTransition> {
        if !self.is_alive() {
            return Err(InvalidEntryTransition(format!(
                "update_lease({}): session is not alive (state={:?})",
                self.session, self.state
            )));
        }
        let mut next = self.clone();
        next.lease_end_ms = new_lease_end_ms;
        next.storage_version += 1;
        Ok(next)
    }

    /// `add_entry(path)`: precondition `state != Ended`.
    pub fn add_entry(&self, path: Path) -> Result<Self, InvalidEntryTransition> {
        if matches!(self.state, SessionState::Ended) {
            return Err(InvalidEntryTransition(format!(
                "add_entry({}): session already Ended",
                self.session
            )));
        }
        let mut next = self.clone();
        next.owned_entries.insert(path);
        next.storage_version += 1;
        Ok(next)
    }

    /// `remove_entry(path)`: precondition `state != Ended`.
    pub fn remove_entry(&self, path: &Path) -> Result<Self, InvalidEntryTransition> {
        if matches!(self.state, SessionState::Ended) {
            return Err(InvalidEntryTransition(format!(
                "remove_entry({}): session already Ended",
                self.session
            )));
        }
        let mut next = self.clone();
        next.owned_entries.remove(path);
        next.storage_version += 1;
        Ok(next)
    }

    /// Marks the session `Ending`: not itself one of the named
    /// transitions in the spec table, but the intermediate CAS step
    /// the termination scanner performs before running the ephemeral
    /// cascade, so concurrent scanners agree a cascade is in flight.
    /// A no-op once already `Ending` or `Ended`.
    pub fn begin_ending(&self) -> Self {
        if matches!(self.state, SessionState::Alive) {
            let mut next = self.clone();
            next.state = SessionState::Ending;
            next.storage_version += 1;
            next
        } else {
            self.clone()
        }
    }

    /// `end()`: precondition none ("any"); state becomes `Ended` and
    /// ownership is cleared unconditionally (I4).
    pub fn end(&self) -> Self {
        if matches!(self.state, SessionState::Ended) && self.owned_entries.is_empty() {
            return self.clone();
        }
        let mut next = self.clone();
        next.state = SessionState::Ended;
        next.owned_entries.clear();
        next.storage_version += 1;
        next
    }
}
