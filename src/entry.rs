//! Stored-entry model and its pure transitions (spec §3.3, §4.2).
//!
//! Transitions are modeled as a tagged set of cases (`EntryTransition`)
//! applied through a single pure `StoredEntry::apply` function, per the
//! design note in spec §9 ("stored entry manager as polymorphic
//! transition set" is better expressed this way than as a trait with
//! multiple schema-specific implementations). No transition performs
//! I/O; the external-store CAS and cache invalidation happen one layer
//! up, in `coordinator`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::InvalidEntryTransition;
use crate::path::Path;
use crate::session_id::SessionId;

/// Immutable, persisted record for one namespace entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub path: Path,
    pub value: Vec<u8>,
    pub version: u64,
    pub creation_time_ms: u64,
    pub last_write_time_ms: u64,
    pub creating_session: SessionId,
    pub ephemeral: bool,
    pub write_lock: Option<SessionId>,
    pub read_locks: BTreeSet<SessionId>,
    pub children: BTreeSet<String>,
    pub storage_version: u64,
    /// Set by the `Remove` transition. A tombstoned record is only
    /// ever observed mid-flight by a caller racing the delete CAS;
    /// the external store deletes the key outright once the tombstone
    /// transition's CAS commits, so external callers see "absent".
    #[serde(default)]
    pub tombstoned: bool,
}

/// Tagged transition cases over `StoredEntry` (spec §4.2 table).
#[derive(Debug, Clone)]
pub enum EntryTransition {
    AcquireReadLock { session: SessionId },
    ReleaseReadLock { session: SessionId },
    AcquireWriteLock { session: SessionId },
    ReleaseWriteLock { session: SessionId },
    SetValue { value: Vec<u8>, session: SessionId },
    AddChild { name: String, session: SessionId },
    RemoveChild { name: String, session: SessionId },
    Remove { session: SessionId },
}

impl StoredEntry {
    /// Pure constructor for `create(path, session, ephemeral, value)`.
    /// Has no precondition on prior state — the caller (coordinator)
    /// is responsible for using this only when no record exists yet,
    /// enforced via the store's CAS, not here.
    pub fn create(
        path: Path,
        session: SessionId,
        ephemeral: bool,
        value: Vec<u8>,
        now_ms: u64,
    ) -> Self {
        Self {
            path,
            value,
            version: 1,
            creation_time_ms: now_ms,
            last_write_time_ms: now_ms,
            write_lock: Some(session.clone()),
            read_locks: BTreeSet::new(),
            children: BTreeSet::new(),
            storage_version: 1,
            ephemeral,
            creating_session: session,
            tombstoned: false,
        }
    }

    /// Applies one transition, checking its precondition. Returns
    /// `InvalidEntryTransition` (a fail-stop bug signal, not a
    /// caller-facing error) if the precondition does not hold -- the
    /// lock manager is expected to have already verified it.
    pub fn apply(
        &self,
        transition: EntryTransition,
        now_ms: u64,
    ) -> Result<Self, InvalidEntryTransition> {
        let mut next = self.clone();
        next.storage_version += 1;

        match transition {
            EntryTransition::AcquireReadLock { session } => {
                if next.write_lock.is_some() && next.write_lock.as_ref() != Some(&session) {
                    return Err(InvalidEntryTransition(format!(
                        "acquire_read_lock({session}): write lock held by another session at {}",
                        next.path
                    )));
                }
                next.read_locks.insert(session);
            }
            EntryTransition::ReleaseReadLock { session } => {
                if !next.read_locks.remove(&session) {
                    return Err(InvalidEntryTransition(format!(
                        "release_read_lock({session}): session does not hold a read lock at {}",
                        next.path
                    )));
                }
            }
            EntryTransition::AcquireWriteLock { session } => {
                if next.write_lock.as_ref() == Some(&session) {
                    // Recursive acquisition by the same session is a no-op.
                    next.storage_version -= 1;
                    return Ok(next);
                }
                let only_self_reads = next.read_locks.is_empty()
                    || (next.read_locks.len() == 1 && next.read_locks.contains(&session));
                if next.write_lock.is_some() || !only_self_reads {
                    return Err(InvalidEntryTransition(format!(
                        "acquire_write_lock({session}): lock unavailable at {}",
                        next.path
                    )));
                }
                next.write_lock = Some(session);
            }
            EntryTransition::ReleaseWriteLock { session } => {
                if next.write_lock.as_ref() != Some(&session) {
                    return Err(InvalidEntryTransition(format!(
                        "release_write_lock({session}): session does not hold the write lock at {}",
                        next.path
                    )));
                }
                // If the same session also holds (or implicitly holds) a read
                // lock, this is a downgrade: the read lock is left intact.
                next.write_lock = None;
            }
            EntryTransition::SetValue { value, session } => {
                if next.write_lock.as_ref() != Some(&session) {
                    return Err(InvalidEntryTransition(format!(
                        "set_value({session}): session does not hold the write lock at {}",
                        next.path
                    )));
                }
                next.value = value;
                next.version += 1;
                next.last_write_time_ms = now_ms;
            }
            EntryTransition::AddChild { name, session } => {
                if next.write_lock.as_ref() != Some(&session) {
                    return Err(InvalidEntryTransition(format!(
                        "add_child({session}): session does not hold the write lock at {}",
                        next.path
                    )));
                }
                next.children.insert(name);
            }
            EntryTransition::RemoveChild { name, session } => {
                if next.write_lock.as_ref() != Some(&session) {
                    return Err(InvalidEntryTransition(format!(
                        "remove_child({session}): session does not hold the write lock at {}",
                        next.path
                    )));
                }
                next.children.remove(&name);
            }
            EntryTransition::Remove { session } => {
                if next.write_lock.as_ref() != Some(&session) {
                    return Err(InvalidEntryTransition(format!(
                        "remove({session}): session does not hold the write lock at {}",
                        next.path
                    )));
                }
                if !next.children.is_empty() {
                    return Err(InvalidEntryTransition(format!(
                        "remove({session}): entry at {} still has children",
                        next.path
                    )));
                }
                next.tombstoned = true;
            }
        }

        Ok(next)
    }

    /// Bypasses the write-lock precondition to detach a child name.
    /// Used only by the forced cascade delete and lazy repair paths
    /// (`ops::detach_child`), where the legitimate lock holder (if
    /// any) is already known to be gone.
    pub(crate) fn force_remove_child(&self, name: &str) -> Self {
        let mut next = self.clone();
        next.children.remove(name);
        next.storage_version += 1;
        next
    }

    /// Symmetric to `force_remove_child`, for lazy repair of a
    /// missing child name (`ops::attach_child`).
    pub(crate) fn force_add_child(&self, name: String) -> Self {
        let mut next = self.clone();
        next.children.insert(name);
        next.storage_version += 1;
        next
    }

    /// True if `session` holds, or implicitly holds via the write
    /// lock, a read lock on this entry.
    pub fn holds_read(&self, session: &SessionId) -> bool {
        self.read_locks.contains(session) || self.write_lock.as_ref() == Some(session)
    }

    pub fn holds_write(&self, session: &SessionId) -> bool {
        self.write_lock.as_ref() == Some(session)
    }
}
