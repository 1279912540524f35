//! Lock manager (spec §4.6, C7).
//!
//! Acquires and releases per-entry read/write locks through the
//! stored-entry transitions and the external store's CAS. Fairness
//! (writer preference, FIFO grant order, session-id tiebreak) and the
//! ephemeral-cleanup intersection (a lock is never granted to, and is
//! treated as released for, an ended session) are both implemented
//! here; the wait manager owns the per-path ticket queue that backs
//! the fairness check, plus the suspend/notify primitive.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cancel::CooperativeCancellationToken;
use crate::entry::{EntryTransition, StoredEntry};
use crate::error::CoordinationError;
use crate::path::Path;
use crate::session_id::SessionId;
use crate::store::{CasOutcome, EntryStore};
use crate::wait_manager::WaitManager;

/// Supplied by the coordinator: tells the lock manager whether a
/// session is ended, without the lock manager needing to depend
/// directly on the session store.
pub trait SessionLiveness: Send + Sync {
    fn is_ended(&self, session: &SessionId) -> bool;
}

pub struct LockManager {
    store: Arc<dyn EntryStore>,
    wait: Arc<WaitManager>,
}

impl LockManager {
    pub fn new(store: Arc<dyn EntryStore>, wait: Arc<WaitManager>) -> Self {
        Self { store, wait }
    }

    fn load(&self, path: &Path) -> Result<StoredEntry, CoordinationError> {
        self.store
            .get(path)
            .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?
            .ok_or_else(|| CoordinationError::EntryNotFound(path.clone()))
    }

    /// Strips a stale write lock held by a now-ended session. A no-op
    /// (returns the entry unchanged) if the write lock is live or
    /// absent.
    fn strip_dead_write_lock(
        &self,
        entry: &StoredEntry,
        liveness: &dyn SessionLiveness,
    ) -> Result<Option<StoredEntry>, CoordinationError> {
        let Some(holder) = entry.write_lock.clone() else {
            return Ok(None);
        };
        if !liveness.is_ended(&holder) {
            return Ok(None);
        }
        debug!(path = %entry.path, holder = %holder, "stripping write lock held by ended session");
        let stripped = entry
            .apply(EntryTransition::ReleaseWriteLock { session: holder.clone() }, 0)
            .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?;
        match self
            .store
            .update(&entry.path, Some(entry.storage_version), Some(stripped.clone()))
            .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?
        {
            CasOutcome::Committed(Some(new)) => {
                self.wait.notify_write_lock_release(&entry.path, &holder);
                Ok(Some(new))
            }
            _ => Ok(None),
        }
    }

    /// Filters `read_locks` down to sessions that are both live and
    /// not `except`.
    fn other_live_readers(
        &self,
        entry: &StoredEntry,
        except: &SessionId,
        liveness: &dyn SessionLiveness,
    ) -> Vec<SessionId> {
        entry
            .read_locks
            .iter()
            .filter(|s| *s != except && !liveness.is_ended(s))
            .cloned()
            .collect()
    }

    pub async fn acquire_read_lock(
        &self,
        path: &Path,
        session: &SessionId,
        liveness: &dyn SessionLiveness,
        cancel: &CooperativeCancellationToken,
    ) -> Result<StoredEntry, CoordinationError> {
        let waiter = self.wait.register_reader_waiter(path, session);
        loop {
            if cancel.is_cancelled() {
                return Err(CoordinationError::Cancelled);
            }
            let mut current = self.load(path)?;
            if let Some(stripped) = self.strip_dead_write_lock(&current, liveness)? {
                current = stripped;
            }

            let writer_live = current
                .write_lock
                .as_ref()
                .map(|w| w != session && !liveness.is_ended(w))
                .unwrap_or(false);
            // A session that already holds the write lock is adding an
            // implied read lock (reentrancy, spec §4.6), not a new
            // reader, so it is never subject to writer-preference
            // queueing.
            let queue_clear = current.write_lock.as_ref() == Some(session) || waiter.may_proceed();

            if !writer_live && queue_clear {
                let next = match current.apply(
                    EntryTransition::AcquireReadLock {
                        session: session.clone(),
                    },
                    0,
                ) {
                    Ok(next) => next,
                    Err(_) => {
                        // Precondition raced out from under us; reload and retry.
                        self.wait.wait_for_any_change(path, cancel).await?;
                        continue;
                    }
                };
                match self
                    .store
                    .update(path, Some(current.storage_version), Some(next))
                    .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?
                {
                    CasOutcome::Committed(Some(new)) => return Ok(new),
                    _ => continue,
                }
            }

            self.wait.wait_for_any_change(path, cancel).await?;
        }
    }

    pub async fn acquire_write_lock(
        &self,
        path: &Path,
        session: &SessionId,
        liveness: &dyn SessionLiveness,
        cancel: &CooperativeCancellationToken,
    ) -> Result<StoredEntry, CoordinationError> {
        let waiter = self.wait.register_writer_waiter(path, session);
        loop {
            if cancel.is_cancelled() {
                return Err(CoordinationError::Cancelled);
            }
            let mut current = self.load(path)?;
            if let Some(stripped) = self.strip_dead_write_lock(&current, liveness)? {
                current = stripped;
            }

            if current.write_lock.as_ref() == Some(session) {
                // Recursive acquisition: idempotent no-op (spec L4).
                return Ok(current);
            }

            let blockers = self.other_live_readers(&current, session, liveness);
            if waiter.may_proceed() && current.write_lock.is_none() && blockers.is_empty() {
                let next = current
                    .apply(
                        EntryTransition::AcquireWriteLock {
                            session: session.clone(),
                        },
                        0,
                    )
                    .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?;
                match self
                    .store
                    .update(path, Some(current.storage_version), Some(next))
                    .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?
                {
                    CasOutcome::Committed(Some(new)) => return Ok(new),
                    _ => continue,
                }
            }

            self.wait.wait_for_any_change(path, cancel).await?;
        }
    }

    pub fn release_read_lock(&self, path: &Path, session: &SessionId) -> Result<StoredEntry, CoordinationError> {
        loop {
            let current = self.load(path)?;
            if !current.read_locks.contains(session) {
                return Ok(current);
            }
            let next = current
                .apply(
                    EntryTransition::ReleaseReadLock {
                        session: session.clone(),
                    },
                    0,
                )
                .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?;
            match self
                .store
                .update(path, Some(current.storage_version), Some(next))
                .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?
            {
                CasOutcome::Committed(Some(new)) => {
                    self.wait.notify_read_lock_release(path, session);
                    return Ok(new);
                }
                _ => continue,
            }
        }
    }

    pub fn release_write_lock(&self, path: &Path, session: &SessionId) -> Result<StoredEntry, CoordinationError> {
        loop {
            let current = self.load(path)?;
            if current.write_lock.as_ref() != Some(session) {
                return Ok(current);
            }
            let next = current
                .apply(
                    EntryTransition::ReleaseWriteLock {
                        session: session.clone(),
                    },
                    0,
                )
                .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?;
            match self
                .store
                .update(path, Some(current.storage_version), Some(next))
                .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?
            {
                CasOutcome::Committed(Some(new)) => {
                    self.wait.notify_write_lock_release(path, session);
                    return Ok(new);
                }
                _ => continue,
            }
        }
    }
}

/// No-op liveness check: nobody is ever ended. Used by tests and by
/// callers that don't track sessions at all.
pub struct AlwaysAlive;

impl SessionLiveness for AlwaysAlive {
    fn is_ended(&self, _session: &SessionId) -> bool {
        false
    }
}
