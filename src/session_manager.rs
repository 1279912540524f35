//! Session manager (spec §4.5, C6).
//!
//! Owns this process's session: issues it at startup, keeps its
//! lease renewed on a cooperative timer, and runs the termination
//! scanner that finds *any* session (self or peer) whose lease has
//! lapsed past grace and drives it through `Ending -> Ended`,
//! cascading ephemeral-entry cleanup along the way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cancel::CooperativeCancellationToken;
use crate::error::CoordinationError;
use crate::lock_manager::SessionLiveness;
use crate::ops::force_delete_recursive;
use crate::path::Path;
use crate::session_id::SessionId;
use crate::store::{CasOutcome, EntryStore, SessionStore};
use crate::stored_session::StoredSession;
use crate::wait_manager::WaitManager;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct SessionManager {
    session_id: SessionId,
    entry_store: Arc<dyn EntryStore>,
    session_store: Arc<dyn SessionStore>,
    wait: Arc<WaitManager>,
    lease_length: Duration,
    lease_grace: Duration,
    cancel: CooperativeCancellationToken,
    terminated: AtomicBool,
}

impl SessionManager {
    /// Starts a fresh session: generates an id from `logical_prefix`
    /// and `physical_address`, inserts it with a fresh lease via CAS,
    /// and spawns the renewal + termination-scanner task. Fails with
    /// `SessionTerminated` only if a live session with the exact same
    /// identity already exists (a transport-level address collision).
    pub async fn start(
        logical_prefix: Vec<u8>,
        physical_address: Vec<u8>,
        entry_store: Arc<dyn EntryStore>,
        session_store: Arc<dyn SessionStore>,
        wait: Arc<WaitManager>,
        lease_length: Duration,
        lease_grace: Duration,
    ) -> Result<Arc<Self>, CoordinationError> {
        let session_id = SessionId::new(logical_prefix, physical_address)
            .map_err(|e| CoordinationError::MalformedPath(e.to_string()))?;

        let lease_end_ms = now_ms() + lease_length.as_millis() as u64;
        let fresh = StoredSession::begin(session_id.clone(), lease_end_ms);

        let mut expected = None;
        loop {
            match session_store
                .update(&session_id, expected, Some(fresh.clone()))
                .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?
            {
                CasOutcome::Committed(_) => break,
                CasOutcome::Conflict(Some(existing)) if existing.is_alive() => {
                    warn!(session = %session_id, "duplicate session identity observed at startup");
                    return Err(CoordinationError::SessionTerminated);
                }
                CasOutcome::Conflict(Some(existing)) => {
                    // A dead record under the same identity (a restart
                    // reusing the same physical address): take it over.
                    expected = Some(existing.storage_version);
                }
                CasOutcome::Conflict(None) => expected = None,
            }
        }

        info!(session = %session_id, "session started");

        let manager = Arc::new(Self {
            session_id,
            entry_store,
            session_store,
            wait,
            lease_length,
            lease_grace,
            cancel: CooperativeCancellationToken::new(),
            terminated: AtomicBool::new(false),
        });

        let task_manager = manager.clone();
        tokio::spawn(async move { task_manager.run().await });

        Ok(manager)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Exposes the backing session store so the coordinator can CAS
    /// `owned_entries` without duplicating a handle to it.
    pub fn session_store(&self) -> &Arc<dyn SessionStore> {
        &self.session_store
    }

    pub fn cancellation_token(&self) -> &CooperativeCancellationToken {
        &self.cancel
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    async fn run(self: Arc<Self>) {
        let mut renew_interval = tokio::time::interval(self.lease_length / 2);
        let mut scan_interval = tokio::time::interval(self.lease_length);
        loop {
            tokio::select! {
                _ = renew_interval.tick() => {
                    if let Err(e) = self.renew_once() {
                        warn!(error = %e, "lease renewal failed");
                    }
                }
                _ = scan_interval.tick() => {
                    if let Err(e) = self.scan_once() {
                        warn!(error = %e, "termination scan failed");
                    }
                }
                _ = self.cancel.cancelled() => break,
            }
        }
    }

    fn renew_once(&self) -> Result<(), CoordinationError> {
        let current = self
            .session_store
            .get(&self.session_id)
            .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?
            .ok_or(CoordinationError::SessionTerminated)?;

        if !current.is_alive() {
            self.mark_terminated();
            return Err(CoordinationError::SessionTerminated);
        }

        let now = now_ms();
        if now > current.lease_end_ms.saturating_add(self.lease_grace.as_millis() as u64) {
            self.mark_terminated();
            return Err(CoordinationError::SessionTerminated);
        }

        let new_lease_end = now + self.lease_length.as_millis() as u64;
        let renewed = current
            .update_lease(new_lease_end)
            .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?;
        match self
            .session_store
            .update(&self.session_id, Some(current.storage_version), Some(renewed))
            .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?
        {
            CasOutcome::Committed(_) => {
                debug!(session = %self.session_id, "lease renewed");
                Ok(())
            }
            CasOutcome::Conflict(_) => {
                // Someone else mutated the record (e.g. a scanner
                // racing us into Ending). Re-evaluate next tick.
                Ok(())
            }
        }
    }

    fn mark_terminated(&self) {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            warn!(session = %self.session_id, "session declared terminated");
        }
        self.cancel.cancel();
    }

    /// Runs one termination-scanner pass over every tracked session.
    /// Safe to call concurrently from multiple processes: every step
    /// is an idempotent CAS.
    pub fn scan_once(&self) -> Result<(), CoordinationError> {
        let sessions = self
            .session_store
            .list()
            .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?;
        let now = now_ms();
        for session in sessions {
            if session.is_ended(now, self.lease_grace.as_millis() as u64)
                && !matches!(session.state, crate::stored_session::SessionState::Ended)
            {
                self.terminate_session(session)?;
            }
        }
        Ok(())
    }

    fn terminate_session(&self, session: StoredSession) -> Result<(), CoordinationError> {
        let id = session.session.clone();
        let ending = session.begin_ending();
        let committed = match self
            .session_store
            .update(&id, Some(session.storage_version), Some(ending))
            .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?
        {
            CasOutcome::Committed(Some(s)) => s,
            _ => return Ok(()), // lost the race to another scanner; it'll finish the job
        };

        debug!(session = %id, owned = committed.owned_entries.len(), "cascading ephemeral cleanup");
        for path in committed.owned_entries.iter() {
            self.cascade_one(&id, path)?;
        }

        let mut current = self.session_store.get(&id)
            .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?;
        while let Some(s) = current {
            let ended = s.end();
            match self
                .session_store
                .update(&id, Some(s.storage_version), Some(ended))
                .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?
            {
                CasOutcome::Committed(_) => break,
                CasOutcome::Conflict(fresh) => current = fresh,
            }
        }
        info!(session = %id, "session terminated and cascade complete");
        Ok(())
    }

    /// Ephemeral cascade for one owned path (spec §4.10.d).
    fn cascade_one(&self, session: &SessionId, path: &Path) -> Result<(), CoordinationError> {
        let Some(mut entry) = self
            .entry_store
            .get(path)
            .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?
        else {
            return Ok(());
        };

        if entry.write_lock.as_ref() == Some(session) {
            let released = entry
                .apply(crate::entry::EntryTransition::ReleaseWriteLock { session: session.clone() }, 0)
                .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?;
            match self
                .entry_store
                .update(path, Some(entry.storage_version), Some(released.clone()))
                .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?
            {
                CasOutcome::Committed(Some(new)) => {
                    self.wait.notify_write_lock_release(path, session);
                    entry = new;
                }
                _ => {
                    if let Some(fresh) = self
                        .entry_store
                        .get(path)
                        .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?
                    {
                        entry = fresh;
                    }
                }
            }
        }

        if entry.read_locks.contains(session) {
            let released = entry
                .apply(crate::entry::EntryTransition::ReleaseReadLock { session: session.clone() }, 0)
                .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?;
            if let CasOutcome::Committed(Some(_)) = self
                .entry_store
                .update(path, Some(entry.storage_version), Some(released))
                .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?
            {
                self.wait.notify_read_lock_release(path, session);
            }
        }

        if entry.creating_session == *session && entry.ephemeral {
            force_delete_recursive(self.entry_store.as_ref(), &self.wait, path)
                .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?;
        }

        Ok(())
    }
}

/// `SessionLiveness` backed by the external session store, consulted
/// by the lock manager before granting or retaining any lock.
pub struct StoreBackedLiveness {
    store: Arc<dyn SessionStore>,
    lease_grace: Duration,
}

impl StoreBackedLiveness {
    pub fn new(store: Arc<dyn SessionStore>, lease_grace: Duration) -> Self {
        Self { store, lease_grace }
    }
}

impl SessionLiveness for StoreBackedLiveness {
    fn is_ended(&self, session: &SessionId) -> bool {
        match self.store.get(session) {
            Ok(Some(s)) => s.is_ended(now_ms(), self.lease_grace.as_millis() as u64),
            Ok(None) => true,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::StoredEntry;
    use crate::store::{MemEntryStore, MemSessionStore};

    #[tokio::test]
    async fn start_issues_a_fresh_alive_session() {
        let entry_store = Arc::new(MemEntryStore::new());
        let session_store = Arc::new(MemSessionStore::new());
        let wait = Arc::new(WaitManager::new(Duration::from_millis(50)));
        let mgr = SessionManager::start(
            b"node-a".to_vec(),
            b"addr-1".to_vec(),
            entry_store,
            session_store.clone(),
            wait,
            Duration::from_secs(10),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        let stored = session_store.get(mgr.session_id()).unwrap().unwrap();
        assert!(stored.is_alive());
        mgr.cancellation_token().cancel();
    }

    #[test]
    fn scan_terminates_expired_session_and_cascades_ephemeral_entry() {
        let entry_store = Arc::new(MemEntryStore::new());
        let session_store = Arc::new(MemSessionStore::new());
        let wait = Arc::new(WaitManager::new(Duration::from_millis(50)));

        let owner = SessionId::new(vec![1], vec![1]).unwrap();
        let path = Path::from_segments(["e"]);
        let entry = StoredEntry::create(path.clone(), owner.clone(), true, vec![], 0);
        entry_store.update(&path, None, Some(entry)).unwrap();

        let expired = StoredSession::begin(owner.clone(), 0).add_entry(path.clone()).unwrap();
        session_store.update(&owner, None, Some(expired)).unwrap();

        let mgr = SessionManager {
            session_id: SessionId::new(vec![9], vec![9]).unwrap(),
            entry_store: entry_store.clone(),
            session_store: session_store.clone(),
            wait,
            lease_length: Duration::from_secs(10),
            lease_grace: Duration::from_millis(0),
            cancel: CooperativeCancellationToken::new(),
            terminated: AtomicBool::new(false),
        };

        mgr.scan_once().unwrap();

        let final_session = session_store.get(&owner).unwrap().unwrap();
        assert!(final_session.is_ended(now_ms(), 0));
        assert!(final_session.owned_entries.is_empty());
        assert!(entry_store.get(&path).unwrap().is_none());
    }
}
