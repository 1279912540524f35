//! In-memory CAS stores, for unit and scenario tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::json_cas::cas_apply;
use super::{path_key, session_key, CasOutcome, EntryStore, SessionStore};
use crate::entry::StoredEntry;
use crate::path::Path;
use crate::session_id::SessionId;
use crate::stored_session::StoredSession;

#[derive(Default)]
pub struct MemEntryStore {
    records: Mutex<BTreeMap<String, StoredEntry>>,
}

impl MemEntryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EntryStore for MemEntryStore {
    fn get(&self, path: &Path) -> anyhow::Result<Option<StoredEntry>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(&path_key(path)).cloned())
    }

    fn update(
        &self,
        path: &Path,
        expected: Option<u64>,
        new: Option<StoredEntry>,
    ) -> anyhow::Result<CasOutcome<StoredEntry>> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(cas_apply(&mut records, &path_key(path), expected, new))
    }
}

#[derive(Default)]
pub struct MemSessionStore {
    records: Mutex<BTreeMap<String, StoredSession>>,
}

impl MemSessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemSessionStore {
    fn get(&self, session: &SessionId) -> anyhow::Result<Option<StoredSession>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(&session_key(session)).cloned())
    }

    fn update(
        &self,
        session: &SessionId,
        expected: Option<u64>,
        new: Option<StoredSession>,
    ) -> anyhow::Result<CasOutcome<StoredSession>> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(cas_apply(&mut records, &session_key(session), expected, new))
    }

    fn list(&self) -> anyhow::Result<Vec<StoredSession>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> SessionId {
        SessionId::new(vec![1], vec![9]).unwrap()
    }

    #[test]
    fn create_then_conflicting_update_is_rejected() {
        let store = MemEntryStore::new();
        let path = Path::from_segments(["a"]);
        let entry = StoredEntry::create(path.clone(), sid(), false, vec![1], 0);

        let committed = store.update(&path, None, Some(entry.clone())).unwrap();
        assert!(matches!(committed, CasOutcome::Committed(Some(_))));

        // Second create with expected=None conflicts: a record exists now.
        let conflict = store.update(&path, None, Some(entry)).unwrap();
        assert!(matches!(conflict, CasOutcome::Conflict(Some(_))));
    }

    #[test]
    fn delete_requires_matching_expected_version() {
        let store = MemEntryStore::new();
        let path = Path::from_segments(["a"]);
        let entry = StoredEntry::create(path.clone(), sid(), false, vec![], 0);
        store.update(&path, None, Some(entry.clone())).unwrap();

        let stale = store.update(&path, Some(999), None).unwrap();
        assert!(matches!(stale, CasOutcome::Conflict(Some(_))));

        let ok = store
            .update(&path, Some(entry.storage_version), None)
            .unwrap();
        assert!(matches!(ok, CasOutcome::Committed(None)));
        assert!(store.get(&path).unwrap().is_none());
    }

    #[test]
    fn session_store_lists_all_records() {
        let store = MemSessionStore::new();
        let a = StoredSession::begin(SessionId::new(vec![1], vec![1]).unwrap(), 100);
        let b = StoredSession::begin(SessionId::new(vec![2], vec![2]).unwrap(), 100);
        store.update(&a.session, None, Some(a.clone())).unwrap();
        store.update(&b.session, None, Some(b.clone())).unwrap();
        assert_eq!(store.list().unwrap().len(), 2);
    }
}
