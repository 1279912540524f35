//! File-backed CAS stores, directly modeled on `SessionStore`'s
//! lock-read-modify-write-publish cycle: one JSON file per record
//! type, keyed by a hashed path or session id, guarded by an
//! exclusive file lock while the read-modify-publish cycle runs.

use std::path::PathBuf;

use super::json_cas::{cas_apply, JsonFileStore};
use super::{path_key, session_key, CasOutcome, EntryStore, SessionStore};
use crate::entry::StoredEntry;
use crate::path::Path;
use crate::session_id::SessionId;
use crate::stored_session::StoredSession;

pub struct FileEntryStore {
    inner: JsonFileStore<StoredEntry>,
}

impl FileEntryStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            inner: JsonFileStore::new(path),
        }
    }
}

impl EntryStore for FileEntryStore {
    fn get(&self, path: &Path) -> anyhow::Result<Option<StoredEntry>> {
        let key = path_key(path);
        self.inner.with_store(|map| map.get(&key).cloned())
    }

    fn update(
        &self,
        path: &Path,
        expected: Option<u64>,
        new: Option<StoredEntry>,
    ) -> anyhow::Result<CasOutcome<StoredEntry>> {
        let key = path_key(path);
        self.inner
            .with_store(|map| cas_apply(map, &key, expected, new))
    }
}

pub struct FileSessionStore {
    inner: JsonFileStore<StoredSession>,
}

impl FileSessionStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            inner: JsonFileStore::new(path),
        }
    }
}

impl SessionStore for FileSessionStore {
    fn get(&self, session: &SessionId) -> anyhow::Result<Option<StoredSession>> {
        let key = session_key(session);
        self.inner.with_store(|map| map.get(&key).cloned())
    }

    fn update(
        &self,
        session: &SessionId,
        expected: Option<u64>,
        new: Option<StoredSession>,
    ) -> anyhow::Result<CasOutcome<StoredSession>> {
        let key = session_key(session);
        self.inner
            .with_store(|map| cas_apply(map, &key, expected, new))
    }

    fn list(&self) -> anyhow::Result<Vec<StoredSession>> {
        self.inner.with_store(|map| map.values().cloned().collect())
    }
}
