//! External store contract (spec §5, C5).
//!
//! The stored-entry and stored-session managers are externalized
//! behind a compare-and-swap `get`/`update` interface, the same shape
//! as `session_store.rs`'s single-file `with_store` pattern generalized
//! over a record type. This module defines the CAS contract plus two
//! reference implementations: an in-memory one for tests, and a
//! file-backed one for the demo binary.

mod file_store;
mod json_cas;
mod mem_store;

pub use file_store::{FileEntryStore, FileSessionStore};
pub use mem_store::{MemEntryStore, MemSessionStore};

use crate::entry::StoredEntry;
use crate::path::Path;
use crate::session_id::SessionId;
use crate::stored_session::StoredSession;

/// Outcome of a CAS `update`. `Conflict` carries the record actually
/// present so the caller can retry without a second round trip.
#[derive(Debug, Clone)]
pub enum CasOutcome<T> {
    Committed(Option<T>),
    Conflict(Option<T>),
}

/// Implemented by record types that carry their own optimistic-
/// concurrency counter, so `json_cas` can compare versions without
/// knowing the rest of the record's shape.
pub trait Versioned {
    fn storage_version(&self) -> u64;
}

impl Versioned for StoredEntry {
    fn storage_version(&self) -> u64 {
        self.storage_version
    }
}

impl Versioned for StoredSession {
    fn storage_version(&self) -> u64 {
        self.storage_version
    }
}

/// CAS store for stored entries, keyed by path.
pub trait EntryStore: Send + Sync {
    fn get(&self, path: &Path) -> anyhow::Result<Option<StoredEntry>>;

    /// `expected`: the `storage_version` the caller last observed, or
    /// `None` if the caller believes no record exists yet. `new`:
    /// `None` to delete. Returns `Conflict` (with the current value)
    /// if `expected` no longer matches what is stored.
    fn update(
        &self,
        path: &Path,
        expected: Option<u64>,
        new: Option<StoredEntry>,
    ) -> anyhow::Result<CasOutcome<StoredEntry>>;
}

/// CAS store for stored sessions, keyed by session id.
pub trait SessionStore: Send + Sync {
    fn get(&self, session: &SessionId) -> anyhow::Result<Option<StoredSession>>;

    fn update(
        &self,
        session: &SessionId,
        expected: Option<u64>,
        new: Option<StoredSession>,
    ) -> anyhow::Result<CasOutcome<StoredSession>>;

    /// All sessions currently tracked, for the termination scanner
    /// (spec §4.3 / C6). Ordering is unspecified.
    fn list(&self) -> anyhow::Result<Vec<StoredSession>>;
}

/// Collision-resistant, filesystem-safe key for a path: hash the
/// canonical escaped form through SHA-256 and hex-encode the digest.
pub fn path_key(path: &Path) -> String {
    use sha2::{Digest, Sha256};
    let mut h = Sha256::new();
    h.update(path.to_escaped().as_bytes());
    hex::encode(h.finalize())
}

/// Same idea for a session id's compact form.
pub fn session_key(session: &SessionId) -> String {
    use sha2::{Digest, Sha256};
    let mut h = Sha256::new();
    h.update(session.compact().as_bytes());
    hex::encode(h.finalize())
}
