use thiserror::Error;

use crate::path::Path;

/// Caller-facing error taxonomy for the coordination kernel (spec §7).
///
/// `StaleCacheEntry` is intentionally absent: it is an internal retry
/// signal and must never escape the coordination manager's public API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("entry already exists at {0}")]
    EntryAlreadyExists(Path),

    #[error("entry not found at {0}")]
    EntryNotFound(Path),

    #[error("entry at {0} has children and recursive delete was not requested")]
    EntryNotEmpty(Path),

    #[error("version mismatch at {path}: expected {expected}, found {found}")]
    VersionMismatch {
        path: Path,
        expected: u64,
        found: u64,
    },

    #[error("malformed path: {0}")]
    MalformedPath(String),

    #[error("session terminated")]
    SessionTerminated,

    #[error("operation cancelled")]
    Cancelled,

    #[error("external store unavailable: {0}")]
    StorageUnavailable(String),
}

/// Internal-only signal: a cached handle's token no longer matches the
/// slot. Never surfaces through `CoordinationManager`'s public API —
/// callers of the manager retry on a fresh cache snapshot instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleCacheEntry;

/// A bug: an entry or session transition was attempted whose
/// precondition (spec §4.2, §4.3) does not hold. Fail-stop rather than
/// attempt recovery, since it indicates a broken invariant upstream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid entry transition: {0}")]
pub struct InvalidEntryTransition(pub String);

pub type Result<T> = std::result::Result<T, CoordinationError>;
