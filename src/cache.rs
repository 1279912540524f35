//! Per-session client cache with coherence invalidation (spec §4.9, C9).
//!
//! One `ClientCache` per coordination-manager instance (i.e. per
//! session). Mutations route through the external store's CAS; the
//! cache itself is a flat, value-typed map plus an invalidation
//! token, matching the §9 design note that entries and sessions are
//! plain records owned by the cache rather than shared mutable state.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::entry::StoredEntry;
use crate::error::StaleCacheEntry;
use crate::path::Path;

/// The strongest lock the local session currently holds on a cached
/// entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    None,
    Shared,
    Exclusive,
}

#[derive(Debug, Clone)]
struct CacheSlot {
    entry: StoredEntry,
    token: u64,
    lock_kind: LockKind,
}

/// A cached entry handle plus the token it was read at. Operations
/// against a handle whose token no longer matches the live slot fail
/// with `StaleCacheEntry`; the caller is expected to re-fetch from
/// the cache (or store) and retry.
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub entry: StoredEntry,
    pub token: u64,
    pub lock_kind: LockKind,
}

#[derive(Default)]
pub struct ClientCache {
    slots: Mutex<HashMap<Path, CacheSlot>>,
    next_token: std::sync::atomic::AtomicU64,
}

impl ClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_token(&self) -> u64 {
        self.next_token
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// Returns the cached entry for `path` if present, regardless of
    /// `lock_kind` (an observation-only slot is still readable).
    pub fn get(&self, path: &Path) -> Option<CachedEntry> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(path).map(|slot| CachedEntry {
            entry: slot.entry.clone(),
            token: slot.token,
            lock_kind: slot.lock_kind,
        })
    }

    /// Populates or replaces the slot for `path`, bumping its token.
    /// Used both for a fresh store read (`lock_kind = None`) and for
    /// recording a newly acquired lock.
    pub fn put(&self, path: Path, entry: StoredEntry, lock_kind: LockKind) -> u64 {
        let token = self.fresh_token();
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.insert(
            path,
            CacheSlot {
                entry,
                token,
                lock_kind,
            },
        );
        token
    }

    /// Downgrades a slot's `lock_kind` in place after a local lock
    /// release, without changing the cached entry snapshot or
    /// bumping the token — the slot stays valid for observation-only
    /// reads until the next external invalidation.
    pub fn downgrade(&self, path: &Path, lock_kind: LockKind) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get_mut(path) {
            slot.lock_kind = lock_kind;
        }
    }

    /// External invalidation: bumps the token (and drops the now-
    /// authoritative-less `lock_kind`) so every outstanding handle's
    /// token check fails. Called on a wait-manager notification for
    /// this path, or a CAS mismatch observed while writing through.
    pub fn invalidate(&self, path: &Path) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(path);
    }

    /// Checks a handle's token against the live slot. `Ok(())` if
    /// still current; `Err(StaleCacheEntry)` (never surfaced past the
    /// coordination manager) otherwise.
    pub fn check_token(&self, path: &Path, token: u64) -> Result<(), StaleCacheEntry> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        match slots.get(path) {
            Some(slot) if slot.token == token => Ok(()),
            _ => Err(StaleCacheEntry),
        }
    }
}
