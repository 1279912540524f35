//! Coordination manager (spec §4.10, §6.1, C10).
//!
//! The top-level API: composes the session manager (C6), lock manager
//! (C7), wait manager (C8) and client cache (C9) over a pair of
//! external stores (C5) into `create`/`get_or_create`/`get`/
//! `set_value`/`delete`/`get_session`. Writes follow the sequencing
//! fixed by §2: cache miss or stale → store read → lock acquire →
//! wait → transition → CAS update → lock release → notify waiters.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cache::{ClientCache, LockKind};
use crate::cancel::CooperativeCancellationToken;
use crate::entry::{EntryTransition, StoredEntry};
use crate::error::CoordinationError;
use crate::lock_manager::LockManager;
use crate::ops;
use crate::path::Path;
use crate::session_id::SessionId;
use crate::session_manager::{SessionManager, StoreBackedLiveness};
use crate::store::{CasOutcome, EntryStore, SessionStore};
use crate::wait_manager::WaitManager;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// `create`/`get_or_create` entry lifetime (spec §6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Default,
    Ephemeral,
}

/// Runtime knobs the coordination manager needs at startup, independent
/// of how they were parsed (see `config`).
#[derive(Debug, Clone)]
pub struct CoordinationSettings {
    pub logical_prefix: Vec<u8>,
    pub lease_length: Duration,
    pub lease_grace: Duration,
}

pub struct CoordinationManager {
    entry_store: Arc<dyn EntryStore>,
    lock_manager: LockManager,
    wait: Arc<WaitManager>,
    cache: ClientCache,
    session_manager: Arc<SessionManager>,
    liveness: StoreBackedLiveness,
}

impl CoordinationManager {
    /// Starts a session (C6) and wires the rest of the stack around it.
    /// Ensures the root entry exists before returning.
    pub async fn start(
        settings: CoordinationSettings,
        entry_store: Arc<dyn EntryStore>,
        session_store: Arc<dyn SessionStore>,
        physical_address: Vec<u8>,
    ) -> Result<Self, CoordinationError> {
        let wait = Arc::new(WaitManager::new(settings.lease_length / 4));
        let session_manager = SessionManager::start(
            settings.logical_prefix,
            physical_address,
            entry_store.clone(),
            session_store.clone(),
            wait.clone(),
            settings.lease_length,
            settings.lease_grace,
        )
        .await?;

        let liveness = StoreBackedLiveness::new(session_store.clone(), settings.lease_grace);
        let lock_manager = LockManager::new(entry_store.clone(), wait.clone());

        let manager = Self {
            entry_store,
            lock_manager,
            wait,
            cache: ClientCache::new(),
            session_manager,
            liveness,
        };
        manager.ensure_root_exists()?;
        Ok(manager)
    }

    pub fn get_session(&self) -> SessionId {
        self.session_manager.session_id().clone()
    }

    /// Stops this instance's background lease renewal and termination
    /// scanner without touching its own session record — a simulated
    /// network partition or abrupt process exit. The session is left
    /// for another live instance's scanner to discover once its lease
    /// lapses past grace (spec §4.5, S6).
    pub fn disconnect(&self) {
        self.session_manager.cancellation_token().cancel();
    }

    fn session_id(&self) -> &SessionId {
        self.session_manager.session_id()
    }

    fn check_alive(&self) -> Result<(), CoordinationError> {
        if self.session_manager.is_terminated() {
            Err(CoordinationError::SessionTerminated)
        } else {
            Ok(())
        }
    }

    /// The root entry has no parent to write-lock and can never be
    /// named by `create` (B1), so it is seeded directly rather than
    /// through the normal create protocol.
    fn ensure_root_exists(&self) -> Result<(), CoordinationError> {
        let root = Path::root();
        if self
            .entry_store
            .get(&root)
            .map_err(store_err)?
            .is_some()
        {
            return Ok(());
        }
        let created = StoredEntry::create(root.clone(), self.session_id().clone(), false, Vec::new(), now_ms());
        let released = created
            .apply(
                EntryTransition::ReleaseWriteLock {
                    session: self.session_id().clone(),
                },
                now_ms(),
            )
            .unwrap_or(created);
        match self
            .entry_store
            .update(&root, None, Some(released))
            .map_err(store_err)?
        {
            CasOutcome::Committed(_) | CasOutcome::Conflict(_) => Ok(()),
        }
    }

    /// Guarantees every proper ancestor of `path` has a backing entry,
    /// creating any that are missing with `Default` mode, in
    /// root-to-parent order (spec §4.7 step 2).
    async fn ensure_ancestors(
        &self,
        path: &Path,
        cancel: &CooperativeCancellationToken,
    ) -> Result<(), CoordinationError> {
        for ancestor in path.ancestors() {
            if ancestor.is_root() {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(CoordinationError::Cancelled);
            }
            if self.entry_store.get(&ancestor).map_err(store_err)?.is_some() {
                continue;
            }
            match self
                .create_under_locked_parent(&ancestor, Vec::new(), false, cancel)
                .await
            {
                Ok(_) => {}
                Err(CoordinationError::EntryAlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Core of `create`/`get_or_create`/ancestor-repair: acquires the
    /// parent's write lock, CAS-creates the child, repairs the
    /// parent's `children` set, releases the lock, and records
    /// ownership for ephemeral entries (spec §4.7 steps 1, 3-7).
    async fn create_under_locked_parent(
        &self,
        path: &Path,
        value: Vec<u8>,
        ephemeral: bool,
        cancel: &CooperativeCancellationToken,
    ) -> Result<StoredEntry, CoordinationError> {
        let parent_path = path
            .parent()
            .ok_or_else(|| CoordinationError::MalformedPath("the root entry cannot be created".into()))?;
        let segment = path
            .last_segment()
            .expect("a non-root path always has a last segment")
            .to_string();

        self.lock_manager
            .acquire_write_lock(&parent_path, self.session_id(), &self.liveness, cancel)
            .await?;

        let new_entry = StoredEntry::create(path.clone(), self.session_id().clone(), ephemeral, value, now_ms());
        let outcome = self
            .entry_store
            .update(path, None, Some(new_entry))
            .map_err(store_err);
        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => {
                let _ = self.lock_manager.release_write_lock(&parent_path, self.session_id());
                return Err(e);
            }
        };

        let result = match outcome {
            CasOutcome::Committed(Some(created)) => {
                self.repair_add_child(&parent_path, &segment);
                Ok(created)
            }
            CasOutcome::Conflict(Some(_existing)) => {
                // Lost the create race (or a prior attempt crashed
                // after step 4 but before step 5); repair the parent's
                // `children` set regardless (I2) and report the
                // conflict up so the caller can decide.
                self.repair_add_child(&parent_path, &segment);
                Err(CoordinationError::EntryAlreadyExists(path.clone()))
            }
            _ => unreachable!("update(path, None, Some(_)) never yields Committed(None)"),
        };

        self.lock_manager.release_write_lock(&parent_path, self.session_id())?;

        match &result {
            Ok(created) if ephemeral => {
                self.add_owned_entry(path)?;
                self.cache.put(path.clone(), created.clone(), LockKind::None);
            }
            Ok(created) => {
                self.cache.put(path.clone(), created.clone(), LockKind::None);
            }
            Err(_) => {}
        }

        result
    }

    fn repair_add_child(&self, parent_path: &Path, segment: &str) {
        if let Err(e) = ops::attach_child(self.entry_store.as_ref(), &self.wait, parent_path, segment) {
            debug!(error = %e, parent = %parent_path, %segment, "failed to repair parent children set");
        }
    }

    fn add_owned_entry(&self, path: &Path) -> Result<(), CoordinationError> {
        self.update_owned_entries(path, true)
    }

    fn remove_owned_entry(&self, path: &Path) -> Result<(), CoordinationError> {
        self.update_owned_entries(path, false)
    }

    fn update_owned_entries(&self, path: &Path, add: bool) -> Result<(), CoordinationError> {
        let session_store = self.session_manager.session_store();
        let mut current = session_store
            .get(self.session_id())
            .map_err(store_err)?
            .ok_or(CoordinationError::SessionTerminated)?;
        loop {
            let next = if add {
                current.add_entry(path.clone())
            } else {
                current.remove_entry(path)
            };
            let next = match next {
                Ok(n) => n,
                // The session is already gone; ownership bookkeeping
                // is moot (the cascade, if any, already ran).
                Err(_) => return Ok(()),
            };
            match session_store
                .update(self.session_id(), Some(current.storage_version), Some(next))
                .map_err(store_err)?
            {
                CasOutcome::Committed(_) => return Ok(()),
                CasOutcome::Conflict(Some(fresh)) => current = fresh,
                CasOutcome::Conflict(None) => return Ok(()),
            }
        }
    }

    /// `create(path, value, mode)` (spec §4.7, §6.1). `Default` mode
    /// fails with `EntryAlreadyExists` if the child is already
    /// present; `Ephemeral` mode never is — `mode` here is the
    /// lifetime of the *new* entry, `GetOrCreate` semantics belong to
    /// `get_or_create`.
    pub async fn create(
        &self,
        path: &Path,
        value: Vec<u8>,
        mode: CreateMode,
        cancel: &CooperativeCancellationToken,
    ) -> Result<StoredEntry, CoordinationError> {
        self.check_alive()?;
        if path.is_root() {
            return Err(CoordinationError::MalformedPath(
                "the root entry cannot be created".into(),
            ));
        }
        if cancel.is_cancelled() {
            return Err(CoordinationError::Cancelled);
        }

        self.ensure_ancestors(path, cancel).await?;
        let ephemeral = matches!(mode, CreateMode::Ephemeral);
        self.create_under_locked_parent(path, value, ephemeral, cancel).await
    }

    /// `get_or_create(path, value, mode)`: identical to `create`
    /// except a pre-existing child is returned rather than reported
    /// as an error.
    pub async fn get_or_create(
        &self,
        path: &Path,
        value: Vec<u8>,
        mode: CreateMode,
        cancel: &CooperativeCancellationToken,
    ) -> Result<StoredEntry, CoordinationError> {
        match self.create(path, value, mode, cancel).await {
            Ok(entry) => Ok(entry),
            Err(CoordinationError::EntryAlreadyExists(_)) => {
                self.get(path, cancel)
                    .await?
                    .ok_or_else(|| CoordinationError::EntryNotFound(path.clone()))
            }
            Err(e) => Err(e),
        }
    }

    /// `get(path)`: serves from cache when a fresh slot exists,
    /// otherwise reads through to the store and repopulates the cache
    /// as observation-only (`LockKind::None`). Opportunistically
    /// repairs a parent/child mismatch it notices along the way (I2).
    pub async fn get(
        &self,
        path: &Path,
        cancel: &CooperativeCancellationToken,
    ) -> Result<Option<StoredEntry>, CoordinationError> {
        self.check_alive()?;
        if cancel.is_cancelled() {
            return Err(CoordinationError::Cancelled);
        }

        if let Some(cached) = self.cache.get(path) {
            return Ok(Some(cached.entry));
        }

        let fetched = self.entry_store.get(path).map_err(store_err)?;
        if let (Some(parent_path), Some(segment)) = (path.parent(), path.last_segment()) {
            ops::repair_parent_child(
                self.entry_store.as_ref(),
                &self.wait,
                &parent_path,
                segment,
                fetched.as_ref(),
            )
            .map_err(store_err)?;
        }

        if let Some(entry) = &fetched {
            self.cache.put(path.clone(), entry.clone(), LockKind::None);
        }
        Ok(fetched)
    }

    /// `set_value(path, value, expected_version)`. `expected_version
    /// == 0` means "any" (spec §6.1).
    pub async fn set_value(
        &self,
        path: &Path,
        value: Vec<u8>,
        expected_version: u64,
        cancel: &CooperativeCancellationToken,
    ) -> Result<u64, CoordinationError> {
        self.check_alive()?;
        loop {
            if cancel.is_cancelled() {
                return Err(CoordinationError::Cancelled);
            }
            let before = self
                .entry_store
                .get(path)
                .map_err(store_err)?
                .ok_or_else(|| CoordinationError::EntryNotFound(path.clone()))?;
            if expected_version != 0 && before.version != expected_version {
                return Err(CoordinationError::VersionMismatch {
                    path: path.clone(),
                    expected: expected_version,
                    found: before.version,
                });
            }

            let locked = self
                .lock_manager
                .acquire_write_lock(path, self.session_id(), &self.liveness, cancel)
                .await?;
            if expected_version != 0 && locked.version != expected_version {
                self.lock_manager.release_write_lock(path, self.session_id())?;
                return Err(CoordinationError::VersionMismatch {
                    path: path.clone(),
                    expected: expected_version,
                    found: locked.version,
                });
            }

            let next = locked
                .apply(
                    EntryTransition::SetValue {
                        value: value.clone(),
                        session: self.session_id().clone(),
                    },
                    now_ms(),
                )
                .map_err(|e| CoordinationError::StorageUnavailable(e.to_string()))?;

            match self
                .entry_store
                .update(path, Some(locked.storage_version), Some(next))
                .map_err(store_err)?
            {
                CasOutcome::Committed(Some(new)) => {
                    self.lock_manager.release_write_lock(path, self.session_id())?;
                    self.cache.invalidate(path);
                    self.wait.notify_changed(path);
                    return Ok(new.version);
                }
                _ => {
                    self.lock_manager.release_write_lock(path, self.session_id())?;
                    continue;
                }
            }
        }
    }

    /// `delete(path, expected_version, recursive)`. Boxed because it
    /// recurses into itself for `recursive` deletes; `expected_version
    /// == 0` means "any", and only applies to `path` itself — recursed
    /// children are always deleted with "any" version.
    pub fn delete<'a>(
        &'a self,
        path: &'a Path,
        expected_version: u64,
        recursive: bool,
        cancel: &'a CooperativeCancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<u64, CoordinationError>> + Send + 'a>> {
        Box::pin(async move {
            self.check_alive()?;
            if path.is_root() {
                return Err(CoordinationError::MalformedPath("the root entry cannot be deleted".into()));
            }

            loop {
                if cancel.is_cancelled() {
                    return Err(CoordinationError::Cancelled);
                }

                let Some(entry) = self.entry_store.get(path).map_err(store_err)? else {
                    return Ok(0);
                };
                if expected_version != 0 && entry.version != expected_version {
                    return Err(CoordinationError::VersionMismatch {
                        path: path.clone(),
                        expected: expected_version,
                        found: entry.version,
                    });
                }
                if !entry.children.is_empty() {
                    if !recursive {
                        return Err(CoordinationError::EntryNotEmpty(path.clone()));
                    }
                    for child_name in entry.children.clone() {
                        let child_path = path.child(child_name);
                        self.delete(&child_path, 0, true, cancel).await?;
                    }
                    // Children deleted; reload and re-check from the top.
                    continue;
                }

                let parent_path = path.parent().expect("checked non-root above");
                let segment = path
                    .last_segment()
                    .expect("checked non-root above")
                    .to_string();

                let locked_entry = self
                    .lock_manager
                    .acquire_write_lock(path, self.session_id(), &self.liveness, cancel)
                    .await?;
                if !locked_entry.children.is_empty() {
                    // Raced with a concurrent child creation; retry
                    // the whole operation from the top.
                    self.lock_manager.release_write_lock(path, self.session_id())?;
                    continue;
                }

                self.lock_manager
                    .acquire_write_lock(&parent_path, self.session_id(), &self.liveness, cancel)
                    .await?;

                let outcome = self
                    .entry_store
                    .update(path, Some(locked_entry.storage_version), None)
                    .map_err(store_err)?;
                match outcome {
                    CasOutcome::Committed(_) => {
                        self.wait.notify_changed(path);
                        ops::detach_child(self.entry_store.as_ref(), &self.wait, &parent_path, &segment)
                            .map_err(store_err)?;
                        self.lock_manager.release_write_lock(&parent_path, self.session_id())?;
                        self.cache.invalidate(path);

                        if locked_entry.ephemeral {
                            self.remove_owned_entry(path)?;
                        }
                        return Ok(locked_entry.version);
                    }
                    CasOutcome::Conflict(_) => {
                        self.lock_manager.release_write_lock(&parent_path, self.session_id())?;
                        self.lock_manager.release_write_lock(path, self.session_id())?;
                        continue;
                    }
                }
            }
        })
    }
}

fn store_err(e: anyhow::Error) -> CoordinationError {
    CoordinationError::StorageUnavailable(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemEntryStore, MemSessionStore};

    async fn manager() -> CoordinationManager {
        let entry_store = Arc::new(MemEntryStore::new());
        let session_store = Arc::new(MemSessionStore::new());
        CoordinationManager::start(
            CoordinationSettings {
                logical_prefix: b"node-a".to_vec(),
                lease_length: Duration::from_secs(10),
                lease_grace: Duration::from_secs(2),
            },
            entry_store,
            session_store,
            b"addr-1".to_vec(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn create_then_get_roundtrips_and_parent_lists_child() {
        let mgr = manager().await;
        let cancel = CooperativeCancellationToken::new();
        let path = Path::from_segments(["a", "b"]);

        let created = mgr.create(&path, b"hello".to_vec(), CreateMode::Default, &cancel).await.unwrap();
        assert_eq!(created.value, b"hello");
        assert_eq!(created.version, 1);

        let parent = mgr.get(&Path::from_segments(["a"]), &cancel).await.unwrap().unwrap();
        assert!(parent.children.contains("b"));

        let fetched = mgr.get(&path, &cancel).await.unwrap().unwrap();
        assert_eq!(fetched.value, b"hello");
    }

    #[tokio::test]
    async fn create_twice_with_default_mode_fails_already_exists() {
        let mgr = manager().await;
        let cancel = CooperativeCancellationToken::new();
        let path = Path::from_segments(["x"]);
        mgr.create(&path, vec![], CreateMode::Default, &cancel).await.unwrap();
        let err = mgr.create(&path, vec![], CreateMode::Default, &cancel).await.unwrap_err();
        assert!(matches!(err, CoordinationError::EntryAlreadyExists(_)));
    }

    #[tokio::test]
    async fn get_or_create_returns_existing_entry_without_erroring() {
        let mgr = manager().await;
        let cancel = CooperativeCancellationToken::new();
        let path = Path::from_segments(["x"]);
        let first = mgr.create(&path, b"v1".to_vec(), CreateMode::Default, &cancel).await.unwrap();
        let second = mgr
            .get_or_create(&path, b"v2".to_vec(), CreateMode::Default, &cancel)
            .await
            .unwrap();
        assert_eq!(first.value, second.value);
    }

    #[tokio::test]
    async fn create_on_root_is_malformed_path() {
        let mgr = manager().await;
        let cancel = CooperativeCancellationToken::new();
        let err = mgr.create(&Path::root(), vec![], CreateMode::Default, &cancel).await.unwrap_err();
        assert!(matches!(err, CoordinationError::MalformedPath(_)));
    }

    #[tokio::test]
    async fn set_value_with_wrong_expected_version_conflicts() {
        let mgr = manager().await;
        let cancel = CooperativeCancellationToken::new();
        let path = Path::from_segments(["x"]);
        mgr.create(&path, vec![1], CreateMode::Default, &cancel).await.unwrap();
        let err = mgr.set_value(&path, vec![2], 99, &cancel).await.unwrap_err();
        assert!(matches!(err, CoordinationError::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn set_value_any_version_updates_and_bumps_version() {
        let mgr = manager().await;
        let cancel = CooperativeCancellationToken::new();
        let path = Path::from_segments(["x"]);
        mgr.create(&path, vec![1], CreateMode::Default, &cancel).await.unwrap();
        let new_version = mgr.set_value(&path, vec![2], 0, &cancel).await.unwrap();
        assert_eq!(new_version, 2);
        let fetched = mgr.get(&path, &cancel).await.unwrap().unwrap();
        assert_eq!(fetched.value, vec![2]);
    }

    #[tokio::test]
    async fn delete_absent_path_is_success_with_zero_version() {
        let mgr = manager().await;
        let cancel = CooperativeCancellationToken::new();
        let version = mgr.delete(&Path::from_segments(["missing"]), 0, false, &cancel).await.unwrap();
        assert_eq!(version, 0);
    }

    #[tokio::test]
    async fn delete_non_recursive_on_entry_with_children_fails() {
        let mgr = manager().await;
        let cancel = CooperativeCancellationToken::new();
        let parent = Path::from_segments(["a"]);
        let child = Path::from_segments(["a", "b"]);
        mgr.create(&child, vec![], CreateMode::Default, &cancel).await.unwrap();
        let err = mgr.delete(&parent, 0, false, &cancel).await.unwrap_err();
        assert!(matches!(err, CoordinationError::EntryNotEmpty(_)));
    }

    #[tokio::test]
    async fn recursive_delete_removes_whole_subtree() {
        let mgr = manager().await;
        let cancel = CooperativeCancellationToken::new();
        let parent = Path::from_segments(["a"]);
        let child = Path::from_segments(["a", "b"]);
        mgr.create(&child, vec![], CreateMode::Default, &cancel).await.unwrap();

        mgr.delete(&parent, 0, true, &cancel).await.unwrap();

        assert!(mgr.get(&parent, &cancel).await.unwrap().is_none());
        assert!(mgr.get(&child, &cancel).await.unwrap().is_none());
        let root = mgr.get(&Path::root(), &cancel).await.unwrap().unwrap();
        assert!(!root.children.contains("a"));
    }

    #[tokio::test]
    async fn ephemeral_create_registers_ownership_on_the_session() {
        let mgr = manager().await;
        let cancel = CooperativeCancellationToken::new();
        let path = Path::from_segments(["e"]);
        mgr.create(&path, vec![], CreateMode::Ephemeral, &cancel).await.unwrap();

        let session = mgr
            .session_manager
            .session_store()
            .get(&mgr.get_session())
            .unwrap()
            .unwrap();
        assert!(session.owned_entries.contains(&path));
    }
}
