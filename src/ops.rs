//! Shared entry-tree operations used by both the coordinator's
//! recursive delete and the session manager's ephemeral cascade
//! (spec §4.7 Delete, §4.10.d). The cascade variant skips lock
//! checks entirely — by the time it runs, the owning session is
//! already dead, so no lock it held is legitimate anyway.

use crate::entry::StoredEntry;
use crate::path::Path;
use crate::store::{CasOutcome, EntryStore};
use crate::wait_manager::WaitManager;

/// Depth-first forced delete: removes `path` and everything under
/// it, then detaches `path`'s segment from its parent's `children`.
/// No lock is acquired or checked. Idempotent — a path already
/// absent is a no-op at every level.
pub fn force_delete_recursive(
    store: &dyn EntryStore,
    wait: &WaitManager,
    path: &Path,
) -> anyhow::Result<()> {
    let Some(entry) = store.get(path)? else {
        return Ok(());
    };

    for child_name in entry.children.clone() {
        let child_path = path.child(child_name);
        force_delete_recursive(store, wait, &child_path)?;
    }

    let mut current = store.get(path)?;
    while let Some(entry) = current {
        match store.update(path, Some(entry.storage_version), None)? {
            CasOutcome::Committed(_) => break,
            CasOutcome::Conflict(fresh) => current = fresh,
        }
    }
    wait.notify_changed(path);

    if let (Some(parent_path), Some(segment)) = (path.parent(), path.last_segment()) {
        detach_child(store, wait, &parent_path, segment)?;
    }
    Ok(())
}

/// Removes `segment` from `parent_path`'s `children` set without
/// requiring the write lock (used both by the forced cascade above
/// and by lazy repair of a dangling child name, spec §4.7 step 4-7
/// crash recovery).
pub fn detach_child(
    store: &dyn EntryStore,
    wait: &WaitManager,
    parent_path: &Path,
    segment: &str,
) -> anyhow::Result<()> {
    let mut current = store.get(parent_path)?;
    while let Some(parent) = current {
        if !parent.children.contains(segment) {
            break;
        }
        let next = parent.force_remove_child(segment);
        match store.update(parent_path, Some(parent.storage_version), Some(next))? {
            CasOutcome::Committed(_) => break,
            CasOutcome::Conflict(fresh) => current = fresh,
        }
    }
    wait.notify_changed(parent_path);
    Ok(())
}

/// Adds `segment` to `parent_path`'s `children` set if a backing
/// entry exists at `parent_path + segment` but the parent's own
/// record doesn't yet list it (the symmetric lazy-repair case).
pub fn attach_child(
    store: &dyn EntryStore,
    wait: &WaitManager,
    parent_path: &Path,
    segment: &str,
) -> anyhow::Result<()> {
    let mut current = store.get(parent_path)?;
    while let Some(parent) = current {
        if parent.children.contains(segment) {
            break;
        }
        let next = parent.force_add_child(segment.to_string());
        match store.update(parent_path, Some(parent.storage_version), Some(next))? {
            CasOutcome::Committed(_) => break,
            CasOutcome::Conflict(fresh) => current = fresh,
        }
    }
    wait.notify_changed(parent_path);
    Ok(())
}

/// Repairs one level of parent/child inconsistency observed while
/// reading `path`: a child entry exists without a matching name in
/// the parent's `children`, or vice versa (I2, lazily converging).
pub fn repair_parent_child(
    store: &dyn EntryStore,
    wait: &WaitManager,
    parent_path: &Path,
    segment: &str,
    child_entry: Option<&StoredEntry>,
) -> anyhow::Result<()> {
    match child_entry {
        Some(_) => attach_child(store, wait, parent_path, segment),
        None => detach_child(store, wait, parent_path, segment),
    }
}
