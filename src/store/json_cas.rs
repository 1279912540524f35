//! Shared plumbing behind the file-backed and in-memory CAS stores:
//! the actual compare-and-swap decision, and (for the file backend) a
//! lock-read-modify-write-publish cycle that publishes via atomic
//! rename rather than in-place truncate.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::Context;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{CasOutcome, Versioned};

/// Applies one CAS decision against a map already loaded into memory,
/// returning the outcome and the (possibly unchanged) map.
pub(super) fn cas_apply<T: Versioned + Clone>(
    map: &mut BTreeMap<String, T>,
    key: &str,
    expected: Option<u64>,
    new: Option<T>,
) -> CasOutcome<T> {
    let current = map.get(key).cloned();
    let matches = match (&current, expected) {
        (None, None) => true,
        (Some(rec), Some(v)) => rec.storage_version() == v,
        _ => false,
    };
    if !matches {
        return CasOutcome::Conflict(current);
    }
    match new {
        Some(rec) => {
            map.insert(key.to_string(), rec.clone());
            CasOutcome::Committed(Some(rec))
        }
        None => {
            map.remove(key);
            CasOutcome::Committed(None)
        }
    }
}

/// Single JSON file holding a `BTreeMap<String, T>`, guarded by an
/// exclusive lock on a sibling `.lock` file and published via
/// write-to-temp-then-rename so a crash mid-write never leaves a
/// truncated store behind.
pub(super) struct JsonFileStore<T> {
    path: PathBuf,
    lock_path: PathBuf,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned + Clone> JsonFileStore<T> {
    pub(super) fn new(path: PathBuf) -> Self {
        let lock_path = {
            let mut p = path.clone();
            let name = format!(
                "{}.lock",
                p.file_name().and_then(|n| n.to_str()).unwrap_or("store")
            );
            p.set_file_name(name);
            p
        };
        Self {
            path,
            lock_path,
            _marker: std::marker::PhantomData,
        }
    }

    pub(super) fn with_store<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, T>) -> R,
    ) -> anyhow::Result<R> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store dir: {}", parent.display()))?;
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.lock_path)
            .with_context(|| format!("failed to open lock file: {}", self.lock_path.display()))?;
        lock_file
            .lock_exclusive()
            .with_context(|| format!("failed to lock: {}", self.lock_path.display()))?;

        let mut map: BTreeMap<String, T> = if self.path.exists() {
            let mut raw = String::new();
            OpenOptions::new()
                .read(true)
                .open(&self.path)
                .with_context(|| format!("failed to open store: {}", self.path.display()))?
                .read_to_string(&mut raw)
                .context("failed to read store")?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw).context("failed to parse store JSON")?
            }
        } else {
            BTreeMap::new()
        };

        let out = f(&mut map);

        let bytes = serde_json::to_vec_pretty(&map).context("failed to serialize store")?;
        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)
                .with_context(|| format!("failed to open temp store: {}", tmp_path.display()))?;
            tmp.write_all(&bytes)
                .context("failed to write temp store")?;
            tmp.flush().ok();
        }
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to publish store: {}", self.path.display()))?;

        lock_file.unlock().ok();
        Ok(out)
    }
}
