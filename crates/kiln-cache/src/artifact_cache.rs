use crate::digest::Digest;
use crate::error::CacheError;
use crate::gc::{plan_evictions, EvictedArtifact, GcFailure, GcPolicy, GcReport};
use crate::persist::{PendingChanges, RecordFile};
use crate::util::{atomic_copy, now_millis, prune_empty_dirs, remove_file_best_effort};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const ARTIFACT_CACHE_SCHEMA_VERSION: u32 = 1;
const ARTIFACT_CACHE_KIND: &str = "artifacts";

/// One stored link/archive output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactCacheEntry {
    pub target_id: String,
    pub fingerprint: Digest,
    /// Location of the managed copy under the cache's storage directory.
    pub artifact_path: PathBuf,
    pub created_at: u64,
    pub last_used_at: u64,
    pub size_bytes: u64,
}

impl ArtifactCacheEntry {
    pub fn key(&self) -> String {
        artifact_key(&self.target_id, &self.fingerprint)
    }
}

pub fn artifact_key(target_id: &str, fingerprint: &Digest) -> String {
    format!("{target_id}@{fingerprint}")
}

/// Link outputs keyed by `(target_id, fingerprint)`, backed by `artifacts.json`
/// and a storage directory the cache owns.
///
/// Artifacts are copied into storage on [`ArtifactCache::store`], so later
/// builds overwriting the output path don't invalidate cached copies.
#[derive(Debug)]
pub struct ArtifactCache {
    storage_root: PathBuf,
    file: RecordFile<ArtifactCacheEntry>,
    entries: BTreeMap<String, ArtifactCacheEntry>,
    pending: PendingChanges<ArtifactCacheEntry>,
    disabled: bool,
}

impl ArtifactCache {
    pub fn open(index_path: impl Into<PathBuf>, storage_root: impl Into<PathBuf>) -> Self {
        let storage_root = storage_root.into();
        let file: RecordFile<ArtifactCacheEntry> =
            RecordFile::new(index_path, ARTIFACT_CACHE_KIND, ARTIFACT_CACHE_SCHEMA_VERSION);
        let entries = file
            .load()
            .into_iter()
            .filter(|(key, entry)| {
                let valid = *key == entry.key() && entry.artifact_path.starts_with(&storage_root);
                if !valid {
                    tracing::debug!(
                        target: "kiln.cache",
                        key = %key,
                        "dropping artifact entry with inconsistent key or path"
                    );
                }
                valid
            })
            .collect();
        Self {
            storage_root,
            file,
            entries,
            pending: PendingChanges::default(),
            disabled: false,
        }
    }

    /// When disabled, every lookup misses. Stores still happen.
    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// Path of the cached artifact for `(target_id, fingerprint)`, refreshing its
    /// `last_used_at`. An entry whose file vanished is dropped and reported as a miss.
    pub fn lookup(&mut self, target_id: &str, fingerprint: &Digest) -> Option<PathBuf> {
        if self.disabled {
            return None;
        }
        let key = artifact_key(target_id, fingerprint);
        let artifact_path = self.entries.get(&key)?.artifact_path.clone();

        let present = std::fs::symlink_metadata(&artifact_path)
            .map(|meta| meta.is_file())
            .unwrap_or(false);
        if !present {
            tracing::debug!(
                target: "kiln.cache",
                target_id,
                path = %artifact_path.display(),
                "cached artifact is missing; dropping entry"
            );
            self.entries.remove(&key);
            self.pending.remove(key);
            return None;
        }

        let entry = self.entries.get_mut(&key)?;
        entry.last_used_at = now_millis().max(entry.last_used_at);
        let updated = entry.clone();
        self.pending.put(key, updated);
        Some(artifact_path)
    }

    /// Looks up the artifact and copies it to `dest` on a hit.
    pub fn materialize(
        &mut self,
        target_id: &str,
        fingerprint: &Digest,
        dest: &Path,
    ) -> Result<Option<PathBuf>, CacheError> {
        let Some(cached) = self.lookup(target_id, fingerprint) else {
            return Ok(None);
        };
        atomic_copy(&cached, dest)?;
        Ok(Some(dest.to_path_buf()))
    }

    /// Copies `artifact_path` into storage and records it. Storing the same
    /// `(target_id, fingerprint)` again replaces the previous copy.
    pub fn store(
        &mut self,
        target_id: &str,
        fingerprint: &Digest,
        artifact_path: &Path,
    ) -> Result<PathBuf, CacheError> {
        let missing = || CacheError::MissingArtifact {
            path: artifact_path.to_path_buf(),
        };
        match std::fs::metadata(artifact_path) {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(missing()),
        }
        let file_name = artifact_path.file_name().ok_or_else(missing)?;

        let dest = self
            .storage_root
            .join(target_slug(target_id))
            .join(fingerprint.as_str())
            .join(file_name);
        let size_bytes = atomic_copy(artifact_path, &dest)?;

        let key = artifact_key(target_id, fingerprint);
        if let Some(previous) = self.entries.get(&key) {
            if previous.artifact_path != dest {
                self.remove_stored_file(&previous.artifact_path);
            }
        }

        let now = now_millis();
        let entry = ArtifactCacheEntry {
            target_id: target_id.to_string(),
            fingerprint: fingerprint.clone(),
            artifact_path: dest.clone(),
            created_at: now,
            last_used_at: now,
            size_bytes,
        };
        tracing::info!(
            target: "kiln.cache",
            target_id,
            fingerprint = %fingerprint.short(),
            size_bytes,
            "stored artifact"
        );
        self.entries.insert(key.clone(), entry.clone());
        self.pending.put(key, entry);
        Ok(dest)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ArtifactCacheEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|entry| entry.size_bytes).sum()
    }

    /// Evicts artifacts according to `policy`. Deletion failures are logged,
    /// reported and leave the entry in place.
    pub fn collect_garbage(&mut self, policy: &GcPolicy) -> GcReport {
        let entries: Vec<ArtifactCacheEntry> = self.entries.values().cloned().collect();
        let before_bytes = self.total_bytes();
        let plan = plan_evictions(&entries, policy, now_millis());

        let mut report = GcReport {
            before_bytes,
            after_bytes: before_bytes,
            ..GcReport::default()
        };
        for planned in plan {
            let entry = &entries[planned.index];
            match self.delete_artifact(entry) {
                Ok(()) => {
                    let key = entry.key();
                    self.entries.remove(&key);
                    self.pending.remove(key);
                    report.after_bytes = report.after_bytes.saturating_sub(entry.size_bytes);
                    report.evicted.push(EvictedArtifact {
                        target_id: entry.target_id.clone(),
                        fingerprint: entry.fingerprint.clone(),
                        artifact_path: entry.artifact_path.clone(),
                        size_bytes: entry.size_bytes,
                        reason: planned.reason,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        target: "kiln.cache",
                        target_id = %entry.target_id,
                        path = %entry.artifact_path.display(),
                        error = %err,
                        "failed to evict artifact; skipping"
                    );
                    report.failed.push(GcFailure {
                        target_id: entry.target_id.clone(),
                        fingerprint: entry.fingerprint.clone(),
                        artifact_path: entry.artifact_path.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            target: "kiln.cache",
            evicted = report.evicted.len(),
            failed = report.failed.len(),
            freed_bytes = report.freed_bytes(),
            "artifact garbage collection finished"
        );
        report
    }

    /// Drops every entry and deletes the storage directory.
    pub fn reset(&mut self) -> Result<(), CacheError> {
        self.entries.clear();
        self.pending.clear_all();
        match std::fs::remove_dir_all(&self.storage_root) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn commit(&mut self) -> Result<(), CacheError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.entries = self
            .file
            .commit(&self.pending)?
            .into_iter()
            .filter(|(_, entry)| entry.artifact_path.starts_with(&self.storage_root))
            .collect();
        self.pending = PendingChanges::default();
        Ok(())
    }

    fn delete_artifact(&self, entry: &ArtifactCacheEntry) -> Result<(), CacheError> {
        let path = &entry.artifact_path;
        if !path.starts_with(&self.storage_root) {
            return Err(CacheError::PathNotUnderCacheRoot {
                path: path.clone(),
                cache_root: self.storage_root.clone(),
            });
        }
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        if let Some(parent) = path.parent() {
            prune_empty_dirs(parent, &self.storage_root);
        }
        Ok(())
    }

    fn remove_stored_file(&self, path: &Path) {
        if path.starts_with(&self.storage_root)
            && remove_file_best_effort(path, "artifact_cache.superseded")
        {
            if let Some(parent) = path.parent() {
                prune_empty_dirs(parent, &self.storage_root);
            }
        }
    }
}

/// Directory name for `target_id`: safe characters kept, anything else
/// replaced, with a digest suffix when the name had to change.
fn target_slug(target_id: &str) -> String {
    let sanitized: String = target_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized == target_id && !sanitized.starts_with('.') && !sanitized.is_empty() {
        sanitized
    } else {
        format!("{sanitized}-{}", Digest::from_bytes(target_id).short())
    }
}
