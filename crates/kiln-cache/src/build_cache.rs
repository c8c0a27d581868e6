use crate::calculator::BuildFingerprint;
use crate::digest::Digest;
use crate::error::CacheError;
use crate::persist::{PendingChanges, RecordFile};
use crate::util::now_millis;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const BUILD_CACHE_SCHEMA_VERSION: u32 = 1;
const BUILD_CACHE_KIND: &str = "builds";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Success,
    Failure,
}

/// Outcome of the last completed build attempt for one build key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildCacheEntry {
    pub build_key: String,
    /// Combined fingerprint of the attempt.
    pub fingerprint: Digest,
    pub recorded_at: u64,
    pub last_status: BuildStatus,
    /// Component digests of the attempt, used to tell configuration changes
    /// apart from source changes.
    #[serde(default)]
    pub components: Vec<(String, Digest)>,
    /// Content digest of each input as this key last compiled it, keyed by
    /// [`BuildCacheEntry::input_key`]. An input missing here has no usable
    /// output for this key.
    #[serde(default)]
    pub inputs: BTreeMap<String, Digest>,
}

impl BuildCacheEntry {
    /// Key of a tracked tree file in [`BuildCacheEntry::inputs`].
    pub fn input_key(tree_label: &str, relative: &str) -> String {
        format!("{tree_label}/{relative}")
    }

    /// Whether `current` differs from what this key last compiled for `input`.
    /// An unreadable input always reads as changed.
    pub fn input_changed(&self, input: &str, current: Option<&Digest>) -> bool {
        match current {
            None => true,
            Some(current) => self.inputs.get(input) != Some(current),
        }
    }
}

/// Per-build-key fingerprints backed by `builds.json`.
#[derive(Debug)]
pub struct BuildCache {
    file: RecordFile<BuildCacheEntry>,
    entries: BTreeMap<String, BuildCacheEntry>,
    pending: PendingChanges<BuildCacheEntry>,
    disabled: bool,
}

impl BuildCache {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let file: RecordFile<BuildCacheEntry> =
            RecordFile::new(path, BUILD_CACHE_KIND, BUILD_CACHE_SCHEMA_VERSION);
        let entries = file
            .load()
            .into_iter()
            .filter(|(key, entry)| {
                let consistent = *key == entry.build_key;
                if !consistent {
                    tracing::debug!(
                        target: "kiln.cache",
                        key = %key,
                        "dropping build cache entry whose key does not match"
                    );
                }
                consistent
            })
            .collect();
        Self {
            file,
            entries,
            pending: PendingChanges::default(),
            disabled: false,
        }
    }

    /// When disabled, [`BuildCache::should_rebuild`] always answers `true`.
    /// Attempts are still recorded.
    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// `true` unless the last attempt for `build_key` succeeded with exactly this fingerprint.
    pub fn should_rebuild(&self, build_key: &str, fingerprint: &BuildFingerprint) -> bool {
        if self.disabled || fingerprint.incomplete {
            return true;
        }
        match self.entries.get(build_key) {
            None => true,
            Some(entry) => {
                entry.last_status == BuildStatus::Failure || entry.fingerprint != fingerprint.combined
            }
        }
    }

    pub fn entry(&self, build_key: &str) -> Option<&BuildCacheEntry> {
        self.entries.get(build_key)
    }

    /// Records a fully successful attempt. Call only after the whole run,
    /// including the link step, succeeded.
    pub fn record_success(&mut self, build_key: &str, fingerprint: &BuildFingerprint) {
        self.record_attempt(build_key, fingerprint, BuildStatus::Success, BTreeMap::new());
    }

    pub fn record_failure(&mut self, build_key: &str, fingerprint: &BuildFingerprint) {
        self.record_attempt(build_key, fingerprint, BuildStatus::Failure, BTreeMap::new());
    }

    /// Records an attempt together with the input digests its outputs were
    /// produced from. Inputs left out are recompiled by the next attempt.
    pub fn record_attempt(
        &mut self,
        build_key: &str,
        fingerprint: &BuildFingerprint,
        status: BuildStatus,
        inputs: BTreeMap<String, Digest>,
    ) {
        let entry = BuildCacheEntry {
            build_key: build_key.to_string(),
            fingerprint: fingerprint.combined.clone(),
            recorded_at: now_millis(),
            last_status: status,
            components: fingerprint.components.clone(),
            inputs,
        };
        tracing::debug!(
            target: "kiln.cache",
            build_key,
            status = ?status,
            fingerprint = %entry.fingerprint.short(),
            inputs = entry.inputs.len(),
            "recorded build attempt"
        );
        self.entries.insert(build_key.to_string(), entry.clone());
        self.pending.put(build_key.to_string(), entry);
    }

    /// Forces the next [`BuildCache::should_rebuild`] for `build_key` to return `true`.
    ///
    /// No-op when nothing was recorded for the key.
    pub fn invalidate(&mut self, build_key: &str) {
        if let Some(entry) = self.entries.get_mut(build_key) {
            entry.last_status = BuildStatus::Failure;
            entry.recorded_at = now_millis();
            self.pending.put(build_key.to_string(), entry.clone());
        }
    }

    /// Drops every entry (on disk at the next commit).
    pub fn reset(&mut self) {
        self.entries.clear();
        self.pending.clear_all();
    }

    pub fn commit(&mut self) -> Result<(), CacheError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.entries = self.file.commit(&self.pending)?;
        self.pending = PendingChanges::default();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
