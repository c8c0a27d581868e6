//! Versioned JSON record files with per-record decoding and merge-on-commit.
//!
//! Every cache file has the shape
//!
//! ```json
//! { "schema_version": 1, "kind": "files", "records": { "<key>": { ... } } }
//! ```
//!
//! Records are decoded one by one: a record that fails to decode is a miss for
//! that key only. A file that doesn't parse at all, or that carries a different
//! `schema_version` / `kind`, is treated as empty.

use crate::error::CacheError;
use crate::lock::CacheLock;
use crate::util::{atomic_write, read_file_limited};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize)]
struct RecordFileContents {
    schema_version: u32,
    kind: String,
    #[serde(default)]
    records: BTreeMap<String, serde_json::Value>,
}

/// A pending modification of a single record.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Change<T> {
    Put(T),
    Remove,
}

/// The set of modifications one process wants to apply on commit.
#[derive(Clone, Debug)]
pub(crate) struct PendingChanges<T> {
    clear_all: bool,
    changes: BTreeMap<String, Change<T>>,
}

impl<T> Default for PendingChanges<T> {
    fn default() -> Self {
        Self {
            clear_all: false,
            changes: BTreeMap::new(),
        }
    }
}

impl<T> PendingChanges<T> {
    pub(crate) fn put(&mut self, key: String, record: T) {
        self.changes.insert(key, Change::Put(record));
    }

    pub(crate) fn remove(&mut self, key: String) {
        self.changes.insert(key, Change::Remove);
    }

    /// Drops every record on disk before applying the remaining changes.
    pub(crate) fn clear_all(&mut self) {
        self.clear_all = true;
        self.changes.clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        !self.clear_all && self.changes.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.changes.len()
    }
}

/// Typed handle on one JSON record file.
#[derive(Debug, Clone)]
pub(crate) struct RecordFile<T> {
    path: PathBuf,
    kind: &'static str,
    schema_version: u32,
    _record: PhantomData<fn() -> T>,
}

impl<T> RecordFile<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    pub(crate) fn new(path: impl Into<PathBuf>, kind: &'static str, schema_version: u32) -> Self {
        Self {
            path: path.into(),
            kind,
            schema_version,
            _record: PhantomData,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Loads every decodable record. Never fails: problems degrade to misses.
    pub(crate) fn load(&self) -> BTreeMap<String, T> {
        let Some(bytes) = read_file_limited(&self.path) else {
            return BTreeMap::new();
        };

        let contents: RecordFileContents = match serde_json::from_slice(&bytes) {
            Ok(contents) => contents,
            Err(err) => {
                tracing::warn!(
                    target: "kiln.cache",
                    path = %self.path.display(),
                    error = %CacheError::from(err),
                    "cache file is unreadable; starting empty"
                );
                return BTreeMap::new();
            }
        };

        if contents.kind != self.kind || contents.schema_version != self.schema_version {
            let err = CacheError::IncompatibleSchemaVersion {
                path: self.path.clone(),
                expected: self.schema_version,
                found: contents.schema_version,
            };
            tracing::info!(
                target: "kiln.cache",
                kind = %contents.kind,
                error = %err,
                "ignoring cache file written with a different schema"
            );
            return BTreeMap::new();
        }

        let mut records = BTreeMap::new();
        let mut corrupt = 0usize;
        for (key, value) in contents.records {
            match serde_json::from_value::<T>(value) {
                Ok(record) => {
                    records.insert(key, record);
                }
                Err(err) => {
                    corrupt += 1;
                    tracing::debug!(
                        target: "kiln.cache",
                        path = %self.path.display(),
                        error = %CacheError::from(err),
                        "dropping corrupt cache record"
                    );
                }
            }
        }
        if corrupt > 0 {
            tracing::warn!(
                target: "kiln.cache",
                path = %self.path.display(),
                corrupt,
                "some cache records could not be decoded and will be rebuilt"
            );
        }
        records
    }

    /// Applies `pending` on top of the current on-disk records under the file
    /// lock and atomically replaces the file. Returns the merged records.
    pub(crate) fn commit(
        &self,
        pending: &PendingChanges<T>,
    ) -> Result<BTreeMap<String, T>, CacheError> {
        let _lock = CacheLock::for_file(&self.path)?;

        let mut records = if pending.clear_all {
            BTreeMap::new()
        } else {
            self.load()
        };
        for (key, change) in &pending.changes {
            match change {
                Change::Put(record) => {
                    records.insert(key.clone(), record.clone());
                }
                Change::Remove => {
                    records.remove(key);
                }
            }
        }

        self.write(&records)?;
        Ok(records)
    }

    fn write(&self, records: &BTreeMap<String, T>) -> Result<(), CacheError> {
        let mut encoded = BTreeMap::new();
        for (key, record) in records {
            encoded.insert(key.clone(), serde_json::to_value(record)?);
        }
        let contents = RecordFileContents {
            schema_version: self.schema_version,
            kind: self.kind.to_string(),
            records: encoded,
        };
        let bytes = serde_json::to_vec_pretty(&contents)?;
        atomic_write(&self.path, &bytes)
    }
}
