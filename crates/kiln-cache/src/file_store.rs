use crate::digest::Digest;
use crate::error::CacheError;
use crate::persist::{PendingChanges, RecordFile};
use crate::util::modified_nanos;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub const FILE_STORE_SCHEMA_VERSION: u32 = 1;
const FILE_STORE_KIND: &str = "files";

/// Last observed state of one tracked file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: PathBuf,
    /// Modification time in nanoseconds since the Unix epoch.
    pub last_modified: u64,
    pub content_hash: Digest,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Observation {
    Present(FileRecord),
    Unreadable,
}

/// Counters describing how a store answered queries since it was opened.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FileStoreStats {
    /// Files answered from the stored record because the timestamp matched.
    pub fast_path_hits: u64,
    /// Files whose contents were read and hashed.
    pub content_hashes: u64,
    /// Files that could not be stat'ed or read.
    pub unreadable: u64,
}

/// Per-file change detection backed by `files.json`.
///
/// A file is hashed only when its modification time differs from the stored
/// one (or when the store was opened with `force_rehash`). Answers are
/// memoized for the lifetime of a run so every caller sees the same state of a
/// file, and all queries take `&self` so workers can share the store. Nothing
/// is persisted until [`FileFingerprintStore::commit`].
#[derive(Debug)]
pub struct FileFingerprintStore {
    file: RecordFile<FileRecord>,
    force_rehash: bool,
    baseline: RwLock<BTreeMap<PathBuf, FileRecord>>,
    observed: RwLock<HashMap<PathBuf, Observation>>,
    removals: Mutex<BTreeSet<PathBuf>>,
    reset_requested: AtomicBool,
    fast_path_hits: AtomicU64,
    content_hashes: AtomicU64,
    unreadable: AtomicU64,
}

impl FileFingerprintStore {
    /// Opens the store persisted at `path`. A missing or corrupt file yields an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let file: RecordFile<FileRecord> =
            RecordFile::new(path, FILE_STORE_KIND, FILE_STORE_SCHEMA_VERSION);
        let baseline = records_by_path(file.load());
        tracing::debug!(
            target: "kiln.cache",
            path = %file.path().display(),
            records = baseline.len(),
            "loaded file fingerprint store"
        );
        Self {
            file,
            force_rehash: false,
            baseline: RwLock::new(baseline),
            observed: RwLock::new(HashMap::new()),
            removals: Mutex::new(BTreeSet::new()),
            reset_requested: AtomicBool::new(false),
            fast_path_hits: AtomicU64::new(0),
            content_hashes: AtomicU64::new(0),
            unreadable: AtomicU64::new(0),
        }
    }

    /// Ignore stored timestamps and hash every file that is queried.
    pub fn with_force_rehash(mut self, force_rehash: bool) -> Self {
        self.force_rehash = force_rehash;
        self
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Whether `path` differs from its last committed state.
    ///
    /// A file without a record, or one that can't be read, counts as changed.
    pub fn has_changed(&self, path: &Path) -> bool {
        match self.observe(path) {
            Observation::Unreadable => true,
            Observation::Present(current) => self
                .baseline
                .read()
                .get(path)
                .map_or(true, |stored| stored.content_hash != current.content_hash),
        }
    }

    /// Current content digest of `path`, or `None` when it can't be read.
    pub fn hash_of(&self, path: &Path) -> Option<Digest> {
        match self.observe(path) {
            Observation::Present(record) => Some(record.content_hash),
            Observation::Unreadable => None,
        }
    }

    /// The committed record for `path`, if any.
    pub fn record(&self, path: &Path) -> Option<FileRecord> {
        self.baseline.read().get(path).cloned()
    }

    /// Drops the record for `path`, so it reads as changed until it is
    /// observed and committed again.
    pub fn forget(&self, path: &Path) {
        self.baseline.write().remove(path);
        self.observed.write().remove(path);
        self.removals.lock().insert(path.to_path_buf());
    }

    /// Drops every record, both in memory and (on the next commit) on disk.
    pub fn reset(&self) {
        self.baseline.write().clear();
        self.observed.write().clear();
        self.removals.lock().clear();
        self.reset_requested.store(true, Ordering::SeqCst);
    }

    /// Persists every observation made since the last commit.
    pub fn commit(&self) -> Result<(), CacheError> {
        let mut pending = PendingChanges::default();
        if self.reset_requested.load(Ordering::SeqCst) {
            pending.clear_all();
        }
        {
            let baseline = self.baseline.read();
            let observed = self.observed.read();
            for (path, observation) in observed.iter() {
                match observation {
                    Observation::Present(record) => {
                        if baseline.get(path) != Some(record) {
                            pending.put(path_key(path), record.clone());
                        }
                    }
                    Observation::Unreadable => pending.remove(path_key(path)),
                }
            }
            for path in self.removals.lock().iter() {
                pending.remove(path_key(path));
            }
        }

        if pending.is_empty() {
            self.observed.write().clear();
            return Ok(());
        }

        let changes = pending.len();
        let merged = self.file.commit(&pending)?;
        *self.baseline.write() = records_by_path(merged);
        self.observed.write().clear();
        self.removals.lock().clear();
        self.reset_requested.store(false, Ordering::SeqCst);

        tracing::debug!(
            target: "kiln.cache",
            path = %self.file.path().display(),
            changes,
            "committed file fingerprint store"
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.baseline.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> FileStoreStats {
        FileStoreStats {
            fast_path_hits: self.fast_path_hits.load(Ordering::Relaxed),
            content_hashes: self.content_hashes.load(Ordering::Relaxed),
            unreadable: self.unreadable.load(Ordering::Relaxed),
        }
    }

    fn observe(&self, path: &Path) -> Observation {
        if let Some(observation) = self.observed.read().get(path) {
            return observation.clone();
        }
        let observation = self.observe_uncached(path);
        // Two workers may race on the same path; the first answer wins so the
        // whole run sees one state per file.
        self.observed
            .write()
            .entry(path.to_path_buf())
            .or_insert(observation)
            .clone()
    }

    fn observe_uncached(&self, path: &Path) -> Observation {
        let meta = match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => {
                self.unreadable.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    target: "kiln.cache",
                    path = %path.display(),
                    "tracked path is not a regular file; treating as changed"
                );
                return Observation::Unreadable;
            }
            Err(err) => {
                self.unreadable.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    target: "kiln.cache",
                    path = %path.display(),
                    error = %err,
                    "failed to stat tracked file; treating as changed"
                );
                return Observation::Unreadable;
            }
        };

        let last_modified = modified_nanos(path, &meta);
        if !self.force_rehash {
            if let Some(last_modified) = last_modified {
                if let Some(stored) = self.baseline.read().get(path) {
                    if stored.last_modified == last_modified {
                        self.fast_path_hits.fetch_add(1, Ordering::Relaxed);
                        return Observation::Present(stored.clone());
                    }
                }
            }
        }

        match Digest::from_file(path) {
            Ok(content_hash) => {
                self.content_hashes.fetch_add(1, Ordering::Relaxed);
                Observation::Present(FileRecord {
                    path: path.to_path_buf(),
                    last_modified: last_modified.unwrap_or(0),
                    content_hash,
                })
            }
            Err(err) => {
                self.unreadable.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    target: "kiln.cache",
                    path = %path.display(),
                    error = %err,
                    "failed to hash tracked file; treating as changed"
                );
                Observation::Unreadable
            }
        }
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn records_by_path(records: BTreeMap<String, FileRecord>) -> BTreeMap<PathBuf, FileRecord> {
    records
        .into_iter()
        .filter_map(|(key, record)| {
            if path_key(&record.path) == key {
                Some((record.path.clone(), record))
            } else {
                tracing::debug!(
                    target: "kiln.cache",
                    key = %key,
                    "dropping file record whose path does not match its key"
                );
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use std::fs;

    fn set_mtime(path: &Path, secs: i64) {
        filetime::set_file_mtime(path, FileTime::from_unix_time(secs, 0)).unwrap();
    }

    #[test]
    fn first_observation_is_changed_and_commit_makes_it_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("a.cpp");
        fs::write(&src, b"int a;\n").unwrap();
        let store_path = tmp.path().join("files.json");

        let store = FileFingerprintStore::open(&store_path);
        assert!(store.has_changed(&src));
        assert_eq!(store.hash_of(&src), Some(Digest::from_bytes(b"int a;\n")));
        store.commit().unwrap();

        let reopened = FileFingerprintStore::open(&store_path);
        assert!(!reopened.has_changed(&src));
        assert_eq!(reopened.stats().fast_path_hits, 1);
        assert_eq!(reopened.stats().content_hashes, 0);
    }

    #[test]
    fn touch_without_edit_is_unchanged_and_refreshes_timestamp() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("b.cpp");
        fs::write(&src, b"int b;\n").unwrap();
        set_mtime(&src, 1_600_000_000);
        let store_path = tmp.path().join("files.json");

        let store = FileFingerprintStore::open(&store_path);
        assert!(store.has_changed(&src));
        store.commit().unwrap();

        set_mtime(&src, 1_700_000_000);
        let store = FileFingerprintStore::open(&store_path);
        assert!(!store.has_changed(&src));
        assert_eq!(store.stats().content_hashes, 1);
        store.commit().unwrap();
        assert_eq!(
            store.record(&src).unwrap().last_modified,
            1_700_000_000 * 1_000_000_000
        );

        let store = FileFingerprintStore::open(&store_path);
        assert!(!store.has_changed(&src));
        assert_eq!(store.stats().content_hashes, 0);
        assert_eq!(store.stats().fast_path_hits, 1);
    }

    #[test]
    fn appended_byte_is_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("c.cpp");
        fs::write(&src, b"int c;\n").unwrap();
        set_mtime(&src, 1_600_000_000);
        let store_path = tmp.path().join("files.json");

        let store = FileFingerprintStore::open(&store_path);
        store.has_changed(&src);
        store.commit().unwrap();

        fs::write(&src, b"int c;\n\n").unwrap();
        set_mtime(&src, 1_600_000_001);
        let store = FileFingerprintStore::open(&store_path);
        assert!(store.has_changed(&src));
    }

    #[test]
    fn answers_are_stable_within_a_run() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("d.cpp");
        fs::write(&src, b"one").unwrap();

        let store = FileFingerprintStore::open(tmp.path().join("files.json"));
        let first = store.hash_of(&src);
        fs::write(&src, b"two").unwrap();
        assert_eq!(store.hash_of(&src), first);
        assert_eq!(store.stats().content_hashes, 1);
    }

    #[test]
    fn unreadable_file_counts_as_changed_and_drops_its_record() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("gone.h");
        fs::write(&src, b"#pragma once\n").unwrap();
        let store_path = tmp.path().join("files.json");

        let store = FileFingerprintStore::open(&store_path);
        store.has_changed(&src);
        store.commit().unwrap();
        assert_eq!(store.len(), 1);

        fs::remove_file(&src).unwrap();
        let store = FileFingerprintStore::open(&store_path);
        assert!(store.has_changed(&src));
        assert_eq!(store.hash_of(&src), None);
        assert_eq!(store.stats().unreadable, 1);
        store.commit().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn forget_forces_the_next_run_to_see_a_change() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("e.cpp");
        fs::write(&src, b"int e;\n").unwrap();
        let store_path = tmp.path().join("files.json");

        let store = FileFingerprintStore::open(&store_path);
        store.has_changed(&src);
        store.commit().unwrap();

        let store = FileFingerprintStore::open(&store_path);
        assert!(!store.has_changed(&src));
        store.forget(&src);
        store.commit().unwrap();

        let store = FileFingerprintStore::open(&store_path);
        assert!(store.has_changed(&src));
    }

    #[test]
    fn reset_clears_records_on_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("f.cpp");
        fs::write(&src, b"int f;\n").unwrap();
        let store_path = tmp.path().join("files.json");

        let store = FileFingerprintStore::open(&store_path);
        store.has_changed(&src);
        store.commit().unwrap();

        store.reset();
        store.commit().unwrap();
        assert!(FileFingerprintStore::open(&store_path).is_empty());
    }

    #[test]
    fn force_rehash_skips_the_fast_path() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("g.cpp");
        fs::write(&src, b"int g;\n").unwrap();
        let store_path = tmp.path().join("files.json");

        let store = FileFingerprintStore::open(&store_path);
        store.has_changed(&src);
        store.commit().unwrap();

        let store = FileFingerprintStore::open(&store_path).with_force_rehash(true);
        assert!(!store.has_changed(&src));
        assert_eq!(store.stats().fast_path_hits, 0);
        assert_eq!(store.stats().content_hashes, 1);
    }
}
