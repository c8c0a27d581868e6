use crate::error::CacheError;
use fs2::FileExt as _;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

/// Advisory lock guarding the read-modify-write cycle of one cache file.
///
/// Held across "re-read from disk, merge, atomically replace" so that two
/// `kiln` processes committing at the same time serialize instead of losing
/// each other's records. Released on drop.
#[derive(Debug)]
pub struct CacheLock {
    file: File,
    path: PathBuf,
    // `fs2` locks are per-process on Unix and don't exclude sibling threads, so
    // an in-process mutex covers that case.
    _guard: MutexGuard<'static, ()>,
}

impl CacheLock {
    /// Lock the `<name>.lock` sibling of the cache file at `guarded`.
    pub fn for_file(guarded: &Path) -> Result<Self, CacheError> {
        Self::lock_exclusive(&lock_path_for(guarded))
    }

    /// Acquire an exclusive lock on `path`, creating the lockfile if needed.
    ///
    /// Blocks until the lock is available.
    pub fn lock_exclusive(path: &Path) -> Result<Self, CacheError> {
        let guard = process_lock_for_path(path)
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        if file.try_lock_exclusive().is_err() {
            tracing::debug!(
                target: "kiln.cache",
                path = %path.display(),
                "cache file is locked by another process; waiting"
            );
            file.lock_exclusive()?;
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            _guard: guard,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

pub(crate) fn lock_path_for(guarded: &Path) -> PathBuf {
    let mut name = guarded
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| OsString::from("cache"));
    name.push(".lock");
    guarded.with_file_name(name)
}

fn process_lock_for_path(path: &Path) -> &'static Mutex<()> {
    static PROCESS_LOCKS: OnceLock<Mutex<HashMap<PathBuf, &'static Mutex<()>>>> = OnceLock::new();
    let locks = PROCESS_LOCKS.get_or_init(|| Mutex::new(HashMap::new()));

    let mut map = locks
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *map.entry(path.to_path_buf())
        .or_insert_with(|| Box::leak(Box::new(Mutex::new(()))))
}
