//! Persistent, concurrency-safe caches behind Kiln's incremental builds.
//!
//! - [`FileFingerprintStore`]: per-file timestamp + content hash, answering "did this file change?"
//! - [`BuildFingerprintCalculator`]: folds trees and configuration into a [`BuildFingerprint`]
//! - [`BuildCache`]: last attempt (fingerprint + status) per build key
//! - [`ArtifactCache`]: stored link outputs keyed by target and fingerprint, with GC
//!
//! ## On-disk format
//!
//! Each cache is one JSON file under a [`CacheDir`] with a `schema_version`
//! header and a map of records. Records decode independently, so one corrupt
//! record is a miss for its key only. Writers merge their changes into the
//! current file under a [`CacheLock`] and replace it atomically, so concurrent
//! `kiln` processes never observe a partial file.

mod artifact_cache;
mod build_cache;
mod cache_dir;
mod calculator;
mod digest;
mod error;
mod file_store;
mod gc;
mod lock;
mod persist;
mod util;

pub use artifact_cache::{
    artifact_key, ArtifactCache, ArtifactCacheEntry, ARTIFACT_CACHE_SCHEMA_VERSION,
};
pub use build_cache::{BuildCache, BuildCacheEntry, BuildStatus, BUILD_CACHE_SCHEMA_VERSION};
pub use cache_dir::{
    CacheConfig, CacheDir, ARTIFACTS_DIRNAME, ARTIFACTS_FILENAME, BUILDS_FILENAME, FILES_FILENAME,
};
pub use calculator::{
    BuildFingerprint, BuildFingerprintCalculator, FileFilter, FileSetDigest, SourceTree,
    TrackedFile, TreeSnapshot, TREE_COMPONENT_PREFIX,
};
pub use digest::{Digest, DigestBuilder};
pub use error::{CacheError, Result};
pub use file_store::{FileFingerprintStore, FileRecord, FileStoreStats, FILE_STORE_SCHEMA_VERSION};
pub use gc::{
    plan_evictions, EvictedArtifact, EvictionReason, GcFailure, GcPolicy, GcReport,
    PlannedEviction,
};
pub use lock::CacheLock;
pub use util::{atomic_write, now_millis, CACHE_FILE_LIMIT_BYTES};
