use crate::artifact_cache::ArtifactCache;
use crate::build_cache::BuildCache;
use crate::digest::Digest;
use crate::error::CacheError;
use crate::file_store::FileFingerprintStore;
use std::path::{Path, PathBuf};

pub const FILES_FILENAME: &str = "files.json";
pub const BUILDS_FILENAME: &str = "builds.json";
pub const ARTIFACTS_FILENAME: &str = "artifacts.json";
pub const ARTIFACTS_DIRNAME: &str = "artifacts";

/// Configuration for selecting the on-disk cache root.
#[derive(Clone, Debug, Default)]
pub struct CacheConfig {
    /// Override the global cache directory (the project hash is still appended).
    pub cache_root_override: Option<PathBuf>,
}

impl CacheConfig {
    pub fn from_env() -> Self {
        Self {
            cache_root_override: std::env::var_os("KILN_CACHE_DIR")
                .filter(|value| !value.is_empty())
                .map(PathBuf::from),
        }
    }
}

/// The directory holding one project's caches.
///
/// ```text
/// <root>/files.json           file fingerprints
/// <root>/builds.json          per-build-key fingerprints
/// <root>/artifacts.json       artifact index
/// <root>/artifacts/<target>/<fingerprint>/<file>
/// <root>/*.json.lock          advisory commit locks
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheDir {
    root: PathBuf,
}

impl CacheDir {
    /// Uses `root` as-is, creating it if needed.
    pub fn at(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// `<cache root>/<hash of the canonical project root>`, where the cache root
    /// is `KILN_CACHE_DIR` (via `config`) or `~/.kiln/cache`.
    pub fn for_project(
        project_root: impl AsRef<Path>,
        config: &CacheConfig,
    ) -> Result<Self, CacheError> {
        let project_root = std::fs::canonicalize(project_root)?;
        let project_hash = Digest::from_bytes(project_root.to_string_lossy().as_bytes());
        let base = match &config.cache_root_override {
            Some(root) => root.clone(),
            None => default_cache_root()?,
        };
        Self::at(base.join(project_hash.as_str()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files_path(&self) -> PathBuf {
        self.root.join(FILES_FILENAME)
    }

    pub fn builds_path(&self) -> PathBuf {
        self.root.join(BUILDS_FILENAME)
    }

    pub fn artifacts_index_path(&self) -> PathBuf {
        self.root.join(ARTIFACTS_FILENAME)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join(ARTIFACTS_DIRNAME)
    }

    pub fn open_file_store(&self) -> FileFingerprintStore {
        FileFingerprintStore::open(self.files_path())
    }

    pub fn open_build_cache(&self) -> BuildCache {
        BuildCache::open(self.builds_path())
    }

    pub fn open_artifact_cache(&self) -> ArtifactCache {
        ArtifactCache::open(self.artifacts_index_path(), self.artifacts_dir())
    }
}

pub(crate) fn default_cache_root() -> Result<PathBuf, CacheError> {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .ok_or(CacheError::MissingHomeDir)?;

    Ok(home.join(".kiln").join("cache"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_dirs_are_keyed_by_canonical_root() {
        let tmp = tempfile::tempdir().unwrap();
        let project = tmp.path().join("project");
        std::fs::create_dir_all(project.join("src")).unwrap();
        let config = CacheConfig {
            cache_root_override: Some(tmp.path().join("cache")),
        };

        let direct = CacheDir::for_project(&project, &config).unwrap();
        let dotted = CacheDir::for_project(project.join("src").join(".."), &config).unwrap();

        assert_eq!(direct, dotted);
        assert!(direct.root().starts_with(tmp.path().join("cache")));
        assert!(direct.root().is_dir());
        assert_eq!(direct.files_path(), direct.root().join("files.json"));
        assert_eq!(direct.artifacts_dir(), direct.root().join("artifacts"));
    }
}
