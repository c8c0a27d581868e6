use crate::digest::{Digest, DigestBuilder};
use crate::file_store::FileFingerprintStore;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Label prefix of components that digest a source tree.
pub const TREE_COMPONENT_PREFIX: &str = "tree:";

const TREE_DIGEST_TAG: &str = "kiln-tree-v1";
const FILE_SET_DIGEST_TAG: &str = "kiln-file-set-v1";
const COMBINED_DIGEST_TAG: &str = "kiln-build-fingerprint-v1";
const UNREADABLE_MARKER: &str = "<unreadable>";

/// Selects which files of a tree are tracked, by extension.
///
/// An empty extension list matches every file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileFilter {
    extensions: Vec<String>,
}

impl FileFilter {
    pub fn any() -> Self {
        Self::default()
    }

    /// Matches files whose extension (case-insensitive, leading `.` optional) is listed.
    pub fn extensions<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut extensions: Vec<String> = extensions
            .into_iter()
            .map(|ext| normalize_extension(ext.as_ref()))
            .filter(|ext| !ext.is_empty())
            .collect();
        extensions.sort();
        extensions.dedup();
        Self { extensions }
    }

    pub fn matches(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .map(|ext| normalize_extension(&ext.to_string_lossy()))
            .is_some_and(|ext| self.extensions.iter().any(|allowed| *allowed == ext))
    }

    pub fn extension_list(&self) -> &[String] {
        &self.extensions
    }
}

pub(crate) fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// A labeled directory of tracked inputs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceTree {
    pub label: String,
    pub root: PathBuf,
    pub filter: FileFilter,
}

impl SourceTree {
    pub fn new(label: impl Into<String>, root: impl Into<PathBuf>, filter: FileFilter) -> Self {
        Self {
            label: label.into(),
            root: root.into(),
            filter,
        }
    }
}

/// One enumerated file of a tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedFile {
    pub path: PathBuf,
    /// Path relative to the tree root, `/`-separated.
    pub relative: String,
    /// `None` when the file couldn't be read.
    pub digest: Option<Digest>,
}

/// The enumerated contents of one [`SourceTree`] and its digest.
#[derive(Clone, Debug)]
pub struct TreeSnapshot {
    pub label: String,
    pub root: PathBuf,
    /// Sorted by `relative`.
    pub files: Vec<TrackedFile>,
    pub digest: Digest,
    pub incomplete: bool,
}

impl TreeSnapshot {
    pub fn component_label(&self) -> String {
        format!("{TREE_COMPONENT_PREFIX}{}", self.label)
    }
}

/// Digest over an explicit list of files (build scripts, toolchain files).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileSetDigest {
    pub digest: Digest,
    pub incomplete: bool,
}

/// Composite fingerprint of everything that determines a build's output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFingerprint {
    pub build_key: String,
    /// Sorted by label, then digest.
    pub components: Vec<(String, Digest)>,
    pub combined: Digest,
    /// Set when some input couldn't be read. An incomplete fingerprint never
    /// matches a stored one.
    pub incomplete: bool,
}

impl BuildFingerprint {
    pub fn from_components(
        build_key: impl Into<String>,
        mut components: Vec<(String, Digest)>,
        incomplete: bool,
    ) -> Self {
        components.sort();
        let mut builder = DigestBuilder::new();
        builder.field(COMBINED_DIGEST_TAG);
        for (label, digest) in &components {
            builder.field(label).field(digest.as_str());
        }
        Self {
            build_key: build_key.into(),
            components,
            combined: builder.finish(),
            incomplete,
        }
    }

    pub fn component(&self, label: &str) -> Option<&Digest> {
        self.components
            .iter()
            .find(|(candidate, _)| candidate == label)
            .map(|(_, digest)| digest)
    }

    /// Components that don't digest a source tree: configuration, toolchain, build scripts.
    pub fn non_tree_components(&self) -> impl Iterator<Item = &(String, Digest)> {
        self.components
            .iter()
            .filter(|(label, _)| !label.starts_with(TREE_COMPONENT_PREFIX))
    }
}

/// Computes [`BuildFingerprint`]s from on-disk state, observed through a
/// [`FileFingerprintStore`].
#[derive(Debug, Clone, Copy)]
pub struct BuildFingerprintCalculator<'a> {
    store: &'a FileFingerprintStore,
}

impl<'a> BuildFingerprintCalculator<'a> {
    pub fn new(store: &'a FileFingerprintStore) -> Self {
        Self { store }
    }

    pub fn compute(
        &self,
        build_key: &str,
        trees: &[SourceTree],
        extra_components: &[(String, Digest)],
    ) -> BuildFingerprint {
        self.compute_with_snapshots(build_key, trees, extra_components)
            .0
    }

    /// Like [`Self::compute`], also returning the per-tree file lists so the
    /// caller doesn't have to enumerate the trees a second time.
    pub fn compute_with_snapshots(
        &self,
        build_key: &str,
        trees: &[SourceTree],
        extra_components: &[(String, Digest)],
    ) -> (BuildFingerprint, Vec<TreeSnapshot>) {
        let snapshots: Vec<TreeSnapshot> = trees.iter().map(|tree| self.snapshot(tree)).collect();

        let mut components: Vec<(String, Digest)> = snapshots
            .iter()
            .map(|snapshot| (snapshot.component_label(), snapshot.digest.clone()))
            .collect();
        components.extend(extra_components.iter().cloned());
        let incomplete = snapshots.iter().any(|snapshot| snapshot.incomplete);

        let fingerprint = BuildFingerprint::from_components(build_key, components, incomplete);
        tracing::debug!(
            target: "kiln.cache",
            build_key,
            combined = %fingerprint.combined.short(),
            incomplete,
            "computed build fingerprint"
        );
        (fingerprint, snapshots)
    }

    /// Enumerates and digests one tree.
    pub fn snapshot(&self, tree: &SourceTree) -> TreeSnapshot {
        let (entries, mut incomplete) = enumerate_tree(tree);

        let files: Vec<TrackedFile> = entries
            .into_par_iter()
            .map(|(path, relative)| {
                let digest = self.store.hash_of(&path);
                TrackedFile {
                    path,
                    relative,
                    digest,
                }
            })
            .collect();

        let mut builder = DigestBuilder::new();
        builder.field(TREE_DIGEST_TAG);
        for file in &files {
            builder.field(&file.relative);
            match &file.digest {
                Some(digest) => builder.field(digest.as_str()),
                None => {
                    incomplete = true;
                    builder.field(UNREADABLE_MARKER)
                }
            };
        }

        TreeSnapshot {
            label: tree.label.clone(),
            root: tree.root.clone(),
            files,
            digest: builder.finish(),
            incomplete,
        }
    }

    /// Digest over `paths` in sorted order, folding each path with its content digest.
    ///
    /// Paths are folded relative to their deepest common directory, so the
    /// same files in another checkout location give the same digest.
    pub fn digest_files(&self, paths: &[PathBuf]) -> FileSetDigest {
        let mut paths: Vec<&PathBuf> = paths.iter().collect();
        paths.sort();
        paths.dedup();
        let base = common_base(&paths);

        let mut incomplete = false;
        let mut builder = DigestBuilder::new();
        builder.field(FILE_SET_DIGEST_TAG);
        for path in paths {
            let relative = relative_path(&base, path)
                .unwrap_or_else(|| path.to_string_lossy().into_owned());
            builder.field(relative.as_bytes());
            match self.store.hash_of(path) {
                Some(digest) => builder.field(digest.as_str()),
                None => {
                    incomplete = true;
                    builder.field(UNREADABLE_MARKER)
                }
            };
        }
        FileSetDigest {
            digest: builder.finish(),
            incomplete,
        }
    }
}

/// Lists `(absolute path, relative path)` of matching files, sorted by relative path.
///
/// Hidden directories (`.git`, cache directories) are not descended into.
fn enumerate_tree(tree: &SourceTree) -> (Vec<(PathBuf, String)>, bool) {
    match std::fs::metadata(&tree.root) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            tracing::warn!(
                target: "kiln.cache",
                tree = %tree.label,
                root = %tree.root.display(),
                "source tree root is not a directory"
            );
            return (Vec::new(), true);
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(
                target: "kiln.cache",
                tree = %tree.label,
                root = %tree.root.display(),
                "source tree root does not exist; treating as empty"
            );
            return (Vec::new(), false);
        }
        Err(err) => {
            tracing::warn!(
                target: "kiln.cache",
                tree = %tree.label,
                root = %tree.root.display(),
                error = %err,
                "failed to stat source tree root"
            );
            return (Vec::new(), true);
        }
    }

    let mut incomplete = false;
    let mut files = Vec::new();
    let walker = WalkDir::new(&tree.root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden_dir(entry));
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                incomplete = true;
                tracing::debug!(
                    target: "kiln.cache",
                    tree = %tree.label,
                    error = %err,
                    "failed to enumerate part of a source tree"
                );
                continue;
            }
        };
        if !entry.file_type().is_file() || !tree.filter.matches(entry.path()) {
            continue;
        }
        let Some(relative) = relative_path(&tree.root, entry.path()) else {
            continue;
        };
        files.push((entry.into_path(), relative));
    }

    files.sort_by(|a, b| a.1.cmp(&b.1));
    (files, incomplete)
}

fn is_hidden_dir(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_dir() && entry.file_name().to_string_lossy().starts_with('.')
}

/// Deepest directory containing every path.
fn common_base(paths: &[&PathBuf]) -> PathBuf {
    let mut base = match paths.first().and_then(|path| path.parent()) {
        Some(parent) => parent.to_path_buf(),
        None => return PathBuf::new(),
    };
    while !paths.iter().all(|path| path.starts_with(&base)) {
        if !base.pop() {
            break;
        }
    }
    base
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}
