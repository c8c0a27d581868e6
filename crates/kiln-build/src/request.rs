use crate::error::{BuildError, Result};
use kiln_cache::{FileFilter, SourceTree};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

/// Extensions compiled as translation units when nothing else is configured.
pub const DEFAULT_TRANSLATION_UNIT_EXTENSIONS: &[&str] = &["c", "cc", "cpp", "cxx"];

/// Compiler inputs that are not files: flags, defines, and which tracked files
/// are translation units.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileSettings {
    #[serde(default)]
    pub flags: Vec<String>,
    /// Preprocessor defines, `NAME` or `NAME=VALUE`.
    #[serde(default)]
    pub defines: Vec<String>,
    #[serde(default = "CompileSettings::default_translation_units")]
    pub translation_units: FileFilter,
}

impl CompileSettings {
    fn default_translation_units() -> FileFilter {
        FileFilter::extensions(DEFAULT_TRANSLATION_UNIT_EXTENSIONS)
    }

    pub fn with_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flags = flags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_defines<I, S>(mut self, defines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.defines = defines.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_translation_unit(&self, path: &Path) -> bool {
        // An empty filter would make headers compile jobs.
        !self.translation_units.extension_list().is_empty()
            && self.translation_units.matches(path)
    }
}

impl Default for CompileSettings {
    fn default() -> Self {
        Self {
            flags: Vec::new(),
            defines: Vec::new(),
            translation_units: Self::default_translation_units(),
        }
    }
}

/// "Build target T from source set S with config C."
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildRequest {
    /// Identity of the build in the build cache.
    pub build_key: String,
    /// Identity of the linked artifact in the artifact cache. Defaults to `build_key`.
    pub target_id: String,
    pub trees: Vec<SourceTree>,
    /// Objects, the precompiled header and the linked artifact are written here.
    pub output_dir: PathBuf,
    pub precompiled_header: Option<PathBuf>,
    pub settings: CompileSettings,
    /// Files outside the trees that affect the build (build scripts, toolchain files).
    pub build_script_inputs: Vec<PathBuf>,
    /// File name of the linked artifact. Without one, the build stops after compiling.
    pub artifact_name: Option<String>,
}

impl BuildRequest {
    pub fn new(build_key: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        let build_key = build_key.into();
        Self {
            target_id: build_key.clone(),
            build_key,
            trees: Vec::new(),
            output_dir: output_dir.into(),
            precompiled_header: None,
            settings: CompileSettings::default(),
            build_script_inputs: Vec::new(),
            artifact_name: None,
        }
    }

    pub fn with_target_id(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = target_id.into();
        self
    }

    pub fn with_tree(mut self, tree: SourceTree) -> Self {
        self.trees.push(tree);
        self
    }

    pub fn with_precompiled_header(mut self, header: impl Into<PathBuf>) -> Self {
        self.precompiled_header = Some(header.into());
        self
    }

    pub fn with_settings(mut self, settings: CompileSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_build_script_input(mut self, path: impl Into<PathBuf>) -> Self {
        self.build_script_inputs.push(path.into());
        self
    }

    pub fn with_artifact(mut self, artifact_name: impl Into<String>) -> Self {
        self.artifact_name = Some(artifact_name.into());
        self
    }

    /// Where the linked artifact is written, if this build links.
    pub fn artifact_path(&self) -> Option<PathBuf> {
        self.artifact_name
            .as_ref()
            .map(|name| self.output_dir.join(name))
    }

    /// `<output>/obj/<tree label>/<relative path>.o`
    pub fn object_path(&self, tree_label: &str, relative: &str) -> PathBuf {
        let mut path = self.output_dir.join("obj").join(tree_label);
        for segment in relative.split('/') {
            path.push(segment);
        }
        let mut file_name = path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        file_name.push(".o");
        path.set_file_name(file_name);
        path
    }

    /// `<output>/pch/<header file name>.pch`
    pub fn precompiled_header_output(&self) -> Option<PathBuf> {
        let header = self.precompiled_header.as_ref()?;
        let mut file_name = header.file_name()?.to_os_string();
        file_name.push(".pch");
        Some(self.output_dir.join("pch").join(file_name))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let invalid = |message: String| BuildError::InvalidRequest {
            build_key: self.build_key.clone(),
            message,
        };
        if self.build_key.trim().is_empty() {
            return Err(invalid("build key is empty".to_string()));
        }
        if self.target_id.trim().is_empty() {
            return Err(invalid("target id is empty".to_string()));
        }

        let mut labels = BTreeSet::new();
        for tree in &self.trees {
            if !is_plain_name(&tree.label) {
                return Err(invalid(format!(
                    "tree label `{}` must be a single path segment",
                    tree.label
                )));
            }
            if !labels.insert(tree.label.as_str()) {
                return Err(invalid(format!("tree label `{}` is used twice", tree.label)));
            }
        }

        if let Some(name) = &self.artifact_name {
            if !is_plain_name(name) {
                return Err(invalid(format!(
                    "artifact name `{name}` must be a single path segment"
                )));
            }
        }
        if let Some(header) = &self.precompiled_header {
            if header.file_name().is_none() {
                return Err(invalid(format!(
                    "precompiled header `{}` has no file name",
                    header.display()
                )));
            }
        }
        Ok(())
    }
}

fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
