//! `kiln.toml` loading and conversion into the typed runtime settings of the
//! other Kiln crates.
//!
//! ```toml
//! [cache]
//! dir = ".kiln-cache"          # default: ~/.kiln/cache/<project hash> (or $KILN_CACHE_DIR)
//!
//! [orchestrator]
//! workers = 8
//! timeout_secs = 600
//!
//! [gc]
//! max_entries_per_target = 3
//! max_age_days = 30
//!
//! [toolchain]
//! compile = ["cc", "-c", "{source}", "-o", "{output}", "{flags}", "{defines}"]
//! link = ["ar", "rcs", "{output}", "{objects}"]
//!
//! [[target]]
//! name = "core"
//! artifact = "libcore.a"
//! tree = [{ label = "src", root = "src", extensions = ["c", "h"] }]
//! ```
//!
//! Every field has a default, so an empty file is a valid (target-less) config.
//! Relative paths resolve against the project root handed to the conversion
//! methods, which the CLI sets to the directory holding the config file.

mod logging;

pub use logging::{init_tracing, LoggingConfig};

use kiln_build::{
    BuildRequest, CommandTemplates, CommandToolchain, CompileSettings, DefaultCommandRunner,
};
use kiln_cache::{CacheConfig, CacheDir, CacheError, FileFilter, GcPolicy, SourceTree};
use kiln_scheduler::OrchestratorConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;

/// Conventional config file name looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "kiln.toml";

/// Set to `1`/`true`/`yes` to run every build as if the cache were disabled.
pub const DISABLE_CACHE_ENV: &str = "KILN_DISABLE_CACHE";

const DAY_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

pub type Result<T, E = ConfigError> = std::result::Result<T, E>;

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The `Display` impl quotes the offending source line; keep only the message.
        ConfigError::Toml(sanitize_toml_error_message(err.message()))
    }
}

/// Redacts user-provided values (quoted strings, unknown keys, unexpected
/// scalars) from a `toml`/`serde` error message.
fn sanitize_toml_error_message(message: &str) -> String {
    static DOUBLE_QUOTED: OnceLock<regex::Regex> = OnceLock::new();
    static SINGLE_QUOTED: OnceLock<regex::Regex> = OnceLock::new();
    static USER_BACKTICKED: OnceLock<regex::Regex> = OnceLock::new();

    let double = DOUBLE_QUOTED.get_or_init(|| {
        regex::Regex::new(r#""(?:\\.|[^"\\])*""#).expect("double-quoted regex should compile")
    });
    let single = SINGLE_QUOTED.get_or_init(|| {
        regex::Regex::new(r"'(?:\\.|[^'\\])*'").expect("single-quoted regex should compile")
    });
    // `missing field `name`` names a schema field and is kept.
    let backticked = USER_BACKTICKED.get_or_init(|| {
        regex::Regex::new(
            r"(unknown field |unknown variant |invalid type: [a-z ]+|invalid value: [a-z ]+)`[^`]*`",
        )
        .expect("backticked regex should compile")
    });

    let out = double.replace_all(message, r#""<redacted>""#);
    let out = single.replace_all(&out, "'<redacted>'");
    backticked
        .replace_all(&out, "$1`<redacted>`")
        .into_owned()
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSection {
    /// Cache directory, used as-is. Without it the per-project directory under
    /// `$KILN_CACHE_DIR` or `~/.kiln/cache` is used.
    pub dir: Option<PathBuf>,
    /// Bypass every cache: rehash all files, never skip, never reuse artifacts.
    pub disable: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorSection {
    /// Worker threads; defaults to the available parallelism.
    pub workers: Option<usize>,
    pub min_workers: Option<usize>,
    pub max_workers: Option<usize>,
    /// Wall-clock budget of one run; defaults to 20 minutes.
    pub timeout_secs: Option<u64>,
}

/// Unset fields keep the [`GcPolicy`] defaults; `0` disables the age and size stages.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GcSection {
    pub max_entries_per_target: Option<usize>,
    pub max_age_days: Option<u64>,
    pub max_total_bytes: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainSection {
    #[serde(flatten)]
    pub templates: CommandTemplates,
    /// Kill a single compiler or linker invocation after this many seconds.
    pub command_timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TreeConfig {
    pub label: String,
    pub root: PathBuf,
    /// Tracked extensions; empty tracks every file.
    pub extensions: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetConfig {
    /// Build key of the target.
    pub name: String,
    /// Artifact cache identity; defaults to `name`.
    pub target_id: Option<String>,
    #[serde(rename = "tree")]
    pub trees: Vec<TreeConfig>,
    pub precompiled_header: Option<PathBuf>,
    pub flags: Vec<String>,
    pub defines: Vec<String>,
    /// Extensions compiled as translation units; defaults to `c`, `cc`, `cpp`, `cxx`.
    pub translation_units: Option<Vec<String>>,
    pub build_scripts: Vec<PathBuf>,
    /// File name of the linked artifact; without one the target only compiles.
    pub artifact: Option<String>,
    /// Defaults to `<project>/target/kiln/<name>`.
    pub output_dir: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KilnConfig {
    pub cache: CacheSection,
    pub orchestrator: OrchestratorSection,
    pub gc: GcSection,
    pub logging: LoggingConfig,
    pub toolchain: ToolchainSection,
    #[serde(rename = "target")]
    pub targets: Vec<TargetConfig>,
}

impl KilnConfig {
    /// Loads and validates a config file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(
            target: "kiln.config",
            path = %path.display(),
            targets = config.targets.len(),
            "loaded config"
        );
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: KilnConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = BTreeSet::new();
        for target in &self.targets {
            if target.name.trim().is_empty() {
                return Err(ConfigError::Invalid("a [[target]] has no name".to_string()));
            }
            if !names.insert(target.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "target `{}` is defined twice",
                    target.name
                )));
            }
            if target.trees.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "target `{}` has no source tree",
                    target.name
                )));
            }
            if let Some(tree) = target.trees.iter().find(|tree| tree.label.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "target `{}` has a tree without a label (root `{}`)",
                    target.name,
                    tree.root.display()
                )));
            }
        }
        if self.orchestrator.timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "orchestrator.timeout_secs must be positive".to_string(),
            ));
        }
        if let (Some(min), Some(max)) = (self.orchestrator.min_workers, self.orchestrator.max_workers)
        {
            if min > max {
                return Err(ConfigError::Invalid(format!(
                    "orchestrator.min_workers ({min}) exceeds max_workers ({max})"
                )));
            }
        }
        Ok(())
    }

    /// The configured flag, or the `KILN_DISABLE_CACHE` environment override.
    pub fn disable_cache(&self) -> bool {
        self.cache.disable
            || std::env::var(DISABLE_CACHE_ENV)
                .map(|value| env_flag(&value))
                .unwrap_or(false)
    }

    pub fn cache_dir(&self, project_root: &Path) -> Result<CacheDir> {
        let dir = match &self.cache.dir {
            Some(dir) => CacheDir::at(resolve(project_root, dir))?,
            None => CacheDir::for_project(project_root, &CacheConfig::from_env())?,
        };
        Ok(dir)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let section = &self.orchestrator;
        let mut config = OrchestratorConfig::default();
        if let Some(workers) = section.workers {
            config.worker_count = workers;
        }
        if let Some(min) = section.min_workers {
            config.min_workers = min;
        }
        if let Some(max) = section.max_workers {
            config.max_workers = max;
        }
        if let Some(secs) = section.timeout_secs {
            config.timeout = Duration::from_secs(secs);
        }
        config
    }

    pub fn gc_policy(&self) -> GcPolicy {
        let mut policy = GcPolicy::default();
        if let Some(max) = self.gc.max_entries_per_target {
            policy.max_entries_per_target = max;
        }
        match self.gc.max_age_days {
            Some(0) => policy.max_age_ms = None,
            Some(days) => policy.max_age_ms = Some(days.saturating_mul(DAY_SECS * 1000)),
            None => {}
        }
        match self.gc.max_total_bytes {
            Some(0) => policy.max_total_bytes = None,
            Some(bytes) => policy.max_total_bytes = Some(bytes),
            None => {}
        }
        policy
    }

    pub fn toolchain(&self, project_root: &Path) -> CommandToolchain {
        let toolchain = CommandToolchain::new(self.toolchain.templates.clone(), project_root);
        match self.toolchain.command_timeout_secs {
            Some(secs) => toolchain.with_runner(Arc::new(DefaultCommandRunner::with_timeout(
                Duration::from_secs(secs),
            ))),
            None => toolchain,
        }
    }

    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|target| target.name == name)
    }

    /// Requests for the `selected` targets in the order given, or for every
    /// target when `selected` is empty.
    pub fn build_requests(&self, project_root: &Path, selected: &[String]) -> Result<Vec<BuildRequest>> {
        if selected.is_empty() {
            return Ok(self
                .targets
                .iter()
                .map(|target| target.build_request(project_root))
                .collect());
        }
        selected
            .iter()
            .map(|name| {
                self.target(name)
                    .map(|target| target.build_request(project_root))
                    .ok_or_else(|| ConfigError::Invalid(format!("unknown target `{name}`")))
            })
            .collect()
    }
}

impl TargetConfig {
    pub fn build_request(&self, project_root: &Path) -> BuildRequest {
        let output_dir = match &self.output_dir {
            Some(dir) => resolve(project_root, dir),
            None => project_root.join("target").join("kiln").join(&self.name),
        };

        let mut settings = CompileSettings::default()
            .with_flags(self.flags.iter().cloned())
            .with_defines(self.defines.iter().cloned());
        if let Some(extensions) = &self.translation_units {
            settings.translation_units = FileFilter::extensions(extensions);
        }

        let mut request = BuildRequest::new(self.name.clone(), output_dir).with_settings(settings);
        if let Some(target_id) = &self.target_id {
            request = request.with_target_id(target_id.clone());
        }
        for tree in &self.trees {
            request = request.with_tree(SourceTree::new(
                tree.label.clone(),
                resolve(project_root, &tree.root),
                FileFilter::extensions(&tree.extensions),
            ));
        }
        if let Some(header) = &self.precompiled_header {
            request = request.with_precompiled_header(resolve(project_root, header));
        }
        for script in &self.build_scripts {
            request = request.with_build_script_input(resolve(project_root, script));
        }
        if let Some(artifact) = &self.artifact {
            request = request.with_artifact(artifact.clone());
        }
        request
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn env_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[cache]
dir = ".kiln-cache"

[orchestrator]
workers = 6
max_workers = 4
timeout_secs = 90

[gc]
max_entries_per_target = 5
max_age_days = 0

[logging]
level = "debug"

[toolchain]
compile = ["cc", "-c", "{source}", "-o", "{output}", "{flags}"]
link = ["ar", "rcs", "{output}", "{objects}"]
identity = "cc 14.1"
command_timeout_secs = 30

[[target]]
name = "core"
target_id = "core-x86_64"
precompiled_header = "src/pch.h"
flags = ["-O2"]
defines = ["NDEBUG"]
translation_units = ["cpp"]
build_scripts = ["build.kiln"]
artifact = "libcore.a"
tree = [
  { label = "src", root = "src", extensions = ["cpp", "h"] },
  { label = "gen", root = "/abs/gen" },
]

[[target]]
name = "tools"
tree = [{ label = "src", root = "tools" }]
output_dir = "out/tools"
"#;

    #[test]
    fn empty_file_is_valid() {
        let config = KilnConfig::from_toml_str("").unwrap();
        assert_eq!(config, KilnConfig::default());
        assert!(config.targets.is_empty());
        assert_eq!(config.logging, LoggingConfig::default());
        assert_eq!(config.gc_policy(), GcPolicy::default());
    }

    #[test]
    fn sections_convert_to_runtime_settings() {
        let config = KilnConfig::from_toml_str(SAMPLE).unwrap();

        let orchestrator = config.orchestrator_config();
        assert_eq!(orchestrator.worker_count, 6);
        assert_eq!(orchestrator.max_workers, 4);
        assert_eq!(orchestrator.timeout, Duration::from_secs(90));
        assert_eq!(orchestrator.effective_workers(100), 4);

        let gc = config.gc_policy();
        assert_eq!(gc.max_entries_per_target, 5);
        assert_eq!(gc.max_age_ms, None);
        assert_eq!(gc.max_total_bytes, GcPolicy::default().max_total_bytes);

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.toolchain.command_timeout_secs, Some(30));
        assert_eq!(config.toolchain.templates.identity.as_deref(), Some("cc 14.1"));
        assert_eq!(config.toolchain.templates.link[0], "ar");
    }

    #[test]
    fn targets_become_build_requests_with_resolved_paths() {
        let config = KilnConfig::from_toml_str(SAMPLE).unwrap();
        let root = Path::new("/work/project");
        let requests = config.build_requests(root, &[]).unwrap();
        assert_eq!(requests.len(), 2);

        let core = &requests[0];
        assert_eq!(core.build_key, "core");
        assert_eq!(core.target_id, "core-x86_64");
        assert_eq!(core.output_dir, root.join("target/kiln/core"));
        assert_eq!(core.precompiled_header, Some(root.join("src/pch.h")));
        assert_eq!(core.build_script_inputs, vec![root.join("build.kiln")]);
        assert_eq!(core.artifact_path(), Some(root.join("target/kiln/core/libcore.a")));
        assert_eq!(core.settings.flags, vec!["-O2".to_string()]);
        assert_eq!(core.settings.defines, vec!["NDEBUG".to_string()]);
        assert!(core.settings.is_translation_unit(Path::new("a.cpp")));
        assert!(!core.settings.is_translation_unit(Path::new("a.c")));

        assert_eq!(core.trees.len(), 2);
        assert_eq!(core.trees[0].root, root.join("src"));
        assert_eq!(core.trees[0].filter, FileFilter::extensions(["cpp", "h"]));
        assert_eq!(core.trees[1].root, PathBuf::from("/abs/gen"));
        assert_eq!(core.trees[1].filter, FileFilter::any());

        let tools = &requests[1];
        assert_eq!(tools.target_id, "tools");
        assert_eq!(tools.output_dir, root.join("out/tools"));
        assert_eq!(tools.artifact_name, None);
        assert!(tools.settings.is_translation_unit(Path::new("main.cc")));
    }

    #[test]
    fn selected_targets_keep_their_order_and_reject_unknown_names() {
        let config = KilnConfig::from_toml_str(SAMPLE).unwrap();
        let root = Path::new("/work");
        let keys: Vec<_> = config
            .build_requests(root, &["tools".to_string(), "core".to_string()])
            .unwrap()
            .into_iter()
            .map(|request| request.build_key)
            .collect();
        assert_eq!(keys, vec!["tools", "core"]);

        let err = config
            .build_requests(root, &["nope".to_string()])
            .unwrap_err();
        assert!(err.to_string().contains("unknown target `nope`"), "{err}");
    }

    #[test]
    fn invalid_targets_are_rejected() {
        let duplicate = r#"
[[target]]
name = "a"
tree = [{ label = "src", root = "a" }]

[[target]]
name = "a"
tree = [{ label = "src", root = "b" }]
"#;
        let err = KilnConfig::from_toml_str(duplicate).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("defined twice")));

        let unnamed = "[[target]]\ntree = [{ label = \"src\", root = \"a\" }]\n";
        assert!(matches!(
            KilnConfig::from_toml_str(unnamed),
            Err(ConfigError::Invalid(_))
        ));

        let no_tree = "[[target]]\nname = \"a\"\n";
        assert!(matches!(
            KilnConfig::from_toml_str(no_tree),
            Err(ConfigError::Invalid(_))
        ));

        let zero_timeout = "[orchestrator]\ntimeout_secs = 0\n";
        assert!(matches!(
            KilnConfig::from_toml_str(zero_timeout),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn parse_errors_do_not_echo_config_values() {
        let err = KilnConfig::from_toml_str("[cache]\ndisable = \"hunter2\"\n").unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, ConfigError::Toml(_)));
        assert!(!message.contains("hunter2"), "{message}");

        let err = KilnConfig::from_toml_str("[cache]\napi_token_hunter2 = 1\n").unwrap_err();
        let message = err.to_string();
        assert!(!message.contains("hunter2"), "{message}");
    }

    #[test]
    fn sanitizer_keeps_schema_names() {
        assert_eq!(
            sanitize_toml_error_message("missing field `name`"),
            "missing field `name`"
        );
        assert_eq!(
            sanitize_toml_error_message("unknown field `secret`, expected `dir` or `disable`"),
            "unknown field `<redacted>`, expected `dir` or `disable`"
        );
        assert_eq!(
            sanitize_toml_error_message(r#"invalid type: string "a\"b", expected a boolean"#),
            r#"invalid type: string "<redacted>", expected a boolean"#
        );
    }

    #[test]
    fn load_from_path_reports_the_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        let err = KilnConfig::load_from_path(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));

        std::fs::write(&path, SAMPLE).unwrap();
        let config = KilnConfig::load_from_path(&path).unwrap();
        assert_eq!(config.targets.len(), 2);
    }

    #[test]
    fn configured_cache_dir_is_created_relative_to_the_project() {
        let tmp = tempfile::tempdir().unwrap();
        let config = KilnConfig::from_toml_str(SAMPLE).unwrap();
        let cache = config.cache_dir(tmp.path()).unwrap();
        assert_eq!(cache.root(), tmp.path().join(".kiln-cache"));
        assert!(cache.root().is_dir());
    }

    #[test]
    fn env_flag_accepts_common_truthy_values() {
        for value in ["1", "true", "TRUE", " yes ", "on"] {
            assert!(env_flag(value), "{value}");
        }
        for value in ["", "0", "false", "no", "off"] {
            assert!(!env_flag(value), "{value}");
        }
    }
}
