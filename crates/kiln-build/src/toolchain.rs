use crate::command::{format_command, CommandRunner, DefaultCommandRunner};
use crate::request::CompileSettings;
use kiln_cache::{Digest, DigestBuilder};
use kiln_scheduler::{CompilationJob, JobError, JobExecutor, JobKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Longest tool output kept in an error message.
const MAX_REPORTED_OUTPUT: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error("no `{0}` command is configured")]
    NotConfigured(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("`{command}` failed with exit code {code:?}\n{output}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("{0}")]
    Failed(String),
}

/// Inputs of one compile or precompiled-header invocation.
#[derive(Debug, Clone, Copy)]
pub struct CompileInvocation<'a> {
    pub source: &'a Path,
    pub output: &'a Path,
    /// The precompiled header to use. Always `None` when building the header itself.
    pub precompiled_header: Option<&'a Path>,
    pub settings: &'a CompileSettings,
}

#[derive(Debug, Clone, Copy)]
pub struct LinkInvocation<'a> {
    pub objects: &'a [PathBuf],
    pub output: &'a Path,
    pub settings: &'a CompileSettings,
}

/// The external compiler, linker and archiver.
///
/// Implementations are shared by all workers of a run.
pub trait Toolchain: Send + Sync + fmt::Debug {
    /// Digest identifying the toolchain; part of every build fingerprint.
    fn identity(&self) -> Digest;

    fn precompile_header(&self, invocation: &CompileInvocation<'_>) -> Result<(), ToolchainError>;

    fn compile(&self, invocation: &CompileInvocation<'_>) -> Result<(), ToolchainError>;

    fn link(&self, invocation: &LinkInvocation<'_>) -> Result<(), ToolchainError>;
}

/// Argument templates for [`CommandToolchain`].
///
/// The first element of each template is the program. Placeholders:
///
/// - `{source}`, `{output}`, `{pch}` are substituted inside any argument;
/// - an argument that is exactly `{flags}`, `{defines}` (each as `-D<define>`),
///   `{objects}` or `{use_pch}` expands to zero or more arguments.
///
/// `use_pch` is the argument list spliced in at `{use_pch}` when a
/// precompiled header is in use, e.g. `["-include-pch", "{pch}"]`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplates {
    #[serde(default)]
    pub compile: Vec<String>,
    #[serde(default)]
    pub precompile_header: Vec<String>,
    #[serde(default)]
    pub use_pch: Vec<String>,
    #[serde(default)]
    pub link: Vec<String>,
    /// Free-form identity (compiler version, target triple) folded into the fingerprint.
    #[serde(default)]
    pub identity: Option<String>,
}

/// A [`Toolchain`] that runs external commands built from [`CommandTemplates`].
#[derive(Debug, Clone)]
pub struct CommandToolchain {
    templates: CommandTemplates,
    working_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl CommandToolchain {
    pub fn new(templates: CommandTemplates, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            templates,
            working_dir: working_dir.into(),
            runner: Arc::new(DefaultCommandRunner::default()),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn templates(&self) -> &CommandTemplates {
        &self.templates
    }

    fn run(&self, name: &'static str, template: &[String], vars: &Vars<'_>) -> Result<(), ToolchainError> {
        let argv = expand_template(template, vars, &self.templates.use_pch);
        let Some((program, args)) = argv.split_first() else {
            return Err(ToolchainError::NotConfigured(name));
        };
        let program = Path::new(program);
        let output = self.runner.run(&self.working_dir, program, args)?;
        if output.success() {
            return Ok(());
        }
        Err(ToolchainError::CommandFailed {
            command: format_command(program, args),
            code: output.status.code(),
            output: truncate_output(output.combined()),
        })
    }
}

impl Toolchain for CommandToolchain {
    fn identity(&self) -> Digest {
        let mut builder = DigestBuilder::new();
        builder.field("kiln-command-toolchain-v1");
        for template in [
            &self.templates.compile,
            &self.templates.precompile_header,
            &self.templates.use_pch,
            &self.templates.link,
        ] {
            builder.field(template.join("\0"));
        }
        builder.field(self.templates.identity.as_deref().unwrap_or_default());

        // A compiler given by path is identified by its contents too, so an
        // in-place upgrade invalidates previous builds.
        if let Some(program) = self.templates.compile.first().map(Path::new) {
            if program.components().count() > 1 {
                if let Ok(digest) = Digest::from_file(self.working_dir.join(program)) {
                    builder.field(digest.as_str());
                }
            }
        }
        builder.finish()
    }

    fn precompile_header(&self, invocation: &CompileInvocation<'_>) -> Result<(), ToolchainError> {
        self.run(
            "precompile_header",
            &self.templates.precompile_header,
            &Vars::compile(invocation),
        )
    }

    fn compile(&self, invocation: &CompileInvocation<'_>) -> Result<(), ToolchainError> {
        self.run("compile", &self.templates.compile, &Vars::compile(invocation))
    }

    fn link(&self, invocation: &LinkInvocation<'_>) -> Result<(), ToolchainError> {
        let vars = Vars {
            source: None,
            output: invocation.output,
            pch: None,
            objects: invocation.objects,
            settings: invocation.settings,
        };
        self.run("link", &self.templates.link, &vars)
    }
}

struct Vars<'a> {
    source: Option<&'a Path>,
    output: &'a Path,
    pch: Option<&'a Path>,
    objects: &'a [PathBuf],
    settings: &'a CompileSettings,
}

impl<'a> Vars<'a> {
    fn compile(invocation: &CompileInvocation<'a>) -> Self {
        Self {
            source: Some(invocation.source),
            output: invocation.output,
            pch: invocation.precompiled_header,
            objects: &[],
            settings: invocation.settings,
        }
    }
}

fn expand_template(template: &[String], vars: &Vars<'_>, use_pch: &[String]) -> Vec<String> {
    let mut argv = Vec::with_capacity(template.len());
    for arg in template {
        match arg.as_str() {
            "{flags}" => argv.extend(vars.settings.flags.iter().cloned()),
            "{defines}" => argv.extend(
                vars.settings
                    .defines
                    .iter()
                    .map(|define| format!("-D{define}")),
            ),
            "{objects}" => argv.extend(
                vars.objects
                    .iter()
                    .map(|object| object.display().to_string()),
            ),
            "{use_pch}" => {
                if vars.pch.is_some() {
                    argv.extend(use_pch.iter().map(|arg| substitute(arg, vars)));
                }
            }
            _ => argv.push(substitute(arg, vars)),
        }
    }
    argv
}

fn substitute(arg: &str, vars: &Vars<'_>) -> String {
    let path = |path: Option<&Path>| path.map(|p| p.display().to_string()).unwrap_or_default();
    arg.replace("{source}", &path(vars.source))
        .replace("{output}", &path(Some(vars.output)))
        .replace("{pch}", &path(vars.pch))
}

fn truncate_output(mut output: String) -> String {
    if output.len() <= MAX_REPORTED_OUTPUT {
        return output;
    }
    let mut end = MAX_REPORTED_OUTPUT;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    output.truncate(end);
    output.push_str("\n[output truncated]");
    output
}

/// Adapts a [`Toolchain`] to the orchestrator's [`JobExecutor`].
#[derive(Debug)]
pub(crate) struct ToolchainExecutor {
    toolchain: Arc<dyn Toolchain>,
    settings: CompileSettings,
    precompiled_header: Option<PathBuf>,
}

impl ToolchainExecutor {
    pub(crate) fn new(
        toolchain: Arc<dyn Toolchain>,
        settings: CompileSettings,
        precompiled_header: Option<PathBuf>,
    ) -> Self {
        Self {
            toolchain,
            settings,
            precompiled_header,
        }
    }
}

impl JobExecutor for ToolchainExecutor {
    fn execute(&self, job: &CompilationJob) -> Result<(), JobError> {
        if let Some(parent) = job.output_path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                JobError::new(format!("failed to create {}: {err}", parent.display()))
            })?;
        }

        let mut invocation = CompileInvocation {
            source: &job.source_path,
            output: &job.output_path,
            precompiled_header: None,
            settings: &self.settings,
        };
        let result = match job.kind {
            JobKind::PrecompiledHeader => self.toolchain.precompile_header(&invocation),
            JobKind::Compile => {
                invocation.precompiled_header = self.precompiled_header.as_deref();
                self.toolchain.compile(&invocation)
            }
        };
        result.map_err(|err| JobError::new(err.to_string()))
    }
}
