//! Incremental builds on top of `kiln-cache` and `kiln-scheduler`.
//!
//! A [`Builder`] takes a [`BuildRequest`] ("build target T from source set S
//! with config C"), fingerprints its inputs, and either reports the build as
//! up to date or compiles exactly the translation units whose inputs changed,
//! links, and records the outcome. A failed run leaves the failed subset to be
//! retried by the next one.
//!
//! The compiler itself is behind the [`Toolchain`] trait; [`CommandToolchain`]
//! drives external commands from argument templates.

mod builder;
mod command;
mod error;
mod plan;
mod report;
mod request;
mod toolchain;

pub use builder::{
    Builder, BUILD_SCRIPT_COMPONENT, CONFIG_COMPONENT, PRECOMPILED_HEADER_COMPONENT,
    TOOLCHAIN_COMPONENT,
};
pub use command::{CommandOutput, CommandRunner, DefaultCommandRunner};
pub use error::{BuildError, Result};
pub use report::{ArtifactReport, ArtifactSource, BuildReport, JobReport};
pub use request::{BuildRequest, CompileSettings, DEFAULT_TRANSLATION_UNIT_EXTENSIONS};
pub use toolchain::{
    CommandTemplates, CommandToolchain, CompileInvocation, LinkInvocation, Toolchain,
    ToolchainError,
};
