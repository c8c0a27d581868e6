#![allow(dead_code)]

use filetime::FileTime;
use kiln_build::{
    BuildRequest, CompileInvocation, LinkInvocation, Toolchain, ToolchainError,
};
use kiln_cache::{Digest, FileFilter, SourceTree};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Pch(String),
    Compile(String),
    Link(usize),
}

/// In-memory toolchain: "compiles" by copying the source into the object and
/// "links" by concatenating objects. Failures and delays are scripted by file name.
#[derive(Debug, Default)]
pub struct ScriptedToolchain {
    calls: Mutex<Vec<Call>>,
    failing: Mutex<HashSet<String>>,
    slow: Mutex<HashMap<String, Duration>>,
    fail_link: Mutex<bool>,
    identity: Mutex<String>,
}

impl ScriptedToolchain {
    pub fn fail(&self, file_name: &str) {
        self.failing.lock().insert(file_name.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().clear();
        *self.fail_link.lock() = false;
    }

    pub fn fail_link(&self) {
        *self.fail_link.lock() = true;
    }

    pub fn slow_down(&self, file_name: &str, delay: Duration) {
        self.slow.lock().insert(file_name.to_string(), delay);
    }

    pub fn set_identity(&self, identity: &str) {
        *self.identity.lock() = identity.to_string();
    }

    /// Calls made since the last `take_calls`, compile calls sorted by file name.
    pub fn take_calls(&self) -> Vec<Call> {
        let mut calls = std::mem::take(&mut *self.calls.lock());
        calls.sort_by_key(|call| match call {
            Call::Pch(name) => (0, name.clone()),
            Call::Compile(name) => (1, name.clone()),
            Call::Link(_) => (2, String::new()),
        });
        calls
    }

    pub fn compiled(&self) -> Vec<String> {
        self.take_calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Compile(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    fn script(&self, source: &Path) -> Result<(), ToolchainError> {
        let name = file_name(source);
        let delay = self.slow.lock().get(&name).copied();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.failing.lock().contains(&name) {
            return Err(ToolchainError::Failed(format!("{name}: error: expected ';'")));
        }
        Ok(())
    }
}

impl Toolchain for ScriptedToolchain {
    fn identity(&self) -> Digest {
        Digest::from_bytes(format!("scripted:{}", self.identity.lock()))
    }

    fn precompile_header(&self, invocation: &CompileInvocation<'_>) -> Result<(), ToolchainError> {
        self.calls.lock().push(Call::Pch(file_name(invocation.source)));
        self.script(invocation.source)?;
        fs::copy(invocation.source, invocation.output)?;
        Ok(())
    }

    fn compile(&self, invocation: &CompileInvocation<'_>) -> Result<(), ToolchainError> {
        self.calls
            .lock()
            .push(Call::Compile(file_name(invocation.source)));
        self.script(invocation.source)?;
        let mut object = fs::read(invocation.source)?;
        if let Some(pch) = invocation.precompiled_header {
            object.extend_from_slice(format!("\n// pch {}\n", pch.display()).as_bytes());
        }
        fs::write(invocation.output, object)?;
        Ok(())
    }

    fn link(&self, invocation: &LinkInvocation<'_>) -> Result<(), ToolchainError> {
        self.calls.lock().push(Call::Link(invocation.objects.len()));
        if *self.fail_link.lock() {
            return Err(ToolchainError::Failed("undefined reference to `main'".to_string()));
        }
        let mut artifact = Vec::new();
        for object in invocation.objects {
            artifact.extend(fs::read(object)?);
        }
        fs::write(invocation.output, artifact)?;
        Ok(())
    }
}

pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// A project with `src/{a.cpp, b.cpp, util.h, pch.h}`.
pub struct Project {
    pub dir: tempfile::TempDir,
}

impl Project {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let project = Self { dir };
        fs::create_dir_all(project.src()).unwrap();
        fs::write(project.src().join("a.cpp"), "int a() { return 1; }\n").unwrap();
        fs::write(project.src().join("b.cpp"), "int b() { return 2; }\n").unwrap();
        fs::write(project.src().join("util.h"), "#pragma once\n").unwrap();
        fs::write(project.src().join("pch.h"), "#include <vector>\n").unwrap();
        project
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn src(&self) -> PathBuf {
        self.root().join("src")
    }

    pub fn out(&self) -> PathBuf {
        self.root().join("out")
    }

    pub fn cache(&self) -> PathBuf {
        self.root().join("cache")
    }

    pub fn request(&self) -> BuildRequest {
        BuildRequest::new("core", self.out())
            .with_tree(SourceTree::new(
                "core",
                self.src(),
                FileFilter::extensions(["cpp", "h"]),
            ))
            .with_precompiled_header(self.src().join("pch.h"))
            .with_artifact("libcore.a")
    }

    pub fn artifact(&self) -> PathBuf {
        self.out().join("libcore.a")
    }
}

/// Rewrites `path` with a strictly later mtime, so the edit is visible even
/// within one filesystem timestamp tick.
pub fn rewrite(path: &Path, contents: &str) {
    let before = mtime(path);
    fs::write(path, contents).unwrap();
    bump_mtime(path, before);
}

/// Moves the mtime forward without touching the contents.
pub fn touch(path: &Path) {
    let before = mtime(path);
    bump_mtime(path, before);
}

fn mtime(path: &Path) -> FileTime {
    FileTime::from_last_modification_time(&fs::metadata(path).unwrap())
}

fn bump_mtime(path: &Path, before: FileTime) {
    let after = FileTime::from_unix_time(before.unix_seconds() + 2, before.nanoseconds());
    filetime::set_file_mtime(path, after).unwrap();
}
