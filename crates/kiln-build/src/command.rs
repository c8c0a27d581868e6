use std::fmt;
use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const TRY_WAIT_INTERVAL: Duration = Duration::from_millis(10);

/// Captured result of one toolchain invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// `stdout` followed by `stderr`, separated by a newline when both are present.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Runs external programs. Called concurrently from worker threads.
pub trait CommandRunner: Send + Sync + fmt::Debug {
    fn run(&self, cwd: &Path, program: &Path, args: &[String]) -> io::Result<CommandOutput>;
}

#[derive(Debug, Clone, Default)]
pub struct DefaultCommandRunner {
    /// Per-command limit. On expiry the child is killed (not its process
    /// tree) and the run fails with [`io::ErrorKind::TimedOut`].
    pub timeout: Option<Duration>,
}

impl DefaultCommandRunner {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

impl CommandRunner for DefaultCommandRunner {
    fn run(&self, cwd: &Path, program: &Path, args: &[String]) -> io::Result<CommandOutput> {
        let command = format_command(program, args);
        tracing::trace!(target: "kiln.build", command = %command, "spawning");

        let mut child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| io::Error::new(err.kind(), format!("failed to spawn `{command}`: {err}")))?;

        // Drain both pipes on their own threads so a chatty compiler can't
        // block on a full pipe while we wait for it.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = self.wait(&mut child, &command);
        if status.is_err() {
            let _ = child.kill();
            let _ = child.wait();
        }
        let stdout = collect(stdout);
        let stderr = collect(stderr);

        match status {
            Ok(status) => Ok(CommandOutput {
                status,
                stdout,
                stderr,
            }),
            Err(err) => {
                let mut message = err.to_string();
                for (name, text) in [("stdout", &stdout), ("stderr", &stderr)] {
                    if !text.is_empty() {
                        message.push_str(&format!("\n{name}:\n{text}"));
                    }
                }
                Err(io::Error::new(err.kind(), message))
            }
        }
    }
}

impl DefaultCommandRunner {
    fn wait(&self, child: &mut Child, command: &str) -> io::Result<ExitStatus> {
        let Some(timeout) = self.timeout else {
            return child.wait();
        };
        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if started.elapsed() >= timeout {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("`{command}` timed out after {timeout:?}"),
                ));
            }
            thread::sleep(TRY_WAIT_INTERVAL);
        }
    }
}

fn drain(pipe: Option<impl Read + Send + 'static>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    let bytes = handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

pub(crate) fn format_command(program: &Path, args: &[String]) -> String {
    let mut out = program.display().to_string();
    for arg in args {
        out.push(' ');
        out.push_str(arg);
    }
    out
}
