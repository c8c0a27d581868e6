//! Parallel execution of compilation jobs for Kiln.
//!
//! [`CompilationOrchestrator::run`] takes a set of [`CompilationJob`]s with
//! prerequisite edges (typically every translation unit depending on a
//! precompiled-header job) and runs them on a fixed-size rayon pool:
//!
//! - a job starts only once all of its prerequisites are `Done`;
//! - a failed job's dependents are skipped while independent jobs continue;
//! - a run-level [`Watchdog`] stops the whole run when its budget is exceeded
//!   and reports which jobs were in flight.
//!
//! The orchestrator never touches the filesystem or a toolchain itself; the
//! work is delegated to a [`JobExecutor`].

mod config;
mod job;
mod orchestrator;
mod pool;
mod watchdog;

pub use config::{OrchestratorConfig, DEFAULT_RUN_TIMEOUT};
pub use job::{CompilationJob, JobError, JobExecutor, JobId, JobKind, JobOutcome, JobState};
pub use orchestrator::{CompilationOrchestrator, OrchestratorError, RunResult, RunStatus};
pub use watchdog::{InFlightJob, Watchdog, WatchdogReport};
