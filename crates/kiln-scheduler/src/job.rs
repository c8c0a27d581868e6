use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub u32);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Builds a precompiled header that compile jobs depend on.
    PrecompiledHeader,
    /// Compiles one translation unit.
    Compile,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed,
}

/// One unit of work for the orchestrator. Lives for a single run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompilationJob {
    pub id: JobId,
    pub kind: JobKind,
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    /// Jobs that must be `Done` before this one may start.
    pub prerequisite_ids: BTreeSet<JobId>,
    pub state: JobState,
}

impl CompilationJob {
    pub fn compile(id: JobId, source_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self::new(id, JobKind::Compile, source_path.into(), output_path.into())
    }

    pub fn precompiled_header(
        id: JobId,
        header_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self::new(id, JobKind::PrecompiledHeader, header_path.into(), output_path.into())
    }

    fn new(id: JobId, kind: JobKind, source_path: PathBuf, output_path: PathBuf) -> Self {
        Self {
            id,
            kind,
            source_path,
            output_path,
            prerequisite_ids: BTreeSet::new(),
            state: JobState::Pending,
        }
    }

    pub fn with_prerequisite(mut self, prerequisite: JobId) -> Self {
        self.prerequisite_ids.insert(prerequisite);
        self
    }
}

/// Terminal result of one job in a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Done,
    Failed {
        reason: String,
    },
    /// A prerequisite (directly or transitively) failed, so this job never ran.
    SkippedDueToDependency {
        prerequisite: JobId,
    },
    /// Still running when the watchdog stopped the run.
    Abandoned {
        #[serde(with = "duration_millis")]
        running_for: Duration,
    },
    /// Never started because the run stopped first.
    NotStarted,
}

impl JobOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, JobOutcome::Done)
    }
}

/// Error returned by a [`JobExecutor`] for one job.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct JobError {
    pub reason: String,
}

impl JobError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Runs one job. Called concurrently from worker threads.
pub trait JobExecutor: Send + Sync {
    fn execute(&self, job: &CompilationJob) -> Result<(), JobError>;
}

impl<F> JobExecutor for F
where
    F: Fn(&CompilationJob) -> Result<(), JobError> + Send + Sync,
{
    fn execute(&self, job: &CompilationJob) -> Result<(), JobError> {
        self(job)
    }
}

pub(crate) mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }
}
