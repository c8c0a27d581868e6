use kiln_cache::Digest;
use kiln_scheduler::{JobId, JobKind, JobOutcome, RunStatus, WatchdogReport};
use serde::Serialize;
use std::path::PathBuf;

/// What one `build` call did.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub build_key: String,
    pub target_id: String,
    /// Fingerprint matched a successful build and the output was present: nothing ran.
    pub skipped: bool,
    pub fingerprint: Digest,
    /// Some input could not be read; the build can never be skipped.
    pub fingerprint_incomplete: bool,
    pub jobs: Vec<JobReport>,
    /// Translation units whose object was already up to date.
    pub up_to_date: usize,
    pub status: RunStatus,
    pub artifact: Option<ArtifactReport>,
    /// Set when linking failed after every compile job succeeded.
    pub link_error: Option<String>,
    pub watchdog: Option<WatchdogReport>,
    pub elapsed_ms: u64,
}

impl BuildReport {
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    /// Number of jobs that actually ran to completion.
    pub fn compiled(&self) -> usize {
        self.jobs.iter().filter(|job| job.outcome.is_done()).count()
    }

    pub fn failed_jobs(&self) -> impl Iterator<Item = &JobReport> {
        self.jobs.iter().filter(|job| !job.outcome.is_done())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub id: JobId,
    pub kind: JobKind,
    pub source: PathBuf,
    #[serde(flatten)]
    pub outcome: JobOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactReport {
    pub path: PathBuf,
    pub source: ArtifactSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSource {
    /// Already present at the output path.
    UpToDate,
    /// Copied from the artifact cache.
    Cache,
    /// Produced by the linker in this run.
    Linked,
}
