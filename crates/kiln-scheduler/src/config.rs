use std::time::Duration;

/// Run-level ceiling applied when none is configured.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Worker pool size and watchdog budget for one orchestrator run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Requested worker count, clamped to `min_workers..=max_workers`.
    pub worker_count: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Wall-clock budget for the whole run.
    pub timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            worker_count: available,
            min_workers: 1,
            max_workers: 64,
            timeout: DEFAULT_RUN_TIMEOUT,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Number of workers to start for `job_count` jobs.
    ///
    /// Never more threads than jobs, never fewer than one.
    pub fn effective_workers(&self, job_count: usize) -> usize {
        let min = self.min_workers.max(1);
        let max = self.max_workers.max(min);
        self.worker_count.clamp(min, max).min(job_count.max(1))
    }
}
