use crate::config::OrchestratorConfig;
use crate::job::{duration_millis, CompilationJob, JobError, JobExecutor, JobId, JobOutcome, JobState};
use crate::pool::{build_worker_pool, WorkerPool};
use crate::watchdog::{InFlightJob, Watchdog, WatchdogReport};
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Rejected job sets. Nothing runs when validation fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("duplicate job id {0}")]
    DuplicateJobId(JobId),

    #[error("{job} depends on unknown job {prerequisite}")]
    UnknownPrerequisite { job: JobId, prerequisite: JobId },

    #[error("dependency cycle among jobs {jobs:?}")]
    DependencyCycle { jobs: Vec<JobId> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure,
    WatchdogTimeout,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Failure => 1,
            RunStatus::WatchdogTimeout => 2,
        }
    }

    /// The more severe of two statuses.
    pub fn worst(self, other: RunStatus) -> RunStatus {
        if other.exit_code() > self.exit_code() {
            other
        } else {
            self
        }
    }
}

/// Outcome of one orchestrator run.
#[derive(Clone, Debug, Serialize)]
pub struct RunResult {
    pub per_job: BTreeMap<JobId, JobOutcome>,
    pub overall: RunStatus,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
    /// Present when the watchdog stopped the run.
    pub watchdog: Option<WatchdogReport>,
}

impl RunResult {
    pub fn outcome(&self, id: JobId) -> Option<&JobOutcome> {
        self.per_job.get(&id)
    }

    pub fn done_count(&self) -> usize {
        self.per_job.values().filter(|outcome| outcome.is_done()).count()
    }

    /// Jobs that did not finish successfully, whatever the reason.
    pub fn unfinished(&self) -> impl Iterator<Item = JobId> + '_ {
        self.per_job
            .iter()
            .filter(|(_, outcome)| !outcome.is_done())
            .map(|(id, _)| *id)
    }
}

enum WorkerEvent {
    Started { index: usize, at: Instant },
    Finished { index: usize, result: Result<(), JobError> },
}

/// Runs a set of compilation jobs on a worker pool, honoring prerequisites,
/// isolating failures, and bounded by a run-level watchdog.
#[derive(Debug, Clone, Default)]
pub struct CompilationOrchestrator {
    config: OrchestratorConfig,
}

impl CompilationOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Runs `jobs` to completion, failure or watchdog expiry.
    ///
    /// A job starts only after every prerequisite is `Done`. A failed job's
    /// dependents are reported as [`JobOutcome::SkippedDueToDependency`];
    /// independent jobs keep running. Panics inside `executor` become job
    /// failures.
    pub fn run(
        &self,
        jobs: Vec<CompilationJob>,
        executor: Arc<dyn JobExecutor>,
    ) -> Result<RunResult, OrchestratorError> {
        self.run_with_pool(jobs, executor, |workers| {
            build_worker_pool("kiln-worker", workers)
        })
    }

    fn run_with_pool(
        &self,
        jobs: Vec<CompilationJob>,
        executor: Arc<dyn JobExecutor>,
        make_pool: impl FnOnce(usize) -> WorkerPool,
    ) -> Result<RunResult, OrchestratorError> {
        let watchdog = Watchdog::arm(self.config.timeout);
        let graph = JobGraph::build(jobs)?;
        if graph.jobs.is_empty() {
            tracing::debug!(target: "kiln.scheduler", "no jobs to run");
            return Ok(RunResult {
                per_job: BTreeMap::new(),
                overall: RunStatus::Success,
                elapsed: watchdog.elapsed(),
                watchdog: None,
            });
        }

        let workers = self.config.effective_workers(graph.jobs.len());
        let pool = make_pool(workers);
        tracing::info!(
            target: "kiln.scheduler",
            jobs = graph.jobs.len(),
            workers = pool.threads(),
            timeout_ms = self.config.timeout.as_millis() as u64,
            "starting compilation run"
        );

        let (tx, rx) = mpsc::channel::<WorkerEvent>();
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut run = RunState::new(graph);
        let mut tripped = false;

        loop {
            while let Some(index) = run.ready.pop_front() {
                // Inline jobs block this loop, so the deadline is checked between them.
                if pool.runs_inline() && watchdog.expired() {
                    run.ready.push_front(index);
                    break;
                }
                let job = run.dispatch(index);
                let tx = tx.clone();
                let executor = Arc::clone(&executor);
                let cancelled = Arc::clone(&cancelled);
                pool.spawn(move || {
                    // Queued work left over from a stopped run is dropped.
                    if cancelled.load(Ordering::Acquire) {
                        return;
                    }
                    let _ = tx.send(WorkerEvent::Started {
                        index,
                        at: Instant::now(),
                    });
                    let result = catch_unwind(AssertUnwindSafe(|| executor.execute(&job)))
                        .unwrap_or_else(|payload| {
                            Err(JobError::new(format!(
                                "job panicked: {}",
                                panic_message(payload.as_ref())
                            )))
                        });
                    let _ = tx.send(WorkerEvent::Finished { index, result });
                });
            }

            if run.outstanding == 0 && run.ready.is_empty() {
                break;
            }

            if watchdog.expired() {
                // Account for anything that finished right at the deadline.
                while let Ok(event) = rx.try_recv() {
                    run.apply(event);
                }
                if run.outstanding == 0 && run.ready.is_empty() {
                    break;
                }
                cancelled.store(true, Ordering::Release);
                tripped = true;
                break;
            }

            match rx.recv_timeout(watchdog.next_wait()) {
                Ok(event) => run.apply(event),
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        let report = tripped.then(|| run.abandon(&watchdog));
        if let Some(report) = &report {
            report.log();
        }
        let result = run.into_result(watchdog.elapsed(), report);

        tracing::info!(
            target: "kiln.scheduler",
            status = ?result.overall,
            done = result.done_count(),
            jobs = result.per_job.len(),
            elapsed_ms = result.elapsed.as_millis() as u64,
            "compilation run finished"
        );
        Ok(result)
    }
}

/// Validated jobs plus their dependency edges, by index.
struct JobGraph {
    jobs: Vec<CompilationJob>,
    prerequisite_counts: Vec<usize>,
    dependents: Vec<Vec<usize>>,
}

impl JobGraph {
    fn build(mut jobs: Vec<CompilationJob>) -> Result<Self, OrchestratorError> {
        let mut index_of = HashMap::with_capacity(jobs.len());
        for (index, job) in jobs.iter_mut().enumerate() {
            if index_of.insert(job.id, index).is_some() {
                return Err(OrchestratorError::DuplicateJobId(job.id));
            }
            job.state = JobState::Pending;
        }

        let mut prerequisite_counts = vec![0; jobs.len()];
        let mut dependents = vec![Vec::new(); jobs.len()];
        for (index, job) in jobs.iter().enumerate() {
            for prerequisite in &job.prerequisite_ids {
                let Some(&pre_index) = index_of.get(prerequisite) else {
                    return Err(OrchestratorError::UnknownPrerequisite {
                        job: job.id,
                        prerequisite: *prerequisite,
                    });
                };
                prerequisite_counts[index] += 1;
                dependents[pre_index].push(index);
            }
        }

        // Kahn's algorithm: whatever can't be ordered sits on a cycle (or behind one).
        let mut remaining = prerequisite_counts.clone();
        let mut queue: VecDeque<usize> = (0..jobs.len()).filter(|&i| remaining[i] == 0).collect();
        let mut ordered = 0usize;
        while let Some(index) = queue.pop_front() {
            ordered += 1;
            for &dependent in &dependents[index] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }
        if ordered < jobs.len() {
            let mut cyclic: Vec<JobId> = (0..jobs.len())
                .filter(|&i| remaining[i] > 0)
                .map(|i| jobs[i].id)
                .collect();
            cyclic.sort();
            return Err(OrchestratorError::DependencyCycle { jobs: cyclic });
        }

        Ok(Self {
            jobs,
            prerequisite_counts,
            dependents,
        })
    }
}

/// Coordinator-side bookkeeping. Only the coordinator thread touches it.
struct RunState {
    jobs: Vec<CompilationJob>,
    waiting_on: Vec<usize>,
    dependents: Vec<Vec<usize>>,
    outcomes: Vec<Option<JobOutcome>>,
    started_at: HashMap<usize, Instant>,
    ready: VecDeque<usize>,
    /// Dispatched to the pool and not yet finished.
    outstanding: usize,
}

impl RunState {
    fn new(graph: JobGraph) -> Self {
        let ready = (0..graph.jobs.len())
            .filter(|&i| graph.prerequisite_counts[i] == 0)
            .collect();
        let outcomes = vec![None; graph.jobs.len()];
        Self {
            jobs: graph.jobs,
            waiting_on: graph.prerequisite_counts,
            dependents: graph.dependents,
            outcomes,
            started_at: HashMap::new(),
            ready,
            outstanding: 0,
        }
    }

    fn dispatch(&mut self, index: usize) -> CompilationJob {
        debug_assert_eq!(self.waiting_on[index], 0);
        self.outstanding += 1;
        self.jobs[index].clone()
    }

    fn apply(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Started { index, at } => {
                self.jobs[index].state = JobState::Running;
                self.started_at.insert(index, at);
                tracing::debug!(
                    target: "kiln.scheduler",
                    job = %self.jobs[index].id,
                    source = %self.jobs[index].source_path.display(),
                    "job started"
                );
            }
            WorkerEvent::Finished { index, result } => {
                self.outstanding = self.outstanding.saturating_sub(1);
                self.started_at.remove(&index);
                match result {
                    Ok(()) => self.complete(index),
                    Err(err) => self.fail(index, err),
                }
            }
        }
    }

    fn complete(&mut self, index: usize) {
        self.jobs[index].state = JobState::Done;
        self.outcomes[index] = Some(JobOutcome::Done);
        tracing::debug!(
            target: "kiln.scheduler",
            job = %self.jobs[index].id,
            "job done"
        );
        for &dependent in &self.dependents[index] {
            self.waiting_on[dependent] -= 1;
            if self.waiting_on[dependent] == 0 && self.outcomes[dependent].is_none() {
                self.ready.push_back(dependent);
            }
        }
    }

    fn fail(&mut self, index: usize, err: JobError) {
        let failed = self.jobs[index].id;
        tracing::warn!(
            target: "kiln.scheduler",
            job = %failed,
            source = %self.jobs[index].source_path.display(),
            error = %err,
            "job failed"
        );
        self.jobs[index].state = JobState::Failed;
        self.outcomes[index] = Some(JobOutcome::Failed { reason: err.reason });

        let mut stack: Vec<usize> = self.dependents[index].clone();
        while let Some(dependent) = stack.pop() {
            if self.outcomes[dependent].is_some() {
                continue;
            }
            self.outcomes[dependent] = Some(JobOutcome::SkippedDueToDependency {
                prerequisite: failed,
            });
            stack.extend(self.dependents[dependent].iter().copied());
        }
    }

    /// Marks running jobs abandoned and the rest not started.
    fn abandon(&mut self, watchdog: &Watchdog) -> WatchdogReport {
        let now = Instant::now();
        let mut in_flight: Vec<InFlightJob> = self
            .started_at
            .iter()
            .map(|(&index, &started)| {
                let running_for = now.saturating_duration_since(started);
                self.outcomes[index] = Some(JobOutcome::Abandoned { running_for });
                InFlightJob {
                    id: self.jobs[index].id,
                    source_path: self.jobs[index].source_path.clone(),
                    running_for,
                }
            })
            .collect();
        in_flight.sort_by(|a, b| b.running_for.cmp(&a.running_for).then(a.id.cmp(&b.id)));

        let mut not_started = 0;
        for outcome in self.outcomes.iter_mut().filter(|outcome| outcome.is_none()) {
            *outcome = Some(JobOutcome::NotStarted);
            not_started += 1;
        }

        WatchdogReport {
            timeout: watchdog.timeout(),
            elapsed: watchdog.elapsed(),
            in_flight,
            not_started,
        }
    }

    fn into_result(self, elapsed: Duration, watchdog: Option<WatchdogReport>) -> RunResult {
        let per_job: BTreeMap<JobId, JobOutcome> = self
            .jobs
            .iter()
            .zip(self.outcomes)
            .map(|(job, outcome)| (job.id, outcome.unwrap_or(JobOutcome::NotStarted)))
            .collect();

        let overall = if watchdog.is_some() {
            RunStatus::WatchdogTimeout
        } else if per_job.values().all(JobOutcome::is_done) {
            RunStatus::Success
        } else {
            RunStatus::Failure
        };

        RunResult {
            per_job,
            overall,
            elapsed,
            watchdog,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    payload
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}
