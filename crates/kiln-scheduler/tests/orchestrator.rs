use kiln_scheduler::{
    CompilationJob, CompilationOrchestrator, JobError, JobExecutor, JobId, JobOutcome,
    OrchestratorConfig, RunStatus,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn job(id: u32) -> CompilationJob {
    CompilationJob::compile(JobId(id), format!("src/{id}.cpp"), format!("obj/{id}.o"))
}

fn orchestrator(workers: usize, timeout: Duration) -> CompilationOrchestrator {
    CompilationOrchestrator::new(
        OrchestratorConfig::default()
            .with_worker_count(workers)
            .with_timeout(timeout),
    )
}

/// Records execution and flags any job that starts before its prerequisites finished.
struct CheckingExecutor {
    prerequisites: HashMap<JobId, Vec<JobId>>,
    finished: Mutex<HashSet<JobId>>,
    violations: Mutex<Vec<JobId>>,
    executed: AtomicUsize,
    failing: HashSet<JobId>,
}

impl CheckingExecutor {
    fn new(jobs: &[CompilationJob], failing: impl IntoIterator<Item = u32>) -> Self {
        Self {
            prerequisites: jobs
                .iter()
                .map(|job| (job.id, job.prerequisite_ids.iter().copied().collect()))
                .collect(),
            finished: Mutex::new(HashSet::new()),
            violations: Mutex::new(Vec::new()),
            executed: AtomicUsize::new(0),
            failing: failing.into_iter().map(JobId).collect(),
        }
    }
}

impl JobExecutor for CheckingExecutor {
    fn execute(&self, job: &CompilationJob) -> Result<(), JobError> {
        {
            let finished = self.finished.lock();
            if !self.prerequisites[&job.id].iter().all(|p| finished.contains(p)) {
                self.violations.lock().push(job.id);
            }
        }
        self.executed.fetch_add(1, Ordering::SeqCst);
        std::thread::yield_now();
        if self.failing.contains(&job.id) {
            return Err(JobError::new(format!("{} does not compile", job.source_path.display())));
        }
        self.finished.lock().insert(job.id);
        Ok(())
    }
}

#[test]
fn precompiled_header_runs_before_every_translation_unit() {
    let pch = CompilationJob::precompiled_header(JobId(0), "include/pch.h", "obj/pch.h.pch");
    let mut jobs = vec![pch];
    jobs.extend((1..=12).map(|id| job(id).with_prerequisite(JobId(0))));

    let executor = Arc::new(CheckingExecutor::new(&jobs, []));
    let result = orchestrator(4, Duration::from_secs(30))
        .run(jobs, executor.clone())
        .unwrap();

    assert_eq!(result.overall, RunStatus::Success);
    assert_eq!(result.done_count(), 13);
    assert!(executor.violations.lock().is_empty());
}

#[test]
fn failure_skips_dependents_but_not_independent_jobs() {
    // 1 <- 2 <- 3, and 4, 5 independent.
    let jobs = vec![
        job(1),
        job(2).with_prerequisite(JobId(1)),
        job(3).with_prerequisite(JobId(2)),
        job(4),
        job(5),
    ];
    let executor = Arc::new(CheckingExecutor::new(&jobs, [1]));
    let result = orchestrator(2, Duration::from_secs(30))
        .run(jobs, executor.clone())
        .unwrap();

    assert_eq!(result.overall, RunStatus::Failure);
    assert_eq!(result.overall.exit_code(), 1);
    assert!(matches!(result.outcome(JobId(1)), Some(JobOutcome::Failed { .. })));
    assert_eq!(
        result.outcome(JobId(2)),
        Some(&JobOutcome::SkippedDueToDependency {
            prerequisite: JobId(1)
        })
    );
    assert_eq!(
        result.outcome(JobId(3)),
        Some(&JobOutcome::SkippedDueToDependency {
            prerequisite: JobId(1)
        })
    );
    assert_eq!(result.outcome(JobId(4)), Some(&JobOutcome::Done));
    assert_eq!(result.outcome(JobId(5)), Some(&JobOutcome::Done));
    assert_eq!(executor.executed.load(Ordering::SeqCst), 3);
    assert_eq!(
        result.unfinished().collect::<Vec<_>>(),
        vec![JobId(1), JobId(2), JobId(3)]
    );
}

#[test]
fn watchdog_stops_the_run_and_reports_in_flight_jobs() {
    let executor: Arc<dyn JobExecutor> = Arc::new(|job: &CompilationJob| -> Result<(), JobError> {
        if job.id == JobId(1) {
            std::thread::sleep(Duration::from_secs(2));
        }
        Ok(())
    });
    let jobs = vec![job(1), job(2).with_prerequisite(JobId(1)), job(3)];

    let start = Instant::now();
    let result = orchestrator(2, Duration::from_millis(150))
        .run(jobs, executor)
        .unwrap();

    assert!(start.elapsed() < Duration::from_millis(1500));
    assert_eq!(result.overall, RunStatus::WatchdogTimeout);
    assert_eq!(result.overall.exit_code(), 2);
    assert!(matches!(result.outcome(JobId(1)), Some(JobOutcome::Abandoned { .. })));
    assert_eq!(result.outcome(JobId(2)), Some(&JobOutcome::NotStarted));
    assert_eq!(result.outcome(JobId(3)), Some(&JobOutcome::Done));

    let report = result.watchdog.expect("watchdog report");
    assert_eq!(report.in_flight.len(), 1);
    assert_eq!(report.in_flight[0].id, JobId(1));
    assert!(report.in_flight[0].running_for >= Duration::from_millis(100));
    assert_eq!(report.not_started, 1);
}

#[test]
fn single_worker_runs_everything() {
    let jobs: Vec<_> = (0..20)
        .map(|id| {
            let job = job(id);
            if id > 0 {
                job.with_prerequisite(JobId(id - 1))
            } else {
                job
            }
        })
        .collect();
    let executor = Arc::new(CheckingExecutor::new(&jobs, []));
    let result = orchestrator(1, Duration::from_secs(30))
        .run(jobs, executor.clone())
        .unwrap();

    assert_eq!(result.overall, RunStatus::Success);
    assert!(executor.violations.lock().is_empty());
}

mod stress {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prerequisites_always_finish_first(
            edges in prop::collection::vec(prop::collection::vec(any::<prop::sample::Index>(), 0..4), 1..40),
            workers in 1usize..9,
            fail_mask in prop::collection::vec(prop::bool::weighted(0.1), 40),
        ) {
            // Job i may only depend on jobs < i, which keeps the graph acyclic.
            let jobs: Vec<CompilationJob> = edges
                .iter()
                .enumerate()
                .map(|(i, deps)| {
                    let mut job = job(i as u32);
                    if i > 0 {
                        for dep in deps {
                            job = job.with_prerequisite(JobId(dep.index(i) as u32));
                        }
                    }
                    job
                })
                .collect();
            let failing: Vec<u32> = (0..jobs.len() as u32).filter(|&i| fail_mask[i as usize]).collect();

            let executor = Arc::new(CheckingExecutor::new(&jobs, failing.iter().copied()));
            let result = orchestrator(workers, Duration::from_secs(60))
                .run(jobs.clone(), executor.clone())
                .unwrap();

            prop_assert!(executor.violations.lock().is_empty());
            prop_assert_eq!(result.per_job.len(), jobs.len());
            let expected = if failing.is_empty() { RunStatus::Success } else { RunStatus::Failure };
            prop_assert_eq!(result.overall, expected);

            for job in &jobs {
                let outcome = result.outcome(job.id).unwrap();
                if failing.contains(&job.id.0) {
                    let is_failed = matches!(outcome, JobOutcome::Failed { .. } | JobOutcome::SkippedDueToDependency { .. });
                    prop_assert!(is_failed);
                } else {
                    let blocked = matches!(outcome, JobOutcome::SkippedDueToDependency { .. });
                    prop_assert!(outcome.is_done() || blocked, "{:?}", outcome);
                }
            }
        }
    }
}
