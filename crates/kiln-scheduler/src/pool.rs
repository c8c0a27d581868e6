use rayon::ThreadPool;

/// The threads a run executes jobs on.
pub(crate) enum WorkerPool {
    Rayon(ThreadPool),
    /// No worker thread could be created; jobs run on the calling thread.
    /// The watchdog is only consulted between jobs, so a hung job blocks
    /// the run until it returns.
    Inline,
}

impl WorkerPool {
    pub(crate) fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        match self {
            WorkerPool::Rayon(pool) => pool.spawn(job),
            WorkerPool::Inline => job(),
        }
    }

    pub(crate) fn runs_inline(&self) -> bool {
        matches!(self, WorkerPool::Inline)
    }

    pub(crate) fn threads(&self) -> usize {
        match self {
            WorkerPool::Rayon(pool) => pool.current_num_threads(),
            WorkerPool::Inline => 0,
        }
    }
}

/// Builds a pool of `threads` workers named `{prefix}-{idx}`.
///
/// Thread creation can fail under low process limits; the pool then halves
/// until it succeeds, and as a last resort falls back to inline execution.
pub(crate) fn build_worker_pool(prefix: &'static str, threads: usize) -> WorkerPool {
    let mut threads = threads.max(1);
    loop {
        match rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |idx| format!("{prefix}-{idx}"))
            .build()
        {
            Ok(pool) => return WorkerPool::Rayon(pool),
            Err(err) if threads > 1 => {
                tracing::debug!(
                    target: "kiln.scheduler",
                    threads,
                    error = %err,
                    "failed to start worker pool; retrying with fewer threads"
                );
                threads = (threads / 2).max(1);
            }
            Err(err) => {
                tracing::warn!(
                    target: "kiln.scheduler",
                    error = %err,
                    "failed to start any worker thread; running jobs inline"
                );
                return WorkerPool::Inline;
            }
        }
    }
}
