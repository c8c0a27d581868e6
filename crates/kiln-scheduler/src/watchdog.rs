use crate::job::{duration_millis, JobId};
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Polling interval of the coordinator loop while waiting for worker messages.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Run-level deadline, armed when a run starts.
///
/// The watchdog never kills worker threads (Rust has no safe way to do that).
/// On expiry the run stops dispatching, reports what was in flight, and
/// returns; still-running toolchain calls finish in the background.
#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    started: Instant,
    timeout: Duration,
}

impl Watchdog {
    pub fn arm(timeout: Duration) -> Self {
        Self {
            started: Instant::now(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// How long the coordinator may block before re-checking the deadline.
    pub(crate) fn next_wait(&self) -> Duration {
        self.remaining().min(POLL_INTERVAL)
    }
}

/// A job that was running when the watchdog tripped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InFlightJob {
    pub id: JobId,
    pub source_path: PathBuf,
    #[serde(with = "duration_millis")]
    pub running_for: Duration,
}

/// Diagnostic dump captured when a run exceeds its budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchdogReport {
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
    /// Longest-running first.
    pub in_flight: Vec<InFlightJob>,
    /// Jobs that never started.
    pub not_started: usize,
}

impl WatchdogReport {
    pub(crate) fn log(&self) {
        tracing::error!(
            target: "kiln.scheduler",
            timeout_ms = self.timeout.as_millis() as u64,
            elapsed_ms = self.elapsed.as_millis() as u64,
            in_flight = self.in_flight.len(),
            not_started = self.not_started,
            "build watchdog expired; stopping run"
        );
        for job in &self.in_flight {
            tracing::error!(
                target: "kiln.scheduler",
                job = %job.id,
                source = %job.source_path.display(),
                running_for_ms = job.running_for.as_millis() as u64,
                "job still running at watchdog expiry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watchdog_expires_after_its_timeout() {
        let watchdog = Watchdog::arm(Duration::from_millis(20));
        assert!(!watchdog.expired());
        assert!(watchdog.next_wait() <= POLL_INTERVAL);

        std::thread::sleep(Duration::from_millis(30));
        assert!(watchdog.expired());
        assert_eq!(watchdog.remaining(), Duration::ZERO);
        assert_eq!(watchdog.next_wait(), Duration::ZERO);
    }

    #[test]
    fn zero_timeout_is_immediately_expired() {
        assert!(Watchdog::arm(Duration::ZERO).expired());
    }
}
