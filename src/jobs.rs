//! Single-flight job controller.
//!
//! At most one job per [`JobKind`] runs at a time. A trigger while a job of
//! that kind is running is rejected with the running job's start time; it is
//! never queued and never waits. Started jobs run on a detached tokio task and
//! release their slot from a drop guard, so an error or a panic in the job body
//! still frees the kind for the next trigger. The job's result is logged and
//! also handed back through its [`JoinHandle`] for callers that wait on it.
//!
//! State lives in the controller value, not in globals: clones share slots,
//! separate [`JobController::new`] instances do not.

use crate::error::Result;
use crate::models::{JobKind, JobRuntimeState, TriggerSource};
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Result of [`JobController::trigger`].
#[derive(Debug)]
pub enum TriggerOutcome<T> {
    /// The job was spawned. Dropping the handle detaches it.
    Started {
        started_at: DateTime<Utc>,
        handle: JoinHandle<Result<T>>,
    },
    /// A job of the same kind is still running.
    AlreadyRunning { running_since: Option<DateTime<Utc>> },
}

impl<T> TriggerOutcome<T> {
    #[cfg(test)]
    pub fn started(&self) -> bool {
        matches!(self, TriggerOutcome::Started { .. })
    }
}

type Slot = Arc<Mutex<JobRuntimeState>>;

#[derive(Debug, Clone, Default)]
pub struct JobController {
    scrape: Slot,
    analysis: Slot,
}

fn lock(slot: &Mutex<JobRuntimeState>) -> MutexGuard<'_, JobRuntimeState> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clears a slot when the job task ends, however it ends.
struct RunningGuard {
    slot: Slot,
    kind: JobKind,
    source: TriggerSource,
    t0: Instant,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        *lock(&self.slot) = JobRuntimeState::default();
        info!(
            kind = %self.kind,
            source = %self.source,
            elapsed_ms = self.t0.elapsed().as_millis() as u64,
            "Job lock released"
        );
    }
}

impl JobController {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, kind: JobKind) -> &Slot {
        match kind {
            JobKind::Scrape => &self.scrape,
            JobKind::Analysis => &self.analysis,
        }
    }

    /// Start `body` as the running job of `kind`, unless one is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn trigger<Fut, T>(&self, kind: JobKind, source: TriggerSource, body: Fut) -> TriggerOutcome<T>
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: fmt::Debug + Send + 'static,
    {
        let started_at = {
            let mut state = lock(self.slot(kind));
            if state.running {
                info!(%kind, %source, running_since = ?state.started_at, "Job already running; trigger rejected");
                return TriggerOutcome::AlreadyRunning {
                    running_since: state.started_at,
                };
            }
            let now = Utc::now();
            *state = JobRuntimeState {
                running: true,
                started_at: Some(now),
            };
            now
        };
        info!(%kind, %source, %started_at, "Job started");

        let guard = RunningGuard {
            slot: Arc::clone(self.slot(kind)),
            kind,
            source,
            t0: Instant::now(),
        };
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let result = body.await;
            match &result {
                Ok(summary) => info!(%kind, %source, ?summary, "Job finished"),
                Err(e) => error!(%kind, %source, error = %e, "Job failed"),
            }
            result
        });

        TriggerOutcome::Started { started_at, handle }
    }

    pub fn runtime_state(&self, kind: JobKind) -> JobRuntimeState {
        *lock(self.slot(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use tokio::sync::oneshot;

    /// A job body that runs until `release` fires.
    fn held_job() -> (oneshot::Sender<()>, impl Future<Output = Result<&'static str>> + Send + 'static) {
        let (tx, rx) = oneshot::channel::<()>();
        (tx, async move {
            let _ = rx.await;
            Ok("done")
        })
    }

    fn handle_of<T: fmt::Debug>(outcome: TriggerOutcome<T>) -> JoinHandle<Result<T>> {
        match outcome {
            TriggerOutcome::Started { handle, .. } => handle,
            other => panic!("expected Started, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_second_trigger_rejected_until_first_finishes() {
        let jobs = JobController::new();
        let (release, body) = held_job();

        let first = jobs.trigger(JobKind::Scrape, TriggerSource::Manual, body);
        let TriggerOutcome::Started { started_at, handle } = first else {
            panic!("first trigger should start");
        };
        assert!(jobs.runtime_state(JobKind::Scrape).running);

        let (_unused, body2) = held_job();
        match jobs.trigger(JobKind::Scrape, TriggerSource::Cron, body2) {
            TriggerOutcome::AlreadyRunning { running_since } => assert_eq!(running_since, Some(started_at)),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }

        release.send(()).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), "done");
        assert_eq!(jobs.runtime_state(JobKind::Scrape), JobRuntimeState::default());

        let third = jobs.trigger(JobKind::Scrape, TriggerSource::Manual, async { Ok(()) });
        assert!(third.started());
        handle_of(third).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_job_releases_lock() {
        let jobs = JobController::new();
        let outcome = jobs.trigger(JobKind::Analysis, TriggerSource::Manual, async {
            Err::<(), _>(PipelineError::Persistence("store down".to_string()))
        });
        let result = handle_of(outcome).await.unwrap();
        assert!(matches!(result, Err(PipelineError::Persistence(_))));
        assert!(!jobs.runtime_state(JobKind::Analysis).running);
    }

    #[tokio::test]
    async fn test_panicking_job_releases_lock() {
        let jobs = JobController::new();
        let outcome = jobs.trigger(JobKind::Analysis, TriggerSource::Manual, async {
            if std::hint::black_box(true) {
                panic!("job body blew up");
            }
            Ok(())
        });
        assert!(handle_of(outcome).await.unwrap_err().is_panic());
        assert_eq!(jobs.runtime_state(JobKind::Analysis), JobRuntimeState::default());
    }

    #[tokio::test]
    async fn test_kinds_are_independent() {
        let jobs = JobController::new();
        let (release, body) = held_job();
        let scrape = handle_of(jobs.trigger(JobKind::Scrape, TriggerSource::Cron, body));

        let analysis = jobs.trigger(JobKind::Analysis, TriggerSource::Cron, async { Ok(1) });
        assert!(analysis.started());
        assert_eq!(handle_of(analysis).await.unwrap().unwrap(), 1);

        assert!(jobs.runtime_state(JobKind::Scrape).running);
        release.send(()).unwrap();
        scrape.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_clones_share_state_instances_do_not() {
        let jobs = JobController::new();
        let clone = jobs.clone();
        let other = JobController::new();
        let (release, body) = held_job();
        let handle = handle_of(jobs.trigger(JobKind::Scrape, TriggerSource::Manual, body));

        assert!(clone.runtime_state(JobKind::Scrape).running);
        assert!(!other.runtime_state(JobKind::Scrape).running);
        assert!(other.trigger(JobKind::Scrape, TriggerSource::Manual, async { Ok(()) }).started());

        release.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
