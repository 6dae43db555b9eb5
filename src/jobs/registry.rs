//! Bookkeeping for in-flight runs, one per job at most.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use super::JobId;
use crate::error::ServiceError;

/// Identifies one run of a job; a job accumulates several over its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(pub u64);

impl RunId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        RunId(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

struct RunEntry {
    run_id: RunId,
    done: watch::Receiver<bool>,
    /// The run is about to record its outcome; a new run may take its place.
    settled: bool,
}

type RunMap = Arc<Mutex<HashMap<JobId, RunEntry>>>;

fn lock(runs: &RunMap) -> MutexGuard<'_, HashMap<JobId, RunEntry>> {
    runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Held for the lifetime of a run. Dropping it releases the job and wakes waiters.
pub struct RunTicket {
    job_id: JobId,
    run_id: RunId,
    done: watch::Sender<bool>,
    runs: RunMap,
}

impl RunTicket {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Mark the run as finished with its work. Call before persisting the
    /// outcome: once a client can observe the new status, `register` must
    /// no longer refuse the job.
    pub fn settle(&self) {
        if let Some(entry) = lock(&self.runs).get_mut(&self.job_id) {
            if entry.run_id == self.run_id {
                entry.settled = true;
            }
        }
    }
}

impl Drop for RunTicket {
    fn drop(&mut self) {
        let mut runs = lock(&self.runs);
        if runs.get(&self.job_id).map(|e| e.run_id) == Some(self.run_id) {
            runs.remove(&self.job_id);
        }
        drop(runs);
        let _ = self.done.send(true);
    }
}

#[derive(Default)]
pub struct RunRegistry {
    runs: RunMap,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the job for a new run, refusing if one is in flight. A settled
    /// run is replaced; its ticket then leaves the new entry alone on drop.
    pub fn register(&self, job_id: JobId) -> Result<RunTicket, ServiceError> {
        let mut runs = lock(&self.runs);
        if runs.get(&job_id).is_some_and(|e| !e.settled) {
            return Err(ServiceError::AlreadyRunning(job_id));
        }

        let (tx, rx) = watch::channel(false);
        let run_id = RunId::next();
        runs.insert(
            job_id,
            RunEntry {
                run_id,
                done: rx,
                settled: false,
            },
        );

        tracing::debug!(job_id = %job_id, run_id = run_id.0, "run registered");

        Ok(RunTicket {
            job_id,
            run_id,
            done: tx,
            runs: Arc::clone(&self.runs),
        })
    }

    pub fn is_running(&self, job_id: JobId) -> bool {
        lock(&self.runs).contains_key(&job_id)
    }

    pub fn running_jobs(&self) -> Vec<JobId> {
        let mut jobs: Vec<JobId> = lock(&self.runs).keys().copied().collect();
        jobs.sort();
        jobs
    }

    /// Resolves once the job's current run, if any, has finished.
    pub async fn wait(&self, job_id: JobId) {
        let receiver = lock(&self.runs).get(&job_id).map(|e| e.done.clone());
        if let Some(mut rx) = receiver {
            // A dropped sender also means the run is over.
            let _ = rx.wait_for(|done| *done).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_register_is_rejected() {
        let registry = RunRegistry::new();
        let ticket = registry.register(JobId(7)).unwrap();
        assert!(registry.is_running(JobId(7)));

        let err = registry.register(JobId(7)).err().unwrap();
        assert!(matches!(err, ServiceError::AlreadyRunning(JobId(7))));

        // Other jobs are unaffected.
        let other = registry.register(JobId(8)).unwrap();
        assert_eq!(registry.running_jobs(), vec![JobId(7), JobId(8)]);
        assert_ne!(ticket.run_id(), other.run_id());
    }

    #[test]
    fn test_dropping_ticket_releases_job() {
        let registry = RunRegistry::new();
        let ticket = registry.register(JobId(1)).unwrap();
        drop(ticket);
        assert!(!registry.is_running(JobId(1)));
        assert!(registry.register(JobId(1)).is_ok());
    }

    #[test]
    fn test_settled_run_can_be_replaced() {
        let registry = RunRegistry::new();
        let first = registry.register(JobId(4)).unwrap();
        first.settle();

        let second = registry.register(JobId(4)).unwrap();
        assert_ne!(first.run_id(), second.run_id());

        // The old ticket must not release the new run.
        drop(first);
        assert!(registry.is_running(JobId(4)));
        assert!(matches!(
            registry.register(JobId(4)),
            Err(ServiceError::AlreadyRunning(JobId(4)))
        ));

        drop(second);
        assert!(!registry.is_running(JobId(4)));
    }

    #[tokio::test]
    async fn test_wait_returns_after_release() {
        let registry = Arc::new(RunRegistry::new());
        let ticket = registry.register(JobId(3)).unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.wait(JobId(3)).await })
        };

        tokio::task::yield_now().await;
        drop(ticket);
        waiter.await.unwrap();

        // Waiting on an idle job returns immediately.
        registry.wait(JobId(99)).await;
    }
}
