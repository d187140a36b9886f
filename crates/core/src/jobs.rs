//! Job publishing seam: how the correlation engine hands raised
//! integration jobs to the dispatch side.
//!
//! The engine accepts an `Arc<dyn JobPublisher>`; production wires a
//! JetStream publisher, tests use [`CaptureJobs`].

use crate::error::{TrackerError, TrackerResult};
use crate::types::{IntegrationJob, SinkKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Publishes integration jobs to the job queue. Publishing the same job
/// twice must be harmless: implementations de-duplicate on
/// [`IntegrationJob::idempotency_key`] where the transport allows it.
#[async_trait]
pub trait JobPublisher: Send + Sync {
    async fn publish(&self, job: &IntegrationJob) -> TrackerResult<()>;
}

/// Publisher that drops everything (dispatch disabled).
pub struct NoOpPublisher;

#[async_trait]
impl JobPublisher for NoOpPublisher {
    async fn publish(&self, _job: &IntegrationJob) -> TrackerResult<()> {
        Ok(())
    }
}

/// In-memory publisher that records jobs for tests.
#[derive(Default)]
pub struct CaptureJobs {
    jobs: Mutex<Vec<IntegrationJob>>,
    failures: AtomicU32,
}

impl CaptureJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<IntegrationJob> {
        self.jobs.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn count_kind(&self, kind: SinkKind) -> usize {
        self.jobs.lock().iter().filter(|j| j.sink_kind == kind).count()
    }

    pub fn clear(&self) {
        self.jobs.lock().clear();
    }

    /// Reject the next `n` publishes with a broker error.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobPublisher for CaptureJobs {
    async fn publish(&self, job: &IntegrationJob) -> TrackerResult<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TrackerError::Broker("publish rejected".into()));
        }
        self.jobs.lock().push(*job);
        Ok(())
    }
}

/// Convenience: a publisher that discards jobs.
pub fn noop_publisher() -> Arc<dyn JobPublisher> {
    Arc::new(NoOpPublisher)
}

/// Convenience: a capture publisher for tests.
pub fn capture_jobs() -> Arc<CaptureJobs> {
    Arc::new(CaptureJobs::new())
}
