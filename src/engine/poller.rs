//! Long-poll wrapper for asynchronous backend jobs.
//!
//! An operation either completes immediately or hands back a job id to be
//! polled until the service reports it finished. The poller never touches
//! announcer state; callers map its outcome.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{BackendResponse, BackendResult, JobStatus, Refusal};
use crate::types::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome<T> {
    Completed(T),
    /// Structured non-success, either on submission or while polling.
    Refused(Refusal),
    NetworkFailure(TransportError),
    /// The job never finished within the poll budget.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct JobPoller {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for JobPoller {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            interval: Duration::from_secs(5),
        }
    }
}

impl JobPoller {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self { max_attempts, interval }
    }

    /// Resolve `initial` into a terminal outcome, polling with `poll` when
    /// it is a pending job.
    pub async fn run<T, F, Fut>(&self, initial: BackendResult<T>, mut poll: F) -> JobOutcome<T>
    where
        T: Default,
        F: FnMut(Uuid) -> Fut,
        Fut: Future<Output = BackendResult<JobStatus<T>>>,
    {
        let job_id = match initial {
            Err(e) => return JobOutcome::NetworkFailure(e),
            Ok(BackendResponse::Success(result)) => return JobOutcome::Completed(result),
            Ok(BackendResponse::Pending(job_id)) => job_id,
            Ok(other) => return Self::refused(&other),
        };

        debug!(job_id = %job_id, "Backend job pending, polling for completion");

        for attempt in 1..=self.max_attempts {
            tokio::time::sleep(self.interval).await;

            match poll(job_id).await {
                Err(e) => {
                    warn!(job_id = %job_id, attempt, error = %e, "Job poll failed");
                    return JobOutcome::NetworkFailure(e);
                }
                Ok(BackendResponse::Success(status)) if status.finished => {
                    debug!(job_id = %job_id, attempt, "Backend job finished");
                    return JobOutcome::Completed(status.result.unwrap_or_default());
                }
                Ok(BackendResponse::Success(_)) | Ok(BackendResponse::Pending(_)) => {}
                Ok(other) => return Self::refused(&other),
            }
        }

        warn!(job_id = %job_id, attempts = self.max_attempts, "Backend job did not finish in time");
        JobOutcome::Exhausted
    }

    fn refused<T, U>(response: &BackendResponse<U>) -> JobOutcome<T> {
        match response.refusal() {
            Some(refusal) => JobOutcome::Refused(refusal),
            None => JobOutcome::Exhausted,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
