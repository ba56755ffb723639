//! The queue store abstraction.
//!
//! A [`Backend`] holds jobs in four partitions (waiting, processing, completed, failed) and moves
//! each job between exactly two of them per operation. [`memory::InMemoryBackend`] is provided
//! here; the Redis implementation lives in the `reportq-redis` crate.
//!
//! Backend implementors should run the conformance suite against their implementation, see
//! [`crate::test_suite`].
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{job::JobId, stats::QueueStats};

pub use crate::job::Job;

pub mod memory;
#[doc(hidden)]
pub mod testing;

/// The longest a single [`Backend::claim_next`] call waits, whatever timeout it is given.
pub const MAX_CLAIM_WAIT: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// The default number of completed jobs kept for observability.
pub const DEFAULT_COMPLETED_RETENTION: usize = 100;
/// The default number of failed jobs kept for observability.
pub const DEFAULT_FAILED_RETENTION: usize = 50;

#[async_trait]
pub trait Backend {
    /// Append a new pending job to the waiting partition.
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError>;

    /// Claim the oldest ready job, waiting at most `timeout` for one to arrive.
    ///
    /// Returns `Ok(None)` on timeout. Timeouts above [`MAX_CLAIM_WAIT`] are clamped to it, so
    /// `Duration::MAX` is a valid way to wait indefinitely. Retried jobs whose `retry_at` has passed are promoted to the
    /// back of the waiting partition before claiming.
    async fn claim_next(&self, timeout: Duration) -> Result<Option<Job>, BackendError>;

    /// Move an in-flight job to the completed partition.
    async fn acknowledge(&self, id: &JobId, result: serde_json::Value)
        -> Result<(), BackendError>;

    /// Record a failed attempt of an in-flight job and apply the retry policy.
    async fn fail(&self, id: &JobId, error: ExecutionError) -> Result<FailOutcome, BackendError>;

    /// Fail every in-flight job claimed longer than `visibility_timeout` ago.
    ///
    /// This recovers jobs whose worker died between claim and outcome.
    async fn requeue_stalled(
        &self,
        visibility_timeout: TimeDelta,
    ) -> Result<Vec<JobId>, BackendError>;

    async fn stats(&self) -> Result<QueueStats, BackendError>;

    /// The jobs currently held in a partition, oldest first.
    async fn jobs(&self, partition: Partition) -> Result<Vec<Job>, BackendError>;

    async fn is_healthy(&self) -> bool;
}

/// A job ready to be inserted into a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueuableJob {
    pub job_type: String,
    pub payload: serde_json::Value,
}

impl EnqueuableJob {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
        }
    }

    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job::new(self.job_type, self.payload, now)
    }
}

/// The reason a job attempt failed, as reported to [`Backend::fail`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionError {
    pub error_type: String,
    pub message: String,
}

impl ExecutionError {
    pub const OTHER: &'static str = "other";
    pub const STALLED: &'static str = "stalled";

    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(Self::OTHER, message)
    }

    pub fn stalled(timeout: TimeDelta) -> Self {
        Self::new(
            Self::STALLED,
            format!("visibility timeout exceeded: no outcome reported within {timeout}"),
        )
    }
}

/// The result of [`Backend::fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job went back to waiting and will not be claimed before `retry_at`.
    Retrying {
        attempts: u16,
        retry_at: DateTime<Utc>,
    },
    /// The job reached the attempt ceiling and was moved to the failed partition.
    Failed { attempts: u16 },
}

/// One of the four lifecycle partitions of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    Waiting,
    Processing,
    Completed,
    Failed,
}

impl Partition {
    pub const ALL: [Partition; 4] = [
        Partition::Waiting,
        Partition::Processing,
        Partition::Completed,
        Partition::Failed,
    ];
}

/// How many terminal jobs each backend keeps; the oldest are evicted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub completed: usize,
    pub failed: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            completed: DEFAULT_COMPLETED_RETENTION,
            failed: DEFAULT_FAILED_RETENTION,
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("System in bad state")]
    BadState,
    #[error("Job not found in flight: {0}")]
    JobNotFound(JobId),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}
