//! The job record and its lifecycle.
//!
//! A [`Job`] is created by [`crate::backend::Backend::enqueue`] and is only ever mutated by a
//! backend in response to a claim, acknowledgement, or failure. The transition methods on [`Job`]
//! are shared by every backend implementation so that all of them apply the same state machine:
//!
//! ```text
//! pending -> processing -> completed
//!                       -> pending (retry, same id, attempts + 1)
//!                       -> failed
//! ```
//!
//! `completed` and `failed` are terminal.
use std::fmt::Display;

use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};

use crate::{
    backend::{ExecutionError, FailOutcome},
    retry::{RetryDecision, RetryPolicy},
};

pub mod builder;
pub(crate) mod runner;

const RANDOM_SUFFIX_LEN: usize = 9;

/// The identifier of a job.
///
/// Ids are assigned once at enqueue time in the form `{jobType}-{unixMillis}-{random}` and never
/// change, including across retries.
#[derive(Debug, Eq, PartialEq, Clone, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh id for a job of the given type.
    pub fn generate(job_type: &str, now: DateTime<Utc>) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(RANDOM_SUFFIX_LEN)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect();
        Self(format!("{job_type}-{}-{suffix}", now.timestamp_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The lifecycle state of a job.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A record of a single failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobError {
    /// The attempt that failed, starting at 1.
    pub attempt: u16,
    pub error_type: String,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// One unit of asynchronous work.
///
/// This is also the wire format: each partition of a backend stores the JSON encoding of this
/// type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub attempts: u16,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<JobError>,
}

impl Job {
    /// A freshly enqueued job: `pending` with no attempts.
    pub fn new(
        job_type: impl Into<String>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        let job_type = job_type.into();
        Self {
            id: JobId::generate(&job_type, now),
            job_type,
            payload,
            created_at: now,
            attempts: 0,
            status: JobStatus::Pending,
            processing_started_at: None,
            completed_at: None,
            failed_at: None,
            retry_at: None,
            result: None,
            error: None,
            errors: Vec::new(),
        }
    }

    /// Whether the job may be claimed at `now`.
    ///
    /// Only pending jobs are ready, and a retried job is not ready until its backoff has elapsed.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.retry_at.map_or(true, |retry_at| retry_at <= now)
    }

    /// When the job's current claim started.
    ///
    /// A record that reached the processing partition without its claim being stamped counts from
    /// when it last became claimable.
    pub fn claimed_since(&self) -> DateTime<Utc> {
        self.processing_started_at
            .or(self.retry_at)
            .unwrap_or(self.created_at)
    }

    /// Whether a job in the processing partition has been in flight for longer than `timeout`.
    pub fn is_stalled(&self, timeout: chrono::TimeDelta, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && now - self.claimed_since() > timeout
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.processing_started_at = Some(now);
    }

    pub fn mark_completed(&mut self, result: serde_json::Value, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        self.result = Some(result);
    }

    /// Count a failed attempt and apply the retry policy.
    ///
    /// The job either goes back to `pending` with `retry_at` stamped, or becomes `failed`.
    pub fn record_failure(
        &mut self,
        error: ExecutionError,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> FailOutcome {
        self.attempts = self.attempts.saturating_add(1);
        self.processing_started_at = None;
        self.errors.push(JobError {
            attempt: self.attempts,
            error_type: error.error_type,
            message: error.message.clone(),
            recorded_at: now,
        });
        match policy.decide(self.attempts, now) {
            RetryDecision::Retry { retry_at } => {
                self.status = JobStatus::Pending;
                self.retry_at = Some(retry_at);
                FailOutcome::Retrying {
                    attempts: self.attempts,
                    retry_at,
                }
            }
            RetryDecision::Discard => {
                self.status = JobStatus::Failed;
                self.failed_at = Some(now);
                self.error = Some(error.message);
                FailOutcome::Failed {
                    attempts: self.attempts,
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use chrono::TimeDelta;
    use serde_json::json;

    use super::*;
    use crate::backoff::BackoffStrategy;

    impl Job {
        pub(crate) const DEFAULT_TYPE: &'static str = "wellness_report";

        pub(crate) fn raw_job() -> Self {
            Self::new(
                Self::DEFAULT_TYPE,
                json!({"subjectId": "user-1", "subjectContact": "user-1@example.com"}),
                Utc::now(),
            )
        }
    }

    #[test]
    fn generated_ids_carry_type_and_are_unique() {
        let now = Utc::now();
        let first = JobId::generate("wellness_report", now);
        let second = JobId::generate("wellness_report", now);

        let prefix = format!("wellness_report-{}-", now.timestamp_millis());
        assert!(first.as_str().starts_with(&prefix));
        assert_eq!(first.as_str().len(), prefix.len() + RANDOM_SUFFIX_LEN);
        assert_ne!(first, second);
    }

    #[test]
    fn serializes_with_camel_case_keys() {
        let mut job = Job::raw_job();
        job.mark_processing(Utc::now());

        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], Job::DEFAULT_TYPE);
        assert_eq!(value["status"], "processing");
        assert_eq!(value["attempts"], 0);
        assert!(value.get("processingStartedAt").is_some());
        assert!(value.get("completedAt").is_none());
        assert!(value.get("errors").is_none());

        let decoded: Job = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn failure_below_max_attempts_is_retried_with_backoff() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        let mut job = Job::raw_job();
        let id = job.id.clone();
        job.mark_processing(now);

        let outcome = job.record_failure(ExecutionError::other("boom"), &policy, now);

        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                attempts: 1,
                retry_at: now + TimeDelta::seconds(2)
            }
        );
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.processing_started_at, None);
        assert_eq!(job.errors.len(), 1);
        assert_eq!(job.error, None);
        assert!(!job.is_ready(now));
        assert!(job.is_ready(now + TimeDelta::seconds(2)));
    }

    #[test]
    fn failure_at_max_attempts_is_terminal() {
        let policy = RetryPolicy::new(3, BackoffStrategy::constant(TimeDelta::zero()));
        let now = Utc::now();
        let mut job = Job::raw_job();

        for _ in 0..2 {
            job.mark_processing(now);
            job.record_failure(ExecutionError::other("boom"), &policy, now);
        }
        job.mark_processing(now);
        let outcome = job.record_failure(ExecutionError::other("final"), &policy, now);

        assert_eq!(outcome, FailOutcome::Failed { attempts: 3 });
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failed_at, Some(now));
        assert_eq!(job.error.as_deref(), Some("final"));
        assert_eq!(job.errors.len(), 3);
        assert!(job.status.is_terminal());
    }

    #[test]
    fn stalled_only_after_timeout() {
        let now = Utc::now();
        let mut job = Job::raw_job();
        assert!(!job.is_stalled(TimeDelta::seconds(1), now));

        job.mark_processing(now - TimeDelta::seconds(10));
        assert!(job.is_stalled(TimeDelta::seconds(5), now));
        assert!(!job.is_stalled(TimeDelta::seconds(30), now));

        job.mark_completed(json!("done"), now);
        assert!(!job.is_stalled(TimeDelta::seconds(5), now));
    }

    #[test]
    fn unstamped_claim_counts_from_when_it_became_claimable() {
        let now = Utc::now();
        let mut job = Job::raw_job();
        job.created_at = now - TimeDelta::seconds(60);

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.claimed_since(), job.created_at);
        assert!(job.is_stalled(TimeDelta::seconds(30), now));

        job.retry_at = Some(now - TimeDelta::seconds(10));
        assert_eq!(job.claimed_since(), now - TimeDelta::seconds(10));
        assert!(!job.is_stalled(TimeDelta::seconds(30), now));
    }
}
