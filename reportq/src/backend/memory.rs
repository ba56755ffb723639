//! Provides an in memory implementation of [`Backend`].
//!
//! It is designed to be a correct implementation of the queue semantics for tests and single
//! process setups. Nothing is persisted, so jobs are lost when the process exits.
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock, RwLockWriteGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Notify;

use super::{
    Backend, BackendError, EnqueuableJob, ExecutionError, FailOutcome, Job, Partition, Retention,
    MAX_CLAIM_WAIT,
};
use crate::{job::JobId, retry::RetryPolicy, stats::QueueStats};

#[derive(Default)]
struct Partitions {
    /// Ready jobs, oldest at the front.
    waiting: VecDeque<Job>,
    /// Retried jobs whose `retry_at` has not passed yet.
    delayed: Vec<Job>,
    processing: Vec<Job>,
    /// Newest at the front.
    completed: VecDeque<Job>,
    /// Newest at the front.
    failed: VecDeque<Job>,
}

impl Partitions {
    fn promote_due(&mut self, now: DateTime<Utc>) {
        if self.delayed.is_empty() {
            return;
        }
        let (mut due, delayed): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|job| job.is_ready(now));
        self.delayed = delayed;
        due.sort_by_key(|job| job.retry_at);
        self.waiting.extend(due);
    }

    fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.delayed.iter().filter_map(|job| job.retry_at).min()
    }

    fn take_in_flight(&mut self, id: &JobId) -> Result<Job, BackendError> {
        let index = self
            .processing
            .iter()
            .position(|job| &job.id == id)
            .ok_or_else(|| BackendError::JobNotFound(id.clone()))?;
        Ok(self.processing.remove(index))
    }

    fn fail(
        &mut self,
        id: &JobId,
        error: ExecutionError,
        policy: &RetryPolicy,
        retention: &Retention,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, BackendError> {
        let mut job = self.take_in_flight(id)?;
        let outcome = job.record_failure(error, policy, now);
        match outcome {
            FailOutcome::Retrying { .. } if job.is_ready(now) => self.waiting.push_back(job),
            FailOutcome::Retrying { .. } => self.delayed.push(job),
            FailOutcome::Failed { .. } => {
                self.failed.push_front(job);
                self.failed.truncate(retention.failed);
            }
        }
        Ok(outcome)
    }
}

/// An in memory implementation of [`Backend`].
///
/// Cloning is cheap and every clone shares the same queue.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    partitions: Arc<RwLock<Partitions>>,
    notify: Arc<Notify>,
    unavailable: Arc<AtomicBool>,
    policy: RetryPolicy,
    retention: Retention,
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("policy", &self.policy)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl InMemoryBackend {
    /// Creates a new instance of [`InMemoryBackend`] with the default retry policy and retention.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_policy(self, policy: RetryPolicy) -> Self {
        Self { policy, ..self }
    }

    pub fn with_retention(self, retention: Retention) -> Self {
        Self { retention, ..self }
    }

    /// Simulate the store going away: every operation fails with [`BackendError::Unavailable`]
    /// until it is made available again.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
        if available {
            self.notify.notify_waiters();
        }
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Partitions>, BackendError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(
                "in memory store marked unavailable".to_owned(),
            ));
        }
        self.partitions.write().map_err(|_| BackendError::BadState)
    }

    fn try_claim(&self) -> Result<Result<Job, Option<DateTime<Utc>>>, BackendError> {
        let mut partitions = self.write()?;
        let now = Utc::now();
        partitions.promote_due(now);
        Ok(match partitions.waiting.pop_front() {
            Some(mut job) => {
                job.mark_processing(now);
                partitions.processing.push(job.clone());
                Ok(job)
            }
            None => Err(partitions.next_retry_at()),
        })
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        let job = job.into_job(Utc::now());
        let id = job.id.clone();
        self.write()?.waiting.push_back(job);
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn claim_next(&self, timeout: Duration) -> Result<Option<Job>, BackendError> {
        let deadline = tokio::time::Instant::now() + timeout.min(MAX_CLAIM_WAIT);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_retry_at = match self.try_claim()? {
                Ok(job) => return Ok(Some(job)),
                Err(next_retry_at) => next_retry_at,
            };

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake_at = next_retry_at
                .map(|retry_at| {
                    let until = (retry_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    deadline.min(now + until.min(MAX_CLAIM_WAIT))
                })
                .unwrap_or(deadline);

            tokio::select! {
                _ = notified => {},
                _ = tokio::time::sleep_until(wake_at) => {},
            }
        }
    }

    async fn acknowledge(
        &self,
        id: &JobId,
        result: serde_json::Value,
    ) -> Result<(), BackendError> {
        let mut partitions = self.write()?;
        let mut job = partitions.take_in_flight(id)?;
        job.mark_completed(result, Utc::now());
        partitions.completed.push_front(job);
        partitions.completed.truncate(self.retention.completed);
        Ok(())
    }

    async fn fail(&self, id: &JobId, error: ExecutionError) -> Result<FailOutcome, BackendError> {
        let outcome = self
            .write()?
            .fail(id, error, &self.policy, &self.retention, Utc::now())?;
        if matches!(outcome, FailOutcome::Retrying { .. }) {
            self.notify.notify_waiters();
        }
        Ok(outcome)
    }

    async fn requeue_stalled(
        &self,
        visibility_timeout: TimeDelta,
    ) -> Result<Vec<JobId>, BackendError> {
        let now = Utc::now();
        let mut partitions = self.write()?;
        let stalled: Vec<JobId> = partitions
            .processing
            .iter()
            .filter(|job| job.is_stalled(visibility_timeout, now))
            .map(|job| job.id.clone())
            .collect();
        for id in &stalled {
            partitions.fail(
                id,
                ExecutionError::stalled(visibility_timeout),
                &self.policy,
                &self.retention,
                now,
            )?;
        }
        drop(partitions);
        if !stalled.is_empty() {
            self.notify.notify_waiters();
        }
        Ok(stalled)
    }

    async fn stats(&self) -> Result<QueueStats, BackendError> {
        let partitions = self.write()?;
        Ok(QueueStats::new(
            (partitions.waiting.len() + partitions.delayed.len()) as u64,
            partitions.processing.len() as u64,
            partitions.completed.len() as u64,
            partitions.failed.len() as u64,
        ))
    }

    async fn jobs(&self, partition: Partition) -> Result<Vec<Job>, BackendError> {
        let partitions = self.write()?;
        Ok(match partition {
            Partition::Waiting => {
                let mut delayed = partitions.delayed.clone();
                delayed.sort_by_key(|job| job.retry_at);
                partitions.waiting.iter().cloned().chain(delayed).collect()
            }
            Partition::Processing => partitions.processing.clone(),
            Partition::Completed => partitions.completed.iter().rev().cloned().collect(),
            Partition::Failed => partitions.failed.iter().rev().cloned().collect(),
        })
    }

    async fn is_healthy(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst) && !self.partitions.is_poisoned()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::{backend::testing::policy, backoff::BackoffStrategy, test_suite};

    test_suite!(for: InMemoryBackend::new().with_retry_policy(policy()));

    fn report_job() -> EnqueuableJob {
        EnqueuableJob::new(Job::DEFAULT_TYPE, json!({"subjectId": "user-1"}))
    }

    #[tokio::test]
    async fn retried_job_is_not_claimed_before_retry_at() {
        let backend = InMemoryBackend::new()
            .with_retry_policy(RetryPolicy::new(3, BackoffStrategy::constant(TimeDelta::hours(1))));
        let id = backend.enqueue(report_job()).await.unwrap();
        let job = backend.claim_next(Duration::ZERO).await.unwrap().unwrap();

        let outcome = backend
            .fail(&job.id, ExecutionError::other("later"))
            .await
            .unwrap();

        assert_matches!(outcome, FailOutcome::Retrying { attempts: 1, .. });
        assert_eq!(
            backend.claim_next(Duration::from_millis(50)).await.unwrap(),
            None
        );
        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        let waiting = backend.jobs(Partition::Waiting).await.unwrap();
        assert_eq!(waiting[0].id, id);
    }

    #[tokio::test]
    async fn retried_job_is_claimed_once_due() {
        let backend = InMemoryBackend::new().with_retry_policy(RetryPolicy::new(
            3,
            BackoffStrategy::constant(TimeDelta::milliseconds(50)),
        ));
        let id = backend.enqueue(report_job()).await.unwrap();
        let job = backend.claim_next(Duration::ZERO).await.unwrap().unwrap();
        backend
            .fail(&job.id, ExecutionError::other("soon"))
            .await
            .unwrap();

        let job = backend
            .claim_next(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(job.id, id);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn enqueue_wakes_waiting_claim() {
        let backend = InMemoryBackend::new();
        let handle = tokio::spawn({
            let backend = backend.clone();
            async move { backend.claim_next(Duration::from_secs(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let id = backend.enqueue(report_job()).await.unwrap();

        let claimed = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("claim should be woken by enqueue")
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, id);
    }

    #[tokio::test]
    async fn unbounded_claim_is_woken_by_enqueue() {
        let backend = InMemoryBackend::new();
        let handle = tokio::spawn({
            let backend = backend.clone();
            async move { backend.claim_next(Duration::MAX).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let id = backend.enqueue(report_job()).await.unwrap();

        let claimed = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("claim should be woken by enqueue")
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, id);
    }

    #[tokio::test]
    async fn unavailable_store_surfaces_errors() {
        let backend = InMemoryBackend::new();
        backend.set_available(false);

        assert!(!backend.is_healthy().await);
        assert_matches!(
            backend.enqueue(report_job()).await,
            Err(BackendError::Unavailable(_))
        );
        assert_matches!(
            backend.claim_next(Duration::ZERO).await,
            Err(BackendError::Unavailable(_))
        );

        backend.set_available(true);
        assert!(backend.is_healthy().await);
        assert!(backend.enqueue(report_job()).await.is_ok());
    }

    #[tokio::test]
    async fn badstate_errors() {
        let backend = InMemoryBackend::new();
        let id = backend.enqueue(report_job()).await.unwrap();

        tokio::task::spawn({
            let backend = backend.clone();
            async move {
                let _guard = backend.partitions.write();
                panic!()
            }
        })
        .await
        .unwrap_err();

        assert!(!backend.is_healthy().await);
        assert_matches!(
            backend.enqueue(report_job()).await,
            Err(BackendError::BadState)
        );
        assert_matches!(
            backend.claim_next(Duration::ZERO).await,
            Err(BackendError::BadState)
        );
        assert_matches!(
            backend.acknowledge(&id, json!(null)).await,
            Err(BackendError::BadState)
        );
        assert_matches!(
            backend.fail(&id, ExecutionError::other("x")).await,
            Err(BackendError::BadState)
        );
        assert_matches!(
            backend.requeue_stalled(TimeDelta::zero()).await,
            Err(BackendError::BadState)
        );
        assert_matches!(backend.stats().await, Err(BackendError::BadState));
    }
}
