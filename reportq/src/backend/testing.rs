//! Conformance suite for [`Backend`] implementations.
//!
//! Every check expects a backend over an empty queue configured with [`policy`] and the default
//! [`Retention`](super::Retention).
use std::{
    collections::HashSet,
    time::{Duration, Instant},
};

use chrono::TimeDelta;
use serde_json::json;

use super::*;
use crate::{backoff::BackoffStrategy, job::JobStatus, retry::RetryPolicy};

const JOB_TYPE: &str = "wellness_report";
const CLAIM_TIMEOUT: Duration = Duration::from_millis(200);

/// The retry policy the suite expects: three attempts with no backoff so retries can be claimed
/// immediately.
pub fn policy() -> RetryPolicy {
    RetryPolicy::new(3, BackoffStrategy::constant(TimeDelta::zero()))
}

/// Create test suite for a reportq backend.
///
/// # Example
///
/// ```
/// use reportq::test_suite;
/// use reportq::backend::{memory::InMemoryBackend, testing::policy};
/// test_suite!(for: InMemoryBackend::new().with_retry_policy(policy()));
/// ```
///
/// Backends that need external infrastructure can generate ignored tests instead:
///
/// ```ignore
/// test_suite!(ignored: "requires a running redis server", for: connect().await);
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $backend:expr) => {
        $crate::test_suite!(@tests [] $backend);
    };
    (ignored: $reason:literal, for: $backend:expr) => {
        $crate::test_suite!(@tests [ignore = $reason] $backend);
    };
    (@tests [$($ignore:tt)*] $backend:expr) => {
        $crate::test_suite!(@test [$($ignore)*] $backend, enqueue_creates_pending_job);
        $crate::test_suite!(@test [$($ignore)*] $backend, claim_next_on_empty_queue_times_out);
        $crate::test_suite!(@test [$($ignore)*] $backend, claim_next_accepts_unbounded_timeout);
        $crate::test_suite!(@test [$($ignore)*] $backend, claim_next_is_fifo);
        $crate::test_suite!(@test [$($ignore)*] $backend, acknowledge_completes_job);
        $crate::test_suite!(@test [$($ignore)*] $backend, acknowledge_not_in_flight);
        $crate::test_suite!(@test [$($ignore)*] $backend, fail_retries_until_max_attempts);
        $crate::test_suite!(@test [$($ignore)*] $backend, fail_not_in_flight);
        $crate::test_suite!(@test [$($ignore)*] $backend, retried_job_goes_behind_waiting_jobs);
        $crate::test_suite!(@test [$($ignore)*] $backend, completed_partition_is_capped);
        $crate::test_suite!(@test [$($ignore)*] $backend, failed_partition_is_capped);
        $crate::test_suite!(@test [$($ignore)*] $backend, jobs_are_conserved_across_partitions);
        $crate::test_suite!(@test [$($ignore)*] $backend, stats_report_success_rate);
        $crate::test_suite!(@test [$($ignore)*] $backend, requeue_stalled_fails_old_claims);
        $crate::test_suite!(@test [$($ignore)*] $backend, healthy_when_reachable);
    };
    (@test [] $backend:expr, $name:ident) => {
        #[tokio::test]
        async fn $name() {
            let backend = $backend;
            $crate::backend::testing::$name(backend).await;
        }
    };
    (@test [ignore = $reason:literal] $backend:expr, $name:ident) => {
        #[tokio::test]
        #[ignore = $reason]
        async fn $name() {
            let backend = $backend;
            $crate::backend::testing::$name(backend).await;
        }
    };
}

pub use test_suite;

async fn enqueue_n(backend: &impl Backend, n: usize) -> Vec<JobId> {
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let job = EnqueuableJob::new(JOB_TYPE, json!({ "subjectId": format!("user-{i}") }));
        ids.push(backend.enqueue(job).await.unwrap());
    }
    ids
}

async fn claim(backend: &impl Backend) -> Job {
    backend
        .claim_next(CLAIM_TIMEOUT)
        .await
        .unwrap()
        .expect("a job should be ready")
}

fn ids_in(jobs: &[Job]) -> Vec<JobId> {
    jobs.iter().map(|job| job.id.clone()).collect()
}

pub async fn enqueue_creates_pending_job(backend: impl Backend) {
    let payload = json!({"subjectId": "user-1", "subjectContact": "user-1@example.com"});
    let id = backend
        .enqueue(EnqueuableJob::new(JOB_TYPE, payload.clone()))
        .await
        .unwrap();

    assert!(id.as_str().starts_with("wellness_report-"));
    let waiting = backend.jobs(Partition::Waiting).await.unwrap();
    assert_eq!(waiting.len(), 1);
    let job = &waiting[0];
    assert_eq!(job.id, id);
    assert_eq!(job.job_type, JOB_TYPE);
    assert_eq!(job.payload, payload);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
}

pub async fn claim_next_on_empty_queue_times_out(backend: impl Backend) {
    let started = Instant::now();

    let job = backend.claim_next(CLAIM_TIMEOUT).await.unwrap();

    assert_eq!(job, None);
    assert!(started.elapsed() < CLAIM_TIMEOUT + Duration::from_secs(2));
}

pub async fn claim_next_accepts_unbounded_timeout(backend: impl Backend) {
    let ids = enqueue_n(&backend, 1).await;

    let job = backend.claim_next(Duration::MAX).await.unwrap().unwrap();

    assert_eq!(job.id, ids[0]);
}

pub async fn claim_next_is_fifo(backend: impl Backend) {
    let ids = enqueue_n(&backend, 5).await;

    let mut claimed = Vec::new();
    for _ in 0..5 {
        let job = claim(&backend).await;
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.processing_started_at.is_some());
        claimed.push(job.id);
    }

    assert_eq!(claimed, ids);
    assert_eq!(
        ids_in(&backend.jobs(Partition::Processing).await.unwrap()),
        ids
    );
}

pub async fn acknowledge_completes_job(backend: impl Backend) {
    let ids = enqueue_n(&backend, 1).await;
    let job = claim(&backend).await;

    backend
        .acknowledge(&job.id, json!({"status": "ok"}))
        .await
        .unwrap();

    let stats = backend.stats().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.processing, 0);
    let completed = backend.jobs(Partition::Completed).await.unwrap();
    assert_eq!(ids_in(&completed), ids);
    assert_eq!(completed[0].status, JobStatus::Completed);
    assert_eq!(completed[0].result, Some(json!({"status": "ok"})));
    assert!(completed[0].completed_at.is_some());
}

pub async fn acknowledge_not_in_flight(backend: impl Backend) {
    let ids = enqueue_n(&backend, 1).await;

    let result = backend.acknowledge(&ids[0], json!(null)).await;

    assert!(matches!(result, Err(BackendError::JobNotFound(ref id)) if *id == ids[0]));
    assert_eq!(backend.stats().await.unwrap().pending, 1);
}

pub async fn fail_retries_until_max_attempts(backend: impl Backend) {
    let ids = enqueue_n(&backend, 1).await;

    for attempt in 1..=2 {
        let job = claim(&backend).await;
        assert_eq!(job.id, ids[0]);
        let outcome = backend
            .fail(&job.id, ExecutionError::other("report failed"))
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::Retrying { attempts, .. } if attempts == attempt));
    }
    let job = claim(&backend).await;
    assert_eq!(job.id, ids[0]);
    assert_eq!(job.attempts, 2);
    let outcome = backend
        .fail(&job.id, ExecutionError::other("report failed again"))
        .await
        .unwrap();

    assert_eq!(outcome, FailOutcome::Failed { attempts: 3 });
    let stats = backend.stats().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.processing, 0);
    let failed = backend.jobs(Partition::Failed).await.unwrap();
    assert_eq!(ids_in(&failed), ids);
    assert_eq!(failed[0].attempts, 3);
    assert_eq!(failed[0].status, JobStatus::Failed);
    assert_eq!(failed[0].error.as_deref(), Some("report failed again"));
    assert_eq!(failed[0].errors.len(), 3);
}

pub async fn fail_not_in_flight(backend: impl Backend) {
    let ids = enqueue_n(&backend, 1).await;

    let result = backend.fail(&ids[0], ExecutionError::other("nope")).await;

    assert!(matches!(result, Err(BackendError::JobNotFound(_))));
    let waiting = backend.jobs(Partition::Waiting).await.unwrap();
    assert_eq!(waiting[0].attempts, 0);
}

pub async fn retried_job_goes_behind_waiting_jobs(backend: impl Backend) {
    let ids = enqueue_n(&backend, 3).await;
    let first = claim(&backend).await;

    backend
        .fail(&first.id, ExecutionError::other("retry me"))
        .await
        .unwrap();

    let order = vec![
        claim(&backend).await.id,
        claim(&backend).await.id,
        claim(&backend).await.id,
    ];
    assert_eq!(order, vec![ids[1].clone(), ids[2].clone(), ids[0].clone()]);
}

pub async fn completed_partition_is_capped(backend: impl Backend) {
    let ids = enqueue_n(&backend, 150).await;
    for _ in 0..150 {
        let job = claim(&backend).await;
        backend.acknowledge(&job.id, json!({"status": "ok"})).await.unwrap();
    }

    let completed = backend.jobs(Partition::Completed).await.unwrap();
    assert_eq!(completed.len(), DEFAULT_COMPLETED_RETENTION);
    assert_eq!(ids_in(&completed), ids[50..].to_vec());
    assert_eq!(backend.stats().await.unwrap().completed, 100);
}

pub async fn failed_partition_is_capped(backend: impl Backend) {
    let ids = enqueue_n(&backend, 60).await;
    loop {
        let Some(job) = backend.claim_next(CLAIM_TIMEOUT).await.unwrap() else {
            break;
        };
        backend
            .fail(&job.id, ExecutionError::other("always fails"))
            .await
            .unwrap();
    }

    let failed = backend.jobs(Partition::Failed).await.unwrap();
    assert_eq!(failed.len(), DEFAULT_FAILED_RETENTION);
    let kept: HashSet<_> = ids_in(&failed).into_iter().collect();
    assert!(ids[10..].iter().all(|id| kept.contains(id)));
    assert!(failed.iter().all(|job| job.attempts == 3));
}

pub async fn jobs_are_conserved_across_partitions(backend: impl Backend) {
    let mut ids = enqueue_n(&backend, 1).await;
    for _ in 0..3 {
        let job = claim(&backend).await;
        backend.fail(&job.id, ExecutionError::other("fatal")).await.unwrap();
    }
    ids.extend(enqueue_n(&backend, 8).await);
    let a = claim(&backend).await;
    let b = claim(&backend).await;
    let c = claim(&backend).await;
    let _in_flight = claim(&backend).await;
    backend.acknowledge(&a.id, json!("done")).await.unwrap();
    backend.fail(&b.id, ExecutionError::other("retry")).await.unwrap();
    backend.fail(&c.id, ExecutionError::other("retry")).await.unwrap();

    let mut seen = HashSet::new();
    let mut total = 0;
    for partition in Partition::ALL {
        for job in backend.jobs(partition).await.unwrap() {
            total += 1;
            assert!(seen.insert(job.id.clone()), "{} in two partitions", job.id);
        }
    }
    assert_eq!(total, ids.len());
    assert_eq!(seen, ids.into_iter().collect::<HashSet<_>>());
    let stats = backend.stats().await.unwrap();
    assert_eq!(stats.total, total as u64);
    assert_eq!(
        (stats.pending, stats.processing, stats.completed, stats.failed),
        (6, 1, 1, 1)
    );
}

pub async fn stats_report_success_rate(backend: impl Backend) {
    let empty = backend.stats().await.unwrap();
    assert_eq!(empty.total, 0);
    assert_eq!(empty.success_rate, 0.0);

    enqueue_n(&backend, 4).await;
    let job = claim(&backend).await;
    backend.acknowledge(&job.id, json!({"status": "ok"})).await.unwrap();
    let _processing = claim(&backend).await;

    let stats = backend.stats().await.unwrap();
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.total, 4);
    assert_eq!(stats.success_rate, 25.0);
}

pub async fn requeue_stalled_fails_old_claims(backend: impl Backend) {
    let ids = enqueue_n(&backend, 1).await;
    claim(&backend).await;

    let requeued = backend.requeue_stalled(TimeDelta::hours(1)).await.unwrap();
    assert!(requeued.is_empty());

    tokio::time::sleep(Duration::from_millis(20)).await;
    let requeued = backend
        .requeue_stalled(TimeDelta::milliseconds(1))
        .await
        .unwrap();

    assert_eq!(requeued, ids);
    let waiting = backend.jobs(Partition::Waiting).await.unwrap();
    assert_eq!(ids_in(&waiting), ids);
    assert_eq!(waiting[0].attempts, 1);
    assert_eq!(waiting[0].errors[0].error_type, ExecutionError::STALLED);
    assert!(backend.jobs(Partition::Processing).await.unwrap().is_empty());
}

pub async fn healthy_when_reachable(backend: impl Backend) {
    assert!(backend.is_healthy().await);
}
