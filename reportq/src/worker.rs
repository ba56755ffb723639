//! The worker loop: claim a job, run its handler, report the outcome, repeat.
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    backend::{Backend, BackendError},
    handler::HandlerRegistry,
    job::runner::JobRunner,
};

/// How long a single claim blocks waiting for work.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);
/// The pause after a claim that found nothing.
pub const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_millis(100);
/// The pause after the store failed, before trying again.
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// The number of independent worker loops to run.
    pub workers: usize,
    pub poll_timeout: Duration,
    pub idle_backoff: Duration,
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            idle_backoff: DEFAULT_IDLE_BACKOFF,
            error_backoff: DEFAULT_ERROR_BACKOFF,
        }
    }
}

impl WorkerConfig {
    pub fn with_workers(self, workers: usize) -> Self {
        Self { workers, ..self }
    }

    pub fn with_poll_timeout(self, poll_timeout: Duration) -> Self {
        Self {
            poll_timeout,
            ..self
        }
    }

    pub fn with_idle_backoff(self, idle_backoff: Duration) -> Self {
        Self {
            idle_backoff,
            ..self
        }
    }

    pub fn with_error_backoff(self, error_backoff: Duration) -> Self {
        Self {
            error_backoff,
            ..self
        }
    }
}

/// One sequential worker loop.
///
/// A worker processes one job at a time. Throughput comes from running several workers against the
/// same backend, each claim hands a job to exactly one of them.
pub(crate) struct Worker<B> {
    id: usize,
    backend: B,
    runner: JobRunner<B>,
    config: WorkerConfig,
}

impl<B> Worker<B>
where
    B: Backend + Send + Sync + Clone + 'static,
{
    pub(crate) fn new(
        id: usize,
        backend: B,
        registry: HandlerRegistry,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id,
            runner: JobRunner::new(backend.clone(), registry),
            backend,
            config,
        }
    }

    pub(crate) fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        let span = tracing::info_span!("worker", worker = self.id);
        tokio::spawn(self.run(cancellation_token).instrument(span))
    }

    /// Runs until `cancellation_token` is cancelled.
    ///
    /// Cancellation is only observed between jobs: a claimed job always runs to its outcome. A
    /// claim is never abandoned midway either, its timeout bounds how long shutdown waits for it.
    pub(crate) async fn run(self, cancellation_token: CancellationToken) {
        tracing::debug!("Starting worker {}", self.id);
        while !cancellation_token.is_cancelled() {
            let pause = match self.process_next().await {
                Ok(true) => continue,
                Ok(false) => self.config.idle_backoff,
                Err(err) => {
                    tracing::error!(
                        ?err,
                        "Worker {} failed to reach the queue store, retrying in {:?}: {err}",
                        self.id,
                        self.config.error_backoff
                    );
                    self.config.error_backoff
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {},
                _ = cancellation_token.cancelled() => {},
            }
        }
        tracing::debug!("Shutting down worker {}", self.id);
    }

    /// Returns whether a job was processed.
    async fn process_next(&self) -> Result<bool, BackendError> {
        match self.backend.claim_next(self.config.poll_timeout).await? {
            Some(job) => {
                tracing::debug!(job_id = %job.id, "Claimed job {}", job.id);
                self.runner.execute_job(job).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::Ordering;

    use serde_json::json;

    use super::*;
    use crate::{
        backend::{memory::InMemoryBackend, testing::policy, EnqueuableJob, Partition},
        handler::test::{MockHandler, MockOutcome, ReportHandler},
        stats::QueueStats,
    };

    fn config() -> WorkerConfig {
        WorkerConfig::default()
            .with_poll_timeout(Duration::from_millis(20))
            .with_idle_backoff(Duration::from_millis(5))
            .with_error_backoff(Duration::from_millis(20))
    }

    fn registry(handler: &ReportHandler) -> HandlerRegistry {
        HandlerRegistry::new()
            .with(handler.clone())
            .with(MockHandler)
    }

    fn report_job(subject_id: &str) -> EnqueuableJob {
        EnqueuableJob::new(
            "wellness_report",
            json!({"subjectId": subject_id, "subjectContact": "a@example.com"}),
        )
    }

    fn mock_job(outcome: MockOutcome) -> EnqueuableJob {
        EnqueuableJob::new("mock", serde_json::to_value(outcome).unwrap())
    }

    async fn wait_for(backend: &InMemoryBackend, done: impl Fn(&QueueStats) -> bool) -> QueueStats {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(stats) = backend.stats().await {
                    if done(&stats) {
                        return stats;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queue did not reach the expected state")
    }

    #[tokio::test]
    async fn processes_jobs_until_cancelled() {
        let backend = InMemoryBackend::new();
        let handler = ReportHandler::default();
        let token = CancellationToken::new();
        let handle = Worker::new(0, backend.clone(), registry(&handler), config())
            .spawn(token.clone());

        for subject in ["user-1", "user-2", "user-3"] {
            backend.enqueue(report_job(subject)).await.unwrap();
        }

        let stats = wait_for(&backend, |stats| stats.completed == 3).await;
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.processing, 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn always_failing_job_ends_in_failed() {
        let backend = InMemoryBackend::new().with_retry_policy(policy());
        let token = CancellationToken::new();
        let handle = Worker::new(0, backend.clone(), registry(&ReportHandler::default()), config())
            .spawn(token.clone());

        let id = backend
            .enqueue(mock_job(MockOutcome::Error {
                message: "no data".to_owned(),
            }))
            .await
            .unwrap();

        let stats = wait_for(&backend, |stats| stats.failed == 1).await;
        assert_eq!(stats.pending, 0);
        let failed = backend.jobs(Partition::Failed).await.unwrap();
        assert_eq!(failed[0].id, id);
        assert_eq!(failed[0].attempts, 3);
        assert_eq!(failed[0].errors.len(), 3);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_the_worker() {
        let backend = InMemoryBackend::new().with_retry_policy(policy());
        let handler = ReportHandler::default();
        let token = CancellationToken::new();
        let handle =
            Worker::new(0, backend.clone(), registry(&handler), config()).spawn(token.clone());

        backend.enqueue(mock_job(MockOutcome::Panic)).await.unwrap();
        backend.enqueue(report_job("user-1")).await.unwrap();

        let stats = wait_for(&backend, |stats| stats.failed == 1 && stats.completed == 1).await;
        assert_eq!(stats.total, 2);
        assert!(!handle.is_finished());

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn recovers_after_store_outage() {
        let backend = InMemoryBackend::new();
        let handler = ReportHandler::default();
        let token = CancellationToken::new();
        backend.enqueue(report_job("user-1")).await.unwrap();
        backend.set_available(false);

        let handle =
            Worker::new(0, backend.clone(), registry(&handler), config()).spawn(token.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert!(!handle.is_finished());

        backend.set_available(true);
        wait_for(&backend, |stats| stats.completed == 1).await;

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn workers_share_the_queue() {
        let backend = InMemoryBackend::new();
        let handler = ReportHandler::default();
        let token = CancellationToken::new();
        let handles: Vec<_> = (0..3)
            .map(|id| {
                Worker::new(id, backend.clone(), registry(&handler), config()).spawn(token.clone())
            })
            .collect();

        for i in 0..20 {
            backend
                .enqueue(report_job(&format!("user-{i}")))
                .await
                .unwrap();
        }

        wait_for(&backend, |stats| stats.completed == 20).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 20);

        token.cancel();
        futures::future::join_all(handles).await;
    }
}
