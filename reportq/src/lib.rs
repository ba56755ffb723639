//! An at-least-once job queue and worker pool for asynchronous report generation.
//!
//! Producers enqueue jobs, each a job type plus an opaque JSON payload. Workers claim jobs one at
//! a time, run the [`handler::Handler`] registered for the job type and report the outcome back
//! to the [`backend::Backend`]. Failed jobs are retried with backoff up to a maximum number of
//! attempts, after which they are kept in a capped failed partition.
//!
//! # Example
//!
//! ```
//! # use reportq::prelude::*;
//! # use reportq::backend::memory::InMemoryBackend;
//! struct WellnessReport;
//!
//! #[async_trait::async_trait]
//! impl Handler for WellnessReport {
//!     type Payload = ReportPayload;
//!     const JOB_TYPE: &'static str = "wellness_report";
//!
//!     async fn handle(&self, payload: Self::Payload) -> ExecutionResult {
//!         println!("Sending report to {}", payload.subject_contact);
//!         ExecutionResult::ok()
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let backend = InMemoryBackend::new();
//! let reportq = Reportq::new(backend.clone())
//!     .with_handler(WellnessReport)
//!     .start(WorkerConfig::default())
//!     .unwrap();
//!
//! WellnessReport::builder()
//!     .with_payload(Subject::new("user-1", "one@example.com").payload())
//!     .enqueue_to_backend(&backend)
//!     .await
//!     .unwrap();
//!
//! reportq.graceful_shutdown().await.unwrap();
//! # });
//! ```
pub mod backend;
pub mod backoff;
pub mod bulk;
pub mod config;
pub mod global_backend;
pub mod handler;
pub mod job;
pub mod prelude;
pub mod reaper;
pub mod retry;
pub mod scheduler;
pub mod stats;
pub mod worker;

use backend::{Backend, BackendError};
use global_backend::GlobalBackend;
use handler::{Handler, HandlerRegistry};
use reaper::{Reaper, ReaperConfig};
use scheduler::{BulkSchedule, BulkScheduleRunner};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use worker::{Worker, WorkerConfig};

/// The queue runtime: worker loops plus the optional reaper and bulk schedules.
///
/// Nothing runs until [`Reportq::start`] is called, and everything it spawned is stopped by
/// [`Reportq::graceful_shutdown`]. Dropping a started runtime also signals its tasks to stop, but
/// does not wait for in-flight jobs.
#[derive(Debug)]
pub struct Reportq<B> {
    backend: B,
    registry: HandlerRegistry,
    reaper: Option<ReaperConfig>,
    bulk_schedules: Vec<BulkSchedule>,
    cancellation_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    started: bool,
}

impl<B> Default for Reportq<B>
where
    B: Backend + Default,
{
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<B> Reportq<B>
where
    B: Backend,
{
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            registry: HandlerRegistry::new(),
            reaper: None,
            bulk_schedules: Vec::new(),
            cancellation_token: CancellationToken::new(),
            handles: Vec::new(),
            started: false,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B> Reportq<B>
where
    B: Backend + Send + Sync + Clone + 'static,
{
    pub fn with_handler<H: Handler>(mut self, handler: H) -> Self {
        self.registry.register(handler);
        self
    }

    /// Periodically recover jobs whose worker died mid-job, see [`reaper`].
    pub fn with_reaper(mut self, config: ReaperConfig) -> Self {
        self.reaper = Some(config);
        self
    }

    pub fn with_bulk_schedule(mut self, bulk: BulkSchedule) -> Self {
        self.bulk_schedules.push(bulk);
        self
    }

    /// Make the backend available to [`job::builder::JobBuilder::enqueue`].
    ///
    /// The global backend can only be set once per process.
    pub fn set_global_backend(self) -> Result<Self, ReportqError> {
        GlobalBackend::set(self.backend.clone())?;

        Ok(self)
    }

    /// Spawn `config.workers` worker loops along with the reaper and bulk schedules.
    pub fn start(mut self, config: WorkerConfig) -> Result<Self, ReportqError> {
        if self.started {
            return Err(ReportqError::AlreadyStarted);
        }
        self.started = true;
        if self.registry.is_empty() {
            tracing::warn!("Starting reportq without any handlers, every job will fail");
        }
        tracing::info!(
            workers = config.workers,
            job_types = ?self.registry.job_types(),
            "Starting {} reportq workers",
            config.workers
        );

        for id in 0..config.workers {
            let worker = Worker::new(id, self.backend.clone(), self.registry.clone(), config);
            self.handles
                .push(worker.spawn(self.cancellation_token.child_token()));
        }
        if let Some(reaper) = self.reaper {
            self.handles.push(
                Reaper::new(self.backend.clone(), reaper)
                    .spawn(self.cancellation_token.child_token()),
            );
        }
        for bulk in &self.bulk_schedules {
            self.handles.push(
                BulkScheduleRunner::new(self.backend.clone(), bulk.clone())
                    .spawn(self.cancellation_token.child_token()),
            );
        }
        Ok(self)
    }

    /// Stop every spawned task, waiting for jobs that are being processed to finish.
    pub async fn graceful_shutdown(mut self) -> Result<(), ReportqError> {
        tracing::info!("Shutting down reportq tasks");
        self.cancellation_token.cancel();
        futures::future::join_all(std::mem::take(&mut self.handles))
            .await
            .into_iter()
            .try_for_each(|result| {
                result.map_err(|err| {
                    tracing::error!(?err, "Reportq task did not shut down cleanly: {err}");
                    ReportqError::GracefulShutdownFailed
                })
            })
    }
}

impl<B> Drop for Reportq<B> {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

#[derive(Debug, Error)]
pub enum ReportqError {
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error("Error communicating with the backend")]
    Backend(#[from] BackendError),
    #[error("Error setting global backend")]
    GlobalBackend,
    #[error("Reportq has already been started")]
    AlreadyStarted,
    #[error("Error encoding or decoding value")]
    EncodeError(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use std::{str::FromStr, sync::atomic::Ordering, time::Duration};

    use assert_matches::assert_matches;
    use chrono::TimeDelta;
    use serde_json::json;

    use super::*;
    use crate::{
        backend::{memory::InMemoryBackend, EnqueuableJob, Partition},
        bulk::Subject,
        handler::test::ReportHandler,
        stats::QueueStats,
    };

    fn config() -> WorkerConfig {
        WorkerConfig::default()
            .with_poll_timeout(Duration::from_millis(20))
            .with_idle_backoff(Duration::from_millis(5))
    }

    async fn wait_for(backend: &InMemoryBackend, done: impl Fn(&QueueStats) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done(&backend.stats().await.unwrap()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queue did not reach the expected state")
    }

    #[tokio::test]
    async fn report_job_is_completed() {
        let backend = InMemoryBackend::new();
        let handler = ReportHandler::default();
        let reportq = Reportq::new(backend.clone())
            .with_handler(handler.clone())
            .start(config())
            .unwrap();

        let id = backend
            .enqueue(EnqueuableJob::new(
                "wellness_report",
                json!({"subjectId": "user-1", "subjectContact": "one@example.com"}),
            ))
            .await
            .unwrap();

        wait_for(&backend, |stats| stats.completed == 1).await;
        reportq.graceful_shutdown().await.unwrap();

        let stats = backend.stats().await.unwrap();
        assert_eq!((stats.pending, stats.processing), (0, 0));
        assert_eq!(stats.success_rate, 100.0);
        let completed = backend.jobs(Partition::Completed).await.unwrap();
        assert_eq!(completed[0].id, id);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_twice() {
        let reportq = Reportq::new(InMemoryBackend::new())
            .with_handler(ReportHandler::default())
            .start(config())
            .unwrap();

        assert_matches!(reportq.start(config()), Err(ReportqError::AlreadyStarted));
    }

    #[tokio::test]
    async fn shutdown_stops_every_task() {
        let every_second = cron::Schedule::from_str("* * * * * *").unwrap();
        let reportq = Reportq::new(InMemoryBackend::new())
            .with_handler(ReportHandler::default())
            .with_reaper(ReaperConfig::default().with_interval(Duration::from_millis(10)))
            .with_bulk_schedule(BulkSchedule::new(
                every_second,
                "wellness_report",
                vec![Subject::new("user-1", "one@example.com").with_integration("gmail")],
            ))
            .start(config().with_workers(3))
            .unwrap();
        assert_eq!(reportq.handles.len(), 5);

        tokio::time::timeout(Duration::from_secs(2), reportq.graceful_shutdown())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn stalled_jobs_are_recovered_by_the_runtime() {
        let backend = InMemoryBackend::new();
        let handler = ReportHandler::default();
        backend
            .enqueue(EnqueuableJob::new(
                "wellness_report",
                json!({"subjectId": "user-1", "subjectContact": "one@example.com"}),
            ))
            .await
            .unwrap();
        // A worker that died right after claiming.
        backend
            .claim_next(Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let reportq = Reportq::new(backend.clone())
            .with_handler(handler.clone())
            .with_reaper(ReaperConfig {
                interval: Duration::from_millis(10),
                visibility_timeout: TimeDelta::milliseconds(200),
            })
            .start(config())
            .unwrap();

        // The default retry policy waits 2s before the retry is claimable.
        tokio::time::timeout(Duration::from_secs(10), async {
            while backend.stats().await.unwrap().completed != 1 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        reportq.graceful_shutdown().await.unwrap();

        let completed = backend.jobs(Partition::Completed).await.unwrap();
        assert_eq!(completed[0].attempts, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn enqueue_via_global_backend() {
        let backend = InMemoryBackend::new();
        let _reportq = Reportq::new(backend.clone()).set_global_backend().unwrap();

        ReportHandler::builder()
            .with_payload(Subject::new("user-1", "one@example.com").payload())
            .enqueue()
            .await
            .unwrap();

        assert_eq!(backend.stats().await.unwrap().pending, 1);
        assert_matches!(
            Reportq::new(backend).set_global_backend(),
            Err(ReportqError::GlobalBackend)
        );
    }
}
