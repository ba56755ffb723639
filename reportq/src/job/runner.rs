use tokio::task::JoinError;
use tracing::{instrument, Instrument};

use crate::{
    backend::{Backend, BackendError, ExecutionError, FailOutcome},
    handler::HandlerRegistry,
};

use super::{Job, JobId};

const ERROR_TYPE_PANIC: &str = "panic";
const ERROR_TYPE_UNKNOWN_JOB_TYPE: &str = "unknown_job_type";

/// Runs one claimed job through its handler and reports the outcome to the backend.
pub(crate) struct JobRunner<B> {
    backend: B,
    registry: HandlerRegistry,
}

impl<B> JobRunner<B>
where
    B: Backend + Send + Sync + 'static,
{
    pub(crate) fn new(backend: B, registry: HandlerRegistry) -> Self {
        Self { backend, registry }
    }

    /// Only store errors are returned; a failing handler is reported to the backend instead.
    #[instrument(
        skip(self, job),
        fields(job_id = %job.id, job_type = %job.job_type, attempt = job.attempts + 1)
    )]
    pub(crate) async fn execute_job(&self, job: Job) -> Result<(), BackendError> {
        let job_id = job.id;
        let Some(handler) = self.registry.get(&job.job_type) else {
            let error = ExecutionError::new(
                ERROR_TYPE_UNKNOWN_JOB_TYPE,
                format!("no handler registered for job type {}", job.job_type),
            );
            return self.handle_job_error(&job_id, error).await;
        };

        tracing::debug!(%job_id, "Executing job {job_id}");
        let payload = job.payload;
        let result = tokio::spawn(async move { handler.handle(payload).await }.in_current_span())
            .await;

        match result {
            Ok(Ok(result)) => self.handle_job_complete(&job_id, result).await,
            Ok(Err(error)) => self.handle_job_error(&job_id, error).await,
            Err(error) => self.handle_job_error(&job_id, error.into()).await,
        }
    }

    async fn handle_job_complete(
        &self,
        job_id: &JobId,
        result: serde_json::Value,
    ) -> Result<(), BackendError> {
        tracing::debug!(%job_id, "Job complete {job_id}");
        self.backend
            .acknowledge(job_id, result)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to mark job {job_id} as complete, error: {err}",
                )
            })
    }

    async fn handle_job_error(
        &self,
        job_id: &JobId,
        error: ExecutionError,
    ) -> Result<(), BackendError> {
        let outcome = self
            .backend
            .fail(job_id, error.clone())
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to mark job {job_id} as failed, error: {err}",
                )
            })?;
        match outcome {
            FailOutcome::Retrying { attempts, retry_at } => tracing::warn!(
                %job_id,
                attempts,
                %retry_at,
                "Job {job_id} failed and will be retried at {retry_at}: error type: {}, message: {}",
                error.error_type,
                error.message
            ),
            FailOutcome::Failed { attempts } => tracing::error!(
                %job_id,
                attempts,
                "Job {job_id} failed after {attempts} attempts: error type: {}, message: {}",
                error.error_type,
                error.message
            ),
        }
        Ok(())
    }
}

impl From<JoinError> for ExecutionError {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self::new(ERROR_TYPE_PANIC, message)
    }
}
