use std::{error::Error, sync::Arc};

use async_trait::async_trait;
use fxhash::FxHashMap;
use serde::{de::DeserializeOwned, Serialize};

use crate::{backend, job::builder::JobBuilder};

const ERROR_TYPE_DECODE: &str = "decode";

/// The work performed for one type of job.
///
/// The queue never looks inside a payload: it is handed to the handler registered for the job's
/// type, and the returned [`ExecutionResult`] decides whether the job is acknowledged or failed.
///
/// Jobs are delivered at least once, so a handler may see the same payload again after a retry or
/// after a worker died mid-job.
///
/// # Example
///
/// ```
/// # use reportq::prelude::*;
/// # use serde::{Deserialize, Serialize};
/// struct WellnessReport;
///
/// #[async_trait::async_trait]
/// impl Handler for WellnessReport {
///     type Payload = ReportPayload;
///     const JOB_TYPE: &'static str = "wellness_report";
///
///     async fn handle(&self, payload: Self::Payload) -> ExecutionResult {
///         println!("building report for {}", payload.subject_id);
///         ExecutionResult::ok()
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// The type the job payload is decoded into before [`Handler::handle`] is called.
    type Payload: Serialize + DeserializeOwned + Send;
    /// The job type routed to this handler.
    ///
    /// This is stored with every job, so renaming the rust type of a handler does not orphan jobs
    /// that are already queued.
    const JOB_TYPE: &'static str;

    async fn handle(&self, payload: Self::Payload) -> ExecutionResult;

    fn builder() -> JobBuilder<Self>
    where
        Self: Sized,
    {
        JobBuilder::default()
    }
}

pub enum ExecutionResult {
    /// The job succeeded; `result` is stored on the completed record.
    Done { result: serde_json::Value },
    Error { error: Box<dyn ExecutionError> },
}

impl ExecutionResult {
    /// Success with the result `{"status": "ok"}`.
    pub fn ok() -> Self {
        Self::Done {
            result: serde_json::json!({ "status": "ok" }),
        }
    }
}

impl<T> From<T> for ExecutionResult
where
    T: ExecutionError + 'static,
{
    fn from(value: T) -> Self {
        Self::Error {
            error: Box::new(value),
        }
    }
}

/// An error returned by a [`Handler`].
pub trait ExecutionError: Error + Send + Sync {
    /// A short, stable classification recorded with the failed attempt.
    fn error_type(&self) -> &'static str;
}

impl From<Box<dyn ExecutionError>> for backend::ExecutionError {
    fn from(value: Box<dyn ExecutionError>) -> Self {
        Self::new(value.error_type(), value.to_string())
    }
}

#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    async fn handle(
        &self,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, backend::ExecutionError>;
}

struct Typed<H>(H);

#[async_trait]
impl<H> ErasedHandler for Typed<H>
where
    H: Handler,
{
    async fn handle(
        &self,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, backend::ExecutionError> {
        let payload = serde_json::from_value(payload).map_err(|err| {
            backend::ExecutionError::new(
                ERROR_TYPE_DECODE,
                format!("payload is not a valid {} payload: {err}", H::JOB_TYPE),
            )
        })?;
        match self.0.handle(payload).await {
            ExecutionResult::Done { result } => Ok(result),
            ExecutionResult::Error { error } => Err(error.into()),
        }
    }
}

/// Maps job types to the handlers that process them.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: FxHashMap<&'static str, Arc<dyn ErasedHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for [`Handler::JOB_TYPE`], replacing any previous registration.
    pub fn register<H: Handler>(&mut self, handler: H) -> &mut Self {
        if self
            .handlers
            .insert(H::JOB_TYPE, Arc::new(Typed(handler)))
            .is_some()
        {
            tracing::warn!(job_type = H::JOB_TYPE, "Replacing handler for {}", H::JOB_TYPE);
        }
        self
    }

    pub fn with<H: Handler>(mut self, handler: H) -> Self {
        self.register(handler);
        self
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<&'static str> {
        let mut job_types: Vec<_> = self.handlers.keys().copied().collect();
        job_types.sort_unstable();
        job_types
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<Arc<dyn ErasedHandler>> {
        self.handlers.get(job_type).cloned()
    }
}
