use std::marker::PhantomData;

use crate::{
    backend::{Backend, EnqueuableJob},
    global_backend::GlobalBackend,
    handler::Handler,
    ReportqError,
};

use super::JobId;

/// Builds a job for the handler `H`; get one from [`Handler::builder`].
pub struct JobBuilder<H>
where
    H: Handler,
{
    payload: Option<H::Payload>,
    _handler: PhantomData<H>,
}

impl<H> Default for JobBuilder<H>
where
    H: Handler,
{
    fn default() -> Self {
        Self {
            payload: None,
            _handler: PhantomData,
        }
    }
}

impl<H> JobBuilder<H>
where
    H: Handler,
{
    pub fn with_payload(self, payload: H::Payload) -> Self {
        Self {
            payload: Some(payload),
            ..self
        }
    }

    /// Enqueue to the backend registered with [`crate::Reportq::set_global_backend`].
    pub async fn enqueue(self) -> Result<JobId, ReportqError> {
        let backend = GlobalBackend::as_ref()?;

        self.enqueue_to_backend(backend).await
    }

    pub async fn enqueue_to_backend<B: Backend + ?Sized + Sync>(
        self,
        backend: &B,
    ) -> Result<JobId, ReportqError> {
        let payload = serde_json::to_value(self.payload)?;
        let job_id = backend
            .enqueue(EnqueuableJob::new(H::JOB_TYPE, payload))
            .await?;

        Ok(job_id)
    }
}
