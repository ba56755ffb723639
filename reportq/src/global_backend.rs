//! The global backend.
//!
//! Setting it via [`crate::Reportq::set_global_backend`] makes it possible to enqueue jobs with
//! [`crate::job::builder::JobBuilder::enqueue`] without passing the backend around. The
//! [`GlobalBackend`] API itself should be considered unstable.
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::{backend::Backend, ReportqError};

pub struct GlobalBackend;

static GLOBAL_BACKEND: OnceCell<Arc<dyn Backend + Send + Sync + 'static>> = OnceCell::const_new();

impl GlobalBackend {
    /// Can only succeed once per process, later calls return [`ReportqError::GlobalBackend`].
    pub(crate) fn set(backend: impl Backend + Send + Sync + 'static) -> Result<(), ReportqError> {
        GLOBAL_BACKEND.set(Arc::new(backend)).map_err(|err| {
            tracing::error!(%err, "Couldn't set global backend {err}");
            ReportqError::GlobalBackend
        })
    }

    /// Get a reference to the global backend.
    ///
    /// Calling this before the backend is set returns an error:
    ///
    /// ```
    /// use reportq::global_backend::GlobalBackend;
    /// use reportq::ReportqError;
    ///
    /// let result = GlobalBackend::as_ref();
    ///
    /// assert!(matches!(result, Err(ReportqError::GlobalBackend)));
    /// ```
    #[doc(hidden)]
    pub fn as_ref() -> Result<&'static (dyn Backend + Send + Sync), ReportqError> {
        Ok(GLOBAL_BACKEND
            .get()
            .ok_or(ReportqError::GlobalBackend)?
            .as_ref())
    }
}
