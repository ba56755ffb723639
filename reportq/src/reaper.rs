//! Recovery of jobs whose worker died between claim and outcome.
//!
//! A claimed job sits in the processing partition until its worker acknowledges or fails it. If the
//! worker process goes away first, nothing would ever move it again. The reaper periodically calls
//! [`Backend::requeue_stalled`], which fails every job claimed longer than the visibility timeout
//! ago with error type `stalled`. The normal retry policy then applies.
//!
//! The visibility timeout must be longer than the slowest handler: a job that is still running when
//! it is reaped can be delivered a second time.
use std::time::Duration;

use chrono::TimeDelta;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;

pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_VISIBILITY_TIMEOUT: TimeDelta = TimeDelta::seconds(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperConfig {
    /// How often the processing partition is scanned.
    pub interval: Duration,
    pub visibility_timeout: TimeDelta,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_REAP_INTERVAL,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }
}

impl ReaperConfig {
    pub fn with_interval(self, interval: Duration) -> Self {
        Self { interval, ..self }
    }

    pub fn with_visibility_timeout(self, visibility_timeout: TimeDelta) -> Self {
        Self {
            visibility_timeout,
            ..self
        }
    }
}

pub(crate) struct Reaper<B> {
    backend: B,
    config: ReaperConfig,
}

impl<B> Reaper<B>
where
    B: Backend + Send + Sync + 'static,
{
    pub(crate) fn new(backend: B, config: ReaperConfig) -> Self {
        Self { backend, config }
    }

    pub(crate) fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.interval) => self.reap().await,
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the stalled job reaper");
                        break;
                    }
                }
            }
        })
    }

    async fn reap(&self) {
        match self
            .backend
            .requeue_stalled(self.config.visibility_timeout)
            .await
        {
            Ok(stalled) if stalled.is_empty() => {}
            Ok(stalled) => tracing::warn!(
                count = stalled.len(),
                ?stalled,
                "Recovered {} jobs that exceeded the visibility timeout of {}",
                stalled.len(),
                self.config.visibility_timeout
            ),
            Err(err) => tracing::error!(?err, "Failed to recover stalled jobs with error {err}"),
        }
    }
}
