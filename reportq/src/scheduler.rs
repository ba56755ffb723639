//! A cron driven producer seeding report jobs for every eligible subject.
use std::{fmt, ops::Sub, sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use cron::Schedule;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    backend::Backend,
    bulk::{self, Subject, SubjectSource},
};

type Eligibility = Arc<dyn Fn(&Subject) -> bool + Send + Sync>;

/// At every tick of `schedule`, load subjects from `source` and enqueue a `job_type` job for each
/// one that is eligible.
///
/// ```
/// # use std::str::FromStr;
/// # use reportq::prelude::*;
/// let schedule = cron::Schedule::from_str("0 0 8 * * Mon").unwrap();
/// let subjects = vec![Subject::new("user-1", "one@example.com").with_integration("fitbit")];
///
/// let bulk = BulkSchedule::new(schedule, "wellness_report", subjects);
/// ```
#[derive(Clone)]
pub struct BulkSchedule {
    schedule: Schedule,
    job_type: String,
    source: Arc<dyn SubjectSource>,
    eligible: Eligibility,
}

impl fmt::Debug for BulkSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkSchedule")
            .field("schedule", &self.schedule.to_string())
            .field("job_type", &self.job_type)
            .finish_non_exhaustive()
    }
}

impl BulkSchedule {
    /// Subjects without a linked integration are skipped, see [`BulkSchedule::with_eligibility`].
    pub fn new(
        schedule: Schedule,
        job_type: impl Into<String>,
        source: impl SubjectSource + 'static,
    ) -> Self {
        Self {
            schedule,
            job_type: job_type.into(),
            source: Arc::new(source),
            eligible: Arc::new(Subject::has_linked_integration),
        }
    }

    pub fn with_eligibility(
        self,
        eligible: impl Fn(&Subject) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            eligible: Arc::new(eligible),
            ..self
        }
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }
}

pub(crate) struct BulkScheduleRunner<B> {
    backend: B,
    bulk: BulkSchedule,
}

impl<B> BulkScheduleRunner<B>
where
    B: Backend + Send + Sync + 'static,
{
    pub(crate) fn new(backend: B, bulk: BulkSchedule) -> Self {
        Self { backend, bulk }
    }

    pub(crate) fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some(next) = self.bulk.schedule.upcoming(Utc).next() else {
                    tracing::warn!(
                        "No future scheduled time for {} bulk enqueue",
                        self.bulk.job_type
                    );
                    break;
                };
                let delay = next
                    .sub(Utc::now())
                    .sub(TimeDelta::milliseconds(10))
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        self.tick().await;
                        if let Ok(delay) = (next - Utc::now()).to_std() {
                            tokio::time::sleep(delay).await;
                        }
                    },
                    _ = cancellation_token.cancelled() => break,
                }
            }
            tracing::debug!("Shutting down {} bulk enqueue schedule", self.bulk.job_type);
        })
    }

    async fn tick(&self) {
        let job_type = &self.bulk.job_type;
        let subjects = match self.bulk.source.load_subjects().await {
            Ok(subjects) => subjects,
            Err(err) => {
                tracing::error!(
                    ?err,
                    "Failed to load subjects for {job_type} bulk enqueue, skipping: {err}"
                );
                return;
            }
        };
        let _ = bulk::enqueue_eligible(
            &self.backend,
            job_type,
            subjects,
            self.bulk.eligible.as_ref(),
        )
        .await
        .inspect_err(|err| {
            tracing::error!(?err, "Failed {job_type} bulk enqueue with error {err}");
        });
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;
    use crate::backend::{memory::InMemoryBackend, Partition};
    use crate::bulk::MockSubjectSource;

    fn every_second() -> Schedule {
        Schedule::from_str("* * * * * *").unwrap()
    }

    fn subjects() -> Vec<Subject> {
        vec![
            Subject::new("user-1", "one@example.com").with_integration("gmail"),
            Subject::new("user-2", "two@example.com"),
        ]
    }

    #[tokio::test]
    async fn tick_enqueues_eligible_subjects() {
        let backend = InMemoryBackend::new();
        let mut source = MockSubjectSource::new();
        source
            .expect_load_subjects()
            .times(1)
            .returning(|| Ok(subjects()));
        let runner = BulkScheduleRunner::new(
            backend.clone(),
            BulkSchedule::new(every_second(), "wellness_report", source),
        );

        runner.tick().await;

        let waiting = backend.jobs(Partition::Waiting).await.unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].payload["subjectId"], "user-1");
    }

    #[tokio::test]
    async fn custom_eligibility() {
        let backend = InMemoryBackend::new();
        let runner = BulkScheduleRunner::new(
            backend.clone(),
            BulkSchedule::new(every_second(), "wellness_report", subjects())
                .with_eligibility(|_| true),
        );

        runner.tick().await;

        assert_eq!(backend.stats().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn source_errors_skip_the_tick() {
        let backend = InMemoryBackend::new();
        let mut source = MockSubjectSource::new();
        source
            .expect_load_subjects()
            .times(1)
            .returning(|| Err("subject directory unreachable".into()));
        let runner = BulkScheduleRunner::new(
            backend.clone(),
            BulkSchedule::new(every_second(), "wellness_report", source),
        );

        runner.tick().await;

        assert_eq!(backend.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn enqueues_on_schedule() {
        let backend = InMemoryBackend::new();
        let token = CancellationToken::new();
        let handle = BulkScheduleRunner::new(
            backend.clone(),
            BulkSchedule::new(every_second(), "wellness_report", subjects()),
        )
        .spawn(token.clone());

        tokio::time::timeout(Duration::from_secs(5), async {
            while backend.stats().await.unwrap().pending == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("no jobs were enqueued");

        token.cancel();
        handle.await.unwrap();
    }
}
