use std::{path::PathBuf, str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use reportq::prelude::*;
use reportq_redis::RedisBackend;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SUBJECTS_FILE: &str = "REPORTQ_SUBJECTS_FILE";
const DEFAULT_SUBJECTS_FILE: &str = "subjects.json";
const BULK_SCHEDULE: &str = "REPORTQ_BULK_SCHEDULE";
// Mondays at 08:00 UTC.
const DEFAULT_BULK_SCHEDULE: &str = "0 0 8 * * Mon";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = QueueConfig::from_env()?;
    let schedule =
        std::env::var(BULK_SCHEDULE).unwrap_or_else(|_| DEFAULT_BULK_SCHEDULE.to_owned());
    let subjects = SubjectsFile(
        std::env::var(SUBJECTS_FILE)
            .unwrap_or_else(|_| DEFAULT_SUBJECTS_FILE.to_owned())
            .into(),
    );

    let backend = RedisBackend::from_config(&config).await?;
    let reportq = Reportq::new(backend.clone())
        .with_handler(WellnessReport)
        .with_reaper(config.reaper)
        .with_bulk_schedule(BulkSchedule::new(
            cron::Schedule::from_str(&schedule)?,
            WellnessReport::JOB_TYPE,
            subjects,
        ))
        .set_global_backend()?
        .start(config.worker)?;
    tracing::info!(queue = %config.queue_name, "Report worker running, press ctrl-c to stop");

    let job_id = WellnessReport::builder()
        .with_payload(ReportPayload {
            subject_id: "demo-user".to_owned(),
            subject_contact: "demo@example.com".to_owned(),
        })
        .enqueue()
        .await?;
    tracing::info!(%job_id, "Enqueued demo report {job_id}");

    tokio::signal::ctrl_c().await?;
    reportq.graceful_shutdown().await?;

    let stats = backend.stats().await?;
    tracing::info!("Queue stats on shutdown: {}", serde_json::to_string(&stats)?);
    Ok(())
}

/// Builds a wellness report and sends it to the subject.
struct WellnessReport;

#[derive(Debug, thiserror::Error)]
enum ReportError {
    #[error("subject {0} has no contact to deliver the report to")]
    MissingContact(String),
}

impl ExecutionError for ReportError {
    fn error_type(&self) -> &'static str {
        match self {
            Self::MissingContact(_) => "missing_contact",
        }
    }
}

#[async_trait]
impl Handler for WellnessReport {
    type Payload = ReportPayload;
    const JOB_TYPE: &'static str = "wellness_report";

    async fn handle(&self, payload: Self::Payload) -> ExecutionResult {
        if payload.subject_contact.is_empty() {
            return ReportError::MissingContact(payload.subject_id).into();
        }
        // Stand-in for collecting integration data and rendering the report.
        tokio::time::sleep(Duration::from_millis(250)).await;
        tracing::info!(
            subject_id = %payload.subject_id,
            "Sent wellness report to {}",
            payload.subject_contact
        );
        ExecutionResult::Done {
            result: serde_json::json!({
                "status": "ok",
                "subjectId": payload.subject_id,
                "generatedAt": Utc::now(),
            }),
        }
    }
}

/// Subjects read from a JSON array on disk at every scheduled run.
struct SubjectsFile(PathBuf);

#[async_trait]
impl SubjectSource for SubjectsFile {
    async fn load_subjects(
        &self,
    ) -> Result<Vec<Subject>, Box<dyn std::error::Error + Send + Sync>> {
        let contents = tokio::fs::read(&self.0).await?;
        Ok(serde_json::from_slice(&contents)?)
    }
}
