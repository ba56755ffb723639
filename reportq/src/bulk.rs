//! Seeding report jobs for many subjects at once.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    backend::{Backend, BackendError, EnqueuableJob},
    job::JobId,
};

/// Someone a report can be generated for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: String,
    /// Where the finished report is delivered, usually an email address.
    pub contact: String,
    /// The third party accounts linked by this subject (mail, calendar, fitness, music...).
    #[serde(default)]
    pub linked_integrations: Vec<String>,
}

impl Subject {
    pub fn new(id: impl Into<String>, contact: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            contact: contact.into(),
            linked_integrations: Vec::new(),
        }
    }

    pub fn with_integration(mut self, integration: impl Into<String>) -> Self {
        self.linked_integrations.push(integration.into());
        self
    }

    /// The default eligibility rule: there is nothing to report on without a linked account.
    pub fn has_linked_integration(&self) -> bool {
        !self.linked_integrations.is_empty()
    }

    pub fn payload(&self) -> ReportPayload {
        ReportPayload {
            subject_id: self.id.clone(),
            subject_contact: self.contact.clone(),
        }
    }
}

/// The payload of a report generation job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPayload {
    pub subject_id: String,
    pub subject_contact: String,
}

/// Enqueue one `job_type` job per subject accepted by `eligible`.
///
/// Ineligible subjects are skipped and logged; they are not errors. A store error stops the run
/// and is returned, jobs enqueued before it stay queued.
pub async fn enqueue_eligible<B, I, F>(
    backend: &B,
    job_type: &str,
    subjects: I,
    eligible: F,
) -> Result<Vec<JobId>, BackendError>
where
    B: Backend + ?Sized + Sync,
    I: IntoIterator<Item = Subject>,
    F: Fn(&Subject) -> bool,
{
    let mut ids = Vec::new();
    let mut skipped = 0usize;
    for subject in subjects {
        if !eligible(&subject) {
            tracing::info!(subject_id = %subject.id, "Skipping ineligible subject {}", subject.id);
            skipped += 1;
            continue;
        }
        let payload = serde_json::to_value(subject.payload())?;
        let id = backend
            .enqueue(EnqueuableJob::new(job_type, payload))
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    subject_id = %subject.id,
                    "Failed to enqueue {job_type} job for subject {}: {err}",
                    subject.id
                )
            })?;
        tracing::debug!(%id, subject_id = %subject.id, "Enqueued {job_type} job {id}");
        ids.push(id);
    }
    tracing::info!(
        enqueued = ids.len(),
        skipped,
        "Bulk enqueued {} {job_type} jobs",
        ids.len()
    );
    Ok(ids)
}

/// Where the scheduled trigger gets its candidate subjects from.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubjectSource: Send + Sync {
    async fn load_subjects(
        &self,
    ) -> Result<Vec<Subject>, Box<dyn std::error::Error + Send + Sync>>;
}

#[async_trait]
impl SubjectSource for Vec<Subject> {
    async fn load_subjects(
        &self,
    ) -> Result<Vec<Subject>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.clone())
    }
}
