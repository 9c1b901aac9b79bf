use crate::status::JobStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintJob {
    pub id: String,
    pub content: String,
    pub status: JobStatus,
    pub retry_count: u32,
    pub device_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl PrintJob {
    pub fn new(content: String, device_id: Option<String>) -> Self {
        Self {
            id: format!("job_{}", uuid::Uuid::new_v4()),
            content,
            status: JobStatus::Pending,
            retry_count: 0,
            device_id,
            created_at: Utc::now(),
            finished_at: None,
            error_message: None,
        }
    }
}

/// Append-only, in-memory record of print jobs.
///
/// Jobs are never removed automatically; only [`JobQueue::clear`] drops history.
#[derive(Clone, Default)]
pub struct JobQueue {
    jobs: Arc<Mutex<Vec<PrintJob>>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, job: PrintJob) {
        let mut jobs = self.jobs.lock().await;
        debug!("Queued print job {} ({} bytes of content)", job.id, job.content.len());
        jobs.push(job);
    }

    /// Apply `f` to the job with `job_id`. Returns the updated record.
    pub async fn update<F>(&self, job_id: &str, f: F) -> Option<PrintJob>
    where
        F: FnOnce(&mut PrintJob),
    {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.iter_mut().find(|j| j.id == job_id)?;
        f(job);
        Some(job.clone())
    }

    pub async fn set_status(&self, job_id: &str, status: JobStatus) -> Option<PrintJob> {
        self.update(job_id, |job| {
            job.status = status;
            if status.is_terminal() {
                job.finished_at = Some(Utc::now());
            } else {
                job.finished_at = None;
            }
        })
        .await
    }

    /// Fail every job still pending or printing. Returns how many were swept.
    pub async fn fail_live_jobs(&self, reason: &str) -> usize {
        let mut jobs = self.jobs.lock().await;
        let now = Utc::now();
        let mut swept = 0;
        for job in jobs.iter_mut().filter(|j| j.status.is_live()) {
            job.status = JobStatus::Failed;
            job.finished_at = Some(now);
            job.error_message = Some(reason.to_string());
            swept += 1;
        }
        if swept > 0 {
            info!("Marked {} in-flight print job(s) as failed: {}", swept, reason);
        }
        swept
    }

    pub async fn get(&self, job_id: &str) -> Option<PrintJob> {
        self.jobs.lock().await.iter().find(|j| j.id == job_id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<PrintJob> {
        self.jobs.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }

    /// Operator-initiated clear; drops history.
    pub async fn clear(&self) -> usize {
        let mut jobs = self.jobs.lock().await;
        let removed = jobs.len();
        jobs.clear();
        info!("Cleared {} print job record(s)", removed);
        removed
    }
}
