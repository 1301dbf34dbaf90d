use crate::error::IngestError;
use crate::ingest::{document_id_for, IngestOutcome, IngestRequest, IngestionPipeline, JobContext};
use crate::models::DocumentStatus;
use crate::session::StopSignal;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, Semaphore};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Paused,
    Done,
    Partial,
    Failed,
}

impl JobState {
    pub fn is_active(self) -> bool {
        matches!(self, JobState::Queued | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Paused => "paused",
            JobState::Done => "done",
            JobState::Partial => "partial",
            JobState::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job_id: String,
    pub path: PathBuf,
    pub state: JobState,
    pub outcome: Option<IngestOutcome>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
enum JobAction {
    Ingest,
    Resume(String),
    RetryPages(String),
}

struct JobEntry {
    job_id: String,
    request: IngestRequest,
    state: JobState,
    stop: StopSignal,
    /// Bumped whenever the job is re-queued so stale workers bow out.
    generation: u64,
    outcome: Option<IngestOutcome>,
    error: Option<String>,
}

impl JobEntry {
    fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.job_id.clone(),
            path: self.request.path.clone(),
            state: self.state,
            outcome: self.outcome.clone(),
            error: self.error.clone(),
        }
    }
}

struct QueueInner {
    pipeline: Arc<IngestionPipeline>,
    permits: Semaphore,
    jobs: Mutex<Vec<JobEntry>>,
    changed: Notify,
}

/// Ingestion jobs with bounded parallelism. Each job processes its pages in
/// order; up to `depth` jobs on different documents run at once.
#[derive(Clone)]
pub struct IngestionQueue {
    inner: Arc<QueueInner>,
}

impl IngestionQueue {
    pub fn new(pipeline: Arc<IngestionPipeline>, depth: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                pipeline,
                permits: Semaphore::new(depth.max(1)),
                jobs: Mutex::new(Vec::new()),
                changed: Notify::new(),
            }),
        }
    }

    /// Queues a job and returns its id. Must be called inside a Tokio runtime.
    pub fn submit(&self, request: IngestRequest) -> String {
        let job_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(job_id = %job_id, path = %request.path.display(), "job queued");
        self.inner.lock().push(JobEntry {
            job_id: job_id.clone(),
            request,
            state: JobState::Queued,
            stop: StopSignal::new(),
            generation: 0,
            outcome: None,
            error: None,
        });
        self.spawn(job_id.clone(), 0, JobAction::Ingest);
        job_id
    }

    /// A queued job is held back; a running job is stopped at the next page
    /// boundary and keeps its checkpoint.
    pub fn pause(&self, job_id: &str) -> Result<JobState, IngestError> {
        let mut jobs = self.inner.lock();
        let entry = find(&mut jobs, job_id)?;
        match entry.state {
            JobState::Queued => {
                entry.state = JobState::Paused;
                entry.generation += 1;
            }
            JobState::Running => entry.stop.stop(),
            state => {
                return Err(IngestError::InvalidArgument(format!(
                    "job {job_id} is {state} and cannot be paused"
                )))
            }
        }
        let state = entry.state;
        drop(jobs);
        self.inner.changed.notify_waiters();
        tracing::info!(job_id, %state, "job pause requested");
        Ok(state)
    }

    /// Re-queues a paused job. It continues after its document checkpoint.
    pub async fn resume(&self, job_id: &str) -> Result<(), IngestError> {
        self.requeue(job_id, JobState::Paused).await
    }

    /// Re-queues a failed or partial job. A partial document re-processes only
    /// its failed pages.
    pub async fn retry(&self, job_id: &str) -> Result<(), IngestError> {
        let state = self
            .status(job_id)
            .map(|status| status.state)
            .ok_or_else(|| IngestError::InvalidArgument(format!("unknown job {job_id}")))?;
        match state {
            JobState::Failed | JobState::Partial => self.requeue(job_id, state).await,
            state => Err(IngestError::InvalidArgument(format!(
                "job {job_id} is {state} and cannot be retried"
            ))),
        }
    }

    pub fn status(&self, job_id: &str) -> Option<JobStatus> {
        self.inner
            .lock()
            .iter()
            .find(|entry| entry.job_id == job_id)
            .map(JobEntry::status)
    }

    /// Every job in submission order.
    pub fn list(&self) -> Vec<JobStatus> {
        self.inner.lock().iter().map(JobEntry::status).collect()
    }

    /// Resolves once no job is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let busy = self.inner.lock().iter().any(|entry| entry.state.is_active());
            if !busy {
                return;
            }
            notified.await;
        }
    }

    async fn requeue(&self, job_id: &str, expected: JobState) -> Result<(), IngestError> {
        let path = {
            let mut jobs = self.inner.lock();
            let entry = find(&mut jobs, job_id)?;
            if entry.state != expected {
                return Err(IngestError::InvalidArgument(format!(
                    "job {job_id} is {} now",
                    entry.state
                )));
            }
            entry.request.path.clone()
        };

        let document_id = document_id_for(&path);
        let action = match self.inner.pipeline.registry().get(&document_id).await {
            Some(document) if document.status == DocumentStatus::Partial => {
                JobAction::RetryPages(document_id)
            }
            Some(_) => JobAction::Resume(document_id),
            None => JobAction::Ingest,
        };

        let generation = {
            let mut jobs = self.inner.lock();
            let entry = find(&mut jobs, job_id)?;
            if entry.state != expected {
                return Err(IngestError::InvalidArgument(format!(
                    "job {job_id} is {} now",
                    entry.state
                )));
            }
            entry.state = JobState::Queued;
            entry.stop = StopSignal::new();
            entry.generation += 1;
            entry.error = None;
            entry.generation
        };
        tracing::info!(job_id, ?action, "job re-queued");
        self.inner.changed.notify_waiters();
        self.spawn(job_id.to_string(), generation, action);
        Ok(())
    }

    fn spawn(&self, job_id: String, generation: u64, action: JobAction) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run_job(job_id, generation, action).await });
    }
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, Vec<JobEntry>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run_job(&self, job_id: String, generation: u64, action: JobAction) {
        let Ok(_permit) = self.permits.acquire().await else {
            return;
        };

        let claimed = {
            let mut jobs = self.lock();
            match jobs.iter_mut().find(|entry| entry.job_id == job_id) {
                Some(entry) if entry.generation == generation && entry.state == JobState::Queued => {
                    entry.state = JobState::Running;
                    Some((entry.request.clone(), entry.stop.clone()))
                }
                _ => None,
            }
        };
        let Some((request, stop)) = claimed else {
            return;
        };
        self.changed.notify_waiters();
        tracing::info!(job_id = %job_id, "job started");

        let ctx = JobContext {
            job_id: job_id.clone(),
            stop,
        };
        let result = match action {
            JobAction::Ingest => self.pipeline.ingest(request, &ctx).await,
            JobAction::Resume(document_id) => self.pipeline.resume(&document_id, &ctx).await,
            JobAction::RetryPages(document_id) => {
                self.pipeline.retry_failed_pages(&document_id, &ctx).await
            }
        };

        {
            let mut jobs = self.lock();
            if let Some(entry) = jobs.iter_mut().find(|entry| entry.job_id == job_id) {
                match result {
                    Ok(outcome) => {
                        entry.state = match outcome.status {
                            DocumentStatus::Complete => JobState::Done,
                            DocumentStatus::Partial => JobState::Partial,
                            DocumentStatus::Failed => JobState::Failed,
                            DocumentStatus::Pending | DocumentStatus::Processing => {
                                JobState::Paused
                            }
                        };
                        entry.outcome = Some(outcome);
                    }
                    Err(error) => {
                        tracing::warn!(job_id = %job_id, %error, "job failed");
                        entry.state = JobState::Failed;
                        entry.error = Some(error.to_string());
                    }
                }
                tracing::info!(job_id = %job_id, state = %entry.state, "job finished");
            }
        }
        self.changed.notify_waiters();
    }
}

fn find<'a>(jobs: &'a mut [JobEntry], job_id: &str) -> Result<&'a mut JobEntry, IngestError> {
    jobs.iter_mut()
        .find(|entry| entry.job_id == job_id)
        .ok_or_else(|| IngestError::InvalidArgument(format!("unknown job {job_id}")))
}
