//! Ingest Worker Pool
//!
//! Runs ingestion jobs in the background. At most `num_workers` videos are
//! ingested at once; every job can be inspected and cancelled by id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::registry::VideoProcessingState;
use super::service::{IngestOutcome, IngestionService};
use crate::core::{CoreError, CoreResult, JobId, VideoId, VideoRef};

// =============================================================================
// Jobs
// =============================================================================

/// Job status
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IngestJobStatus {
    /// Waiting for a worker
    #[default]
    Queued,
    Running,
    Completed { outcome: IngestOutcome },
    Failed { error: String },
    Cancelled,
}

impl IngestJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IngestJobStatus::Completed { .. } | IngestJobStatus::Failed { .. } | IngestJobStatus::Cancelled
        )
    }
}

/// One background ingestion
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestJob {
    pub id: JobId,
    pub video_id: VideoId,
    pub status: IngestJobStatus,
    pub created_at: String,
    pub completed_at: Option<String>,
}

impl IngestJob {
    fn new(video_id: &str) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            video_id: video_id.to_string(),
            status: IngestJobStatus::Queued,
            created_at: chrono::Utc::now().to_rfc3339(),
            completed_at: None,
        }
    }

    fn finish(&mut self, status: IngestJobStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now().to_rfc3339());
    }

    /// Finished at or before `cutoff`
    fn finished_by(&self, cutoff: DateTime<Utc>) -> bool {
        self.status.is_terminal()
            && self
                .completed_at
                .as_deref()
                .and_then(|at| DateTime::parse_from_rfc3339(at).ok())
                .is_some_and(|at| at.with_timezone(&Utc) <= cutoff)
    }
}

struct JobSlot {
    job: Arc<watch::Sender<IngestJob>>,
    cancel: CancellationToken,
}

// =============================================================================
// Trigger
// =============================================================================

/// Answer to an ingestion trigger
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    AlreadyProcessed,
    ProcessingStarted,
    Processing,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResult {
    pub status: TriggerStatus,
    pub video_id: Option<VideoId>,
    pub job_id: Option<JobId>,
    pub chunk_count: Option<usize>,
    pub message: Option<String>,
}

impl TriggerResult {
    fn new(status: TriggerStatus, video_id: &str) -> Self {
        Self {
            status,
            video_id: Some(video_id.to_string()),
            job_id: None,
            chunk_count: None,
            message: None,
        }
    }

    fn failed(video_id: Option<&str>, message: String) -> Self {
        Self {
            status: TriggerStatus::Failed,
            video_id: video_id.map(str::to_string),
            job_id: None,
            chunk_count: None,
            message: Some(message),
        }
    }
}

// =============================================================================
// Worker Pool Configuration
// =============================================================================

/// Default time a finished job stays queryable
pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(3600);

/// Worker pool configuration
#[derive(Clone, Debug)]
pub struct WorkerPoolConfig {
    /// Videos ingested concurrently
    pub num_workers: usize,
    /// Maximum jobs waiting or running
    pub max_queue_size: usize,
    /// Finished jobs older than this are dropped on the next submission
    pub job_retention: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get().clamp(2, 8),
            max_queue_size: 1000,
            job_retention: DEFAULT_JOB_RETENTION,
        }
    }
}

/// Result of [`IngestWorkerPool::submit`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Submission {
    /// A new job was queued
    Queued(JobId),
    /// A job for the video is already queued or running
    InFlight(JobId),
}

impl Submission {
    pub fn job_id(&self) -> &str {
        match self {
            Submission::Queued(id) | Submission::InFlight(id) => id,
        }
    }
}

// =============================================================================
// Worker Pool
// =============================================================================

/// Background ingestion bounded by a fixed number of workers
pub struct IngestWorkerPool {
    service: Arc<IngestionService>,
    config: WorkerPoolConfig,
    permits: Arc<Semaphore>,
    jobs: Arc<Mutex<HashMap<JobId, JobSlot>>>,
    shutdown: CancellationToken,
}

impl IngestWorkerPool {
    /// Creates a pool. Must be used inside a tokio runtime.
    pub fn new(service: Arc<IngestionService>, config: WorkerPoolConfig) -> Self {
        let num_workers = config.num_workers.max(1);
        Self {
            service,
            config: WorkerPoolConfig {
                num_workers,
                ..config
            },
            permits: Arc::new(Semaphore::new(num_workers)),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub fn service(&self) -> &Arc<IngestionService> {
        &self.service
    }

    fn lock_jobs(&self) -> CoreResult<MutexGuard<'_, HashMap<JobId, JobSlot>>> {
        self.jobs
            .lock()
            .map_err(|_| CoreError::Internal("job table lock poisoned".to_string()))
    }

    /// Starts ingestion of `video_url` unless the video is already processed
    /// or in flight.
    pub fn trigger(&self, video_url: &str) -> TriggerResult {
        let video = match VideoRef::parse(video_url) {
            Ok(video) => video,
            Err(e) => return TriggerResult::failed(None, e.to_ipc_error()),
        };
        let video_id = video.video_id.as_str();

        match self.service.registry().state(video_id) {
            Ok(VideoProcessingState::Processed { chunk_count }) => {
                let mut result = TriggerResult::new(TriggerStatus::AlreadyProcessed, video_id);
                result.chunk_count = Some(chunk_count);
                return result;
            }
            Ok(VideoProcessingState::Processing) => {
                return TriggerResult::new(TriggerStatus::Processing, video_id);
            }
            Ok(_) => {}
            Err(e) => return TriggerResult::failed(Some(video_id), e.to_ipc_error()),
        }

        match self.submit(video_id) {
            Ok(Submission::Queued(job_id)) => {
                let mut result = TriggerResult::new(TriggerStatus::ProcessingStarted, video_id);
                result.job_id = Some(job_id);
                result
            }
            Ok(Submission::InFlight(job_id)) => {
                let mut result = TriggerResult::new(TriggerStatus::Processing, video_id);
                result.job_id = Some(job_id);
                result
            }
            Err(e) => TriggerResult::failed(Some(video_id), e.to_ipc_error()),
        }
    }

    /// Queues an ingestion job for `video_id`, or returns the job already
    /// queued or running for it.
    ///
    /// The in-flight check and the insert happen under one lock, so
    /// concurrent submissions for a video yield a single job.
    pub fn submit(&self, video_id: &str) -> CoreResult<Submission> {
        let job = IngestJob::new(video_id);
        let job_id = job.id.clone();
        let tx = Arc::new(watch::channel(job).0);
        let cancel = self.shutdown.child_token();

        {
            let mut jobs = self.lock_jobs()?;
            prune_jobs(&mut jobs, self.config.job_retention);

            let mut open = 0;
            for slot in jobs.values() {
                let job = slot.job.borrow();
                if job.status.is_terminal() {
                    continue;
                }
                if job.video_id == video_id {
                    return Ok(Submission::InFlight(job.id.clone()));
                }
                open += 1;
            }
            if open >= self.config.max_queue_size {
                return Err(CoreError::Internal("Job queue is full".to_string()));
            }
            jobs.insert(
                job_id.clone(),
                JobSlot {
                    job: Arc::clone(&tx),
                    cancel: cancel.clone(),
                },
            );
        }

        let service = Arc::clone(&self.service);
        let permits = Arc::clone(&self.permits);
        let video_id = video_id.to_string();

        tokio::spawn(async move {
            let permit = tokio::select! {
                _ = cancel.cancelled() => None,
                permit = permits.acquire_owned() => permit.ok(),
            };
            let Some(_permit) = permit else {
                tx.send_modify(|job| {
                    if !job.status.is_terminal() {
                        job.finish(IngestJobStatus::Cancelled);
                    }
                });
                return;
            };

            let job_id = tx.borrow().id.clone();
            tx.send_modify(|job| job.status = IngestJobStatus::Running);
            info!(job_id = %job_id, video_id = %video_id, "Ingest job started");

            let status = match service.ingest(&video_id, &cancel).await {
                Ok(outcome) => {
                    info!(job_id = %job_id, video_id = %outcome.video_id, chunk_count = outcome.chunk_count, "Ingest job completed");
                    IngestJobStatus::Completed { outcome }
                }
                Err(CoreError::Cancelled(_)) => {
                    info!(job_id = %job_id, "Ingest job cancelled");
                    IngestJobStatus::Cancelled
                }
                Err(e) => {
                    error!(job_id = %job_id, video_id = %video_id, error = %e, "Ingest job failed");
                    IngestJobStatus::Failed { error: e.to_ipc_error() }
                }
            };
            tx.send_modify(|job| job.finish(status));
        });

        Ok(Submission::Queued(job_id))
    }

    /// Gets a job by ID
    pub fn get_job(&self, job_id: &str) -> Option<IngestJob> {
        let jobs = self.lock_jobs().ok()?;
        jobs.get(job_id).map(|slot| slot.job.borrow().clone())
    }

    /// Every known job, oldest first
    pub fn list_jobs(&self) -> Vec<IngestJob> {
        let Ok(jobs) = self.lock_jobs() else {
            return Vec::new();
        };
        let mut list: Vec<IngestJob> = jobs.values().map(|slot| slot.job.borrow().clone()).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Requests cancellation. Returns false for unknown or finished jobs.
    pub fn cancel(&self, job_id: &str) -> bool {
        let Ok(jobs) = self.lock_jobs() else {
            return false;
        };
        match jobs.get(job_id) {
            Some(slot) if !slot.job.borrow().status.is_terminal() => {
                slot.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Waits until the job reaches a terminal status
    pub async fn wait(&self, job_id: &str) -> CoreResult<IngestJob> {
        let mut rx = {
            let jobs = self.lock_jobs()?;
            jobs.get(job_id)
                .map(|slot| slot.job.subscribe())
                .ok_or_else(|| CoreError::NotFound(format!("Job not found: {}", job_id)))?
        };
        let job = rx
            .wait_for(|job| job.status.is_terminal())
            .await
            .map_err(|e| CoreError::Internal(format!("Job channel closed: {}", e)))?
            .clone();
        Ok(job)
    }

    /// Drops jobs that finished more than `older_than` ago, returning how
    /// many were removed
    pub fn prune_finished(&self, older_than: Duration) -> usize {
        match self.lock_jobs() {
            Ok(mut jobs) => prune_jobs(&mut jobs, older_than),
            Err(_) => 0,
        }
    }

    /// Cancels every queued and running job
    pub fn shutdown(&self) {
        info!("Ingest worker pool shutting down");
        self.shutdown.cancel();
    }
}

impl Drop for IngestWorkerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn prune_jobs(jobs: &mut HashMap<JobId, JobSlot>, older_than: Duration) -> usize {
    let Ok(age) = chrono::Duration::from_std(older_than) else {
        return 0;
    };
    let cutoff = Utc::now() - age;
    let before = jobs.len();
    jobs.retain(|_, slot| !slot.job.borrow().finished_by(cutoff));
    before - jobs.len()
}

// =============================================================================
// Tests
// =============================================================================
