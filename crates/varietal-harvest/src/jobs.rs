use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;
use varietal_core::now_timestamp;

use crate::{HarvestError, HarvestSummary, Harvester};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<HarvestSummary>,
}

impl JobStatus {
    pub fn idle() -> Self {
        Self {
            state: JobState::Idle,
            job_id: None,
            detail: None,
            started_at: None,
            finished_at: None,
            summary: None,
        }
    }

    fn running(job_id: Uuid) -> Self {
        Self {
            state: JobState::Running,
            job_id: Some(job_id),
            started_at: Some(now_timestamp()),
            ..Self::idle()
        }
    }

    fn finish(&self, state: JobState, detail: String, summary: Option<HarvestSummary>) -> Self {
        Self {
            state,
            detail: Some(detail),
            finished_at: Some(now_timestamp()),
            summary,
            ..self.clone()
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("a harvest job is already running ({job_id})")]
    AlreadyRunning { job_id: Uuid },
}

/// Observer side of one background harvest.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: Uuid,
    status: watch::Receiver<JobStatus>,
    cancel: CancellationToken,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    /// Stops in-flight page work. The job ends as `cancelled` without writing.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the job has left `running`.
    pub async fn wait(&self) -> JobStatus {
        let mut status = self.status.clone();
        if let Ok(done) = status.wait_for(JobStatus::is_finished).await {
            return done.clone();
        }
        let last = status.borrow().clone();
        last
    }
}

/// At most one background harvest at a time, bounded by the job timeout.
#[derive(Clone)]
pub struct HarvestJobs {
    harvester: Arc<Harvester>,
    job_timeout: Duration,
    current: Arc<Mutex<Option<JobHandle>>>,
}

impl HarvestJobs {
    pub fn new(harvester: Arc<Harvester>) -> Self {
        let job_timeout = harvester.config().job_timeout;
        Self {
            harvester,
            job_timeout,
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_job_timeout(mut self, job_timeout: Duration) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    /// Spawn a harvest onto the current runtime unless one is still running.
    pub fn start(&self) -> Result<JobHandle, JobError> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = current.as_ref() {
            if handle.status().is_running() {
                return Err(JobError::AlreadyRunning { job_id: handle.id });
            }
        }

        let job_id = Uuid::new_v4();
        let (tx, rx) = watch::channel(JobStatus::running(job_id));
        let cancel = CancellationToken::new();
        let handle = JobHandle {
            id: job_id,
            status: rx,
            cancel: cancel.clone(),
        };
        *current = Some(handle.clone());
        drop(current);

        tokio::spawn(
            run_job(Arc::clone(&self.harvester), job_id, self.job_timeout, cancel, tx)
                .instrument(info_span!("harvest_job", %job_id)),
        );
        Ok(handle)
    }

    pub fn current(&self) -> Option<JobHandle> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Status of the latest job, or `idle` when none was ever started.
    pub fn status(&self) -> JobStatus {
        self.current()
            .map(|handle| handle.status())
            .unwrap_or_else(JobStatus::idle)
    }

    pub fn is_running(&self) -> bool {
        self.status().is_running()
    }
}

async fn run_job(
    harvester: Arc<Harvester>,
    job_id: Uuid,
    job_timeout: Duration,
    cancel: CancellationToken,
    status: watch::Sender<JobStatus>,
) {
    info!("harvest job started");
    let run = match tokio::time::timeout(job_timeout, harvester.run_until_cancelled(&cancel)).await
    {
        Ok(result) => result,
        Err(_) => {
            cancel.cancel();
            Err(HarvestError::TimedOut { after: job_timeout })
        }
    };

    let written = match run {
        Ok(document) => harvester.write_snapshot(job_id, &document).await,
        Err(err) => Err(err),
    };

    let started = status.borrow().clone();
    let finished = match written {
        Ok(summary) => {
            info!(varieties = summary.varieties, failed = summary.failed, "harvest job completed");
            let detail = format!(
                "harvested {} varieties ({} failed)",
                summary.varieties, summary.failed
            );
            started.finish(JobState::Completed, detail, Some(summary))
        }
        Err(HarvestError::Cancelled) => {
            info!("harvest job cancelled");
            started.finish(JobState::Cancelled, "harvest cancelled".to_string(), None)
        }
        Err(err) => {
            warn!(error = %err, "harvest job failed");
            started.finish(JobState::Failed, err.to_string(), None)
        }
    };
    status.send_replace(finished);
}
