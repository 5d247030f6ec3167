//! Job lifecycle: state machine, start/resume/cancel entrypoints, and the
//! process-wide concurrency cap.
//!
//! `start_analysis` is idempotent per `(project_id, analyzer_kind)` while a
//! non-terminal job exists: callers get the existing job id plus the last
//! committed sequence so they can immediately request backlog replay.

use crate::broker::{Subscription, SubscriptionBroker};
use crate::config::AnalysisConfig;
use crate::error::AnalysisError;
use crate::graph::model::{AnalysisStats, JobStatus, Project};
use crate::graph::store::GraphStore;
use crate::language_detector::LanguageDetector;
use crate::lsp::SymbolSource;
use crate::orchestrator::{AnalysisOrchestrator, CancelFlag, JobOutcome, JobProgress};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Legal state transitions; everything else is a bug worth logging.
fn transition_allowed(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Running, Paused)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Pending, Cancelled)
            | (Paused, Running)
            | (Paused, Cancelled)
            | (Failed, Running)
            // Only the explicit resume entrypoint re-drives a cancelled
            // job, and only from its durable checkpoint.
            | (Cancelled, Running)
    )
}

struct JobHandle {
    job_id: Uuid,
    project_id: Uuid,
    analyzer_kind: String,
    status_tx: watch::Sender<JobStatus>,
    progress: Arc<JobProgress>,
    cancel: CancelFlag,
}

impl JobHandle {
    fn status(&self) -> JobStatus {
        *self.status_tx.borrow()
    }

    fn set_status(&self, to: JobStatus) {
        let from = self.status();
        if from == to {
            return;
        }
        if !transition_allowed(from, to) {
            warn!(
                "Job {}: suspicious transition {:?} -> {:?}",
                self.job_id, from, to
            );
        }
        info!("Job {}: {:?} -> {:?}", self.job_id, from, to);
        self.status_tx.send_replace(to);
    }
}

/// Snapshot returned to status queries.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub project_id: Uuid,
    pub analyzer_kind: String,
    pub status: JobStatus,
    pub stats: AnalysisStats,
}

/// What `start_analysis` hands back.
#[derive(Debug, Clone)]
pub struct StartedJob {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub last_committed_sequence: u64,
    /// True when an existing job was joined or resumed instead of created.
    pub rejoined: bool,
}

/// Owns every job in the process.
pub struct JobRegistry {
    config: Arc<AnalysisConfig>,
    broker: Arc<SubscriptionBroker>,
    store: Arc<dyn GraphStore>,
    orchestrator: Arc<AnalysisOrchestrator>,
    jobs: DashMap<Uuid, Arc<JobHandle>>,
    active_by_project: DashMap<(Uuid, String), Uuid>,
    projects: DashMap<Uuid, Project>,
    permits: Arc<Semaphore>,
}

impl JobRegistry {
    pub fn new(
        config: Arc<AnalysisConfig>,
        store: Arc<dyn GraphStore>,
        broker: Arc<SubscriptionBroker>,
        source: Arc<dyn SymbolSource>,
        detector: Arc<LanguageDetector>,
    ) -> Self {
        let orchestrator = Arc::new(AnalysisOrchestrator::new(
            config.clone(),
            store.clone(),
            broker.clone(),
            source,
            detector,
        ));
        let permits = Arc::new(Semaphore::new(config.max_active_jobs.max(1)));
        Self {
            config,
            broker,
            store,
            orchestrator,
            jobs: DashMap::new(),
            active_by_project: DashMap::new(),
            projects: DashMap::new(),
            permits,
        }
    }

    /// Ingestion contract entrypoint: the collaborator delivers a project
    /// on a durable, immutable root before any job runs.
    pub fn register_project(&self, project: Project) {
        info!(
            "Registered project {} ({:?})",
            project.project_id, project.root_path
        );
        self.projects.insert(project.project_id, project);
    }

    pub fn project(&self, project_id: Uuid) -> Option<Project> {
        self.projects.get(&project_id).map(|p| p.clone())
    }

    /// Start a new job, or rejoin/resume the existing one for this
    /// `(project, analyzer_kind)`.
    pub async fn start_analysis(
        &self,
        project_id: Uuid,
        analyzer_kind: &str,
    ) -> Result<StartedJob, AnalysisError> {
        let project = self
            .project(project_id)
            .ok_or(AnalysisError::ProjectNotFound(project_id))?;
        if !project.root_path.exists() {
            return Err(AnalysisError::InvalidRequest(format!(
                "project root {:?} does not exist",
                project.root_path
            )));
        }

        let key = (project_id, analyzer_kind.to_string());
        if let Some(existing) = self.active_by_project.get(&key) {
            let job_id = *existing;
            drop(existing);
            if let Some(handle) = self.jobs.get(&job_id) {
                let handle = handle.clone();
                match handle.status() {
                    JobStatus::Completed | JobStatus::Cancelled => {
                        return Ok(self.started(&handle, true));
                    }
                    JobStatus::Failed | JobStatus::Paused => {
                        // {paused, failed} -> running: re-drive from the
                        // checkpoint under the same job id.
                        handle.cancel.reset();
                        self.spawn_job(handle.clone(), project);
                        return Ok(self.started(&handle, true));
                    }
                    _ => return Ok(self.started(&handle, true)),
                }
            }
        }

        let job_id = Uuid::new_v4();
        let handle = self.install_handle(job_id, project_id, analyzer_kind);
        self.active_by_project.insert(key, job_id);
        self.spawn_job(handle.clone(), project);
        Ok(self.started(&handle, false))
    }

    /// Resumption entrypoint for a job known from a previous process: the
    /// caller supplies the durable job id and the pipeline continues from
    /// the stored checkpoint.
    pub async fn resume(
        &self,
        job_id: Uuid,
        project_id: Uuid,
        analyzer_kind: &str,
    ) -> Result<StartedJob, AnalysisError> {
        let project = self
            .project(project_id)
            .ok_or(AnalysisError::ProjectNotFound(project_id))?;

        if let Some(handle) = self.jobs.get(&job_id) {
            let handle = handle.clone();
            match handle.status() {
                JobStatus::Completed => return Ok(self.started(&handle, true)),
                JobStatus::Failed | JobStatus::Cancelled | JobStatus::Paused => {
                    handle.cancel.reset();
                    self.spawn_job(handle.clone(), project);
                    return Ok(self.started(&handle, true));
                }
                _ => return Ok(self.started(&handle, true)),
            }
        }

        let handle = self.install_handle(job_id, project_id, analyzer_kind);
        self.active_by_project
            .insert((project_id, analyzer_kind.to_string()), job_id);
        // Seed the broker's sequence floor from the durable checkpoint.
        if let Ok(Some(checkpoint)) = self.store.read_checkpoint(job_id).await {
            info!(
                "Job {} resuming from sequence {}",
                job_id, checkpoint.last_committed_sequence
            );
        }
        self.spawn_job(handle.clone(), project);
        Ok(self.started(&handle, true))
    }

    fn install_handle(&self, job_id: Uuid, project_id: Uuid, analyzer_kind: &str) -> Arc<JobHandle> {
        let (status_tx, _) = watch::channel(JobStatus::Pending);
        let handle = Arc::new(JobHandle {
            job_id,
            project_id,
            analyzer_kind: analyzer_kind.to_string(),
            status_tx,
            progress: Arc::new(JobProgress::new()),
            cancel: CancelFlag::new(),
        });
        self.jobs.insert(job_id, handle.clone());
        self.broker.register_job(job_id);
        handle
    }

    fn started(&self, handle: &JobHandle, rejoined: bool) -> StartedJob {
        StartedJob {
            job_id: handle.job_id,
            status: handle.status(),
            last_committed_sequence: self.broker.last_committed(handle.job_id).unwrap_or(0),
            rejoined,
        }
    }

    fn spawn_job(&self, handle: Arc<JobHandle>, project: Project) {
        let orchestrator = self.orchestrator.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire().await else {
                handle.set_status(JobStatus::Failed);
                return;
            };
            // Cancelled while queued behind the active-jobs cap.
            if handle.cancel.is_cancelled() {
                handle.set_status(JobStatus::Cancelled);
                return;
            }
            handle.set_status(JobStatus::Running);
            let outcome = orchestrator
                .run(
                    handle.job_id,
                    project,
                    handle.progress.clone(),
                    handle.cancel.clone(),
                )
                .await;
            match outcome {
                Ok(JobOutcome::Completed) => handle.set_status(JobStatus::Completed),
                Ok(JobOutcome::Cancelled) => handle.set_status(JobStatus::Cancelled),
                Err(e) => {
                    error!("Job {} failed: {}", handle.job_id, e);
                    handle.progress.record_error(&e.to_string());
                    handle.set_status(JobStatus::Failed);
                }
            }
        });
    }

    /// Attach a subscriber to a job's batch stream.
    pub fn subscribe(
        &self,
        job_id: Uuid,
        from_sequence: Option<u64>,
    ) -> Result<Subscription, AnalysisError> {
        if !self.jobs.contains_key(&job_id) {
            return Err(AnalysisError::JobNotFound(job_id));
        }
        self.broker.subscribe(job_id, from_sequence)
    }

    /// Request cancellation and wait up to the grace period for the
    /// pipeline to acknowledge.
    pub async fn cancel(&self, job_id: Uuid) -> Result<JobStatus, AnalysisError> {
        let handle = self
            .jobs
            .get(&job_id)
            .map(|h| h.clone())
            .ok_or(AnalysisError::JobNotFound(job_id))?;

        let current = handle.status();
        if current.is_terminal() {
            return Ok(current);
        }
        if current == JobStatus::Pending {
            handle.cancel.cancel();
            handle.set_status(JobStatus::Cancelled);
            return Ok(JobStatus::Cancelled);
        }

        handle.cancel.cancel();
        let mut status_rx = handle.status_tx.subscribe();
        let deadline = tokio::time::timeout(self.config.grace, async {
            loop {
                if status_rx.borrow_and_update().is_terminal() {
                    break;
                }
                if status_rx.changed().await.is_err() {
                    break;
                }
            }
        });
        let _ = deadline.await;
        Ok(handle.status())
    }

    /// Mark a running job paused (subscriber-driven jobs keep running
    /// internally; this is a status label for clients).
    pub fn pause(&self, job_id: Uuid) -> Result<JobStatus, AnalysisError> {
        let handle = self
            .jobs
            .get(&job_id)
            .map(|h| h.clone())
            .ok_or(AnalysisError::JobNotFound(job_id))?;
        if handle.status() == JobStatus::Running {
            handle.set_status(JobStatus::Paused);
        }
        Ok(handle.status())
    }

    pub fn status(&self, job_id: Uuid) -> Result<JobSnapshot, AnalysisError> {
        let handle = self
            .jobs
            .get(&job_id)
            .map(|h| h.clone())
            .ok_or(AnalysisError::JobNotFound(job_id))?;
        Ok(JobSnapshot {
            job_id: handle.job_id,
            project_id: handle.project_id,
            analyzer_kind: handle.analyzer_kind.clone(),
            status: handle.status(),
            stats: handle.progress.stats(),
        })
    }

    /// Wait until the job reaches a terminal state (test and shutdown aid).
    pub async fn wait_terminal(&self, job_id: Uuid) -> Result<JobStatus, AnalysisError> {
        let handle = self
            .jobs
            .get(&job_id)
            .map(|h| h.clone())
            .ok_or(AnalysisError::JobNotFound(job_id))?;
        let mut status_rx = handle.status_tx.subscribe();
        loop {
            let status = *status_rx.borrow_and_update();
            if status.is_terminal() {
                return Ok(status);
            }
            if status_rx.changed().await.is_err() {
                return Ok(handle.status());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_match_state_machine() {
        use JobStatus::*;
        assert!(transition_allowed(Pending, Running));
        assert!(transition_allowed(Running, Paused));
        assert!(transition_allowed(Paused, Running));
        assert!(transition_allowed(Failed, Running));
        assert!(transition_allowed(Running, Cancelled));
        // The explicit resume entrypoint may re-drive a cancelled job.
        assert!(transition_allowed(Cancelled, Running));
        assert!(!transition_allowed(Completed, Running));
        assert!(!transition_allowed(Completed, Failed));
    }
}
