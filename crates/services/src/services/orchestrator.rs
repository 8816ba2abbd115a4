//! Orchestrator Service
//!
//! Entry point for authorized job requests: probe, acquire the execution
//! slot, announce the run and hand it to the [`JobExecutor`].

use std::sync::{Arc, Mutex};

use tokio::task::{AbortHandle, JoinHandle};
use tracing::{error, info, warn};

use super::{
    container::LifecycleError,
    executor::{JobExecutor, RunReport},
    gate::ExecutionGate,
    job::JobRequest,
    notification::{Recipient, Reporter},
};

/// What happened to one dispatched request.
#[derive(Debug)]
pub enum DispatchResult {
    /// A job container was already running; the request was dropped.
    AlreadyRunning,
    Completed(RunReport),
}

pub struct Orchestrator {
    gate: ExecutionGate,
    executor: Arc<JobExecutor>,
    reporter: Reporter,
    /// Tasks spawned by [`Orchestrator::dispatch`] that may still be running.
    in_flight: Mutex<Vec<AbortHandle>>,
}

impl Orchestrator {
    pub fn new(gate: ExecutionGate, executor: Arc<JobExecutor>, reporter: Reporter) -> Self {
        Self {
            gate,
            executor,
            reporter,
            in_flight: Mutex::new(Vec::new()),
        }
    }

    pub fn gate(&self) -> &ExecutionGate {
        &self.gate
    }

    /// Handle one request to completion on the calling task.
    ///
    /// The probe runs twice: before waiting for the slot, for early feedback,
    /// and again once the slot is held. A running container seen while this
    /// process holds the slot was orphaned by an earlier process, so the
    /// request is refused rather than touching a container it does not own.
    pub async fn handle(&self, request: JobRequest) -> DispatchResult {
        let recipient = Recipient::new(&request.repo_full_name, request.pull_number);

        if self.gate.probe().await {
            self.reporter.already_running(&recipient).await;
            return DispatchResult::AlreadyRunning;
        }

        self.gate
            .run_exclusively(|| async {
                if self.gate.probe().await {
                    warn!(
                        container = %self.gate.container_name(),
                        repo = %request.repo_full_name,
                        "Job container running while the slot is free, refusing run"
                    );
                    self.reporter.already_running(&recipient).await;
                    return DispatchResult::AlreadyRunning;
                }

                self.reporter.starting(&recipient).await;
                DispatchResult::Completed(self.executor.execute(&request).await)
            })
            .await
    }

    /// Remove a job container left behind by a previous process.
    ///
    /// Call once before accepting events. Without it, an orphan makes every
    /// trigger answer "already running" until it exits, and then blocks the
    /// next `docker run` on the name.
    pub async fn reap_orphan(&self) -> Result<(), LifecycleError> {
        if self.gate.probe().await {
            warn!(
                container = %self.gate.container_name(),
                "Found job container from a previous process, removing it"
            );
        }
        self.gate.remove_container().await
    }

    /// Abandon in-flight runs and remove the job container.
    ///
    /// Must be awaited while the tokio runtime is still alive: the cleanup a
    /// dropped run schedules for itself cannot run during runtime teardown.
    pub async fn shutdown(&self) {
        let in_flight = std::mem::take(&mut *self.lock_in_flight());
        let aborted = in_flight.iter().filter(|task| !task.is_finished()).count();
        for task in &in_flight {
            task.abort();
        }
        if aborted > 0 {
            warn!(tasks = aborted, "Abandoning in-flight job runs");
        }

        match self.gate.remove_container().await {
            Ok(()) => info!(
                container = %self.gate.container_name(),
                "Job container removed on shutdown"
            ),
            Err(e) => error!(
                container = %self.gate.container_name(),
                error = %self.reporter.redact(&e.to_string()),
                "Failed to remove job container on shutdown"
            ),
        }
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, Vec<AbortHandle>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn [`Orchestrator::handle`] on its own task and return immediately.
    pub fn dispatch(self: &Arc<Self>, request: JobRequest) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let task = tokio::spawn(async move {
            let repo = request.repo_full_name.clone();
            let pull_number = request.pull_number;
            match orchestrator.handle(request).await {
                DispatchResult::AlreadyRunning => {
                    info!(%repo, pull_number, "Request dropped, job already running");
                }
                DispatchResult::Completed(report) => {
                    let elapsed = report.finished_at - report.started_at;
                    info!(
                        run_id = %report.run_id,
                        %repo,
                        pull_number,
                        success = report.outcome.is_success(),
                        container_state = ?report.container_state,
                        elapsed_ms = elapsed.num_milliseconds(),
                        "Job run finished"
                    );
                    if let Some(e) = &report.cleanup_error {
                        error!(run_id = %report.run_id, error = %e, "Job container left behind");
                    }
                }
            }
        });

        let mut in_flight = self.lock_in_flight();
        in_flight.retain(|task| !task.is_finished());
        in_flight.push(task.abort_handle());
        task
    }
}
