//! Job executor.
//!
//! Drives one test run end to end:
//!
//! ```text
//! Provisioning ──► Running ──► Succeeded ─┐
//!      │              │                   ├──► CleaningUp ──► Done
//!      └──────────────┴──► Failed ────────┘
//! ```
//!
//! `CleaningUp` is reached from every path, including a panic inside the
//! runtime. If the executor future itself is dropped, [`ContainerCleanup`]
//! schedules the stop/remove on the ambient tokio runtime instead.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use uuid::Uuid;

use super::{
    config::OrchestratorConfig,
    container::{ContainerRuntime, LifecycleError, stop_and_remove},
    job::{
        CONTAINER_APP_DIR, CONTAINER_DATA_DIR, CONTAINER_OUTPUT_LOG, ContainerHandle,
        ContainerState, ExecutionOutcome, FailureStage, JobRequest, Mount, RunPhase, RunSpec,
    },
    notification::{Recipient, Reporter},
};

/// Summary of one run, returned once the container is gone.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phases: Vec<RunPhase>,
    pub outcome: ExecutionOutcome,
    /// Last known state of the job container. `Removed` once cleanup succeeded.
    pub container_state: ContainerState,
    /// Redacted cleanup error, reported separately from the outcome.
    pub cleanup_error: Option<String>,
}

/// One step of the log recovery chain run after a failed container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiagnosticCollector {
    RuntimeLogs,
    OutputLogArtifact,
}

const RECOVERY_CHAIN: &[DiagnosticCollector] = &[
    DiagnosticCollector::RuntimeLogs,
    DiagnosticCollector::OutputLogArtifact,
];

impl DiagnosticCollector {
    async fn collect(
        self,
        runtime: &dyn ContainerRuntime,
        handle: &ContainerHandle,
        request: &JobRequest,
    ) -> Result<String, LifecycleError> {
        match self {
            DiagnosticCollector::RuntimeLogs => runtime.fetch_logs(handle).await,
            DiagnosticCollector::OutputLogArtifact => {
                let host_copy = request.workspace_dir.join("output.log");
                runtime
                    .copy_artifact(handle, CONTAINER_OUTPUT_LOG, &host_copy)
                    .await
            }
        }
    }

    fn section(self, container: &str, result: Result<String, String>) -> String {
        match (self, result) {
            (DiagnosticCollector::RuntimeLogs, Ok(text)) => {
                format!("Logs for {container}:\n{}", text.trim_end())
            }
            (DiagnosticCollector::RuntimeLogs, Err(e)) => {
                format!("Error while retrieving the container logs: {e}")
            }
            (DiagnosticCollector::OutputLogArtifact, Ok(text)) => {
                format!("Output Log:\n{}", text.trim_end())
            }
            (DiagnosticCollector::OutputLogArtifact, Err(e)) => {
                format!("Error while retrieving the output log file: {e}")
            }
        }
    }
}

/// Stops and removes the job container exactly once.
///
/// Dropping it without calling [`ContainerCleanup::run`] spawns the cleanup
/// in the background, so a cancelled run never leaves its container behind.
struct ContainerCleanup {
    runtime: Arc<dyn ContainerRuntime>,
    name: String,
    done: bool,
}

impl ContainerCleanup {
    fn new(runtime: Arc<dyn ContainerRuntime>, name: String) -> Self {
        Self {
            runtime,
            name,
            done: false,
        }
    }

    async fn run(mut self) -> Result<(), LifecycleError> {
        self.done = true;
        stop_and_remove(self.runtime.as_ref(), &self.name).await
    }
}

impl Drop for ContainerCleanup {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let runtime = self.runtime.clone();
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                tracing::warn!(
                    container = %name,
                    "Run dropped before cleanup, removing container in background"
                );
                rt.spawn(async move {
                    if let Err(e) = stop_and_remove(runtime.as_ref(), &name).await {
                        tracing::error!(
                            container = %name,
                            error = %e,
                            "Background container cleanup failed"
                        );
                    }
                });
            }
            Err(_) => {
                tracing::error!(container = %name, "No runtime available to clean up container");
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct JobExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    reporter: Reporter,
    config: Arc<OrchestratorConfig>,
}

impl JobExecutor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        reporter: Reporter,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            runtime,
            reporter,
            config,
        }
    }

    pub fn container_name(&self) -> &str {
        &self.config.container_name
    }

    /// Run one job to completion and report its terminal state.
    ///
    /// Exactly one success or failure notification is sent, followed by a
    /// cleanup-failure notification if the container could not be removed.
    pub async fn execute(&self, request: &JobRequest) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let recipient = Recipient::new(&request.repo_full_name, request.pull_number);
        let name = self.container_name().to_string();

        tracing::info!(
            %run_id,
            repo = %request.repo_full_name,
            pull_number = request.pull_number,
            branch = %request.branch,
            container = %name,
            "Starting job run"
        );

        let mut phases = Vec::with_capacity(5);
        let mut handle = ContainerHandle::new(
            name.clone(),
            vec![
                Mount::new(&request.workspace_dir, CONTAINER_APP_DIR),
                Mount::new(&request.data_dir, CONTAINER_DATA_DIR),
            ],
        );
        let cleanup = ContainerCleanup::new(self.runtime.clone(), name.clone());

        let driven = AssertUnwindSafe(self.drive(request, &mut handle, &mut phases))
            .catch_unwind()
            .await;
        let outcome = match driven {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload);
                tracing::error!(
                    %run_id,
                    error = %self.reporter.redact(&message),
                    "Job run panicked"
                );
                if !matches!(phases.last(), Some(RunPhase::Failed)) {
                    phases.push(RunPhase::Failed);
                }
                handle.transition(ContainerState::Failed);
                ExecutionOutcome::Failure {
                    stage: FailureStage::Internal,
                    raw_message: format!("unexpected fault: {message}"),
                    recovered_log: None,
                }
            }
        };

        match &outcome {
            ExecutionOutcome::Success => {
                tracing::info!(%run_id, "Job run succeeded");
                self.reporter.succeeded(&recipient).await;
            }
            ExecutionOutcome::Failure {
                stage,
                raw_message,
                recovered_log,
            } => {
                let mut diagnostics = format!("Error during {stage} stage: {raw_message}");
                if let Some(log) = recovered_log {
                    diagnostics.push('\n');
                    diagnostics.push_str(log);
                }
                tracing::error!(
                    %run_id,
                    %stage,
                    error = %self.reporter.redact(raw_message),
                    "Job run failed"
                );
                self.reporter.failed(&recipient, &diagnostics).await;
            }
        }

        phases.push(RunPhase::CleaningUp);
        let cleanup_error = match cleanup.run().await {
            Ok(()) => {
                handle.transition(ContainerState::Removed);
                tracing::info!(%run_id, container = %name, "Container stopped and removed");
                None
            }
            Err(e) => {
                let message = self.reporter.redact(&e.to_string());
                tracing::error!(
                    %run_id,
                    container = %name,
                    error = %message,
                    "Container cleanup failed"
                );
                self.reporter.cleanup_failed(&recipient, &message).await;
                Some(message)
            }
        };
        phases.push(RunPhase::Done);

        RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            phases,
            outcome,
            container_state: handle.state,
            cleanup_error,
        }
    }

    async fn drive(
        &self,
        request: &JobRequest,
        handle: &mut ContainerHandle,
        phases: &mut Vec<RunPhase>,
    ) -> ExecutionOutcome {
        phases.push(RunPhase::Provisioning);
        if let Err(e) = self.runtime.provision_workspace(&request.workspace_dir).await {
            phases.push(RunPhase::Failed);
            return ExecutionOutcome::Failure {
                stage: e.stage(),
                raw_message: e.to_string(),
                recovered_log: None,
            };
        }

        phases.push(RunPhase::Running);
        let spec = RunSpec::for_request(request, &self.config);
        match self.runtime.run_job(handle, &spec).await {
            Ok(()) => {
                phases.push(RunPhase::Succeeded);
                ExecutionOutcome::Success
            }
            Err(e) => {
                phases.push(RunPhase::Failed);
                // Without a container of our own, `docker logs` would read
                // whatever stale container holds the name.
                let recovered_log = if e.container_missing() {
                    tracing::warn!(
                        container = %handle.name,
                        "Container was never created, skipping log recovery"
                    );
                    format!(
                        "Container {} was never created, no logs to recover.",
                        handle.name
                    )
                } else {
                    self.recover_logs(handle, request).await
                };
                ExecutionOutcome::Failure {
                    stage: e.stage(),
                    raw_message: e.to_string(),
                    recovered_log: Some(recovered_log),
                }
            }
        }
    }

    /// Walk the recovery chain, keeping whatever each collector yields.
    async fn recover_logs(&self, handle: &ContainerHandle, request: &JobRequest) -> String {
        let mut sections = Vec::with_capacity(RECOVERY_CHAIN.len());
        for collector in RECOVERY_CHAIN {
            let collected = collector.collect(self.runtime.as_ref(), handle, request);
            let result = AssertUnwindSafe(collected).catch_unwind().await;
            let result = match result {
                Ok(Ok(text)) => Ok(text),
                Ok(Err(e)) => Err(e.to_string()),
                Err(payload) => Err(format!("unexpected fault: {}", panic_message(payload))),
            };
            if let Err(e) = &result {
                tracing::warn!(
                    collector = ?collector,
                    error = %self.reporter.redact(e),
                    "Diagnostic collection failed"
                );
            }
            sections.push(collector.section(&handle.name, result));
        }
        sections.join("\n")
    }
}
