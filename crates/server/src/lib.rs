pub mod error;
pub mod routes;

use std::sync::Arc;

use secrecy::ExposeSecret;
use services::services::{
    config::OrchestratorConfig,
    container::{ContainerRuntime, DockerCli},
    executor::JobExecutor,
    gate::ExecutionGate,
    github_client::{GitHubClient, GitHubClientError, MemberDirectory},
    notification::{GitHubNotifier, Notifier, Reporter},
    orchestrator::Orchestrator,
};
use thiserror::Error;

/// Error type for server startup
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    GitHub(#[from] GitHubClientError),
}

/// Shared handles every route needs.
#[derive(Clone)]
pub struct AppState {
    config: Arc<OrchestratorConfig>,
    orchestrator: Arc<Orchestrator>,
    members: Arc<dyn MemberDirectory>,
}

impl AppState {
    /// Wire the orchestrator from its collaborators.
    pub fn new(
        config: OrchestratorConfig,
        runtime: Arc<dyn ContainerRuntime>,
        notifier: Arc<dyn Notifier>,
        members: Arc<dyn MemberDirectory>,
    ) -> Self {
        let config = Arc::new(config);
        let reporter = Reporter::new(
            notifier,
            config.github_token.clone(),
            config.host_url.clone(),
        );
        let gate = ExecutionGate::new(runtime.clone(), config.container_name.clone());
        let executor = Arc::new(JobExecutor::new(runtime, reporter.clone(), config.clone()));

        Self {
            orchestrator: Arc::new(Orchestrator::new(gate, executor, reporter)),
            config,
            members,
        }
    }

    /// Production wiring: `docker` CLI runtime and the GitHub API.
    pub fn from_config(config: OrchestratorConfig) -> Result<Self, ServerError> {
        let github = GitHubClient::new(config.github_token.expose_secret().to_string())?;
        let runtime = Arc::new(DockerCli::new(config.runtime_binary.clone()));
        let notifier = Arc::new(GitHubNotifier::new(github.clone()));
        Ok(Self::new(config, runtime, notifier, Arc::new(github)))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn members(&self) -> &dyn MemberDirectory {
        self.members.as_ref()
    }
}

/// Waits for shutdown signals (Ctrl+C or SIGTERM on Unix).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let terminate = async {
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
            } else {
                tracing::error!("Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
