//! Container lifecycle driver.
//!
//! Wraps the external container runtime behind [`ContainerRuntime`]: provision
//! the host workspace, run a [`RunSpec`] to completion, read logs back out and
//! tear the container down. No business logic lives here; the executor decides
//! what to do with each failure.

use std::{io, path::Path};

use async_trait::async_trait;
use thiserror::Error;

use super::job::{ContainerHandle, FailureStage, RunSpec};

mod cli;

pub use cli::DockerCli;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("failed to prepare workspace {path}: {source}")]
    Workspace {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("container run failed: {message}")]
    Run {
        message: String,
        exit_code: Option<i32>,
        /// Whether the container was created and can still be inspected for logs.
        exit_inspectable: bool,
    },
    #[error("could not retrieve container logs: {0}")]
    LogRetrieval(String),
    #[error("could not retrieve artifact: {0}")]
    Artifact(String),
    #[error("could not stop or remove container: {0}")]
    Cleanup(String),
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
}

impl LifecycleError {
    pub fn stage(&self) -> FailureStage {
        match self {
            LifecycleError::Workspace { .. } => FailureStage::Workspace,
            LifecycleError::Run { .. } | LifecycleError::Unavailable(_) => FailureStage::Run,
            LifecycleError::LogRetrieval(_) => FailureStage::LogRetrieval,
            LifecycleError::Artifact(_) => FailureStage::Artifact,
            LifecycleError::Cleanup(_) => FailureStage::Cleanup,
        }
    }

    /// A run that failed before the runtime created its container.
    pub fn container_missing(&self) -> bool {
        matches!(
            self,
            LifecycleError::Run {
                exit_inspectable: false,
                ..
            }
        )
    }

    pub(crate) fn workspace(path: &Path, source: io::Error) -> Self {
        LifecycleError::Workspace {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Operations the executor needs from a container runtime.
///
/// `stop` and `remove` must be idempotent: acting on a container that no
/// longer exists is not an error.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Recursively delete `path` if present and recreate it empty.
    async fn provision_workspace(&self, path: &Path) -> Result<(), LifecycleError> {
        provision_workspace(path).await
    }

    /// Whether a container with exactly this name is currently running.
    async fn is_running(&self, name: &str) -> Result<bool, LifecycleError>;

    /// Start the container described by `spec` and block until it exits.
    ///
    /// Fails only when the container could not be started or its script
    /// aborted; a failing test suite inside the container is still `Ok`.
    async fn run_job(
        &self,
        handle: &mut ContainerHandle,
        spec: &RunSpec,
    ) -> Result<(), LifecycleError>;

    /// The runtime's own log stream for the container.
    async fn fetch_logs(&self, handle: &ContainerHandle) -> Result<String, LifecycleError>;

    /// Copy `inner_path` out of the container to `outer_path` and return its contents.
    async fn copy_artifact(
        &self,
        handle: &ContainerHandle,
        inner_path: &str,
        outer_path: &Path,
    ) -> Result<String, LifecycleError>;

    async fn stop(&self, name: &str) -> Result<(), LifecycleError>;

    async fn remove(&self, name: &str) -> Result<(), LifecycleError>;
}

/// Wipe and recreate a workspace directory. Calling it twice is harmless.
pub async fn provision_workspace(path: &Path) -> Result<(), LifecycleError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "Workspace emptied"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(LifecycleError::workspace(path, e)),
    }
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| LifecycleError::workspace(path, e))?;
    tracing::debug!(path = %path.display(), "Workspace created");
    Ok(())
}

/// Stop then remove. Remove is attempted even when stop failed.
pub async fn stop_and_remove(
    runtime: &dyn ContainerRuntime,
    name: &str,
) -> Result<(), LifecycleError> {
    let stopped = runtime.stop(name).await;
    let removed = runtime.remove(name).await;
    match (stopped, removed) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Err(stop), Err(remove)) => Err(LifecycleError::Cleanup(format!("{stop}; {remove}"))),
    }
}

/// Render the ordered stages of `spec` into one shell script.
///
/// Every stage appends to the run's log file. Stages run in order and the
/// script stops at the first failing stage unless that stage allows failure.
pub fn render_script(spec: &RunSpec) -> Result<String, LifecycleError> {
    let log = quote(&spec.log_path)?;
    let mut parts = vec![format!("touch {log}")];

    for stage in &spec.stages {
        let mut command = shlex::try_join(stage.argv.iter().map(String::as_str)).map_err(|e| {
            LifecycleError::Run {
                message: format!("stage '{}' cannot be quoted: {e}", stage.name),
                exit_code: None,
                exit_inspectable: false,
            }
        })?;
        if let Some(dir) = &stage.workdir {
            command = format!("cd {} && {command}", quote(dir)?);
        }

        let redirected = format!("{{ {command}; }} >> {log} 2>&1");
        if stage.allow_failure {
            parts.push(format!("{{ {redirected} || true; }}"));
        } else {
            parts.push(redirected);
        }
    }

    Ok(parts.join(" && "))
}

fn quote(s: &str) -> Result<String, LifecycleError> {
    shlex::try_quote(s)
        .map(|q| q.into_owned())
        .map_err(|e| LifecycleError::Run {
            message: format!("cannot quote '{s}': {e}"),
            exit_code: None,
            exit_inspectable: false,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::job::CommandStage;

    #[test]
    fn test_render_script_groups_tolerant_stages() {
        let spec = RunSpec {
            image: "img".to_string(),
            log_path: "/app/output.log".to_string(),
            stages: vec![
                CommandStage::new("first", ["echo", "hello world"]),
                CommandStage::new("tests", ["behave"])
                    .in_dir("/app/repo")
                    .allow_failure(),
                CommandStage::new("last", ["chown", "-R", "1:1", "/app"]),
            ],
        };

        let script = render_script(&spec).unwrap();
        assert_eq!(
            script,
            "touch /app/output.log \
             && { echo 'hello world'; } >> /app/output.log 2>&1 \
             && { { cd /app/repo && behave; } >> /app/output.log 2>&1 || true; } \
             && { chown -R 1:1 /app; } >> /app/output.log 2>&1"
        );
    }

    #[test]
    fn test_render_script_rejects_nul_bytes() {
        let spec = RunSpec {
            image: "img".to_string(),
            log_path: "/app/output.log".to_string(),
            stages: vec![CommandStage::new("bad", ["echo", "a\0b"])],
        };
        let err = render_script(&spec).unwrap_err();
        assert_eq!(err.stage(), FailureStage::Run);
    }

    #[tokio::test]
    async fn test_provision_workspace_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let ws = root.path().join("pull_request_feature-x");

        for _ in 0..2 {
            std::fs::create_dir_all(ws.join("nested")).unwrap();
            std::fs::write(ws.join("nested/file.txt"), "stale").unwrap();
            std::fs::write(ws.join("output.log"), "old log").unwrap();

            provision_workspace(&ws).await.unwrap();

            assert!(ws.is_dir());
            assert_eq!(std::fs::read_dir(&ws).unwrap().count(), 0);
        }
    }

    #[tokio::test]
    async fn test_provision_workspace_creates_missing_parents() {
        let root = tempfile::tempdir().unwrap();
        let ws = root.path().join("a/b/c");
        provision_workspace(&ws).await.unwrap();
        assert!(ws.is_dir());
    }

    #[tokio::test]
    async fn test_provision_workspace_reports_workspace_error() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("file");
        std::fs::write(&blocker, "not a dir").unwrap();

        // A regular file in the parent chain cannot be turned into a directory.
        let err = provision_workspace(&blocker.join("ws")).await.unwrap_err();
        assert_eq!(err.stage(), FailureStage::Workspace);
    }
}
