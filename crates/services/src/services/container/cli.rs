//! `docker` CLI implementation of [`ContainerRuntime`].
//!
//! Every operation shells out to the runtime binary and interprets its exit
//! status and stderr. The binary name is configurable so podman (or a wrapper
//! script) can stand in for docker.

use std::{
    ffi::OsStr,
    io,
    path::Path,
    process::{Output, Stdio},
};

use async_trait::async_trait;
use tokio::process::Command;

use super::{ContainerRuntime, LifecycleError, render_script};
use crate::services::job::{ContainerHandle, ContainerState, RunSpec};

/// Exit status `docker run` uses when the daemon itself rejected the request
/// (name conflict, missing image, bad flags). No container exists afterwards.
const DOCKER_DAEMON_ERROR: i32 = 125;

#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn docker<I, S>(&self, args: I) -> io::Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(false)
            .output()
            .await
    }

    /// Build the full `docker run` argument list for a spec.
    pub fn run_args(
        &self,
        handle: &ContainerHandle,
        spec: &RunSpec,
    ) -> Result<Vec<String>, LifecycleError> {
        let mut args = vec!["run".to_string(), "--name".to_string(), handle.name.clone()];
        for mount in &handle.mounts {
            args.push("-v".to_string());
            args.push(mount.to_volume_arg());
        }
        args.push(spec.image.clone());
        args.push("bash".to_string());
        args.push("-c".to_string());
        args.push(render_script(spec)?);
        Ok(args)
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn is_missing_container(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such container") || lower.contains("no container with name")
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn is_running(&self, name: &str) -> Result<bool, LifecycleError> {
        let filter = format!("name=^{name}$");
        let output = self
            .docker([
                "ps",
                "--filter",
                filter.as_str(),
                "--filter",
                "status=running",
                "--format",
                "{{.Names}}",
            ])
            .await
            .map_err(|e| LifecycleError::Unavailable(e.to_string()))?;

        if !output.status.success() {
            return Err(LifecycleError::Unavailable(stderr_of(&output)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().any(|line| line.trim() == name))
    }

    async fn run_job(
        &self,
        handle: &mut ContainerHandle,
        spec: &RunSpec,
    ) -> Result<(), LifecycleError> {
        let args = self.run_args(handle, spec)?;
        handle.transition(ContainerState::Running);

        let output = match self.docker(&args).await {
            Ok(output) => output,
            Err(e) => {
                handle.transition(ContainerState::Failed);
                return Err(LifecycleError::Run {
                    message: format!("could not invoke {}: {e}", self.binary),
                    exit_code: None,
                    exit_inspectable: false,
                });
            }
        };

        match output.status.code() {
            Some(0) => {
                handle.transition(ContainerState::Exited(0));
                Ok(())
            }
            code => {
                let exit_inspectable = matches!(code, Some(c) if c != DOCKER_DAEMON_ERROR);
                handle.transition(match code {
                    Some(c) if exit_inspectable => ContainerState::Exited(c),
                    _ => ContainerState::Failed,
                });
                let stderr = stderr_of(&output);
                let message = match code {
                    Some(c) if stderr.is_empty() => format!("exited with status {c}"),
                    Some(c) => format!("exited with status {c}: {stderr}"),
                    None => format!("terminated by signal: {stderr}"),
                };
                Err(LifecycleError::Run {
                    message,
                    exit_code: code,
                    exit_inspectable,
                })
            }
        }
    }

    async fn fetch_logs(&self, handle: &ContainerHandle) -> Result<String, LifecycleError> {
        let output = self
            .docker(["logs", handle.name.as_str()])
            .await
            .map_err(|e| LifecycleError::LogRetrieval(e.to_string()))?;

        if !output.status.success() {
            return Err(LifecycleError::LogRetrieval(stderr_of(&output)));
        }

        // `docker logs` replays the container's stderr on our stderr.
        let mut logs = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !logs.is_empty() && !logs.ends_with('\n') {
                logs.push('\n');
            }
            logs.push_str(&stderr);
        }
        Ok(logs)
    }

    async fn copy_artifact(
        &self,
        handle: &ContainerHandle,
        inner_path: &str,
        outer_path: &Path,
    ) -> Result<String, LifecycleError> {
        let source = format!("{}:{}", handle.name, inner_path);
        let output = self
            .docker([OsStr::new("cp"), OsStr::new(&source), outer_path.as_os_str()])
            .await
            .map_err(|e| LifecycleError::Artifact(e.to_string()))?;

        if !output.status.success() {
            return Err(LifecycleError::Artifact(stderr_of(&output)));
        }

        let bytes = tokio::fs::read(outer_path)
            .await
            .map_err(|e| LifecycleError::Artifact(format!("{}: {e}", outer_path.display())))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn stop(&self, name: &str) -> Result<(), LifecycleError> {
        let output = self
            .docker(["stop", name])
            .await
            .map_err(|e| LifecycleError::Cleanup(e.to_string()))?;
        let stderr = stderr_of(&output);
        if output.status.success() || is_missing_container(&stderr) {
            Ok(())
        } else {
            Err(LifecycleError::Cleanup(format!("stop {name}: {stderr}")))
        }
    }

    async fn remove(&self, name: &str) -> Result<(), LifecycleError> {
        let output = self
            .docker(["rm", name])
            .await
            .map_err(|e| LifecycleError::Cleanup(e.to_string()))?;
        let stderr = stderr_of(&output);
        if output.status.success() || is_missing_container(&stderr) {
            Ok(())
        } else {
            Err(LifecycleError::Cleanup(format!("rm {name}: {stderr}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::job::{CommandStage, Mount};

    #[test]
    fn test_run_args_layout() {
        let cli = DockerCli::default();
        let handle = ContainerHandle::new(
            "clone-repo-image",
            vec![
                Mount::new("/home/u/pull_request_x", "/app"),
                Mount::new("/home/u/data", "/app/ext_data"),
            ],
        );
        let spec = RunSpec {
            image: "python:3.10-slim".to_string(),
            log_path: "/app/output.log".to_string(),
            stages: vec![CommandStage::new("noop", ["true"])],
        };

        let args = cli.run_args(&handle, &spec).unwrap();
        assert_eq!(
            &args[..9],
            &[
                "run",
                "--name",
                "clone-repo-image",
                "-v",
                "/home/u/pull_request_x:/app",
                "-v",
                "/home/u/data:/app/ext_data",
                "python:3.10-slim",
                "bash",
            ]
        );
        assert_eq!(args[9], "-c");
        assert!(args[10].starts_with("touch /app/output.log"));
    }

    #[test]
    fn test_missing_container_detection() {
        assert!(is_missing_container(
            "Error response from daemon: No such container: clone-repo-image"
        ));
        assert!(is_missing_container(
            "Error: no container with name or ID \"clone-repo-image\" found"
        ));
        assert!(!is_missing_container("permission denied"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_reported_per_operation() {
        let cli = DockerCli::new("definitely-not-a-container-runtime");
        let mut handle = ContainerHandle::new("c", vec![]);
        let spec = RunSpec {
            image: "img".to_string(),
            log_path: "/app/output.log".to_string(),
            stages: vec![],
        };

        let err = cli.run_job(&mut handle, &spec).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Run {
                exit_inspectable: false,
                ..
            }
        ));
        assert_eq!(handle.state, ContainerState::Failed);

        assert!(matches!(
            cli.fetch_logs(&handle).await,
            Err(LifecycleError::LogRetrieval(_))
        ));
        assert!(matches!(
            cli.is_running("c").await,
            Err(LifecycleError::Unavailable(_))
        ));
        assert!(matches!(cli.stop("c").await, Err(LifecycleError::Cleanup(_))));
    }
}
