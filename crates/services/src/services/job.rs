//! Value types shared by the executor, the gate and the container driver.

use std::{fmt, path::PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use super::config::OrchestratorConfig;

/// Mount point of the per-branch workspace inside the container.
pub const CONTAINER_APP_DIR: &str = "/app";
/// Mount point of the long-lived external data directory.
pub const CONTAINER_DATA_DIR: &str = "/app/ext_data";
/// Clone target for the branch under test.
pub const CONTAINER_REPO_DIR: &str = "/app/repository";
/// Virtualenv holding behave and the project's dependencies.
pub const CONTAINER_VENV_DIR: &str = "/app/venv";
/// Output log written by every stage of the in-container script.
pub const CONTAINER_OUTPUT_LOG: &str = "/app/output.log";

const OS_PACKAGES: &[&str] = &["git", "libgl1-mesa-glx", "libglib2.0-0", "python3-venv"];
const PYTHON_PACKAGES: &[&str] = &[
    "behave",
    "Pillow",
    "pytest",
    "numpy",
    "opencv-python",
    "dask",
    "netcdf4",
    "h5netcdf",
];

/// An authorized request to test one branch of a pull request.
///
/// Consumed exactly once by the job executor and never persisted.
#[derive(Clone)]
pub struct JobRequest {
    pub repo_full_name: String,
    pub pull_number: u64,
    pub clone_url: String,
    pub branch: String,
    pub workspace_dir: PathBuf,
    pub data_dir: PathBuf,
    pub requested_by: String,
    pub credential: SecretString,
}

impl fmt::Debug for JobRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRequest")
            .field("repo_full_name", &self.repo_full_name)
            .field("pull_number", &self.pull_number)
            .field("clone_url", &self.clone_url)
            .field("branch", &self.branch)
            .field("workspace_dir", &self.workspace_dir)
            .field("data_dir", &self.data_dir)
            .field("requested_by", &self.requested_by)
            .finish_non_exhaustive()
    }
}

impl JobRequest {
    /// Clone URL with the credential embedded as userinfo.
    ///
    /// Only `https://` URLs get a credential; anything else is returned as-is.
    pub fn authenticated_clone_url(&self) -> String {
        match self.clone_url.strip_prefix("https://") {
            Some(rest) => format!("https://{}@{}", self.credential.expose_secret(), rest),
            None => self.clone_url.clone(),
        }
    }

    pub fn secret(&self) -> &str {
        self.credential.expose_secret()
    }
}

/// Lifecycle of the one container a run owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Exited(i32),
    Removed,
    Failed,
}

/// A bind mount from the host into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: String,
}

impl Mount {
    pub fn new(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
        }
    }

    /// `host:container` form understood by `docker run -v`.
    pub fn to_volume_arg(&self) -> String {
        format!("{}:{}", self.host_path.display(), self.container_path)
    }
}

/// The execution environment one run provisions, addressed by its well-known name.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub name: String,
    pub state: ContainerState,
    pub mounts: Vec<Mount>,
}

impl ContainerHandle {
    pub fn new(name: impl Into<String>, mounts: Vec<Mount>) -> Self {
        Self {
            name: name.into(),
            state: ContainerState::Created,
            mounts,
        }
    }

    pub fn transition(&mut self, state: ContainerState) {
        tracing::debug!(
            container = %self.name,
            from = ?self.state,
            to = ?state,
            "Container state change"
        );
        self.state = state;
    }
}

/// One step of the in-container script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStage {
    pub name: &'static str,
    pub argv: Vec<String>,
    pub workdir: Option<String>,
    /// When set, a non-zero exit of this stage does not stop the script.
    pub allow_failure: bool,
}

impl CommandStage {
    pub fn new<I, S>(name: &'static str, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name,
            argv: argv.into_iter().map(Into::into).collect(),
            workdir: None,
            allow_failure: false,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }
}

/// Declarative description of a container run: image, mounts and ordered stages.
///
/// Each stage's stdout and stderr are appended to `log_path` inside the container.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub image: String,
    pub log_path: String,
    pub stages: Vec<CommandStage>,
}

impl RunSpec {
    /// The clone → install → behave pipeline used for pull request testing.
    pub fn for_request(request: &JobRequest, config: &OrchestratorConfig) -> Self {
        let pip = format!("{CONTAINER_VENV_DIR}/bin/pip");
        let behave = format!("{CONTAINER_VENV_DIR}/bin/behave");

        let mut stages = vec![
            CommandStage::new("update package index", ["apt-get", "update"]),
            CommandStage::new(
                "install os packages",
                ["apt-get", "install", "-y"]
                    .into_iter()
                    .chain(OS_PACKAGES.iter().copied()),
            ),
            CommandStage::new(
                "create virtualenv",
                ["python3", "-m", "venv", CONTAINER_VENV_DIR],
            ),
            CommandStage::new(
                "install test dependencies",
                [pip.as_str(), "install"]
                    .into_iter()
                    .chain(PYTHON_PACKAGES.iter().copied()),
            ),
            CommandStage::new(
                "clone branch",
                vec![
                    "git".to_string(),
                    "clone".to_string(),
                    request.authenticated_clone_url(),
                    "--branch".to_string(),
                    request.branch.clone(),
                    CONTAINER_REPO_DIR.to_string(),
                ],
            ),
            CommandStage::new(
                "install project",
                [pip.as_str(), "install", "-e", CONTAINER_REPO_DIR],
            ),
            CommandStage::new("run behave", [behave])
                .in_dir(format!("{CONTAINER_REPO_DIR}{}", config.behave_dir))
                .allow_failure(),
        ];

        if let Some(owner) = &config.workspace_owner {
            stages.push(CommandStage::new(
                "hand workspace to host user",
                ["chown", "-R", owner.as_str(), CONTAINER_APP_DIR],
            ));
        }

        Self {
            image: config.test_image.clone(),
            log_path: CONTAINER_OUTPUT_LOG.to_string(),
            stages,
        }
    }
}

/// Which step of a run produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Workspace,
    Run,
    LogRetrieval,
    Artifact,
    Cleanup,
    /// A panic or other fault that escaped the driver.
    Internal,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureStage::Workspace => "workspace",
            FailureStage::Run => "run",
            FailureStage::LogRetrieval => "log retrieval",
            FailureStage::Artifact => "artifact",
            FailureStage::Cleanup => "cleanup",
            FailureStage::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Terminal result of one job. Never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success,
    Failure {
        stage: FailureStage,
        raw_message: String,
        recovered_log: Option<String>,
    },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success)
    }
}

/// Phases of the executor's per-run state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Provisioning,
    Running,
    Succeeded,
    Failed,
    CleaningUp,
    Done,
}
