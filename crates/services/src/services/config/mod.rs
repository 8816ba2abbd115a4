use std::{collections::HashMap, path::PathBuf};

use secrecy::SecretString;
use thiserror::Error;

pub const DEFAULT_USER_NAME: &str = "bildabgleich";
pub const DEFAULT_HOST_URL: &str = "https://pytroll-image-test-dev.int-pytroll-development.s.ewcloud.host";
pub const DEFAULT_BEHAVE_DIR: &str = "/satpy/tests/behave";
pub const DEFAULT_TEST_IMAGE: &str = "python:3.10-slim";
pub const DEFAULT_CONTAINER_NAME: &str = "clone-repo-image";
pub const DEFAULT_TRIGGER_PHRASE: &str = "start behave test";
pub const DEFAULT_WORKSPACE_OWNER: &str = "1004:1004";
pub const DEFAULT_RUNTIME_BINARY: &str = "docker";
pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Process configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub github_token: SecretString,
    pub webhook_secret: SecretString,
    pub user_name: String,
    pub clone_dir_base: PathBuf,
    pub project_path: PathBuf,
    pub data_dir: PathBuf,
    /// Where test results can be browsed; linked from success comments.
    pub host_url: String,
    /// Path of the behave suite relative to the cloned repository root.
    pub behave_dir: String,
    pub test_image: String,
    pub container_name: String,
    pub trigger_phrase: String,
    /// `uid:gid` handed ownership of the workspace after a run. `None` skips the chown.
    pub workspace_owner: Option<String>,
    pub runtime_binary: String,
    pub host: String,
    pub port: u16,
}

impl OrchestratorConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let github_token = get("GITHUB_TOKEN").ok_or(ConfigError::Missing("GITHUB_TOKEN"))?;
        let webhook_secret =
            get("WEBHOOK_SECRET").ok_or(ConfigError::Missing("WEBHOOK_SECRET"))?;

        let user_name = get("USER_NAME").unwrap_or_else(|| DEFAULT_USER_NAME.to_string());
        let clone_dir_base = get("CLONE_DIR_BASE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("/home/{user_name}")));
        let project_path = get("PROJECT_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| clone_dir_base.join("pytroll-image-comparison-tests"));
        let data_dir = get("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| project_path.join("data"));

        let port = match get("PORT") {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                key: "PORT",
                value: raw.clone(),
            })?,
            None => DEFAULT_PORT,
        };

        // An explicitly empty WORKSPACE_OWNER disables the chown stage.
        let workspace_owner = match lookup("WORKSPACE_OWNER") {
            Some(v) if v.trim().is_empty() => None,
            Some(v) => Some(v.trim().to_string()),
            None => Some(DEFAULT_WORKSPACE_OWNER.to_string()),
        };

        Ok(Self {
            github_token: SecretString::from(github_token),
            webhook_secret: SecretString::from(webhook_secret),
            user_name,
            clone_dir_base,
            project_path,
            data_dir,
            host_url: get("HOST_URL").unwrap_or_else(|| DEFAULT_HOST_URL.to_string()),
            behave_dir: get("BEHAVE_DIR").unwrap_or_else(|| DEFAULT_BEHAVE_DIR.to_string()),
            test_image: get("TEST_IMAGE").unwrap_or_else(|| DEFAULT_TEST_IMAGE.to_string()),
            container_name: get("CONTAINER_NAME")
                .unwrap_or_else(|| DEFAULT_CONTAINER_NAME.to_string()),
            trigger_phrase: get("TRIGGER_PHRASE")
                .map(|p| p.trim().to_lowercase())
                .unwrap_or_else(|| DEFAULT_TRIGGER_PHRASE.to_string()),
            workspace_owner,
            runtime_binary: get("CONTAINER_RUNTIME")
                .unwrap_or_else(|| DEFAULT_RUNTIME_BINARY.to_string()),
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
        })
    }

    /// Build a config from an in-memory map. Used by tests and tooling.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| map.get(key).cloned())
    }

    /// Per-branch workspace directory, wiped before every run.
    pub fn workspace_for_branch(&self, branch: &str) -> PathBuf {
        self.clone_dir_base.join(format!("pull_request_{branch}"))
    }
}
