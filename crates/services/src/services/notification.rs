//! Outbound status reporting.
//!
//! Every message a job produces goes through [`Reporter`], which redacts the
//! job credential and hands the text to a [`Notifier`]. Delivery is
//! at-most-once: a failed post is logged and dropped.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use utils::text::{redact, tail_from_char_boundary, truncate_to_char_boundary};

use super::github_client::{GitHubClient, GitHubClientError};

/// GitHub rejects comment bodies longer than this many characters.
pub const MAX_COMMENT_LEN: usize = 65_536;
/// Share of a long failure message kept from its start; the rest comes from its end.
const HEAD_SHARE: usize = MAX_COMMENT_LEN / 4;
const TRUNCATION_MARKER: &str = "\n\n[... output truncated ...]\n\n";

pub const ALREADY_RUNNING_MESSAGE: &str =
    "A job is already running for this repository. Please wait for the current job to finish.";

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("invalid recipient '{0}', expected owner/repo")]
    InvalidRecipient(String),
    #[error(transparent)]
    GitHub(#[from] GitHubClientError),
}

/// The pull request conversation a job reports to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub repo_full_name: String,
    pub pull_number: u64,
}

impl Recipient {
    pub fn new(repo_full_name: impl Into<String>, pull_number: u64) -> Self {
        Self {
            repo_full_name: repo_full_name.into(),
            pull_number,
        }
    }

    /// Split `owner/repo` into its two halves.
    pub fn owner_and_repo(&self) -> Option<(&str, &str)> {
        self.repo_full_name
            .split_once('/')
            .filter(|(owner, repo)| !owner.is_empty() && !repo.is_empty())
    }
}

/// Delivers a single text message to the collaboration platform.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, recipient: &Recipient, message: &str)
    -> Result<(), NotificationError>;
}

/// Posts messages as pull request comments.
#[derive(Clone)]
pub struct GitHubNotifier {
    client: GitHubClient,
}

impl GitHubNotifier {
    pub fn new(client: GitHubClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Notifier for GitHubNotifier {
    async fn deliver(&self, recipient: &Recipient, message: &str) -> Result<(), NotificationError> {
        let (owner, repo) = recipient
            .owner_and_repo()
            .ok_or_else(|| NotificationError::InvalidRecipient(recipient.repo_full_name.clone()))?;
        self.client
            .create_issue_comment(owner, repo, recipient.pull_number, message)
            .await?;
        Ok(())
    }
}

/// Redacting, failure-swallowing front end for a [`Notifier`].
#[derive(Clone)]
pub struct Reporter {
    notifier: Arc<dyn Notifier>,
    secret: SecretString,
    results_url: String,
}

impl Reporter {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        secret: SecretString,
        results_url: impl Into<String>,
    ) -> Self {
        Self {
            notifier,
            secret,
            results_url: results_url.into(),
        }
    }

    /// Remove the reporter's secret from `text`.
    pub fn redact(&self, text: &str) -> String {
        redact(text, self.secret.expose_secret())
    }

    /// Redact and deliver one message. Delivery failures are logged, never returned.
    pub async fn notify(&self, recipient: &Recipient, message: &str) {
        let message = fit_comment(&self.redact(message));
        if let Err(e) = self.notifier.deliver(recipient, &message).await {
            tracing::warn!(
                repo = %recipient.repo_full_name,
                pull_number = recipient.pull_number,
                error = %self.redact(&e.to_string()),
                "Failed to deliver notification"
            );
        }
    }

    pub async fn starting(&self, recipient: &Recipient) {
        let message = format!(
            "Starting to clone and test the repository {}",
            recipient.repo_full_name
        );
        tracing::info!("{message}");
        self.notify(recipient, &message).await;
    }

    pub async fn already_running(&self, recipient: &Recipient) {
        tracing::info!(repo = %recipient.repo_full_name, "{ALREADY_RUNNING_MESSAGE}");
        self.notify(recipient, ALREADY_RUNNING_MESSAGE).await;
    }

    pub async fn succeeded(&self, recipient: &Recipient) {
        let message = format!(
            "The testing process was executed successfully. See the test results for this pull request [here]({})!",
            self.results_url
        );
        self.notify(recipient, &message).await;
    }

    pub async fn failed(&self, recipient: &Recipient, diagnostics: &str) {
        let message = format!(
            "An error occurred during the testing process.\n\n```\n{}\n```",
            diagnostics.trim_end()
        );
        self.notify(recipient, &message).await;
    }

    pub async fn cleanup_failed(&self, recipient: &Recipient, error: &str) {
        let message =
            format!("An error occurred while stopping or removing the test container: {error}");
        self.notify(recipient, &message).await;
    }
}

/// Shorten `message` to the comment size limit, keeping its head and tail.
fn fit_comment(message: &str) -> String {
    if message.len() <= MAX_COMMENT_LEN {
        return message.to_string();
    }
    let head = truncate_to_char_boundary(message, HEAD_SHARE);
    let tail_budget = MAX_COMMENT_LEN - head.len() - TRUNCATION_MARKER.len();
    let tail = tail_from_char_boundary(message, tail_budget);
    format!("{head}{TRUNCATION_MARKER}{tail}")
}
