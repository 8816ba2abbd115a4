use std::sync::Arc;

use async_trait::async_trait;
use octocrab::Octocrab;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitHubClientError {
    #[error("Failed to build GitHub client: {0}")]
    BuildError(String),
    #[error("API error: {0}")]
    ApiError(String),
}

/// Answers "is this user a member of this organization".
#[async_trait]
pub trait MemberDirectory: Send + Sync {
    async fn is_org_member(&self, org: &str, user: &str) -> Result<bool, GitHubClientError>;
}

/// GitHub API client wrapper using octocrab.
#[derive(Clone)]
pub struct GitHubClient {
    inner: Arc<Octocrab>,
}

impl GitHubClient {
    /// Create a new GitHub client with a personal access token.
    pub fn new(token: String) -> Result<Self, GitHubClientError> {
        let octocrab = Octocrab::builder()
            .personal_token(token)
            .build()
            .map_err(|e| GitHubClientError::BuildError(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(octocrab),
        })
    }

    /// Post a comment on an issue or pull request conversation.
    pub async fn create_issue_comment(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<(), GitHubClientError> {
        self.inner
            .issues(owner, repo)
            .create_comment(number, body)
            .await
            .map_err(|e| GitHubClientError::ApiError(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl MemberDirectory for GitHubClient {
    async fn is_org_member(&self, org: &str, user: &str) -> Result<bool, GitHubClientError> {
        self.inner
            .orgs(org)
            .check_membership(user)
            .await
            .map_err(|e| GitHubClientError::ApiError(e.to_string()))
    }
}
