//! Webhook authentication and event filtering.
//!
//! Only events that pass both the HMAC check and the trigger filter become a
//! [`JobRequest`]; everything else is answered by the HTTP layer and never
//! reaches the orchestrator.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

use super::{
    config::OrchestratorConfig,
    github_client::MemberDirectory,
    job::JobRequest,
};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("{SIGNATURE_HEADER} header is missing!")]
    MissingSignature,
    #[error("Request signatures didn't match!")]
    SignatureMismatch,
    #[error("Request does not contain valid JSON: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

/// Check a `sha256=<hex>` signature over the raw request body.
///
/// The comparison is constant-time.
pub fn verify_signature(
    body: &[u8],
    secret: &str,
    signature: Option<&str>,
) -> Result<(), WebhookError> {
    let signature = signature.ok_or(WebhookError::MissingSignature)?;
    let expected = signature
        .trim()
        .strip_prefix(SIGNATURE_PREFIX)
        .and_then(|hex_digest| hex::decode(hex_digest).ok())
        .ok_or(WebhookError::SignatureMismatch)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| WebhookError::SignatureMismatch)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::SignatureMismatch)
}

/// Compute the header value GitHub would send for `body`.
pub fn sign(body: &[u8], secret: &str) -> Result<String, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| WebhookError::SignatureMismatch)?;
    mac.update(body);
    Ok(format!(
        "{SIGNATURE_PREFIX}{}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub action: Option<String>,
    pub review: Option<Review>,
    pub pull_request: Option<PullRequest>,
    pub repository: Option<Repository>,
    pub organization: Option<Account>,
    pub sender: Option<Account>,
    pub hook: Option<serde_json::Value>,
    pub zen: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Review {
    pub body: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub head: PullRequestHead,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestHead {
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub repo: Option<HeadRepository>,
}

#[derive(Debug, Deserialize)]
pub struct HeadRepository {
    pub clone_url: String,
}

#[derive(Debug, Deserialize)]
pub struct Repository {
    pub full_name: String,
}

#[derive(Debug, Deserialize)]
pub struct Account {
    pub login: String,
}

impl WebhookEvent {
    pub fn parse(body: &[u8]) -> Result<Self, WebhookError> {
        Ok(serde_json::from_slice(body)?)
    }

    pub fn is_ping(&self) -> bool {
        self.hook.is_some() && self.zen.is_some()
    }

    /// A submitted review whose body is exactly the trigger phrase.
    fn is_trigger(&self, trigger_phrase: &str) -> bool {
        self.action.as_deref() == Some("submitted")
            && self.pull_request.is_some()
            && self
                .review
                .as_ref()
                .and_then(|r| r.body.as_deref())
                .is_some_and(|body| body.trim().eq_ignore_ascii_case(trigger_phrase.trim()))
    }

    fn target(&self) -> Option<JobTarget> {
        let pull_request = self.pull_request.as_ref()?;
        Some(JobTarget {
            repo_full_name: self.repository.as_ref()?.full_name.clone(),
            pull_number: pull_request.number,
            clone_url: pull_request.head.repo.as_ref()?.clone_url.clone(),
            branch: pull_request.head.ref_name.clone(),
            organization: self.organization.as_ref()?.login.clone(),
            sender: self.sender.as_ref()?.login.clone(),
        })
    }
}

/// The fields of an accepted event needed to build a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTarget {
    pub repo_full_name: String,
    pub pull_number: u64,
    pub clone_url: String,
    pub branch: String,
    pub organization: String,
    pub sender: String,
}

impl JobTarget {
    pub fn into_request(self, config: &OrchestratorConfig) -> JobRequest {
        JobRequest {
            workspace_dir: config.workspace_for_branch(&self.branch),
            data_dir: config.data_dir.clone(),
            repo_full_name: self.repo_full_name,
            pull_number: self.pull_number,
            clone_url: self.clone_url,
            branch: self.branch,
            requested_by: self.sender,
            credential: config.github_token.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDecision {
    Ping,
    Ignored(&'static str),
    Accepted(JobTarget),
}

/// Decide whether an authenticated event should start a job.
///
/// Organization membership is only looked up for events that already match
/// the trigger. A failed lookup counts as "not a member".
pub async fn classify(
    event: &WebhookEvent,
    trigger_phrase: &str,
    directory: &dyn MemberDirectory,
) -> EventDecision {
    if event.is_ping() {
        return EventDecision::Ping;
    }
    if !event.is_trigger(trigger_phrase) {
        return EventDecision::Ignored("not a trigger review");
    }
    let Some(target) = event.target() else {
        return EventDecision::Ignored("incomplete pull request payload");
    };

    match directory
        .is_org_member(&target.organization, &target.sender)
        .await
    {
        Ok(true) => EventDecision::Accepted(target),
        Ok(false) => {
            tracing::info!(
                org = %target.organization,
                user = %target.sender,
                "Trigger from non-member ignored"
            );
            EventDecision::Ignored("sender is not an organization member")
        }
        Err(e) => {
            tracing::warn!(
                org = %target.organization,
                user = %target.sender,
                error = %e,
                "Membership lookup failed, ignoring trigger"
            );
            EventDecision::Ignored("membership could not be verified")
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::services::github_client::GitHubClientError;

    struct Members(Result<bool, ()>);

    #[async_trait]
    impl MemberDirectory for Members {
        async fn is_org_member(&self, _: &str, _: &str) -> Result<bool, GitHubClientError> {
            self.0
                .map_err(|_| GitHubClientError::ApiError("rate limited".to_string()))
        }
    }

    fn review_event(body: &str) -> serde_json::Value {
        json!({
            "action": "submitted",
            "review": { "body": body },
            "pull_request": {
                "number": 42,
                "head": {
                    "ref": "feature-x",
                    "repo": { "clone_url": "https://github.com/fork/repo.git" }
                }
            },
            "repository": { "full_name": "org/repo" },
            "organization": { "login": "org" },
            "sender": { "login": "alice" }
        })
    }

    fn parse(value: serde_json::Value) -> WebhookEvent {
        WebhookEvent::parse(value.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_signature_roundtrip() {
        let body = br#"{"zen":"hi"}"#;
        let header = sign(body, "secret").unwrap();
        assert!(header.starts_with("sha256="));
        assert!(verify_signature(body, "secret", Some(&header)).is_ok());
    }

    #[test]
    fn test_signature_failures() {
        let body = b"payload";
        let header = sign(body, "secret").unwrap();

        assert!(matches!(
            verify_signature(body, "secret", None),
            Err(WebhookError::MissingSignature)
        ));
        assert!(matches!(
            verify_signature(body, "other", Some(&header)),
            Err(WebhookError::SignatureMismatch)
        ));
        assert!(matches!(
            verify_signature(b"tampered", "secret", Some(&header)),
            Err(WebhookError::SignatureMismatch)
        ));
        assert!(matches!(
            verify_signature(body, "secret", Some(header.trim_start_matches("sha256="))),
            Err(WebhookError::SignatureMismatch)
        ));
        assert!(matches!(
            verify_signature(body, "secret", Some("sha256=not-hex")),
            Err(WebhookError::SignatureMismatch)
        ));
    }

    #[tokio::test]
    async fn test_classify_ping() {
        let event = parse(json!({ "zen": "Keep it logically awesome.", "hook": {} }));
        assert_eq!(
            classify(&event, "start behave test", &Members(Ok(true))).await,
            EventDecision::Ping
        );
    }

    #[tokio::test]
    async fn test_classify_accepts_trigger_from_member() {
        let event = parse(review_event("  Start Behave Test \n"));
        let decision = classify(&event, "start behave test", &Members(Ok(true))).await;
        assert_eq!(
            decision,
            EventDecision::Accepted(JobTarget {
                repo_full_name: "org/repo".to_string(),
                pull_number: 42,
                clone_url: "https://github.com/fork/repo.git".to_string(),
                branch: "feature-x".to_string(),
                organization: "org".to_string(),
                sender: "alice".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_classify_rejects_other_reviews() {
        let event = parse(review_event("LGTM"));
        assert!(matches!(
            classify(&event, "start behave test", &Members(Ok(true))).await,
            EventDecision::Ignored(_)
        ));

        let mut edited = review_event("start behave test");
        edited["action"] = json!("edited");
        assert!(matches!(
            classify(&parse(edited), "start behave test", &Members(Ok(true))).await,
            EventDecision::Ignored(_)
        ));
    }

    #[tokio::test]
    async fn test_classify_rejects_non_members_and_lookup_errors() {
        let event = parse(review_event("start behave test"));
        assert_eq!(
            classify(&event, "start behave test", &Members(Ok(false))).await,
            EventDecision::Ignored("sender is not an organization member")
        );
        assert_eq!(
            classify(&event, "start behave test", &Members(Err(()))).await,
            EventDecision::Ignored("membership could not be verified")
        );
    }

    #[test]
    fn test_into_request_uses_branch_workspace() {
        let config = OrchestratorConfig::from_map(&std::collections::HashMap::from([
            ("GITHUB_TOKEN".to_string(), "ghp_x".to_string()),
            ("WEBHOOK_SECRET".to_string(), "s".to_string()),
            ("CLONE_DIR_BASE".to_string(), "/srv/ci".to_string()),
        ]))
        .unwrap();
        let target = JobTarget {
            repo_full_name: "org/repo".to_string(),
            pull_number: 3,
            clone_url: "https://github.com/org/repo.git".to_string(),
            branch: "fix-y".to_string(),
            organization: "org".to_string(),
            sender: "bob".to_string(),
        };
        let request = target.into_request(&config);
        assert_eq!(
            request.workspace_dir,
            std::path::PathBuf::from("/srv/ci/pull_request_fix-y")
        );
        assert_eq!(
            request.data_dir,
            std::path::PathBuf::from("/srv/ci/pytroll-image-comparison-tests/data")
        );
        assert_eq!(request.requested_by, "bob");
        assert_eq!(request.secret(), "ghp_x");
    }
}
