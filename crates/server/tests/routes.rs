use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{HeaderValue, Request, StatusCode},
};
use serde_json::{Value, json};
use server::{AppState, routes};
use services::services::{
    config::OrchestratorConfig,
    container::{ContainerRuntime, LifecycleError},
    github_client::{GitHubClientError, MemberDirectory},
    job::{ContainerHandle, RunSpec},
    notification::{NotificationError, Notifier, Recipient},
    webhook::{SIGNATURE_HEADER, sign},
};
use tempfile::TempDir;
use tower::ServiceExt;

const SECRET: &str = "hook-secret";

struct IdleRuntime;

#[async_trait]
impl ContainerRuntime for IdleRuntime {
    async fn provision_workspace(&self, _: &Path) -> Result<(), LifecycleError> {
        Ok(())
    }
    async fn is_running(&self, _: &str) -> Result<bool, LifecycleError> {
        Ok(false)
    }
    async fn run_job(
        &self,
        _: &mut ContainerHandle,
        _: &RunSpec,
    ) -> Result<(), LifecycleError> {
        Ok(())
    }
    async fn fetch_logs(&self, _: &ContainerHandle) -> Result<String, LifecycleError> {
        Ok(String::new())
    }
    async fn copy_artifact(
        &self,
        _: &ContainerHandle,
        _: &str,
        _: &Path,
    ) -> Result<String, LifecycleError> {
        Ok(String::new())
    }
    async fn stop(&self, _: &str) -> Result<(), LifecycleError> {
        Ok(())
    }
    async fn remove(&self, _: &str) -> Result<(), LifecycleError> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(&self, _: &Recipient, message: &str) -> Result<(), NotificationError> {
        self.sent.lock().unwrap().push(message.to_string());
        Ok(())
    }
}

struct OrgMembers(Vec<&'static str>);

#[async_trait]
impl MemberDirectory for OrgMembers {
    async fn is_org_member(&self, _org: &str, user: &str) -> Result<bool, GitHubClientError> {
        Ok(self.0.contains(&user))
    }
}

fn app(notifier: Arc<RecordingNotifier>) -> (Router, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = OrchestratorConfig::from_map(&HashMap::from([
        ("GITHUB_TOKEN".to_string(), "ghp_token".to_string()),
        ("WEBHOOK_SECRET".to_string(), SECRET.to_string()),
        (
            "CLONE_DIR_BASE".to_string(),
            dir.path().display().to_string(),
        ),
    ]))
    .unwrap();
    let state = AppState::new(
        config,
        Arc::new(IdleRuntime),
        notifier,
        Arc::new(OrgMembers(vec!["alice"])),
    );
    (routes::router(state), dir)
}

fn review(body: &str, sender: &str) -> Value {
    json!({
        "action": "submitted",
        "review": { "body": body },
        "pull_request": {
            "number": 5,
            "head": {
                "ref": "feature-x",
                "repo": { "clone_url": "https://github.com/org/repo.git" }
            }
        },
        "repository": { "full_name": "org/repo" },
        "organization": { "login": "org" },
        "sender": { "login": sender }
    })
}

fn signed(body: Vec<u8>) -> Request<Body> {
    let signature = sign(&body, SECRET).unwrap();
    Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("content-type", "application/json")
        .header(SIGNATURE_HEADER, signature)
        .body(Body::from(body))
        .unwrap()
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_missing_signature_is_bad_request() {
    let (app, _dir) = app(Arc::default());
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .body(Body::from("{}"))
        .unwrap();

    let (status, body) = send(app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_wrong_signature_is_forbidden() {
    let (app, _dir) = app(Arc::default());
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header(SIGNATURE_HEADER, sign(b"{}", "not-the-secret").unwrap())
        .body(Body::from("{}"))
        .unwrap();

    let (status, body) = send(app, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "Request signatures didn't match!");
}

#[tokio::test]
async fn test_non_ascii_signature_is_forbidden() {
    let (app, _dir) = app(Arc::default());
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header(
            SIGNATURE_HEADER,
            HeaderValue::from_bytes(b"sha256=\xff\xfe").unwrap(),
        )
        .body(Body::from("{}"))
        .unwrap();

    let (status, _) = send(app, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_signed_non_json_is_bad_request() {
    let (app, _dir) = app(Arc::default());
    let (status, _) = send(app, signed(b"not json".to_vec())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_ping() {
    let (app, _dir) = app(Arc::default());
    let body = json!({ "zen": "Design for failure.", "hook": { "id": 1 } });
    let (status, body) = send(app, signed(body.to_string().into_bytes())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Ping received successfully");
}

#[tokio::test]
async fn test_non_member_trigger_is_ignored() {
    let notifier = Arc::new(RecordingNotifier::default());
    let (app, _dir) = app(notifier.clone());
    let event = review("start behave test", "mallory");

    let (status, body) = send(app, signed(event.to_string().into_bytes())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Event ignored");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(notifier.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_member_trigger_starts_job() {
    let notifier = Arc::new(RecordingNotifier::default());
    let (app, _dir) = app(notifier.clone());
    let event = review("Start behave test", "alice");

    let (status, body) = send(app, signed(event.to_string().into_bytes())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Processing started");

    for _ in 0..100 {
        if notifier.sent.lock().unwrap().len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let sent = notifier.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], "Starting to clone and test the repository org/repo");
    assert!(sent[1].starts_with("The testing process was executed successfully"));
}

#[tokio::test]
async fn test_health() {
    let (app, _dir) = app(Arc::default());
    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["data"]["busy"], false);
    assert_eq!(body["data"]["container_name"], "clone-repo-image");
}
