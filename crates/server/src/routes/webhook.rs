use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::Json as ResponseJson,
    routing::post,
};
use secrecy::ExposeSecret;
use services::services::webhook::{
    EventDecision, SIGNATURE_HEADER, WebhookEvent, classify, verify_signature,
};
use utils::response::ApiResponse;

use crate::{AppState, error::ApiError};

pub fn router() -> Router<AppState> {
    Router::new().route("/webhook", post(receive_webhook))
}

/// Verify, filter and dispatch one GitHub delivery.
///
/// Accepted events are handed to the orchestrator on a background task; the
/// response is sent before the job starts.
async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    let signature = headers.get(SIGNATURE_HEADER).map(|value| {
        value.to_str().unwrap_or_else(|_| {
            tracing::warn!(
                header = SIGNATURE_HEADER,
                "Signature header is not visible ASCII, treating it as a mismatch"
            );
            ""
        })
    });
    verify_signature(
        &body,
        state.config().webhook_secret.expose_secret(),
        signature,
    )?;

    let event = WebhookEvent::parse(&body)?;
    let message = match classify(&event, &state.config().trigger_phrase, state.members()).await {
        EventDecision::Ping => "Ping received successfully",
        EventDecision::Accepted(target) => {
            tracing::info!(
                repo = %target.repo_full_name,
                pull_number = target.pull_number,
                branch = %target.branch,
                sender = %target.sender,
                "Trigger accepted"
            );
            let request = target.into_request(state.config());
            state.orchestrator().dispatch(request);
            "Processing started"
        }
        EventDecision::Ignored(reason) => {
            tracing::debug!(reason, "Webhook event ignored");
            "Event ignored"
        }
    };

    Ok(ResponseJson(ApiResponse::message(message)))
}
