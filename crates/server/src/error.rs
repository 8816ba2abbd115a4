use axum::{
    http::StatusCode,
    response::{IntoResponse, Json as ResponseJson, Response},
};
use services::services::webhook::WebhookError;
use thiserror::Error;
use utils::response::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Webhook(#[from] WebhookError),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Webhook(WebhookError::MissingSignature) => StatusCode::BAD_REQUEST,
            ApiError::Webhook(WebhookError::SignatureMismatch) => StatusCode::FORBIDDEN,
            ApiError::Webhook(WebhookError::InvalidPayload(_)) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        tracing::warn!(status = status.as_u16(), error = %self, "Request rejected");
        (status, ResponseJson(ApiResponse::<()>::error(self.to_string()))).into_response()
    }
}
