use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{Map, Value};
use thiserror::Error;

/// Application failure that maps to a specific HTTP status.
///
/// The status is fixed at construction. The only place that reads the
/// internals is the [`IntoResponse`] impl, which every service relies on to
/// turn a returned `UsageError` into a JSON response.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct UsageError {
    message: String,
    status: StatusCode,
    payload: Option<Map<String, Value>>,
}

impl UsageError {
    pub const DEFAULT_STATUS: StatusCode = StatusCode::BAD_REQUEST;

    pub fn new(message: impl Into<String>) -> Self {
        Self::with_status(message, Self::DEFAULT_STATUS)
    }

    pub fn with_status(message: impl Into<String>, status: StatusCode) -> Self {
        Self {
            message: message.into(),
            status,
            payload: None,
        }
    }

    /// Error raised by the demonstration routes that always fail with `status`.
    pub fn forced(status: StatusCode) -> Self {
        Self::with_status(
            format!("Raising status code: {}", status.as_u16()),
            status,
        )
    }

    /// Extra fields merged into the response body next to `message`.
    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Payload fields plus `message`; the error's own message wins a key collision.
    pub fn to_body(&self) -> Value {
        let mut body = self.payload.clone().unwrap_or_default();
        body.insert("message".to_string(), Value::String(self.message.clone()));
        Value::Object(body)
    }
}

impl IntoResponse for UsageError {
    fn into_response(self) -> Response {
        tracing::debug!(
            status = self.status.as_u16(),
            message = self.message.as_str(),
            "responding with usage error"
        );
        (self.status, Json(self.to_body())).into_response()
    }
}
