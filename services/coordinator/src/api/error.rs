use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::acquire::AcquireError;

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://scanhub.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            code,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(
        status: StatusCode,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn gateway_timeout(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::GATEWAY_TIMEOUT, code, message)
    }
}

/// The single point mapping acquisition outcomes onto the externally
/// visible status set: 400 for client input, 404 when nothing can be
/// routed, 504 for anything deadline-classified, 500 for the rest.
impl From<AcquireError> for ApiError {
    fn from(error: AcquireError) -> Self {
        match &error {
            AcquireError::EmptyDigest => {
                ApiError::bad_request("missing_digest", error.to_string())
            }
            AcquireError::NotFoundInCluster => {
                ApiError::not_found("image_not_found", "Image not found in cluster")
            }
            AcquireError::NoNode => ApiError::not_found(
                "image_not_on_node",
                "Image not available on any cluster node",
            ),
            AcquireError::NotScheduled { .. } => {
                ApiError::not_found("agent_not_scheduled", error.to_string())
            }
            AcquireError::WaitTimeout { .. } => {
                ApiError::gateway_timeout("agent_wait_timeout", error.to_string())
            }
            AcquireError::FetchTimeout { .. } => {
                ApiError::gateway_timeout("agent_fetch_timeout", error.to_string())
            }
            AcquireError::Cancelled => {
                ApiError::gateway_timeout("request_cancelled", error.to_string())
            }
            AcquireError::RemoteError { .. } => {
                ApiError::internal("agent_remote_error", error.to_string())
            }
            AcquireError::AgentUnreachable { .. } => {
                ApiError::internal("agent_unreachable", error.to_string())
            }
            AcquireError::Locate { .. } => ApiError::internal("locator_error", error.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}
