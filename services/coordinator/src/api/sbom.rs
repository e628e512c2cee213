//! SBOM and instance endpoints.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use scanhub_imageref::{normalize_digest, sanitize_for_filename, ImageReference};

use crate::acquire::AcquireError;
use crate::api::error::ApiError;
use crate::state::AppState;

/// Create SBOM API routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sbom/{digest}", get(get_sbom))
        // A digest-less request is a client error, not a router miss.
        .route("/sbom", get(missing_digest))
        .route("/sbom/", get(missing_digest))
        .route("/instances", get(list_instances))
}

async fn missing_digest() -> ApiError {
    AcquireError::EmptyDigest.into()
}

/// One tracked container instance.
#[derive(Debug, Serialize)]
pub struct InstanceResponse {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub node_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    pub image: ImageReference,
}

/// Response for listing tracked instances.
#[derive(Debug, Serialize)]
pub struct ListInstancesResponse {
    pub items: Vec<InstanceResponse>,
    pub count: usize,
}

/// Serve the SBOM for an image digest.
///
/// The digest is accepted with or without its `sha256:` prefix; bare
/// 64-hex-char digests are normalized before lookup.
async fn get_sbom(
    State(state): State<AppState>,
    Path(digest): Path<String>,
) -> Result<Response, ApiError> {
    let cancel = state.request_token();
    let sbom = state.coordinator().acquire(&digest, &cancel).await?;

    let filename = format!(
        "sbom_{}.json",
        sanitize_for_filename(&normalize_digest(&digest))
    );
    let disposition = format!("attachment; filename=\"{filename}\"");

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition)
            .map_err(|_| ApiError::internal("invalid_digest", "Digest not representable"))?,
    );

    // Content-Length is set by axum from the body size.
    Ok((headers, sbom).into_response())
}

/// List the container instances the topology watcher currently tracks.
async fn list_instances(State(state): State<AppState>) -> impl IntoResponse {
    let items: Vec<InstanceResponse> = state
        .registry()
        .list()
        .await
        .into_iter()
        .map(|instance| InstanceResponse {
            namespace: instance.id.namespace,
            pod: instance.id.pod,
            container: instance.id.container,
            node_name: instance.node_name,
            runtime: instance.runtime,
            image: instance.image,
        })
        .collect();
    let count = items.len();

    Json(ListInstancesResponse { items, count })
}
