//! Axum router and HTTP request handlers.
//!
//! Routes:
//! - `POST /_peer/v1/layers/download`     - Download a blob into this node's layer store
//! - `POST /_peer/v1/layers/check-static` - Verify a static layer by size
//! - `POST /_peer/v1/layers/check-oci`    - Verify an OCI-derived layer
//! - `POST /_coordinator/v1/auth`         - Answer a registry Bearer challenge
//! - `POST /_coordinator/v1/manifest`     - Collapsed manifest fetch
//! - `POST /_coordinator/v1/layer`        - Resolve a blob to a node holding it
//! - `GET  /healthz`                      - Health check
//! - `GET  /metrics`                      - Prometheus metrics

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::context::CallContext;
use crate::error::Error;
use crate::model::{split_digest, DownloadLayerRequest, LayerResult};
use crate::peer::{
    CheckOciBody, CheckStaticBody, DownloadLayerBody, ErrorBody, CHECK_OCI_PATH,
    CHECK_STATIC_PATH, DOWNLOAD_PATH,
};
use crate::AppState;

pub const AUTH_PATH: &str = "/_coordinator/v1/auth";
pub const MANIFEST_PATH: &str = "/_coordinator/v1/manifest";
pub const LAYER_PATH: &str = "/_coordinator/v1/layer";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Peer RPC
        .route(DOWNLOAD_PATH, post(handle_download))
        .route(CHECK_STATIC_PATH, post(handle_check_static))
        .route(CHECK_OCI_PATH, post(handle_check_oci))
        // Coordinator
        .route(AUTH_PATH, post(handle_auth))
        .route(MANIFEST_PATH, post(handle_manifest))
        .route(LAYER_PATH, post(handle_layer))
        // Health, metrics
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct AuthRequest {
    pub origin_host: String,
    pub www_authenticate: String,
}

#[derive(Serialize, Deserialize)]
pub struct AuthResponse {
    pub token: String,
}

#[derive(Deserialize)]
pub struct ManifestRequest {
    pub origin_host: String,
    pub repository: String,
    pub tag: String,
    /// Defaults to `/v2/<repository>/manifests/<tag>`.
    #[serde(default)]
    pub manifest_path: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Deserialize)]
pub struct LayerRequest {
    pub origin_host: String,
    pub repository: String,
    pub digest: String,
    /// Defaults to `/v2/<repository>/blobs/<digest>`.
    #[serde(default)]
    pub origin_path: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

// ---------------------------------------------------------------------------
// Peer handlers
// ---------------------------------------------------------------------------

/// `POST /_peer/v1/layers/download`
async fn handle_download(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DownloadLayerBody>,
) -> Result<Json<LayerResult>, AppError> {
    let ctx = state.coordinator.layer_context();
    let result = ctx
        .run(state.node.download_layer(
            &body.origin_host,
            &body.layer_url,
            body.token.as_deref(),
        ))
        .await?;
    Ok(Json(result))
}

/// `POST /_peer/v1/layers/check-static`
async fn handle_check_static(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CheckStaticBody>,
) -> Result<Json<LayerResult>, AppError> {
    let result = state
        .node
        .check_static_layer(&body.digest, &body.path, body.expected_length)
        .await?;
    Ok(Json(result))
}

/// `POST /_peer/v1/layers/check-oci`
async fn handle_check_oci(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CheckOciBody>,
) -> Result<Json<LayerResult>, AppError> {
    let result = state
        .node
        .check_oci_layer(&body.digest, &body.oci_type)
        .await?;
    Ok(Json(result))
}

// ---------------------------------------------------------------------------
// Coordinator handlers
// ---------------------------------------------------------------------------

/// `POST /_coordinator/v1/auth`
async fn handle_auth(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AuthRequest>,
) -> Result<Json<AuthResponse>, AppError> {
    let ctx = state.coordinator.metadata_context();
    let token = state
        .coordinator
        .auth_registry(&ctx, &body.origin_host, &body.www_authenticate)
        .await?;
    Ok(Json(AuthResponse { token }))
}

/// `POST /_coordinator/v1/manifest`
///
/// Replies with the raw manifest body and the origin's content type.
async fn handle_manifest(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ManifestRequest>,
) -> Result<Response, AppError> {
    let path = body
        .manifest_path
        .clone()
        .unwrap_or_else(|| format!("/v2/{}/manifests/{}", body.repository, body.tag));
    let ctx = state.coordinator.metadata_context();
    let manifest = state
        .coordinator
        .get_manifest(
            &ctx,
            &body.origin_host,
            &body.repository,
            &body.tag,
            &path,
            body.token.as_deref(),
        )
        .await?;

    let content_type = manifest
        .content_type
        .unwrap_or_else(|| "application/json".to_string());
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        manifest.body,
    )
        .into_response())
}

/// `POST /_coordinator/v1/layer`
async fn handle_layer(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LayerRequest>,
) -> Result<Json<LayerResult>, AppError> {
    split_digest(&body.digest)?;
    let request = DownloadLayerRequest {
        origin_path: body
            .origin_path
            .unwrap_or_else(|| format!("/v2/{}/blobs/{}", body.repository, body.digest)),
        origin_host: body.origin_host,
        bearer_token: body.token,
        repository: body.repository,
        digest: body.digest,
    };
    let ctx: CallContext = state.coordinator.layer_context();
    let result = state.coordinator.fetch_layer(&ctx, &request).await?;
    Ok(Json(result))
}

// ---------------------------------------------------------------------------
// Health, metrics
// ---------------------------------------------------------------------------

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    crate::health::health_handler(State(state.health.clone())).await
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by this node.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state.metrics.encode().map_err(Error::Internal)?;
    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Maps [`Error`] to an HTTP status with a JSON `{ "error": ... }` body.
#[derive(Debug)]
pub struct AppError(pub Error);

impl AppError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::ConfigNotFound { .. }
            | Error::LayerNotFound { .. }
            | Error::SizeMismatch { .. } => StatusCode::NOT_FOUND,
            Error::InvalidChallenge(_) | Error::InvalidDigest(_) => StatusCode::BAD_REQUEST,
            Error::TokenExchange { .. }
            | Error::AuthLoopDetected { .. }
            | Error::RetriesExhausted { .. }
            | Error::UpstreamStatus { .. }
            | Error::MissingContentLength { .. }
            | Error::Transport(_)
            | Error::Peer { .. } => StatusCode::BAD_GATEWAY,
            Error::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Error::Cancelled
            | Error::Io(_)
            | Error::Lock { .. }
            | Error::Store(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, %status, "request failed");
        } else {
            warn!(error = %self.0, %status, "request rejected");
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        AppError(err)
    }
}
