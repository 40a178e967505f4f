//! HTTP server for artifact cache.

use std::io;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use cachebox_core::{ArtifactKey, CacheCoordinator, Error, Lookup};
use futures::{StreamExt, TryStreamExt};
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Server state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    coordinator: Arc<CacheCoordinator>,
}

impl AppState {
    /// Creates new app state.
    pub fn new(coordinator: Arc<CacheCoordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<CacheCoordinator> {
        &self.coordinator
    }
}

/// Creates the HTTP router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/v1/artifacts/*key",
            get(download_artifact)
                .head(check_artifact)
                .put(upload_artifact),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn parse_key(raw: &str) -> Result<ArtifactKey, ServerError> {
    Ok(ArtifactKey::new(raw.trim_start_matches('/'))?)
}

/// Uploads an artifact, streaming the request body to the backend.
///
/// PUT /v1/artifacts/{key}
async fn upload_artifact(
    State(state): State<AppState>,
    Path(raw_key): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ServerError> {
    let key = parse_key(&raw_key)?;

    // Refuse oversized uploads before opening a backend stream
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if let (Some(declared), Some(limit)) =
        (declared, state.coordinator.options().max_artifact_size)
    {
        if declared > limit {
            return Err(Error::ArtifactTooLarge {
                key: key.to_string(),
                limit,
            }
            .into());
        }
    }

    let stream = body
        .into_data_stream()
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e)));
    let receipt = state.coordinator.upload(&key, stream).await?;

    let response = Response::builder()
        .status(StatusCode::CREATED)
        .header("X-Artifact-Sha256", receipt.sha256)
        .header("X-Artifact-Size", receipt.size)
        .body(Body::empty())
        .map_err(|e| ServerError::Internal(format!("Failed to create response: {}", e)))?;

    Ok(response)
}

/// Downloads an artifact.
///
/// GET /v1/artifacts/{key}
async fn download_artifact(
    State(state): State<AppState>,
    Path(raw_key): Path<String>,
) -> Result<Response, ServerError> {
    let key = parse_key(&raw_key)?;

    let mut stream = match state.coordinator.lookup(&key).await? {
        Lookup::Hit(stream) => stream,
        Lookup::Miss => return Err(ServerError::NotFound),
    };

    // Wait for the first chunk so a failed fetch still gets a proper status
    let body = match stream.next().await {
        Some(Err(e)) => return Err(e.into()),
        Some(Ok(first)) => Body::from_stream(
            futures::stream::once(async move { Ok::<_, Error>(first) }).chain(stream),
        ),
        None => Body::empty(),
    };

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(body)
        .map_err(|e| ServerError::Internal(format!("Failed to create response: {}", e)))?;

    Ok(response)
}

/// Checks if an artifact exists.
///
/// HEAD /v1/artifacts/{key}
async fn check_artifact(
    State(state): State<AppState>,
    Path(raw_key): Path<String>,
) -> Result<Response, ServerError> {
    let key = parse_key(&raw_key)?;

    if state.coordinator.contains(&key).await? {
        Ok(StatusCode::OK.into_response())
    } else {
        Err(ServerError::NotFound)
    }
}

/// Server error types.
#[derive(Debug)]
pub enum ServerError {
    BadRequest(String),
    Forbidden(String),
    NotFound,
    Conflict(String),
    PayloadTooLarge(String),
    BadGateway(String),
    Unavailable(String),
    Internal(String),
}

impl From<Error> for ServerError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::InvalidKey(_) => ServerError::BadRequest(message),
            // Io only arises from reading the client's request body
            Error::Io(_) => ServerError::BadRequest(message),
            Error::ReadOnly => ServerError::Forbidden(message),
            Error::NotFound { .. } => ServerError::NotFound,
            Error::UploadInProgress { .. } => ServerError::Conflict(message),
            Error::ArtifactTooLarge { .. } => ServerError::PayloadTooLarge(message),
            Error::Backend { .. } => ServerError::BadGateway(message),
            Error::Transient { .. } | Error::ShutDown => ServerError::Unavailable(message),
            Error::Configuration(_) | Error::Toml { .. } => ServerError::Internal(message),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ServerError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ServerError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ServerError::NotFound => (StatusCode::NOT_FOUND, "Artifact not found".to_string()),
            ServerError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ServerError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            ServerError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ServerError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ServerError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        if status.is_server_error() {
            warn!(status = %status, error = %message, "request failed");
        }

        let body = axum::Json(serde_json::json!({ "error": message }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let status = |err: Error| ServerError::from(err).into_response().status();

        assert_eq!(status(Error::ReadOnly), StatusCode::FORBIDDEN);
        assert_eq!(
            status(Error::UploadInProgress { key: "k".into() }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(Error::Transient {
                key: "k".into(),
                message: "timeout".into()
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status(Error::Backend {
                key: "k".into(),
                message: "access denied".into()
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status(Error::NotFound { key: "k".into() }),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_parse_key_strips_leading_slash() {
        assert_eq!(parse_key("/ci/build-42").unwrap().as_str(), "ci/build-42");
        assert!(parse_key("bad key").is_err());
    }
}
