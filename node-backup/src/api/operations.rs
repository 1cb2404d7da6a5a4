//! Operation submission and status endpoints.

use super::AppState;
use crate::operations::Operation;
use crate::request::OperationRequest;
use crate::utils::errors::BackupError;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

/// Error returned by the operation endpoints, rendered as `{"error": ...}`
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl From<BackupError> for ApiError {
    fn from(e: BackupError) -> Self {
        match e {
            BackupError::InvalidRequest(_)
            | BackupError::SelectorFormat { .. }
            | BackupError::UnknownProvider(_) => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn not_found(id: Uuid) -> ApiError {
    ApiError::NotFound(format!("operation {} not found", id))
}

/// POST /operations - Start a backup or restore
pub async fn submit_operation(
    State(state): State<AppState>,
    Json(request): Json<OperationRequest>,
) -> Result<(StatusCode, Json<Operation>), ApiError> {
    let operation = state.operations.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(operation)))
}

/// GET /operations
pub async fn list_operations(State(state): State<AppState>) -> Json<Vec<Operation>> {
    Json(state.operations.list().await)
}

/// GET /operations/{id}
pub async fn get_operation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Operation>, ApiError> {
    state.operations.get(id).await.map(Json).ok_or_else(|| not_found(id))
}

/// POST /operations/{id}/cancel
///
/// Responds once the operation has stopped and cleaned up.
pub async fn cancel_operation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Operation>, ApiError> {
    tracing::info!(operation_id = %id, "Cancel requested");
    state
        .operations
        .cancel(id)
        .await
        .map(Json)
        .ok_or_else(|| not_found(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{create_app_state, create_router};
    use crate::cluster::NodetoolClusterControl;
    use crate::operations::Engine;
    use crate::storage::StorageRegistry;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn router() -> axum::Router {
        let engine = Engine::new(
            Arc::new(NodetoolClusterControl::new("nodetool", Vec::new())),
            StorageRegistry::with_defaults(),
        );
        create_router(create_app_state("node1", engine))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_operation_is_not_found() {
        let response = router()
            .oneshot(
                Request::get(format!("/operations/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("not found"));
    }

    #[tokio::test]
    async fn test_invalid_request_is_bad_request() {
        let body = json!({
            "type": "backup",
            "storage_location": "memory://bucket",
            "snapshot_tag": "not/safe",
        });

        let response = router()
            .oneshot(
                Request::post("/operations")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_starts_empty() {
        let response = router()
            .oneshot(Request::get("/operations").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!([]));
    }
}
