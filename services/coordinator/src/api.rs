//! HTTP surface for partition assignment.
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Json, Router};
use plover_coordinator::client::{PartitionRequest, PartitionResponse};
use plover_coordinator::{AssignmentStore, CoordinatorError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub assignments: Arc<dyn AssignmentStore>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn api_internal(message: &str, err: &CoordinatorError) -> ApiError {
    tracing::error!(error = ?err, "coordinator storage error");
    ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: ErrorResponse {
            code: "internal".to_string(),
            message: message.to_string(),
        },
    }
}

fn api_exhausted(topic: &str) -> ApiError {
    ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: ErrorResponse {
            code: "exhausted".to_string(),
            message: format!("no free partition for topic {topic}"),
        },
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", axum::routing::get(health))
        .route("/v1/partitions", axum::routing::post(request_partition))
        .route(
            "/v1/partitions/:service_id",
            axum::routing::delete(release_partition),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn request_partition(
    State(state): State<AppState>,
    Json(body): Json<PartitionRequest>,
) -> Result<Json<PartitionResponse>, ApiError> {
    match state
        .assignments
        .request_partition(&body.topic, &body.service_name, &body.service_id)
        .await
    {
        Ok(partition_index) => {
            metrics::counter!("coordinator_partitions_assigned_total").increment(1);
            Ok(Json(PartitionResponse { partition_index }))
        }
        Err(CoordinatorError::Exhausted(topic)) => Err(api_exhausted(&topic)),
        Err(err) => Err(api_internal("failed to assign partition", &err)),
    }
}

async fn release_partition(
    Path(service_id): Path<String>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    state
        .assignments
        .release_partition(&service_id)
        .await
        .map_err(|err| api_internal("failed to release partition", &err))?;
    Ok(StatusCode::NO_CONTENT)
}
