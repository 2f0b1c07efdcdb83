//! Extraction handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use intake_common::{
    errors::{AppError, Result},
    extraction::{ExtractionResult, Priority, RetryDecision, StatusView},
};

/// Query parameters for starting an extraction
#[derive(Debug, Default, Deserialize, Validate)]
pub struct EnqueueParams {
    /// Numeric queue priority, lower drains first
    #[validate(range(min = 0, max = 9))]
    pub priority: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub document_id: Uuid,
    pub job_id: String,
    pub status_url: String,
    pub live_url: String,
}

/// Start extraction for an uploaded document
pub async fn enqueue_extraction(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    Query(params): Query<EnqueueParams>,
) -> Result<(StatusCode, Json<EnqueueResponse>)> {
    params.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: Some("priority".to_string()),
    })?;

    let priority = params
        .priority
        .map(Priority::from_value)
        .unwrap_or(Priority::Initial);
    let job_id = state
        .extraction
        .enqueue_extraction(document_id, priority)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            document_id,
            job_id,
            status_url: format!("/v1/documents/{document_id}/extraction/status"),
            live_url: format!("/v1/documents/{document_id}/extraction/live"),
        }),
    ))
}

pub async fn get_status(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
) -> Result<Json<StatusView>> {
    Ok(Json(state.extraction.get_status(document_id).await?))
}

pub async fn get_result(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
) -> Result<Json<ExtractionResult>> {
    Ok(Json(state.extraction.get_result(document_id).await?))
}

/// Manual retry; 202 when accepted, 409 when refused
pub async fn request_retry(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
) -> Result<(StatusCode, Json<RetryDecision>)> {
    let decision = state.extraction.request_retry(document_id).await?;
    let status = if decision.accepted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(decision)))
}
