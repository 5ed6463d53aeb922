use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use common::storage::types::submission::ResourceSubmission;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{api_state::ApiState, error::ApiError};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    pub id: String,
    pub full_url: String,
    pub resource_type: String,
    pub content: String,
    pub resource_json: String,
    #[serde(default)]
    pub patient_id: Option<String>,
    #[serde(default)]
    pub source_file: Option<String>,
}

/// Accept one resource for ingestion. Validation happens synchronously; the
/// acknowledgement does not wait for processing.
pub async fn ingest_resource(
    State(state): State<ApiState>,
    Json(request): Json<IngestRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let submission = ResourceSubmission {
        resource_id: request.id,
        full_url: request.full_url,
        resource_type: request.resource_type,
        content: request.content,
        resource_json: request.resource_json,
        patient_id: request.patient_id,
        source_file: request.source_file,
    };

    submission.validate()?;

    let content_length = submission.content.chars().count();
    let resource_id = submission.resource_id.clone();
    let resource_type = submission.resource_type.clone();

    state.queue.submit(submission).await?;
    debug!(%resource_id, %resource_type, "submission accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "id": resource_id,
            "resourceType": resource_type,
            "contentLength": content_length,
        })),
    ))
}
