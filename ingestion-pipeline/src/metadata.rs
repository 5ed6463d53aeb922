use common::storage::types::{
    chunk::{chunk_id_for, ChunkMetadata},
    submission::ResourceSubmission,
};
use serde_json::Value;

/// Date fields to probe per resource type, in priority order. First present
/// value wins; a missing date leaves the metadata key out entirely.
fn date_field_candidates(resource_type: &str) -> &'static [&'static str] {
    match resource_type {
        "Observation" => &["effectiveDateTime", "issued"],
        "Condition" => &["onsetDateTime", "recordedDate"],
        "Procedure" => &["performedDateTime"],
        "MedicationRequest" => &["authoredOn"],
        "Immunization" => &["occurrenceDateTime"],
        "DiagnosticReport" => &["effectiveDateTime"],
        "Encounter" => &["period.start"],
        "Patient" => &["birthDate"],
        _ => &[],
    }
}

/// Build the metadata document for one chunk of a submission.
pub fn extract_chunk_metadata(
    submission: &ResourceSubmission,
    resource: &Value,
    chunk_index: usize,
    total_chunks: usize,
    chunk_text: &str,
) -> ChunkMetadata {
    ChunkMetadata {
        patient_id: submission.patient_id.clone(),
        resource_id: submission.resource_id.clone(),
        resource_type: submission.resource_type.clone(),
        full_url: submission.full_url.clone(),
        source_file: submission.source_file.clone(),
        chunk_id: chunk_id_for(&submission.resource_id, chunk_index),
        chunk_index,
        total_chunks,
        chunk_size: chunk_text.chars().count(),
        effective_date: extract_effective_date(&submission.resource_type, resource),
        status: string_at(resource, "status"),
        last_updated: string_at(resource, "meta.lastUpdated"),
    }
}

fn extract_effective_date(resource_type: &str, resource: &Value) -> Option<String> {
    date_field_candidates(resource_type)
        .iter()
        .find_map(|path| string_at(resource, path))
}

/// Look up a dotted path and return it when it is a non-empty string.
fn string_at(resource: &Value, path: &str) -> Option<String> {
    let mut node = resource;
    for segment in path.split('.') {
        node = node.get(segment)?;
    }
    node.as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}
