use crate::stored_object;

/// Structured metadata carried by every persisted chunk. Optional keys are
/// omitted from the stored document when absent rather than written as null.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ChunkMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    pub resource_id: String,
    pub resource_type: String,
    pub full_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    pub chunk_id: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    /// Chunk length in characters.
    pub chunk_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

/// Equality filter over the indexed metadata keys. Empty means unfiltered.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct MetadataFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl MetadataFilter {
    pub fn is_empty(&self) -> bool {
        self.patient_id.is_none()
            && self.resource_id.is_none()
            && self.resource_type.is_none()
            && self.source_file.is_none()
            && self.status.is_none()
    }

    pub fn for_patient(patient_id: &str) -> Self {
        Self {
            patient_id: Some(patient_id.to_string()),
            ..Self::default()
        }
    }

    pub fn with_resource_type(mut self, resource_type: &str) -> Self {
        self.resource_type = Some(resource_type.to_string());
        self
    }

    /// Bindable equality conditions: (metadata field path, bind name, value).
    pub fn conditions(&self) -> Vec<(&'static str, &'static str, String)> {
        let mut out = Vec::new();
        if let Some(v) = &self.patient_id {
            out.push(("metadata.patient_id", "f_patient_id", v.clone()));
        }
        if let Some(v) = &self.resource_id {
            out.push(("metadata.resource_id", "f_resource_id", v.clone()));
        }
        if let Some(v) = &self.resource_type {
            out.push(("metadata.resource_type", "f_resource_type", v.clone()));
        }
        if let Some(v) = &self.source_file {
            out.push(("metadata.source_file", "f_source_file", v.clone()));
        }
        if let Some(v) = &self.status {
            out.push(("metadata.status", "f_status", v.clone()));
        }
        out
    }
}

/// Canonical chunk id: `{resource_id}_chunk_{index}`. Upserts keyed on this
/// make re-ingestion idempotent.
pub fn chunk_id_for(resource_id: &str, index: usize) -> String {
    format!("{resource_id}_chunk_{index}")
}

stored_object!(ChunkRecord, "chunk", {
    content: String,
    embedding: Vec<f32>,
    metadata: ChunkMetadata
});

impl ChunkRecord {
    pub fn new(content: String, embedding: Vec<f32>, metadata: ChunkMetadata) -> Self {
        let now = Utc::now();
        Self {
            id: metadata.chunk_id.clone(),
            created_at: now,
            updated_at: now,
            content,
            embedding,
            metadata,
        }
    }
}
