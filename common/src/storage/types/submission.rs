use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Recognized resource type tags. Anything else is accepted and treated as
/// [`ResourceType::Other`].
pub const KNOWN_RESOURCE_TYPES: [&str; 8] = [
    "Patient",
    "Condition",
    "Observation",
    "Procedure",
    "MedicationRequest",
    "Immunization",
    "DiagnosticReport",
    "Encounter",
];

/// One inbound clinical resource, as handed over by the bundle parser.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSubmission {
    pub resource_id: String,
    pub full_url: String,
    pub resource_type: String,
    /// Human-readable rendering of the resource, used for fallback chunking
    /// and sparse retrieval.
    pub content: String,
    /// The raw resource document as JSON text.
    pub resource_json: String,
    pub patient_id: Option<String>,
    pub source_file: Option<String>,
}

impl ResourceSubmission {
    /// Synchronous admission check. A submission that fails here is rejected
    /// before it ever reaches the queue.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.resource_id.trim().is_empty() {
            return Err(AppError::Validation("resource_id is required".to_string()));
        }
        if self.content.trim().is_empty() {
            return Err(AppError::Validation(
                "content must be non-empty".to_string(),
            ));
        }
        if self.resource_json.trim().is_empty() {
            return Err(AppError::Validation(
                "resource_json is required".to_string(),
            ));
        }
        serde_json::from_str::<serde_json::Value>(&self.resource_json).map_err(|e| {
            AppError::Validation(format!("resource_json is not valid JSON: {e}"))
        })?;

        Ok(())
    }

    pub fn is_known_type(&self) -> bool {
        KNOWN_RESOURCE_TYPES.contains(&self.resource_type.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission() -> ResourceSubmission {
        ResourceSubmission {
            resource_id: "obs-1".to_string(),
            full_url: "urn:uuid:obs-1".to_string(),
            resource_type: "Observation".to_string(),
            content: "Cholesterol total 195 mg/dL on 2024-01-15".to_string(),
            resource_json: r#"{"resourceType":"Observation","id":"obs-1"}"#.to_string(),
            patient_id: Some("p-1".to_string()),
            source_file: None,
        }
    }

    #[test]
    fn valid_submission_passes() {
        submission().validate().expect("should validate");
    }

    #[test]
    fn empty_content_is_rejected() {
        let mut sub = submission();
        sub.content = "   ".to_string();
        let err = sub.validate().expect_err("should reject");
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn missing_resource_id_is_rejected() {
        let mut sub = submission();
        sub.resource_id = String::new();
        assert!(sub.validate().is_err());
    }

    #[test]
    fn unparseable_json_is_rejected() {
        let mut sub = submission();
        sub.resource_json = "{not json".to_string();
        let err = sub.validate().expect_err("should reject");
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn unknown_resource_type_is_still_accepted() {
        let mut sub = submission();
        sub.resource_type = "CarePlan".to_string();
        sub.validate().expect("unknown types validate fine");
        assert!(!sub.is_known_type());
    }
}
