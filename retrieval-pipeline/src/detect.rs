/// Keyword-to-resource-type map consulted on dense and hybrid queries when the
/// caller did not filter on a resource type. First matching type wins; the
/// match is whole-word (phrases match consecutive words).
const TYPE_KEYWORDS: [(&str, &[&str]); 7] = [
    (
        "Condition",
        &[
            "condition",
            "diagnosis",
            "disease",
            "problem",
            "illness",
            "disorder",
        ],
    ),
    (
        "Observation",
        &[
            "lab",
            "test",
            "vital",
            "blood pressure",
            "glucose",
            "cholesterol",
        ],
    ),
    (
        "MedicationRequest",
        &["medication", "drug", "prescription", "rx"],
    ),
    (
        "Procedure",
        &["surgery", "surgical", "operation", "intervention"],
    ),
    ("Immunization", &["vaccine", "vaccination", "immunized"]),
    (
        "Encounter",
        &["visit", "appointment", "admission", "hospitalization"],
    ),
    (
        "DiagnosticReport",
        &["imaging", "radiology", "xray", "mri", "ct scan"],
    ),
];

/// Infer a resource-type filter from the query text, or None when no keyword
/// matches.
pub fn detect_resource_type(query: &str) -> Option<&'static str> {
    let words: Vec<String> = query
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_ascii_lowercase)
        .collect();
    if words.is_empty() {
        return None;
    }

    for (resource_type, keywords) in TYPE_KEYWORDS {
        for keyword in keywords {
            if matches_keyword(&words, keyword) {
                return Some(resource_type);
            }
        }
    }
    None
}

fn matches_keyword(words: &[String], keyword: &str) -> bool {
    let parts: Vec<&str> = keyword.split_whitespace().collect();
    match parts.as_slice() {
        [single] => words.iter().any(|w| w == single),
        phrase => words
            .windows(phrase.len())
            .any(|window| window.iter().zip(phrase).all(|(w, p)| w == p)),
    }
}
