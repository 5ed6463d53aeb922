use common::error::AppError;
use serde_json::{Map, Value};
use text_splitter::{ChunkConfig, TextSplitter};

/// Character limits for emitted chunks. The final chunk of a resource may be
/// shorter than `min_size`; overlap only applies to the character fallback.
#[derive(Debug, Clone, Copy)]
pub struct ChunkLimits {
    pub min_size: usize,
    pub max_size: usize,
    pub overlap: usize,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            min_size: 500,
            max_size: 1000,
            overlap: 200,
        }
    }
}

impl ChunkLimits {
    pub fn from_config(config: &common::utils::config::AppConfig) -> Self {
        Self {
            min_size: config.chunk_min_size,
            max_size: config.chunk_max_size,
            overlap: config.chunker_overlap,
        }
    }
}

/// Splits one resource into ordered chunk texts. The preferred strategy cuts
/// the JSON tree at the deepest object/array boundary that keeps fragments
/// within the size limits, so every emitted chunk parses as JSON on its own.
/// When a leaf value is too large to subdivide, the whole resource falls back
/// to overlapping character splits of the human-readable content.
#[derive(Debug, Clone, Copy, Default)]
pub struct Chunker {
    limits: ChunkLimits,
}

impl Chunker {
    pub fn new(limits: ChunkLimits) -> Self {
        Self { limits }
    }

    /// Deterministic for identical input and limits; always at least one chunk.
    pub fn chunk_resource(
        &self,
        resource_json: &str,
        content: &str,
    ) -> Result<Vec<String>, AppError> {
        let value: Value = serde_json::from_str(resource_json)
            .map_err(|e| AppError::Validation(format!("resource_json is not valid JSON: {e}")))?;

        let whole = value.to_string();
        if char_len(&whole) <= self.limits.max_size {
            return Ok(vec![whole]);
        }

        match split_node(&value, self.limits.max_size) {
            Some(fragments) => {
                let chunks: Vec<String> = fragments
                    .iter()
                    .map(Value::to_string)
                    .filter(|text| !text.trim().is_empty())
                    .collect();
                if chunks.is_empty() {
                    self.fallback_chunks(content)
                } else {
                    Ok(chunks)
                }
            }
            None => self.fallback_chunks(content),
        }
    }

    fn fallback_chunks(&self, content: &str) -> Result<Vec<String>, AppError> {
        let config = ChunkConfig::new(self.limits.min_size..self.limits.max_size)
            .with_overlap(self.limits.overlap)
            .map_err(|e| AppError::Validation(format!("invalid chunker configuration: {e}")))?;
        let splitter = TextSplitter::new(config);

        let chunks: Vec<String> = splitter.chunks(content).map(str::to_owned).collect();
        if chunks.is_empty() {
            Ok(vec![content.to_owned()])
        } else {
            Ok(chunks)
        }
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn json_len(value: &Value) -> usize {
    char_len(&value.to_string())
}

/// Split a JSON node into fragments of at most `max_size` serialized
/// characters. Returns None when an indivisible leaf exceeds the budget.
fn split_node(value: &Value, max_size: usize) -> Option<Vec<Value>> {
    if json_len(value) <= max_size {
        return Some(vec![value.clone()]);
    }

    match value {
        Value::Object(map) => split_object(map, max_size),
        Value::Array(items) => split_array(items, max_size),
        _ => None,
    }
}

fn split_object(map: &Map<String, Value>, max_size: usize) -> Option<Vec<Value>> {
    let mut fragments = Vec::new();
    let mut current = Map::new();

    for (key, child) in map {
        let mut single = Map::new();
        single.insert(key.clone(), child.clone());
        let piece = Value::Object(single);

        if json_len(&piece) > max_size {
            flush_object(&mut fragments, &mut current);

            // Recurse into the child, reserving room for the `{"key":...}`
            // wrapper so re-wrapped fragments still fit.
            let overhead = json_len(&piece).saturating_sub(json_len(child));
            let budget = max_size.checked_sub(overhead)?;
            for sub in split_node(child, budget)? {
                let mut wrapped = Map::new();
                wrapped.insert(key.clone(), sub);
                fragments.push(Value::Object(wrapped));
            }
            continue;
        }

        let mut tentative = current.clone();
        tentative.insert(key.clone(), child.clone());
        if !current.is_empty() && json_len(&Value::Object(tentative.clone())) > max_size {
            flush_object(&mut fragments, &mut current);
            current.insert(key.clone(), child.clone());
        } else {
            current = tentative;
        }
    }

    flush_object(&mut fragments, &mut current);
    Some(fragments)
}

fn flush_object(fragments: &mut Vec<Value>, current: &mut Map<String, Value>) {
    if !current.is_empty() {
        fragments.push(Value::Object(std::mem::take(current)));
    }
}

fn split_array(items: &[Value], max_size: usize) -> Option<Vec<Value>> {
    let mut fragments = Vec::new();
    let mut current: Vec<Value> = Vec::new();

    for child in items {
        // Room for the `[...]` wrapper around a singleton element.
        if json_len(child) + 2 > max_size {
            if !current.is_empty() {
                fragments.push(Value::Array(std::mem::take(&mut current)));
            }
            fragments.extend(split_node(child, max_size)?);
            continue;
        }

        let mut tentative = current.clone();
        tentative.push(child.clone());
        if !current.is_empty() && json_len(&Value::Array(tentative.clone())) > max_size {
            fragments.push(Value::Array(std::mem::take(&mut current)));
            current.push(child.clone());
        } else {
            current = tentative;
        }
    }

    if !current.is_empty() {
        fragments.push(Value::Array(current));
    }
    Some(fragments)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(min: usize, max: usize) -> ChunkLimits {
        ChunkLimits {
            min_size: min,
            max_size: max,
            overlap: 20,
        }
    }

    fn observation_with_components(count: usize) -> String {
        let components: Vec<Value> = (0..count)
            .map(|n| {
                serde_json::json!({
                    "code": {"text": format!("component measurement number {n}")},
                    "valueQuantity": {"value": n, "unit": "mg/dL", "system": "http://unitsofmeasure.org"}
                })
            })
            .collect();
        serde_json::json!({
            "resourceType": "Observation",
            "id": "obs-panel",
            "status": "final",
            "effectiveDateTime": "2024-01-15",
            "component": components
        })
        .to_string()
    }

    #[test]
    fn small_resource_yields_single_chunk() {
        let chunker = Chunker::new(limits(100, 500));
        let json = r#"{"resourceType":"Observation","id":"obs-1","status":"final"}"#;

        let chunks = chunker
            .chunk_resource(json, "Observation obs-1")
            .expect("chunking");

        assert_eq!(chunks.len(), 1);
        let parsed: Value = serde_json::from_str(&chunks[0]).expect("chunk parses");
        assert_eq!(parsed["resourceType"], "Observation");
    }

    #[test]
    fn large_resource_splits_into_parseable_fragments() {
        let chunker = Chunker::new(limits(100, 400));
        let json = observation_with_components(20);

        let chunks = chunker
            .chunk_resource(&json, "observation panel")
            .expect("chunking");

        assert!(chunks.len() > 1, "expected multiple chunks");
        for chunk in &chunks {
            assert!(
                chunk.chars().count() <= 400,
                "chunk exceeded max size: {} chars",
                chunk.chars().count()
            );
            serde_json::from_str::<Value>(chunk).expect("every chunk parses as JSON");
        }
    }

    #[test]
    fn chunking_is_deterministic() {
        let chunker = Chunker::new(limits(100, 400));
        let json = observation_with_components(15);

        let first = chunker.chunk_resource(&json, "panel").expect("chunking");
        let second = chunker.chunk_resource(&json, "panel").expect("chunking");

        assert_eq!(first, second);
    }

    #[test]
    fn indivisible_leaf_falls_back_to_character_splitting() {
        let chunker = Chunker::new(limits(100, 300));
        let long_note = "clinical narrative ".repeat(60);
        let json = serde_json::json!({
            "resourceType": "DiagnosticReport",
            "conclusion": long_note
        })
        .to_string();
        let content = "conclusion text ".repeat(80);

        let chunks = chunker.chunk_resource(&json, &content).expect("chunking");

        assert!(chunks.len() > 1, "fallback should still split");
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 300);
            assert!(
                serde_json::from_str::<Value>(chunk).is_err(),
                "fallback chunks are plain text, not JSON"
            );
        }
    }

    #[test]
    fn invalid_json_is_a_validation_error() {
        let chunker = Chunker::default();
        let err = chunker
            .chunk_resource("{broken", "content")
            .expect_err("must fail");
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn fragment_order_is_preserved() {
        let chunker = Chunker::new(limits(50, 200));
        let json = observation_with_components(10);

        let chunks = chunker.chunk_resource(&json, "panel").expect("chunking");
        let joined = chunks.join("\n");
        let first_pos = joined
            .find("component measurement number 0")
            .expect("first component present");
        let later_pos = joined
            .find("component measurement number 9")
            .expect("last component present");
        assert!(first_pos < later_pos, "component order must be stable");
    }
}
