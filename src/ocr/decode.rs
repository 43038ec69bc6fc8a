//! Decoding of vision-model replies into [`RawCandidate`]s.
//!
//! This is the only place untyped model JSON is inspected.

use serde_json::Value;
use tracing::{debug, warn};

use super::RawCandidate;

/// Keys under which models sometimes wrap the record array.
const WRAPPER_KEYS: &[&str] = &["marks", "students", "records"];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty response")]
    Empty,
    #[error("response is not valid JSON ({reason}): {snippet}")]
    InvalidJson { reason: String, snippet: String },
    #[error("expected a JSON array of records, got {0}")]
    NotAnArray(&'static str),
}

/// Rows decoded from one model reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedRows {
    pub rows: Vec<RawCandidate>,
    /// Array elements that were not JSON objects.
    pub skipped: usize,
}

impl DecodedRows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Decode a model reply into candidate rows.
///
/// Markdown code fences are stripped. The payload must be an array, or an object
/// wrapping one array under a known key. Non-object elements are counted in
/// [`DecodedRows::skipped`].
pub fn decode_candidates(response: &str) -> Result<DecodedRows, DecodeError> {
    let json_str = strip_code_fence(response);
    if json_str.is_empty() {
        return Err(DecodeError::Empty);
    }

    let value: Value = serde_json::from_str(json_str).map_err(|e| DecodeError::InvalidJson {
        reason: e.to_string(),
        snippet: json_str.chars().take(200).collect(),
    })?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => {
            let key = WRAPPER_KEYS
                .iter()
                .find(|k| map.get(**k).map(Value::is_array).unwrap_or(false))
                .ok_or(DecodeError::NotAnArray("object"))?;
            match map.remove(*key) {
                Some(Value::Array(items)) => items,
                _ => return Err(DecodeError::NotAnArray("object")),
            }
        }
        other => return Err(DecodeError::NotAnArray(json_kind(&other))),
    };

    let total = items.len();
    let mut decoded = DecodedRows::default();
    for (i, item) in items.iter().enumerate() {
        match item {
            Value::Object(object) => decoded.rows.push(RawCandidate::from_object(object)),
            other => {
                warn!("Skipping record {}: expected object, got {}", i, json_kind(other));
                decoded.skipped += 1;
            }
        }
    }

    debug!("Decoded {} of {} records", decoded.len(), total);
    Ok(decoded)
}

fn strip_code_fence(response: &str) -> &str {
    if response.contains("```json") {
        response
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .unwrap_or(response)
            .trim()
    } else if response.contains("```") {
        response.split("```").nth(1).unwrap_or(response).trim()
    } else {
        response.trim()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
