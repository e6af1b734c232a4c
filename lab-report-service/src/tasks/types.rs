use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Workflow context keys, one per payload crossing a stage boundary
pub mod context_keys {
    pub const DOCUMENT_PATH: &str = "document_path";
    pub const RAW_TEXT: &str = "raw_text";
    pub const STRUCTURED_RECORDS: &str = "structured_records";
    pub const CATEGORIZED_RECORDS: &str = "categorized_records";
    pub const TEST_RECORDS: &str = "test_records";
    pub const METADATA_RECORDS: &str = "metadata_records";
    pub const TABLE_ROWS: &str = "table_rows";
    pub const EXPLANATION: &str = "explanation";
    pub const SUMMARY: &str = "summary";
    pub const WARNINGS: &str = "warnings";
    pub const SHORT_CIRCUIT: &str = "short_circuit";
}

pub const EXPLANATION_UNAVAILABLE: &str = "Unable to generate explanations due to an error.";
pub const SUMMARY_UNAVAILABLE: &str = "Unable to generate summary due to an error.";

/// Why a model response did not honour its stage's output contract
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum MalformedOutput {
    #[error("response is not valid JSON: {0}")]
    NotJson(String),

    #[error("expected a JSON array, got {found}")]
    NotArray { found: String },

    #[error("element {index} is {found}, expected an object")]
    NonObjectElement { index: usize, found: String },

    #[error("expected {expected} records, got {actual}")]
    RecordCountMismatch { expected: usize, actual: usize },

    #[error("record {index} should be test '{expected}', got {actual}")]
    TestMismatch {
        index: usize,
        expected: String,
        actual: String,
    },

    #[error("response was empty")]
    EmptyResponse,
}

pub(crate) fn json_kind(value: &Value) -> String {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
    .to_string()
}

/// Result of one stage: either the parsed model output or the stage's
/// documented fallback together with the reason it was needed.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome<T> {
    Parsed(T),
    Fallback { value: T, reason: MalformedOutput },
}

impl<T> StageOutcome<T> {
    pub fn value(&self) -> &T {
        match self {
            StageOutcome::Parsed(value) => value,
            StageOutcome::Fallback { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            StageOutcome::Parsed(value) => value,
            StageOutcome::Fallback { value, .. } => value,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, StageOutcome::Fallback { .. })
    }

    pub fn fallback_reason(&self) -> Option<&MalformedOutput> {
        match self {
            StageOutcome::Parsed(_) => None,
            StageOutcome::Fallback { reason, .. } => Some(reason),
        }
    }
}
