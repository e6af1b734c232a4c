use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// One entry extracted from a report. Key order follows the model's output.
pub type Record = serde_json::Map<String, Value>;

/// Normalised spellings of the key that marks a record as a test result.
const TEST_NAME_KEYS: [&str; 2] = ["test_name", "test"];

fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_lowercase().replace([' ', '-'], "_")
}

/// Key under which this record stores its test name, if it is a test record.
pub fn test_name_key(record: &Record) -> Option<&str> {
    record
        .keys()
        .find(|key| TEST_NAME_KEYS.contains(&normalize_key(key).as_str()))
        .map(String::as_str)
}

pub fn is_test_record(record: &Record) -> bool {
    test_name_key(record).is_some()
}

/// Trimmed test name of a test record. `None` for metadata or a blank name.
pub fn test_name(record: &Record) -> Option<String> {
    test_name_key(record)
        .and_then(|key| record.get(key))
        .and_then(scalar_text)
        .filter(|name| !name.is_empty())
}

/// Whether two records name the same test, ignoring case
pub fn same_test(a: &Record, b: &Record) -> bool {
    match (test_name(a), test_name(b)) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(&b),
        _ => false,
    }
}

/// Actual key of a field given its normalised name (`Normal Range` matches `normal_range`).
pub fn field_key<'a>(record: &'a Record, name: &str) -> Option<&'a str> {
    record
        .keys()
        .find(|key| normalize_key(key) == name)
        .map(String::as_str)
}

pub fn field<'a>(record: &'a Record, name: &str) -> Option<&'a Value> {
    field_key(record, name).and_then(|key| record.get(key))
}

/// Render a JSON value as table text. `None` for null.
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.trim().to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Split records into `(test_results, metadata)`, keeping relative order.
pub fn partition_records(records: &[Record]) -> (Vec<Record>, Vec<Record>) {
    records.iter().cloned().partition(is_test_record)
}

/// Risk category assigned to a test result by the categorization stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Status {
    Critical,
    Borderline,
    Normal,
    #[default]
    Unknown,
}

impl Status {
    pub const ALL: [Status; 4] = [
        Status::Critical,
        Status::Borderline,
        Status::Normal,
        Status::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Critical => "Critical",
            Status::Borderline => "Borderline",
            Status::Normal => "Normal",
            Status::Unknown => "Unknown",
        }
    }

    /// Anything that is not one of the four canonical labels becomes `Unknown`.
    pub fn from_value(value: Option<&Value>) -> Status {
        value
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognised status '{0}'")]
pub struct ParseStatusError(pub String);

impl FromStr for Status {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

/// A test result normalised to the five table columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRow {
    pub test_name: String,
    pub value: String,
    pub unit: String,
    pub normal_range: String,
    pub status: Status,
}

pub const UNKNOWN: &str = "Unknown";

impl TableRow {
    pub const COLUMNS: [&'static str; 5] = ["test_name", "value", "unit", "normal_range", "status"];
    pub const HEADERS: [&'static str; 5] = ["Test Name", "Value", "Unit", "Normal Range", "Status"];

    /// Project a record onto the five columns. Returns `None` for metadata
    /// records or a blank test name.
    pub fn from_record(record: &Record) -> Option<TableRow> {
        let test_name = test_name(record)?;

        let text_or_unknown = |name: &str| {
            field(record, name)
                .and_then(scalar_text)
                .unwrap_or_else(|| UNKNOWN.to_string())
        };

        Some(TableRow {
            test_name,
            value: text_or_unknown("value"),
            unit: text_or_unknown("unit"),
            normal_range: field(record, "normal_range")
                .and_then(scalar_text)
                .unwrap_or_default(),
            status: Status::from_value(field(record, "status")),
        })
    }

    pub fn cells(&self) -> [&str; 5] {
        [
            self.test_name.as_str(),
            self.value.as_str(),
            self.unit.as_str(),
            self.normal_range.as_str(),
            self.status.as_str(),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub critical: usize,
    pub borderline: usize,
    pub normal: usize,
    pub unknown: usize,
}

impl StatusCounts {
    pub fn from_rows(rows: &[TableRow]) -> Self {
        rows.iter().fold(Self::default(), |mut counts, row| {
            match row.status {
                Status::Critical => counts.critical += 1,
                Status::Borderline => counts.borderline += 1,
                Status::Normal => counts.normal += 1,
                Status::Unknown => counts.unknown += 1,
            }
            counts
        })
    }
}

/// The five language-model stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Structuring,
    Categorization,
    TableFormatting,
    Explanation,
    Summarization,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Structuring => "structuring",
            Stage::Categorization => "categorization",
            Stage::TableFormatting => "table_formatting",
            Stage::Explanation => "explanation",
            Stage::Summarization => "summarization",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-fatal problem recorded while the pipeline kept going
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageWarning {
    pub stage: Stage,
    pub message: String,
}

/// Reason the pipeline stopped early without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortCircuit {
    TextExtractionFailed,
    NoStructuredData,
    NoCategorizedData,
    NoTestResults,
    NoTableData,
}

impl ShortCircuit {
    pub fn message(&self) -> &'static str {
        match self {
            ShortCircuit::TextExtractionFailed => {
                "Text extraction failed: no text could be read from the document."
            }
            ShortCircuit::NoStructuredData => "No structured data extracted.",
            ShortCircuit::NoCategorizedData => "No categorized data generated.",
            ShortCircuit::NoTestResults => "No test results found.",
            ShortCircuit::NoTableData => "No test data found to display.",
        }
    }
}

impl fmt::Display for ShortCircuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Everything the pipeline produced for one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub id: String,
    pub source: Option<String>,
    pub generated_at: DateTime<Utc>,
    /// Categorized records in document order
    pub records: Vec<Record>,
    pub metadata: Vec<Record>,
    pub test_results: Vec<Record>,
    pub table: Vec<TableRow>,
    pub status_counts: StatusCounts,
    pub explanation: Option<String>,
    pub summary: Option<String>,
    pub warnings: Vec<StageWarning>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AnalysisOutcome {
    Completed {
        report: AnalysisReport,
    },
    ShortCircuited {
        signal: ShortCircuit,
        message: String,
        report: AnalysisReport,
    },
}

impl AnalysisOutcome {
    pub fn report(&self) -> &AnalysisReport {
        match self {
            AnalysisOutcome::Completed { report } => report,
            AnalysisOutcome::ShortCircuited { report, .. } => report,
        }
    }

    pub fn into_report(self) -> AnalysisReport {
        match self {
            AnalysisOutcome::Completed { report } => report,
            AnalysisOutcome::ShortCircuited { report, .. } => report,
        }
    }

    pub fn short_circuit(&self) -> Option<ShortCircuit> {
        match self {
            AnalysisOutcome::Completed { .. } => None,
            AnalysisOutcome::ShortCircuited { signal, .. } => Some(*signal),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnalyzeReportRequest {
    pub document_path: String,
}
