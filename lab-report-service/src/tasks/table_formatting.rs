use async_trait::async_trait;
use graph_flow::{Context, NextAction, Result, Task, TaskResult};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::types::{StageOutcome, context_keys};
use super::utils::{
    call_stage_model, encode_records, note_fallback, parse_record_array, push_warning, require,
    short_circuit, stage_failed,
};
use crate::gateway::{GatewayError, LlmGateway};
use crate::models::{
    Record, ShortCircuit, Stage, Status, TableRow, field, same_test, scalar_text, test_name,
};

const SYSTEM_INSTRUCTION: &str = "You are an expert medical data assistant.";

fn user_instruction(records: &[Record]) -> String {
    format!(
        "Given the following list of medical report entries, keep only the test result entries and \
format each one as an object with exactly these keys: \"test_name\", \"value\", \"unit\", \"normal_range\", \"status\".

Rules:
- Ignore metadata such as patient name, age or date.
- Map differently named fields onto these keys (for example \"test\" becomes \"test_name\").
- Use \"Unknown\" for missing fields.
- Use \"\" (empty string) for fields that do not apply.
- Return only the JSON array: no explanations, no markdown, no comments.

Input:
{}",
        encode_records(records)
    )
}

/// Rows the table stage produced, aligned with the categorized test records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormattedTable {
    pub rows: Vec<TableRow>,
    /// Test names the model returned that match no input record
    pub unmatched: Vec<String>,
}

/// Pair each model row with the first unused input record naming the same
/// test. The input record is authoritative for status and for any column it
/// already carries; the model only fills in what it was missing.
fn align_rows(records: &[Record], formatted: &[Record]) -> FormattedTable {
    let mut used = vec![false; records.len()];
    let mut table = FormattedTable::default();

    for row in formatted {
        let Some(name) = test_name(row) else {
            debug!("Dropped a formatted row without a test name");
            continue;
        };

        let source = (0..records.len()).find(|&i| !used[i] && same_test(&records[i], row));
        match source {
            Some(i) => {
                used[i] = true;
                table.rows.extend(aligned_row(&records[i], row));
            }
            None => table.unmatched.push(name),
        }
    }

    table
}

fn aligned_row(source: &Record, formatted: &Record) -> Option<TableRow> {
    let mut row = TableRow::from_record(formatted)?;
    let source_text = |name: &str| {
        field(source, name)
            .and_then(scalar_text)
            .filter(|text| !text.is_empty())
    };

    if let Some(name) = test_name(source) {
        row.test_name = name;
    }
    if let Some(value) = source_text("value") {
        row.value = value;
    }
    if let Some(unit) = source_text("unit") {
        row.unit = unit;
    }
    if let Some(range) = source_text("normal_range") {
        row.normal_range = range;
    }
    row.status = Status::from_value(field(source, "status"));
    Some(row)
}

/// Normalise test records into five-column table rows. Malformed output
/// falls back to an empty table.
pub async fn format_table(
    gateway: &dyn LlmGateway,
    records: &[Record],
) -> std::result::Result<StageOutcome<FormattedTable>, GatewayError> {
    let prompt = user_instruction(records);
    let raw = call_stage_model(gateway, Stage::TableFormatting, SYSTEM_INSTRUCTION, &prompt).await?;

    Ok(match parse_record_array(&raw) {
        Ok(rows) => StageOutcome::Parsed(align_rows(records, &rows)),
        Err(reason) => StageOutcome::Fallback {
            value: FormattedTable::default(),
            reason,
        },
    })
}

pub struct TableFormattingTask {
    gateway: Arc<dyn LlmGateway>,
}

impl TableFormattingTask {
    pub fn new(gateway: Arc<dyn LlmGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Task for TableFormattingTask {
    async fn run(&self, context: Context) -> Result<TaskResult> {
        let tests: Vec<Record> = require(&context, context_keys::TEST_RECORDS, self.id()).await?;

        let outcome = format_table(self.gateway.as_ref(), &tests)
            .await
            .map_err(|e| stage_failed(self.id(), Stage::TableFormatting, e))?;
        note_fallback(&context, Stage::TableFormatting, &outcome, "table left empty").await?;

        let FormattedTable { rows, unmatched } = outcome.into_value();
        if !unmatched.is_empty() {
            warn!(rows = ?unmatched, "Dropped table rows for tests not in the report");
            push_warning(
                &context,
                Stage::TableFormatting,
                format!(
                    "Dropped rows for tests not in the report: {}",
                    unmatched.join(", ")
                ),
            )
            .await?;
        }

        context.set(context_keys::TABLE_ROWS, &rows).await?;

        if rows.is_empty() {
            return short_circuit(&context, ShortCircuit::NoTableData).await;
        }

        info!(rows = rows.len(), "Formatted results table");
        Ok(TaskResult::new_with_status(
            None,
            NextAction::ContinueAndExecute,
            Some(format!("Formatted {} table rows", rows.len())),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::ScriptedGateway;
    use crate::models::{StageWarning, UNKNOWN};
    use serde_json::json;

    fn records(value: serde_json::Value) -> Vec<Record> {
        serde_json::from_value(value).unwrap()
    }

    fn categorized() -> Vec<Record> {
        records(json!([
            {"test_name": "Hemoglobin", "value": "9.5", "unit": "g/dL",
             "normal_range": "12-15.5", "status": "Critical"},
            {"Test": "Glucose", "Result": 92}
        ]))
    }

    #[tokio::test]
    async fn test_rows_are_projected_onto_five_columns() {
        let gateway = ScriptedGateway::new().reply(
            json!([
                {"test_name": "Hemoglobin", "value": "9.5", "unit": "g/dL",
                 "normal_range": "12-15.5", "status": "Critical", "comment": "low"},
                {"test": "Glucose", "value": 92}
            ])
            .to_string(),
        );

        let table = format_table(&gateway, &categorized()).await.unwrap().into_value();
        assert!(table.unmatched.is_empty());
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].cells(), ["Hemoglobin", "9.5", "g/dL", "12-15.5", "Critical"]);
        assert_eq!(table.rows[1].test_name, "Glucose");
        assert_eq!(table.rows[1].value, "92");
        assert_eq!(table.rows[1].unit, UNKNOWN);
        assert_eq!(table.rows[1].normal_range, "");
        assert_eq!(table.rows[1].status, Status::Unknown);
    }

    #[tokio::test]
    async fn test_status_comes_from_categorized_record() {
        let gateway = ScriptedGateway::new().reply(
            json!([
                {"test_name": "hemoglobin", "value": "12", "unit": "g/dL", "status": "Normal"},
                {"test_name": "Glucose", "value": "92", "status": "Critical"}
            ])
            .to_string(),
        );

        let rows = format_table(&gateway, &categorized()).await.unwrap().into_value().rows;
        assert_eq!(rows[0].test_name, "Hemoglobin");
        assert_eq!(rows[0].value, "9.5");
        assert_eq!(rows[0].status, Status::Critical);
        assert_eq!(rows[1].status, Status::Unknown);
        let counts = crate::models::StatusCounts::from_rows(&rows);
        assert_eq!((counts.critical, counts.normal, counts.unknown), (1, 0, 1));
    }

    #[tokio::test]
    async fn test_rows_for_unknown_tests_are_dropped() {
        let gateway = ScriptedGateway::new().reply(
            json!([
                {"test_name": "Hemoglobin", "value": "9.5", "status": "Normal"},
                {"test_name": "Cholesterol", "value": "180", "status": "Normal"},
                {"test_name": "Hemoglobin", "value": "9.5", "status": "Normal"}
            ])
            .to_string(),
        );

        let table = format_table(&gateway, &categorized()).await.unwrap().into_value();
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].status, Status::Critical);
        assert_eq!(table.unmatched, ["Cholesterol", "Hemoglobin"]);
    }

    #[tokio::test]
    async fn test_metadata_rows_are_dropped() {
        let gateway = ScriptedGateway::new().reply(
            r#"[{"patient_name": "Jane Doe"}, {"test_name": "Glucose", "status": "Normal"}]"#,
        );
        let table = format_table(&gateway, &categorized()).await.unwrap().into_value();
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].test_name, "Glucose");
        assert!(table.unmatched.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_output_falls_back_to_empty_table() {
        let gateway = ScriptedGateway::new().reply("| Test | Value |\n|---|---|");
        let outcome = format_table(&gateway, &categorized()).await.unwrap();
        assert!(outcome.is_fallback());
        assert!(outcome.value().rows.is_empty());
    }

    #[tokio::test]
    async fn test_task_warns_about_invented_rows() {
        let gateway = Arc::new(ScriptedGateway::new().reply(
            json!([
                {"test_name": "Hemoglobin", "value": "9.5", "status": "Normal"},
                {"test_name": "Cholesterol", "value": "180", "status": "Normal"}
            ])
            .to_string(),
        ));
        let task = TableFormattingTask::new(gateway);
        let context = Context::new();
        context.set(context_keys::TEST_RECORDS, categorized()).await.unwrap();

        let result = task.run(context.clone()).await.unwrap();
        assert_eq!(result.next_action, NextAction::ContinueAndExecute);
        let rows: Vec<TableRow> = context.get(context_keys::TABLE_ROWS).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, Status::Critical);
        let warnings: Vec<StageWarning> = context.get(context_keys::WARNINGS).await.unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("Cholesterol"));
    }

    #[tokio::test]
    async fn test_task_short_circuits_on_empty_table() {
        let gateway = Arc::new(ScriptedGateway::new().reply("[]"));
        let task = TableFormattingTask::new(gateway);
        let context = Context::new();
        let tests: Vec<Record> =
            serde_json::from_value(json!([{"test_name": "TSH", "value": "2.1"}])).unwrap();
        context.set(context_keys::TEST_RECORDS, tests).await.unwrap();

        let result = task.run(context.clone()).await.unwrap();
        assert_eq!(result.next_action, NextAction::End);
        let signal: ShortCircuit = context.get(context_keys::SHORT_CIRCUIT).await.unwrap();
        assert_eq!(signal, ShortCircuit::NoTableData);
    }
}
