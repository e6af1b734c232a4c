use async_trait::async_trait;
use graph_flow::{Context, NextAction, Result, Task, TaskResult};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use super::types::{MalformedOutput, StageOutcome, context_keys};
use super::utils::{
    call_stage_model, encode_records, note_fallback, parse_record_array, require, short_circuit,
    stage_failed,
};
use crate::gateway::{GatewayError, LlmGateway};
use crate::models::{
    Record, ShortCircuit, Stage, Status, field, field_key, partition_records, same_test, test_name,
};

const SYSTEM_INSTRUCTION: &str = "You are an expert medical data categorizer.";

fn user_instruction(records: &[Record]) -> String {
    format!(
        "Given the following list of medical report entries (test results and patient metadata), \
assign a \"status\" field to every entry that represents a test result, using exactly one of: \
\"Critical\", \"Borderline\", \"Normal\", \"Unknown\".

Rules:
- \"Normal\": the value lies within typical medical norms or the stated range.
- \"Borderline\": the value is slightly outside typical norms.
- \"Critical\": the value is significantly outside typical norms.
- \"Unknown\": there is not enough data to decide.
- Do not add a status to metadata entries such as patient name, age or date.
- Do not change, remove or reorder any entry or field; return one entry per input entry.
- Return only the JSON array: no explanations, no markdown, no comments.

Input Data:
{}",
        encode_records(records)
    )
}

/// Merge the model's answer into the input by position. Only a test record's
/// `status` may change; metadata records are copied as they were. Every test
/// record must come back at its own position under the same test name.
fn merge_statuses(
    input: &[Record],
    answer: Vec<Record>,
) -> std::result::Result<Vec<Record>, MalformedOutput> {
    if answer.len() != input.len() {
        return Err(MalformedOutput::RecordCountMismatch {
            expected: input.len(),
            actual: answer.len(),
        });
    }

    input
        .iter()
        .zip(answer)
        .enumerate()
        .map(|(index, (original, categorized))| {
            let Some(expected) = test_name(original) else {
                return Ok(original.clone());
            };
            if !same_test(original, &categorized) {
                return Err(MalformedOutput::TestMismatch {
                    index,
                    expected,
                    actual: test_name(&categorized).map_or_else(
                        || "a record without a test name".to_string(),
                        |name| format!("'{name}'"),
                    ),
                });
            }

            let status = Status::from_value(field(&categorized, "status"));
            let key = field_key(original, "status").unwrap_or("status").to_string();
            let mut record = original.clone();
            record.insert(key, Value::String(status.to_string()));
            Ok(record)
        })
        .collect()
}

/// Attach a normalised `status` to every test record. Malformed output
/// returns the input unchanged.
pub async fn categorize_records(
    gateway: &dyn LlmGateway,
    records: &[Record],
) -> std::result::Result<StageOutcome<Vec<Record>>, GatewayError> {
    let prompt = user_instruction(records);
    let raw = call_stage_model(gateway, Stage::Categorization, SYSTEM_INSTRUCTION, &prompt).await?;

    Ok(match parse_record_array(&raw).and_then(|answer| merge_statuses(records, answer)) {
        Ok(categorized) => StageOutcome::Parsed(categorized),
        Err(reason) => StageOutcome::Fallback {
            value: records.to_vec(),
            reason,
        },
    })
}

/// Categorizes records, then splits them into test results and metadata
pub struct CategorizationTask {
    gateway: Arc<dyn LlmGateway>,
}

impl CategorizationTask {
    pub fn new(gateway: Arc<dyn LlmGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Task for CategorizationTask {
    async fn run(&self, context: Context) -> Result<TaskResult> {
        let records: Vec<Record> =
            require(&context, context_keys::STRUCTURED_RECORDS, self.id()).await?;

        let outcome = categorize_records(self.gateway.as_ref(), &records)
            .await
            .map_err(|e| stage_failed(self.id(), Stage::Categorization, e))?;
        note_fallback(
            &context,
            Stage::Categorization,
            &outcome,
            "records kept without status",
        )
        .await?;

        let categorized = outcome.into_value();
        if categorized.is_empty() {
            return short_circuit(&context, ShortCircuit::NoCategorizedData).await;
        }

        let (tests, metadata) = partition_records(&categorized);
        info!(
            tests = tests.len(),
            metadata = metadata.len(),
            "Categorized records"
        );

        context.set(context_keys::CATEGORIZED_RECORDS, &categorized).await?;
        context.set(context_keys::TEST_RECORDS, &tests).await?;
        context.set(context_keys::METADATA_RECORDS, &metadata).await?;

        if tests.is_empty() {
            return short_circuit(&context, ShortCircuit::NoTestResults).await;
        }

        Ok(TaskResult::new_with_status(
            None,
            NextAction::ContinueAndExecute,
            Some(format!("Categorized {} test results", tests.len())),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::ScriptedGateway;
    use crate::models::StageWarning;
    use serde_json::json;

    fn records(value: Value) -> Vec<Record> {
        serde_json::from_value(value).unwrap()
    }

    fn sample() -> Vec<Record> {
        records(json!([
            {"patient_name": "Jane Doe", "age": "45"},
            {"test_name": "Hemoglobin", "value": "9.5", "unit": "g/dL", "normal_range": "12-15.5"},
            {"Test": "Glucose", "value": "92", "unit": "mg/dL"}
        ]))
    }

    #[tokio::test]
    async fn test_status_added_to_test_records_only() {
        let gateway = ScriptedGateway::new().reply(
            json!([
                {"patient_name": "Jane Doe", "age": "45", "status": "Normal"},
                {"test_name": "Hemoglobin", "value": "9.5", "unit": "g/dL", "normal_range": "12-15.5", "status": "Critical"},
                {"Test": "Glucose", "value": "92", "unit": "mg/dL", "status": "normal"}
            ])
            .to_string(),
        );

        let outcome = categorize_records(&gateway, &sample()).await.unwrap();
        assert!(!outcome.is_fallback());
        let categorized = outcome.value();

        assert_eq!(categorized[0], sample()[0]);
        assert_eq!(categorized[1]["status"], "Critical");
        assert_eq!(categorized[2]["status"], "Normal");
    }

    #[tokio::test]
    async fn test_model_edits_to_other_fields_are_ignored() {
        let gateway = ScriptedGateway::new().reply(
            json!([
                {"patient_name": "Someone Else"},
                {"test_name": "Hemoglobin", "value": "15", "status": "Borderline", "note": "x"},
                {"Test": "Glucose", "status": "Very High"}
            ])
            .to_string(),
        );

        let categorized = categorize_records(&gateway, &sample()).await.unwrap().into_value();
        assert_eq!(categorized[0]["patient_name"], "Jane Doe");
        assert_eq!(categorized[1]["value"], "9.5");
        assert!(!categorized[1].contains_key("note"));
        assert_eq!(categorized[1]["status"], "Borderline");
        assert_eq!(categorized[2]["status"], "Unknown");
    }

    #[tokio::test]
    async fn test_existing_status_key_is_replaced_in_place() {
        let input = records(json!([{"Status": "pending", "test_name": "TSH"}]));
        let gateway = ScriptedGateway::new().reply(r#"[{"Status": "Normal", "test_name": "TSH"}]"#);

        let categorized = categorize_records(&gateway, &input).await.unwrap().into_value();
        let keys: Vec<&str> = categorized[0].keys().map(String::as_str).collect();
        assert_eq!(keys, ["Status", "test_name"]);
        assert_eq!(categorized[0]["Status"], "Normal");
    }

    #[tokio::test]
    async fn test_malformed_or_misaligned_output_passes_input_through() {
        let misaligned = json!([{"test_name": "Hemoglobin", "status": "Critical"}]).to_string();
        for reply in ["Sorry, I cannot help.", r#"{"status": "Normal"}"#, misaligned.as_str()] {
            let gateway = ScriptedGateway::new().reply(reply);
            let outcome = categorize_records(&gateway, &sample()).await.unwrap();
            assert!(outcome.is_fallback(), "{reply}");
            assert_eq!(outcome.value(), &sample());
        }
    }

    #[tokio::test]
    async fn test_reordered_reply_passes_input_through() {
        let input = records(json!([
            {"test_name": "Hemoglobin", "value": "9.5"},
            {"test_name": "Glucose", "value": "92"}
        ]));
        let gateway = ScriptedGateway::new().reply(
            json!([
                {"test_name": "Glucose", "value": "92", "status": "Normal"},
                {"test_name": "Hemoglobin", "value": "9.5", "status": "Critical"}
            ])
            .to_string(),
        );

        let outcome = categorize_records(&gateway, &input).await.unwrap();
        assert!(matches!(
            outcome.fallback_reason(),
            Some(MalformedOutput::TestMismatch { index: 0, .. })
        ));
        assert_eq!(outcome.value(), &input);
    }

    #[tokio::test]
    async fn test_metadata_in_place_of_a_test_is_rejected() {
        let gateway = ScriptedGateway::new().reply(
            json!([
                {"test_name": "Hemoglobin", "status": "Critical"},
                {"patient_name": "Jane Doe", "age": "45"},
                {"Test": "Glucose", "status": "Normal"}
            ])
            .to_string(),
        );

        let outcome = categorize_records(&gateway, &sample()).await.unwrap();
        assert!(outcome.is_fallback());
        assert!(outcome.value().iter().all(|r| !r.contains_key("status")));
    }

    #[tokio::test]
    async fn test_reordered_reply_is_recorded_as_a_warning() {
        let gateway = Arc::new(ScriptedGateway::new().reply(
            json!([
                {"Test": "Glucose", "status": "Normal"},
                {"test_name": "Hemoglobin", "status": "Critical"},
                {"patient_name": "Jane Doe", "age": "45"}
            ])
            .to_string(),
        ));
        let task = CategorizationTask::new(gateway);
        let context = Context::new();
        context.set(context_keys::STRUCTURED_RECORDS, sample()).await.unwrap();

        let result = task.run(context.clone()).await.unwrap();
        assert_eq!(result.next_action, NextAction::ContinueAndExecute);
        let tests: Vec<Record> = context.get(context_keys::TEST_RECORDS).await.unwrap();
        assert!(tests.iter().all(|r| !r.contains_key("status")));
        let warnings: Vec<StageWarning> = context.get(context_keys::WARNINGS).await.unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].stage, Stage::Categorization);
    }

    #[tokio::test]
    async fn test_task_partitions_and_short_circuits_without_tests() {
        let gateway = Arc::new(ScriptedGateway::new().reply(r#"[{"patient_name": "Jane Doe"}]"#));
        let task = CategorizationTask::new(gateway);
        let context = Context::new();
        context
            .set(
                context_keys::STRUCTURED_RECORDS,
                records(json!([{"patient_name": "Jane Doe"}])),
            )
            .await
            .unwrap();

        let result = task.run(context.clone()).await.unwrap();
        assert_eq!(result.next_action, NextAction::End);
        let signal: ShortCircuit = context.get(context_keys::SHORT_CIRCUIT).await.unwrap();
        assert_eq!(signal, ShortCircuit::NoTestResults);
        let metadata: Vec<Record> = context.get(context_keys::METADATA_RECORDS).await.unwrap();
        assert_eq!(metadata.len(), 1);
    }

    #[tokio::test]
    async fn test_task_fails_on_gateway_error() {
        let gateway = Arc::new(ScriptedGateway::new().fail(GatewayError::Provider("503".into())));
        let task = CategorizationTask::new(gateway);
        let context = Context::new();
        context.set(context_keys::STRUCTURED_RECORDS, sample()).await.unwrap();

        let err = task.run(context).await.unwrap_err();
        let pipeline_error = err.task_source::<crate::error::PipelineError>().unwrap();
        assert!(matches!(
            pipeline_error,
            crate::error::PipelineError::Gateway {
                stage: Stage::Categorization,
                ..
            }
        ));
    }
}
