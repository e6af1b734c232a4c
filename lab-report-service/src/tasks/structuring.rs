use async_trait::async_trait;
use graph_flow::{Context, NextAction, Result, Task, TaskResult};
use std::sync::Arc;
use tracing::info;

use super::types::{StageOutcome, context_keys};
use super::utils::{
    call_stage_model, note_fallback, parse_record_array, require, short_circuit, stage_failed,
};
use crate::gateway::{GatewayError, LlmGateway};
use crate::models::{Record, ShortCircuit, Stage};

const SYSTEM_INSTRUCTION: &str = "You are an expert medical data extraction assistant.";

fn user_instruction(text: &str) -> String {
    format!(
        "Given the following medical report, extract all explicitly mentioned information related to \
test results and return it as a valid JSON array of objects. Each object represents one test result \
or one piece of relevant metadata (for example patient name, age or report date) exactly as found in the text.

Rules:
- Include only fields that are explicitly present in the report (test name, value, unit, normal range, patient name, age, date, ...).
- Use the key \"test_name\" for the name of a test.
- Do not guess, infer or add fields that are not in the text.
- Do not compute a status or categorize any value.
- Return only the JSON array: no explanations, no markdown, no comments.

Medical Report:
{text}"
    )
}

/// Turn raw report text into records holding only literally present fields.
/// Malformed output falls back to an empty list.
pub async fn structure_text(
    gateway: &dyn LlmGateway,
    text: &str,
) -> std::result::Result<StageOutcome<Vec<Record>>, GatewayError> {
    let prompt = user_instruction(text);
    let raw = call_stage_model(gateway, Stage::Structuring, SYSTEM_INSTRUCTION, &prompt).await?;

    Ok(match parse_record_array(&raw) {
        Ok(records) => StageOutcome::Parsed(records),
        Err(reason) => StageOutcome::Fallback {
            value: Vec::new(),
            reason,
        },
    })
}

pub struct StructuringTask {
    gateway: Arc<dyn LlmGateway>,
}

impl StructuringTask {
    pub fn new(gateway: Arc<dyn LlmGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Task for StructuringTask {
    async fn run(&self, context: Context) -> Result<TaskResult> {
        let text: String = require(&context, context_keys::RAW_TEXT, self.id()).await?;

        let outcome = structure_text(self.gateway.as_ref(), &text)
            .await
            .map_err(|e| stage_failed(self.id(), Stage::Structuring, e))?;
        note_fallback(&context, Stage::Structuring, &outcome, "no records extracted").await?;

        let records = outcome.into_value();
        if records.is_empty() {
            return short_circuit(&context, ShortCircuit::NoStructuredData).await;
        }

        info!(records = records.len(), "Structured report text");
        context.set(context_keys::STRUCTURED_RECORDS, &records).await?;

        Ok(TaskResult::new_with_status(
            None,
            NextAction::ContinueAndExecute,
            Some(format!("Extracted {} records", records.len())),
        ))
    }
}
