use async_trait::async_trait;
use graph_flow::{Context, NextAction, Result, Task, TaskResult};
use std::sync::Arc;
use tracing::{info, warn};

use super::types::{EXPLANATION_UNAVAILABLE, StageOutcome, context_keys};
use super::utils::{
    call_stage_model, encode_records, note_fallback, prose_outcome, push_warning, require,
};
use crate::gateway::{GatewayError, LlmGateway};
use crate::models::{Record, Stage};

const SYSTEM_INSTRUCTION: &str = "You are an expert medical explanation assistant.";

fn user_instruction(records: &[Record]) -> String {
    format!(
        "You will receive a list of medical test results. Explain each test result clearly and \
patiently to a patient without medical training. For each test, write a separate explanation \
labelled with the test name that covers:
- what the test measures;
- the patient's value and what it means;
- the given status (Normal, Borderline, Critical or Unknown) and why it was assigned;
- if needed, what the patient should do next.

Use simple language. Only use the data provided; do not assume or invent missing details.

Input:
{}",
        encode_records(records)
    )
}

/// One labelled explanation block per test. Empty output becomes the
/// explanation sentinel.
pub async fn explain_results(
    gateway: &dyn LlmGateway,
    records: &[Record],
) -> std::result::Result<StageOutcome<String>, GatewayError> {
    let prompt = user_instruction(records);
    let raw = call_stage_model(gateway, Stage::Explanation, SYSTEM_INSTRUCTION, &prompt).await?;
    Ok(prose_outcome(&raw, EXPLANATION_UNAVAILABLE))
}

pub struct ExplanationTask {
    gateway: Arc<dyn LlmGateway>,
}

impl ExplanationTask {
    pub fn new(gateway: Arc<dyn LlmGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Task for ExplanationTask {
    async fn run(&self, context: Context) -> Result<TaskResult> {
        let tests: Vec<Record> = require(&context, context_keys::TEST_RECORDS, self.id()).await?;

        // Only a genuine explanation is stored; the summary edge keys off it.
        match explain_results(self.gateway.as_ref(), &tests).await {
            Ok(StageOutcome::Parsed(explanation)) => {
                info!(characters = explanation.len(), "Generated explanations");
                context.set(context_keys::EXPLANATION, explanation).await?;
                Ok(TaskResult::new_with_status(
                    None,
                    NextAction::ContinueAndExecute,
                    Some("Explanations generated".to_string()),
                ))
            }
            Ok(outcome) => {
                note_fallback(&context, Stage::Explanation, &outcome, "summary skipped").await?;
                Ok(TaskResult::new_with_status(
                    Some(outcome.into_value()),
                    NextAction::ContinueAndExecute,
                    Some("Explanations unavailable".to_string()),
                ))
            }
            Err(e) => {
                warn!(error = %e, "Explanation stage failed, continuing without it");
                push_warning(
                    &context,
                    Stage::Explanation,
                    format!("{EXPLANATION_UNAVAILABLE} ({e})"),
                )
                .await?;
                Ok(TaskResult::new_with_status(
                    Some(EXPLANATION_UNAVAILABLE.to_string()),
                    NextAction::ContinueAndExecute,
                    Some("Explanations unavailable".to_string()),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::ScriptedGateway;
    use crate::models::StageWarning;

    #[tokio::test]
    async fn test_reply_is_trimmed() {
        let gateway = ScriptedGateway::new().reply("\n**Hemoglobin**: measures ...  \n");
        let outcome = explain_results(&gateway, &[]).await.unwrap();
        assert_eq!(outcome, StageOutcome::Parsed("**Hemoglobin**: measures ...".to_string()));
    }

    #[tokio::test]
    async fn test_blank_reply_becomes_sentinel() {
        let gateway = ScriptedGateway::new().reply("   ");
        let outcome = explain_results(&gateway, &[]).await.unwrap();
        assert!(outcome.is_fallback());
        assert_eq!(outcome.value(), EXPLANATION_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_gateway_failure_is_a_warning_not_an_error() {
        let gateway = Arc::new(ScriptedGateway::new().fail(GatewayError::Timeout { secs: 45 }));
        let task = ExplanationTask::new(gateway);
        let context = Context::new();
        context.set(context_keys::TEST_RECORDS, Vec::<Record>::new()).await.unwrap();

        let result = task.run(context.clone()).await.unwrap();
        assert_eq!(result.response.as_deref(), Some(EXPLANATION_UNAVAILABLE));
        assert!(!context.contains_key(context_keys::EXPLANATION));

        let warnings: Vec<StageWarning> = context.get(context_keys::WARNINGS).await.unwrap();
        assert_eq!(warnings[0].stage, Stage::Explanation);
        assert!(warnings[0].message.contains("timed out"));
    }
}
