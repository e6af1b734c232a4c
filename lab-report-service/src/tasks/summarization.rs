use async_trait::async_trait;
use graph_flow::{Context, NextAction, Result, Task, TaskResult};
use std::sync::Arc;
use tracing::{info, warn};

use super::types::{SUMMARY_UNAVAILABLE, StageOutcome, context_keys};
use super::utils::{call_stage_model, note_fallback, prose_outcome, push_warning, require};
use crate::gateway::{GatewayError, LlmGateway};
use crate::models::Stage;

const SYSTEM_INSTRUCTION: &str =
    "You are an expert medical assistant, compassionate and professional.";

fn user_instruction(explanations: &str) -> String {
    format!(
        "You will receive detailed medical explanations already written in patient-friendly language. \
Using bullet points only, write these three sections:

**Summary**: 3 to 5 concise points on what was found in the report.
**Risks/Conditions**: potential health risks or conditions, each with a likelihood (High, Possible, Low).
**Actions/Recommendations**: 2 to 5 specific next steps, lifestyle tips or suggestions.

Do not repeat the full explanations. Do not return JSON; only the three bullet sections.

Medical Explanations:
{explanations}"
    )
}

/// Three labelled bullet sections distilled from the explanations. Empty
/// output becomes the summary sentinel.
pub async fn summarize_explanation(
    gateway: &dyn LlmGateway,
    explanation: &str,
) -> std::result::Result<StageOutcome<String>, GatewayError> {
    let prompt = user_instruction(explanation);
    let raw = call_stage_model(gateway, Stage::Summarization, SYSTEM_INSTRUCTION, &prompt).await?;
    Ok(prose_outcome(&raw, SUMMARY_UNAVAILABLE))
}

pub struct SummarizationTask {
    gateway: Arc<dyn LlmGateway>,
}

impl SummarizationTask {
    pub fn new(gateway: Arc<dyn LlmGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Task for SummarizationTask {
    async fn run(&self, context: Context) -> Result<TaskResult> {
        let explanation: String = require(&context, context_keys::EXPLANATION, self.id()).await?;

        let summary = match summarize_explanation(self.gateway.as_ref(), &explanation).await {
            Ok(outcome) => {
                note_fallback(&context, Stage::Summarization, &outcome, "summary omitted").await?;
                match outcome {
                    StageOutcome::Parsed(summary) => Some(summary),
                    StageOutcome::Fallback { .. } => None,
                }
            }
            Err(e) => {
                warn!(error = %e, "Summarization stage failed, continuing without it");
                push_warning(
                    &context,
                    Stage::Summarization,
                    format!("{SUMMARY_UNAVAILABLE} ({e})"),
                )
                .await?;
                None
            }
        };

        let status = match &summary {
            Some(summary) => {
                info!(characters = summary.len(), "Generated summary");
                context.set(context_keys::SUMMARY, summary).await?;
                "Summary generated"
            }
            None => "Summary unavailable",
        };

        Ok(TaskResult::new_with_status(
            Some(summary.unwrap_or_else(|| SUMMARY_UNAVAILABLE.to_string())),
            NextAction::End,
            Some(status.to_string()),
        ))
    }
}
