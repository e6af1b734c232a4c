use graph_flow::{Context, GraphError, NextAction, TaskResult};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Instant;
use tracing::{info, warn};

use super::types::{MalformedOutput, StageOutcome, context_keys, json_kind};
use crate::error::PipelineError;
use crate::gateway::{GatewayError, LlmGateway};
use crate::models::{Record, ShortCircuit, Stage, StageWarning};

/// Serialise records for a prompt: pretty JSON, key order preserved
pub fn encode_records(records: &[Record]) -> String {
    let array = Value::Array(records.iter().cloned().map(Value::Object).collect());
    format!("{array:#}")
}

/// Remove one surrounding Markdown code fence, if present
pub fn strip_code_fence(text: &str) -> &str {
    let text = text.trim();
    let Some(body) = text
        .strip_prefix("```")
        .and_then(|rest| rest.strip_suffix("```"))
    else {
        return text;
    };

    match body.find('\n') {
        Some(pos) if body[..pos].trim().chars().all(|c| c.is_ascii_alphanumeric()) => {
            body[pos + 1..].trim()
        }
        _ => body.trim(),
    }
}

/// Strictly decode a model response as an array of JSON objects
pub fn parse_record_array(raw: &str) -> Result<Vec<Record>, MalformedOutput> {
    let body = strip_code_fence(raw);
    let value: Value =
        serde_json::from_str(body).map_err(|e| MalformedOutput::NotJson(e.to_string()))?;

    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(MalformedOutput::NotArray {
                found: json_kind(&other),
            });
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::Object(record) => Ok(record),
            other => Err(MalformedOutput::NonObjectElement {
                index,
                found: json_kind(&other),
            }),
        })
        .collect()
}

/// Trimmed prose, or the sentinel when the model said nothing
pub fn prose_outcome(raw: &str, sentinel: &str) -> StageOutcome<String> {
    let text = raw.trim();
    if text.is_empty() {
        StageOutcome::Fallback {
            value: sentinel.to_string(),
            reason: MalformedOutput::EmptyResponse,
        }
    } else {
        StageOutcome::Parsed(text.to_string())
    }
}

/// Invoke the gateway once for a stage, with timing logs
pub async fn call_stage_model(
    gateway: &dyn LlmGateway,
    stage: Stage,
    system_instruction: &str,
    user_instruction: &str,
) -> Result<String, GatewayError> {
    info!(stage = %stage, prompt_chars = user_instruction.len(), "Calling language model");
    let started = Instant::now();

    match gateway.invoke(system_instruction, user_instruction).await {
        Ok(reply) => {
            info!(
                stage = %stage,
                elapsed_ms = started.elapsed().as_millis() as u64,
                response_chars = reply.content.len(),
                "Language model responded"
            );
            Ok(reply.content)
        }
        Err(e) => {
            warn!(stage = %stage, error = %e, "Language model call failed");
            Err(e)
        }
    }
}

pub(crate) async fn require<T: DeserializeOwned>(
    context: &Context,
    key: &'static str,
    task_id: &str,
) -> graph_flow::Result<T> {
    context
        .get(key)
        .await
        .ok_or_else(|| GraphError::task_failed(task_id, PipelineError::MissingContext(key)))
}

pub(crate) fn stage_failed(task_id: &str, stage: Stage, source: GatewayError) -> GraphError {
    GraphError::task_failed(task_id, PipelineError::Gateway { stage, source })
}

pub(crate) async fn push_warning(
    context: &Context,
    stage: Stage,
    message: impl Into<String>,
) -> graph_flow::Result<()> {
    let mut warnings: Vec<StageWarning> = context
        .get(context_keys::WARNINGS)
        .await
        .unwrap_or_default();
    warnings.push(StageWarning {
        stage,
        message: message.into(),
    });
    context.set(context_keys::WARNINGS, warnings).await
}

/// Log and record a fallback so it is never dropped silently
pub(crate) async fn note_fallback<T>(
    context: &Context,
    stage: Stage,
    outcome: &StageOutcome<T>,
    consequence: &str,
) -> graph_flow::Result<()> {
    if let Some(reason) = outcome.fallback_reason() {
        warn!(stage = %stage, reason = %reason, "Malformed model output, using fallback");
        push_warning(context, stage, format!("Malformed model output ({reason}); {consequence}"))
            .await?;
    }
    Ok(())
}

/// Record an early stop and end the workflow
pub(crate) async fn short_circuit(
    context: &Context,
    signal: ShortCircuit,
) -> graph_flow::Result<TaskResult> {
    warn!(signal = ?signal, "Pipeline short-circuited");
    context.set(context_keys::SHORT_CIRCUIT, signal).await?;
    Ok(TaskResult::new_with_status(
        Some(signal.message().to_string()),
        NextAction::End,
        Some(signal.message().to_string()),
    ))
}
