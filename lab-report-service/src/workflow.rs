use chrono::Utc;
use graph_flow::{Context, Graph, GraphBuilder, Task};
use std::path::Path;
use std::sync::Arc;
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::gateway::LlmGateway;
use crate::models::{
    AnalysisOutcome, AnalysisReport, Record, ShortCircuit, StatusCounts, TableRow,
};
use crate::tasks::*;
use crate::text_source::TextSource;

/// Wire the six steps into a graph: extraction, then the five model stages.
/// Summarization only runs when a genuine explanation was stored.
pub fn build_report_workflow(
    gateway: Arc<dyn LlmGateway>,
    text_source: Arc<dyn TextSource>,
) -> Graph {
    let text_extract_task = Arc::new(TextExtractTask::new(text_source));
    let text_extract_id = text_extract_task.id().to_string();

    let structuring_task = Arc::new(StructuringTask::new(gateway.clone()));
    let structuring_id = structuring_task.id().to_string();

    let categorization_task = Arc::new(CategorizationTask::new(gateway.clone()));
    let categorization_id = categorization_task.id().to_string();

    let table_formatting_task = Arc::new(TableFormattingTask::new(gateway.clone()));
    let table_formatting_id = table_formatting_task.id().to_string();

    let explanation_task = Arc::new(ExplanationTask::new(gateway.clone()));
    let explanation_id = explanation_task.id().to_string();

    let summarization_task = Arc::new(SummarizationTask::new(gateway));
    let summarization_id = summarization_task.id().to_string();

    GraphBuilder::new("lab_report_workflow")
        .add_task(text_extract_task)
        .add_task(structuring_task)
        .add_task(categorization_task)
        .add_task(table_formatting_task)
        .add_task(explanation_task)
        .add_task(summarization_task)
        .add_edge(&text_extract_id, &structuring_id)
        .add_edge(&structuring_id, &categorization_id)
        .add_edge(&categorization_id, &table_formatting_id)
        .add_edge(&table_formatting_id, &explanation_id)
        .add_conditional_edge(&explanation_id, &summarization_id, |ctx| {
            ctx.contains_key(context_keys::EXPLANATION)
        })
        .build()
}

/// Runs one analysis per call; every request gets a fresh context.
pub struct ReportPipeline {
    graph: Graph,
    structuring_id: String,
}

impl ReportPipeline {
    pub fn new(gateway: Arc<dyn LlmGateway>, text_source: Arc<dyn TextSource>) -> Self {
        Self {
            graph: build_report_workflow(gateway, text_source),
            structuring_id: std::any::type_name::<StructuringTask>().to_string(),
        }
    }

    /// Extract text from a document and run every stage on it.
    pub async fn analyze_document(&self, path: &Path) -> Result<AnalysisOutcome, PipelineError> {
        let id = Uuid::new_v4().to_string();
        let span = info_span!("analysis", analysis_id = %id, path = %path.display());

        async {
            let context = Context::new();
            context
                .set(context_keys::DOCUMENT_PATH, path)
                .await
                .map_err(PipelineError::Workflow)?;

            let result = self.graph.execute(&context).await?;
            info!(steps = ?result.visited, status = ?result.status, "Analysis finished");

            Ok(assemble_outcome(id, Some(path.display().to_string()), &context).await)
        }
        .instrument(span)
        .await
    }

    /// Run the model stages on text that was already extracted.
    pub async fn analyze_text(&self, text: &str) -> Result<AnalysisOutcome, PipelineError> {
        let id = Uuid::new_v4().to_string();
        let span = info_span!("analysis", analysis_id = %id);

        async {
            let context = Context::new();
            if text.trim().is_empty() {
                context
                    .set(context_keys::SHORT_CIRCUIT, ShortCircuit::TextExtractionFailed)
                    .await
                    .map_err(PipelineError::Workflow)?;
                return Ok(assemble_outcome(id, None, &context).await);
            }

            context
                .set(context_keys::RAW_TEXT, text)
                .await
                .map_err(PipelineError::Workflow)?;

            let result = self.graph.execute_from(&self.structuring_id, &context).await?;
            info!(steps = ?result.visited, status = ?result.status, "Analysis finished");

            Ok(assemble_outcome(id, None, &context).await)
        }
        .instrument(span)
        .await
    }
}

async fn assemble_outcome(
    id: String,
    source: Option<String>,
    context: &Context,
) -> AnalysisOutcome {
    let records: Vec<Record> = context
        .get(context_keys::CATEGORIZED_RECORDS)
        .await
        .unwrap_or_default();
    let table: Vec<TableRow> = context
        .get(context_keys::TABLE_ROWS)
        .await
        .unwrap_or_default();

    let report = AnalysisReport {
        id,
        source,
        generated_at: Utc::now(),
        metadata: context
            .get(context_keys::METADATA_RECORDS)
            .await
            .unwrap_or_default(),
        test_results: context
            .get(context_keys::TEST_RECORDS)
            .await
            .unwrap_or_default(),
        status_counts: StatusCounts::from_rows(&table),
        records,
        table,
        explanation: context.get(context_keys::EXPLANATION).await,
        summary: context.get(context_keys::SUMMARY).await,
        warnings: context
            .get(context_keys::WARNINGS)
            .await
            .unwrap_or_default(),
    };

    match context.get::<ShortCircuit>(context_keys::SHORT_CIRCUIT).await {
        Some(signal) => AnalysisOutcome::ShortCircuited {
            signal,
            message: signal.message().to_string(),
            report,
        },
        None => AnalysisOutcome::Completed { report },
    }
}
