use async_trait::async_trait;
use graph_flow::{Context, GraphError, NextAction, Result, Task, TaskResult};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use super::types::context_keys;
use super::utils::{require, short_circuit};
use crate::error::PipelineError;
use crate::models::ShortCircuit;
use crate::text_source::TextSource;

/// Reads the document named in the context and stores its raw text
pub struct TextExtractTask {
    source: Arc<dyn TextSource>,
}

impl TextExtractTask {
    pub fn new(source: Arc<dyn TextSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Task for TextExtractTask {
    async fn run(&self, context: Context) -> Result<TaskResult> {
        let path: PathBuf = require(&context, context_keys::DOCUMENT_PATH, self.id()).await?;

        let text = self.source.extract(&path).await.map_err(|e| {
            error!(path = %path.display(), error = %e, "Text extraction failed");
            GraphError::task_failed(self.id(), PipelineError::Extraction(e))
        })?;

        if text.trim().is_empty() {
            return short_circuit(&context, ShortCircuit::TextExtractionFailed).await;
        }

        info!(characters = text.len(), "Extracted document text");
        context.set(context_keys::RAW_TEXT, &text).await?;

        Ok(TaskResult::new_with_status(
            None,
            NextAction::ContinueAndExecute,
            Some(format!("Extracted {} characters", text.len())),
        ))
    }
}
