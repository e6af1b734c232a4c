use graph_flow::GraphError;
use thiserror::Error;

use crate::gateway::GatewayError;
use crate::models::Stage;
use crate::text_source::ExtractionError;

/// Fatal failures of an analysis request.
///
/// Malformed model output and empty stage results never show up here: the
/// former are resolved by per-stage fallbacks, the latter end the run with a
/// [`crate::models::ShortCircuit`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("{stage} stage failed: {source}")]
    Gateway {
        stage: Stage,
        #[source]
        source: GatewayError,
    },

    #[error("workflow context is missing '{0}'")]
    MissingContext(&'static str),

    #[error("workflow error: {0}")]
    Workflow(GraphError),
}

impl PipelineError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            PipelineError::Gateway {
                source: GatewayError::Timeout { .. },
                ..
            }
        )
    }

    pub fn is_unsupported_format(&self) -> bool {
        matches!(
            self,
            PipelineError::Extraction(ExtractionError::UnsupportedFormat { .. })
        )
    }

    /// The single message shown to the person who uploaded the report
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::Extraction(ExtractionError::UnsupportedFormat { .. }) => {
                "Unsupported file format. Use PDF, PNG, JPEG, TIFF, BMP or WebP.".to_string()
            }
            PipelineError::Extraction(e) => format!("Text extraction failed: {e}"),
            PipelineError::Gateway {
                stage,
                source: GatewayError::Timeout { secs },
            } => format!("The language model did not answer within {secs}s during {stage}."),
            PipelineError::Gateway { stage, .. } => {
                format!("The language model could not be reached during {stage}.")
            }
            PipelineError::MissingContext(_) | PipelineError::Workflow(_) => {
                "Report analysis failed unexpectedly.".to_string()
            }
        }
    }
}

/// Task failures carry a `PipelineError` through the graph; unwrap it again here.
impl From<GraphError> for PipelineError {
    fn from(error: GraphError) -> Self {
        match error {
            GraphError::TaskFailed { task_id, source } => match source.downcast::<PipelineError>() {
                Ok(pipeline_error) => pipeline_error,
                Err(other) => PipelineError::Workflow(GraphError::TaskFailed {
                    task_id,
                    source: other,
                }),
            },
            other => PipelineError::Workflow(other),
        }
    }
}
