use thiserror::Error;

/// Errors raised while building or executing a graph
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Graph has no start task")]
    NoStartTask,

    #[error("Context error: {0}")]
    ContextError(String),

    #[error("Task execution failed: {0}")]
    TaskExecutionFailed(String),

    /// A task failed with a typed error; callers can recover it with
    /// `anyhow::Error::downcast_ref`.
    #[error("Task {task_id} failed: {source}")]
    TaskFailed {
        task_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Execution exceeded {0} steps")]
    StepLimitExceeded(usize),
}

impl GraphError {
    /// Wrap a typed task error so it survives the trip through the graph.
    pub fn task_failed(task_id: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::TaskFailed {
            task_id: task_id.into(),
            source: source.into(),
        }
    }

    /// Borrow the typed error a task failed with, if it is an `E`.
    pub fn task_source<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        match self {
            Self::TaskFailed { source, .. } => source.downcast_ref::<E>(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;
