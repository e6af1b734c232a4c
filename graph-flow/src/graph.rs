use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    context::Context,
    error::{GraphError, Result},
    task::{NextAction, Task, TaskResult},
};

/// Default guard against cycles introduced by `GoTo` or conditional edges
pub const DEFAULT_MAX_STEPS: usize = 64;

/// Type alias for edge condition functions
pub type EdgeCondition = Arc<dyn Fn(&Context) -> bool + Send + Sync>;

/// Edge between tasks in the graph
#[derive(Clone)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub condition: Option<EdgeCondition>,
}

/// An immutable graph of tasks. Build it with [`GraphBuilder`].
pub struct Graph {
    pub id: String,
    tasks: HashMap<String, Arc<dyn Task>>,
    edges: Vec<Edge>,
    start_task_id: Option<String>,
    max_steps: usize,
}

impl Graph {
    /// Run the graph from its start task until a task ends it or no edge matches.
    pub async fn execute(&self, context: &Context) -> Result<ExecutionResult> {
        let start = self.start_task_id.clone().ok_or(GraphError::NoStartTask)?;
        self.execute_from(&start, context).await
    }

    /// Run the graph starting at `task_id`.
    pub async fn execute_from(&self, task_id: &str, context: &Context) -> Result<ExecutionResult> {
        let mut current = task_id.to_string();
        let mut visited: Vec<String> = Vec::new();

        loop {
            if visited.len() >= self.max_steps {
                warn!(graph_id = %self.id, steps = visited.len(), "Step limit reached");
                return Err(GraphError::StepLimitExceeded(self.max_steps));
            }

            let result = self.execute_single_task(&current, context.clone()).await?;
            visited.push(current.clone());

            match &result.next_action {
                NextAction::ContinueAndExecute => match self.find_next_task(&current, context) {
                    Some(next_task_id) => {
                        debug!(graph_id = %self.id, from = %current, to = %next_task_id, "Following edge");
                        current = next_task_id;
                    }
                    None => {
                        return Ok(ExecutionResult::finish(
                            result,
                            visited,
                            ExecutionStatus::Completed,
                        ));
                    }
                },
                NextAction::GoTo(target_id) => {
                    if !self.tasks.contains_key(target_id) {
                        return Err(GraphError::TaskNotFound(target_id.clone()));
                    }
                    current = target_id.clone();
                }
                NextAction::End => {
                    info!(graph_id = %self.id, task_id = %current, "Execution ended by task");
                    return Ok(ExecutionResult::finish(result, visited, ExecutionStatus::Ended));
                }
            }
        }
    }

    /// Execute a single task without following any edges
    async fn execute_single_task(&self, task_id: &str, context: Context) -> Result<TaskResult> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| GraphError::TaskNotFound(task_id.to_string()))?;

        let mut result = task.run(context).await?;
        result.task_id = task_id.to_string();
        Ok(result)
    }

    /// Find the next task: the first outgoing edge whose condition holds
    /// (unconditional edges always hold), in insertion order.
    pub fn find_next_task(&self, current_task_id: &str, context: &Context) -> Option<String> {
        self.edges
            .iter()
            .filter(|edge| edge.from == current_task_id)
            .find(|edge| edge.condition.as_ref().is_none_or(|condition| condition(context)))
            .map(|edge| edge.to.clone())
    }

    pub fn start_task_id(&self) -> Option<&str> {
        self.start_task_id.as_deref()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

/// Builder for creating graphs
pub struct GraphBuilder {
    id: String,
    tasks: HashMap<String, Arc<dyn Task>>,
    edges: Vec<Edge>,
    start_task_id: Option<String>,
    max_steps: usize,
}

impl GraphBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tasks: HashMap::new(),
            edges: Vec::new(),
            start_task_id: None,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// Add a task. The first task added becomes the start task.
    pub fn add_task(mut self, task: Arc<dyn Task>) -> Self {
        let task_id = task.id().to_string();
        if self.start_task_id.is_none() {
            self.start_task_id = Some(task_id.clone());
        }
        self.tasks.insert(task_id, task);
        self
    }

    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
            condition: None,
        });
        self
    }

    pub fn add_conditional_edge<F>(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: F,
    ) -> Self
    where
        F: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
            condition: Some(Arc::new(condition)),
        });
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn build(self) -> Graph {
        Graph {
            id: self.id,
            tasks: self.tasks,
            edges: self.edges,
            start_task_id: self.start_task_id,
            max_steps: self.max_steps,
        }
    }
}

/// Outcome of a graph execution
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub response: Option<String>,
    pub status_message: Option<String>,
    pub status: ExecutionStatus,
    /// Ids of the tasks that ran, in order
    pub visited: Vec<String>,
}

impl ExecutionResult {
    fn finish(result: TaskResult, visited: Vec<String>, status: ExecutionStatus) -> Self {
        Self {
            response: result.response,
            status_message: result.status_message,
            status,
            visited,
        }
    }

    pub fn last_task_id(&self) -> Option<&str> {
        self.visited.last().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// The last task had no matching outgoing edge
    Completed,
    /// A task returned `NextAction::End`
    Ended,
}
