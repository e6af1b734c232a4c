//! Narrow port to the language model.
//!
//! Every pipeline stage talks to the model through [`LlmGateway`], so tests
//! can swap in a scripted implementation and the production path stays a
//! single `OpenRouterGateway`.

use async_trait::async_trait;
use rig::completion::Prompt;
use rig::prelude::*;
use rig::providers::openrouter;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Raw text returned by the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayReply {
    pub content: String,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("language model call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("language model provider error: {0}")]
    Provider(String),
}

#[async_trait]
pub trait LlmGateway: Send + Sync {
    /// One synchronous-style request: a role directive plus the task body.
    async fn invoke(
        &self,
        system_instruction: &str,
        user_instruction: &str,
    ) -> Result<GatewayReply, GatewayError>;
}

/// Gateway backed by the OpenRouter provider in `rig`
pub struct OpenRouterGateway {
    client: openrouter::Client,
    model: String,
    temperature: f64,
    timeout: Duration,
}

impl OpenRouterGateway {
    pub fn new(api_key: &str, model: impl Into<String>, temperature: f64, timeout: Duration) -> Self {
        Self {
            client: openrouter::Client::new(api_key),
            model: model.into(),
            temperature,
            timeout,
        }
    }
}

#[async_trait]
impl LlmGateway for OpenRouterGateway {
    async fn invoke(
        &self,
        system_instruction: &str,
        user_instruction: &str,
    ) -> Result<GatewayReply, GatewayError> {
        let agent = self
            .client
            .agent(&self.model)
            .preamble(system_instruction)
            .temperature(self.temperature)
            .build();

        let started = Instant::now();
        let content = tokio::time::timeout(self.timeout, agent.prompt(user_instruction))
            .await
            .map_err(|_| {
                warn!(model = %self.model, timeout_secs = self.timeout.as_secs(), "LLM call timed out");
                GatewayError::Timeout {
                    secs: self.timeout.as_secs(),
                }
            })?
            .map_err(|e| GatewayError::Provider(e.to_string()))?;

        debug!(
            model = %self.model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            response_chars = content.len(),
            "LLM call completed"
        );
        Ok(GatewayReply { content })
    }
}
