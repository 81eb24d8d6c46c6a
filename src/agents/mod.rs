//! Agent providers and the fallback chain that turns them into reliable calls.
//!
//! A [`Provider`] is one AI backend. The pipeline never talks to a provider
//! directly: every agent call goes through a [`FallbackChain`], which tries the
//! configured cloud providers in order and escalates to a local model last.

mod fallback;
mod metrics;
mod registry;

pub mod mock;

pub use fallback::FallbackChain;
pub use metrics::{
    AgentMetrics, MetricsRegistry, MetricsSnapshot, ProviderMetrics, RetryMetrics,
    RetryMetricsSnapshot, SystemMetrics,
};
pub use registry::ProviderRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::models::AgentType;

/// One agent task as sent to a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub task_id: Uuid,
    pub agent: AgentType,
    pub instructions: String,
    pub input: String,
    /// Structured context such as document metadata
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

impl AgentRequest {
    /// A request carrying the agent's standard instructions
    pub fn new(agent: AgentType, input: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            agent,
            instructions: agent.instructions().to_string(),
            input: input.into(),
            context: HashMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// A provider's answer to an [`AgentRequest`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub content: String,
    pub tokens_used: u64,
    pub cache_hit: bool,
    /// Extra structured output merged into the call result
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl ProviderResponse {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// An AI backend able to run agent tasks
#[async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    /// Unique identifier used in provider orders and metrics
    fn id(&self) -> &str;

    /// Local models are only used as the last resort of a fallback chain
    fn is_local(&self) -> bool {
        false
    }

    async fn complete(&self, request: &AgentRequest) -> Result<ProviderResponse, ProviderError>;
}

/// Errors that can occur when calling a provider
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded")]
    RateLimit(Option<u64>),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// Whether another attempt against the same provider may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Network(_)
            | ProviderError::RateLimit(_)
            | ProviderError::Timeout(_)
            | ProviderError::Unavailable(_) => true,
            ProviderError::Api { status, .. } => *status >= 500 || *status == 408,
            ProviderError::InvalidResponse(_) => false,
        }
    }
}
