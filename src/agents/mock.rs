//! Scripted provider for testing purposes.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::{AgentRequest, Provider, ProviderError, ProviderResponse};

type Outcome = Result<ProviderResponse, ProviderError>;

/// A provider that replays queued outcomes, then repeats a fixed one
#[derive(Debug)]
pub struct ScriptedProvider {
    id: String,
    local: bool,
    script: Mutex<VecDeque<Outcome>>,
    repeat: Outcome,
    delay: Duration,
    calls: AtomicUsize,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedProvider {
    fn with_outcome(id: &str, repeat: Outcome) -> Self {
        Self {
            id: id.to_string(),
            local: false,
            script: Mutex::new(VecDeque::new()),
            repeat,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always answers with `content`
    pub fn succeeding(id: &str, content: &str) -> Self {
        Self::with_outcome(id, Ok(ProviderResponse::new(content).with_tokens(10)))
    }

    /// Always fails with `error`
    pub fn failing(id: &str, error: ProviderError) -> Self {
        Self::with_outcome(id, Err(error))
    }

    /// Play `outcomes` in order before falling back to the repeated outcome
    pub fn with_script(self, outcomes: Vec<Outcome>) -> Self {
        *self.script.lock().unwrap_or_else(PoisonError::into_inner) = outcomes.into();
        self
    }

    /// Mark as a local model
    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    /// Sleep before answering every request
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of `complete` calls received
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request received, oldest first
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_local(&self) -> bool {
        self.local
    }

    async fn complete(&self, request: &AgentRequest) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        scripted.unwrap_or_else(|| self.repeat.clone())
    }
}
