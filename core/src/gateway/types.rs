use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backends::BackendId;

/// Opaque id matching an asynchronous reply to the call that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Per-call knobs for [`ProviderGateway::generate`](super::ProviderGateway::generate).
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Model for the preferred backend. Fallback attempts always use the
    /// fallback backend's default model.
    pub model: Option<String>,
    pub timeout: Option<Duration>,
    pub system_prompt: Option<String>,
}

impl GenerateOptions {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }
}

/// Fragment of a streaming reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartialText {
    pub correlation_id: CorrelationId,
    pub backend: BackendId,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Resolved,
    TimedOut,
    Errored { message: String },
}

/// One dispatch made on behalf of a `generate` call.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub backend: BackendId,
    pub correlation_id: CorrelationId,
    pub model: String,
    pub latency_ms: u64,
    pub outcome: AttemptOutcome,
}

/// Normalised result of a successful call.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedText {
    pub text: String,
    /// Backend that produced the text; differs from the preferred one after a
    /// fallback.
    pub backend: BackendId,
    pub model: String,
    pub correlation_id: CorrelationId,
    /// Wall-clock time from submission of the first attempt.
    pub latency_ms: u64,
    pub completed_at: i64,
    pub attempts: Vec<AttemptRecord>,
}

impl GeneratedText {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }

    pub fn fell_back(&self) -> bool {
        self.attempts.len() > 1
    }
}
