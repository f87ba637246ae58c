//! Caller-side façade over the provider gateway.
//!
//! The gateway never touches persistence. The manager is the layer the IPC
//! handlers talk to: it forwards the call, then records each attempt in the
//! event log and appends the exchange to the conversation history.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::warn;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::spawn_blocking;

use crate::backends::BackendId;
use crate::db::store::{self, Namespace};
use crate::db::DbPool;
use crate::errors::GenerationError;
use crate::gateway::{
    AttemptOutcome, AttemptRecord, GenerateOptions, GeneratedText, PartialText, ProviderGateway,
};
use crate::logging::{log_event, Event};

const MODULE: &str = "ai.runtime";

#[derive(Clone)]
pub struct ModelManager {
    pool: DbPool,
    gateway: Arc<ProviderGateway>,
}

impl ModelManager {
    pub fn new(pool: DbPool, gateway: Arc<ProviderGateway>) -> Arc<Self> {
        Arc::new(Self { pool, gateway })
    }

    pub fn gateway(&self) -> &Arc<ProviderGateway> {
        &self.gateway
    }

    pub fn pool(&self) -> DbPool {
        self.pool.clone()
    }

    /// Generate a reply and, when `conversation` is given, append the
    /// exchange to that conversation's history.
    pub async fn generate(
        &self,
        conversation: Option<String>,
        prompt: String,
        preferred: BackendId,
        options: GenerateOptions,
    ) -> Result<GeneratedText, GenerationError> {
        let result = self.gateway.generate(&prompt, &preferred, options).await;
        self.record(conversation, prompt, &result).await;
        result
    }

    pub async fn generate_streaming(
        &self,
        conversation: Option<String>,
        prompt: String,
        preferred: BackendId,
        options: GenerateOptions,
        partials: mpsc::UnboundedSender<PartialText>,
    ) -> Result<GeneratedText, GenerationError> {
        let result = self
            .gateway
            .generate_streaming(&prompt, &preferred, options, partials)
            .await;
        self.record(conversation, prompt, &result).await;
        result
    }

    pub async fn history(&self, conversation: String) -> Result<Vec<Value>> {
        let pool = self.pool.clone();
        spawn_blocking(move || {
            let conn = pool.get()?;
            store::list_entries(&conn, Namespace::Conversations, &conversation)
        })
        .await
        .map_err(|err| anyhow!(err.to_string()))?
    }

    pub async fn conversations(&self) -> Result<Vec<String>> {
        let pool = self.pool.clone();
        spawn_blocking(move || {
            let conn = pool.get()?;
            store::list_keys(&conn, Namespace::Conversations)
        })
        .await
        .map_err(|err| anyhow!(err.to_string()))?
    }

    // Bookkeeping failures are logged and never change the call's result.
    async fn record(
        &self,
        conversation: Option<String>,
        prompt: String,
        result: &Result<GeneratedText, GenerationError>,
    ) {
        let events = outcome_events(result);
        let turns = match (&conversation, result) {
            (Some(_), Ok(generated)) => Some(conversation_turns(&prompt, generated)),
            _ => None,
        };
        let pool = self.pool.clone();
        let written = spawn_blocking(move || -> Result<()> {
            let mut conn = pool.get()?;
            for event in &events {
                log_event(&conn, event)?;
            }
            if let (Some(key), Some(turns)) = (conversation, turns) {
                store::append_entries(&mut conn, Namespace::Conversations, &key, turns)?;
            }
            Ok(())
        })
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("failed to record generation outcome: {err}"),
            Err(err) => warn!("generation bookkeeping task failed: {err}"),
        }
    }
}

fn outcome_events(result: &Result<GeneratedText, GenerationError>) -> Vec<Event> {
    match result {
        Ok(generated) => generated
            .attempts
            .iter()
            .map(|attempt| attempt_event(attempt, Some(&generated.text)))
            .collect(),
        Err(err) => {
            let mut events = match err {
                GenerationError::AllBackendsExhausted { attempts, .. } => attempts
                    .iter()
                    .map(|attempt| attempt_event(attempt, None))
                    .collect(),
                _ => Vec::new(),
            };
            events.push(
                Event::warn(MODULE, err.to_string())
                    .code(err.code())
                    .explain(err.explain()),
            );
            events
        }
    }
}

fn attempt_event(attempt: &AttemptRecord, text: Option<&str>) -> Event {
    let mut data = json!({
        "backend": attempt.backend,
        "model": attempt.model,
        "correlation_id": attempt.correlation_id,
        "latency_ms": attempt.latency_ms,
    });
    match &attempt.outcome {
        AttemptOutcome::Resolved => {
            let preview: String = text.unwrap_or_default().chars().take(200).collect();
            data["preview"] = Value::String(preview);
            Event::info(MODULE, "generation succeeded")
                .code("AI-0200")
                .data(data)
        }
        AttemptOutcome::TimedOut => Event::warn(MODULE, "backend timed out")
            .code("AI-0202")
            .explain("Falling back to the next backend")
            .data(data),
        AttemptOutcome::Errored { message } => {
            data["error"] = Value::String(message.clone());
            Event::warn(MODULE, "backend invocation failed")
                .code("AI-0201")
                .explain("Falling back to the next backend")
                .data(data)
        }
    }
}

fn conversation_turns(prompt: &str, generated: &GeneratedText) -> Vec<Value> {
    let ts = OffsetDateTime::now_utc().unix_timestamp();
    vec![
        json!({ "role": "user", "text": prompt, "ts": ts }),
        json!({
            "role": "assistant",
            "text": generated.text,
            "backend": generated.backend,
            "model": generated.model,
            "correlation_id": generated.correlation_id,
            "latency_ms": generated.latency_ms,
            "ts": generated.completed_at,
        }),
    ]
}
