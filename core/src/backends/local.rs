//! Local inference server (Ollama-compatible `/generate` + `/tags`).

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{check_status, BackendKind, OutboundCall, RawReply, Transport};
use crate::errors::TransportError;
use crate::gateway::PartialSink;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434/api";
pub const DEFAULT_MODEL: &str = "llama3";

pub struct LocalInference {
    client: Client,
    base_url: String,
    default_model: String,
}

impl LocalInference {
    pub fn new(client: Client, base_url: &str, default_model: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            default_model: default_model.to_string(),
        }
    }

    fn payload(call: &OutboundCall) -> Value {
        let mut payload = json!({
            "model": call.model,
            "prompt": call.prompt,
            "stream": call.stream,
        });
        if let Some(system) = call.system_prompt.as_deref() {
            payload["system"] = Value::String(system.to_string());
        }
        payload
    }

    /// Read a newline-delimited stream of `{response, done}` objects,
    /// forwarding each fragment and folding them into one final body.
    async fn read_stream(
        mut response: reqwest::Response,
        partials: &PartialSink,
    ) -> Result<Value, TransportError> {
        let mut buffer: Vec<u8> = Vec::new();
        let mut text = String::new();
        let mut last = Value::Null;

        while let Some(chunk) = response.chunk().await? {
            buffer.extend_from_slice(&chunk);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if let Some(frame) = parse_frame(&line)? {
                    absorb_frame(frame, &mut text, &mut last, partials);
                }
            }
        }
        if let Some(frame) = parse_frame(&buffer)? {
            absorb_frame(frame, &mut text, &mut last, partials);
        }

        if !last.is_object() {
            return Err(TransportError::Decode("stream ended without a final frame".into()));
        }
        last["response"] = Value::String(text);
        Ok(last)
    }
}

fn parse_frame(line: &[u8]) -> Result<Option<Value>, TransportError> {
    let trimmed = std::str::from_utf8(line)
        .map_err(|err| TransportError::Decode(err.to_string()))?
        .trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|err| TransportError::Decode(err.to_string()))
}

fn absorb_frame(frame: Value, text: &mut String, last: &mut Value, partials: &PartialSink) {
    if let Some(fragment) = frame.get("response").and_then(Value::as_str) {
        if !fragment.is_empty() {
            text.push_str(fragment);
            partials.emit(fragment);
        }
    }
    *last = frame;
}

#[async_trait]
impl Transport for LocalInference {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn send(
        &self,
        call: &OutboundCall,
        partials: &PartialSink,
    ) -> Result<RawReply, TransportError> {
        let url = format!("{}/generate", self.base_url);
        let response = self
            .client
            .post(url)
            .header("x-correlation-id", call.correlation_id.to_string())
            .json(&Self::payload(call))
            .send()
            .await?;
        let response = check_status(response).await?;
        let body = if call.stream {
            Self::read_stream(response, partials).await?
        } else {
            response.json().await?
        };
        Ok(RawReply { body })
    }

    fn extract_text(&self, body: &Value) -> Option<String> {
        body.get("response")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    async fn list_models(&self) -> Result<Vec<String>, TransportError> {
        let url = format!("{}/tags", self.base_url);
        let response = check_status(self.client.get(url).send().await?).await?;
        let body: Value = response.json().await?;
        let models = body
            .get("models")
            .and_then(Value::as_array)
            .ok_or_else(|| TransportError::Decode("missing `models` array".into()))?;
        Ok(models
            .iter()
            .filter_map(|m| m.get("name").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }
}
