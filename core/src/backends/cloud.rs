//! Cloud generation API (Gemini `generateContent`).

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{check_status, BackendKind, OutboundCall, RawReply, Transport};
use crate::errors::TransportError;
use crate::gateway::PartialSink;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

pub struct CloudApi {
    client: Client,
    base_url: String,
    api_key: String,
    default_model: String,
}

impl CloudApi {
    pub fn new(client: Client, base_url: &str, api_key: &str, default_model: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            default_model: default_model.to_string(),
        }
    }

    fn endpoint(&self, model: &str) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        )
    }

    fn payload(call: &OutboundCall) -> Value {
        let mut payload = json!({
            "contents": [{ "parts": [{ "text": call.prompt }] }],
        });
        if let Some(system) = call.system_prompt.as_deref() {
            payload["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        payload
    }
}

#[async_trait]
impl Transport for CloudApi {
    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    // The cloud endpoint is always called in one shot; a streaming caller
    // simply receives no partials from this backend.
    async fn send(
        &self,
        call: &OutboundCall,
        _partials: &PartialSink,
    ) -> Result<RawReply, TransportError> {
        let response = self
            .client
            .post(self.endpoint(&call.model))
            .header("x-correlation-id", call.correlation_id.to_string())
            .json(&Self::payload(call))
            .send()
            .await?;
        let body: Value = check_status(response).await?.json().await?;
        Ok(RawReply { body })
    }

    fn extract_text(&self, body: &Value) -> Option<String> {
        let parts = body
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|cand| cand.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)?;
        let texts: Vec<&str> = parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect();
        if texts.is_empty() {
            return None;
        }
        Some(texts.concat())
    }

    async fn list_models(&self) -> Result<Vec<String>, TransportError> {
        let url = format!("{}/models?key={}", self.base_url, self.api_key);
        let response = check_status(self.client.get(url).send().await?).await?;
        let body: Value = response.json().await?;
        let models = body
            .get("models")
            .and_then(Value::as_array)
            .ok_or_else(|| TransportError::Decode("missing `models` array".into()))?;
        Ok(models
            .iter()
            .filter_map(|m| m.get("name").and_then(Value::as_str))
            .map(|name| name.strip_prefix("models/").unwrap_or(name).to_string())
            .collect())
    }
}
