//! Text-generation backends the gateway can dispatch to.
//!
//! The set is closed: a [`Backend`] is either a [`LocalInference`] server or
//! a [`CloudApi`] endpoint. Both expose the single [`Transport`] capability
//! the gateway is written against, so tests can swap in scripted transports
//! without touching HTTP.

pub mod cloud;
pub mod config;
pub mod local;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::TransportError;
use crate::gateway::{CorrelationId, PartialSink};

pub use cloud::CloudApi;
pub use config::{BackendConfig, GatewayConfig, TransportConfig};
pub use local::LocalInference;

/// Stable identifier of a configured backend (`"local"`, `"cloud"`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(String);

impl BackendId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackendId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for BackendId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    Cloud,
}

/// One outbound call, tagged with the correlation id of its pending entry.
#[derive(Debug, Clone)]
pub struct OutboundCall {
    pub correlation_id: CorrelationId,
    pub prompt: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub stream: bool,
}

/// Backend reply before normalisation.
#[derive(Debug, Clone)]
pub struct RawReply {
    pub body: Value,
}

/// The capability every backend implements.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn default_model(&self) -> &str;

    /// Perform the outbound call. Streaming transports report partial text
    /// through `partials` before returning the final body.
    async fn send(
        &self,
        call: &OutboundCall,
        partials: &PartialSink,
    ) -> Result<RawReply, TransportError>;

    /// Pull the generated text out of this backend's reply shape. `None`
    /// means the body is malformed.
    fn extract_text(&self, body: &Value) -> Option<String>;

    async fn list_models(&self) -> Result<Vec<String>, TransportError>;
}

/// Closed set of concrete backends built from configuration.
pub enum Backend {
    Local(LocalInference),
    Cloud(CloudApi),
}

impl Backend {
    /// Build the transport for a configured backend. Returns `None` when the
    /// backend cannot be used (a cloud entry without an API key).
    pub fn from_config(client: &reqwest::Client, cfg: &BackendConfig) -> Option<Self> {
        match &cfg.transport {
            TransportConfig::Local { base_url } => Some(Self::Local(LocalInference::new(
                client.clone(),
                base_url,
                &cfg.default_model,
            ))),
            TransportConfig::Cloud { base_url, api_key } => {
                let key = api_key.as_deref().map(str::trim).filter(|k| !k.is_empty())?;
                Some(Self::Cloud(CloudApi::new(
                    client.clone(),
                    base_url,
                    key,
                    &cfg.default_model,
                )))
            }
        }
    }

    pub fn into_transport(self) -> Arc<dyn Transport> {
        Arc::new(self)
    }
}

#[async_trait]
impl Transport for Backend {
    fn kind(&self) -> BackendKind {
        match self {
            Self::Local(_) => BackendKind::Local,
            Self::Cloud(_) => BackendKind::Cloud,
        }
    }

    fn default_model(&self) -> &str {
        match self {
            Self::Local(local) => local.default_model(),
            Self::Cloud(cloud) => cloud.default_model(),
        }
    }

    async fn send(
        &self,
        call: &OutboundCall,
        partials: &PartialSink,
    ) -> Result<RawReply, TransportError> {
        match self {
            Self::Local(local) => local.send(call, partials).await,
            Self::Cloud(cloud) => cloud.send(call, partials).await,
        }
    }

    fn extract_text(&self, body: &Value) -> Option<String> {
        match self {
            Self::Local(local) => local.extract_text(body),
            Self::Cloud(cloud) => cloud.extract_text(body),
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, TransportError> {
        match self {
            Self::Local(local) => local.list_models().await,
            Self::Cloud(cloud) => cloud.list_models().await,
        }
    }
}

/// Read a non-2xx reply into a [`TransportError::Status`], keeping a short
/// excerpt of the body for the UI.
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Status {
        status: status.as_u16(),
        body: body.chars().take(300).collect(),
    })
}
