use std::time::Duration;

use thiserror::Error;

use crate::backends::BackendId;
use crate::gateway::{AttemptRecord, CorrelationId};

/// Failure reported by a single transport call, before the gateway decides
/// whether to fall back.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("could not reach backend: {0}")]
    Connect(String),
    #[error("backend replied with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("backend reply could not be decoded: {0}")]
    Decode(String),
}

impl TransportError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Connect(_) | Self::Decode(_) => None,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    // The cloud backend authenticates with a `key` query parameter, so the
    // request URL never goes into the message.
    fn from(err: reqwest::Error) -> Self {
        let err = err.without_url();
        if let Some(status) = err.status() {
            Self::Status {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else if err.is_decode() || err.is_body() {
            Self::Decode(err.to_string())
        } else {
            Self::Connect(err.to_string())
        }
    }
}

/// Terminal outcome of a `generate` call that did not produce text.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("invalid generation request: {0}")]
    InvalidRequest(String),
    #[error("backend `{backend}` is not configured")]
    BackendUnavailable { backend: BackendId },
    #[error("backend `{backend}` did not reply within {}ms", .after.as_millis())]
    Timeout {
        backend: BackendId,
        correlation_id: CorrelationId,
        after: Duration,
    },
    #[error("backend `{backend}` failed: {message}")]
    ProviderError {
        backend: BackendId,
        status: Option<u16>,
        message: String,
    },
    #[error("all backends failed (tried {}): {last}", join_ids(.attempted))]
    AllBackendsExhausted {
        attempted: Vec<BackendId>,
        /// One record per dispatch, in order, for the event log.
        attempts: Vec<AttemptRecord>,
        last: Box<GenerationError>,
    },
}

impl GenerationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "GW-1000",
            Self::BackendUnavailable { .. } => "GW-1001",
            Self::Timeout { .. } => "GW-1002",
            Self::ProviderError { .. } => "GW-1003",
            Self::AllBackendsExhausted { .. } => "GW-1004",
        }
    }

    pub fn explain(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "The prompt or call options were rejected before dispatch.",
            Self::BackendUnavailable { .. } => {
                "No transport is configured for the requested backend. Check its settings or API key."
            }
            Self::Timeout { .. } => "The backend accepted the call but no reply arrived before the deadline.",
            Self::ProviderError { .. } => {
                "The backend replied with an error status or a body that could not be understood."
            }
            Self::AllBackendsExhausted { .. } => {
                "The preferred backend and every configured fallback failed for this call."
            }
        }
    }

    /// Whether this attempt-level failure lets the gateway move on to the
    /// next backend in the chain.
    pub fn triggers_fallback(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ProviderError { .. })
    }

    pub(crate) fn from_transport(backend: &BackendId, err: TransportError) -> Self {
        Self::ProviderError {
            backend: backend.clone(),
            status: err.status(),
            message: err.to_string(),
        }
    }
}

fn join_ids(ids: &[BackendId]) -> String {
    ids.iter()
        .map(BackendId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
