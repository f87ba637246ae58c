use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as B64_ENGINE;
use base64::Engine;
use log::warn;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{cloud, local, BackendId};
use crate::db::store::{self, Namespace};
use crate::logging::{log_event, Event};

const CONFIG_KEY: &str = "gateway.config";
const CLOUD_KEY_ENV: &str = "GEMINI_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    Local {
        base_url: String,
    },
    Cloud {
        base_url: String,
        /// Never persisted in the settings blob; filled from the credential
        /// store when the config is loaded.
        #[serde(default, skip_serializing)]
        api_key: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: BackendId,
    pub display_name: String,
    pub default_model: String,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Upper bound for fallback attempts; they never get more time than the
    /// first attempt.
    #[serde(default)]
    pub fallback_timeout_ms: Option<u64>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default)]
    pub fallback_order: Vec<BackendId>,
    pub backends: Vec<BackendConfig>,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> usize {
    2
}

fn default_sweep_interval_ms() -> u64 {
    5_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            fallback_timeout_ms: None,
            max_attempts: default_max_attempts(),
            sweep_interval_ms: default_sweep_interval_ms(),
            fallback_order: vec![BackendId::from("local"), BackendId::from("cloud")],
            backends: vec![
                BackendConfig {
                    id: BackendId::from("local"),
                    display_name: "Local inference".into(),
                    default_model: local::DEFAULT_MODEL.into(),
                    transport: TransportConfig::Local {
                        base_url: local::DEFAULT_BASE_URL.into(),
                    },
                },
                BackendConfig {
                    id: BackendId::from("cloud"),
                    display_name: "Cloud API".into(),
                    default_model: cloud::DEFAULT_MODEL.into(),
                    transport: TransportConfig::Cloud {
                        base_url: cloud::DEFAULT_BASE_URL.into(),
                        api_key: None,
                    },
                },
            ],
        }
    }
}

impl GatewayConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn fallback_timeout(&self) -> Option<Duration> {
        self.fallback_timeout_ms.map(Duration::from_millis)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn backend(&self, id: &BackendId) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| &b.id == id)
    }

    /// Reject configurations the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout_ms == 0 {
            return Err(anyhow!("default_timeout_ms must be positive"));
        }
        if self.fallback_timeout_ms == Some(0) {
            return Err(anyhow!("fallback_timeout_ms must be positive"));
        }
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be at least 1"));
        }
        let mut seen = std::collections::HashSet::new();
        for backend in &self.backends {
            if !seen.insert(&backend.id) {
                return Err(anyhow!("backend `{}` is configured twice", backend.id));
            }
            if backend.default_model.trim().is_empty() {
                return Err(anyhow!("backend `{}` has no default model", backend.id));
            }
        }
        for id in &self.fallback_order {
            if self.backend(id).is_none() {
                return Err(anyhow!("fallback order names unknown backend `{id}`"));
            }
        }
        Ok(())
    }
}

/// Store the default configuration if none has been written yet.
pub fn seed_defaults(conn: &rusqlite::Connection) -> Result<()> {
    let existing = store::get_blob(conn, Namespace::Settings, CONFIG_KEY)?;
    if existing.is_none() {
        save(conn, &GatewayConfig::default())?;
    }
    Ok(())
}

/// Load the gateway configuration with credentials merged in.
pub fn load(conn: &rusqlite::Connection) -> Result<GatewayConfig> {
    let blob = store::get_blob(conn, Namespace::Settings, CONFIG_KEY)?
        .ok_or_else(|| anyhow!("gateway configuration has not been seeded"))?;
    let mut config: GatewayConfig =
        serde_json::from_value(blob).context("stored gateway configuration is invalid")?;

    for backend in &mut config.backends {
        if let TransportConfig::Cloud { api_key, .. } = &mut backend.transport {
            *api_key = match load_secret(conn, &backend.id)? {
                Some(secret) => Some(secret),
                None => std::env::var(CLOUD_KEY_ENV).ok(),
            };
        }
    }
    config.validate()?;
    Ok(config)
}

pub fn save(conn: &rusqlite::Connection, config: &GatewayConfig) -> Result<()> {
    config.validate()?;
    let value = serde_json::to_value(config)?;
    store::put_blob(conn, Namespace::Settings, CONFIG_KEY, &value)?;
    Ok(())
}

/// Store or clear the API key for a backend. Blank keys remove the entry.
pub fn set_api_key(conn: &rusqlite::Connection, backend: &BackendId, api_key: &str) -> Result<()> {
    let trimmed = api_key.trim();
    if trimmed.is_empty() {
        conn.execute(
            "DELETE FROM credentials WHERE backend_id = ?1",
            params![backend.as_str()],
        )?;
    } else {
        let encoded = B64_ENGINE.encode(trimmed.as_bytes());
        let now = OffsetDateTime::now_utc().unix_timestamp();
        conn.execute(
            "INSERT INTO credentials (backend_id, secret, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(backend_id) DO UPDATE SET secret = excluded.secret, updated_at = excluded.updated_at",
            params![backend.as_str(), encoded, now],
        )?;
    }
    let event = Event::info("settings", "API key updated")
        .code("CFG-0001")
        .data(serde_json::json!({ "backend": backend, "cleared": trimmed.is_empty() }));
    if let Err(err) = log_event(conn, &event) {
        warn!("failed to record API key change for `{backend}`: {err}");
    }
    Ok(())
}

fn load_secret(conn: &rusqlite::Connection, backend: &BackendId) -> Result<Option<String>> {
    let secret: Option<String> = conn
        .query_row(
            "SELECT secret FROM credentials WHERE backend_id = ?1",
            params![backend.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(s) = secret {
        let decoded = B64_ENGINE
            .decode(s.as_bytes())
            .map_err(|_| anyhow!("Failed to decode stored credential"))?;
        let value = String::from_utf8(decoded)
            .map_err(|_| anyhow!("Stored credential was not valid UTF-8"))?;
        Ok(Some(value))
    } else {
        Ok(None)
    }
}
