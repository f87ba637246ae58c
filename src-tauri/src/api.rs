//! Tauri IPC surface invoked by the UI.
//!
//! Commands are thin wrappers that validate input, run blocking database
//! work off the async runtime where needed and return JSON-friendly payloads.

use std::sync::Arc;
use std::time::Duration;

use karna_core::backends::config as gateway_config;
use karna_core::db::store::{self, Namespace};
use karna_core::db::DbPool;
use karna_core::gateway::BackendInfo;
use karna_core::logging::{recent_events, EventRecord};
use karna_core::{BackendId, GenerateOptions, GeneratedText, ModelManager};
use serde::Deserialize;
use serde_json::Value;
use tauri::{AppHandle, Emitter, State};
use time::OffsetDateTime;

pub const PARTIAL_EVENT: &str = "gateway://partial";
const MODIFICATION_LOG_KEY: &str = "history";

/// Shared state injected into each command handler.
#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub models: Arc<ModelManager>,
}

#[derive(Deserialize)]
pub struct GenerateInput {
    pub prompt: String,
    pub backend: String,
    pub model: Option<String>,
    pub timeout_ms: Option<u64>,
    pub system_prompt: Option<String>,
    pub conversation: Option<String>,
}

impl GenerateInput {
    fn options(&self) -> GenerateOptions {
        GenerateOptions {
            model: self.model.clone(),
            timeout: self.timeout_ms.map(Duration::from_millis),
            system_prompt: self.system_prompt.clone(),
        }
    }
}

#[tauri::command]
pub fn ping() -> Value {
    serde_json::json!({
        "ok": true,
        "ts": time_now(),
    })
}

#[tauri::command]
pub fn gateway_backends(state: State<AppState>) -> Vec<BackendInfo> {
    state.models.gateway().backends()
}

#[tauri::command]
pub async fn gateway_models(
    state: State<'_, AppState>,
    backend: String,
    refresh: Option<bool>,
) -> Result<Vec<String>, String> {
    state
        .models
        .gateway()
        .list_models(&BackendId::from(backend), refresh.unwrap_or(false))
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn gateway_generate(
    state: State<'_, AppState>,
    input: GenerateInput,
) -> Result<GeneratedText, String> {
    let options = input.options();
    state
        .models
        .generate(
            input.conversation,
            input.prompt,
            BackendId::from(input.backend),
            options,
        )
        .await
        .map_err(|e| e.to_string())
}

/// Like `gateway_generate`, emitting each fragment as a `gateway://partial`
/// event before the final result is returned.
#[tauri::command]
pub async fn gateway_generate_stream(
    app: AppHandle,
    state: State<'_, AppState>,
    input: GenerateInput,
) -> Result<GeneratedText, String> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let forward = tauri::async_runtime::spawn(async move {
        while let Some(partial) = rx.recv().await {
            if let Err(err) = app.emit(PARTIAL_EVENT, &partial) {
                log::warn!("failed to emit partial {}: {err}", partial.correlation_id);
            }
        }
    });
    let options = input.options();
    let result = state
        .models
        .generate_streaming(
            input.conversation,
            input.prompt,
            BackendId::from(input.backend),
            options,
            tx,
        )
        .await;
    // The sender is gone once the call resolves, so the forwarder drains and
    // exits.
    if let Err(err) = forward.await {
        log::warn!("partial forwarder stopped abnormally: {err}");
    }
    result.map_err(|e| e.to_string())
}

/// Store a backend API key. It applies from the next start; the backend set
/// is fixed for the lifetime of the process.
#[tauri::command]
pub fn gateway_set_api_key(
    state: State<AppState>,
    backend: String,
    api_key: String,
) -> Result<(), String> {
    let conn = state.db.get().map_err(|e| e.to_string())?;
    gateway_config::set_api_key(&conn, &BackendId::from(backend), &api_key)
        .map_err(|e| e.to_string())
}

#[tauri::command]
pub fn settings_get(state: State<AppState>, key: String) -> Result<Option<Value>, String> {
    let conn = state.db.get().map_err(|e| e.to_string())?;
    store::get_blob(&conn, Namespace::Settings, &key).map_err(|e| e.to_string())
}

#[tauri::command]
pub fn settings_put(state: State<AppState>, key: String, value: Value) -> Result<(), String> {
    if key.starts_with("gateway.") {
        return Err(format!("`{key}` is managed by the gateway"));
    }
    let conn = state.db.get().map_err(|e| e.to_string())?;
    store::put_blob(&conn, Namespace::Settings, &key, &value).map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn history_list(
    state: State<'_, AppState>,
    conversation: String,
) -> Result<Vec<Value>, String> {
    state
        .models
        .history(conversation)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn history_conversations(state: State<'_, AppState>) -> Result<Vec<String>, String> {
    state
        .models
        .conversations()
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
pub fn modification_log_append(state: State<AppState>, entry: Value) -> Result<usize, String> {
    let mut conn = state.db.get().map_err(|e| e.to_string())?;
    let entry = match entry {
        Value::Object(mut fields) => {
            fields
                .entry("ts")
                .or_insert_with(|| Value::from(time_now()));
            Value::Object(fields)
        }
        other => other,
    };
    store::append_entry(&mut conn, Namespace::Modifications, MODIFICATION_LOG_KEY, entry)
        .map_err(|e| e.to_string())
}

#[tauri::command]
pub fn modification_log_list(state: State<AppState>) -> Result<Vec<Value>, String> {
    let conn = state.db.get().map_err(|e| e.to_string())?;
    store::list_entries(&conn, Namespace::Modifications, MODIFICATION_LOG_KEY)
        .map_err(|e| e.to_string())
}

#[tauri::command]
pub fn events_recent(
    state: State<AppState>,
    module: Option<String>,
    limit: Option<usize>,
) -> Result<Vec<EventRecord>, String> {
    let conn = state.db.get().map_err(|e| e.to_string())?;
    recent_events(&conn, module.as_deref(), limit.unwrap_or(100)).map_err(|e| e.to_string())
}

fn time_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
