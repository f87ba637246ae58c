//! Structured event log persisted to SQLite and mirrored to the `log` facade.

use r2d2_sqlite::rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Event {
    pub level: log::Level,
    pub code: Option<&'static str>,
    pub module: String,
    pub message: String,
    pub explain: Option<String>,
    pub data: Option<Value>,
}

impl Event {
    pub fn new(level: log::Level, module: &str, message: impl Into<String>) -> Self {
        Self {
            level,
            code: None,
            module: module.to_string(),
            message: message.into(),
            explain: None,
            data: None,
        }
    }

    pub fn info(module: &str, message: impl Into<String>) -> Self {
        Self::new(log::Level::Info, module, message)
    }

    pub fn warn(module: &str, message: impl Into<String>) -> Self {
        Self::new(log::Level::Warn, module, message)
    }

    pub fn code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn explain(mut self, explain: impl Into<String>) -> Self {
        self.explain = Some(explain.into());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Row returned to the activity feed.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub id: String,
    pub ts: i64,
    pub level: String,
    pub code: Option<String>,
    pub module: String,
    pub message: String,
    pub explain: Option<String>,
    pub data: Option<Value>,
}

pub fn log_event(conn: &Connection, event: &Event) -> rusqlite::Result<()> {
    log::log!(
        target: "karna::events",
        event.level,
        "[{}] {}{}",
        event.module,
        event.code.map(|c| format!("{c} ")).unwrap_or_default(),
        event.message
    );

    let id = Uuid::new_v4().to_string();
    let ts = OffsetDateTime::now_utc().unix_timestamp();
    let level = event.level.as_str().to_lowercase();
    let data_str = event.data.as_ref().map(Value::to_string);
    conn.execute(
        "INSERT INTO event_log (id, ts, level, code, module, message, explain, data) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![id, ts, level, event.code, event.module, event.message, event.explain, data_str],
    )?;
    Ok(())
}

/// Most recent events first, optionally restricted to modules starting with
/// `module_prefix` (`"ai"` matches `ai.runtime` and `ai.settings`).
pub fn recent_events(
    conn: &Connection,
    module_prefix: Option<&str>,
    limit: usize,
) -> rusqlite::Result<Vec<EventRecord>> {
    let pattern = format!("{}%", module_prefix.unwrap_or_default());
    let mut stmt = conn.prepare(
        "SELECT id, ts, level, code, module, message, explain, data FROM event_log
         WHERE module LIKE ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![pattern, limit as i64], |row| {
        let data: Option<String> = row.get(7)?;
        Ok(EventRecord {
            id: row.get(0)?,
            ts: row.get(1)?,
            level: row.get(2)?,
            code: row.get(3)?,
            module: row.get(4)?,
            message: row.get(5)?,
            explain: row.get(6)?,
            data: data.and_then(|d| serde_json::from_str(&d).ok()),
        })
    })?;
    rows.collect()
}
