//! Small JSON blob store used for settings, conversation history and the
//! modification log.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use time::OffsetDateTime;

/// Oldest entries are dropped once an append-only log reaches this size.
pub const LOG_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Settings,
    Conversations,
    Modifications,
}

impl Namespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Settings => "settings",
            Self::Conversations => "conversations",
            Self::Modifications => "modifications",
        }
    }
}

pub fn put_blob(conn: &Connection, ns: Namespace, key: &str, value: &Value) -> Result<()> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT INTO blobs (namespace, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![ns.as_str(), key, value.to_string(), now],
    )?;
    Ok(())
}

pub fn get_blob(conn: &Connection, ns: Namespace, key: &str) -> Result<Option<Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM blobs WHERE namespace = ?1 AND key = ?2",
            params![ns.as_str(), key],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|r| serde_json::from_str(&r).map_err(|err| anyhow!("corrupt blob {key}: {err}")))
        .transpose()
}

pub fn delete_blob(conn: &Connection, ns: Namespace, key: &str) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM blobs WHERE namespace = ?1 AND key = ?2",
        params![ns.as_str(), key],
    )?;
    Ok(removed > 0)
}

pub fn list_keys(conn: &Connection, ns: Namespace) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT key FROM blobs WHERE namespace = ?1 ORDER BY updated_at DESC, key")?;
    let rows = stmt.query_map(params![ns.as_str()], |row| row.get::<_, String>(0))?;
    let mut keys = Vec::new();
    for row in rows {
        keys.push(row?);
    }
    Ok(keys)
}

/// Append `entry` to the JSON array stored at `key`, trimming the front so
/// at most [`LOG_CAPACITY`] entries remain. Returns the new length.
pub fn append_entry(conn: &mut Connection, ns: Namespace, key: &str, entry: Value) -> Result<usize> {
    append_entries(conn, ns, key, vec![entry])
}

/// Append several entries in one write transaction. The read and the write
/// back happen under the database write lock, so concurrent appends to the
/// same key never drop each other's entries.
pub fn append_entries(
    conn: &mut Connection,
    ns: Namespace,
    key: &str,
    new_entries: Vec<Value>,
) -> Result<usize> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut entries = list_entries(&tx, ns, key)?;
    entries.extend(new_entries);
    if entries.len() > LOG_CAPACITY {
        let excess = entries.len() - LOG_CAPACITY;
        entries.drain(..excess);
    }
    let len = entries.len();
    put_blob(&tx, ns, key, &Value::Array(entries))?;
    tx.commit()?;
    Ok(len)
}

pub fn list_entries(conn: &Connection, ns: Namespace, key: &str) -> Result<Vec<Value>> {
    match get_blob(conn, ns, key)? {
        None => Ok(Vec::new()),
        Some(Value::Array(entries)) => Ok(entries),
        Some(_) => Err(anyhow!("blob {}/{key} is not a list", ns.as_str())),
    }
}
