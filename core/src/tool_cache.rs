//! Content-addressed, TTL-bounded cache of tool call results.
//!
//! Grounded on `examples/original_source/tools/tool_cache.py`: WAL-mode
//! SQLite so multiple orchestrator processes can share a cache file
//! safely, an MD5 key over `server:tool:sorted-json-params`, and the
//! same "don't cache this" heuristics (empty result, an `"error"` key,
//! a substring blocklist for rate-limit/unavailable responses, and an
//! explicit `success: false`).

use std::path::Path;
use std::sync::Mutex;

use rusqlite::OptionalExtension;
use serde_json::Value;

use crate::error::Result;
use crate::error::SwitchboardError;

const UNCACHEABLE_SUBSTRINGS: &[&str] = &[
    "503",
    "429",
    "rate limit",
    "rate-limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "service unavailable",
    "quota exceeded",
    "throttled",
    "blocked",
];

#[derive(Debug, Clone)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_hits: i64,
}

/// SQLite-backed cache of `(server, tool, params) -> result` lookups.
pub struct ToolCache {
    conn: Mutex<rusqlite::Connection>,
    ttl: chrono::Duration,
}

impl ToolCache {
    pub fn open(path: &Path, ttl_seconds: i64) -> Result<Self> {
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| SwitchboardError::Cache(format!("failed to open {}: {e}", path.display())))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            ttl: chrono::Duration::seconds(ttl_seconds),
        })
    }

    pub fn open_in_memory(ttl_seconds: i64) -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| SwitchboardError::Cache(e.to_string()))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            ttl: chrono::Duration::seconds(ttl_seconds),
        })
    }

    fn init_schema(conn: &rusqlite::Connection) -> Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| SwitchboardError::Cache(e.to_string()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| SwitchboardError::Cache(e.to_string()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache (
                cache_key TEXT PRIMARY KEY,
                server_name TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                params TEXT NOT NULL,
                result TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_cache_timestamp ON cache(timestamp);
            CREATE INDEX IF NOT EXISTS idx_cache_server_tool ON cache(server_name, tool_name);",
        )
        .map_err(|e| SwitchboardError::Cache(e.to_string()))?;
        Ok(())
    }

    /// `md5(f"{server}:{tool}:{sorted_json(params)}")`, matching the
    /// Python reference byte-for-byte so caches built by either
    /// implementation would key identically.
    pub fn cache_key(server: &str, tool: &str, params: &Value) -> String {
        let canonical = canonicalize(params);
        let material = format!("{server}:{tool}:{canonical}");
        format!("{:x}", md5::compute(material.as_bytes()))
    }

    pub fn get(&self, server: &str, tool: &str, params: &Value) -> Result<Option<Value>> {
        let key = Self::cache_key(server, tool, params);
        let conn = self.conn.lock().expect("cache mutex poisoned");
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT result, timestamp FROM cache WHERE cache_key = ?1",
                [&key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| SwitchboardError::Cache(e.to_string()))?;

        let Some((result_json, timestamp)) = row else {
            return Ok(None);
        };

        let age = chrono::Utc::now().timestamp() - timestamp;
        if age >= self.ttl.num_seconds() {
            conn.execute("DELETE FROM cache WHERE cache_key = ?1", [&key])
                .map_err(|e| SwitchboardError::Cache(e.to_string()))?;
            return Ok(None);
        }

        conn.execute(
            "UPDATE cache SET access_count = access_count + 1 WHERE cache_key = ?1",
            [&key],
        )
        .map_err(|e| SwitchboardError::Cache(e.to_string()))?;

        let value: Value = serde_json::from_str(&result_json)
            .map_err(|e| SwitchboardError::Cache(format!("corrupt cache row: {e}")))?;
        Ok(Some(value))
    }

    /// Stores `result` unless it matches one of the uncacheable
    /// heuristics. Returns whether it was actually stored.
    pub fn set(&self, server: &str, tool: &str, params: &Value, result: &Value) -> Result<bool> {
        if !is_cacheable(result) {
            return Ok(false);
        }
        let key = Self::cache_key(server, tool, params);
        let params_json = canonicalize(params);
        let result_json = serde_json::to_string(result).map_err(|e| SwitchboardError::Cache(e.to_string()))?;
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().expect("cache mutex poisoned");
        conn.execute(
            "INSERT INTO cache (cache_key, server_name, tool_name, params, result, timestamp, access_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)
             ON CONFLICT(cache_key) DO UPDATE SET result = excluded.result, timestamp = excluded.timestamp",
            rusqlite::params![key, server, tool, params_json, result_json, now],
        )
        .map_err(|e| SwitchboardError::Cache(e.to_string()))?;
        Ok(true)
    }

    pub fn clear_expired(&self) -> Result<usize> {
        let cutoff = chrono::Utc::now().timestamp() - self.ttl.num_seconds();
        let conn = self.conn.lock().expect("cache mutex poisoned");
        let removed = conn
            .execute("DELETE FROM cache WHERE timestamp < ?1", [cutoff])
            .map_err(|e| SwitchboardError::Cache(e.to_string()))?;
        Ok(removed)
    }

    pub fn clear_all(&self) -> Result<()> {
        let conn = self.conn.lock().expect("cache mutex poisoned");
        conn.execute("DELETE FROM cache", [])
            .map_err(|e| SwitchboardError::Cache(e.to_string()))?;
        Ok(())
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let conn = self.conn.lock().expect("cache mutex poisoned");
        let total_entries: usize = conn
            .query_row("SELECT COUNT(*) FROM cache", [], |row| row.get(0))
            .map_err(|e| SwitchboardError::Cache(e.to_string()))?;
        let total_hits: i64 = conn
            .query_row("SELECT COALESCE(SUM(access_count), 0) FROM cache", [], |row| row.get(0))
            .map_err(|e| SwitchboardError::Cache(e.to_string()))?;
        Ok(CacheStats {
            total_entries,
            total_hits,
        })
    }
}

fn canonicalize(value: &Value) -> String {
    fn sort_value(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().map(|(k, v)| (k.clone(), sort_value(v))).collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                Value::Object(entries.into_iter().collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(sort_value).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_string(&sort_value(value)).unwrap_or_default()
}

fn is_cacheable(result: &Value) -> bool {
    if result.is_null() {
        return false;
    }
    if let Value::String(s) = result {
        if s.trim().is_empty() {
            return false;
        }
    }
    if let Value::Object(map) = result {
        if map.is_empty() {
            return false;
        }
        if map.contains_key("error") {
            return false;
        }
        if let Some(Value::Bool(false)) = map.get("success") {
            return false;
        }
    }
    if let Value::Array(items) = result {
        if items.is_empty() {
            return false;
        }
    }
    let text = result.to_string().to_lowercase();
    !UNCACHEABLE_SUBSTRINGS.iter().any(|needle| text.contains(needle))
}
