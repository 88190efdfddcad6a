//! Geopin persistence: a minimal document store (collection + key -> JSON)
//! with equality queries and prefix search. SQLite-backed for real use,
//! in-memory for tests and throwaway sessions.

#![forbid(unsafe_code)]

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// Equality filter on a top-level document field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self { field: field.into(), value: value.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Doc {
    pub key: String,
    pub data: Value,
}

pub trait Store: Send + Sync {
    /// Insert or replace a document.
    fn set(&self, collection: &str, key: &str, data: &Value) -> Result<()>;
    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>>;
    /// Documents whose fields equal every filter.
    fn query(
        &self,
        collection: &str,
        filters: &[Filter],
        limit: usize,
        order: Option<&OrderBy>,
    ) -> Result<Vec<Doc>>;
    /// Documents whose string `field` starts with `text`, ordered by that field.
    fn prefix_search(
        &self,
        collection: &str,
        field: &str,
        text: &str,
        limit: usize,
        direction: Direction,
    ) -> Result<Vec<Doc>>;
}

/// SQLite-backed store. Simple and synchronous; callers serialize access.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("GEOPIN_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS docs (
                collection TEXT NOT NULL,
                key        TEXT NOT NULL,
                data       TEXT NOT NULL,
                ts         INTEGER NOT NULL,
                PRIMARY KEY (collection, key)
            )",
            [],
        )
        .context("creating docs table")?;
        let me = Self { db: Mutex::new(db) };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        tracing::debug!(path, "sqlite store opened");
        Ok(me)
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }
}

fn json_path(field: &str) -> String {
    format!("$.{}", field)
}

fn to_sql(v: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match v {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) if !n.is_f64() => Sql::Integer(i),
            _ => Sql::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => Sql::Text(s.clone()),
        other => Sql::Text(other.to_string()),
    }
}

fn collect_docs(stmt: &mut rusqlite::Statement<'_>, params: Vec<rusqlite::types::Value>) -> Result<Vec<Doc>> {
    let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let key: String = row.get(0)?;
        let text: String = row.get(1)?;
        let data = serde_json::from_str(&text).with_context(|| format!("decoding document {}", key))?;
        out.push(Doc { key, data });
    }
    Ok(out)
}

impl Store for SqliteStore {
    fn set(&self, collection: &str, key: &str, data: &Value) -> Result<()> {
        let started = std::time::Instant::now();
        let text = serde_json::to_string(data)?;
        let db = self.conn()?;
        db.execute(
            "INSERT INTO docs(collection, key, data, ts) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(collection, key) DO UPDATE SET data = excluded.data, ts = excluded.ts",
            (collection, key, &text, now_ts()),
        )?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let mut stmt = db.prepare("SELECT data FROM docs WHERE collection = ?1 AND key = ?2")?;
        let mut rows = stmt.query((collection, key))?;
        let out = match rows.next()? {
            Some(row) => {
                let text: String = row.get(0)?;
                Some(serde_json::from_str(&text).with_context(|| format!("decoding document {}", key))?)
            }
            None => None,
        };
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn query(
        &self,
        collection: &str,
        filters: &[Filter],
        limit: usize,
        order: Option<&OrderBy>,
    ) -> Result<Vec<Doc>> {
        use rusqlite::types::Value as Sql;
        let started = std::time::Instant::now();
        let mut sql = String::from("SELECT key, data FROM docs WHERE collection = ?1");
        let mut params: Vec<Sql> = vec![Sql::Text(collection.to_string())];
        for f in filters {
            params.push(Sql::Text(json_path(&f.field)));
            let p = params.len();
            params.push(to_sql(&f.value));
            sql.push_str(&format!(" AND json_extract(data, ?{}) = ?{}", p, p + 1));
        }
        if let Some(o) = order {
            params.push(Sql::Text(json_path(&o.field)));
            let dir = if o.direction == Direction::Desc { "DESC" } else { "ASC" };
            sql.push_str(&format!(" ORDER BY json_extract(data, ?{}) {}, key ASC", params.len(), dir));
        } else {
            sql.push_str(" ORDER BY key ASC");
        }
        params.push(Sql::Integer(limit as i64));
        sql.push_str(&format!(" LIMIT ?{}", params.len()));
        let db = self.conn()?;
        let mut stmt = db.prepare(&sql)?;
        let out = collect_docs(&mut stmt, params)?;
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn prefix_search(
        &self,
        collection: &str,
        field: &str,
        text: &str,
        limit: usize,
        direction: Direction,
    ) -> Result<Vec<Doc>> {
        use rusqlite::types::Value as Sql;
        let started = std::time::Instant::now();
        let dir = if direction == Direction::Desc { "DESC" } else { "ASC" };
        let sql = format!(
            "SELECT key, data FROM docs
             WHERE collection = ?1 AND substr(json_extract(data, ?2), 1, length(?3)) = ?3
             ORDER BY json_extract(data, ?2) {}, key ASC LIMIT ?4",
            dir
        );
        let params = vec![
            Sql::Text(collection.to_string()),
            Sql::Text(json_path(field)),
            Sql::Text(text.to_string()),
            Sql::Integer(limit as i64),
        ];
        let db = self.conn()?;
        let mut stmt = db.prepare(&sql)?;
        let out = collect_docs(&mut stmt, params)?;
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}

/// In-memory store with the same semantics as [`SqliteStore`].
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<BTreeMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, BTreeMap<String, Value>>>> {
        self.collections.lock().map_err(|_| anyhow!("memory store lock poisoned"))
    }

    pub fn len(&self, collection: &str) -> usize {
        self.lock().map(|c| c.get(collection).map_or(0, |m| m.len())).unwrap_or(0)
    }
}

fn cmp_json(a: Option<&Value>, b: Option<&Value>) -> CmpOrdering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            x.as_f64().unwrap_or(0.0).total_cmp(&y.as_f64().unwrap_or(0.0))
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (None, Some(_)) => CmpOrdering::Less,
        (Some(_), None) => CmpOrdering::Greater,
        _ => CmpOrdering::Equal,
    }
}

fn sort_docs(docs: &mut [Doc], field: &str, direction: Direction) {
    docs.sort_by(|a, b| {
        let ord = cmp_json(a.data.get(field), b.data.get(field));
        let ord = if direction == Direction::Desc { ord.reverse() } else { ord };
        ord.then_with(|| a.key.cmp(&b.key))
    });
}

impl Store for MemoryStore {
    fn set(&self, collection: &str, key: &str, data: &Value) -> Result<()> {
        let mut c = self.lock()?;
        c.entry(collection.to_string()).or_default().insert(key.to_string(), data.clone());
        Ok(())
    }

    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let c = self.lock()?;
        Ok(c.get(collection).and_then(|m| m.get(key)).cloned())
    }

    fn query(
        &self,
        collection: &str,
        filters: &[Filter],
        limit: usize,
        order: Option<&OrderBy>,
    ) -> Result<Vec<Doc>> {
        let c = self.lock()?;
        let Some(m) = c.get(collection) else { return Ok(Vec::new()) };
        let mut docs: Vec<Doc> = m
            .iter()
            .filter(|(_, data)| filters.iter().all(|f| data.get(&f.field) == Some(&f.value)))
            .map(|(k, data)| Doc { key: k.clone(), data: data.clone() })
            .collect();
        if let Some(o) = order {
            sort_docs(&mut docs, &o.field, o.direction);
        }
        docs.truncate(limit);
        Ok(docs)
    }

    fn prefix_search(
        &self,
        collection: &str,
        field: &str,
        text: &str,
        limit: usize,
        direction: Direction,
    ) -> Result<Vec<Doc>> {
        let c = self.lock()?;
        let Some(m) = c.get(collection) else { return Ok(Vec::new()) };
        let mut docs: Vec<Doc> = m
            .iter()
            .filter(|(_, data)| data.get(field).and_then(Value::as_str).is_some_and(|s| s.starts_with(text)))
            .map(|(k, data)| Doc { key: k.clone(), data: data.clone() })
            .collect();
        sort_docs(&mut docs, field, direction);
        docs.truncate(limit);
        Ok(docs)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".geopin");
        let _ = std::fs::create_dir_all(&p);
        p.push("geopin.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "geopin.db".to_string()
}

pub fn now_ts() -> i64 {
    // seconds since epoch
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}
