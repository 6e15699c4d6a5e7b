//! SQLite engine backed by rusqlite.
//!
//! rusqlite is blocking, so every call runs on the blocking pool with a fresh
//! read-only connection.

use crate::error::{RagError, Result};
use crate::execution::result::{float_to_json, QueryResult, Row};
use crate::schema::{ElementKind, SchemaElement};
use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::{Connection, InterruptHandle, OpenFlags};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const ENGINE_NAME: &str = "sqlite";

#[derive(Debug, Clone)]
pub struct SqliteRunner {
    path: PathBuf,
}

impl SqliteRunner {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn execute(
        &self,
        sql: &str,
        params: &[serde_json::Value],
        timeout: Duration,
    ) -> Result<QueryResult> {
        let path = self.path.clone();
        let sql = sql.to_string();
        let params = params.to_vec();
        let start = Instant::now();

        let (handle_tx, handle_rx) = oneshot::channel::<InterruptHandle>();
        let task = tokio::task::spawn_blocking(move || {
            let conn = open_read_only(&path)?;
            let _ = handle_tx.send(conn.get_interrupt_handle());
            run_query(&conn, &sql, &params)
        });

        let (columns, rows) = match tokio::time::timeout(timeout, task).await {
            Ok(joined) => joined
                .map_err(|e| RagError::Database(format!("SQLite worker failed: {}", e)))??,
            Err(_) => {
                // stop the statement so the blocking thread is released
                if let Ok(handle) = handle_rx.await {
                    handle.interrupt();
                }
                warn!("SQLite query interrupted after {:?}", timeout);
                return Err(RagError::Database(format!(
                    "Query timed out after {}s",
                    timeout.as_secs_f64()
                )));
            }
        };

        let elapsed = start.elapsed().as_millis() as u64;
        debug!("SQLite returned {} rows in {}ms", rows.len(), elapsed);
        Ok(QueryResult::new(columns, rows, ENGINE_NAME, elapsed))
    }

    pub async fn validate_connection(&self) -> bool {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            open_read_only(&path)
                .and_then(|conn| run_query(&conn, "SELECT 1", &[]))
                .is_ok()
        })
        .await
        .unwrap_or(false)
    }

    pub async fn load_schema(&self) -> Result<Vec<SchemaElement>> {
        let path = self.path.clone();
        let elements = tokio::task::spawn_blocking(move || {
            let conn = open_read_only(&path)?;
            introspect(&conn)
        })
        .await
        .map_err(|e| RagError::Database(format!("SQLite worker failed: {}", e)))??;

        info!(
            "Loaded {} schema elements from {}",
            elements.len(),
            self.path.display()
        );
        Ok(elements)
    }
}

fn open_read_only(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
    )
    .map_err(|e| RagError::Database(format!("Failed to open {}: {}", path.display(), e)))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

fn run_query(
    conn: &Connection,
    sql: &str,
    params: &[serde_json::Value],
) -> Result<(Vec<String>, Vec<Row>)> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let values: Vec<SqliteValue> = params.iter().map(json_to_sqlite).collect();

    let mut rows = stmt.query(rusqlite::params_from_iter(values.iter()))?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Row::new();
        for (idx, name) in columns.iter().enumerate() {
            record.insert(name.clone(), sqlite_to_json(row.get_ref(idx)?));
        }
        records.push(record);
    }
    Ok((columns, records))
}

fn introspect(conn: &Connection) -> Result<Vec<SchemaElement>> {
    let mut stmt = conn.prepare(
        "SELECT name, type FROM sqlite_master \
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
         ORDER BY name",
    )?;
    let objects: Vec<(String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<_, _>>()?;

    let mut elements = Vec::new();
    for (name, kind) in objects {
        let mut element = SchemaElement::table(&name);
        if kind == "view" {
            element.kind = ElementKind::View;
            element.description = Some(format!("View: {}", name));
        }
        elements.push(element);

        let pragma = format!("PRAGMA table_info(\"{}\")", name.replace('"', "\"\""));
        let mut columns = conn.prepare(&pragma)?;
        let column_rows: Vec<(String, String)> = columns
            .query_map([], |row| Ok((row.get(1)?, row.get(2)?)))?
            .collect::<std::result::Result<_, _>>()?;
        for (column, dtype) in column_rows {
            let dtype = if dtype.is_empty() { "unknown".to_string() } else { dtype };
            elements.push(SchemaElement::column(&name, &column, &dtype));
        }
    }
    Ok(elements)
}

fn json_to_sqlite(value: &serde_json::Value) -> SqliteValue {
    match value {
        serde_json::Value::Null => SqliteValue::Null,
        serde_json::Value::Bool(b) => SqliteValue::Integer(i64::from(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => SqliteValue::Integer(i),
            None => SqliteValue::Real(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => SqliteValue::Text(s.clone()),
        other => SqliteValue::Text(other.to_string()),
    }
}

fn sqlite_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => float_to_json(f),
        ValueRef::Text(bytes) => serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => serde_json::Value::String(format!("<blob {} bytes>", bytes.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seed(dir: &Path) -> PathBuf {
        let path = dir.join("demo.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE patients (id INTEGER PRIMARY KEY, name TEXT, weight REAL);
             INSERT INTO patients VALUES (1, 'Ada', 61.5), (2, 'Grace', NULL);
             CREATE VIEW heavy AS SELECT * FROM patients WHERE weight > 60;",
        )
        .unwrap();
        path
    }

    #[tokio::test]
    async fn test_execute_returns_rows() {
        let dir = tempfile::tempdir().unwrap();
        let runner = SqliteRunner::new(seed(dir.path()));

        let result = runner
            .execute("SELECT id, name, weight FROM patients ORDER BY id", &[], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["id", "name", "weight"]);
        assert_eq!(result.row_count, 2);
        assert_eq!(result.rows[0]["name"], json!("Ada"));
        assert_eq!(result.rows[0]["weight"], json!(61.5));
        assert_eq!(result.rows[1]["weight"], serde_json::Value::Null);
        assert_eq!(result.engine_name, "sqlite");
    }

    #[tokio::test]
    async fn test_execute_binds_params() {
        let dir = tempfile::tempdir().unwrap();
        let runner = SqliteRunner::new(seed(dir.path()));

        let result = runner
            .execute("SELECT name FROM patients WHERE id = ?1", &[json!(2)], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.rows[0]["name"], json!("Grace"));
    }

    #[tokio::test]
    async fn test_connection_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let runner = SqliteRunner::new(seed(dir.path()));

        let err = runner
            .execute("DELETE FROM patients", &[], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Database(_)));
    }

    #[tokio::test]
    async fn test_bad_sql_is_database_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = SqliteRunner::new(seed(dir.path()));

        let err = runner
            .execute("SELECT * FROM missing LIMIT 1", &[], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[tokio::test]
    async fn test_runaway_query_is_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let runner = SqliteRunner::new(seed(dir.path()));
        let endless = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT COUNT(*) FROM c";

        let started = Instant::now();
        let err = runner
            .execute(endless, &[], Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Database(_)));
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));

        // the worker thread is free again
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            runner.execute("SELECT COUNT(*) AS n FROM patients", &[], Duration::from_secs(5)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(result.rows[0]["n"], json!(2));
    }

    #[tokio::test]
    async fn test_load_schema() {
        let dir = tempfile::tempdir().unwrap();
        let runner = SqliteRunner::new(seed(dir.path()));

        let elements = runner.load_schema().await.unwrap();
        let heavy = elements.iter().find(|e| e.name == "heavy").unwrap();
        assert_eq!(heavy.kind, ElementKind::View);

        let weight = elements.iter().find(|e| e.name == "patients.weight").unwrap();
        assert_eq!(weight.dtype(), Some("REAL"));
        assert_eq!(weight.owning_table(), Some("patients"));
    }

    #[tokio::test]
    async fn test_validate_connection() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SqliteRunner::new(seed(dir.path())).validate_connection().await);
        assert!(!SqliteRunner::new(dir.path().join("absent.db")).validate_connection().await);
    }
}
