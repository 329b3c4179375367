use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use tracing::debug;

use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::{RelationalStore, Row};

/// Failures here belong to the node that issued the statement, not to the engine.
fn sql_err(e: impl std::fmt::Display) -> SluiceError {
    SluiceError::executor("relational", e.to_string())
}

fn to_sql(value: Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Array(b.iter().map(|x| Value::from(*x)).collect()),
    }
}

/// SQLite database used by `dataSource` reads and `sql_execution` writes.
pub struct SqliteRelational {
    conn: Mutex<Connection>,
}

impl SqliteRelational {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| SluiceError::Store(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| SluiceError::Store(e.to_string()))?;
        debug!(path = %path.display(), "Relational store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| SluiceError::Store(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a batch of statements (schema setup, seeding).
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(sql_err)?;
        conn.execute_batch(sql).map_err(sql_err)
    }
}

impl RelationalStore for SqliteRelational {
    fn query(&self, sql: &str, params: Vec<Value>) -> BoxFuture<'_, Result<Vec<Row>>> {
        let sql = sql.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(sql_err)?;
            let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

            let mut rows = stmt
                .query(params_from_iter(params.into_iter().map(to_sql)))
                .map_err(sql_err)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(sql_err)? {
                let mut obj = Row::new();
                for (i, name) in columns.iter().enumerate() {
                    obj.insert(name.clone(), from_sql(row.get_ref(i).map_err(sql_err)?));
                }
                out.push(obj);
            }
            debug!(rows = out.len(), "Relational query finished");
            Ok(out)
        })
    }

    fn execute(&self, sql: &str, params: Vec<Value>) -> BoxFuture<'_, Result<u64>> {
        let sql = sql.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(sql_err)?;
            let affected = conn
                .execute(&sql, params_from_iter(params.into_iter().map(to_sql)))
                .map_err(sql_err)?;
            Ok(affected as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded() -> SqliteRelational {
        let db = SqliteRelational::in_memory().unwrap();
        db.execute_batch(
            "CREATE TABLE news (id INTEGER PRIMARY KEY, title TEXT, score REAL, tags TEXT);
             INSERT INTO news (title, score, tags) VALUES ('alpha', 0.5, NULL), ('beta', 2.0, 'x');",
        )
        .unwrap();
        db
    }

    #[tokio::test]
    async fn test_query_rows_as_objects() {
        let db = seeded();
        let rows = db
            .query("SELECT id, title, score, tags FROM news WHERE score > ?1 ORDER BY id", vec![json!(0.1)])
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(Value::Object(rows[0].clone()), json!({"id": 1, "title": "alpha", "score": 0.5, "tags": null}));
    }

    #[tokio::test]
    async fn test_execute_with_params() {
        let db = seeded();
        let affected = db
            .execute("UPDATE news SET tags = ?1 WHERE title = ?2", vec![json!(["a"]), json!("alpha")])
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let rows = db.query("SELECT tags FROM news WHERE id = 1", vec![]).await.unwrap();
        assert_eq!(rows[0]["tags"], json!("[\"a\"]"));
    }

    #[tokio::test]
    async fn test_bad_sql_is_node_failure() {
        let db = seeded();
        let err = db.query("SELECT nope FROM missing", vec![]).await.unwrap_err();
        assert!(err.is_node_failure());
    }
}
