use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use codeflow_core::error::{CodeflowError, Result};
use codeflow_core::traits::{Entity, Repository};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS documents (
        kind TEXT NOT NULL,
        id TEXT NOT NULL,
        body TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (kind, id)
    );";

/// SQLite-backed repository. Every entity kind lives in one table of JSON
/// documents keyed by `(kind, id)`.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db_err(e: impl std::fmt::Display) -> CodeflowError {
    CodeflowError::Database(e.to_string())
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CodeflowError::Database(format!("Failed to create db directory: {}", e))
                })?;
            }
        }

        let conn = Connection::open(path).map_err(db_err)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl<T: Entity> Repository<T> for SqliteStore {
    fn create(&self, entity: T) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let id = entity.id().to_string();
            let body = serde_json::to_string(&entity)?;
            let conn = self.conn.lock().map_err(db_err)?;
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO documents (kind, id, body, updated_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![T::KIND, id, body, Utc::now().to_rfc3339()],
                )
                .map_err(db_err)?;
            if inserted == 0 {
                return Err(CodeflowError::InvalidRequest(format!(
                    "{} {id} already exists",
                    T::KIND
                )));
            }
            Ok(())
        })
    }

    fn update(&self, entity: T) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let id = entity.id().to_string();
            let body = serde_json::to_string(&entity)?;
            let conn = self.conn.lock().map_err(db_err)?;
            let changed = conn
                .execute(
                    "UPDATE documents SET body = ?3, updated_at = ?4
                     WHERE kind = ?1 AND id = ?2",
                    params![T::KIND, id, body, Utc::now().to_rfc3339()],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Err(CodeflowError::not_found(T::KIND, id));
            }
            Ok(())
        })
    }

    fn get(&self, id: &T::Id) -> BoxFuture<'_, Result<Option<T>>> {
        let id = id.to_string();
        Box::pin(async move {
            let body: Option<String> = {
                let conn = self.conn.lock().map_err(db_err)?;
                conn.query_row(
                    "SELECT body FROM documents WHERE kind = ?1 AND id = ?2",
                    params![T::KIND, id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?
            };
            body.map(|b| serde_json::from_str(&b).map_err(CodeflowError::from))
                .transpose()
        })
    }

    fn list(&self, filter: &T::Filter) -> BoxFuture<'_, Result<Vec<T>>> {
        let filter = filter.clone();
        Box::pin(async move {
            let bodies: Vec<String> = {
                let conn = self.conn.lock().map_err(db_err)?;
                let mut stmt = conn
                    .prepare("SELECT body FROM documents WHERE kind = ?1 ORDER BY id ASC")
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![T::KIND], |row| row.get::<_, String>(0))
                    .map_err(db_err)?;
                rows.collect::<std::result::Result<_, _>>().map_err(db_err)?
            };

            let mut out = Vec::with_capacity(bodies.len());
            for body in bodies {
                let entity: T = serde_json::from_str(&body)?;
                if entity.matches(&filter) {
                    out.push(entity);
                }
            }
            Ok(out)
        })
    }

    fn delete(&self, id: &T::Id) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let removed = conn
                .execute(
                    "DELETE FROM documents WHERE kind = ?1 AND id = ?2",
                    params![T::KIND, id],
                )
                .map_err(db_err)?;
            Ok(removed > 0)
        })
    }
}
