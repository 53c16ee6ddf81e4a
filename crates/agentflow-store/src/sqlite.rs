use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use agentflow_core::error::{AgentflowError, Result};
use agentflow_core::traits::{FlowStore, RunStore};
use agentflow_core::types::{ExecutionRun, FlowDefinition};

/// SQLite-backed flow and run store. Records are kept as JSON documents
/// alongside the columns used for lookup and ordering.
pub struct SqliteStore {
    conn: Mutex<Option<Connection>>,
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS flows (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL DEFAULT '',
        definition TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS runs (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        flow_id TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT,
        record TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_runs_flow
        ON runs(flow_id, started_at DESC);";

fn db_err(e: rusqlite::Error) -> AgentflowError {
    AgentflowError::Database(e.to_string())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl SqliteStore {
    /// Open or create the store database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        info!(path = %path.display(), "Opened agentflow store");
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Close the connection. Later calls fail with a database error.
    pub fn close(&self) -> Result<()> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|e| AgentflowError::Database(e.to_string()))?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| db_err(e))?;
            debug!("Closed agentflow store");
        }
        Ok(())
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|e| AgentflowError::Database(e.to_string()))?;
        let conn = guard
            .as_mut()
            .ok_or_else(|| AgentflowError::Database("store is closed".into()))?;
        f(conn)
    }
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn put_flow(conn: &mut Connection, mut flow: FlowDefinition) -> Result<FlowDefinition> {
    let tx = conn.transaction().map_err(db_err)?;
    let existing: Option<String> = tx
        .query_row(
            "SELECT created_at FROM flows WHERE id = ?1",
            params![flow.id],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)?;

    let now = Utc::now();
    flow.created_at = existing
        .as_deref()
        .and_then(parse_ts)
        .or(flow.created_at)
        .or(Some(now));
    flow.updated_at = Some(now);

    let definition = serde_json::to_string(&flow)?;
    let created = flow.created_at.unwrap_or(now).to_rfc3339();
    tx.execute(
        "INSERT INTO flows (id, name, definition, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
             name = excluded.name,
             definition = excluded.definition,
             updated_at = excluded.updated_at",
        params![flow.id, flow.name, definition, created, now.to_rfc3339()],
    )
    .map_err(db_err)?;
    tx.commit().map_err(db_err)?;
    Ok(flow)
}

fn decode<T: serde::de::DeserializeOwned>(rows: Vec<String>) -> Result<Vec<T>> {
    rows.iter()
        .map(|json| serde_json::from_str(json).map_err(AgentflowError::from))
        .collect()
}

impl FlowStore for SqliteStore {
    fn get(&self, flow_id: &str) -> BoxFuture<'_, Result<Option<FlowDefinition>>> {
        let flow_id = flow_id.to_string();
        Box::pin(async move {
            let json: Option<String> = self.with_conn(|conn| {
                conn.query_row(
                    "SELECT definition FROM flows WHERE id = ?1",
                    params![flow_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)
            })?;
            json.map(|j| serde_json::from_str(&j).map_err(AgentflowError::from))
                .transpose()
        })
    }

    fn put(&self, flow: FlowDefinition) -> BoxFuture<'_, Result<FlowDefinition>> {
        Box::pin(async move { self.with_conn(|conn| put_flow(conn, flow)) })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<FlowDefinition>>> {
        Box::pin(async move {
            let rows = self.with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT definition FROM flows ORDER BY id")
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(db_err)?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(db_err)?;
                Ok(rows)
            })?;
            decode(rows)
        })
    }

    fn delete(&self, flow_id: &str) -> BoxFuture<'_, Result<bool>> {
        let flow_id = flow_id.to_string();
        Box::pin(async move {
            self.with_conn(|conn| {
                let deleted = conn
                    .execute("DELETE FROM flows WHERE id = ?1", params![flow_id])
                    .map_err(db_err)?;
                Ok(deleted > 0)
            })
        })
    }
}

impl RunStore for SqliteStore {
    fn append(&self, run: &ExecutionRun) -> BoxFuture<'_, Result<()>> {
        let run = run.clone();
        Box::pin(async move {
            let record = serde_json::to_string(&run)?;
            self.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO runs (id, flow_id, status, started_at, record)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        run.id.0,
                        run.flow_id,
                        run.status.as_str(),
                        run.started_at
                            .map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true)),
                        record,
                    ],
                )
                .map_err(|e| {
                    if is_constraint_violation(&e) {
                        AgentflowError::DuplicateRun(run.id.to_string())
                    } else {
                        db_err(e)
                    }
                })?;
                Ok(())
            })
        })
    }

    fn get(&self, run_id: &str) -> BoxFuture<'_, Result<Option<ExecutionRun>>> {
        let run_id = run_id.to_string();
        Box::pin(async move {
            let json: Option<String> = self.with_conn(|conn| {
                conn.query_row(
                    "SELECT record FROM runs WHERE id = ?1",
                    params![run_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)
            })?;
            json.map(|j| serde_json::from_str(&j).map_err(AgentflowError::from))
                .transpose()
        })
    }

    fn list_for_flow(&self, flow_id: &str) -> BoxFuture<'_, Result<Vec<ExecutionRun>>> {
        let flow_id = flow_id.to_string();
        Box::pin(async move {
            let rows = self.with_conn(|conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT record FROM runs WHERE flow_id = ?1
                         ORDER BY started_at DESC, seq DESC",
                    )
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![flow_id], |row| row.get::<_, String>(0))
                    .map_err(db_err)?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(db_err)?;
                Ok(rows)
            })?;
            decode(rows)
        })
    }
}
