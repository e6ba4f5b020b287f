//! SQLite-backed store
//!
//! Every task, plan and step is one JSON row keyed by `(entity, id)`.
//! Messages live in their own append-only table so insertion order is kept.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};

use super::{Store, StoreStats};
use crate::error::{EngineError, EngineResult};
use crate::models::{Plan, Step, StoredMessage, Task};

const TASK: &str = "task";
const PLAN: &str = "plan";
const STEP: &str = "step";

/// Store with SQLite backend
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the state database
    pub fn open(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Storage(format!("{}: {}", parent.display(), e)))?;
        }

        let conn = Connection::open(path)?;
        let store = Self::with_connection(conn)?;

        info!("State store opened: {}", path.display());
        Ok(store)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> EngineResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> EngineResult<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> EngineResult<()> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                entity TEXT NOT NULL,
                id TEXT NOT NULL,
                parent_id TEXT,
                session_id TEXT NOT NULL,
                sort_key INTEGER NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (entity, id)
            );

            CREATE INDEX IF NOT EXISTS idx_records_parent
                ON records(entity, parent_id, sort_key);
            CREATE INDEX IF NOT EXISTS idx_records_session
                ON records(entity, session_id, sort_key);

            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                plan_id TEXT,
                step_id TEXT,
                data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_plan ON messages(plan_id);
            CREATE INDEX IF NOT EXISTS idx_messages_step ON messages(step_id);
            "#,
        )?;
        Ok(())
    }

    fn upsert<T: Serialize>(
        &self,
        entity: &str,
        id: &str,
        parent_id: Option<&str>,
        session_id: &str,
        sort_key: i64,
        value: &T,
    ) -> EngineResult<()> {
        let data = serde_json::to_string(value)?;
        self.conn.lock().execute(
            "INSERT INTO records (entity, id, parent_id, session_id, sort_key, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(entity, id) DO UPDATE SET
                parent_id = excluded.parent_id,
                session_id = excluded.session_id,
                sort_key = excluded.sort_key,
                data = excluded.data",
            params![entity, id, parent_id, session_id, sort_key, data],
        )?;
        debug!("Stored {} {}", entity, id);
        Ok(())
    }

    fn fetch<T: DeserializeOwned>(&self, entity: &'static str, id: &str) -> EngineResult<T> {
        let data: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT data FROM records WHERE entity = ?1 AND id = ?2",
                params![entity, id],
                |row| row.get(0),
            )
            .optional()?;

        match data {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(EngineError::not_found(entity, id)),
        }
    }

    fn exists(&self, entity: &str, id: &str) -> EngineResult<bool> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM records WHERE entity = ?1 AND id = ?2",
            params![entity, id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn query_rows<T: DeserializeOwned>(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> EngineResult<Vec<T>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(args, |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<String>, _>>()?;

        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(EngineError::from))
            .collect()
    }

    fn count(&self, sql: &str) -> EngineResult<usize> {
        let n: i64 = self.conn.lock().query_row(sql, [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn put_task(&self, task: &Task) -> EngineResult<()> {
        self.upsert(TASK, &task.id, None, &task.session_id, task.created_at, task)
    }

    async fn get_task(&self, id: &str) -> EngineResult<Task> {
        self.fetch(TASK, id)
    }

    async fn put_plan(&self, plan: &Plan) -> EngineResult<()> {
        self.upsert(
            PLAN,
            &plan.id,
            Some(&plan.task_id),
            &plan.session_id,
            plan.created_at,
            plan,
        )
    }

    async fn get_plan(&self, id: &str) -> EngineResult<Plan> {
        self.fetch(PLAN, id)
    }

    async fn list_plans_for_session(&self, session_id: &str) -> EngineResult<Vec<Plan>> {
        self.query_rows(
            "SELECT data FROM records WHERE entity = ?1 AND session_id = ?2
             ORDER BY sort_key ASC, rowid ASC",
            &[&PLAN, &session_id],
        )
    }

    async fn put_step(&self, step: &Step) -> EngineResult<()> {
        if !self.exists(PLAN, &step.plan_id)? {
            return Err(EngineError::not_found("plan", &step.plan_id));
        }
        self.upsert(
            STEP,
            &step.id,
            Some(&step.plan_id),
            &step.session_id,
            step.sequence_index as i64,
            step,
        )
    }

    async fn get_step(&self, id: &str) -> EngineResult<Step> {
        self.fetch(STEP, id)
    }

    async fn list_steps_for_plan(&self, plan_id: &str) -> EngineResult<Vec<Step>> {
        self.query_rows(
            "SELECT data FROM records WHERE entity = ?1 AND parent_id = ?2
             ORDER BY sort_key ASC",
            &[&STEP, &plan_id],
        )
    }

    async fn append_message(&self, message: &StoredMessage) -> EngineResult<()> {
        let data = serde_json::to_string(message)?;
        self.conn.lock().execute(
            "INSERT INTO messages (id, plan_id, step_id, data) VALUES (?1, ?2, ?3, ?4)",
            params![message.id, message.plan_id, message.step_id, data],
        )?;
        Ok(())
    }

    async fn list_messages_for_plan(&self, plan_id: &str) -> EngineResult<Vec<StoredMessage>> {
        self.query_rows(
            "SELECT data FROM messages WHERE plan_id = ?1 ORDER BY seq ASC",
            &[&plan_id],
        )
    }

    async fn list_messages_for_step(&self, step_id: &str) -> EngineResult<Vec<StoredMessage>> {
        self.query_rows(
            "SELECT data FROM messages WHERE step_id = ?1 ORDER BY seq ASC",
            &[&step_id],
        )
    }

    async fn stats(&self) -> EngineResult<StoreStats> {
        Ok(StoreStats {
            tasks: self.count("SELECT COUNT(*) FROM records WHERE entity = 'task'")?,
            plans: self.count("SELECT COUNT(*) FROM records WHERE entity = 'plan'")?,
            steps: self.count("SELECT COUNT(*) FROM records WHERE entity = 'step'")?,
            messages: self.count("SELECT COUNT(*) FROM messages")?,
        })
    }
}
