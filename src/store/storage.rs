// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! SQLite-backed task storage.

use std::path::{Path, PathBuf};
use std::time::Duration;
#[cfg(feature = "telemetry")]
use std::time::Instant;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;

use crate::error::StoreError;

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use super::events::{EventRecord, TaskEvent};
use super::types::{
    generate_nonce, generate_task_id, now, Checkpoint, DecisionNonce, NewCheckpoint, NewTask,
    Task, TaskStatus, TaskUpdate,
};

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// How long a writer waits on another connection's lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const TASK_COLUMNS: &str = "id, platform, channel_id, thread_id, created_by, source, goal, \
     original_request, preferred_agent, status, step_no, max_steps, max_minutes, test_command, \
     workspace_path, decision_message_id, status_message_id, blocked_reason, error, summary, \
     resume_instruction, merge_commit_hash, merge_error, workspace_cleaned_at, created_at, \
     started_at, updated_at, ended_at";

/// Durable store for tasks, events, checkpoints and decision nonces.
///
/// Every connection to the same file sees the same tasks; claims and nonce
/// consumption are atomic across connections and processes.
pub struct TaskStorage {
    conn: Connection,
    path: Option<PathBuf>,
}

impl TaskStorage {
    /// Open or create a database at a specific path.
    pub fn open_at(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;

        let mut storage = Self {
            conn,
            path: Some(db_path.to_path_buf()),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Private in-memory database.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let mut storage = Self { conn, path: None };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Database file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn init_schema(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                platform TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                created_by TEXT NOT NULL,
                source TEXT NOT NULL,
                goal TEXT NOT NULL,
                original_request TEXT,
                preferred_agent TEXT,
                status TEXT NOT NULL,
                step_no INTEGER NOT NULL DEFAULT 0,
                max_steps INTEGER NOT NULL,
                max_minutes INTEGER NOT NULL,
                test_command TEXT NOT NULL,
                workspace_path TEXT,
                decision_message_id TEXT,
                status_message_id TEXT,
                blocked_reason TEXT,
                error TEXT,
                summary TEXT,
                resume_instruction TEXT,
                merge_commit_hash TEXT,
                merge_error TEXT,
                workspace_cleaned_at INTEGER,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                updated_at INTEGER NOT NULL,
                ended_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS task_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                kind TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (task_id, seq),
                FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS task_checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                step_no INTEGER NOT NULL,
                status TEXT NOT NULL,
                prompt_digest TEXT NOT NULL,
                agent_result TEXT NOT NULL,
                test_result TEXT NOT NULL,
                files_changed_json TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS decision_nonces (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                nonce TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                ttl_minutes INTEGER NOT NULL,
                consumed_at INTEGER,
                superseded_at INTEGER,
                action TEXT,
                actor TEXT,
                source TEXT,
                UNIQUE (task_id, nonce),
                FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_scope ON tasks(platform, channel_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_events_task ON task_events(task_id, seq);
            CREATE INDEX IF NOT EXISTS idx_checkpoints_task ON task_checkpoints(task_id, step_no);
            CREATE INDEX IF NOT EXISTS idx_nonces_task ON decision_nonces(task_id, id);
            "#,
        )?;

        let current: Option<u32> = self
            .conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .optional()?;
        match current {
            None => {
                self.conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )?;
            }
            Some(v) if v > SCHEMA_VERSION => {
                return Err(StoreError::InvalidData(format!(
                    "database schema version {} is newer than supported version {}",
                    v, SCHEMA_VERSION
                )));
            }
            Some(_) => {}
        }
        Ok(())
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Insert a new task in DRAFT or PENDING.
    pub fn create(&self, new: NewTask) -> Result<Task, StoreError> {
        if !matches!(new.status, TaskStatus::Draft | TaskStatus::Pending) {
            return Err(StoreError::InvalidData(format!(
                "new tasks start as DRAFT or PENDING, not {}",
                new.status
            )));
        }
        let id = new.id.clone().unwrap_or_else(generate_task_id);
        let ts = now();
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO tasks (id, platform, channel_id, thread_id, created_by, source, \
             goal, original_request, preferred_agent, status, step_no, max_steps, max_minutes, \
             test_command, blocked_reason, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?12, ?13, ?14, ?15, ?15)",
            params![
                id,
                new.platform,
                new.channel_id,
                new.thread_id,
                new.created_by,
                new.source,
                new.goal,
                new.original_request,
                new.preferred_agent,
                new.status,
                new.max_steps,
                new.max_minutes,
                new.test_command,
                new.blocked_reason,
                ts,
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::DuplicateId(id));
        }
        self.get(&id)?.ok_or(StoreError::NotFound(id))
    }

    pub fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
        Ok(self.conn.query_row(&sql, params![id], row_to_task).optional()?)
    }

    /// Apply a partial update. A missing id is a no-op returning `Ok(None)`.
    ///
    /// `step_no` never moves backwards and never passes `max_steps`.
    pub fn update(&self, id: &str, update: &TaskUpdate) -> Result<Option<Task>, StoreError> {
        self.apply_update(id, &[], update)
    }

    /// Apply an update only while the task is in one of `expected`.
    ///
    /// Returns `Ok(None)` when the task is missing or has moved on, e.g. a
    /// worker finishing a step after the task was stopped.
    pub fn update_if_status(
        &self,
        id: &str,
        expected: &[TaskStatus],
        update: &TaskUpdate,
    ) -> Result<Option<Task>, StoreError> {
        if expected.is_empty() {
            return Ok(None);
        }
        self.apply_update(id, expected, update)
    }

    fn apply_update(
        &self,
        id: &str,
        expected: &[TaskStatus],
        update: &TaskUpdate,
    ) -> Result<Option<Task>, StoreError> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        let mut sets: Vec<&'static str> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(status) = update.status {
            sets.push("status = ?");
            values.push(SqlValue::Text(status.as_str().to_string()));
        }
        if let Some(step) = update.step_no {
            sets.push("step_no = MIN(max_steps, MAX(step_no, ?))");
            values.push(SqlValue::Integer(i64::from(step)));
        }
        let text_columns: [(&'static str, &Option<Option<String>>); 9] = [
            ("workspace_path = ?", &update.workspace_path),
            ("decision_message_id = ?", &update.decision_message_id),
            ("status_message_id = ?", &update.status_message_id),
            ("blocked_reason = ?", &update.blocked_reason),
            ("error = ?", &update.error),
            ("summary = ?", &update.summary),
            ("resume_instruction = ?", &update.resume_instruction),
            ("merge_commit_hash = ?", &update.merge_commit_hash),
            ("merge_error = ?", &update.merge_error),
        ];
        for (set, value) in text_columns.iter().filter(|(_, v)| v.is_some()) {
            sets.push(*set);
            values.push(match value {
                Some(Some(text)) => SqlValue::Text(text.clone()),
                _ => SqlValue::Null,
            });
        }
        let time_columns: [(&'static str, &Option<Option<i64>>); 3] = [
            ("workspace_cleaned_at = ?", &update.workspace_cleaned_at),
            ("started_at = ?", &update.started_at),
            ("ended_at = ?", &update.ended_at),
        ];
        for (set, value) in time_columns.iter().filter(|(_, v)| v.is_some()) {
            sets.push(*set);
            values.push(match value {
                Some(Some(ts)) => SqlValue::Integer(*ts),
                _ => SqlValue::Null,
            });
        }

        sets.push("updated_at = ?");
        values.push(SqlValue::Integer(now()));
        values.push(SqlValue::Text(id.to_string()));

        let mut sql = format!("UPDATE tasks SET {} WHERE id = ?", sets.join(", "));
        if !expected.is_empty() {
            sql.push_str(&format!(
                " AND status IN ({})",
                vec!["?"; expected.len()].join(", ")
            ));
            values.extend(
                expected
                    .iter()
                    .map(|s| SqlValue::Text(s.as_str().to_string())),
            );
        }
        let changed = self.conn.execute(&sql, params_from_iter(values))?;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("store.update", start.elapsed());

        if changed == 0 {
            debug!(task_id = id, "update matched no task");
            return Ok(None);
        }
        self.get(id)
    }

    /// Tasks in one channel, most recent first.
    pub fn list(
        &self,
        platform: &str,
        channel_id: &str,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE platform = ?1 AND channel_id = ?2 \
             AND (?3 IS NULL OR status = ?3) \
             ORDER BY created_at DESC, rowid DESC LIMIT ?4",
            TASK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![platform, channel_id, status, limit as i64],
            row_to_task,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Tasks across all channels, most recent first.
    pub fn list_recent(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE (?1 IS NULL OR status = ?1) \
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            TASK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![status, limit as i64], row_to_task)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Atomically move the oldest PENDING task to RUNNING and return it.
    ///
    /// The select and update run in one IMMEDIATE transaction, so two
    /// connections can never claim the same row.
    pub fn claim_pending(&mut self) -> Result<Option<Task>, StoreError> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id: Option<String> = tx
            .query_row(
                "SELECT id FROM tasks WHERE status = ?1 ORDER BY created_at ASC, rowid ASC LIMIT 1",
                params![TaskStatus::Pending],
                |row| row.get(0),
            )
            .optional()?;
        let Some(id) = id else {
            tx.commit()?;
            return Ok(None);
        };
        let ts = now();
        tx.execute(
            "UPDATE tasks SET status = ?1, started_at = COALESCE(started_at, ?2), updated_at = ?2 \
             WHERE id = ?3 AND status = ?4",
            params![TaskStatus::Running, ts, id, TaskStatus::Pending],
        )?;
        tx.commit()?;

        #[cfg(feature = "telemetry")]
        {
            GLOBAL_METRICS.record_operation("store.claim_pending", start.elapsed());
            GLOBAL_METRICS.record_claim();
        }

        self.get(&id)
    }

    /// Return RUNNING/VALIDATING tasks to PENDING after a restart.
    pub fn requeue_inflight(&self) -> Result<usize, StoreError> {
        let changed = self.conn.execute(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE status IN (?3, ?4)",
            params![
                TaskStatus::Pending,
                now(),
                TaskStatus::Running,
                TaskStatus::Validating
            ],
        )?;
        Ok(changed)
    }

    /// Return one in-flight task to PENDING. False if it was not in flight.
    pub fn requeue_task(&self, id: &str) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status IN (?4, ?5)",
            params![
                TaskStatus::Pending,
                now(),
                id,
                TaskStatus::Running,
                TaskStatus::Validating
            ],
        )?;
        Ok(changed > 0)
    }

    /// Terminal-ish tasks whose sandbox is older than the retention window.
    pub fn list_cleanup_candidates(
        &self,
        statuses: &[TaskStatus],
        older_than_hours: u64,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let hours = i64::try_from(older_than_hours).unwrap_or(i64::MAX / 3600);
        let cutoff = now().saturating_sub(hours.saturating_mul(3600));

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM tasks WHERE status IN ({}) \
             AND workspace_path IS NOT NULL AND workspace_cleaned_at IS NULL \
             AND COALESCE(ended_at, updated_at) <= ? \
             ORDER BY COALESCE(ended_at, updated_at) ASC LIMIT ?",
            TASK_COLUMNS, placeholders
        );
        let mut values: Vec<SqlValue> = statuses
            .iter()
            .map(|s| SqlValue::Text(s.as_str().to_string()))
            .collect();
        values.push(SqlValue::Integer(cutoff));
        values.push(SqlValue::Integer(limit as i64));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), row_to_task)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Delete a task and, through cascades, its events, checkpoints and nonces.
    pub fn delete_task(&self, id: &str) -> Result<bool, StoreError> {
        let changed = self.conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    // ========================================================================
    // Checkpoints
    // ========================================================================

    pub fn add_checkpoint(&self, checkpoint: &NewCheckpoint) -> Result<i64, StoreError> {
        let files = serde_json::to_string(&checkpoint.files_changed)?;
        self.conn.execute(
            "INSERT INTO task_checkpoints (task_id, step_no, status, prompt_digest, agent_result, \
             test_result, files_changed_json, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                checkpoint.task_id,
                checkpoint.step_no,
                checkpoint.status,
                checkpoint.prompt_digest,
                checkpoint.agent_result,
                checkpoint.test_result,
                files,
                now(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn last_checkpoint(&self, task_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, task_id, step_no, status, prompt_digest, agent_result, test_result, \
                 files_changed_json, created_at FROM task_checkpoints WHERE task_id = ?1 \
                 ORDER BY id DESC LIMIT 1",
                params![task_id],
                |row| {
                    Ok((
                        Checkpoint {
                            id: row.get(0)?,
                            task_id: row.get(1)?,
                            step_no: row.get(2)?,
                            status: row.get(3)?,
                            prompt_digest: row.get(4)?,
                            agent_result: row.get(5)?,
                            test_result: row.get(6)?,
                            files_changed: Vec::new(),
                            created_at: row.get(8)?,
                        },
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((mut checkpoint, files_json)) => {
                checkpoint.files_changed = serde_json::from_str(&files_json)?;
                Ok(Some(checkpoint))
            }
            None => Ok(None),
        }
    }

    // ========================================================================
    // Decision nonces
    // ========================================================================

    /// Issue a fresh nonce and retire every earlier unconsumed one.
    pub fn create_nonce(&mut self, task_id: &str, ttl_minutes: u32) -> Result<String, StoreError> {
        let nonce = generate_nonce();
        let ts = now();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE decision_nonces SET superseded_at = ?1 \
             WHERE task_id = ?2 AND consumed_at IS NULL AND superseded_at IS NULL",
            params![ts, task_id],
        )?;
        tx.execute(
            "INSERT INTO decision_nonces (task_id, nonce, created_at, ttl_minutes) \
             VALUES (?1, ?2, ?3, ?4)",
            params![task_id, nonce, ts, ttl_minutes],
        )?;
        tx.commit()?;
        Ok(nonce)
    }

    /// The nonce currently driving this task's decision surface.
    pub fn active_nonce(&self, task_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT nonce FROM decision_nonces WHERE task_id = ?1 \
                 AND consumed_at IS NULL AND superseded_at IS NULL \
                 AND created_at + ttl_minutes * 60 > ?2 ORDER BY id DESC LIMIT 1",
                params![task_id, now()],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Consume a nonce. True exactly once per nonce; false when it is
    /// missing, expired, superseded or already used.
    pub fn consume_nonce(
        &self,
        task_id: &str,
        nonce: &str,
        actor: &str,
        action: &str,
        source: &str,
    ) -> Result<bool, StoreError> {
        let ts = now();
        let changed = self.conn.execute(
            "UPDATE decision_nonces SET consumed_at = ?1, actor = ?2, action = ?3, source = ?4 \
             WHERE task_id = ?5 AND nonce = ?6 AND consumed_at IS NULL \
             AND superseded_at IS NULL AND created_at + ttl_minutes * 60 > ?1",
            params![ts, actor, action, source, task_id, nonce],
        )?;
        Ok(changed > 0)
    }

    pub fn get_nonce(&self, task_id: &str, nonce: &str) -> Result<Option<DecisionNonce>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT task_id, nonce, created_at, ttl_minutes, consumed_at, superseded_at, \
                 action, actor, source FROM decision_nonces WHERE task_id = ?1 AND nonce = ?2",
                params![task_id, nonce],
                |row| {
                    Ok(DecisionNonce {
                        task_id: row.get(0)?,
                        nonce: row.get(1)?,
                        created_at: row.get(2)?,
                        ttl_minutes: row.get(3)?,
                        consumed_at: row.get(4)?,
                        superseded_at: row.get(5)?,
                        action: row.get(6)?,
                        actor: row.get(7)?,
                        source: row.get(8)?,
                    })
                },
            )
            .optional()?)
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Append an event. Sequence numbers are per task and gap-free.
    pub fn add_event(&mut self, task_id: &str, event: &TaskEvent) -> Result<i64, StoreError> {
        let (kind, payload) = event.to_parts()?;
        let payload_json = serde_json::to_string(&payload)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM task_events WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO task_events (task_id, seq, kind, payload_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![task_id, seq, kind, payload_json, now()],
        )?;
        tx.commit()?;
        Ok(seq)
    }

    /// The most recent `limit` events, oldest first.
    pub fn list_events(&self, task_id: &str, limit: usize) -> Result<Vec<EventRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, kind, payload_json, created_at FROM task_events \
             WHERE task_id = ?1 ORDER BY seq DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![task_id, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (seq, kind, payload_json, created_at) = row?;
            let payload = serde_json::from_str(&payload_json)
                .unwrap_or_else(|_| serde_json::json!({ "raw": payload_json }));
            events.push(EventRecord {
                seq,
                kind,
                payload,
                created_at,
            });
        }
        events.reverse();
        Ok(events)
    }
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get("id")?,
        platform: row.get("platform")?,
        channel_id: row.get("channel_id")?,
        thread_id: row.get("thread_id")?,
        created_by: row.get("created_by")?,
        source: row.get("source")?,
        goal: row.get("goal")?,
        original_request: row.get("original_request")?,
        preferred_agent: row.get("preferred_agent")?,
        status: row.get("status")?,
        step_no: row.get("step_no")?,
        max_steps: row.get("max_steps")?,
        max_minutes: row.get("max_minutes")?,
        test_command: row.get("test_command")?,
        workspace_path: row.get("workspace_path")?,
        decision_message_id: row.get("decision_message_id")?,
        status_message_id: row.get("status_message_id")?,
        blocked_reason: row.get("blocked_reason")?,
        error: row.get("error")?,
        summary: row.get("summary")?,
        resume_instruction: row.get("resume_instruction")?,
        merge_commit_hash: row.get("merge_commit_hash")?,
        merge_error: row.get("merge_error")?,
        workspace_cleaned_at: row.get("workspace_cleaned_at")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        updated_at: row.get("updated_at")?,
        ended_at: row.get("ended_at")?,
    })
}
